pub mod central_manager;
mod connection;
pub mod dispatcher;
pub mod peripheral;
mod peripheral_actor;
mod subscriptions;
