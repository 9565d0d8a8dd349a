pub mod central;
pub mod central_event;
pub mod characteristic;
pub mod peripheral_event;
pub mod service;
pub mod transport;
