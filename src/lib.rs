pub mod api;
pub mod config;
mod error;
pub mod gatt;

pub use config::{CentralConfig, WriteWithoutResponsePolicy};
pub use error::{Error, Result};
pub use gatt::central_manager::CentralManager;
pub use gatt::peripheral::{Canceller, NotificationStream, OperationHandle, Peripheral};
