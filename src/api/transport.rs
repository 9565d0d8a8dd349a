use async_trait::async_trait;

use crate::Result;
use crate::api::central::{PeripheralId, ScanFilter};
use crate::api::characteristic::{Characteristic, CharacteristicWriteType};
use crate::api::service::Service;

/// The radio stack a [`CentralManager`](crate::CentralManager) drives.
///
/// Implementations report the outcome of each call through its return value and
/// push everything else (link loss, notifications, scan results) as
/// [`TransportEvent`](crate::api::central_event::TransportEvent)s on the channel
/// handed to the central manager. GATT operations against one peripheral are
/// never issued concurrently. `disconnect` may still overlap one that is being
/// aborted.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn discover_services(&self, peripheral: &PeripheralId) -> Result<Vec<Service>>;

    async fn read_characteristic(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
    ) -> Result<Vec<u8>>;

    async fn write_characteristic(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: CharacteristicWriteType,
    ) -> Result<()>;

    async fn set_notify_state(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
        enabled: bool,
    ) -> Result<()>;

    async fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;
}
