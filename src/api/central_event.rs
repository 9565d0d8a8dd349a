use uuid::Uuid;

use crate::Error;
use crate::api::central::{AdapterState, PeripheralId};
use crate::api::characteristic::CharacteristicHandle;
use crate::api::service::Service;

/// Events a transport pushes to the central, out of band of any call.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    AdapterStateChanged {
        state: AdapterState,
    },
    DeviceDiscovered {
        peripheral: PeripheralId,
        local_name: Option<String>,
        rssi: Option<i16>,
        services: Vec<Uuid>,
    },
    ConnectionStateChanged {
        peripheral: PeripheralId,
        connected: bool,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Vec<Service>,
    },
    CharacteristicValueChanged {
        peripheral: PeripheralId,
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    },
    TransportError {
        peripheral: PeripheralId,
        error: Error,
    },
}

impl TransportEvent {
    /// The peripheral this event is about, if it is peripheral-scoped.
    pub fn peripheral(&self) -> Option<&PeripheralId> {
        match self {
            TransportEvent::AdapterStateChanged { .. } => None,
            TransportEvent::DeviceDiscovered { peripheral, .. }
            | TransportEvent::ConnectionStateChanged { peripheral, .. }
            | TransportEvent::ServicesDiscovered { peripheral, .. }
            | TransportEvent::CharacteristicValueChanged { peripheral, .. }
            | TransportEvent::TransportError { peripheral, .. } => Some(peripheral),
        }
    }
}
