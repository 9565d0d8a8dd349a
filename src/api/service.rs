use uuid::Uuid;

use crate::api::characteristic::{Characteristic, CharacteristicHandle};

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct Service {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(uuid: Uuid, characteristics: Vec<Characteristic>) -> Self {
        Service {
            uuid,
            primary: true,
            characteristics,
        }
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Looks a characteristic up by service and characteristic UUID.
pub fn find_characteristic<'a>(
    services: &'a [Service],
    service_uuid: &Uuid,
    characteristic_uuid: &Uuid,
) -> Option<&'a Characteristic> {
    services
        .iter()
        .find(|s| s.uuid == *service_uuid)
        .and_then(|s| s.characteristic(characteristic_uuid))
}

pub fn find_by_handle(services: &[Service], handle: CharacteristicHandle) -> Option<&Characteristic> {
    services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.handle == handle)
}
