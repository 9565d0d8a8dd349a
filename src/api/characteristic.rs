use std::fmt;

use uuid::Uuid;

/// Transport-assigned handle of a characteristic on one peripheral.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CharacteristicHandle(pub u16);

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

#[derive(Debug, Ord, Eq, PartialEq, PartialOrd, Clone)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub handle: CharacteristicHandle,
    pub properties: Vec<CharacteristicProperty>,
}

impl Characteristic {
    pub fn new(
        uuid: Uuid,
        service_uuid: Uuid,
        handle: CharacteristicHandle,
        properties: Vec<CharacteristicProperty>,
    ) -> Self {
        Characteristic {
            uuid,
            service_uuid,
            handle,
            properties,
        }
    }

    pub fn has_property(&self, property: CharacteristicProperty) -> bool {
        self.properties.contains(&property)
    }
}

#[derive(Debug, Clone, Copy, PartialOrd, Ord, Eq, PartialEq, Hash)]
pub enum CharacteristicProperty {
    Read,
    WriteWithoutResponse,
    Write,
    Notify,
    Indicate,
}

#[derive(Debug, Clone, Copy, PartialOrd, Ord, Eq, PartialEq, Hash)]
pub enum CharacteristicWriteType {
    WriteWithoutResponse,
    WriteWithResponse,
}

impl CharacteristicWriteType {
    pub fn from_with_response(with_response: bool) -> Self {
        if with_response {
            CharacteristicWriteType::WriteWithResponse
        } else {
            CharacteristicWriteType::WriteWithoutResponse
        }
    }
}
