use crate::api::characteristic::{Characteristic, CharacteristicWriteType};

/// What produced a [`CharacteristicResult`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CharacteristicEvent {
    Read,
    Write,
    WriteWithoutResponse,
    Notification,
}

impl From<CharacteristicWriteType> for CharacteristicEvent {
    fn from(write_type: CharacteristicWriteType) -> Self {
        match write_type {
            CharacteristicWriteType::WriteWithResponse => CharacteristicEvent::Write,
            CharacteristicWriteType::WriteWithoutResponse => CharacteristicEvent::WriteWithoutResponse,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CharacteristicResult {
    pub characteristic: Characteristic,
    pub event: CharacteristicEvent,
    /// Value read or notified; `None` for writes.
    pub data: Option<Vec<u8>>,
}

impl CharacteristicResult {
    pub fn new(characteristic: Characteristic, event: CharacteristicEvent, data: Option<Vec<u8>>) -> Self {
        CharacteristicResult {
            characteristic,
            event,
            data,
        }
    }
}
