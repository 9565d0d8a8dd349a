use std::collections::BTreeMap;

use log::trace;
use tokio::sync::mpsc;

use crate::api::characteristic::{Characteristic, CharacteristicHandle};

pub type SubscriptionToken = u64;

pub(crate) type Sink = mpsc::UnboundedSender<Vec<u8>>;

struct Entry {
    characteristic: Characteristic,
    sinks: Vec<(SubscriptionToken, Sink)>,
}

/// Which characteristics callers want notifications from. Lives as long as the
/// peripheral does, independent of the link.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: BTreeMap<CharacteristicHandle, Entry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this is the first sink for the characteristic, i.e. the
    /// transport has to be told to start notifying.
    pub fn subscribe(
        &mut self,
        token: SubscriptionToken,
        characteristic: Characteristic,
        sink: Sink,
    ) -> bool {
        let entry = self
            .entries
            .entry(characteristic.handle)
            .or_insert_with(|| Entry {
                characteristic,
                sinks: Vec::new(),
            });
        entry.sinks.push((token, sink));
        entry.sinks.len() == 1
    }

    /// Returns the characteristic if `token` was its last sink.
    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> Option<Characteristic> {
        let handle = self
            .entries
            .iter()
            .find(|(_, entry)| entry.sinks.iter().any(|(t, _)| *t == token))
            .map(|(handle, _)| *handle)?;
        let entry = self.entries.get_mut(&handle)?;
        entry.sinks.retain(|(t, _)| *t != token);
        if entry.sinks.is_empty() {
            return self.entries.remove(&handle).map(|entry| entry.characteristic);
        }
        None
    }

    /// Fans a value out to every sink of `handle` in subscription order.
    pub fn notify(&self, handle: CharacteristicHandle, value: &[u8]) -> usize {
        let Some(entry) = self.entries.get(&handle) else {
            trace!("notification on {} with no subscribers", handle);
            return 0;
        };
        entry
            .sinks
            .iter()
            .filter(|(_, sink)| sink.send(value.to_vec()).is_ok())
            .count()
    }

    /// Characteristics that need notifications re-armed on the next Ready.
    pub fn active(&self) -> Vec<Characteristic> {
        self.entries
            .values()
            .map(|entry| entry.characteristic.clone())
            .collect()
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, handle: CharacteristicHandle) -> usize {
        self.entries.get(&handle).map_or(0, |entry| entry.sinks.len())
    }

    /// Drops every sink, which ends the callers' streams.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
