#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gattlink::api::central::{ConnectionState, PeripheralId, ScanFilter};
use gattlink::api::central_event::TransportEvent;
use gattlink::api::characteristic::{
    Characteristic, CharacteristicHandle, CharacteristicProperty, CharacteristicWriteType,
};
use gattlink::api::service::Service;
use gattlink::api::transport::Transport;
use gattlink::{CentralConfig, CentralManager, Error, Peripheral, Result};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const PERIPHERAL: &str = "5f3c8e2a-test-peripheral";

pub const SERVICE: Uuid = Uuid::from_u128(0x8c7a0001_7f3e_4b6d_9b2a_5a1e3c5d7f01);
pub const READ: Uuid = Uuid::from_u128(0x8c7a0002_7f3e_4b6d_9b2a_5a1e3c5d7f01);
pub const WRITE: Uuid = Uuid::from_u128(0x8c7a0003_7f3e_4b6d_9b2a_5a1e3c5d7f01);
pub const NOTIFY: Uuid = Uuid::from_u128(0x8c7a0004_7f3e_4b6d_9b2a_5a1e3c5d7f01);
/// Reads and writes against this one never complete.
pub const STUCK: Uuid = Uuid::from_u128(0x8c7a0005_7f3e_4b6d_9b2a_5a1e3c5d7f01);
/// Every write against this one is rejected.
pub const REJECT: Uuid = Uuid::from_u128(0x8c7a0006_7f3e_4b6d_9b2a_5a1e3c5d7f01);

pub const SECONDARY_SERVICE: Uuid = Uuid::from_u128(0x8c7b0001_7f3e_4b6d_9b2a_5a1e3c5d7f01);
pub const SECONDARY: Uuid = Uuid::from_u128(0x8c7b0002_7f3e_4b6d_9b2a_5a1e3c5d7f01);

pub const READ_VALUE: [u8; 2] = [0x11, 0x22];

pub fn handle_of(uuid: Uuid) -> CharacteristicHandle {
    let handles = [
        (READ, 0x0003),
        (WRITE, 0x0005),
        (NOTIFY, 0x0007),
        (STUCK, 0x0009),
        (REJECT, 0x000b),
        (SECONDARY, 0x0010),
    ];
    let handle = handles
        .iter()
        .find(|(known, _)| *known == uuid)
        .map_or(0xffff, |(_, handle)| *handle);
    CharacteristicHandle(handle)
}

pub fn services() -> Vec<Service> {
    use CharacteristicProperty::*;
    let primary = [
        (READ, vec![Read]),
        (WRITE, vec![Write, WriteWithoutResponse]),
        (NOTIFY, vec![Notify]),
        (STUCK, vec![Read, Write, WriteWithoutResponse]),
        (REJECT, vec![Write]),
    ]
    .into_iter()
    .map(|(uuid, properties)| Characteristic::new(uuid, SERVICE, handle_of(uuid), properties))
    .collect();
    let secondary = vec![Characteristic::new(
        SECONDARY,
        SECONDARY_SERVICE,
        handle_of(SECONDARY),
        vec![Read],
    )];
    vec![
        Service::new(SERVICE, primary),
        Service::new(SECONDARY_SERVICE, secondary),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    Disconnect,
    Discover,
    Read(CharacteristicHandle),
    Write(CharacteristicHandle, Vec<u8>, CharacteristicWriteType),
    Notify(CharacteristicHandle, bool),
    StartScan,
    StopScan,
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    notifying: HashSet<CharacteristicHandle>,
    failing_connects: usize,
    failing_discoveries: usize,
    failing_notifies: usize,
}

/// In-memory peripheral modelled on a test rig: writing to WRITE pushes the
/// written bytes out as a notification on NOTIFY while notifications are on.
pub struct MockTransport {
    events: mpsc::Sender<TransportEvent>,
    state: Mutex<MockState>,
    latency: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

struct ActiveGuard<'a>(&'a MockTransport);

impl<'a> ActiveGuard<'a> {
    fn enter(transport: &'a MockTransport) -> Self {
        let now = transport.active.fetch_add(1, Ordering::SeqCst) + 1;
        transport.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(transport)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            events,
            state: Mutex::new(MockState::default()),
            latency: Duration::from_millis(5),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    /// Most gatt calls observed running at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn is_notifying(&self, uuid: Uuid) -> bool {
        self.state.lock().unwrap().notifying.contains(&handle_of(uuid))
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().unwrap().failing_connects = count;
    }

    pub fn fail_next_discoveries(&self, count: usize) {
        self.state.lock().unwrap().failing_discoveries = count;
    }

    pub fn fail_next_notifies(&self, count: usize) {
        self.state.lock().unwrap().failing_notifies = count;
    }

    /// Simulates the peripheral walking out of range.
    pub async fn drop_link(&self, peripheral: &str) {
        self.state.lock().unwrap().notifying.clear();
        self.emit(TransportEvent::ConnectionStateChanged {
            peripheral: PeripheralId::from(peripheral),
            connected: false,
        })
        .await;
    }

    pub async fn emit(&self, event: TransportEvent) {
        self.events.send(event).await.unwrap();
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _peripheral: &PeripheralId) -> Result<()> {
        self.record(Call::Connect);
        tokio::time::sleep(self.latency).await;
        let mut state = self.state.lock().unwrap();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(Error::TransportRejected("peer refused connection".into()));
        }
        Ok(())
    }

    async fn disconnect(&self, _peripheral: &PeripheralId) -> Result<()> {
        self.record(Call::Disconnect);
        self.state.lock().unwrap().notifying.clear();
        Ok(())
    }

    async fn discover_services(&self, _peripheral: &PeripheralId) -> Result<Vec<Service>> {
        self.record(Call::Discover);
        tokio::time::sleep(self.latency).await;
        let mut state = self.state.lock().unwrap();
        if state.failing_discoveries > 0 {
            state.failing_discoveries -= 1;
            return Err(Error::TransportRejected("gatt error 133".into()));
        }
        Ok(services())
    }

    async fn read_characteristic(
        &self,
        _peripheral: &PeripheralId,
        characteristic: &Characteristic,
    ) -> Result<Vec<u8>> {
        let _active = ActiveGuard::enter(self);
        self.record(Call::Read(characteristic.handle));
        if characteristic.uuid == STUCK {
            futures::future::pending::<()>().await;
        }
        tokio::time::sleep(self.latency).await;
        Ok(READ_VALUE.to_vec())
    }

    async fn write_characteristic(
        &self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: CharacteristicWriteType,
    ) -> Result<()> {
        let _active = ActiveGuard::enter(self);
        self.record(Call::Write(characteristic.handle, data.to_vec(), write_type));
        if characteristic.uuid == STUCK {
            futures::future::pending::<()>().await;
        }
        tokio::time::sleep(self.latency).await;
        if characteristic.uuid == REJECT {
            return Err(Error::TransportRejected("write not permitted".into()));
        }
        if characteristic.uuid == WRITE && self.is_notifying(NOTIFY) {
            self.emit(TransportEvent::CharacteristicValueChanged {
                peripheral: peripheral.clone(),
                characteristic: handle_of(NOTIFY),
                value: data.to_vec(),
            })
            .await;
        }
        Ok(())
    }

    async fn set_notify_state(
        &self,
        _peripheral: &PeripheralId,
        characteristic: &Characteristic,
        enabled: bool,
    ) -> Result<()> {
        let _active = ActiveGuard::enter(self);
        self.record(Call::Notify(characteristic.handle, enabled));
        tokio::time::sleep(self.latency).await;
        let mut state = self.state.lock().unwrap();
        if state.failing_notifies > 0 {
            state.failing_notifies -= 1;
            return Err(Error::TransportRejected("busy".into()));
        }
        if enabled {
            state.notifying.insert(characteristic.handle);
        } else {
            state.notifying.remove(&characteristic.handle);
        }
        Ok(())
    }

    async fn start_scan(&self, _filter: &ScanFilter) -> Result<()> {
        self.record(Call::StartScan);
        self.emit(TransportEvent::DeviceDiscovered {
            peripheral: PeripheralId::from(PERIPHERAL),
            local_name: Some("gatt test rig".into()),
            rssi: Some(-52),
            services: vec![SERVICE],
        })
        .await;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(Call::StopScan);
        Ok(())
    }
}

pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

pub fn central(config: CentralConfig) -> (CentralManager, Arc<MockTransport>) {
    init_logging();
    let (events_tx, events_rx) = mpsc::channel(256);
    let transport = Arc::new(MockTransport::new(events_tx));
    let central = CentralManager::new(transport.clone(), events_rx, config);
    (central, transport)
}

/// A central with the test peripheral already Ready.
pub async fn connected(config: CentralConfig) -> (CentralManager, Arc<MockTransport>, Peripheral) {
    let (central, transport) = central(config);
    let peripheral = central.peripheral(PERIPHERAL);
    peripheral.connect().await.unwrap();
    assert_eq!(peripheral.state(), ConnectionState::Ready);
    (central, transport, peripheral)
}

pub async fn wait_for_state(peripheral: &Peripheral, state: ConnectionState) {
    let mut changes = peripheral.state_changes();
    tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|s| *s == state))
        .await
        .expect("state not reached in time")
        .unwrap();
}
