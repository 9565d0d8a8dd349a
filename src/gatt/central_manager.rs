use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, trace};
use tokio::sync::mpsc::Receiver;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::Result;
use crate::api::central::{AdapterState, PeripheralId, ScanFilter, ScanResult};
use crate::api::central_event::TransportEvent;
use crate::api::transport::Transport;
use crate::config::CentralConfig;
use crate::gatt::peripheral::Peripheral;

const SCAN_RESULT_CAPACITY: usize = 256;

/// Peripherals known to a central, keyed by identity.
#[derive(Clone)]
struct Registry {
    transport: Arc<dyn Transport>,
    config: Arc<CentralConfig>,
    peripherals: Arc<DashMap<PeripheralId, Peripheral>>,
}

impl Registry {
    fn get_or_create(&self, id: &PeripheralId) -> Peripheral {
        if let Some(peripheral) = self.peripherals.get(id) {
            return peripheral.value().clone();
        }
        self.peripherals
            .entry(id.clone())
            .or_insert_with(|| {
                debug!("tracking peripheral {}", id);
                Peripheral::spawn(id.clone(), self.transport.clone(), self.config.clone())
            })
            .value()
            .clone()
    }
}

/// Owns every [`Peripheral`] and routes transport events to them.
///
/// Must be created inside a tokio runtime: each peripheral, as well as the event
/// router, runs as its own task.
pub struct CentralManager {
    transport: Arc<dyn Transport>,
    registry: Registry,
    scan_tx: broadcast::Sender<ScanResult>,
    adapter_state: watch::Receiver<AdapterState>,
    router: JoinHandle<()>,
}

impl CentralManager {
    pub fn new<T: Transport + 'static>(
        transport: Arc<T>,
        events: Receiver<TransportEvent>,
        config: CentralConfig,
    ) -> Self {
        let transport: Arc<dyn Transport> = transport;
        let registry = Registry {
            transport: transport.clone(),
            config: Arc::new(config),
            peripherals: Arc::new(DashMap::new()),
        };
        let (scan_tx, _) = broadcast::channel(SCAN_RESULT_CAPACITY);
        let (adapter_tx, adapter_state) = watch::channel(AdapterState::Unknown);
        let router = tokio::spawn(route_events(
            events,
            registry.clone(),
            scan_tx.clone(),
            adapter_tx,
        ));
        Self {
            transport,
            registry,
            scan_tx,
            adapter_state,
            router,
        }
    }

    /// Handle for `id`, created on first reference.
    pub fn peripheral(&self, id: impl Into<PeripheralId>) -> Peripheral {
        self.registry.get_or_create(&id.into())
    }

    pub fn peripherals(&self) -> Vec<Peripheral> {
        self.registry
            .peripherals
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Forgets `id`: its link is dropped, pending operations fail with
    /// `LinkLost` and notification streams end. Returns false if it was unknown.
    pub fn release(&self, id: &PeripheralId) -> bool {
        match self.registry.peripherals.remove(id) {
            Some((_, peripheral)) => {
                info!("releasing peripheral {}", id);
                peripheral.release();
                true
            }
            None => false,
        }
    }

    pub async fn start_scan(&self, filter: ScanFilter) -> Result<()> {
        debug!("starting scan for {:?}", filter.services);
        self.transport.start_scan(&filter).await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.transport.stop_scan().await
    }

    pub fn scan_results(&self) -> broadcast::Receiver<ScanResult> {
        self.scan_tx.subscribe()
    }

    pub fn adapter_state(&self) -> AdapterState {
        *self.adapter_state.borrow()
    }
}

impl Drop for CentralManager {
    fn drop(&mut self) {
        self.router.abort();
    }
}

async fn route_events(
    mut events: Receiver<TransportEvent>,
    registry: Registry,
    scan_tx: broadcast::Sender<ScanResult>,
    adapter_tx: watch::Sender<AdapterState>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::AdapterStateChanged { state } => {
                info!("adapter state {:?}", state);
                adapter_tx.send_replace(state);
            }
            TransportEvent::DeviceDiscovered {
                peripheral,
                local_name,
                rssi,
                services,
            } => {
                trace!("discovered {} {:?}", peripheral, local_name);
                registry.get_or_create(&peripheral);
                let _ = scan_tx.send(ScanResult {
                    peripheral,
                    local_name,
                    rssi,
                    services,
                });
            }
            event => {
                if let Some(id) = event.peripheral().cloned() {
                    registry.get_or_create(&id).route(event);
                }
            }
        }
    }
    debug!("transport event stream closed");
}
