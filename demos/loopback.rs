use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use gattlink::api::central::{PeripheralId, ScanFilter};
use gattlink::api::central_event::TransportEvent;
use gattlink::api::characteristic::{
    Characteristic, CharacteristicHandle, CharacteristicProperty, CharacteristicWriteType,
};
use gattlink::api::service::Service;
use gattlink::api::transport::Transport;
use gattlink::{CentralConfig, CentralManager, Result};
use log::LevelFilter;
use tokio::sync::mpsc;
use uuid::Uuid;

const ECHO_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
const ECHO_RX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
const ECHO_TX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// A peripheral that echoes every write to RX back as a notification on TX.
struct Loopback {
    events: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for Loopback {
    async fn connect(&self, _peripheral: &PeripheralId) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self, _peripheral: &PeripheralId) -> Result<()> {
        Ok(())
    }

    async fn discover_services(&self, _peripheral: &PeripheralId) -> Result<Vec<Service>> {
        Ok(vec![Service::new(
            ECHO_SERVICE,
            vec![
                Characteristic::new(
                    ECHO_RX,
                    ECHO_SERVICE,
                    CharacteristicHandle(0x0010),
                    vec![CharacteristicProperty::Write, CharacteristicProperty::WriteWithoutResponse],
                ),
                Characteristic::new(
                    ECHO_TX,
                    ECHO_SERVICE,
                    CharacteristicHandle(0x0012),
                    vec![CharacteristicProperty::Read, CharacteristicProperty::Notify],
                ),
            ],
        )])
    }

    async fn read_characteristic(
        &self,
        _peripheral: &PeripheralId,
        _characteristic: &Characteristic,
    ) -> Result<Vec<u8>> {
        Ok(b"loopback".to_vec())
    }

    async fn write_characteristic(
        &self,
        peripheral: &PeripheralId,
        _characteristic: &Characteristic,
        data: &[u8],
        _write_type: CharacteristicWriteType,
    ) -> Result<()> {
        let _ = self
            .events
            .send(TransportEvent::CharacteristicValueChanged {
                peripheral: peripheral.clone(),
                characteristic: CharacteristicHandle(0x0012),
                value: data.to_vec(),
            })
            .await;
        Ok(())
    }

    async fn set_notify_state(
        &self,
        _peripheral: &PeripheralId,
        _characteristic: &Characteristic,
        _enabled: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn start_scan(&self, _filter: &ScanFilter) -> Result<()> {
        let _ = self
            .events
            .send(TransportEvent::DeviceDiscovered {
                peripheral: PeripheralId::from("loopback"),
                local_name: Some("Loopback".into()),
                rssi: Some(-40),
                services: vec![ECHO_SERVICE],
            })
            .await;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Info)
        .init();

    let (events_tx, events_rx) = mpsc::channel(256);
    let central = CentralManager::new(
        Arc::new(Loopback { events: events_tx }),
        events_rx,
        CentralConfig::default(),
    );

    let mut results = central.scan_results();
    central
        .start_scan(ScanFilter {
            services: vec![ECHO_SERVICE],
        })
        .await?;
    let Ok(found) = results.recv().await else {
        log::warn!("scan ended without results");
        return Ok(());
    };
    central.stop_scan().await?;
    log::info!("found {} ({:?})", found.peripheral, found.local_name);

    let peripheral = central.peripheral(found.peripheral);
    peripheral.connect().await?;

    let greeting = peripheral.read(ECHO_SERVICE, ECHO_TX).await?;
    log::info!("read {:?}", greeting.data);

    let mut echoes = peripheral.subscribe(ECHO_SERVICE, ECHO_TX).await?;
    for message in ["hello", "world"] {
        peripheral
            .write(ECHO_SERVICE, ECHO_RX, message.as_bytes(), true)
            .await?;
        if let Some(echo) = echoes.next().await {
            log::info!("echo {:?}", echo.data.map(String::from_utf8));
        }
    }

    drop(echoes);
    peripheral.disconnect().await?;
    Ok(())
}
