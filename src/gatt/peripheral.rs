use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use log::error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::api::central::{ConnectionState, PeripheralId};
use crate::api::central_event::TransportEvent;
use crate::api::characteristic::{Characteristic, CharacteristicWriteType};
use crate::api::peripheral_event::{CharacteristicEvent, CharacteristicResult};
use crate::api::service::{Service, find_characteristic};
use crate::api::transport::Transport;
use crate::config::CentralConfig;
use crate::gatt::dispatcher::{Operation, OperationId, OperationOutput};
use crate::gatt::peripheral_actor::{self, PeripheralCommand};
use crate::gatt::subscriptions::SubscriptionToken;
use crate::{Error, Result};

/// Caller-facing handle to one remote peripheral. Clones share the same link,
/// queue and subscriptions.
#[derive(Clone, Debug)]
pub struct Peripheral {
    id: PeripheralId,
    commands: UnboundedSender<PeripheralCommand>,
    state: watch::Receiver<ConnectionState>,
    ids: Arc<AtomicU64>,
    config: Arc<CentralConfig>,
}

impl Peripheral {
    pub(crate) fn spawn(
        id: PeripheralId,
        transport: Arc<dyn Transport>,
        config: Arc<CentralConfig>,
    ) -> Self {
        let ids = Arc::new(AtomicU64::new(1));
        let actor = peripheral_actor::spawn(id.clone(), transport, config.clone(), ids.clone());
        Self {
            id,
            commands: actor.commands,
            state: actor.state,
            ids,
            config,
        }
    }

    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every published state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Resolves once services are discovered. Concurrent calls share a single
    /// attempt and see the same outcome.
    pub async fn connect(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.commands.send(PeripheralCommand::Connect { responder })?;
        rx.await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.commands.send(PeripheralCommand::Disconnect { responder })?;
        rx.await?
    }

    /// Topology from the last discovery; empty unless Ready.
    pub async fn services(&self) -> Result<Vec<Service>> {
        let (responder, rx) = oneshot::channel();
        self.commands.send(PeripheralCommand::Services { responder })?;
        Ok(rx.await?)
    }

    pub async fn characteristics(&self) -> Result<Vec<Characteristic>> {
        let services = self.services().await?;
        Ok(services
            .into_iter()
            .flat_map(|service| service.characteristics.into_iter())
            .collect())
    }

    pub async fn characteristic(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<Characteristic> {
        let services = self.services().await?;
        find_characteristic(&services, &service_uuid, &characteristic_uuid)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "characteristic {} in service {}",
                    characteristic_uuid, service_uuid
                ))
            })
    }

    /// Queues an operation behind everything already queued on this peripheral.
    /// `timeout` falls back to the configured default.
    pub fn enqueue(&self, operation: Operation, timeout: Option<Duration>) -> OperationHandle {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let (responder, receiver) = oneshot::channel();
        let _ = self.commands.send(PeripheralCommand::Enqueue {
            id,
            operation,
            timeout: timeout.unwrap_or(self.config.operation_timeout),
            responder,
        });
        OperationHandle {
            id,
            receiver,
            canceller: Canceller {
                id,
                commands: self.commands.clone(),
            },
        }
    }

    pub fn cancel(&self, id: OperationId) {
        let _ = self.commands.send(PeripheralCommand::Cancel { id });
    }

    pub fn read_characteristic(&self, characteristic: &Characteristic) -> OperationHandle {
        self.enqueue(
            Operation::Read {
                characteristic: characteristic.clone(),
            },
            None,
        )
    }

    pub fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: CharacteristicWriteType,
    ) -> OperationHandle {
        self.enqueue(
            Operation::Write {
                characteristic: characteristic.clone(),
                data: data.to_vec(),
                write_type,
            },
            None,
        )
    }

    /// Runs discovery again and replaces the topology.
    pub async fn discover(&self) -> Result<Vec<Service>> {
        match self.enqueue(Operation::Discover, None).await? {
            OperationOutput::Services(services) => Ok(services),
            other => Err(unexpected(other)),
        }
    }

    pub async fn read(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<CharacteristicResult> {
        let characteristic = self.characteristic(service_uuid, characteristic_uuid).await?;
        match self.read_characteristic(&characteristic).await? {
            OperationOutput::Value(data) => Ok(CharacteristicResult::new(
                characteristic,
                CharacteristicEvent::Read,
                Some(data),
            )),
            other => Err(unexpected(other)),
        }
    }

    pub async fn write(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<CharacteristicResult> {
        let characteristic = self.characteristic(service_uuid, characteristic_uuid).await?;
        let write_type = CharacteristicWriteType::from_with_response(with_response);
        self.write_characteristic(&characteristic, data, write_type)
            .await?;
        Ok(CharacteristicResult::new(
            characteristic,
            write_type.into(),
            None,
        ))
    }

    pub async fn subscribe(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<NotificationStream> {
        let characteristic = self.characteristic(service_uuid, characteristic_uuid).await?;
        self.subscribe_characteristic(&characteristic).await
    }

    /// The stream keeps receiving across reconnects until dropped.
    pub async fn subscribe_characteristic(
        &self,
        characteristic: &Characteristic,
    ) -> Result<NotificationStream> {
        let token = self.ids.fetch_add(1, Ordering::Relaxed);
        let (sink, receiver) = mpsc::unbounded_channel();
        let (responder, rx) = oneshot::channel();
        self.commands.send(PeripheralCommand::Subscribe {
            token,
            characteristic: characteristic.clone(),
            sink,
            responder,
        })?;
        // Dropping on the error path unsubscribes.
        let stream = NotificationStream {
            token,
            characteristic: characteristic.clone(),
            receiver,
            commands: self.commands.clone(),
        };
        rx.await??;
        Ok(stream)
    }

    pub(crate) fn route(&self, event: TransportEvent) {
        if self.commands.send(PeripheralCommand::Transport(event)).is_err() {
            error!("actor for {} is gone, dropping transport event", self.id);
        }
    }

    pub(crate) fn release(&self) {
        let _ = self.commands.send(PeripheralCommand::Release);
    }
}

fn unexpected(output: OperationOutput) -> Error {
    Error::TransportRejected(format!("unexpected operation output {:?}", output))
}

/// Pending result of an enqueued operation.
#[derive(Debug)]
pub struct OperationHandle {
    id: OperationId,
    receiver: oneshot::Receiver<Result<OperationOutput>>,
    canceller: Canceller,
}

impl OperationHandle {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }
}

impl Future for OperationHandle {
    type Output = Result<OperationOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::LinkLost)))
    }
}

#[derive(Clone, Debug)]
pub struct Canceller {
    id: OperationId,
    commands: UnboundedSender<PeripheralCommand>,
}

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.commands.send(PeripheralCommand::Cancel { id: self.id });
    }
}

/// Notifications from one characteristic. Ends when the peripheral is released.
#[derive(Debug)]
pub struct NotificationStream {
    token: SubscriptionToken,
    characteristic: Characteristic,
    receiver: UnboundedReceiver<Vec<u8>>,
    commands: UnboundedSender<PeripheralCommand>,
}

impl NotificationStream {
    pub fn characteristic(&self) -> &Characteristic {
        &self.characteristic
    }
}

impl Stream for NotificationStream {
    type Item = CharacteristicResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let characteristic = &this.characteristic;
        this.receiver.poll_recv(cx).map(|value| {
            value.map(|data| {
                CharacteristicResult::new(
                    characteristic.clone(),
                    CharacteristicEvent::Notification,
                    Some(data),
                )
            })
        })
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(PeripheralCommand::Unsubscribe { token: self.token });
    }
}
