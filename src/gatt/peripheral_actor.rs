use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future;
use log::{debug, trace, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, sleep_until};

use crate::api::central::{ConnectionState, PeripheralId};
use crate::api::central_event::TransportEvent;
use crate::api::characteristic::Characteristic;
use crate::api::service::{Service, find_by_handle};
use crate::api::transport::Transport;
use crate::config::{CentralConfig, WriteWithoutResponsePolicy};
use crate::gatt::connection::{Connection, Generation, Step, Waiter};
use crate::gatt::dispatcher::{
    Dispatcher, Job, Operation, OperationId, OperationOutput, PendingOperation, Responder,
};
use crate::gatt::subscriptions::{Sink, SubscriptionRegistry, SubscriptionToken};
use crate::{Error, Result};

#[derive(Debug)]
pub(crate) enum PeripheralCommand {
    Connect {
        responder: Waiter,
    },
    Disconnect {
        responder: Waiter,
    },
    Services {
        responder: oneshot::Sender<Vec<Service>>,
    },
    Enqueue {
        id: OperationId,
        operation: Operation,
        timeout: Duration,
        responder: Responder,
    },
    Cancel {
        id: OperationId,
    },
    Subscribe {
        token: SubscriptionToken,
        characteristic: Characteristic,
        sink: Sink,
        responder: Responder,
    },
    Unsubscribe {
        token: SubscriptionToken,
    },
    Transport(TransportEvent),
    Release,
    ConnectFinished {
        generation: Generation,
        result: Result<()>,
    },
    DiscoveryFinished {
        generation: Generation,
        result: Result<Vec<Service>>,
    },
    DisconnectFinished {
        generation: Generation,
        result: Result<()>,
    },
    OperationFinished {
        id: OperationId,
        result: Result<OperationOutput>,
    },
}

/// Channel ends a facade needs to talk to a running actor.
pub(crate) struct ActorHandle {
    pub commands: UnboundedSender<PeripheralCommand>,
    pub state: watch::Receiver<ConnectionState>,
}

/// Starts the task owning all state of one peripheral. It runs until released
/// or until every sender to it is dropped.
pub(crate) fn spawn(
    peripheral: PeripheralId,
    transport: Arc<dyn Transport>,
    config: Arc<CentralConfig>,
    ids: Arc<AtomicU64>,
) -> ActorHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let actor = PeripheralActor {
        peripheral,
        transport,
        config,
        ids,
        connection: Connection::new(state_tx),
        dispatcher: Dispatcher::new(),
        subscriptions: SubscriptionRegistry::new(),
        commands: commands_rx,
        myself: commands_tx.downgrade(),
    };
    tokio::spawn(actor.run());
    ActorHandle {
        commands: commands_tx,
        state: state_rx,
    }
}

enum Wake {
    Command(Option<PeripheralCommand>),
    Deadline,
}

struct PeripheralActor {
    peripheral: PeripheralId,
    transport: Arc<dyn Transport>,
    config: Arc<CentralConfig>,
    ids: Arc<AtomicU64>,
    connection: Connection,
    dispatcher: Dispatcher,
    subscriptions: SubscriptionRegistry,
    commands: UnboundedReceiver<PeripheralCommand>,
    myself: WeakUnboundedSender<PeripheralCommand>,
}

impl PeripheralActor {
    async fn run(mut self) {
        trace!("actor for {} started", self.peripheral);
        loop {
            let deadline = self.dispatcher.next_deadline();
            let expiry = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => future::pending().await,
                }
            };
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                _ = expiry => Wake::Deadline,
            };
            match wake {
                Wake::Command(Some(PeripheralCommand::Release)) | Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Deadline => {
                    self.dispatcher.expire(Instant::now());
                }
            }
            self.drain();
        }
        self.shutdown();
        trace!("actor for {} stopped", self.peripheral);
    }

    fn handle_command(&mut self, command: PeripheralCommand) {
        match command {
            PeripheralCommand::Connect { responder } => {
                if let Some(step) = self.connection.connect(responder) {
                    self.perform(step);
                }
            }
            PeripheralCommand::Disconnect { responder } => {
                if let Some(step) = self.connection.disconnect(responder) {
                    // Work queued from here on is waiting for a reconnect.
                    self.dispatcher.fail_all(Error::LinkLost);
                    self.perform(step);
                }
            }
            PeripheralCommand::Services { responder } => {
                let _ = responder.send(self.connection.services().to_vec());
            }
            PeripheralCommand::Enqueue {
                id,
                operation,
                timeout,
                responder,
            } => {
                self.enqueue(id, Job::Caller(operation), timeout, Some(responder));
            }
            PeripheralCommand::Cancel { id } => {
                if !self.dispatcher.cancel(id) {
                    trace!("cancel for unknown operation {}", id);
                }
            }
            PeripheralCommand::Subscribe {
                token,
                characteristic,
                sink,
                responder,
            } => {
                let handle = characteristic.handle;
                let first = self
                    .subscriptions
                    .subscribe(token, characteristic.clone(), sink);
                if !self.connection.is_ready() {
                    let _ = responder.send(Ok(OperationOutput::Ack));
                } else if first {
                    let job = Job::NotifyState {
                        characteristic,
                        enabled: true,
                    };
                    let id = self.next_id();
                    self.enqueue(id, job, self.config.operation_timeout, Some(responder));
                } else if let Some(responder) = self
                    .dispatcher
                    .join(|job| job.enables_notifications(handle), responder)
                {
                    let _ = responder.send(Ok(OperationOutput::Ack));
                }
            }
            PeripheralCommand::Unsubscribe { token } => {
                if let Some(characteristic) = self.subscriptions.unsubscribe(token) {
                    if self.connection.is_ready() {
                        let job = Job::NotifyState {
                            characteristic,
                            enabled: false,
                        };
                        let id = self.next_id();
                        self.enqueue(id, job, self.config.operation_timeout, None);
                    }
                }
            }
            PeripheralCommand::Transport(event) => self.handle_transport_event(event),
            PeripheralCommand::Release => {}
            PeripheralCommand::ConnectFinished { generation, result } => match result {
                Ok(()) => {
                    if let Some(step) = self.connection.on_transport_connected(generation) {
                        self.perform(step);
                    }
                }
                Err(error) => {
                    warn!("connect to {} failed: {}", self.peripheral, error);
                    if self.connection.on_transport_error(Some(generation), error) {
                        self.dispatcher.fail_all(Error::LinkLost);
                    }
                }
            },
            PeripheralCommand::DiscoveryFinished { generation, result } => match result {
                Ok(services) => {
                    if self.connection.on_services_discovered(generation, services) {
                        self.on_ready();
                    }
                }
                Err(error) => {
                    warn!("discovery on {} failed: {}", self.peripheral, error);
                    let error = match error {
                        Error::DiscoveryFailed(reason) => Error::DiscoveryFailed(reason),
                        other => Error::DiscoveryFailed(other.to_string()),
                    };
                    if self.connection.on_transport_error(Some(generation), error) {
                        self.dispatcher.fail_all(Error::LinkLost);
                    }
                }
            },
            PeripheralCommand::DisconnectFinished { generation, result } => {
                if let Err(error) = result {
                    warn!("disconnect from {} reported {}", self.peripheral, error);
                }
                self.link_down(|connection| connection.on_disconnect_finished(generation));
            }
            PeripheralCommand::OperationFinished { id, result } => {
                let Some(mut operation) = self.dispatcher.complete(id) else {
                    trace!("discarding late result of operation {}", id);
                    return;
                };
                if let (Job::Caller(Operation::Discover), Ok(OperationOutput::Services(services))) =
                    (&operation.job, &result)
                {
                    self.connection.replace_services(services.clone());
                }
                if let Err(error) = &result {
                    warn!("operation {} on {} failed: {}", id, self.peripheral, error);
                }
                operation.resolve(result);
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        trace!("{} transport event {:?}", self.peripheral, event);
        match event {
            TransportEvent::ConnectionStateChanged { connected: true, .. } => {
                let generation = self.connection.generation();
                if let Some(step) = self.connection.on_transport_connected(generation) {
                    self.perform(step);
                }
            }
            TransportEvent::ConnectionStateChanged { connected: false, .. } => {
                self.link_down(Connection::on_transport_disconnected);
            }
            TransportEvent::ServicesDiscovered { services, .. } => {
                if self.connection.state() == ConnectionState::Discovering {
                    let generation = self.connection.generation();
                    if self.connection.on_services_discovered(generation, services) {
                        self.on_ready();
                    }
                } else {
                    self.connection.replace_services(services);
                }
            }
            TransportEvent::CharacteristicValueChanged {
                characteristic,
                value,
                ..
            } => {
                self.subscriptions.notify(characteristic, &value);
            }
            TransportEvent::TransportError { error, .. } => {
                if self.connection.on_transport_error(None, error) {
                    self.dispatcher.fail_all(Error::LinkLost);
                }
            }
            TransportEvent::AdapterStateChanged { .. } | TransportEvent::DeviceDiscovered { .. } => {}
        }
    }

    fn enqueue(&mut self, id: OperationId, job: Job, timeout: Duration, responder: Option<Responder>) {
        let mut operation = PendingOperation::new(id, job, Instant::now() + timeout, responder);
        if !self.connection.accepts_operations() {
            debug!(
                "rejecting operation {}: {} is {}",
                id,
                self.peripheral,
                self.connection.state()
            );
            operation.resolve(Err(Error::LinkLost));
            return;
        }
        self.dispatcher.push(operation);
    }

    fn on_ready(&mut self) {
        let active = self.subscriptions.active();
        debug!(
            "{} ready, re-arming {} subscriptions",
            self.peripheral,
            active.len()
        );
        let deadline = Instant::now() + self.config.operation_timeout;
        for characteristic in active.into_iter().rev() {
            let job = Job::NotifyState {
                characteristic,
                enabled: true,
            };
            let id = self.next_id();
            self.dispatcher
                .push_front(PendingOperation::new(id, job, deadline, None));
        }
    }

    /// Applies a disconnect transition. Pending work fails if the state moved,
    /// unless a reconnect starts: that work was accepted to wait for it.
    fn link_down(&mut self, transition: impl FnOnce(&mut Connection) -> Option<Step>) {
        let before = self.connection.state();
        let step = transition(&mut self.connection);
        let reconnecting = matches!(step, Some(Step::Connect(_)));
        if before != ConnectionState::Disconnected
            && self.connection.state() != before
            && !reconnecting
        {
            self.dispatcher.fail_all(Error::LinkLost);
        }
        if let Some(step) = step {
            self.perform(step);
        }
    }

    /// Starts the next queued operation if the link is Ready and the slot free.
    fn drain(&mut self) {
        while self.connection.is_ready() {
            let Some(mut operation) = self.dispatcher.pop_next() else {
                return;
            };
            if let Some(handle) = operation.job.handle() {
                if find_by_handle(self.connection.services(), handle).is_none() {
                    warn!("{} has no characteristic {}", self.peripheral, handle);
                    operation.resolve(Err(Error::NotFound(format!("characteristic {}", handle))));
                    continue;
                }
            }
            if operation.job.is_write_without_response()
                && self.config.write_without_response == WriteWithoutResponsePolicy::Optimistic
            {
                operation.resolve(Ok(OperationOutput::Ack));
            }

            let id = operation.id;
            let job = operation.job.clone();
            let transport = self.transport.clone();
            let peripheral = self.peripheral.clone();
            let myself = self.myself.clone();
            debug!("dispatching operation {} to {}", id, peripheral);
            let task = tokio::spawn(async move {
                let result = job.execute(transport.as_ref(), &peripheral).await;
                send(&myself, PeripheralCommand::OperationFinished { id, result });
            });
            self.dispatcher.start(operation, task.abort_handle());
            return;
        }
    }

    fn perform(&self, step: Step) {
        let transport = self.transport.clone();
        let peripheral = self.peripheral.clone();
        let myself = self.myself.clone();
        match step {
            Step::Connect(generation) => {
                debug!("connecting to {} (attempt {})", peripheral, generation);
                tokio::spawn(async move {
                    let result = transport.connect(&peripheral).await;
                    send(&myself, PeripheralCommand::ConnectFinished { generation, result });
                });
            }
            Step::Discover(generation) => {
                debug!("discovering services on {}", peripheral);
                tokio::spawn(async move {
                    let result = transport.discover_services(&peripheral).await;
                    send(&myself, PeripheralCommand::DiscoveryFinished { generation, result });
                });
            }
            Step::Disconnect(generation) => {
                debug!("disconnecting from {}", peripheral);
                tokio::spawn(async move {
                    let result = transport.disconnect(&peripheral).await;
                    send(&myself, PeripheralCommand::DisconnectFinished { generation, result });
                });
            }
        }
    }

    fn shutdown(&mut self) {
        self.commands.close();
        self.dispatcher.fail_all(Error::LinkLost);
        let state = self.connection.state();
        if state != ConnectionState::Disconnected && state != ConnectionState::Error {
            let transport = self.transport.clone();
            let peripheral = self.peripheral.clone();
            tokio::spawn(async move {
                if let Err(error) = transport.disconnect(&peripheral).await {
                    warn!("disconnect of released {} failed: {}", peripheral, error);
                }
            });
        }
        self.connection.shutdown();
        self.subscriptions.clear();
    }

    fn next_id(&self) -> OperationId {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }
}

fn send(myself: &WeakUnboundedSender<PeripheralCommand>, command: PeripheralCommand) {
    if let Some(actor) = myself.upgrade() {
        let _ = actor.send(command);
    }
}
