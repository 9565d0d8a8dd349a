use log::{debug, trace, warn};
use tokio::sync::{oneshot, watch};

use crate::api::central::ConnectionState;
use crate::api::service::Service;
use crate::{Error, Result};

/// Bumped on every connect or disconnect attempt. Completions carrying an older
/// generation belong to an abandoned attempt and are dropped.
pub(crate) type Generation = u64;

pub(crate) type Waiter = oneshot::Sender<Result<()>>;

/// Transport call the owner of a [`Connection`] must issue next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Connect(Generation),
    Discover(Generation),
    Disconnect(Generation),
}

/// Link lifecycle of one peripheral. Holds no I/O: every transition returns the
/// transport call to make, if any.
pub(crate) struct Connection {
    state: ConnectionState,
    generation: Generation,
    services: Vec<Service>,
    connect_waiters: Vec<Waiter>,
    disconnect_waiters: Vec<Waiter>,
    reconnect_pending: bool,
    state_tx: watch::Sender<ConnectionState>,
}

impl Connection {
    pub fn new(state_tx: watch::Sender<ConnectionState>) -> Self {
        state_tx.send_replace(ConnectionState::Disconnected);
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            services: Vec::new(),
            connect_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
            reconnect_pending: false,
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Whether a newly enqueued operation can still expect to reach Ready.
    pub fn accepts_operations(&self) -> bool {
        match self.state {
            ConnectionState::Ready => true,
            ConnectionState::Disconnecting => self.reconnect_pending,
            state => state.is_establishing(),
        }
    }

    pub fn connect(&mut self, waiter: Waiter) -> Option<Step> {
        match self.state {
            ConnectionState::Ready => {
                let _ = waiter.send(Ok(()));
                None
            }
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Discovering => {
                trace!("connect joined attempt {}", self.generation);
                self.connect_waiters.push(waiter);
                None
            }
            ConnectionState::Disconnecting => {
                self.connect_waiters.push(waiter);
                self.reconnect_pending = true;
                None
            }
            ConnectionState::Disconnected | ConnectionState::Error => {
                self.connect_waiters.push(waiter);
                Some(self.begin_connect())
            }
        }
    }

    pub fn disconnect(&mut self, waiter: Waiter) -> Option<Step> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Error => {
                let _ = waiter.send(Ok(()));
                None
            }
            ConnectionState::Disconnecting => {
                self.reconnect_pending = false;
                self.disconnect_waiters.push(waiter);
                None
            }
            _ => {
                self.disconnect_waiters.push(waiter);
                self.generation += 1;
                self.set_state(ConnectionState::Disconnecting);
                Some(Step::Disconnect(self.generation))
            }
        }
    }

    pub fn on_transport_connected(&mut self, generation: Generation) -> Option<Step> {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            trace!("ignoring stale connect completion {}", generation);
            return None;
        }
        self.set_state(ConnectionState::Connected);
        self.set_state(ConnectionState::Discovering);
        Some(Step::Discover(self.generation))
    }

    /// Returns true when this completed the transition into Ready.
    pub fn on_services_discovered(&mut self, generation: Generation, services: Vec<Service>) -> bool {
        if generation != self.generation || self.state != ConnectionState::Discovering {
            trace!("ignoring stale discovery completion {}", generation);
            return false;
        }
        self.services = services;
        self.set_state(ConnectionState::Ready);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        true
    }

    /// Fresh topology from a rediscovery while Ready.
    pub fn replace_services(&mut self, services: Vec<Service>) {
        if self.is_ready() {
            self.services = services;
        }
    }

    /// Link gone, whether requested or not. Returns the reconnect to start if a
    /// caller asked to connect while the link was going down.
    pub fn on_transport_disconnected(&mut self) -> Option<Step> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        if self.state != ConnectionState::Disconnecting {
            debug!("link lost while {}", self.state);
            self.set_state(ConnectionState::Disconnecting);
        }
        self.services.clear();
        self.set_state(ConnectionState::Disconnected);
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        if std::mem::take(&mut self.reconnect_pending) {
            return Some(self.begin_connect());
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(Error::LinkLost));
        }
        None
    }

    pub fn on_disconnect_finished(&mut self, generation: Generation) -> Option<Step> {
        if generation != self.generation || self.state != ConnectionState::Disconnecting {
            return None;
        }
        self.on_transport_disconnected()
    }

    /// A failure while establishing the link. `None` matches any attempt, for
    /// errors pushed by the transport out of band. Returns true when this moved
    /// the connection into Error.
    pub fn on_transport_error(&mut self, generation: Option<Generation>, error: Error) -> bool {
        if generation.is_some_and(|generation| generation != self.generation) {
            return false;
        }
        if !self.state.is_establishing() {
            warn!("transport error while {}: {}", self.state, error);
            return false;
        }
        self.services.clear();
        self.set_state(ConnectionState::Error);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        true
    }

    /// Fails everyone still waiting; the owner is going away.
    pub fn shutdown(&mut self) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(Error::LinkLost));
        }
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.services.clear();
        self.set_state(ConnectionState::Disconnected);
    }

    fn begin_connect(&mut self) -> Step {
        self.generation += 1;
        self.set_state(ConnectionState::Connecting);
        Step::Connect(self.generation)
    }

    fn set_state(&mut self, state: ConnectionState) {
        trace!("{} -> {}", self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
    }
}
