use std::collections::VecDeque;

use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::api::central::PeripheralId;
use crate::api::characteristic::{Characteristic, CharacteristicHandle, CharacteristicWriteType};
use crate::api::service::Service;
use crate::api::transport::Transport;
use crate::{Error, Result};

pub type OperationId = u64;

/// A request a caller can queue against one peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Read {
        characteristic: Characteristic,
    },
    Write {
        characteristic: Characteristic,
        data: Vec<u8>,
        write_type: CharacteristicWriteType,
    },
    Discover,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Value(Vec<u8>),
    Ack,
    Services(Vec<Service>),
}

/// Unit of work on the queue: a caller operation, or a notify-state change the
/// subscription registry needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Job {
    Caller(Operation),
    NotifyState {
        characteristic: Characteristic,
        enabled: bool,
    },
}

impl Job {
    pub fn handle(&self) -> Option<CharacteristicHandle> {
        match self {
            Job::Caller(Operation::Read { characteristic })
            | Job::Caller(Operation::Write { characteristic, .. })
            | Job::NotifyState { characteristic, .. } => Some(characteristic.handle),
            Job::Caller(Operation::Discover) => None,
        }
    }

    /// Whether this turns notifications on for `handle`.
    pub fn enables_notifications(&self, handle: CharacteristicHandle) -> bool {
        matches!(
            self,
            Job::NotifyState { characteristic, enabled: true } if characteristic.handle == handle
        )
    }

    pub fn is_write_without_response(&self) -> bool {
        matches!(
            self,
            Job::Caller(Operation::Write {
                write_type: CharacteristicWriteType::WriteWithoutResponse,
                ..
            })
        )
    }

    pub async fn execute(
        self,
        transport: &dyn Transport,
        peripheral: &PeripheralId,
    ) -> Result<OperationOutput> {
        match self {
            Job::Caller(Operation::Read { characteristic }) => transport
                .read_characteristic(peripheral, &characteristic)
                .await
                .map(OperationOutput::Value),
            Job::Caller(Operation::Write {
                characteristic,
                data,
                write_type,
            }) => transport
                .write_characteristic(peripheral, &characteristic, &data, write_type)
                .await
                .map(|_| OperationOutput::Ack),
            Job::Caller(Operation::Discover) => transport
                .discover_services(peripheral)
                .await
                .map(OperationOutput::Services),
            Job::NotifyState {
                characteristic,
                enabled,
            } => transport
                .set_notify_state(peripheral, &characteristic, enabled)
                .await
                .map(|_| OperationOutput::Ack),
        }
    }
}

pub(crate) type Responder = oneshot::Sender<Result<OperationOutput>>;

pub(crate) struct PendingOperation {
    pub id: OperationId,
    pub job: Job,
    pub deadline: Instant,
    responders: Vec<Responder>,
}

impl PendingOperation {
    pub fn new(id: OperationId, job: Job, deadline: Instant, responder: Option<Responder>) -> Self {
        Self {
            id,
            job,
            deadline,
            responders: responder.into_iter().collect(),
        }
    }

    /// Completes every caller waiting on this operation. Later calls only
    /// reach callers that joined since.
    pub fn resolve(&mut self, result: Result<OperationOutput>) {
        for responder in self.responders.drain(..) {
            let _ = responder.send(result.clone());
        }
    }

    #[cfg(test)]
    pub fn is_resolved(&self) -> bool {
        self.responders.is_empty()
    }
}

struct InFlight {
    operation: PendingOperation,
    task: AbortHandle,
}

/// FIFO of operations for one peripheral with at most one in flight.
#[derive(Default)]
pub(crate) struct Dispatcher {
    queue: VecDeque<PendingOperation>,
    in_flight: Option<InFlight>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: PendingOperation) {
        self.queue.push_back(operation);
    }

    /// Queues ahead of everything not yet started.
    pub fn push_front(&mut self, operation: PendingOperation) {
        self.queue.push_front(operation);
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> Option<OperationId> {
        self.in_flight.as_ref().map(|f| f.operation.id)
    }

    /// Attaches `responder` to the in-flight or queued operation whose job
    /// matches, so it resolves with that operation's result. Hands the
    /// responder back if nothing matching is pending.
    pub fn join(&mut self, matches: impl Fn(&Job) -> bool, responder: Responder) -> Option<Responder> {
        let pending = match self.in_flight.as_mut() {
            Some(in_flight) if matches(&in_flight.operation.job) => Some(&mut in_flight.operation),
            _ => self.queue.iter_mut().find(|op| matches(&op.job)),
        };
        match pending {
            Some(operation) => {
                operation.responders.push(responder);
                None
            }
            None => Some(responder),
        }
    }

    /// Next operation to run, if nothing occupies the transport.
    pub fn pop_next(&mut self) -> Option<PendingOperation> {
        if self.in_flight.is_some() {
            return None;
        }
        self.queue.pop_front()
    }

    pub fn start(&mut self, operation: PendingOperation, task: AbortHandle) {
        debug_assert!(self.in_flight.is_none());
        self.in_flight = Some(InFlight { operation, task });
    }

    /// Frees the slot if `id` is the operation in flight.
    pub fn complete(&mut self, id: OperationId) -> Option<PendingOperation> {
        match &self.in_flight {
            Some(in_flight) if in_flight.operation.id == id => {
                self.in_flight.take().map(|f| f.operation)
            }
            _ => None,
        }
    }

    /// A queued operation is dropped outright. The in-flight one resolves as
    /// cancelled now but keeps the slot until the transport finishes.
    pub fn cancel(&mut self, id: OperationId) -> bool {
        if let Some(position) = self.queue.iter().position(|op| op.id == id) {
            if let Some(mut operation) = self.queue.remove(position) {
                debug!("cancelled queued operation {}", id);
                operation.resolve(Err(Error::Cancelled));
            }
            return true;
        }
        match &mut self.in_flight {
            Some(in_flight) if in_flight.operation.id == id => {
                debug!("cancelled in-flight operation {}", id);
                in_flight.operation.resolve(Err(Error::Cancelled));
                true
            }
            _ => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue
            .iter()
            .map(|op| op.deadline)
            .chain(self.in_flight.iter().map(|f| f.operation.deadline))
            .min()
    }

    /// Fails every operation whose deadline has passed. Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for mut operation in self.queue.drain(..) {
            if operation.deadline <= now {
                warn!("operation {} timed out while queued", operation.id);
                operation.resolve(Err(Error::Timeout));
                expired += 1;
            } else {
                kept.push_back(operation);
            }
        }
        self.queue = kept;

        if self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.operation.deadline <= now)
        {
            if let Some(mut in_flight) = self.in_flight.take() {
                warn!("operation {} timed out at the transport", in_flight.operation.id);
                in_flight.task.abort();
                in_flight.operation.resolve(Err(Error::Timeout));
                expired += 1;
            }
        }
        expired
    }

    pub fn fail_all(&mut self, error: Error) {
        if let Some(mut in_flight) = self.in_flight.take() {
            in_flight.task.abort();
            in_flight.operation.resolve(Err(error.clone()));
        }
        for mut operation in self.queue.drain(..) {
            operation.resolve(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn characteristic(handle: u16) -> Characteristic {
        Characteristic::new(Uuid::from_u128(handle as u128), Uuid::nil(), CharacteristicHandle(handle), vec![])
    }

    fn read(
        id: OperationId,
        timeout: Duration,
    ) -> (PendingOperation, oneshot::Receiver<Result<OperationOutput>>) {
        let (tx, rx) = oneshot::channel();
        let job = Job::Caller(Operation::Read {
            characteristic: characteristic(1),
        });
        (PendingOperation::new(id, job, Instant::now() + timeout, Some(tx)), rx)
    }

    fn idle_task() -> AbortHandle {
        tokio::spawn(futures::future::pending::<()>()).abort_handle()
    }

    #[tokio::test]
    async fn runs_in_arrival_order_one_at_a_time() {
        let mut dispatcher = Dispatcher::new();
        for id in 1..=3 {
            dispatcher.push(read(id, Duration::from_secs(1)).0);
        }

        let first = dispatcher.pop_next().unwrap();
        assert_eq!(first.id, 1);
        dispatcher.start(first, idle_task());
        assert!(dispatcher.pop_next().is_none());

        assert!(dispatcher.complete(7).is_none());
        assert_eq!(dispatcher.complete(1).map(|op| op.id), Some(1));
        assert_eq!(dispatcher.pop_next().map(|op| op.id), Some(2));
    }

    #[tokio::test]
    async fn cancelling_queued_operation_removes_it() {
        let mut dispatcher = Dispatcher::new();
        let (op, mut rx) = read(1, Duration::from_secs(1));
        dispatcher.push(op);
        dispatcher.push(read(2, Duration::from_secs(1)).0);

        assert!(dispatcher.cancel(1));
        assert_eq!(rx.try_recv().unwrap(), Err(Error::Cancelled));
        assert_eq!(dispatcher.queued(), 1);
        assert!(!dispatcher.cancel(1));
    }

    #[tokio::test]
    async fn cancelling_in_flight_keeps_the_slot() {
        let mut dispatcher = Dispatcher::new();
        let (op, mut rx) = read(1, Duration::from_secs(1));
        dispatcher.push(op);
        let op = dispatcher.pop_next().unwrap();
        dispatcher.start(op, idle_task());

        assert!(dispatcher.cancel(1));
        assert_eq!(rx.try_recv().unwrap(), Err(Error::Cancelled));
        assert_eq!(dispatcher.in_flight(), Some(1));

        let mut finished = dispatcher.complete(1).unwrap();
        assert!(finished.is_resolved());
        finished.resolve(Ok(OperationOutput::Ack));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_frees_the_slot_and_spares_later_deadlines() {
        let mut dispatcher = Dispatcher::new();
        let (stuck, mut stuck_rx) = read(1, Duration::from_millis(1));
        let (next, mut next_rx) = read(2, Duration::from_secs(5));
        dispatcher.push(stuck);
        dispatcher.push(next);
        let op = dispatcher.pop_next().unwrap();
        dispatcher.start(op, idle_task());

        assert_eq!(dispatcher.next_deadline(), Some(Instant::now() + Duration::from_millis(1)));
        tokio::time::advance(Duration::from_millis(2)).await;

        assert_eq!(dispatcher.expire(Instant::now()), 1);
        assert_eq!(stuck_rx.try_recv().unwrap(), Err(Error::Timeout));
        assert!(next_rx.try_recv().is_err());
        assert_eq!(dispatcher.pop_next().map(|op| op.id), Some(2));
    }

    #[tokio::test]
    async fn fail_all_resolves_everything() {
        let mut dispatcher = Dispatcher::new();
        let (a, mut a_rx) = read(1, Duration::from_secs(1));
        let (b, mut b_rx) = read(2, Duration::from_secs(1));
        dispatcher.push(a);
        dispatcher.push(b);
        let op = dispatcher.pop_next().unwrap();
        dispatcher.start(op, idle_task());

        dispatcher.fail_all(Error::LinkLost);
        assert_eq!(a_rx.try_recv().unwrap(), Err(Error::LinkLost));
        assert_eq!(b_rx.try_recv().unwrap(), Err(Error::LinkLost));
        assert_eq!(dispatcher.in_flight(), None);
        assert_eq!(dispatcher.queued(), 0);
    }

    #[tokio::test]
    async fn joined_callers_share_the_result() {
        let mut dispatcher = Dispatcher::new();
        let enable = |handle| Job::NotifyState {
            characteristic: characteristic(handle),
            enabled: true,
        };
        let (tx, mut first_rx) = oneshot::channel();
        dispatcher.push(PendingOperation::new(1, enable(4), Instant::now() + Duration::from_secs(1), Some(tx)));
        let op = dispatcher.pop_next().unwrap();
        dispatcher.start(op, idle_task());

        let (tx, mut second_rx) = oneshot::channel();
        assert!(dispatcher.join(|job| job.enables_notifications(CharacteristicHandle(4)), tx).is_none());
        let (tx, _other_rx) = oneshot::channel();
        assert!(dispatcher.join(|job| job.enables_notifications(CharacteristicHandle(5)), tx).is_some());

        let rejected: Result<OperationOutput> = Err(Error::TransportRejected("busy".into()));
        dispatcher.complete(1).unwrap().resolve(rejected.clone());
        assert_eq!(first_rx.try_recv().unwrap(), rejected);
        assert_eq!(second_rx.try_recv().unwrap(), rejected);
    }
}
