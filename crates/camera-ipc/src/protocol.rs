use crate::errors::IpcError;
use crate::message::{MessageId, WireMessage};
use crate::paths::MAX_PACKETS;
use crate::queue::BoundedQueue;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Connection state of a client session as seen by the camera server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Not registered with a server
    Offline,
    /// Registered, not streaming
    Idle,
    /// Start requested, waiting for the server to acknowledge
    Starting,
    /// Server is streaming frames into the shared buffer
    Running,
    /// Unregister requested, waiting for teardown
    WaitingToDelete,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Offline => "offline",
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::WaitingToDelete => "waiting_to_delete",
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The server acknowledged the request
    Acknowledged,
    /// The server went away before acknowledging
    PeerLost,
    /// The session stopped before the request completed
    Aborted,
}

/// One-shot completion handle of a lifecycle request. Resolved on the IPC
/// worker thread.
#[derive(Debug)]
pub struct Ticket {
    request: MessageId,
    rx: mpsc::Receiver<RequestOutcome>,
}

impl Ticket {
    fn new(request: MessageId) -> (Self, mpsc::Sender<RequestOutcome>) {
        let (tx, rx) = mpsc::channel();
        (Self { request, rx }, tx)
    }

    /// A ticket that is already resolved.
    pub(crate) fn resolved(request: MessageId, outcome: RequestOutcome) -> Self {
        let (ticket, tx) = Self::new(request);
        let _ = tx.send(outcome);
        ticket
    }

    pub fn request(&self) -> MessageId {
        self.request
    }

    /// Block until the request completes.
    pub fn wait(self) -> RequestOutcome {
        self.rx.recv().unwrap_or(RequestOutcome::Aborted)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<RequestOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(RequestOutcome::Aborted),
        }
    }

    pub fn try_outcome(&self) -> Option<RequestOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(RequestOutcome::Aborted),
        }
    }
}

/// Request-side session data, guarded by the session's request mutex.
///
/// Callers only enqueue; every transition is applied by the IPC worker when
/// the matching acknowledgement arrives.
#[derive(Debug)]
pub struct RequestState {
    client_id: u32,
    state: SessionState,
    outgoing: BoundedQueue<WireMessage>,
    pending: Vec<(MessageId, mpsc::Sender<RequestOutcome>)>,
    start_requested: bool,
    release_requested: Option<Instant>,
    release_finished: bool,
    stopped: bool,
}

impl RequestState {
    pub fn new(client_id: u32) -> Self {
        Self {
            client_id,
            state: SessionState::Offline,
            outgoing: BoundedQueue::new(MAX_PACKETS),
            pending: Vec::new(),
            start_requested: false,
            release_requested: None,
            release_finished: false,
            stopped: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Take the queued messages for sending, oldest first.
    pub fn take_outgoing(&mut self) -> Vec<WireMessage> {
        self.outgoing.drain()
    }

    pub fn enqueue(&mut self, msg: WireMessage) -> Result<(), IpcError> {
        let id = msg.id;
        self.outgoing.push(msg).map_err(|_| {
            tracing::warn!(message = ?id, "Outgoing queue full, dropping message");
            IpcError::QueueFull(id)
        })
    }

    fn request(&mut self, id: MessageId) -> Result<Ticket, IpcError> {
        self.enqueue(WireMessage::new(id, self.client_id))?;
        Ok(self.track(id))
    }

    fn track(&mut self, id: MessageId) -> Ticket {
        let (ticket, tx) = Ticket::new(id);
        self.pending.push((id, tx));
        ticket
    }

    pub fn register(&mut self) -> Result<Ticket, IpcError> {
        self.request(MessageId::Register)
    }

    /// Ask for streaming. Before registration completes the request is only
    /// remembered; the worker sends it once the session is idle.
    pub fn start(&mut self) -> Result<Ticket, IpcError> {
        if self.release_requested.is_some() {
            return Err(IpcError::InvalidState(self.state));
        }
        match self.state {
            SessionState::Idle => {
                let ticket = self.request(MessageId::Start)?;
                self.state = SessionState::Starting;
                self.start_requested = false;
                Ok(ticket)
            }
            SessionState::Offline | SessionState::Starting => {
                self.start_requested = self.state == SessionState::Offline;
                Ok(self.track(MessageId::Start))
            }
            SessionState::Running => Ok(Ticket::resolved(
                MessageId::Start,
                RequestOutcome::Acknowledged,
            )),
            SessionState::WaitingToDelete => Err(IpcError::InvalidState(self.state)),
        }
    }

    pub fn stop(&mut self) -> Result<Ticket, IpcError> {
        match self.state {
            SessionState::Offline | SessionState::WaitingToDelete => {
                Err(IpcError::InvalidState(self.state))
            }
            _ => {
                let ticket = self.request(MessageId::Stop)?;
                self.start_requested = false;
                Ok(ticket)
            }
        }
    }

    /// Begin unregistering. The worker tears the session down once the
    /// server acknowledges or `release_timeout` passes.
    pub fn release(&mut self) -> Result<Ticket, IpcError> {
        if self.release_requested.is_some() {
            return Ok(self.track(MessageId::Unregister));
        }

        if self.state == SessionState::Offline {
            // Nobody to unregister from
            self.start_requested = false;
            self.release_requested = Some(Instant::now());
            self.release_finished = true;
            return Ok(Ticket::resolved(
                MessageId::Unregister,
                RequestOutcome::PeerLost,
            ));
        }

        let ticket = self.request(MessageId::Unregister)?;
        self.start_requested = false;
        self.release_requested = Some(Instant::now());
        self.state = SessionState::WaitingToDelete;
        Ok(ticket)
    }

    pub fn release_requested(&self) -> bool {
        self.release_requested.is_some()
    }

    pub fn release_finished(&self, timeout: Duration) -> bool {
        self.release_finished
            || self
                .release_requested
                .is_some_and(|since| since.elapsed() >= timeout)
    }

    /// Send the remembered start once the session is idle. Returns true if
    /// a start was queued.
    pub fn send_pending_start(&mut self) -> Result<bool, IpcError> {
        if self.state != SessionState::Idle
            || !self.start_requested
            || self.release_requested.is_some()
        {
            return Ok(false);
        }
        self.enqueue(WireMessage::new(MessageId::Start, self.client_id))?;
        self.start_requested = false;
        self.state = SessionState::Starting;
        Ok(true)
    }

    /// Apply a status acknowledgement from the server. Returns true if the
    /// session state changed.
    pub fn apply_ack(&mut self, acked: MessageId) -> bool {
        let before = self.state;
        match acked {
            MessageId::Register => {
                if self.state == SessionState::Offline {
                    self.state = SessionState::Idle;
                }
            }
            MessageId::Start => {
                if self.state == SessionState::Starting {
                    self.state = SessionState::Running;
                }
            }
            MessageId::Stop => {
                if matches!(self.state, SessionState::Starting | SessionState::Running) {
                    self.state = SessionState::Idle;
                }
            }
            MessageId::Unregister => {
                if self.release_requested.is_some() {
                    self.release_finished = true;
                }
            }
            other => {
                tracing::warn!(acked = ?other, "Acknowledgement for unknown request");
            }
        }

        self.resolve(Some(acked), RequestOutcome::Acknowledged);
        before != self.state
    }

    /// The server disappeared. Streaming resumes automatically after the
    /// next successful registration.
    pub fn on_peer_lost(&mut self) {
        if matches!(self.state, SessionState::Starting | SessionState::Running) {
            self.start_requested = true;
        }
        if self.release_requested.is_some() {
            self.release_finished = true;
        }
        self.state = SessionState::Offline;
        self.outgoing.clear();
        self.resolve(None, RequestOutcome::PeerLost);
    }

    /// The worker is about to exit, either after a release or because the
    /// transport is unusable.
    pub fn abort(&mut self) {
        self.state = SessionState::Offline;
        self.stopped = true;
        self.outgoing.clear();
        self.resolve(None, RequestOutcome::Aborted);
    }

    /// True once the worker has exited; nothing queued will be sent.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn resolve(&mut self, id: Option<MessageId>, outcome: RequestOutcome) {
        self.pending.retain(|(pending, tx)| {
            if id.is_none_or(|id| id == *pending) {
                let _ = tx.send(outcome);
                false
            } else {
                true
            }
        });
    }
}
