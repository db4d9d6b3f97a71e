use crate::channel::ControlChannel;
use crate::errors::IpcError;
use crate::frame_buffer::SharedFrameBuffer;
use crate::heartbeat::HeartbeatTimer;
use crate::import::MemoryImporter;
use crate::message::{MessageId, ServerMessage, WireMessage};
use crate::session::Shared;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub(crate) const WORKER_THREAD_NAME: &str = "camera-ipc";

/// Event loop that owns the control channel.
///
/// Sends what callers queued, applies acknowledgements and buffer announces,
/// keeps the server alive with heartbeats and re-registers after the server
/// restarts.
pub(crate) struct IpcWorker {
    shared: Arc<Shared>,
    channel: ControlChannel,
    importer: Box<dyn MemoryImporter>,
    heartbeat: HeartbeatTimer,
    reconnect: HeartbeatTimer,
    peer_lost: bool,
}

impl IpcWorker {
    pub fn new(
        shared: Arc<Shared>,
        channel: ControlChannel,
        importer: Box<dyn MemoryImporter>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            shared,
            channel,
            importer,
            heartbeat: HeartbeatTimer::new(heartbeat_interval),
            reconnect: HeartbeatTimer::new(heartbeat_interval),
            peer_lost: false,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        tracing::info!("IPC worker started");

        let result = self.event_loop();
        match &result {
            Ok(()) => tracing::info!("Camera client released"),
            Err(e) => tracing::error!(error = %e, "IPC worker stopped"),
        }

        let IpcWorker {
            shared, channel, ..
        } = self;

        shared.frames.lock().unmap();
        drop(channel);

        shared.requests.lock().abort();
        shared.changed.notify_all();
    }

    fn event_loop(&mut self) -> Result<(), IpcError> {
        loop {
            let want_write = {
                let requests = self.shared.requests.lock();
                if requests.release_finished(self.shared.release_timeout) {
                    return Ok(());
                }
                requests.has_outgoing()
            };

            let revents = self.wait(want_write)?;

            if revents.contains(PollFlags::POLLOUT) {
                self.flush()?;
            }
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLERR) {
                self.receive();
            }

            self.tick(Instant::now());
        }
    }

    fn wait(&self, want_write: bool) -> Result<PollFlags, IpcError> {
        let mut events = PollFlags::POLLIN;
        if want_write {
            events |= PollFlags::POLLOUT;
        }

        let remaining = self.heartbeat.remaining(Instant::now());
        let timeout = PollTimeout::from(remaining.as_millis().min(u128::from(u16::MAX)) as u16);

        loop {
            let mut fds = [PollFd::new(self.channel.as_fd(), events)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(PollFlags::empty()),
                Ok(_) => return Ok(fds[0].revents().unwrap_or(PollFlags::empty())),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(IpcError::Nix(e)),
            }
        }
    }

    fn flush(&mut self) -> Result<(), IpcError> {
        let batch = self.shared.requests.lock().take_outgoing();

        for msg in batch {
            match self.channel.send(&msg) {
                Ok(()) => tracing::trace!(message = ?msg.id, "Sent message"),
                Err(e) if e.is_peer_loss() => {
                    self.on_peer_lost(&e);
                    break;
                }
                Err(e @ IpcError::ShortWrite { .. }) => return Err(e),
                Err(e) => tracing::error!(message = ?msg.id, error = %e, "Send failed, dropping message"),
            }
        }

        Ok(())
    }

    fn receive(&mut self) {
        if let Err(e) = self.channel.receive_nonblocking() {
            tracing::error!(error = %e, "Receive failed");
        }

        for msg in self.channel.drain_received() {
            self.dispatch(msg);
        }
    }

    fn dispatch(&mut self, msg: WireMessage) {
        match ServerMessage::try_from(msg) {
            Ok(ServerMessage::Status { acked }) => {
                let mut requests = self.shared.requests.lock();
                if requests.apply_ack(acked) {
                    tracing::info!(state = requests.state().as_str(), acked = ?acked, "Session state changed");
                }
                drop(requests);
                self.shared.changed.notify_all();
            }
            Ok(ServerMessage::Buffer { fd, size }) => self.replace_buffer(fd, size),
            Ok(ServerMessage::Heartbeat) => tracing::trace!("Server heartbeat"),
            Err(e) => tracing::warn!(error = %e, "Dropping message"),
        }
    }

    fn replace_buffer(&mut self, fd: OwnedFd, size: u32) {
        // Map outside the frame lock; readers keep using the old buffer
        let buffer = self
            .importer
            .import(fd, size as usize)
            .and_then(SharedFrameBuffer::new);

        let mut frames = self.shared.frames.lock();
        match buffer {
            Ok(buffer) => {
                tracing::info!(
                    size,
                    frame_count = buffer.frame_count(),
                    frame_size = buffer.frame_size(),
                    "Mapped shared frame buffer"
                );
                frames.replace(Some(buffer));
            }
            Err(e) => {
                tracing::error!(size, error = %e, "Failed to map shared frame buffer");
                frames.replace(None);
            }
        }
    }

    fn on_peer_lost(&mut self, cause: &IpcError) {
        if !self.peer_lost {
            tracing::warn!(error = %cause, "Camera server lost, re-registering when it returns");
        }
        self.peer_lost = true;

        // Unmap first so anyone seeing Offline also sees no buffer
        self.shared.frames.lock().unmap();
        self.shared.requests.lock().on_peer_lost();
        self.shared.changed.notify_all();
    }

    fn tick(&mut self, now: Instant) {
        let mut requests = self.shared.requests.lock();

        match requests.send_pending_start() {
            Ok(true) => {
                tracing::info!("Requesting start");
                self.shared.changed.notify_all();
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Deferred start not queued"),
        }

        let heartbeat_due = self.heartbeat.due(now);
        if heartbeat_due && !self.peer_lost {
            let msg = WireMessage::new(MessageId::Heartbeat, requests.client_id());
            if let Err(e) = requests.enqueue(msg) {
                tracing::debug!(error = %e, "Heartbeat not queued");
            }
        }

        if self.peer_lost && self.reconnect.due(now) {
            match self.channel.reconnect() {
                Ok(()) => {
                    tracing::info!("Reconnected to camera server");
                    self.peer_lost = false;
                    if let Err(e) = requests.register() {
                        tracing::warn!(error = %e, "Register not queued");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Camera server still unavailable"),
            }
        }
    }
}
