use crate::channel::ControlChannel;
use crate::config::ClientConfig;
use crate::errors::IpcError;
use crate::frame::{FrameState, FrameView};
use crate::import::MemoryImporter;
use crate::layout::PixelFormat;
use crate::message::CameraParams;
use crate::power::PowerController;
use crate::protocol::{RequestState, SessionState, Ticket};
use crate::worker::IpcWorker;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// State shared between a session and its IPC worker.
///
/// Request-side and frame-side data sit behind separate locks so frame
/// acquisition never waits on control traffic. Neither lock is ever held
/// while taking the other.
pub(crate) struct Shared {
    pub requests: Mutex<RequestState>,
    pub changed: Condvar,
    pub frames: Mutex<FrameState>,
    pub release_timeout: Duration,
}

/// A registered client of the camera server.
///
/// Created by [`ClientSession::init`], which connects the control channel and
/// starts the IPC worker. All methods take `&self` and return immediately;
/// state changes happen on the worker once the server acknowledges them.
pub struct ClientSession {
    shared: Arc<Shared>,
    power: Mutex<PowerController>,
    worker: Mutex<Option<JoinHandle<()>>>,
    client_id: u32,
    destroyed: AtomicBool,
}

fn default_importer() -> Box<dyn MemoryImporter> {
    #[cfg(feature = "ion")]
    {
        Box::new(crate::import::IonImporter::default())
    }
    #[cfg(not(feature = "ion"))]
    {
        Box::new(crate::import::DmaBufImporter)
    }
}

impl ClientSession {
    /// Set up the standby GPIO (camera awake), connect to the server and
    /// queue the registration.
    pub fn init(config: ClientConfig) -> Result<Self, IpcError> {
        let power = PowerController::sysfs(&config.gpio_sysfs_root, config.pwdn_pin)?;
        Self::init_with(config, default_importer(), power)
    }

    pub fn init_with(
        config: ClientConfig,
        importer: Box<dyn MemoryImporter>,
        power: PowerController,
    ) -> Result<Self, IpcError> {
        let channel =
            ControlChannel::connect(&config.client_socket_path, &config.server_socket_path)?;

        let mut requests = RequestState::new(config.client_id);
        requests.register()?;

        let shared = Arc::new(Shared {
            requests: Mutex::new(requests),
            changed: Condvar::new(),
            frames: Mutex::new(FrameState::default()),
            release_timeout: config.release_timeout,
        });

        let worker = IpcWorker::new(
            Arc::clone(&shared),
            channel,
            importer,
            config.heartbeat_interval,
        )
        .spawn()?;

        tracing::info!(client_id = config.client_id, "Camera client initialized");

        Ok(Self {
            shared,
            power: Mutex::new(power),
            worker: Mutex::new(Some(worker)),
            client_id: config.client_id,
            destroyed: AtomicBool::new(false),
        })
    }

    fn requests<T>(
        &self,
        f: impl FnOnce(&mut RequestState) -> Result<T, IpcError>,
    ) -> Result<T, IpcError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(IpcError::Destroyed);
        }
        let mut requests = self.shared.requests.lock();
        if requests.is_stopped() {
            return Err(IpcError::InvalidState(requests.state()));
        }
        let result = f(&mut requests);
        drop(requests);
        self.shared.changed.notify_all();
        result
    }

    /// Request streaming. Deferred until registration completes.
    pub fn start(&self) -> Result<Ticket, IpcError> {
        self.requests(|r| r.start())
    }

    pub fn stop(&self) -> Result<Ticket, IpcError> {
        self.requests(|r| r.stop())
    }

    /// Unregister from the server. The worker tears the session down once
    /// the server acknowledges or the release timeout passes; then
    /// [`ClientSession::destroy`] succeeds.
    pub fn release(&self) -> Result<Ticket, IpcError> {
        self.requests(|r| r.release())
    }

    /// Join the worker if it has finished. Returns false while a release is
    /// still in progress.
    pub fn destroy(&self) -> bool {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                tracing::error!("IPC worker panicked");
            }
        }

        self.destroyed.store(true, Ordering::Release);
        // Frames are unmapped by the worker; this covers a worker that panicked
        self.shared.frames.lock().unmap();
        true
    }

    /// Put the sensor into standby, or wake it.
    ///
    /// While paused no frame is handed out. Every frame captured before the
    /// pause is invalidated, so none of them appears after resuming either.
    pub fn pause(&self, paused: bool) -> Result<(), IpcError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(IpcError::Destroyed);
        }

        self.power.lock().set_standby(paused)?;

        let mut frames = self.shared.frames.lock();
        if paused {
            frames.pause();
        } else {
            frames.resume();
        }
        Ok(())
    }

    fn send_params(&self, params: CameraParams) -> Result<(), IpcError> {
        let msg = params.to_message(self.client_id);
        self.requests(|r| r.enqueue(msg))
    }

    pub fn set_exposure(&self, exposure_ms: u16, gain: f32) -> Result<(), IpcError> {
        self.send_params(CameraParams::Exposure { exposure_ms, gain })
    }

    pub fn set_white_balance(&self, r_gain: f32, g_gain: f32, b_gain: f32) -> Result<(), IpcError> {
        self.send_params(CameraParams::WhiteBalance {
            r_gain,
            g_gain,
            b_gain,
        })
    }

    /// Change the pixel format. The server frees and re-announces the
    /// buffer, so every free slot is locked first to keep the producer out
    /// of memory that is about to go away. The next acquire gives those
    /// locks back if no new buffer turns up.
    pub fn set_capture_format(&self, format: PixelFormat) -> Result<(), IpcError> {
        if !self.destroyed.load(Ordering::Acquire) {
            self.shared.frames.lock().lock_all();
        }
        self.send_params(CameraParams::CaptureFormat(format))
    }

    pub fn set_capture_snapshot(&self, start: bool) -> Result<(), IpcError> {
        self.send_params(CameraParams::Snapshot(start))
    }

    /// Lock the frame closest to, but not after, `timestamp` (monotonic ns;
    /// 0 = most recent). `None` means no new frame is available.
    pub fn acquire_frame(&self, timestamp: u64) -> Option<FrameView> {
        if self.destroyed.load(Ordering::Acquire) {
            return None;
        }
        let _s = common::span_debug!("acquire_frame");
        self.shared.frames.lock().acquire(timestamp)
    }

    /// Hand an acquired frame back to the server. Unknown ids are ignored.
    pub fn release_frame(&self, frame_id: u32) -> bool {
        self.shared.frames.lock().release(frame_id)
    }

    pub fn status(&self) -> SessionState {
        if self.destroyed.load(Ordering::Acquire) {
            return SessionState::Offline;
        }
        self.shared.requests.lock().state()
    }

    /// Block until the session reaches `state` or `timeout` passes.
    pub fn wait_for_status(&self, state: SessionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut requests = self.shared.requests.lock();
        while requests.state() != state {
            if self
                .shared
                .changed
                .wait_until(&mut requests, deadline)
                .timed_out()
            {
                return requests.state() == state;
            }
        }
        true
    }

    pub fn has_buffer(&self) -> bool {
        self.shared.frames.lock().has_buffer()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if self.worker.get_mut().is_none() {
            return;
        }
        // Let the worker unregister and exit on its own
        let mut requests = self.shared.requests.lock();
        if requests.is_stopped() || requests.release_requested() {
            return;
        }
        if let Err(e) = requests.release() {
            tracing::warn!(error = %e, "Release on drop not queued");
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("client_id", &self.client_id)
            .field("state", &self.status())
            .finish()
    }
}
