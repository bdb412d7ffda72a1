//! Device handle: one bound capture device and its background sessions.
//!
//! All device access (reads and settings swaps) happens under a single
//! per-handle lock held only for the device call. Sessions never touch the
//! device themselves; they receive copies of frames from the handle's
//! acquisition thread, see [`crate::session`].

use chrono::Utc;
use crossbeam_channel::Sender;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::device::{CaptureDevice, DeviceBackend};
use crate::error::SessionKind;
use crate::frame::{Frame, Photo, conform};
use crate::session::{self, Worker};
use crate::settings::CameraSettings;
use crate::state::CameraState;
use crate::video::AviWriter;
use crate::{OurError, OurResult};

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| {
        error!("{what} mutex poisoned: {e}");
        e.into_inner()
    })
}

/// Read-only snapshot returned by [`CameraHandle::info`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Device index the handle was opened with
    pub index: u32,
    /// Backend name of the device
    pub device_name: String,
    /// Settings currently applied
    pub settings: CameraSettings,
    pub state: CameraState,
    /// Frames handed to stream callbacks over the handle's lifetime
    pub frames_streamed: u64,
    /// Frames written to recordings over the handle's lifetime
    pub frames_recorded: u64,
    /// Output of the active recording
    pub recording_path: Option<PathBuf>,
    /// Most recent failure inside a background session
    pub last_error: Option<String>,
}

struct SessionTap {
    id: u64,
    tx: Sender<Frame>,
}

#[derive(Default)]
struct Taps {
    stream: Option<SessionTap>,
    record: Option<SessionTap>,
    reader_running: bool,
}

impl Taps {
    fn slot(&mut self, kind: SessionKind) -> &mut Option<SessionTap> {
        match kind {
            SessionKind::Stream => &mut self.stream,
            SessionKind::Record => &mut self.record,
        }
    }

    fn is_empty(&self) -> bool {
        self.stream.is_none() && self.record.is_none()
    }
}

/// State shared between a handle and its background threads.
///
/// Lock order: `state` before `taps`. `device` is never held together with
/// either of them.
pub(crate) struct Shared {
    pub(crate) index: u32,
    device_name: String,
    device: Mutex<Option<Box<dyn CaptureDevice>>>,
    settings: RwLock<Arc<CameraSettings>>,
    state: Mutex<CameraState>,
    taps: Mutex<Taps>,
    /// Set once the binding is released; the next device call drops the device
    evicted: AtomicBool,
    next_session: AtomicU64,
    pub(crate) frames_streamed: AtomicU64,
    pub(crate) frames_recorded: AtomicU64,
    recording_path: Mutex<Option<PathBuf>>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    pub(crate) fn settings(&self) -> Arc<CameraSettings> {
        self.settings
            .read()
            .unwrap_or_else(|e| {
                error!("Settings lock poisoned: {e}");
                e.into_inner()
            })
            .clone()
    }

    fn state(&self) -> CameraState {
        *lock(&self.state, "Camera state")
    }

    fn released_error(&self) -> OurError {
        OurError::DeviceUnavailable(format!("Camera {} has been released", self.index))
    }

    /// Device lock, refused once the binding is released so callers never queue behind a stuck read
    fn device(&self) -> OurResult<MutexGuard<'_, Option<Box<dyn CaptureDevice>>>> {
        if self.evicted.load(Ordering::SeqCst) {
            return Err(self.released_error());
        }
        Ok(lock(&self.device, "Device"))
    }

    /// One exclusive device read, conformed to the settings it was read under
    pub(crate) fn read_frame(&self) -> OurResult<(RgbImage, Arc<CameraSettings>)> {
        let (result, settings) = {
            let mut device = self.device()?;
            let Some(dev) = device.as_mut() else {
                return Err(self.released_error());
            };
            let settings = self.settings();
            let result = dev.read();
            if self.evicted.load(Ordering::SeqCst) {
                device.take();
                debug!("Dropped device of camera {} after pending read", self.index);
            }
            (result, settings)
        };

        let image = result?;
        if image.width() == 0 || image.height() == 0 {
            return Err(OurError::ReadFailure(format!(
                "Camera {} returned an empty frame",
                self.index
            )));
        }
        Ok((conform(image, settings.resolution()), settings))
    }

    /// Offer a frame to every active session; `false` once none remain
    pub(crate) fn dispatch(&self, frame: Frame) -> bool {
        let mut taps = lock(&self.taps, "Session taps");
        for kind in [SessionKind::Stream, SessionKind::Record] {
            let slot = taps.slot(kind);
            if let Some(tap) = slot.as_ref()
                && !session::offer(&tap.tx, frame.clone(), kind)
            {
                debug!("{kind} session consumer of camera {} is gone", self.index);
                *slot = None;
            }
        }
        if taps.is_empty() {
            taps.reader_running = false;
            return false;
        }
        true
    }

    /// End a session from its own thread; ignored if `session` was already replaced
    pub(crate) fn end_session(&self, kind: SessionKind, session: u64, reason: Option<String>) {
        let current = {
            let mut state = lock(&self.state, "Camera state");
            let mut taps = lock(&self.taps, "Session taps");
            let slot = taps.slot(kind);
            let current = slot.as_ref().is_some_and(|tap| tap.id == session);
            if current {
                *slot = None;
                *state = state.stop(kind);
            }
            current
        };
        if current && kind == SessionKind::Record {
            lock(&self.recording_path, "Recording path").take();
        }
        if let Some(reason) = reason {
            self.record_error(reason);
        }
    }

    /// Device failure: every session ends and the handle returns to idle
    pub(crate) fn fail_all_sessions(&self, reason: String) {
        {
            let mut state = lock(&self.state, "Camera state");
            let mut taps = lock(&self.taps, "Session taps");
            taps.stream = None;
            taps.record = None;
            taps.reader_running = false;
            if !state.is_released() {
                *state = CameraState::Idle;
            }
        }
        lock(&self.recording_path, "Recording path").take();
        self.record_error(reason);
    }

    pub(crate) fn record_error(&self, reason: String) {
        *lock(&self.last_error, "Last error") = Some(reason);
    }

    /// Drop the device binding now if it is free, otherwise after the pending read
    fn evict_device(&self) {
        self.evicted.store(true, Ordering::SeqCst);
        match self.device.try_lock() {
            Ok(mut device) => {
                device.take();
            }
            Err(TryLockError::Poisoned(e)) => {
                e.into_inner().take();
            }
            Err(TryLockError::WouldBlock) => {
                warn!(
                    "Camera {} device is busy, it will be released when the pending read returns",
                    self.index
                );
            }
        }
    }
}

#[derive(Default)]
struct Control {
    reader: Option<Worker>,
    stream: Option<Worker>,
    record: Option<Worker>,
}

impl Control {
    fn slot(&mut self, kind: SessionKind) -> &mut Option<Worker> {
        match kind {
            SessionKind::Stream => &mut self.stream,
            SessionKind::Record => &mut self.record,
        }
    }
}

/// Exclusive binding to one capture device.
///
/// Dropping the handle releases it.
pub struct CameraHandle {
    shared: Arc<Shared>,
    /// Serializes start, stop and release
    control: Mutex<Control>,
    photo_sequence: AtomicU64,
    stop_timeout: Duration,
    frame_queue_depth: usize,
    jpeg_quality: u8,
}

impl std::fmt::Debug for CameraHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraHandle")
            .field("index", &self.shared.index)
            .field("device", &self.shared.device_name)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl CameraHandle {
    /// Open the USB camera at `index` with default controller configuration
    #[cfg(feature = "usb")]
    pub fn open(index: u32, settings: CameraSettings) -> OurResult<Self> {
        Self::open_with(
            &crate::usb_camera::UsbBackend::new()?,
            index,
            settings,
            &ControllerConfig::default(),
        )
    }

    /// Open the device at `index` on `backend` and apply `settings` to it
    pub fn open_with(
        backend: &dyn DeviceBackend,
        index: u32,
        settings: CameraSettings,
        config: &ControllerConfig,
    ) -> OurResult<Self> {
        config.validate()?;
        let device = backend.open(index, &settings)?;
        let device_name = device.name();

        info!(
            "Opened camera {index} ({device_name}) at {}@{}fps",
            settings.resolution(),
            settings.fps()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                index,
                device_name,
                device: Mutex::new(Some(device)),
                settings: RwLock::new(Arc::new(settings)),
                state: Mutex::new(CameraState::Idle),
                taps: Mutex::new(Taps::default()),
                evicted: AtomicBool::new(false),
                next_session: AtomicU64::new(0),
                frames_streamed: AtomicU64::new(0),
                frames_recorded: AtomicU64::new(0),
                recording_path: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            control: Mutex::new(Control::default()),
            photo_sequence: AtomicU64::new(0),
            stop_timeout: config.stop_timeout(),
            frame_queue_depth: config.frame_queue_depth,
            jpeg_quality: config.jpeg_quality,
        })
    }

    pub fn index(&self) -> u32 {
        self.shared.index
    }

    pub fn state(&self) -> CameraState {
        self.shared.state()
    }

    pub fn settings(&self) -> Arc<CameraSettings> {
        self.shared.settings()
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Capture one frame synchronously, optionally writing it to `path`.
    ///
    /// A failed write is reported in the returned [`Photo`], never by
    /// discarding the frame.
    pub fn capture_photo(&self, path: Option<&Path>) -> OurResult<Photo> {
        let (image, _) = self.shared.read_frame()?;
        let sequence = self.photo_sequence.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new(image, sequence, Utc::now());

        let write = path.map(|path| {
            let result = frame.save(path).map(|()| path.to_path_buf());
            match &result {
                Ok(_) => info!("Photo saved to {}", path.display()),
                Err(e) => warn!("Photo from camera {} not saved: {e}", self.index()),
            }
            result
        });

        debug!(
            "Captured photo {sequence} from camera {} ({}x{})",
            self.index(),
            frame.width(),
            frame.height()
        );
        Ok(Photo::new(frame, write))
    }

    /// Start delivering frames to `callback` on a session thread
    pub fn start_stream<F>(&self, callback: F) -> OurResult<()>
    where
        F: FnMut(Frame) + Send + 'static,
    {
        let mut control = lock(&self.control, "Camera control");
        self.check_can_start(SessionKind::Stream)?;

        self.launch(&mut control, SessionKind::Stream, |shared, id, frames| {
            Worker::spawn(format!("webeye-stream-{}", shared.index), move |stop| {
                session::stream_loop(shared, id, frames, callback, stop)
            })
        })?;

        info!("Streaming started on camera {}", self.index());
        Ok(())
    }

    /// Stop the stream session, waiting at most the stop timeout. No-op when not streaming.
    pub fn stop_stream(&self) {
        let mut control = lock(&self.control, "Camera control");
        self.stop_session(&mut control, SessionKind::Stream);
    }

    /// Start writing frames to an AVI file at `path`.
    ///
    /// The file is created before this returns, so an unwritable path fails
    /// here with [`OurError::WriteFailure`].
    pub fn start_recording(&self, path: &Path) -> OurResult<()> {
        let mut control = lock(&self.control, "Camera control");
        self.check_can_start(SessionKind::Record)?;

        let settings = self.settings();
        let sink = AviWriter::create(
            path,
            settings.resolution(),
            settings.fps(),
            self.jpeg_quality,
        )?;

        self.launch(&mut control, SessionKind::Record, |shared, id, frames| {
            Worker::spawn(format!("webeye-record-{}", shared.index), move |stop| {
                session::record_loop(shared, id, frames, sink, stop)
            })
        })?;
        *lock(&self.shared.recording_path, "Recording path") = Some(path.to_path_buf());

        info!(
            "Recording started on camera {} to {}",
            self.index(),
            path.display()
        );
        Ok(())
    }

    /// Stop the record session and finalize the file. No-op when not recording.
    pub fn stop_recording(&self) {
        let mut control = lock(&self.control, "Camera control");
        self.stop_session(&mut control, SessionKind::Record);
    }

    /// Swap in a new settings snapshot.
    ///
    /// Frames read after this returns reflect `settings`; a read already in
    /// progress may still use the previous snapshot.
    pub fn update_settings(&self, settings: CameraSettings) -> OurResult<()> {
        let mut device = self.shared.device()?;
        let dev = device
            .as_mut()
            .ok_or_else(|| self.shared.released_error())?;
        dev.apply(&settings)?;

        info!(
            "Camera {} settings updated to {}@{}fps",
            self.index(),
            settings.resolution(),
            settings.fps()
        );
        *self.shared.settings.write().unwrap_or_else(|e| {
            error!("Settings lock poisoned: {e}");
            e.into_inner()
        }) = Arc::new(settings);
        Ok(())
    }

    pub fn info(&self) -> CameraInfo {
        CameraInfo {
            index: self.index(),
            device_name: self.shared.device_name.clone(),
            settings: (*self.settings()).clone(),
            state: self.state(),
            frames_streamed: self.shared.frames_streamed.load(Ordering::Relaxed),
            frames_recorded: self.shared.frames_recorded.load(Ordering::Relaxed),
            recording_path: lock(&self.shared.recording_path, "Recording path").clone(),
            last_error: lock(&self.shared.last_error, "Last error").clone(),
        }
    }

    /// Stop every session and free the device. Safe to call repeatedly.
    pub fn release(&self) {
        let mut control = lock(&self.control, "Camera control");
        if self.state().is_released() {
            return;
        }

        let deadline = Instant::now() + self.stop_timeout;
        let mut workers: Vec<Worker> = [
            control.stream.take(),
            control.record.take(),
            control.reader.take(),
        ]
        .into_iter()
        .flatten()
        .collect();
        for worker in &mut workers {
            worker.request_stop();
        }

        {
            let mut state = lock(&self.shared.state, "Camera state");
            let mut taps = lock(&self.shared.taps, "Session taps");
            taps.stream = None;
            taps.record = None;
            taps.reader_running = false;
            *state = CameraState::Released;
        }

        let clean = workers
            .into_iter()
            .fold(true, |clean, worker| worker.shutdown_by(deadline) && clean);
        if !clean {
            self.shared.record_error(format!(
                "Sessions did not stop within {:?} during release",
                self.stop_timeout
            ));
        }

        self.shared.evict_device();
        lock(&self.shared.recording_path, "Recording path").take();
        info!("Released camera {}", self.index());
    }

    fn check_can_start(&self, kind: SessionKind) -> OurResult<()> {
        self.state().start(kind)?;
        if self.shared.evicted.load(Ordering::SeqCst) {
            return Err(OurError::DeviceUnavailable(format!(
                "Camera {} device was force-released",
                self.index()
            )));
        }
        Ok(())
    }

    /// Commit the `kind` transition, spawn its session thread, attach it to acquisition
    fn launch<S>(&self, control: &mut Control, kind: SessionKind, spawn: S) -> OurResult<()>
    where
        S: FnOnce(Arc<Shared>, u64, crossbeam_channel::Receiver<Frame>) -> OurResult<Worker>,
    {
        // a previous session of this kind that ended on its own
        if let Some(old) = control.slot(kind).take() {
            old.shutdown_by(Instant::now() + self.stop_timeout);
        }

        {
            let mut state = lock(&self.shared.state, "Camera state");
            *state = state.start(kind)?;
        }

        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::bounded(self.frame_queue_depth);
        let worker = match spawn(self.shared.clone(), id, rx) {
            Ok(worker) => worker,
            Err(e) => {
                let mut state = lock(&self.shared.state, "Camera state");
                *state = state.stop(kind);
                return Err(e);
            }
        };
        *control.slot(kind) = Some(worker);

        let needs_reader = {
            let mut taps = lock(&self.shared.taps, "Session taps");
            *taps.slot(kind) = Some(SessionTap { id, tx });
            !std::mem::replace(&mut taps.reader_running, true)
        };

        if needs_reader {
            if let Some(old) = control.reader.take() {
                old.shutdown_by(Instant::now() + self.stop_timeout);
            }
            let shared = self.shared.clone();
            match Worker::spawn(format!("webeye-acquire-{}", self.index()), move |stop| {
                session::acquisition_loop(shared, stop)
            }) {
                Ok(reader) => control.reader = Some(reader),
                Err(e) => {
                    self.shared.end_session(kind, id, None);
                    lock(&self.shared.taps, "Session taps").reader_running = false;
                    if let Some(worker) = control.slot(kind).take() {
                        worker.shutdown_by(Instant::now() + self.stop_timeout);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn stop_session(&self, control: &mut Control, kind: SessionKind) {
        let deadline = Instant::now() + self.stop_timeout;
        let mut worker = control.slot(kind).take();
        if let Some(worker) = worker.as_mut() {
            worker.request_stop();
        }

        let reader_idle = {
            let mut state = lock(&self.shared.state, "Camera state");
            let mut taps = lock(&self.shared.taps, "Session taps");
            *taps.slot(kind) = None;
            *state = state.stop(kind);
            if taps.is_empty() {
                taps.reader_running = false;
                true
            } else {
                false
            }
        };
        if kind == SessionKind::Record {
            lock(&self.shared.recording_path, "Recording path").take();
        }

        let mut reader = if reader_idle { control.reader.take() } else { None };
        if let Some(reader) = reader.as_mut() {
            reader.request_stop();
        }

        // only the reader touches the device
        if let Some(reader) = reader
            && !reader.shutdown_by(deadline)
        {
            error!(
                "Acquisition on camera {} did not stop within {:?}, force-releasing the device",
                self.index(),
                self.stop_timeout
            );
            self.shared.record_error(format!(
                "Device read did not return within {:?}; device force-released",
                self.stop_timeout
            ));
            self.shared.evict_device();
        }

        let Some(worker) = worker else {
            return;
        };
        if worker.shutdown_by(deadline) {
            info!("{kind} session stopped on camera {}", self.index());
        } else {
            warn!(
                "{kind} session on camera {} did not stop within {:?}, detached it",
                self.index(),
                self.stop_timeout
            );
            self.shared.record_error(format!(
                "{kind} session did not stop within {:?}; detached",
                self.stop_timeout
            ));
        }
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        self.release();
    }
}
