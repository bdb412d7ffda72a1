//! Background threads of a camera handle.
//!
//! Each handle runs at most one acquisition thread, the only thread that
//! reads the device while sessions are active. It fans a copy of every frame
//! out to the stream session thread and the record session thread through
//! bounded queues. A full queue drops the frame for that consumer only, so a
//! slow callback or a slow disk never holds up the other session.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::OurResult;
use crate::error::SessionKind;
use crate::frame::Frame;
use crate::handle::Shared;
use crate::video::AviWriter;

/// Cooperative cancellation observed by a worker thread.
///
/// Raised when the owning [`Worker`] drops its end of the channel.
pub(crate) struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    pub(crate) fn is_raised(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `duration`, returning early with `true` if stop is raised
    pub(crate) fn wait(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.is_raised();
        }
        matches!(
            self.rx.recv_timeout(duration),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

/// A named thread with a stop signal and a bounded join
pub(crate) struct Worker {
    name: String,
    stop: Option<Sender<()>>,
    done: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: String, body: F) -> OurResult<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            // disconnects `done` when the thread exits, including by panic
            let _done = done_tx;
            body(StopSignal { rx: stop_rx });
        })?;

        Ok(Self {
            name,
            stop: Some(stop_tx),
            done: done_rx,
            thread: Some(thread),
        })
    }

    pub(crate) fn request_stop(&mut self) {
        self.stop.take();
    }

    /// Raise stop and wait for the thread until `deadline`.
    ///
    /// Returns `false` if the thread was still running at the deadline; it is
    /// then detached and left to finish on its own.
    pub(crate) fn shutdown_by(mut self, deadline: Instant) -> bool {
        self.request_stop();
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("{} did not stop within the timeout, detaching it", self.name);
                false
            }
            _ => {
                if let Some(thread) = self.thread.take()
                    && thread.join().is_err()
                {
                    warn!("{} panicked", self.name);
                }
                debug!("{} stopped", self.name);
                true
            }
        }
    }
}

/// Read frames and fan them out until stopped, out of consumers, or the device fails
pub(crate) fn acquisition_loop(shared: Arc<Shared>, stop: StopSignal) {
    info!("Acquisition started on camera {}", shared.index);
    let mut frames = 0u64;

    loop {
        if stop.is_raised() {
            break;
        }

        let started = Instant::now();
        let (image, settings) = match shared.read_frame() {
            Ok(read) => read,
            Err(e) => {
                error!("Camera {} read failed, ending sessions: {e}", shared.index);
                shared.fail_all_sessions(e.to_string());
                return;
            }
        };
        frames += 1;

        if !shared.dispatch(Frame::new(image, 0, Utc::now())) {
            break;
        }

        let remaining = settings.frame_interval().saturating_sub(started.elapsed());
        if stop.wait(remaining) {
            break;
        }
    }

    info!(
        "Acquisition stopped on camera {} after {frames} frames",
        shared.index
    );
}

/// Deliver frames to `callback` in capture order, one call at a time
pub(crate) fn stream_loop<F>(
    shared: Arc<Shared>,
    session: u64,
    frames: Receiver<Frame>,
    mut callback: F,
    stop: StopSignal,
) where
    F: FnMut(Frame),
{
    let mut sequence = 0u64;

    while let Ok(frame) = frames.recv() {
        if stop.is_raised() {
            break;
        }

        let frame = frame.with_sequence(sequence);
        if panic::catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
            error!(
                "Stream callback panicked on camera {}, ending stream session",
                shared.index
            );
            shared.end_session(
                SessionKind::Stream,
                session,
                Some("stream callback panicked".to_string()),
            );
            return;
        }

        sequence += 1;
        shared.frames_streamed.fetch_add(1, Ordering::Relaxed);
    }

    debug!(
        "Stream session {session} on camera {} delivered {sequence} frames",
        shared.index
    );
}

/// Maps capture times onto the fixed frame slots of a recording.
///
/// The container plays back at the rate fixed when recording started, while
/// frames arrive at whatever pace acquisition runs at. Each frame is placed
/// in the slot its capture time falls into; earlier slots left empty hold the
/// previous frame, and a frame whose slot is already filled is skipped.
pub(crate) struct FrameClock {
    fps: u32,
    origin: Option<DateTime<Utc>>,
    slots: u64,
}

impl FrameClock {
    pub(crate) fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            origin: None,
            slots: 0,
        }
    }

    fn slot_of(&self, origin: DateTime<Utc>, at: DateTime<Utc>) -> u64 {
        let micros = (at - origin).num_microseconds().unwrap_or(i64::MAX).max(0) as u64;
        micros.saturating_mul(u64::from(self.fps)) / 1_000_000
    }

    /// Slots to fill for a frame captured at `at`, its own included. Zero means skip it.
    pub(crate) fn place(&mut self, at: DateTime<Utc>) -> u64 {
        let Some(origin) = self.origin else {
            self.origin = Some(at);
            self.slots = 1;
            return 1;
        };
        let end = self.slot_of(origin, at) + 1;
        let fill = end.saturating_sub(self.slots);
        self.slots = self.slots.max(end);
        fill
    }

    /// Slots the last frame must still hold for when recording ends at `at`
    pub(crate) fn pad_until(&mut self, at: DateTime<Utc>) -> u64 {
        let Some(origin) = self.origin else {
            return 0;
        };
        let end = self.slot_of(origin, at);
        let fill = end.saturating_sub(self.slots);
        self.slots = self.slots.max(end);
        fill
    }
}

/// Append frames to `sink` until stopped; a write failure ends only this session
pub(crate) fn record_loop(
    shared: Arc<Shared>,
    session: u64,
    frames: Receiver<Frame>,
    mut sink: AviWriter,
    stop: StopSignal,
) {
    let mut clock = FrameClock::new(sink.fps());

    while let Ok(frame) = frames.recv() {
        if stop.is_raised() {
            break;
        }

        let slots = clock.place(frame.captured_at());
        if slots == 0 {
            debug!(
                "Frame captured at {} is ahead of the {}fps recording, skipping it",
                frame.captured_at(),
                sink.fps()
            );
            continue;
        }

        let before = sink.frames_written();
        let result = sink
            .repeat_last(slots - 1)
            .and_then(|()| sink.write_frame(frame.image()));
        shared
            .frames_recorded
            .fetch_add((sink.frames_written() - before) as u64, Ordering::Relaxed);

        if let Err(e) = result {
            error!(
                "Recording to {} failed on camera {}: {e}",
                sink.path().display(),
                shared.index
            );
            shared.end_session(SessionKind::Record, session, Some(e.to_string()));
            if let Err(e) = sink.finish() {
                debug!("Closing failed sink: {e}");
            }
            return;
        }
    }

    let before = sink.frames_written();
    if let Err(e) = sink.repeat_last(clock.pad_until(Utc::now())) {
        warn!("Failed to hold the last frame of {}: {e}", sink.path().display());
    }
    shared
        .frames_recorded
        .fetch_add((sink.frames_written() - before) as u64, Ordering::Relaxed);

    let frames_written = sink.frames_written();
    match sink.finish() {
        Ok(path) => info!(
            "Recording saved to {} ({frames_written} frames)",
            path.display()
        ),
        Err(e) => {
            error!("Failed to finalize recording: {e}");
            shared.record_error(e.to_string());
        }
    }
}

/// Deliver a frame to one consumer without blocking.
///
/// Returns `false` when the consumer has gone away.
pub(crate) fn offer(tx: &Sender<Frame>, frame: Frame, kind: SessionKind) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(frame)) => {
            debug!(
                "{kind} session is behind, dropping frame captured at {}",
                frame.captured_at()
            );
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}
