//! Real-time playback on a dedicated thread

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecFactory, CodecId, DefaultCodecFactory};
use crate::config::PlaybackConfig;
use crate::storage::{FileInputStream, InputStream, NodeType};
use crate::{OniError, Result};

use super::event::Event;
use super::notifications::NodeNotifications;
use super::player::{Player, SeekOrigin};

/// Speed that delivers frames as fast as they can be decoded
pub const SPEED_FASTEST: f64 = 0.0;

/// Speed that delivers one frame per [`PlaybackController::trigger`]
pub const SPEED_MANUAL: f64 = -1.0;

const MAX_SLEEP: Duration = Duration::from_millis(2000);
const IDLE_WAIT: Duration = Duration::from_millis(10);
const CLOSE_TIMEOUT: Duration = Duration::from_millis(3000);
const THREAD_NAME: &str = "oni-playback";

/// What the playback thread is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    /// Not started, stopped, or at the end without repeat
    Idle = 0,
    /// Delivering frames
    Playing = 1,
    /// Serving a seek request
    Seeking = 2,
    /// Thread exited
    Closed = 3,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Playing,
            2 => Self::Seeking,
            _ => Self::Closed,
        }
    }
}

/// State shared between the controller handle and the playback thread
struct Shared {
    running: AtomicBool,
    started: AtomicBool,
    /// Pending seek requests; the playback thread is the only consumer
    seeks: Receiver<SeekRequest>,
    repeat: AtomicBool,
    speed_bits: AtomicU64,
    state: AtomicU8,
    trigger_pending: AtomicBool,
    wake: Event,
}

impl Shared {
    fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PlaybackState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!("Playback state {:?}", state);
        }
    }

    /// Whether a wait on the playback thread should end early
    fn interrupted(&self) -> bool {
        !self.running.load(Ordering::Acquire) || !self.seeks.is_empty()
    }
}

struct SeekRequest {
    node: String,
    frame: u32,
    reply: Sender<Result<()>>,
}

/// Wraps the consumer's notifications and holds each frame back until
/// its time has come
struct PacedNotifications<N> {
    inner: N,
    shared: Arc<Shared>,
    reference: Option<(Instant, u64)>,
    forced_fastest: bool,
}

impl<N> PacedNotifications<N> {
    /// Returns false if close or a seek cut the sleep short
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.shared.interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            self.shared.wake.wait_timeout(deadline - now);
        }
    }

    /// Returns false if close or a seek arrived before a trigger
    fn wait_for_trigger(&self) -> bool {
        loop {
            if self.shared.interrupted() {
                return false;
            }
            if self.shared.trigger_pending.swap(false, Ordering::AcqRel) {
                return true;
            }
            self.shared.wake.wait_timeout(MAX_SLEEP);
        }
    }

    /// Hold the frame stamped `timestamp` until it is due, returning
    /// whether it should still be delivered
    fn sleep_to_timestamp(&mut self, timestamp: u64) -> bool {
        if self.forced_fastest {
            return true;
        }
        let speed = self.shared.speed();
        if speed == SPEED_MANUAL {
            return self.wait_for_trigger();
        }
        if speed <= SPEED_FASTEST {
            return true;
        }

        let Some((start, reference)) = self.reference else {
            self.reference = Some((Instant::now(), timestamp));
            return true;
        };
        let mut due_now = true;
        if timestamp > reference {
            let due = Duration::from_secs_f64((timestamp - reference) as f64 / 1_000_000.0 / speed);
            let elapsed = start.elapsed();
            if due > elapsed {
                due_now = self.sleep((due - elapsed).min(MAX_SLEEP));
            }
            self.reference = Some((Instant::now(), timestamp));
        }
        due_now
    }
}

impl<N: NodeNotifications> NodeNotifications for PacedNotifications<N> {
    fn on_node_added(&mut self, name: &str, node_type: NodeType, codec: CodecId, frames: u32) {
        self.inner.on_node_added(name, node_type, codec, frames);
    }

    fn on_node_removed(&mut self, name: &str) {
        self.inner.on_node_removed(name);
    }

    fn on_node_int_prop_changed(&mut self, name: &str, property: &str, value: u64) {
        self.inner.on_node_int_prop_changed(name, property, value);
    }

    fn on_node_real_prop_changed(&mut self, name: &str, property: &str, value: f64) {
        self.inner.on_node_real_prop_changed(name, property, value);
    }

    fn on_node_string_prop_changed(&mut self, name: &str, property: &str, value: &str) {
        self.inner.on_node_string_prop_changed(name, property, value);
    }

    fn on_node_general_prop_changed(&mut self, name: &str, property: &str, value: &[u8]) {
        self.inner.on_node_general_prop_changed(name, property, value);
    }

    fn on_node_state_ready(&mut self, name: &str) {
        self.inner.on_node_state_ready(name);
    }

    fn on_node_new_data(&mut self, name: &str, timestamp: u64, frame: u32, data: &[u8]) {
        // A frame whose wait was cut short is dropped; the seek or close
        // that interrupted it decides what the consumer sees next.
        if self.sleep_to_timestamp(timestamp) {
            self.inner.on_node_new_data(name, timestamp, frame, data);
        }
    }

    fn on_end_of_file_reached(&mut self) {
        self.reference = None;
        self.inner.on_end_of_file_reached();
    }
}

type PacedPlayer<N> = Player<PacedNotifications<N>>;

/// Drives a [`Player`] in real time on its own thread
///
/// Nodes present before the first frame are announced during
/// [`PlaybackController::open`]; frames flow once [`PlaybackController::start`]
/// is called.
pub struct PlaybackController<N: NodeNotifications + Send + 'static> {
    shared: Arc<Shared>,
    seek_tx: Sender<SeekRequest>,
    seek_gate: Mutex<()>,
    done_rx: Option<Receiver<Result<N>>>,
    handle: Option<JoinHandle<()>>,
}

impl<N: NodeNotifications + Send + 'static> PlaybackController<N> {
    /// Open the recording at `path` and start the playback thread
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, the recording cannot
    /// be opened, or the thread cannot be spawned
    pub fn open(path: impl AsRef<Path>, config: &PlaybackConfig, notifications: N) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening {} for playback", path.display());
        Self::from_stream(
            Box::new(FileInputStream::new(path)),
            Box::new(DefaultCodecFactory),
            config,
            notifications,
        )
    }

    /// Play back from any input stream with any codec factory
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, the recording cannot
    /// be opened, or the thread cannot be spawned
    pub fn from_stream(
        stream: Box<dyn InputStream>,
        factory: Box<dyn CodecFactory>,
        config: &PlaybackConfig,
        notifications: N,
    ) -> Result<Self> {
        config.validate()?;
        let (seek_tx, seek_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            started: AtomicBool::new(false),
            seeks: seek_rx,
            repeat: AtomicBool::new(config.repeat),
            speed_bits: AtomicU64::new(config.speed.to_bits()),
            state: AtomicU8::new(PlaybackState::Idle as u8),
            trigger_pending: AtomicBool::new(false),
            wake: Event::new(),
        });

        let paced = PacedNotifications {
            inner: notifications,
            shared: Arc::clone(&shared),
            reference: None,
            forced_fastest: false,
        };
        let player = Player::open_with_config(stream, factory, paced, config)?;

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || {
                    let result = run(player, &shared);
                    shared.set_state(PlaybackState::Closed);
                    done_tx.send(result).ok();
                }
            })?;

        Ok(Self {
            shared,
            seek_tx,
            seek_gate: Mutex::new(()),
            done_rx: Some(done_rx),
            handle: Some(handle),
        })
    }

    /// Begin or resume delivering frames
    pub fn start(&self) {
        self.shared.started.store(true, Ordering::Release);
        self.shared.wake.set();
    }

    /// Pause frame delivery
    pub fn stop(&self) {
        self.shared.started.store(false, Ordering::Release);
    }

    /// Current state of the playback thread
    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Current playback speed
    pub fn speed(&self) -> f64 {
        self.shared.speed()
    }

    /// Change the playback speed: 1.0 is real time, [`SPEED_FASTEST`] does
    /// not pace, [`SPEED_MANUAL`] waits for [`PlaybackController::trigger`]
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` for a negative speed other than manual
    pub fn set_speed(&self, speed: f64) -> Result<()> {
        if !speed.is_finite() || (speed < SPEED_FASTEST && speed != SPEED_MANUAL) {
            return Err(OniError::BadParameter(format!("invalid speed {speed}")));
        }
        self.shared.speed_bits.store(speed.to_bits(), Ordering::Release);
        if speed == SPEED_MANUAL {
            // Triggers pressed before manual mode release nothing.
            self.shared.trigger_pending.store(false, Ordering::Release);
        }
        self.shared.wake.set();
        Ok(())
    }

    /// Whether playback restarts at the end of the recording
    pub fn repeat(&self) -> bool {
        self.shared.repeat.load(Ordering::Acquire)
    }

    /// Enable or disable restarting at the end of the recording
    pub fn set_repeat(&self, repeat: bool) {
        self.shared.repeat.store(repeat, Ordering::Release);
        self.shared.wake.set();
    }

    /// Release one frame in manual mode
    pub fn trigger(&self) {
        self.shared.trigger_pending.store(true, Ordering::Release);
        self.shared.wake.set();
    }

    /// Seek node `node` to `frame` and wait for the playback thread to do it
    ///
    /// # Errors
    ///
    /// Returns `ResourceLocked` while another seek is in progress, and the
    /// player's error if the seek itself fails
    pub fn seek_to_frame(&self, node: &str, frame: u32) -> Result<()> {
        let _gate = self
            .seek_gate
            .try_lock()
            .ok_or_else(|| OniError::ResourceLocked("a seek is already in progress".to_string()))?;
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(OniError::Other("playback is closed".to_string()));
        }

        let (reply, reply_rx) = crossbeam_channel::bounded(1);
        let request = SeekRequest {
            node: node.to_string(),
            frame,
            reply,
        };
        if self.seek_tx.send(request).is_err() {
            return Err(OniError::Other("playback thread has exited".to_string()));
        }
        self.shared.wake.set();

        reply_rx
            .recv()
            .map_err(|_| OniError::Other("playback thread exited during seek".to_string()))?
    }

    fn shutdown(&mut self) -> Result<Option<N>> {
        let Some(done_rx) = self.done_rx.take() else {
            return Ok(None);
        };
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.set();

        match done_rx.recv_timeout(CLOSE_TIMEOUT) {
            Ok(result) => {
                if let Some(handle) = self.handle.take() {
                    handle
                        .join()
                        .map_err(|_| OniError::Other("playback thread panicked".to_string()))?;
                }
                info!("Playback closed");
                result.map(Some)
            }
            Err(RecvTimeoutError::Timeout) => {
                // Detach the thread; it exits on its own once unblocked.
                self.handle.take();
                warn!("Playback thread did not exit within {:?}", CLOSE_TIMEOUT);
                Err(OniError::ThreadTimeout(THREAD_NAME.to_string()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.handle.take();
                Err(OniError::Other("playback thread panicked".to_string()))
            }
        }
    }

    /// Stop the playback thread and hand back the notifications receiver
    ///
    /// # Errors
    ///
    /// Returns `ThreadTimeout` if the thread does not exit within three
    /// seconds, or the error that closing the player produced
    pub fn close(mut self) -> Result<N> {
        self.shutdown()?
            .ok_or_else(|| OniError::Other("playback already closed".to_string()))
    }
}

impl<N: NodeNotifications + Send + 'static> Drop for PlaybackController<N> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Failed to close playback: {}", e);
        }
    }
}

fn serve_seek<N: NodeNotifications>(player: &mut PacedPlayer<N>, request: &SeekRequest) -> Result<()> {
    player.notifications_mut().forced_fastest = true;
    let result = player.seek_to_frame(&request.node, i64::from(request.frame), SeekOrigin::Set);
    let paced = player.notifications_mut();
    paced.forced_fastest = false;
    paced.reference = None;
    result
}

fn run<N: NodeNotifications>(mut player: PacedPlayer<N>, shared: &Shared) -> Result<N> {
    while shared.running.load(Ordering::Acquire) {
        if let Ok(request) = shared.seeks.try_recv() {
            shared.set_state(PlaybackState::Seeking);
            let result = serve_seek(&mut player, &request);
            if let Err(e) = &result {
                debug!("Seek to frame {} of '{}' failed: {}", request.frame, request.node, e);
            }
            request.reply.send(result).ok();
            continue;
        }

        player.set_repeat(shared.repeat.load(Ordering::Acquire));
        if !shared.started.load(Ordering::Acquire) || player.is_eof() {
            shared.set_state(PlaybackState::Idle);
            shared.wake.wait_timeout(IDLE_WAIT);
            continue;
        }

        shared.set_state(PlaybackState::Playing);
        if let Err(e) = player.read_next() {
            error!("Playback stopped: {}", e);
            shared.started.store(false, Ordering::Release);
        }
    }

    Ok(player.close()?.inner)
}
