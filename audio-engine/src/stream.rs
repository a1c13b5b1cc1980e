//! Per-stream playback state and the user-facing stream handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::error::AudioError;
use crate::fade::{FadeEnvelope, FadeState};
use crate::mixer::EngineCore;
use crate::processor::Processor;
use crate::source::AudioSource;

static TOKEN_GENERATOR: AtomicU64 = AtomicU64::new(1);

/// Identity of a stream within the engine. Minted at construction, stable
/// for the stream's whole life, never zero and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamToken(u64);

impl StreamToken {
    fn mint() -> Self {
        Self(TOKEN_GENERATOR.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingAction {
    None,
    Pause,
    Stop,
}

/// Boxed user callback; arc-swap cannot hold a fat pointer directly.
pub(crate) struct CallbackSlot {
    pub f: Box<dyn Fn(StreamToken) + Send + Sync>,
}

/// Mutable stream state; everything the audio callback reads is in here,
/// behind the per-stream mutex.
pub(crate) struct StreamCtrl {
    pub source: AudioSource,
    pub is_open: bool,
    pub is_playing: bool,
    pub is_paused: bool,
    pub volume: f32,
    pub stereo_pos: f32,
    pub internal_volume: f32,
    pub is_muted: bool,
    pub current_iteration: u32,
    pub wanted_iterations: u32,
    pub playback_start_tick: u64,
    pub starting: bool,
    pub pending: PendingAction,
    pub fade: FadeEnvelope,
    pub processors: Vec<Arc<dyn Processor>>,
}

/// State shared between the handle, the registry and the audio callback.
///
/// `alive` and `in_use` are the only fields the audio thread touches outside
/// the control mutex; both are SeqCst so the destruction sequence
/// (store alive=false, then wait for in_use to drain) cannot race a callback
/// that increments in_use and then checks alive.
pub(crate) struct StreamShared {
    pub token: StreamToken,
    pub alive: AtomicBool,
    pub in_use: AtomicU32,
    pub ctrl: Mutex<StreamCtrl>,
    pub finish_cb: ArcSwapOption<CallbackSlot>,
    pub loop_cb: ArcSwapOption<CallbackSlot>,
}

impl StreamShared {
    pub(crate) fn new(source: AudioSource) -> Arc<Self> {
        Arc::new(Self {
            token: StreamToken::mint(),
            alive: AtomicBool::new(true),
            in_use: AtomicU32::new(0),
            ctrl: Mutex::new(StreamCtrl {
                source,
                is_open: false,
                is_playing: false,
                is_paused: false,
                volume: 1.0,
                stereo_pos: 0.0,
                internal_volume: 1.0,
                is_muted: false,
                current_iteration: 0,
                wanted_iterations: 0,
                playback_start_tick: 0,
                starting: false,
                pending: PendingAction::None,
                fade: FadeEnvelope::new(),
                processors: Vec::new(),
            }),
            finish_cb: ArcSwapOption::from(None),
            loop_cb: ArcSwapOption::from(None),
        })
    }
}

/// A playing or playable voice. Dropping the handle tears the stream down
/// safely even while the audio callback is mixing it; the drop may wait for
/// the current callback block (at most a few milliseconds).
pub struct AudioStream {
    shared: Arc<StreamShared>,
    engine: Arc<EngineCore>,
}

impl AudioStream {
    pub(crate) fn new(source: AudioSource, engine: Arc<EngineCore>) -> Self {
        Self {
            shared: StreamShared::new(source),
            engine,
        }
    }

    pub fn token(&self) -> StreamToken {
        self.shared.token
    }

    /// Opens the source against the active device format. Idempotent.
    pub fn open(&self) -> Result<(), AudioError> {
        let dev = self
            .engine
            .mixer
            .device_data()
            .ok_or(AudioError::NoActiveDevice)?;
        let mut ctrl = self.shared.ctrl.lock();
        if ctrl.is_open {
            return Ok(());
        }
        ctrl.source
            .open(dev.spec.freq, dev.spec.channels, dev.frame_size)?;
        ctrl.is_open = true;
        Ok(())
    }

    /// Starts playback. `iterations` of zero loops forever; a non-zero
    /// `fade_in` ramps the volume from silence. Playing streams are left
    /// untouched.
    pub fn play(&self, iterations: u32, fade_in: Duration) -> Result<(), AudioError> {
        self.open()?;
        {
            let mut ctrl = self.shared.ctrl.lock();
            if ctrl.is_playing {
                return Ok(());
            }
            ctrl.current_iteration = 0;
            ctrl.wanted_iterations = iterations;
            ctrl.playback_start_tick = self.engine.mixer.now_ms();
            ctrl.starting = true;
            if !fade_in.is_zero() {
                ctrl.fade.start_fade_in(fade_in);
            }
            ctrl.is_playing = true;
        }
        self.engine
            .mixer
            .add_stream(self.shared.token, Arc::downgrade(&self.shared));
        Ok(())
    }

    /// Stops playback. With a fade the stop is deferred until the envelope
    /// reaches silence; without one the stream leaves the mix immediately
    /// and the source rewinds.
    pub fn stop(&self, fade_out: Duration) {
        if fade_out.is_zero() {
            self.engine.mixer.remove_stream(self.shared.token);
            let mut ctrl = self.shared.ctrl.lock();
            ctrl.source.rewind();
            ctrl.is_playing = false;
            ctrl.pending = PendingAction::None;
        } else {
            let mut ctrl = self.shared.ctrl.lock();
            ctrl.pending = PendingAction::Stop;
            ctrl.fade.start_fade_out(fade_out);
        }
    }

    /// Pauses playback, optionally after a fade-out.
    pub fn pause(&self, fade_out: Duration) {
        let mut ctrl = self.shared.ctrl.lock();
        if ctrl.is_paused {
            return;
        }
        if fade_out.is_zero() {
            ctrl.is_paused = true;
        } else {
            ctrl.pending = PendingAction::Pause;
            ctrl.fade.start_fade_out(fade_out);
        }
    }

    /// Resumes a paused stream (or cancels an in-flight fade-out). A fade
    /// in progress is always replaced.
    pub fn resume(&self, fade_in: Duration) {
        {
            let mut ctrl = self.shared.ctrl.lock();
            if ctrl.is_playing && ctrl.fade.state() == FadeState::None && !ctrl.is_paused {
                return;
            }
            ctrl.pending = PendingAction::None;
            ctrl.is_paused = false;
            ctrl.is_playing = true;
            if !fade_in.is_zero() {
                ctrl.fade.start_fade_in(fade_in);
            } else {
                ctrl.internal_volume = 1.0;
                ctrl.fade.reset();
            }
        }
        self.engine
            .mixer
            .add_stream(self.shared.token, Arc::downgrade(&self.shared));
    }

    pub fn rewind(&self) -> bool {
        if self.open().is_err() {
            return false;
        }
        self.shared.ctrl.lock().source.rewind()
    }

    pub fn seek_to_time(&self, pos: Duration) -> bool {
        self.shared.ctrl.lock().source.seek_to_time(pos)
    }

    pub fn duration(&self) -> Duration {
        self.shared.ctrl.lock().source.duration()
    }

    /// Negative values coerce to zero; there is no upper clamp.
    pub fn set_volume(&self, volume: f32) {
        self.shared.ctrl.lock().volume = volume.max(0.0);
    }

    pub fn volume(&self) -> f32 {
        self.shared.ctrl.lock().volume
    }

    /// Position is clamped to [-1, 1].
    pub fn set_stereo_position(&self, position: f32) {
        self.shared.ctrl.lock().stereo_pos = position.clamp(-1.0, 1.0);
    }

    pub fn stereo_position(&self) -> f32 {
        self.shared.ctrl.lock().stereo_pos
    }

    pub fn mute(&self) {
        self.shared.ctrl.lock().is_muted = true;
    }

    pub fn unmute(&self) {
        self.shared.ctrl.lock().is_muted = false;
    }

    pub fn is_muted(&self) -> bool {
        self.shared.ctrl.lock().is_muted
    }

    /// A paused stream does not report as playing, even though it stays
    /// resumable; the two are never observably true together.
    pub fn is_playing(&self) -> bool {
        let ctrl = self.shared.ctrl.lock();
        ctrl.is_playing && !ctrl.is_paused
    }

    pub fn is_paused(&self) -> bool {
        self.shared.ctrl.lock().is_paused
    }

    /// Adds a processor unless the same one (by identity) is present.
    pub fn add_processor(&self, processor: Arc<dyn Processor>) {
        let mut ctrl = self.shared.ctrl.lock();
        if ctrl
            .processors
            .iter()
            .any(|p| Arc::ptr_eq(p, &processor))
        {
            return;
        }
        ctrl.processors.push(processor);
    }

    pub fn remove_processor(&self, processor: &Arc<dyn Processor>) {
        let mut ctrl = self.shared.ctrl.lock();
        ctrl.processors.retain(|p| !Arc::ptr_eq(p, processor));
    }

    pub fn clear_processors(&self) {
        self.shared.ctrl.lock().processors.clear();
    }

    /// Replaces the finish callback. It runs on whichever thread drives
    /// [`crate::AudioSystem::dispatch_callbacks`], never the audio thread.
    pub fn set_finish_callback<F>(&self, f: F)
    where
        F: Fn(StreamToken) + Send + Sync + 'static,
    {
        self.shared
            .finish_cb
            .store(Some(Arc::new(CallbackSlot { f: Box::new(f) })));
    }

    pub fn remove_finish_callback(&self) {
        self.shared.finish_cb.store(None);
    }

    pub fn set_loop_callback<F>(&self, f: F)
    where
        F: Fn(StreamToken) + Send + Sync + 'static,
    {
        self.shared
            .loop_cb
            .store(Some(Arc::new(CallbackSlot { f: Box::new(f) })));
    }

    pub fn remove_loop_callback(&self) {
        self.shared.loop_cb.store(None);
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        // No new callback may enter past this store.
        self.shared.alive.store(false, Ordering::SeqCst);
        self.engine.mixer.remove_stream(self.shared.token);
        // A callback that won the race keeps the count non-zero until it is
        // done with this stream; one callback block at most.
        while self.shared.in_use.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
        {
            let mut ctrl = self.shared.ctrl.lock();
            ctrl.source.rewind();
            ctrl.is_playing = false;
        }
        self.shared.finish_cb.store(None);
        self.shared.loop_cb.store(None);
        self.engine.dispatcher.cleanup(self.shared.token);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::io::MemoryStream;
    use crate::synth::SilenceDecoder;

    pub(crate) fn ctrl_of(stream: &AudioStream) -> Arc<StreamShared> {
        stream.shared.clone()
    }

    pub(crate) fn shared_for_tests() -> Arc<StreamShared> {
        let source = AudioSource::new(
            Box::new(SilenceDecoder::new(44100, 2, 44100)),
            Box::new(MemoryStream::empty()),
        );
        StreamShared::new(source)
    }

    impl StreamShared {
        pub(crate) fn set_finish_callback_for_tests<F>(&self, f: F)
        where
            F: Fn(StreamToken) + Send + Sync + 'static,
        {
            self.finish_cb
                .store(Some(Arc::new(CallbackSlot { f: Box::new(f) })));
        }

        pub(crate) fn set_loop_callback_for_tests<F>(&self, f: F)
        where
            F: Fn(StreamToken) + Send + Sync + 'static,
        {
            self.loop_cb
                .store(Some(Arc::new(CallbackSlot { f: Box::new(f) })));
        }
    }
}
