//! The per-callback mixing pipeline and the buffers it reuses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use audio_backend::convert::ToDeviceFn;
use audio_backend::AudioSpec;
use parking_lot::Mutex;

use crate::dispatcher::{CallbackDispatcher, EventKind, StreamEvent};
use crate::in_use::InUseGuard;
use crate::registry::StreamRegistry;
use crate::stream::{PendingAction, StreamCtrl, StreamShared, StreamToken};

/// Everything the audio callback needs about the active device. Replaced
/// atomically when the device changes.
pub(crate) struct DeviceData {
    pub spec: AudioSpec,
    pub frame_size: usize,
    pub converter: ToDeviceFn,
}

/// Shared engine internals: one mixer and one dispatcher per system, held
/// by the system, its devices and every stream.
pub(crate) struct EngineCore {
    pub mixer: Mixer,
    pub dispatcher: CallbackDispatcher,
}

impl EngineCore {
    pub fn new() -> Self {
        Self {
            mixer: Mixer::new(),
            dispatcher: CallbackDispatcher::new(),
        }
    }

    /// Entry point the backend callback stream is bound to.
    pub fn render(&self, out: &mut [u8]) {
        self.mixer.render(out, &self.dispatcher);
    }
}

struct MixBuffers {
    final_mix: Vec<f32>,
    stream: Vec<f32>,
    processor: Vec<f32>,
    allocated: usize,
}

impl MixBuffers {
    // Grow-only; capacity survives device switches so the callback path
    // never reallocates in the steady state.
    fn ensure(&mut self, samples: usize) {
        if samples > self.allocated {
            self.final_mix.resize(samples, 0.0);
            self.stream.resize(samples, 0.0);
            self.processor.resize(samples, 0.0);
            self.allocated = samples;
        }
    }
}

pub(crate) struct MixerState {
    allocated: usize,
}

pub(crate) struct Mixer {
    registry: StreamRegistry,
    device_data: ArcSwapOption<DeviceData>,
    buffers: Mutex<MixBuffers>,
    shutting_down: AtomicBool,
    missing_device_warned: AtomicBool,
    epoch: Instant,
}

impl Mixer {
    pub fn new() -> Self {
        Self {
            registry: StreamRegistry::new(),
            device_data: ArcSwapOption::from(None),
            buffers: Mutex::new(MixBuffers {
                final_mix: Vec::new(),
                stream: Vec::new(),
                processor: Vec::new(),
                allocated: 0,
            }),
            shutting_down: AtomicBool::new(false),
            missing_device_warned: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds on the engine clock; all scheduling ticks come from here.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn device_data(&self) -> Option<Arc<DeviceData>> {
        self.device_data.load_full()
    }

    pub fn set_device_data(&self, data: Option<Arc<DeviceData>>) {
        self.device_data.store(data);
    }

    pub fn set_shutting_down(&self, value: bool) {
        self.shutting_down.store(value, Ordering::SeqCst);
    }

    pub fn add_stream(&self, token: StreamToken, shared: Weak<StreamShared>) {
        self.registry.add(token, shared);
    }

    pub fn remove_stream(&self, token: StreamToken) {
        self.registry.remove(token);
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn capture_state(&self) -> MixerState {
        MixerState {
            allocated: self.buffers.lock().allocated,
        }
    }

    pub fn restore_state(&self, state: MixerState) {
        self.buffers.lock().ensure(state.allocated);
    }

    /// One callback block: decode every live stream, apply processors and
    /// gains, sum into the float mix and convert to the device format.
    pub fn render(&self, out: &mut [u8], dispatcher: &CallbackDispatcher) {
        out.fill(0);
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Some(dev) = self.device_data.load_full() else {
            if !self.missing_device_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!("audio callback without a device installed; emitting silence");
            }
            return;
        };

        let bytes_per_sample = dev.spec.format.bytes_per_sample();
        let channels = dev.spec.channels.max(1) as usize;
        let freq = dev.spec.freq.max(1);
        let out_samples = out.len() / bytes_per_sample;
        if out_samples == 0 {
            return;
        }
        let out_frames = out_samples / channels;

        let mut buffers = self.buffers.lock();
        let bufs = &mut *buffers;
        bufs.ensure(out_samples);
        bufs.final_mix[..out_samples].fill(0.0);

        // Iterate over a snapshot; streams added mid-block are picked up
        // next callback, removed ones still finish this block.
        let snapshot = self.registry.get_valid_streams();
        let now = self.now_ms();
        let block_ms = out_frames as u64 * 1000 / freq as u64;

        for entry in snapshot.iter() {
            let Some(shared) = entry.shared.upgrade() else {
                continue;
            };
            let guard = InUseGuard::new(&shared.in_use);
            if !shared.alive.load(Ordering::SeqCst) {
                continue;
            }

            let mut has_finished = false;
            let mut has_looped = false;
            {
                let mut ctrl = shared.ctrl.lock();
                if ctrl.wanted_iterations != 0 && ctrl.current_iteration >= ctrl.wanted_iterations
                {
                    continue;
                }
                if ctrl.is_paused {
                    continue;
                }
                let since_start = now as i64 - ctrl.playback_start_tick as i64;
                if since_start <= 0 {
                    continue;
                }

                let out_offset = if ctrl.starting {
                    eval_out_offset(since_start as u64, block_ms, channels, freq)
                        .min(out_samples)
                } else {
                    0
                };
                ctrl.starting = false;
                let mut cur_pos = out_offset;

                while cur_pos < out_samples {
                    let before = cur_pos;
                    ctrl.source.read_samples(
                        &mut bufs.stream[..out_samples],
                        &mut cur_pos,
                        out_samples,
                        channels as u32,
                    );
                    if cur_pos < out_samples {
                        if !ctrl.source.rewind() {
                            // Non-seekable source: the tail stays silent.
                            break;
                        }
                        // An endlessly looping source that yields nothing
                        // would spin here.
                        if cur_pos == before && ctrl.wanted_iterations == 0 {
                            break;
                        }
                        if ctrl.wanted_iterations != 0 {
                            ctrl.current_iteration += 1;
                            if ctrl.current_iteration >= ctrl.wanted_iterations {
                                ctrl.is_playing = false;
                                self.registry.remove(entry.token);
                                has_finished = true;
                                break;
                            }
                            has_looped = true;
                        }
                    }
                }

                if cur_pos > out_offset {
                    for proc in &ctrl.processors {
                        proc.process(
                            &mut bufs.processor[out_offset..cur_pos],
                            &bufs.stream[out_offset..cur_pos],
                        );
                        bufs.stream[out_offset..cur_pos]
                            .copy_from_slice(&bufs.processor[out_offset..cur_pos]);
                    }
                }

                let env = ctrl.fade.gain();
                if env == 0.0 && ctrl.fade.state() == crate::fade::FadeState::None {
                    // A fade-out completed in this block; settle the action
                    // it was started for. Only a stop counts as finished.
                    match ctrl.pending {
                        PendingAction::Pause => ctrl.is_paused = true,
                        PendingAction::Stop | PendingAction::None => {
                            ctrl.is_playing = false;
                            has_finished = true;
                        }
                    }
                    ctrl.pending = PendingAction::None;
                    self.registry.remove(entry.token);
                }

                let (gain_left, gain_right) = eval_gains(&ctrl, channels, env);
                if !ctrl.is_muted && (gain_left > 0.0 || gain_right > 0.0) && cur_pos > out_offset
                {
                    mix_channels(
                        &mut bufs.final_mix,
                        &bufs.stream,
                        channels,
                        out_offset,
                        cur_pos,
                        gain_left,
                        gain_right,
                    );
                }
            }
            drop(guard);

            if has_finished {
                if shared.finish_cb.load().is_some() {
                    dispatcher.enqueue(StreamEvent {
                        token: entry.token,
                        kind: EventKind::Finished,
                        stream: entry.shared.clone(),
                    });
                }
            } else if has_looped && shared.loop_cb.load().is_some() {
                dispatcher.enqueue(StreamEvent {
                    token: entry.token,
                    kind: EventKind::Looped,
                    stream: entry.shared.clone(),
                });
            }
        }

        (dev.converter)(
            &mut out[..out_samples * bytes_per_sample],
            &bufs.final_mix[..out_samples],
        );
    }
}

/// Per-channel gains from volume, fade envelope and stereo position. Mono
/// devices get the single left gain.
fn eval_gains(ctrl: &StreamCtrl, channels: usize, env: f32) -> (f32, f32) {
    let base = ctrl.volume * ctrl.internal_volume * env;
    let mut left = base;
    let mut right = base;
    if channels > 1 {
        if ctrl.stereo_pos < 0.0 {
            left *= 1.0 + ctrl.stereo_pos;
        } else if ctrl.stereo_pos > 0.0 {
            right *= 1.0 - ctrl.stereo_pos;
        }
    }
    (left, right)
}

/// Samples to skip at the head of the block so a mid-block `play` lands on
/// its scheduled tick. Aligned down to a frame boundary.
fn eval_out_offset(since_start_ms: u64, block_ms: u64, channels: usize, freq: u32) -> usize {
    if since_start_ms >= block_ms {
        return 0;
    }
    let remaining_ms = block_ms - since_start_ms;
    let offset = (remaining_ms * channels as u64 * freq as u64 / 1000) as usize;
    offset - offset % channels
}

/// Adds `src[out_offset..cur_pos]` into `dst` with per-channel gains.
/// Unity gain skips the multiplies in both layouts.
fn mix_channels(
    dst: &mut [f32],
    src: &[f32],
    channels: usize,
    out_offset: usize,
    cur_pos: usize,
    gain_left: f32,
    gain_right: f32,
) {
    let dst = &mut dst[out_offset..cur_pos];
    let src = &src[out_offset..cur_pos];
    if channels > 1 {
        if gain_left == 1.0 && gain_right == 1.0 {
            for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
                d[0] += s[0];
                d[1] += s[1];
            }
        } else {
            for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
                d[0] += s[0] * gain_left;
                d[1] += s[1] * gain_right;
            }
        }
    } else if gain_left == 1.0 {
        for (d, s) in dst.iter_mut().zip(src) {
            *d += *s;
        }
    } else {
        for (d, s) in dst.iter_mut().zip(src) {
            *d += *s * gain_left;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use audio_backend::convert;

    pub(crate) fn engine_with_device() -> Arc<EngineCore> {
        let core = Arc::new(EngineCore::new());
        let spec = AudioSpec::default();
        core.mixer.set_device_data(Some(Arc::new(DeviceData {
            spec,
            frame_size: 1024,
            converter: convert::to_device(spec.format),
        })));
        core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStream;
    use crate::source::AudioSource;
    use crate::stream::AudioStream;
    use crate::synth::SineDecoder;
    use audio_backend::convert;
    use std::time::Duration;

    #[test]
    fn mix_kernel_applies_stereo_gains() {
        let mut dst = vec![0.0f32; 8];
        let src = vec![1.0f32; 8];
        mix_channels(&mut dst, &src, 2, 2, 6, 0.5, 0.25);
        assert_eq!(&dst[..2], &[0.0, 0.0]);
        assert_eq!(&dst[2..6], &[0.5, 0.25, 0.5, 0.25]);
        assert_eq!(&dst[6..], &[0.0, 0.0]);
    }

    #[test]
    fn mix_kernel_accumulates() {
        let mut dst = vec![0.25f32; 4];
        let src = vec![0.5f32; 4];
        mix_channels(&mut dst, &src, 1, 0, 4, 1.0, 1.0);
        assert!(dst.iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn out_offset_is_frame_aligned() {
        let offset = eval_out_offset(3, 23, 2, 44100);
        assert_eq!(offset % 2, 0);
        assert!(offset > 0);
        assert_eq!(eval_out_offset(23, 23, 2, 44100), 0);
        assert_eq!(eval_out_offset(100, 23, 2, 44100), 0);
    }

    #[test]
    fn gains_follow_the_stereo_position() {
        let core = test_support::engine_with_device();
        let source = AudioSource::new(
            Box::new(SineDecoder::new(440.0, 0.5, 44100, 2, 100)),
            Box::new(MemoryStream::empty()),
        );
        let stream = AudioStream::new(source, core.clone());
        stream.set_stereo_position(-1.0);
        let ctrl = stream_ctrl_gains(&stream);
        assert_eq!(ctrl, (0.0, 1.0));
        stream.set_stereo_position(1.0);
        let ctrl = stream_ctrl_gains(&stream);
        assert_eq!(ctrl, (1.0, 0.0));
    }

    fn stream_ctrl_gains(stream: &AudioStream) -> (f32, f32) {
        let shared = crate::stream::test_support::ctrl_of(stream);
        let ctrl = shared.ctrl.lock();
        eval_gains(&ctrl, 2, 1.0)
    }

    #[test]
    fn render_without_device_emits_silence() {
        let core = Arc::new(EngineCore::new());
        let mut out = vec![0xffu8; 64];
        core.render(&mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn render_mixes_a_playing_stream() {
        let core = test_support::engine_with_device();
        let source = AudioSource::new(
            Box::new(SineDecoder::new(440.0, 0.5, 44100, 2, 44100)),
            Box::new(MemoryStream::empty()),
        );
        let stream = AudioStream::new(source, core.clone());
        stream.play(1, Duration::ZERO).unwrap();
        // Let the start tick fall behind a whole block so the first render
        // has no partial-block offset.
        std::thread::sleep(Duration::from_millis(30));

        let mut out = vec![0u8; 1024 * 2 * 4];
        core.render(&mut out);

        let mut mix = vec![0f32; 1024 * 2];
        convert::from_device(audio_backend::AudioFormat::F32Le)(&mut mix, &out);
        let peak = mix.iter().fold(0f32, |a, &s| a.max(s.abs()));
        assert!(peak > 0.4, "expected an audible mix, peak {peak}");
    }

    #[test]
    fn finished_stream_leaves_the_registry() {
        let core = test_support::engine_with_device();
        let source = AudioSource::new(
            Box::new(SineDecoder::new(440.0, 0.5, 44100, 2, 512)),
            Box::new(MemoryStream::empty()),
        );
        let stream = AudioStream::new(source, core.clone());
        stream.play(1, Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let mut out = vec![0u8; 1024 * 2 * 4];
        core.render(&mut out);
        assert!(!stream.is_playing());
        assert_eq!(core.mixer.registry().valid_count(), 0);
    }

    #[test]
    fn muted_stream_contributes_nothing() {
        let core = test_support::engine_with_device();
        let source = AudioSource::new(
            Box::new(SineDecoder::new(440.0, 0.5, 44100, 2, 44100)),
            Box::new(MemoryStream::empty()),
        );
        let stream = AudioStream::new(source, core.clone());
        stream.play(0, Duration::ZERO).unwrap();
        stream.mute();
        std::thread::sleep(Duration::from_millis(30));

        let mut out = vec![0xffu8; 2048];
        core.render(&mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn buffers_grow_monotonically() {
        let core = test_support::engine_with_device();
        let mut small = vec![0u8; 256];
        core.render(&mut small);
        let after_small = core.mixer.buffers.lock().allocated;
        let mut large = vec![0u8; 4096];
        core.render(&mut large);
        let after_large = core.mixer.buffers.lock().allocated;
        assert!(after_large > after_small);
        core.render(&mut small);
        assert_eq!(core.mixer.buffers.lock().allocated, after_large);
    }
}
