//! Shared helpers for the end-to-end suites: a null-backend system and
//! deterministic block driving.

use std::sync::Arc;
use std::time::Duration;

use audio_backend::convert;
use audio_backend::null_backend::NullBackend;
use audio_backend::{AudioSpec, DeviceHandle};
use audio_engine::io::MemoryStream;
use audio_engine::synth::{SilenceDecoder, SineDecoder};
use audio_engine::{AudioDevice, AudioSource, AudioSystem};

pub const BLOCK_FRAMES: usize = 1024;

/// One engine on one virtual device, ready to drive.
pub struct TestRig {
    pub backend: Arc<NullBackend>,
    pub system: AudioSystem,
    pub device: AudioDevice,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_spec(AudioSpec::default())
    }

    pub fn with_spec(spec: AudioSpec) -> Self {
        let backend = Arc::new(NullBackend::with_spec(spec));
        let system = AudioSystem::init(backend.clone()).expect("null backend init");
        let device = system.open_device("default", &spec).expect("open device");
        Self {
            backend,
            system,
            device,
        }
    }

    /// Runs one callback block and returns the mix as f32, whatever the
    /// device format is.
    pub fn drive_block(&self) -> Vec<f32> {
        drive_block_on(&self.backend, self.device.handle(), self.device.spec())
    }

    /// Drives until the given stream stops playing, with a block cap so a
    /// broken engine fails the test instead of hanging it.
    pub fn drive_until_stopped(&self, stream: &audio_engine::AudioStream) -> Vec<f32> {
        let mut collected = Vec::new();
        for _ in 0..512 {
            collected.extend(self.drive_block());
            if !stream.is_playing() {
                return collected;
            }
        }
        panic!("stream did not stop within 512 blocks");
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

pub fn drive_block_on(backend: &NullBackend, handle: DeviceHandle, spec: AudioSpec) -> Vec<f32> {
    let samples = BLOCK_FRAMES * spec.channels as usize;
    let mut bytes = vec![0u8; samples * spec.format.bytes_per_sample()];
    assert!(backend.drive(handle, &mut bytes), "device stopped driving");
    let mut mix = vec![0f32; samples];
    convert::from_device(spec.format)(&mut mix, &bytes);
    mix
}

pub fn sine_source(freq: f32, amplitude: f32, frames: u64) -> AudioSource {
    AudioSource::new(
        Box::new(SineDecoder::new(freq, amplitude, 44100, 2, frames)),
        Box::new(MemoryStream::empty()),
    )
}

pub fn silence_source(frames: u64) -> AudioSource {
    AudioSource::new(
        Box::new(SilenceDecoder::new(44100, 2, frames)),
        Box::new(MemoryStream::empty()),
    )
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0f32, |a, &s| a.max(s.abs()))
}

/// Lets the scheduled start tick fall at least one whole block into the
/// past, so the next driven block starts at offset zero.
pub fn settle_start_tick() {
    std::thread::sleep(Duration::from_millis(30));
}
