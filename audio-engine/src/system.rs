//! Engine lifecycle: backend ownership, device activation and switching.

use std::sync::Arc;

use audio_backend::convert;
use audio_backend::{
    AudioBackend, AudioCallback, AudioSpec, BackendStream, DeviceHandle, DeviceInfo,
};
use parking_lot::Mutex;

use crate::error::AudioError;
use crate::mixer::{DeviceData, EngineCore};
use crate::source::AudioSource;
use crate::stream::AudioStream;

// Samples per decode chunk handed to stream sources. Backends do not report
// a fixed block length, so sources size their scratch off this instead.
const DEVICE_FRAME_SAMPLES: usize = 4096;

struct ActiveDevice {
    handle: DeviceHandle,
    spec: AudioSpec,
    stream: Box<dyn BackendStream>,
}

struct SystemState {
    active: Option<ActiveDevice>,
    done: bool,
}

/// Owns the backend and the engine internals. One system is one mixing
/// world: its devices and streams all share the same mixer and dispatcher.
pub struct AudioSystem {
    backend: Arc<dyn AudioBackend>,
    core: Arc<EngineCore>,
    state: Mutex<SystemState>,
}

impl AudioSystem {
    /// Stores the backend, initializing it if the caller has not. On error
    /// nothing is retained.
    pub fn init(backend: Arc<dyn AudioBackend>) -> Result<Self, AudioError> {
        if !backend.is_initialized() {
            backend.init()?;
        }
        tracing::info!(backend = backend.name(), "audio system initialized");
        Ok(Self {
            backend,
            core: Arc::new(EngineCore::new()),
            state: Mutex::new(SystemState {
                active: None,
                done: false,
            }),
        })
    }

    pub fn backend(&self) -> Arc<dyn AudioBackend> {
        self.backend.clone()
    }

    /// Runs queued finish/loop callbacks on the calling thread. The embedder
    /// chooses the cadence (a UI tick, a timer); the engine never spawns a
    /// thread for this.
    pub fn dispatch_callbacks(&self) {
        self.core.dispatcher.dispatch();
    }

    pub fn enumerate_devices(&self, playback: bool) -> Result<Vec<DeviceInfo>, AudioError> {
        Ok(self.backend.enumerate_devices(playback)?)
    }

    pub fn get_default_device(&self, playback: bool) -> Result<DeviceInfo, AudioError> {
        Ok(self.backend.get_default_device(playback)?)
    }

    pub fn open_default_device(&self, wanted: &AudioSpec) -> Result<AudioDevice, AudioError> {
        self.open_device("default", wanted)
    }

    /// Opens a device. The first open becomes the active device: the mixer
    /// is pointed at its format and a callback stream starts pulling from
    /// it. Further opens stay inactive until [`switch_device`].
    ///
    /// [`switch_device`]: AudioSystem::switch_device
    pub fn open_device(&self, id: &str, wanted: &AudioSpec) -> Result<AudioDevice, AudioError> {
        let (handle, spec) = self.backend.open_device(id, wanted)?;
        let device = AudioDevice {
            backend: self.backend.clone(),
            core: self.core.clone(),
            handle,
            spec,
        };
        let mut state = self.state.lock();
        if state.active.is_none() {
            self.activate_locked(&mut state, handle, spec)?;
        }
        Ok(device)
    }

    /// Makes `new_device` the active output, preserving mixer buffers and
    /// every stream's play/pause state. When the format differs, sources
    /// are re-opened against the new spec; individual failures are logged
    /// and skipped. A failure to create the new callback stream leaves the
    /// previous device fully active.
    pub fn switch_device(&self, new_device: &AudioDevice) -> Result<(), AudioError> {
        let mut state = self.state.lock();
        let (old_handle, old_spec) = match &state.active {
            None => return self.activate_locked(&mut state, new_device.handle, new_device.spec),
            Some(active) if active.handle == new_device.handle => return Ok(()),
            Some(active) => (active.handle, active.spec),
        };

        let format_changed = old_spec != new_device.spec;
        if format_changed {
            tracing::info!(
                old = %old_spec.format, old_freq = old_spec.freq, old_channels = old_spec.channels,
                new = %new_device.spec.format, new_freq = new_device.spec.freq,
                new_channels = new_device.spec.channels,
                "device switch needs format conversion"
            );
        }

        let mixer_state = self.core.mixer.capture_state();

        // Record playback state, then hold playing streams still while the
        // output moves.
        let snapshot = self.core.mixer.registry().get_valid_streams();
        let mut stream_states = Vec::new();
        for entry in snapshot.iter() {
            let Some(shared) = entry.shared.upgrade() else {
                continue;
            };
            let mut ctrl = shared.ctrl.lock();
            let was_playing = ctrl.is_playing;
            let was_paused = ctrl.is_paused;
            if was_playing && !was_paused {
                ctrl.is_paused = true;
            }
            drop(ctrl);
            stream_states.push((shared, was_playing, was_paused));
        }

        self.backend.pause_device(old_handle);

        // Build the replacement stream before discarding anything, so a
        // failure can put the old device back untouched.
        let new_stream = match self.backend.create_stream(
            new_device.handle,
            &new_device.spec,
            self.mixer_callback(),
        ) {
            Ok(stream) => stream,
            Err(e) => {
                self.backend.resume_device(old_handle);
                for (shared, was_playing, was_paused) in &stream_states {
                    if *was_playing && !*was_paused {
                        shared.ctrl.lock().is_paused = false;
                    }
                }
                tracing::warn!(error = %e, "device switch failed; keeping previous device");
                return Err(e.into());
            }
        };

        self.core.mixer.set_device_data(Some(Arc::new(DeviceData {
            spec: new_device.spec,
            frame_size: DEVICE_FRAME_SAMPLES,
            converter: convert::to_device(new_device.spec.format),
        })));
        state.active = Some(ActiveDevice {
            handle: new_device.handle,
            spec: new_device.spec,
            stream: new_stream,
        });

        if format_changed {
            for (shared, _, _) in &stream_states {
                let mut ctrl = shared.ctrl.lock();
                if let Err(e) = ctrl.source.open(
                    new_device.spec.freq,
                    new_device.spec.channels,
                    DEVICE_FRAME_SAMPLES,
                ) {
                    tracing::warn!(error = %e, "failed to re-open stream for the new device");
                }
            }
        }

        self.core.mixer.restore_state(mixer_state);
        for (shared, was_playing, was_paused) in &stream_states {
            if *was_playing && !*was_paused {
                shared.ctrl.lock().is_paused = false;
            }
        }
        self.backend.resume_device(new_device.handle);
        tracing::info!("switched audio device");
        Ok(())
    }

    /// Shuts the engine down: the callback falls silent, the active device
    /// closes, the backend shuts down. Idempotent; also run on drop.
    pub fn done(&self) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.done = true;
        self.core.mixer.set_shutting_down(true);
        self.core.mixer.set_device_data(None);
        if let Some(active) = state.active.take() {
            let ActiveDevice {
                handle, mut stream, ..
            } = active;
            stream.unbind_from_device();
            drop(stream);
            self.backend.close_device(handle);
        }
        if self.backend.is_initialized() {
            self.backend.shutdown();
        }
        tracing::info!("audio system shut down");
    }

    fn mixer_callback(&self) -> AudioCallback {
        let core = self.core.clone();
        Arc::new(move |out: &mut [u8]| core.render(out))
    }

    fn activate_locked(
        &self,
        state: &mut SystemState,
        handle: DeviceHandle,
        spec: AudioSpec,
    ) -> Result<(), AudioError> {
        let mut stream = self
            .backend
            .create_stream(handle, &spec, self.mixer_callback())?;
        stream.bind_to_device();
        self.core.mixer.set_device_data(Some(Arc::new(DeviceData {
            spec,
            frame_size: DEVICE_FRAME_SAMPLES,
            converter: convert::to_device(spec.format),
        })));
        self.backend.resume_device(handle);
        state.active = Some(ActiveDevice {
            handle,
            spec,
            stream,
        });
        tracing::info!(
            format = %spec.format, freq = spec.freq, channels = spec.channels,
            "audio device activated"
        );
        Ok(())
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        self.done();
    }
}

/// One opened output device. Dropping the handle closes it; closing the
/// active device silences the mix until another device is switched in.
pub struct AudioDevice {
    backend: Arc<dyn AudioBackend>,
    core: Arc<EngineCore>,
    handle: DeviceHandle,
    spec: AudioSpec,
}

impl AudioDevice {
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn spec(&self) -> AudioSpec {
        self.spec
    }

    pub fn format(&self) -> audio_backend::AudioFormat {
        self.spec.format
    }

    pub fn freq(&self) -> u32 {
        self.spec.freq
    }

    pub fn channels(&self) -> u8 {
        self.spec.channels
    }

    pub fn gain(&self) -> Result<f32, AudioError> {
        Ok(self.backend.get_device_gain(self.handle)?)
    }

    pub fn set_gain(&self, gain: f32) -> Result<(), AudioError> {
        Ok(self.backend.set_device_gain(self.handle, gain)?)
    }

    pub fn pause(&self) -> bool {
        self.backend.pause_device(self.handle)
    }

    pub fn resume(&self) -> bool {
        self.backend.resume_device(self.handle)
    }

    pub fn is_paused(&self) -> Result<bool, AudioError> {
        Ok(self.backend.is_device_paused(self.handle)?)
    }

    pub fn mute(&self) -> bool {
        self.backend.mute_device(self.handle)
    }

    pub fn unmute(&self) -> bool {
        self.backend.unmute_device(self.handle)
    }

    pub fn is_muted(&self) -> Result<bool, AudioError> {
        Ok(self.backend.is_device_muted(self.handle)?)
    }

    /// Creates a stream that will mix into this engine's output. The source
    /// opens lazily against whatever device is active at play time.
    pub fn create_stream(&self, source: AudioSource) -> AudioStream {
        AudioStream::new(source, self.core.clone())
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        self.backend.close_device(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStream;
    use crate::synth::SineDecoder;
    use audio_backend::null_backend::NullBackend;
    use std::time::Duration;

    fn sine_source(frames: u64) -> AudioSource {
        AudioSource::new(
            Box::new(SineDecoder::new(440.0, 0.5, 44100, 2, frames)),
            Box::new(MemoryStream::empty()),
        )
    }

    #[test]
    fn init_initializes_the_backend_once() {
        let backend = Arc::new(NullBackend::new());
        let system = AudioSystem::init(backend.clone()).unwrap();
        assert!(system.backend().is_initialized());
    }

    #[test]
    fn first_open_activates_and_renders() {
        let backend = Arc::new(NullBackend::new());
        let system = AudioSystem::init(backend.clone()).unwrap();
        let device = system.open_default_device(&AudioSpec::default()).unwrap();

        let stream = device.create_stream(sine_source(44100));
        stream.play(0, Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let mut out = vec![0u8; 4096];
        assert!(backend.drive(device.handle(), &mut out));
        assert!(out.iter().any(|&b| b != 0));
    }

    #[test]
    fn done_silences_and_shuts_down() {
        let backend = Arc::new(NullBackend::new());
        let system = AudioSystem::init(backend.clone()).unwrap();
        let device = system.open_default_device(&AudioSpec::default()).unwrap();
        let handle = device.handle();
        system.done();
        assert!(!backend.is_initialized());
        let mut out = vec![0u8; 256];
        assert!(!backend.drive(handle, &mut out));
        // Second done is fine.
        system.done();
    }

    #[test]
    fn device_accessors_reflect_the_spec() {
        let backend = Arc::new(NullBackend::new());
        let system = AudioSystem::init(backend).unwrap();
        let device = system.open_default_device(&AudioSpec::default()).unwrap();
        assert_eq!(device.freq(), 44100);
        assert_eq!(device.channels(), 2);
        assert_eq!(device.gain().unwrap(), 1.0);
        device.set_gain(0.5).unwrap();
        assert_eq!(device.gain().unwrap(), 0.5);
        assert!(!device.is_paused().unwrap());
    }

    #[test]
    fn switch_to_same_device_is_a_no_op() {
        let backend = Arc::new(NullBackend::new());
        let system = AudioSystem::init(backend).unwrap();
        let device = system.open_default_device(&AudioSpec::default()).unwrap();
        system.switch_device(&device).unwrap();
    }

    #[test]
    fn switch_moves_playback_to_the_new_device() {
        let backend = Arc::new(NullBackend::new());
        let system = AudioSystem::init(backend.clone()).unwrap();
        let first = system.open_default_device(&AudioSpec::default()).unwrap();
        let second = system.open_device("default", &AudioSpec::default()).unwrap();

        let stream = first.create_stream(sine_source(44100));
        stream.play(0, Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        system.switch_device(&second).unwrap();
        assert!(stream.is_playing());
        assert!(!stream.is_paused());

        let mut out = vec![0u8; 4096];
        assert!(backend.drive(second.handle(), &mut out));
        assert!(out.iter().any(|&b| b != 0));
    }
}
