//! Backend for tests and headless environments. Devices are virtual and the
//! callback runs only when a test drives it, which makes callback timing
//! fully deterministic.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{
    AudioBackend, AudioCallback, AudioSpec, BackendError, BackendStream, DeviceHandle, DeviceInfo,
};

struct NullDevice {
    spec: AudioSpec,
    gain: f32,
    paused: bool,
    muted: bool,
    callback: Option<AudioCallback>,
}

struct NullState {
    initialized: bool,
    next_handle: DeviceHandle,
    devices: HashMap<DeviceHandle, NullDevice>,
}

pub struct NullBackend {
    default_spec: AudioSpec,
    state: Mutex<NullState>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::with_spec(AudioSpec::default())
    }

    /// Sets the spec reported for the enumerated default device.
    pub fn with_spec(spec: AudioSpec) -> Self {
        Self {
            default_spec: spec,
            state: Mutex::new(NullState {
                initialized: false,
                next_handle: 1,
                devices: HashMap::new(),
            }),
        }
    }

    /// Invokes the device's registered callback synchronously on the calling
    /// thread, exactly as a real backend would on its audio thread. Returns
    /// false when the device is unknown, paused, or has no stream yet.
    pub fn drive(&self, handle: DeviceHandle, out: &mut [u8]) -> bool {
        let (callback, muted) = {
            let state = self.state.lock().unwrap();
            let Some(dev) = state.devices.get(&handle) else {
                return false;
            };
            if dev.paused {
                return false;
            }
            match &dev.callback {
                Some(cb) => (cb.clone(), dev.muted),
                None => return false,
            }
        };
        callback(out);
        if muted {
            out.fill(0);
        }
        true
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: "null".to_string(),
            name: "Null Device".to_string(),
            is_default: true,
            channels: self.default_spec.channels,
            sample_rate: self.default_spec.freq,
        }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for NullBackend {
    fn init(&self) -> Result<(), BackendError> {
        self.state.lock().unwrap().initialized = true;
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.devices.clear();
        state.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().initialized
    }

    fn name(&self) -> &str {
        "null"
    }

    fn enumerate_devices(&self, _playback: bool) -> Result<Vec<DeviceInfo>, BackendError> {
        if !self.is_initialized() {
            return Err(BackendError::NotInitialized);
        }
        Ok(vec![self.info()])
    }

    fn get_default_device(&self, _playback: bool) -> Result<DeviceInfo, BackendError> {
        if !self.is_initialized() {
            return Err(BackendError::NotInitialized);
        }
        Ok(self.info())
    }

    /// Virtual devices obtain exactly what was asked for.
    fn open_device(
        &self,
        _id: &str,
        wanted: &AudioSpec,
    ) -> Result<(DeviceHandle, AudioSpec), BackendError> {
        let mut state = self.state.lock().unwrap();
        if !state.initialized {
            return Err(BackendError::NotInitialized);
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.devices.insert(
            handle,
            NullDevice {
                spec: *wanted,
                gain: 1.0,
                paused: false,
                muted: false,
                callback: None,
            },
        );
        Ok((handle, *wanted))
    }

    fn close_device(&self, handle: DeviceHandle) {
        self.state.lock().unwrap().devices.remove(&handle);
    }

    fn get_device_format(&self, handle: DeviceHandle) -> Result<crate::AudioFormat, BackendError> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .get(&handle)
            .map(|d| d.spec.format)
            .ok_or(BackendError::InvalidHandle(handle))
    }

    fn get_device_freq(&self, handle: DeviceHandle) -> Result<u32, BackendError> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .get(&handle)
            .map(|d| d.spec.freq)
            .ok_or(BackendError::InvalidHandle(handle))
    }

    fn get_device_channels(&self, handle: DeviceHandle) -> Result<u8, BackendError> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .get(&handle)
            .map(|d| d.spec.channels)
            .ok_or(BackendError::InvalidHandle(handle))
    }

    fn get_device_gain(&self, handle: DeviceHandle) -> Result<f32, BackendError> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .get(&handle)
            .map(|d| d.gain)
            .ok_or(BackendError::InvalidHandle(handle))
    }

    fn set_device_gain(&self, handle: DeviceHandle, gain: f32) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        let dev = state
            .devices
            .get_mut(&handle)
            .ok_or(BackendError::InvalidHandle(handle))?;
        dev.gain = gain.max(0.0);
        Ok(())
    }

    fn pause_device(&self, handle: DeviceHandle) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.devices.get_mut(&handle) {
            Some(dev) => {
                dev.paused = true;
                true
            }
            None => false,
        }
    }

    fn resume_device(&self, handle: DeviceHandle) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.devices.get_mut(&handle) {
            Some(dev) => {
                dev.paused = false;
                true
            }
            None => false,
        }
    }

    fn is_device_paused(&self, handle: DeviceHandle) -> Result<bool, BackendError> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .get(&handle)
            .map(|d| d.paused)
            .ok_or(BackendError::InvalidHandle(handle))
    }

    fn mute_device(&self, handle: DeviceHandle) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.devices.get_mut(&handle) {
            Some(dev) => {
                dev.muted = true;
                true
            }
            None => false,
        }
    }

    fn unmute_device(&self, handle: DeviceHandle) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.devices.get_mut(&handle) {
            Some(dev) => {
                dev.muted = false;
                true
            }
            None => false,
        }
    }

    fn is_device_muted(&self, handle: DeviceHandle) -> Result<bool, BackendError> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .get(&handle)
            .map(|d| d.muted)
            .ok_or(BackendError::InvalidHandle(handle))
    }

    fn create_stream(
        &self,
        handle: DeviceHandle,
        _spec: &AudioSpec,
        callback: AudioCallback,
    ) -> Result<Box<dyn BackendStream>, BackendError> {
        let mut state = self.state.lock().unwrap();
        let dev = state
            .devices
            .get_mut(&handle)
            .ok_or(BackendError::InvalidHandle(handle))?;
        dev.callback = Some(callback);
        Ok(Box::new(NullStream {
            buffer: Vec::new(),
            paused: false,
        }))
    }

    fn max_open_devices(&self) -> usize {
        usize::MAX
    }
}

/// Discards pushed data after buffering it; the callback path does not go
/// through this object.
struct NullStream {
    buffer: Vec<u8>,
    paused: bool,
}

impl BackendStream for NullStream {
    fn put_data(&mut self, data: &[u8]) -> bool {
        self.buffer.extend_from_slice(data);
        true
    }

    fn get_data(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buffer.len());
        out[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);
        n
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }

    fn pause(&mut self) -> bool {
        self.paused = true;
        true
    }

    fn resume(&mut self) -> bool {
        self.paused = false;
        true
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn queued_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn bind_to_device(&mut self) -> bool {
        true
    }

    fn unbind_from_device(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn requires_init_before_enumeration() {
        let backend = NullBackend::new();
        assert!(matches!(
            backend.enumerate_devices(true),
            Err(BackendError::NotInitialized)
        ));
        backend.init().unwrap();
        let devices = backend.enumerate_devices(true).unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].is_default);
    }

    #[test]
    fn open_close_and_handle_validity() {
        let backend = NullBackend::new();
        backend.init().unwrap();
        let (handle, spec) = backend.open_device("default", &AudioSpec::default()).unwrap();
        assert_eq!(spec, AudioSpec::default());
        assert_eq!(backend.get_device_freq(handle).unwrap(), 44100);
        backend.close_device(handle);
        assert!(matches!(
            backend.get_device_freq(handle),
            Err(BackendError::InvalidHandle(_))
        ));
        // Closing twice is fine.
        backend.close_device(handle);
    }

    #[test]
    fn drive_invokes_registered_callback() {
        let backend = NullBackend::new();
        backend.init().unwrap();
        let (handle, _) = backend.open_device("default", &AudioSpec::default()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = calls.clone();
        let _stream = backend
            .create_stream(
                handle,
                &AudioSpec::default(),
                Arc::new(move |out: &mut [u8]| {
                    out.fill(0x7f);
                    calls_cb.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let mut buf = vec![0u8; 64];
        assert!(backend.drive(handle, &mut buf));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(buf.iter().all(|&b| b == 0x7f));

        backend.pause_device(handle);
        assert!(!backend.drive(handle, &mut buf));

        backend.resume_device(handle);
        backend.mute_device(handle);
        assert!(backend.drive(handle, &mut buf));
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn pause_and_gain_round_trip() {
        let backend = NullBackend::new();
        backend.init().unwrap();
        let (handle, _) = backend.open_device("default", &AudioSpec::default()).unwrap();
        assert!(!backend.is_device_paused(handle).unwrap());
        assert!(backend.pause_device(handle));
        assert!(backend.is_device_paused(handle).unwrap());
        backend.set_device_gain(handle, 0.25).unwrap();
        assert_eq!(backend.get_device_gain(handle).unwrap(), 0.25);
        assert!(!backend.pause_device(9999));
    }
}
