// Playback backend abstraction: device enumeration, device control, and the
// callback stream that pulls mixed PCM out of the engine. Backends are shared
// as `Arc<dyn AudioBackend>` and use interior mutability throughout.

use std::fmt;
use std::sync::Arc;

pub mod convert;
// The real playback backend needs the platform audio stack at build time.
#[cfg(feature = "cpal-audio")]
pub mod cpal_backend;
pub mod null_backend;

/// Opaque handle for an opened device. Unique per open within a backend
/// instance; never reused.
pub type DeviceHandle = u32;

/// Interleaved PCM sample formats a device may want.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    U8,
    S8,
    S16Le,
    S16Be,
    S32Le,
    S32Be,
    F32Le,
    F32Be,
}

impl AudioFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioFormat::U8 | AudioFormat::S8 => 1,
            AudioFormat::S16Le | AudioFormat::S16Be => 2,
            AudioFormat::S32Le | AudioFormat::S32Be | AudioFormat::F32Le | AudioFormat::F32Be => 4,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioFormat::U8 => "u8",
            AudioFormat::S8 => "s8",
            AudioFormat::S16Le => "s16le",
            AudioFormat::S16Be => "s16be",
            AudioFormat::S32Le => "s32le",
            AudioFormat::S32Be => "s32be",
            AudioFormat::F32Le => "f32le",
            AudioFormat::F32Be => "f32be",
        };
        f.write_str(name)
    }
}

/// The format of one opened device. Immutable for the lifetime of the open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub format: AudioFormat,
    pub channels: u8,
    pub freq: u32,
}

impl AudioSpec {
    /// Bytes per interleaved frame (one sample for every channel).
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }
}

impl Default for AudioSpec {
    fn default() -> Self {
        Self {
            format: AudioFormat::F32Le,
            channels: 2,
            freq: 44100,
        }
    }
}

/// Snapshot of one enumerable device. Stale as soon as enumeration returns.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub channels: u8,
    pub sample_rate: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("audio subsystem unavailable: {0}")]
    Init(String),
    #[error("backend is not initialized")]
    NotInitialized,
    #[error("failed to open device `{id}`: {reason}")]
    DeviceOpen { id: String, reason: String },
    #[error("invalid device handle {0}")]
    InvalidHandle(DeviceHandle),
    #[error("failed to create device stream: {0}")]
    StreamCreate(String),
}

/// The render callback bound to a device stream.
///
/// Invoked on the backend's audio thread whenever the device needs more
/// samples. The callee must fill the whole slice with interleaved PCM in the
/// device's obtained spec; if it has less, it zeroes first and writes what it
/// has. It must tolerate running while the owning handle is being closed.
pub type AudioCallback = Arc<dyn Fn(&mut [u8]) + Send + Sync + 'static>;

/// Push-mode surface of a device-bound stream. The engine's core path uses
/// the callback form; `put_data`/`get_data` exist for embedders that push
/// pre-mixed PCM. Dropping the stream stops callbacks.
pub trait BackendStream: Send {
    fn put_data(&mut self, data: &[u8]) -> bool;
    fn get_data(&mut self, out: &mut [u8]) -> usize;
    fn clear(&mut self);
    fn pause(&mut self) -> bool;
    fn resume(&mut self) -> bool;
    fn is_paused(&self) -> bool;
    fn queued_bytes(&self) -> usize;
    fn bind_to_device(&mut self) -> bool;
    fn unbind_from_device(&mut self);
}

/// Contract every playback backend implements. One instance per process is
/// the expected usage, but nothing enforces it; all state is per-instance.
pub trait AudioBackend: Send + Sync {
    fn init(&self) -> Result<(), BackendError>;

    /// Closes every open device. Idempotent; never fails.
    fn shutdown(&self);

    fn is_initialized(&self) -> bool;

    fn name(&self) -> &str;

    /// Ordered device list, default device first.
    fn enumerate_devices(&self, playback: bool) -> Result<Vec<DeviceInfo>, BackendError>;

    fn get_default_device(&self, playback: bool) -> Result<DeviceInfo, BackendError>;

    /// Opens `id` (or `"default"`). Returns the handle and the spec the
    /// device actually obtained; never returns a partially opened device.
    fn open_device(
        &self,
        id: &str,
        wanted: &AudioSpec,
    ) -> Result<(DeviceHandle, AudioSpec), BackendError>;

    /// Silently ignores unknown handles so teardown paths can close blindly.
    fn close_device(&self, handle: DeviceHandle);

    fn get_device_format(&self, handle: DeviceHandle) -> Result<AudioFormat, BackendError>;
    fn get_device_freq(&self, handle: DeviceHandle) -> Result<u32, BackendError>;
    fn get_device_channels(&self, handle: DeviceHandle) -> Result<u8, BackendError>;
    fn get_device_gain(&self, handle: DeviceHandle) -> Result<f32, BackendError>;
    fn set_device_gain(&self, handle: DeviceHandle, gain: f32) -> Result<(), BackendError>;

    fn pause_device(&self, handle: DeviceHandle) -> bool;
    fn resume_device(&self, handle: DeviceHandle) -> bool;
    fn is_device_paused(&self, handle: DeviceHandle) -> Result<bool, BackendError>;

    fn mute_device(&self, handle: DeviceHandle) -> bool;
    fn unmute_device(&self, handle: DeviceHandle) -> bool;
    fn is_device_muted(&self, handle: DeviceHandle) -> Result<bool, BackendError>;

    /// Creates a stream bound to `handle` that pulls data through `callback`
    /// on the backend's audio thread.
    fn create_stream(
        &self,
        handle: DeviceHandle,
        spec: &AudioSpec,
        callback: AudioCallback,
    ) -> Result<Box<dyn BackendStream>, BackendError>;

    fn supports_recording(&self) -> bool {
        false
    }

    fn supports_mute(&self) -> bool {
        true
    }

    fn max_open_devices(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_counts_all_channels() {
        let spec = AudioSpec {
            format: AudioFormat::S16Le,
            channels: 2,
            freq: 48000,
        };
        assert_eq!(spec.frame_size(), 4);
        let spec = AudioSpec {
            format: AudioFormat::F32Le,
            channels: 6,
            freq: 48000,
        };
        assert_eq!(spec.frame_size(), 24);
    }

    #[test]
    fn format_sizes() {
        assert_eq!(AudioFormat::U8.bytes_per_sample(), 1);
        assert_eq!(AudioFormat::S8.bytes_per_sample(), 1);
        assert_eq!(AudioFormat::S16Be.bytes_per_sample(), 2);
        assert_eq!(AudioFormat::S32Le.bytes_per_sample(), 4);
        assert_eq!(AudioFormat::F32Be.bytes_per_sample(), 4);
    }
}
