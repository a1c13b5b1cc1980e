//! cpal-backed playback. A `cpal::Stream` is not `Send`, so every opened
//! device gets a worker thread that owns the device and its stream; the
//! handle side talks to it over a control channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, StreamConfig};
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::{
    AudioBackend, AudioCallback, AudioFormat, AudioSpec, BackendError, BackendStream,
    DeviceHandle, DeviceInfo,
};

enum CtrlMsg {
    CreateStream {
        callback: AudioCallback,
        done: Sender<Result<(), String>>,
    },
    DropStream,
    Pause,
    Resume,
    Shutdown,
}

/// Flags the data callback reads without locking.
struct DeviceShared {
    gain_bits: AtomicU32,
    muted: AtomicBool,
    paused: AtomicBool,
}

impl DeviceShared {
    fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }
}

struct OpenDevice {
    spec: AudioSpec,
    shared: Arc<DeviceShared>,
    ctrl_tx: Sender<CtrlMsg>,
}

struct CpalState {
    initialized: bool,
    next_handle: DeviceHandle,
    devices: HashMap<DeviceHandle, OpenDevice>,
}

pub struct CpalBackend {
    state: Mutex<CpalState>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CpalState {
                initialized: false,
                next_handle: 1,
                devices: HashMap::new(),
            }),
        }
    }

    fn find_device(&self, id: &str, playback: bool) -> Result<Device, BackendError> {
        let host = cpal::default_host();
        if id.is_empty() || id == "default" {
            let dev = if playback {
                host.default_output_device()
            } else {
                host.default_input_device()
            };
            return dev.ok_or_else(|| BackendError::DeviceOpen {
                id: id.to_string(),
                reason: "no default device".to_string(),
            });
        }
        let mut devices = if playback {
            host.output_devices()
        } else {
            host.input_devices()
        }
        .map_err(|e| BackendError::DeviceOpen {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        devices
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| BackendError::DeviceOpen {
                id: id.to_string(),
                reason: "no such device".to_string(),
            })
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn map_sample_format(fmt: SampleFormat) -> Option<AudioFormat> {
    match fmt {
        SampleFormat::U8 => Some(AudioFormat::U8),
        SampleFormat::I8 => Some(AudioFormat::S8),
        SampleFormat::I16 => Some(AudioFormat::S16Le),
        SampleFormat::I32 => Some(AudioFormat::S32Le),
        SampleFormat::F32 => Some(AudioFormat::F32Le),
        _ => None,
    }
}

impl AudioBackend for CpalBackend {
    fn init(&self) -> Result<(), BackendError> {
        // cpal has no subsystem-wide init; probing the host is the closest
        // check that audio is reachable at all.
        let host = cpal::default_host();
        if host.default_output_device().is_none() {
            return Err(BackendError::Init("no output device available".to_string()));
        }
        self.state.lock().unwrap().initialized = true;
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        for (_, dev) in state.devices.drain() {
            let _ = dev.ctrl_tx.send(CtrlMsg::Shutdown);
        }
        state.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().initialized
    }

    fn name(&self) -> &str {
        "cpal"
    }

    fn enumerate_devices(&self, playback: bool) -> Result<Vec<DeviceInfo>, BackendError> {
        if !self.is_initialized() {
            return Err(BackendError::NotInitialized);
        }
        let host = cpal::default_host();
        let default_name = if playback {
            host.default_output_device()
        } else {
            host.default_input_device()
        }
        .and_then(|d| d.name().ok());

        let devices = if playback {
            host.output_devices()
        } else {
            host.input_devices()
        }
        .map_err(|e| BackendError::Init(e.to_string()))?;

        let mut result = Vec::new();
        for device in devices {
            let Ok(name) = device.name() else { continue };
            let config = if playback {
                device.default_output_config()
            } else {
                device.default_input_config()
            };
            let Ok(config) = config else { continue };
            result.push(DeviceInfo {
                id: name.clone(),
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                channels: config.channels() as u8,
                sample_rate: config.sample_rate().0,
            });
        }
        // Default device first; callers rely on the ordering.
        if let Some(pos) = result.iter().position(|d| d.is_default) {
            let default = result.remove(pos);
            result.insert(0, default);
        } else if let Some(first) = result.first_mut() {
            first.is_default = true;
        }
        Ok(result)
    }

    fn get_default_device(&self, playback: bool) -> Result<DeviceInfo, BackendError> {
        let devices = self.enumerate_devices(playback)?;
        devices.into_iter().next().ok_or_else(|| BackendError::Init(
            "no devices found".to_string(),
        ))
    }

    fn open_device(
        &self,
        id: &str,
        wanted: &AudioSpec,
    ) -> Result<(DeviceHandle, AudioSpec), BackendError> {
        if !self.is_initialized() {
            return Err(BackendError::NotInitialized);
        }
        let device = self.find_device(id, true)?;
        let supported = device
            .default_output_config()
            .map_err(|e| BackendError::DeviceOpen {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        let sample_format = supported.sample_format();
        let format = map_sample_format(sample_format).ok_or_else(|| BackendError::DeviceOpen {
            id: id.to_string(),
            reason: format!("unsupported sample format {sample_format:?}"),
        })?;
        let config: StreamConfig = supported.config();
        let obtained = AudioSpec {
            format,
            channels: config.channels as u8,
            freq: config.sample_rate.0,
        };
        tracing::debug!(
            wanted = %wanted.format, obtained = %obtained.format,
            freq = obtained.freq, channels = obtained.channels,
            "opened cpal device"
        );

        let shared = Arc::new(DeviceShared {
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        });

        let (ctrl_tx, ctrl_rx) = unbounded();
        let worker_shared = shared.clone();
        thread::spawn(move || {
            worker_loop(device, config, sample_format, ctrl_rx, worker_shared);
        });

        let mut state = self.state.lock().unwrap();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.devices.insert(
            handle,
            OpenDevice {
                spec: obtained,
                shared,
                ctrl_tx,
            },
        );
        Ok((handle, obtained))
    }

    fn close_device(&self, handle: DeviceHandle) {
        let mut state = self.state.lock().unwrap();
        if let Some(dev) = state.devices.remove(&handle) {
            let _ = dev.ctrl_tx.send(CtrlMsg::Shutdown);
        }
    }

    fn get_device_format(&self, handle: DeviceHandle) -> Result<AudioFormat, BackendError> {
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
            .map(|d| d.shared.gain())
            .ok_or(BackendError::InvalidHandle(handle))
    }

    fn set_device_gain(&self, handle: DeviceHandle, gain: f32) -> Result<(), BackendError> {
        let state = self.state.lock().unwrap();
        let dev = state
            .devices
            .get(&handle)
            .ok_or(BackendError::InvalidHandle(handle))?;
        dev.shared
            .gain_bits
            .store(gain.max(0.0).to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn pause_device(&self, handle: DeviceHandle) -> bool {
        let state = self.state.lock().unwrap();
        match state.devices.get(&handle) {
            Some(dev) => {
                dev.shared.paused.store(true, Ordering::Relaxed);
                dev.ctrl_tx.send(CtrlMsg::Pause).is_ok()
            }
            None => false,
        }
    }

    fn resume_device(&self, handle: DeviceHandle) -> bool {
        let state = self.state.lock().unwrap();
        match state.devices.get(&handle) {
            Some(dev) => {
                dev.shared.paused.store(false, Ordering::Relaxed);
                dev.ctrl_tx.send(CtrlMsg::Resume).is_ok()
            }
            None => false,
        }
    }

    fn is_device_paused(&self, handle: DeviceHandle) -> Result<bool, BackendError> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .get(&handle)
            .map(|d| d.shared.paused.load(Ordering::Relaxed))
            .ok_or(BackendError::InvalidHandle(handle))
    }

    fn mute_device(&self, handle: DeviceHandle) -> bool {
        let state = self.state.lock().unwrap();
        match state.devices.get(&handle) {
            Some(dev) => {
                dev.shared.muted.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn unmute_device(&self, handle: DeviceHandle) -> bool {
        let state = self.state.lock().unwrap();
        match state.devices.get(&handle) {
            Some(dev) => {
                dev.shared.muted.store(false, Ordering::Relaxed);
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
            .map(|d| d.shared.muted.load(Ordering::Relaxed))
            .ok_or(BackendError::InvalidHandle(handle))
    }

    fn create_stream(
        &self,
        handle: DeviceHandle,
        _spec: &AudioSpec,
        callback: AudioCallback,
    ) -> Result<Box<dyn BackendStream>, BackendError> {
        let ctrl_tx = {
            let state = self.state.lock().unwrap();
            state
                .devices
                .get(&handle)
                .map(|d| d.ctrl_tx.clone())
                .ok_or(BackendError::InvalidHandle(handle))?
        };
        let (done_tx, done_rx) = unbounded();
        ctrl_tx
            .send(CtrlMsg::CreateStream {
                callback,
                done: done_tx,
            })
            .map_err(|_| BackendError::StreamCreate("device worker is gone".to_string()))?;
        match done_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                ctrl_tx,
                paused: false,
            })),
            Ok(Err(reason)) => Err(BackendError::StreamCreate(reason)),
            Err(_) => Err(BackendError::StreamCreate(
                "device worker is gone".to_string(),
            )),
        }
    }

    fn max_open_devices(&self) -> usize {
        32
    }
}

/// Callback-mode stream handle; push-mode calls are inert.
struct CpalStream {
    ctrl_tx: Sender<CtrlMsg>,
    paused: bool,
}

impl BackendStream for CpalStream {
    fn put_data(&mut self, _data: &[u8]) -> bool {
        false
    }

    fn get_data(&mut self, _out: &mut [u8]) -> usize {
        0
    }

    fn clear(&mut self) {}

    fn pause(&mut self) -> bool {
        self.paused = true;
        self.ctrl_tx.send(CtrlMsg::Pause).is_ok()
    }

    fn resume(&mut self) -> bool {
        self.paused = false;
        self.ctrl_tx.send(CtrlMsg::Resume).is_ok()
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn queued_bytes(&self) -> usize {
        0
    }

    fn bind_to_device(&mut self) -> bool {
        self.resume()
    }

    fn unbind_from_device(&mut self) {
        let _ = self.ctrl_tx.send(CtrlMsg::DropStream);
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.ctrl_tx.send(CtrlMsg::DropStream);
    }
}

fn worker_loop(
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    ctrl_rx: Receiver<CtrlMsg>,
    shared: Arc<DeviceShared>,
) {
    let mut stream: Option<cpal::Stream> = None;

    loop {
        while let Ok(msg) = ctrl_rx.try_recv() {
            match msg {
                CtrlMsg::CreateStream { callback, done } => {
                    let built =
                        build_stream(&device, &config, sample_format, callback, shared.clone());
                    match built {
                        Ok(s) => {
                            let res = s.play().map_err(|e| e.to_string());
                            if res.is_ok() {
                                stream = Some(s);
                            }
                            let _ = done.send(res);
                        }
                        Err(reason) => {
                            let _ = done.send(Err(reason));
                        }
                    }
                }
                CtrlMsg::DropStream => {
                    stream = None;
                }
                CtrlMsg::Pause => {
                    if let Some(s) = &stream {
                        if let Err(e) = s.pause() {
                            tracing::warn!(error = %e, "failed to pause cpal stream");
                        }
                    }
                }
                CtrlMsg::Resume => {
                    if let Some(s) = &stream {
                        if let Err(e) = s.play() {
                            tracing::warn!(error = %e, "failed to resume cpal stream");
                        }
                    }
                }
                CtrlMsg::Shutdown => {
                    return;
                }
            }
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Renders through `callback` into a byte scratch, then converts to the
/// stream's sample type with gain and mute applied. A panicking render
/// closure yields silence for that block.
fn build_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    callback: AudioCallback,
    shared: Arc<DeviceShared>,
) -> Result<cpal::Stream, String> {
    let err_cb = |err: cpal::StreamError| {
        tracing::warn!(error = %err, "cpal stream error");
    };
    let result = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            config,
            typed_render(callback, shared, 4, |b, g| {
                f32::from_le_bytes([b[0], b[1], b[2], b[3]]) * g
            }),
            err_cb,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            config,
            typed_render(callback, shared, 2, |b, g| {
                (i16::from_le_bytes([b[0], b[1]]) as f32 * g) as i16
            }),
            err_cb,
            None,
        ),
        SampleFormat::I32 => device.build_output_stream(
            config,
            typed_render(callback, shared, 4, |b, g| {
                (i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 * g) as i32
            }),
            err_cb,
            None,
        ),
        SampleFormat::U8 => device.build_output_stream(
            config,
            typed_render(callback, shared, 1, |b, g| {
                let v = (((b[0] as i32 - 128) as f32 * g) as i32).clamp(-128, 127);
                (v + 128) as u8
            }),
            err_cb,
            None,
        ),
        SampleFormat::I8 => device.build_output_stream(
            config,
            typed_render(callback, shared, 1, |b, g| (b[0] as i8 as f32 * g) as i8),
            err_cb,
            None,
        ),
        other => return Err(format!("unsupported sample format {other:?}")),
    };
    result.map_err(|e| e.to_string())
}

fn typed_render<T, F>(
    callback: AudioCallback,
    shared: Arc<DeviceShared>,
    bytes_per_sample: usize,
    decode: F,
) -> impl FnMut(&mut [T], &cpal::OutputCallbackInfo)
where
    T: cpal::SizedSample + Send + 'static,
    F: Fn(&[u8], f32) -> T + Send + 'static,
{
    let mut scratch: Vec<u8> = Vec::new();
    move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
        let needed = data.len() * bytes_per_sample;
        if scratch.len() < needed {
            scratch.resize(needed, 0);
        }
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback(&mut scratch[..needed]);
        }));
        if res.is_err() || shared.muted.load(Ordering::Relaxed) {
            for s in data.iter_mut() {
                *s = T::EQUILIBRIUM;
            }
            return;
        }
        let gain = shared.gain();
        for (dst, src) in data.iter_mut().zip(scratch.chunks_exact(bytes_per_sample)) {
            *dst = decode(src, gain);
        }
    }
}
