//! Synthetic decoders: test tones and silence. These stand in for real
//! codecs in examples and tests; they generate rather than parse, so the
//! io stream handed to `open` is ignored.

use std::f32::consts::PI;
use std::time::Duration;

use crate::decoder::Decoder;
use crate::error::AudioError;
use crate::io::IoStream;

/// Fixed-length sine tone.
pub struct SineDecoder {
    freq: f32,
    amplitude: f32,
    rate: u32,
    channels: u8,
    total_frames: u64,
    pos_frames: u64,
    seekable: bool,
}

impl SineDecoder {
    pub fn new(freq: f32, amplitude: f32, rate: u32, channels: u8, total_frames: u64) -> Self {
        Self {
            freq,
            amplitude,
            rate,
            channels,
            total_frames,
            pos_frames: 0,
            seekable: true,
        }
    }

    /// Makes `rewind`/`seek_to_time` report failure, like a live source.
    pub fn non_seekable(mut self) -> Self {
        self.seekable = false;
        self
    }
}

impl Decoder for SineDecoder {
    fn open(&mut self, _io: &mut dyn IoStream) -> Result<(), AudioError> {
        Ok(())
    }

    fn channels(&self) -> u8 {
        self.channels
    }

    fn rate(&self) -> u32 {
        self.rate
    }

    fn rewind(&mut self) -> bool {
        if !self.seekable {
            return false;
        }
        self.pos_frames = 0;
        true
    }

    fn duration(&self) -> Duration {
        Duration::from_micros(self.total_frames * 1_000_000 / self.rate as u64)
    }

    fn seek_to_time(&mut self, pos: Duration) -> bool {
        if !self.seekable {
            return false;
        }
        let frame = pos.as_micros() as u64 * self.rate as u64 / 1_000_000;
        self.pos_frames = frame.min(self.total_frames);
        true
    }

    fn decode(&mut self, out: &mut [f32], call_again: &mut bool) -> usize {
        let channels = self.channels as usize;
        let remaining = (self.total_frames - self.pos_frames) as usize;
        let frames = (out.len() / channels).min(remaining);
        let step = 2.0 * PI * self.freq / self.rate as f32;
        for i in 0..frames {
            let sample = ((self.pos_frames + i as u64) as f32 * step).sin() * self.amplitude;
            for c in 0..channels {
                out[i * channels + c] = sample;
            }
        }
        self.pos_frames += frames as u64;
        *call_again = self.pos_frames < self.total_frames;
        frames * channels
    }

    fn name(&self) -> &str {
        "sine"
    }
}

/// Fixed-length silence.
pub struct SilenceDecoder {
    rate: u32,
    channels: u8,
    total_frames: u64,
    pos_frames: u64,
}

impl SilenceDecoder {
    pub fn new(rate: u32, channels: u8, total_frames: u64) -> Self {
        Self {
            rate,
            channels,
            total_frames,
            pos_frames: 0,
        }
    }
}

impl Decoder for SilenceDecoder {
    fn open(&mut self, _io: &mut dyn IoStream) -> Result<(), AudioError> {
        Ok(())
    }

    fn channels(&self) -> u8 {
        self.channels
    }

    fn rate(&self) -> u32 {
        self.rate
    }

    fn rewind(&mut self) -> bool {
        self.pos_frames = 0;
        true
    }

    fn duration(&self) -> Duration {
        Duration::from_micros(self.total_frames * 1_000_000 / self.rate as u64)
    }

    fn seek_to_time(&mut self, pos: Duration) -> bool {
        let frame = pos.as_micros() as u64 * self.rate as u64 / 1_000_000;
        self.pos_frames = frame.min(self.total_frames);
        true
    }

    fn decode(&mut self, out: &mut [f32], call_again: &mut bool) -> usize {
        let channels = self.channels as usize;
        let remaining = (self.total_frames - self.pos_frames) as usize;
        let frames = (out.len() / channels).min(remaining);
        out[..frames * channels].fill(0.0);
        self.pos_frames += frames as u64;
        *call_again = self.pos_frames < self.total_frames;
        frames * channels
    }

    fn name(&self) -> &str {
        "silence"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStream;

    #[test]
    fn sine_reports_duration_and_length() {
        let mut io = MemoryStream::empty();
        let mut dec = SineDecoder::new(440.0, 0.5, 44100, 2, 44100);
        dec.open(&mut io).unwrap();
        assert_eq!(dec.duration(), Duration::from_secs(1));

        let mut out = vec![0f32; 1024];
        let mut total = 0usize;
        let mut call_again = true;
        while call_again {
            total += dec.decode(&mut out, &mut call_again);
        }
        assert_eq!(total, 44100 * 2);
    }

    #[test]
    fn sine_peak_matches_amplitude() {
        let mut dec = SineDecoder::new(440.0, 0.3, 44100, 1, 4410);
        let mut out = vec![0f32; 4410];
        let mut call_again = false;
        dec.decode(&mut out, &mut call_again);
        let peak = out.iter().fold(0f32, |a, &s| a.max(s.abs()));
        assert!(peak > 0.29 && peak <= 0.3);
    }

    #[test]
    fn non_seekable_refuses_rewind() {
        let mut dec = SineDecoder::new(440.0, 0.5, 44100, 2, 64).non_seekable();
        let mut out = vec![0f32; 256];
        let mut call_again = false;
        dec.decode(&mut out, &mut call_again);
        assert!(!dec.rewind());
        assert!(!dec.seek_to_time(Duration::ZERO));
    }

    #[test]
    fn silence_is_silent() {
        let mut dec = SilenceDecoder::new(44100, 2, 1000);
        let mut out = vec![1f32; 512];
        let mut call_again = false;
        let n = dec.decode(&mut out, &mut call_again);
        assert_eq!(n, 512);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(call_again);
    }
}
