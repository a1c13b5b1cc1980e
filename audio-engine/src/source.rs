//! Pairs a decoder with its io stream and retargets the decoded audio at
//! the device rate and channel layout.

use std::time::Duration;

use crate::decoder::Decoder;
use crate::error::AudioError;
use crate::io::IoStream;

const MAX_CHANNELS: usize = 8;
const MIN_CHUNK_FRAMES: usize = 1024;

/// One decodable audio source, exclusively owned by a stream.
///
/// `open` may be called again (device switches do) and retargets the
/// converter; the decoder itself is opened once.
pub struct AudioSource {
    decoder: Box<dyn Decoder>,
    io: Box<dyn IoStream>,
    opened: bool,
    device_rate: u32,
    // Interleaved source-format samples carried across read_samples calls.
    chunk: Vec<f32>,
    chunk_len: usize,
    chunk_frame: usize,
    frac: f64,
    step: f64,
    exhausted: bool,
}

impl AudioSource {
    pub fn new(decoder: Box<dyn Decoder>, io: Box<dyn IoStream>) -> Self {
        Self {
            decoder,
            io,
            opened: false,
            device_rate: 0,
            chunk: Vec::new(),
            chunk_len: 0,
            chunk_frame: 0,
            frac: 0.0,
            step: 1.0,
            exhausted: false,
        }
    }

    /// Opens the decoder (first call only) and points the rate converter at
    /// `rate`/`channels`. `frame_size` is the device block length in samples
    /// and sizes the internal decode chunk.
    pub fn open(&mut self, rate: u32, channels: u8, frame_size: usize) -> Result<(), AudioError> {
        if !self.opened {
            self.decoder.open(self.io.as_mut())?;
            self.opened = true;
        }
        let src_channels = self.decoder.channels().clamp(1, MAX_CHANNELS as u8) as usize;
        let _ = channels;
        self.device_rate = rate.max(1);
        self.step = self.decoder.rate() as f64 / self.device_rate as f64;
        let chunk_frames = MIN_CHUNK_FRAMES.max(frame_size);
        self.chunk.resize(chunk_frames * src_channels, 0.0);
        self.reset_converter();
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn duration(&self) -> Duration {
        self.decoder.duration()
    }

    /// Rewinds the decoder and clears converter state. False when the
    /// decoder cannot seek.
    pub fn rewind(&mut self) -> bool {
        if !self.opened {
            return false;
        }
        if !self.decoder.rewind() {
            return false;
        }
        self.reset_converter();
        true
    }

    pub fn seek_to_time(&mut self, pos: Duration) -> bool {
        if !self.opened {
            return false;
        }
        if !self.decoder.seek_to_time(pos) {
            return false;
        }
        self.reset_converter();
        true
    }

    /// Fills `out[*cursor..out_len]` (or a prefix of it) with interleaved
    /// device-rate float, advancing `*cursor`. The cursor stops short of
    /// `out_len` exactly when the decoder is exhausted.
    pub fn read_samples(
        &mut self,
        out: &mut [f32],
        cursor: &mut usize,
        out_len: usize,
        out_channels: u32,
    ) {
        if !self.opened || self.exhausted {
            return;
        }
        let out_len = out_len.min(out.len());
        let dst_ch = (out_channels as usize).clamp(1, MAX_CHANNELS);
        let src_ch = self.decoder.channels().clamp(1, MAX_CHANNELS as u8) as usize;

        if self.step == 1.0 && src_ch == dst_ch {
            self.read_direct(out, cursor, out_len);
        } else {
            self.read_converted(out, cursor, out_len, src_ch, dst_ch);
        }
    }

    fn read_direct(&mut self, out: &mut [f32], cursor: &mut usize, out_len: usize) {
        let channels = self.decoder.channels().clamp(1, MAX_CHANNELS as u8) as usize;
        // The remaining span must fit at least one whole frame, or a decoder
        // that cannot make progress would spin here.
        while *cursor + channels <= out_len {
            let mut call_again = false;
            let n = self.decoder.decode(&mut out[*cursor..out_len], &mut call_again);
            *cursor += n;
            if n == 0 {
                if !call_again {
                    self.exhausted = true;
                }
                break;
            }
        }
    }

    fn read_converted(
        &mut self,
        out: &mut [f32],
        cursor: &mut usize,
        out_len: usize,
        src_ch: usize,
        dst_ch: usize,
    ) {
        while *cursor + dst_ch <= out_len {
            // chunk_frame may point past the chunk after a large step.
            let mut frames = (self.chunk_len / src_ch).saturating_sub(self.chunk_frame);
            // Interpolation looks one frame ahead; refill when short.
            if frames < 2 {
                self.refill(src_ch);
                frames = (self.chunk_len / src_ch).saturating_sub(self.chunk_frame);
            }
            // A fully drained decoder with at most one frame left has no
            // interval to interpolate over; holding that frame would fill
            // the tail with DC instead of leaving it short.
            if frames == 0 || (self.exhausted && frames < 2) {
                break;
            }

            let base = self.chunk_frame * src_ch;
            let next = base + src_ch;
            let t = self.frac as f32;
            let mut frame = [0f32; MAX_CHANNELS];
            for c in 0..src_ch {
                let a = self.chunk[base + c];
                let b = self.chunk[next + c];
                frame[c] = a + (b - a) * t;
            }
            write_frame(&mut out[*cursor..*cursor + dst_ch], &frame, src_ch);
            *cursor += dst_ch;

            self.frac += self.step;
            while self.frac >= 1.0 {
                self.frac -= 1.0;
                self.chunk_frame += 1;
            }
        }
    }

    /// Compacts the unconsumed tail of the chunk and decodes more after it.
    /// Frames the cursor skipped past the end of the old chunk carry over as
    /// an offset into the new one. Returns false when the decoder has
    /// nothing further.
    fn refill(&mut self, src_ch: usize) -> bool {
        let total_frames = self.chunk_len / src_ch;
        let keep_from = self.chunk_frame.min(total_frames);
        let consumed = keep_from * src_ch;
        self.chunk.copy_within(consumed..self.chunk_len, 0);
        self.chunk_len -= consumed;
        self.chunk_frame -= keep_from;

        let mut got_any = false;
        while self.chunk_len + src_ch <= self.chunk.len() {
            let mut call_again = false;
            let n = self
                .decoder
                .decode(&mut self.chunk[self.chunk_len..], &mut call_again);
            // Keep whole frames only.
            self.chunk_len += n - n % src_ch;
            if n > 0 {
                got_any = true;
            }
            if n == 0 {
                if !call_again {
                    self.exhausted = true;
                }
                break;
            }
            if !call_again {
                self.exhausted = true;
                break;
            }
        }
        got_any
    }

    fn reset_converter(&mut self) {
        self.chunk_len = 0;
        self.chunk_frame = 0;
        self.frac = 0.0;
        self.exhausted = false;
    }
}

/// Maps one interpolated source frame onto the device channel layout:
/// mono fans out, multichannel folds down to mono by average, otherwise
/// channels copy across with silence for the excess.
fn write_frame(out: &mut [f32], frame: &[f32; MAX_CHANNELS], src_ch: usize) {
    let dst_ch = out.len();
    if src_ch == dst_ch {
        out.copy_from_slice(&frame[..dst_ch]);
    } else if src_ch == 1 {
        out.fill(frame[0]);
    } else if dst_ch == 1 {
        out[0] = frame[..src_ch].iter().sum::<f32>() / src_ch as f32;
    } else {
        for (c, dst) in out.iter_mut().enumerate() {
            *dst = if c < src_ch { frame[c] } else { 0.0 };
        }
    }
}
