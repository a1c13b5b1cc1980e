//! Decoder contract the engine consumes; codecs live outside this crate.

use std::time::Duration;

use crate::error::AudioError;
use crate::io::IoStream;

/// Produces interleaved f32 samples at its native rate and channel count.
///
/// Non-seekable decoders return false from [`rewind`](Decoder::rewind) and
/// [`seek_to_time`](Decoder::seek_to_time); the mixer then treats the stream
/// as finite and plays it once.
pub trait Decoder: Send {
    fn open(&mut self, io: &mut dyn IoStream) -> Result<(), AudioError>;

    /// 1..=8 once opened.
    fn channels(&self) -> u8;

    fn rate(&self) -> u32;

    fn rewind(&mut self) -> bool;

    /// Total duration; zero when unknown.
    fn duration(&self) -> Duration;

    fn seek_to_time(&mut self, pos: Duration) -> bool;

    /// Writes interleaved samples into `out` and returns the count written.
    /// `call_again` is set when more data remains after this call.
    fn decode(&mut self, out: &mut [f32], call_again: &mut bool) -> usize;

    fn name(&self) -> &str;
}
