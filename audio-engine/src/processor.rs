//! Per-stream DSP hook applied between decode and gain/mix.

/// In-callback transform over one block of interleaved f32.
///
/// Runs on the audio thread: implementations must not allocate, block, or
/// make syscalls. `out` and `input` have equal length.
pub trait Processor: Send + Sync {
    fn process(&self, out: &mut [f32], input: &[f32]);
}
