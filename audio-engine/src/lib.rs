//! Polyphonic mixing engine: many decoded streams, one device callback.
//!
//! An [`AudioSystem`] owns a backend and one mixing world. Opening a device
//! activates it; [`AudioDevice::create_stream`] turns an [`AudioSource`]
//! (a decoder plus its io stream) into an [`AudioStream`] that can be
//! played, paused, faded, looped and dropped freely while the device
//! callback mixes on its own thread. Finish and loop notifications queue up
//! until the embedder calls [`AudioSystem::dispatch_callbacks`].

pub mod decoder;
pub mod io;
pub mod processor;
pub mod source;
pub mod synth;

mod dispatcher;
mod error;
mod fade;
mod in_use;
mod mixer;
mod registry;
mod stream;
mod system;

pub use decoder::Decoder;
pub use error::AudioError;
pub use io::{IoStream, MemoryStream, SeekWhence};
pub use processor::Processor;
pub use source::AudioSource;
pub use stream::{AudioStream, StreamToken};
pub use system::{AudioDevice, AudioSystem};
