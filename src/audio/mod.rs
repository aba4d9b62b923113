//! audio - codec abstraction and the real-time audio pipeline
//!
//! ALSA provides the PCM channels, Opus compresses the voice stream and the
//! SpeexDSP resampler bridges the codec's native rates and the 16kHz wire rate.

mod alsa_device;
pub mod alsa_codec;
mod audio_service;
mod codec;
#[cfg(test)]
mod mock;
mod opus_codec;
mod resampler;
mod speex;

pub use audio_service::{AudioService, AudioServiceCallbacks};
pub use codec::AudioCodec;
#[cfg(test)]
pub use codec::{Codec, CodecFormat};
#[cfg(test)]
pub use mock::MockDriver;
