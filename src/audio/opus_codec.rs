//! Opus encode for the mic path, decode for the TTS path.
//!
//! Both sides are mono. The encoder buffers arbitrary PCM lengths and emits
//! one packet per complete frame, so callers can push whatever the codec
//! delivered.

use anyhow::{Result, ensure};

/// 120ms at 48kHz, the largest frame Opus can carry.
const MAX_FRAME_SAMPLES: usize = 5760;
const MAX_PACKET_BYTES: usize = 1500;

fn channels(count: u32) -> Result<opus::Channels> {
    match count {
        1 => Ok(opus::Channels::Mono),
        2 => Ok(opus::Channels::Stereo),
        n => anyhow::bail!("Unsupported channel count {}", n),
    }
}

pub struct OpusEncoderWrapper {
    encoder: opus::Encoder,
    frame_size: usize,
    in_buffer: Vec<i16>,
}

impl OpusEncoderWrapper {
    pub fn new(sample_rate: u32, channel_count: u32, duration_ms: u32) -> Result<Self> {
        let mut encoder = opus::Encoder::new(
            sample_rate,
            channels(channel_count)?,
            opus::Application::Voip,
        )?;
        encoder.set_vbr(true)?;
        let frame_size = (sample_rate * duration_ms / 1000 * channel_count) as usize;
        Ok(Self {
            encoder,
            frame_size,
            in_buffer: Vec::with_capacity(frame_size * 2),
        })
    }

    /// Samples per complete frame.
    #[cfg(test)]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Append `pcm` and encode every complete frame now buffered, in order.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<Vec<u8>>> {
        self.in_buffer.extend_from_slice(pcm);
        let mut packets = Vec::new();
        while self.in_buffer.len() >= self.frame_size {
            let mut out = vec![0u8; MAX_PACKET_BYTES];
            let len = self.encoder.encode(&self.in_buffer[..self.frame_size], &mut out)?;
            out.truncate(len);
            packets.push(out);
            self.in_buffer.drain(..self.frame_size);
        }
        Ok(packets)
    }

    /// Whether a partial frame is waiting for more samples.
    #[cfg(test)]
    pub fn has_buffered(&self) -> bool {
        !self.in_buffer.is_empty()
    }

    pub fn reset_state(&mut self) {
        if let Err(e) = self.encoder.reset_state() {
            log::warn!("Failed to reset opus encoder: {}", e);
        }
        self.in_buffer.clear();
    }
}

pub struct OpusDecoderWrapper {
    decoder: opus::Decoder,
    sample_rate: u32,
    channel_count: u32,
    duration_ms: u32,
}

impl OpusDecoderWrapper {
    pub fn new(sample_rate: u32, channel_count: u32, duration_ms: u32) -> Result<Self> {
        let decoder = opus::Decoder::new(sample_rate, channels(channel_count)?)?;
        Ok(Self {
            decoder,
            sample_rate,
            channel_count,
            duration_ms,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    pub fn decode(&mut self, opus_data: &[u8]) -> Result<Vec<i16>> {
        ensure!(!opus_data.is_empty(), "empty opus packet");
        let mut pcm = vec![0i16; MAX_FRAME_SAMPLES * self.channel_count as usize];
        let samples_per_channel = self.decoder.decode(opus_data, &mut pcm, false)?;
        pcm.truncate(samples_per_channel * self.channel_count as usize);
        Ok(pcm)
    }

    pub fn reset_state(&mut self) {
        if let Err(e) = self.decoder.reset_state() {
            log::warn!("Failed to reset opus decoder: {}", e);
        }
    }
}
