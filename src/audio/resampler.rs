//! Rate conversion between the codec's native rates and the wire rate.

use anyhow::Result;

use super::speex::SpeexResampler;

const QUALITY: i32 = 4;

/// Mono resampler that is a passthrough until configured.
#[derive(Default)]
pub struct OpusResampler {
    input_sample_rate: u32,
    output_sample_rate: u32,
    inner: Option<SpeexResampler>,
}

impl OpusResampler {
    pub fn configure(&mut self, input_sample_rate: u32, output_sample_rate: u32) -> Result<()> {
        self.inner = if input_sample_rate == output_sample_rate {
            None
        } else {
            Some(SpeexResampler::new(input_sample_rate, output_sample_rate, QUALITY)?)
        };
        self.input_sample_rate = input_sample_rate;
        self.output_sample_rate = output_sample_rate;
        log::info!(
            "Resampler configured with input sample rate {} and output sample rate {}",
            input_sample_rate,
            output_sample_rate
        );
        Ok(())
    }

    /// Output length for `input_samples` samples of input.
    pub fn output_samples(&self, input_samples: usize) -> usize {
        if self.input_sample_rate == 0 || self.inner.is_none() {
            return input_samples;
        }
        (input_samples as u64 * self.output_sample_rate as u64 / self.input_sample_rate as u64)
            as usize
    }

    /// Resample `input` into `output` and return the samples produced.
    /// `output` should hold [`output_samples`](Self::output_samples) samples;
    /// a resampler failure produces nothing.
    pub fn process(&mut self, input: &[i16], output: &mut [i16]) -> usize {
        let Some(inner) = self.inner.as_mut() else {
            let n = input.len().min(output.len());
            output[..n].copy_from_slice(&input[..n]);
            return n;
        };
        match inner.process(input, output) {
            Ok((consumed, produced)) => {
                if consumed != input.len() {
                    log::warn!(
                        "Resampler did not consume all input: consumed={}, total={}",
                        consumed,
                        input.len()
                    );
                }
                produced
            }
            Err(e) => {
                log::warn!("Resample failed: {}", e);
                0
            }
        }
    }

    /// Convenience over [`process`](Self::process) that allocates the output.
    pub fn process_vec(&mut self, input: &[i16]) -> Vec<i16> {
        let mut output = vec![0i16; self.output_samples(input.len())];
        let produced = self.process(input, &mut output);
        output.truncate(produced);
        output
    }

    pub fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_is_passthrough() {
        let mut resampler = OpusResampler::default();
        assert_eq!(resampler.output_samples(960), 960);
        assert_eq!(resampler.process_vec(&[1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn output_length_follows_rate_ratio() {
        let mut resampler = OpusResampler::default();
        resampler.configure(24000, 16000).unwrap();
        assert_eq!(resampler.output_samples(1440), 960);
        resampler.configure(16000, 48000).unwrap();
        assert_eq!(resampler.output_samples(960), 2880);
    }

    #[test]
    fn downsampled_frame_fits_expected_size() {
        let mut resampler = OpusResampler::default();
        resampler.configure(48000, 16000).unwrap();
        let input: Vec<i16> = (0..2880)
            .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
            .collect();
        let output = resampler.process_vec(&input);
        assert!(output.len() <= 960);
        assert!(output.len() > 900);
    }
}
