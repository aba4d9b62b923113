//! ALSA backed codec driver.
//!
//! Simplex wiring opens capture and playback on separate devices that may
//! run at different rates. Duplex wiring shares one device and therefore one
//! clock, so both directions must use the same rate. With a reference input
//! the capture stream carries two interleaved channels (mic, reference).

use alsa::PCM;
use alsa::mixer::{Mixer, SelemId};
use anyhow::{Context, Result, anyhow, ensure};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::alsa_device;
use super::codec::{Codec, CodecDriver, CodecFormat};
use crate::settings::Settings;

const MIXER_CONTROLS: [&str; 3] = ["Master", "Speaker", "PCM"];

#[derive(Debug, Clone)]
pub struct AlsaCodecConfig {
    pub capture_device: String,
    pub playback_device: String,
    pub format: CodecFormat,
}

pub struct AlsaDriver {
    config: AlsaCodecConfig,
    capture: Mutex<Option<PCM>>,
    playback: Mutex<Option<PCM>>,
    software_gain: AtomicBool,
}

pub type AlsaCodec = Codec<AlsaDriver>;

/// Separate mic and speaker devices.
pub fn simplex(
    capture_device: &str,
    playback_device: &str,
    input_sample_rate: u32,
    output_sample_rate: u32,
    input_reference: bool,
    settings: Settings,
) -> AlsaCodec {
    let config = AlsaCodecConfig {
        capture_device: capture_device.to_string(),
        playback_device: playback_device.to_string(),
        format: CodecFormat {
            input_sample_rate,
            output_sample_rate,
            input_reference,
            duplex: false,
        },
    };
    Codec::new(config.format, AlsaDriver::new(config), settings)
}

/// One device for both directions.
pub fn duplex(
    device: &str,
    input_sample_rate: u32,
    output_sample_rate: u32,
    input_reference: bool,
    settings: Settings,
) -> Result<AlsaCodec> {
    ensure!(
        input_sample_rate == output_sample_rate,
        "Duplex codec requires equal rates, got input {}Hz and output {}Hz",
        input_sample_rate,
        output_sample_rate
    );
    let config = AlsaCodecConfig {
        capture_device: device.to_string(),
        playback_device: device.to_string(),
        format: CodecFormat {
            input_sample_rate,
            output_sample_rate,
            input_reference,
            duplex: true,
        },
    };
    Ok(Codec::new(config.format, AlsaDriver::new(config), settings))
}

impl AlsaDriver {
    fn new(config: AlsaCodecConfig) -> Self {
        Self {
            config,
            capture: Mutex::new(None),
            playback: Mutex::new(None),
            software_gain: AtomicBool::new(true),
        }
    }

    fn set_mixer_volume(&self, volume: i32) -> Result<()> {
        let card = alsa_device::mixer_card(&self.config.playback_device);
        let mixer = Mixer::new(&card, false)
            .with_context(|| format!("Failed to open mixer {}", card))?;
        let selem = MIXER_CONTROLS
            .iter()
            .find_map(|name| mixer.find_selem(&SelemId::new(name, 0)))
            .ok_or_else(|| anyhow!("No playback volume control on {}", card))?;
        let (min, max) = selem.get_playback_volume_range();
        let value = min + (max - min) * volume as i64 / 100;
        selem.set_playback_volume_all(value)?;
        Ok(())
    }
}

impl CodecDriver for AlsaDriver {
    fn start_channels(&self) -> Result<()> {
        let format = &self.config.format;
        let (playback, _) = alsa_device::open_playback(
            &self.config.playback_device,
            format.output_sample_rate,
            1,
        )?;
        let (capture, _) = alsa_device::open_capture(
            &self.config.capture_device,
            format.input_sample_rate,
            format.input_channels(),
        )?;
        *self.playback.lock() = Some(playback);
        *self.capture.lock() = Some(capture);
        Ok(())
    }

    fn read(&self, samples: &mut [i16]) -> Result<usize> {
        let channels = self.config.format.input_channels() as usize;
        let guard = self.capture.lock();
        let pcm = guard.as_ref().ok_or_else(|| anyhow!("capture channel not started"))?;
        let io = pcm.io_i16()?;
        match io.readi(samples) {
            Ok(frames) => Ok(frames * channels),
            Err(e) => {
                let message = e.to_string();
                if let Err(e2) = pcm.try_recover(e, true) {
                    log::error!("Failed to recover PCM capture: {}", e2);
                }
                Err(anyhow!("capture error: {}", message))
            }
        }
    }

    fn write(&self, samples: &[i16], volume: i32) -> Result<usize> {
        let guard = self.playback.lock();
        let pcm = guard.as_ref().ok_or_else(|| anyhow!("playback channel not started"))?;
        let io = pcm.io_i16()?;

        let scaled;
        let data = if self.software_gain.load(Ordering::Relaxed) {
            scaled = samples
                .iter()
                .map(|&s| (s as i32 * volume / 100) as i16)
                .collect::<Vec<_>>();
            &scaled[..]
        } else {
            samples
        };

        // Retry short writes and XRUNs without losing frames.
        let mut written = 0;
        while written < data.len() {
            match io.writei(&data[written..]) {
                Ok(n) => written += n,
                Err(e) => {
                    log::warn!("ALSA playback error: {}, recovering...", e);
                    pcm.try_recover(e, true)
                        .map_err(|e2| anyhow!("Failed to recover PCM playback: {}", e2))?;
                }
            }
        }
        Ok(written)
    }

    fn set_input_enabled(&self, enable: bool) -> Result<()> {
        let guard = self.capture.lock();
        let Some(pcm) = guard.as_ref() else {
            return Ok(());
        };
        if enable {
            pcm.prepare()?;
        } else {
            pcm.drop()?;
        }
        Ok(())
    }

    fn set_output_enabled(&self, enable: bool) -> Result<()> {
        let guard = self.playback.lock();
        let Some(pcm) = guard.as_ref() else {
            return Ok(());
        };
        if enable {
            pcm.prepare()?;
        } else {
            pcm.drain()?;
        }
        Ok(())
    }

    fn apply_output_volume(&self, volume: i32) -> Result<()> {
        match self.set_mixer_volume(volume) {
            Ok(()) => {
                self.software_gain.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                log::debug!("Hardware volume unavailable ({}), using software gain", e);
                self.software_gain.store(true, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}
