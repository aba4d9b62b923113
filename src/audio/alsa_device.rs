//! ALSA PCM device wrappers for the codec driver.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result, ensure};

/// Frames per period, the ALSA counterpart of the I2S DMA frame count.
pub const PERIOD_FRAMES: usize = 240;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
}

/// Open a PCM device for capture (recording).
pub fn open_capture(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, channels, "Capture")
}

/// Open a PCM device for playback.
pub fn open_playback(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Playback, sample_rate, channels, "Playback")
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        hwp.set_period_size_near(PERIOD_FRAMES as alsa::pcm::Frames, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }

    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        (hwp.get_rate()?, hwp.get_channels()?, hwp.get_period_size()? as usize)
    };

    // The codec advertises a fixed rate to the resamplers, so a silently
    // different hardware rate would pitch-shift everything.
    ensure!(
        actual_rate == sample_rate,
        "{} device '{}' negotiated {}Hz instead of {}Hz",
        dir_name,
        device,
        actual_rate,
        sample_rate
    );
    ensure!(
        actual_channels == channels,
        "{} device '{}' negotiated {} channels instead of {}",
        dir_name,
        device,
        actual_channels,
        channels
    );

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok((
        pcm,
        AlsaParams {
            sample_rate: actual_rate,
            channels: actual_channels,
            period_size,
        },
    ))
}

/// Mixer card name for a PCM device string ("plughw:1,0" -> "hw:1").
pub fn mixer_card(device: &str) -> String {
    let card = device
        .strip_prefix("plughw:")
        .or_else(|| device.strip_prefix("hw:"))
        .and_then(|rest| rest.split(',').next());
    match card {
        Some(card) if !card.is_empty() => format!("hw:{}", card),
        _ => "default".to_string(),
    }
}
