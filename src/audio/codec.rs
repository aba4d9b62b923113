//! Audio codec abstraction.
//!
//! [`AudioCodec`] is the surface the rest of the firmware sees. The shared
//! behaviour (idempotent enables, volume clamping and persistence, dropping
//! I/O while a direction is disabled) lives in [`Codec`], which delegates the
//! actual bus work to a [`CodecDriver`].

use anyhow::Result;
use parking_lot::Mutex;

use crate::settings::Settings;

const FALLBACK_OUTPUT_VOLUME: i32 = 10;

/// PCM source/sink used by the audio service and board glue.
pub trait AudioCodec: Send + Sync {
    /// Bring up the channels. Errors here are fatal for the device.
    fn start(&self) -> Result<()>;

    /// Fill `samples` (its current length) from the input channel.
    /// Returns `false` when input is disabled or nothing was captured.
    fn input_data(&self, samples: &mut Vec<i16>) -> bool;

    /// Blocking write of all `samples`. Dropped while output is disabled.
    fn output_data(&self, samples: &[i16]);

    fn enable_input(&self, enable: bool);
    fn enable_output(&self, enable: bool);
    fn set_output_volume(&self, volume: i32);

    fn output_volume(&self) -> i32;
    fn input_enabled(&self) -> bool;
    fn output_enabled(&self) -> bool;

    fn input_sample_rate(&self) -> u32;
    fn output_sample_rate(&self) -> u32;
    /// 2 when a reference channel is interleaved after every mic sample.
    fn input_channels(&self) -> u32;
    fn input_reference(&self) -> bool;
    fn duplex(&self) -> bool;
}

/// Static description of a codec wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecFormat {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub input_reference: bool,
    pub duplex: bool,
}

impl CodecFormat {
    pub fn input_channels(&self) -> u32 {
        if self.input_reference { 2 } else { 1 }
    }
}

/// Hardware seam under [`Codec`].
///
/// Implementations keep capture and playback behind separate locks so a
/// blocking read never stalls a write. Runtime `read`/`write` errors are
/// reported to the caller, which logs them and treats them as a zero-length
/// transfer.
pub trait CodecDriver: Send + Sync {
    fn start_channels(&self) -> Result<()>;
    /// Returns the number of samples (not frames) captured.
    fn read(&self, samples: &mut [i16]) -> Result<usize>;
    /// Returns the number of samples written.
    fn write(&self, samples: &[i16], volume: i32) -> Result<usize>;
    fn set_input_enabled(&self, enable: bool) -> Result<()>;
    fn set_output_enabled(&self, enable: bool) -> Result<()>;
    fn apply_output_volume(&self, volume: i32) -> Result<()>;
}

struct CodecState {
    started: bool,
    input_enabled: bool,
    output_enabled: bool,
    output_volume: i32,
}

/// Common [`AudioCodec`] implementation over any [`CodecDriver`].
pub struct Codec<D: CodecDriver> {
    format: CodecFormat,
    settings: Settings,
    state: Mutex<CodecState>,
    driver: D,
}

impl<D: CodecDriver> Codec<D> {
    pub fn new(format: CodecFormat, driver: D, settings: Settings) -> Self {
        Self {
            format,
            settings,
            state: Mutex::new(CodecState {
                started: false,
                input_enabled: false,
                output_enabled: false,
                output_volume: FALLBACK_OUTPUT_VOLUME,
            }),
            driver,
        }
    }

    #[cfg(test)]
    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: CodecDriver> AudioCodec for Codec<D> {
    fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.started {
                log::debug!("Audio codec already started");
                return Ok(());
            }

            // Absent and non-positive values both mean the fallback.
            let stored = self.settings.get_int("audio", "output_volume", 0);
            state.output_volume = if stored <= 0 {
                FALLBACK_OUTPUT_VOLUME
            } else {
                stored.min(100) as i32
            };
            self.driver.start_channels()?;
            if let Err(e) = self.driver.apply_output_volume(state.output_volume) {
                log::warn!("Failed to apply output volume {}: {}", state.output_volume, e);
            }
            state.started = true;
            log::info!(
                "Audio codec started: input {}Hz x{}, output {}Hz, {}",
                self.format.input_sample_rate,
                self.format.input_channels(),
                self.format.output_sample_rate,
                if self.format.duplex { "duplex" } else { "simplex" },
            );
        }

        self.enable_input(true);
        self.enable_output(true);
        Ok(())
    }

    fn input_data(&self, samples: &mut Vec<i16>) -> bool {
        if !self.input_enabled() {
            return false;
        }
        match self.driver.read(samples) {
            Ok(0) => false,
            Ok(n) => {
                samples.truncate(n);
                true
            }
            Err(e) => {
                log::warn!("Audio read failed: {}", e);
                false
            }
        }
    }

    fn output_data(&self, samples: &[i16]) {
        let volume = {
            let state = self.state.lock();
            if !state.output_enabled {
                return;
            }
            state.output_volume
        };
        if let Err(e) = self.driver.write(samples, volume) {
            log::warn!("Audio write failed: {}", e);
        }
    }

    fn enable_input(&self, enable: bool) {
        let mut state = self.state.lock();
        if state.input_enabled == enable {
            return;
        }
        if let Err(e) = self.driver.set_input_enabled(enable) {
            log::error!("Failed to {} audio input: {}", if enable { "enable" } else { "disable" }, e);
            return;
        }
        state.input_enabled = enable;
        log::info!("Set input enable to {}", enable);
    }

    fn enable_output(&self, enable: bool) {
        let mut state = self.state.lock();
        if state.output_enabled == enable {
            return;
        }
        if let Err(e) = self.driver.set_output_enabled(enable) {
            log::error!("Failed to {} audio output: {}", if enable { "enable" } else { "disable" }, e);
            return;
        }
        state.output_enabled = enable;
        log::info!("Set output enable to {}", enable);
    }

    fn set_output_volume(&self, volume: i32) {
        let volume = volume.clamp(0, 100);
        {
            let mut state = self.state.lock();
            if let Err(e) = self.driver.apply_output_volume(volume) {
                log::warn!("Failed to apply output volume {}: {}", volume, e);
            }
            state.output_volume = volume;
        }
        if let Err(e) = self.settings.set_int("audio", "output_volume", volume as i64) {
            log::warn!("Failed to persist output volume: {}", e);
        }
        log::info!("Set output volume to {}", volume);
    }

    fn output_volume(&self) -> i32 {
        self.state.lock().output_volume
    }

    fn input_enabled(&self) -> bool {
        self.state.lock().input_enabled
    }

    fn output_enabled(&self) -> bool {
        self.state.lock().output_enabled
    }

    fn input_sample_rate(&self) -> u32 {
        self.format.input_sample_rate
    }

    fn output_sample_rate(&self) -> u32 {
        self.format.output_sample_rate
    }

    fn input_channels(&self) -> u32 {
        self.format.input_channels()
    }

    fn input_reference(&self) -> bool {
        self.format.input_reference
    }

    fn duplex(&self) -> bool {
        self.format.duplex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::MockDriver;

    fn codec(settings: Settings) -> Codec<MockDriver> {
        let format = CodecFormat {
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            input_reference: false,
            duplex: false,
        };
        Codec::new(format, MockDriver::default(), settings)
    }

    #[test]
    fn start_loads_persisted_volume() {
        let settings = Settings::in_memory();
        settings.set_int("audio", "output_volume", 55).unwrap();
        let codec = codec(settings);
        codec.start().unwrap();
        assert_eq!(codec.output_volume(), 55);
        assert!(codec.input_enabled());
        assert!(codec.output_enabled());
    }

    #[test]
    fn start_falls_back_to_ten_for_non_positive_volume() {
        let settings = Settings::in_memory();
        settings.set_int("audio", "output_volume", 0).unwrap();
        let codec = codec(settings);
        codec.start().unwrap();
        assert_eq!(codec.output_volume(), 10);
    }

    #[test]
    fn start_with_no_stored_volume_uses_fallback() {
        let settings = Settings::in_memory();
        let codec = codec(settings.clone());
        codec.start().unwrap();
        assert_eq!(codec.output_volume(), 10);
        assert_eq!(codec.driver().volume(), 10);
        assert_eq!(settings.get_int("audio", "output_volume", -1), -1);
    }

    #[test]
    fn start_twice_claims_hardware_once() {
        let codec = codec(Settings::in_memory());
        codec.start().unwrap();
        codec.start().unwrap();
        assert_eq!(codec.driver().start_calls(), 1);
        assert_eq!(codec.driver().input_toggles().len(), 1);
    }

    #[test]
    fn start_failure_is_reported() {
        let codec = codec(Settings::in_memory());
        codec.driver().fail_start();
        assert!(codec.start().is_err());
        assert!(!codec.input_enabled());
    }

    #[test]
    fn enable_input_twice_is_single_change() {
        let codec = codec(Settings::in_memory());
        codec.enable_input(true);
        codec.enable_input(true);
        assert_eq!(codec.driver().input_toggles(), vec![true]);
        codec.enable_input(false);
        codec.enable_input(false);
        assert_eq!(codec.driver().input_toggles(), vec![true, false]);
    }

    #[test]
    fn volume_is_clamped_applied_and_persisted() {
        let settings = Settings::in_memory();
        let codec = codec(settings.clone());
        for (requested, expected) in [(-20, 0), (0, 0), (55, 55), (100, 100), (250, 100)] {
            codec.set_output_volume(requested);
            assert_eq!(codec.output_volume(), expected);
            assert_eq!(codec.driver().volume(), expected);
            assert_eq!(settings.get_int("audio", "output_volume", -1), expected as i64);
        }
    }

    #[test]
    fn same_volume_twice_leaves_hardware_state_unchanged() {
        let codec = codec(Settings::in_memory());
        codec.set_output_volume(130);
        codec.set_output_volume(100);
        assert_eq!(codec.driver().volume(), 100);
        assert_eq!(codec.output_volume(), 100);
    }

    #[test]
    fn disabled_output_drops_samples() {
        let codec = codec(Settings::in_memory());
        codec.output_data(&[1, 2, 3]);
        assert!(codec.driver().written().is_empty());

        codec.enable_output(true);
        codec.output_data(&[1, 2, 3]);
        assert_eq!(codec.driver().written(), vec![1, 2, 3]);
    }

    #[test]
    fn disabled_input_reads_nothing() {
        let codec = codec(Settings::in_memory());
        codec.driver().feed_capture(&[5; 8]);
        let mut buf = vec![0i16; 4];
        assert!(!codec.input_data(&mut buf));

        codec.enable_input(true);
        assert!(codec.input_data(&mut buf));
        assert_eq!(buf, vec![5; 4]);
    }

    #[test]
    fn read_error_counts_as_zero_samples() {
        let codec = codec(Settings::in_memory());
        codec.enable_input(true);
        codec.driver().fail_io();
        let mut buf = vec![0i16; 4];
        assert!(!codec.input_data(&mut buf));
    }
}
