//! Board glue: owns the peripherals and hands out shared handles.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::audio::AudioCodec;
use crate::display::{Display, Led};
use crate::power_save_timer::PowerSaveTimer;
use crate::settings::Settings;

const DEFAULT_BRIGHTNESS: i64 = 75;
const SLEEP_BRIGHTNESS: u8 = 10;

pub trait Board: Send + Sync {
    fn board_type(&self) -> &str;
    fn audio_codec(&self) -> Arc<dyn AudioCodec>;
    fn display(&self) -> Arc<dyn Display>;
    fn led(&self) -> Arc<dyn Led>;
    /// Arm or disarm the idle watchdog. Off while a conversation is open.
    fn set_power_save_mode(&self, enabled: bool);
    /// User interaction seen: restart the idle count and leave light sleep.
    fn wake_up(&self);
}

/// A Linux host: ALSA codec, GUI process display, no LED.
pub struct LinuxBoard {
    board_type: String,
    codec: Arc<dyn AudioCodec>,
    display: Arc<dyn Display>,
    led: Arc<dyn Led>,
    settings: Settings,
    power_save_timer: RwLock<Option<Arc<PowerSaveTimer>>>,
}

impl LinuxBoard {
    pub fn new(
        board_type: &str,
        codec: Arc<dyn AudioCodec>,
        display: Arc<dyn Display>,
        led: Arc<dyn Led>,
        settings: Settings,
    ) -> Self {
        Self {
            board_type: board_type.to_string(),
            codec,
            display,
            led,
            settings,
            power_save_timer: RwLock::new(None),
        }
    }

    /// The timer is built after the application it watches, so it is
    /// attached late.
    pub fn attach_power_save_timer(&self, timer: Arc<PowerSaveTimer>) {
        *self.power_save_timer.write() = Some(timer);
    }

    /// Light sleep entered: dim the screen.
    pub fn enter_light_sleep(&self) {
        self.display.set_status("休眠中");
        self.display.set_brightness(SLEEP_BRIGHTNESS);
    }

    /// Light sleep left: restore the saved brightness.
    pub fn exit_light_sleep(&self) {
        self.display.set_brightness(self.brightness());
    }

    fn brightness(&self) -> u8 {
        self.settings
            .get_int("display", "brightness", DEFAULT_BRIGHTNESS)
            .clamp(0, 100) as u8
    }
}

impl Board for LinuxBoard {
    fn board_type(&self) -> &str {
        &self.board_type
    }

    fn audio_codec(&self) -> Arc<dyn AudioCodec> {
        self.codec.clone()
    }

    fn display(&self) -> Arc<dyn Display> {
        self.display.clone()
    }

    fn led(&self) -> Arc<dyn Led> {
        self.led.clone()
    }

    fn set_power_save_mode(&self, enabled: bool) {
        log::info!("Power save mode {}", if enabled { "on" } else { "off" });
        if let Some(timer) = &*self.power_save_timer.read() {
            timer.set_enabled(enabled);
        }
    }

    fn wake_up(&self) {
        if let Some(timer) = &*self.power_save_timer.read() {
            timer.wake_up();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{Codec, CodecFormat, MockDriver};
    use crate::display::NoLed;
    use crate::power_save_timer::SleepHost;
    use parking_lot::Mutex;
    use std::sync::Weak;
    use std::time::Duration;
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct BrightnessLog(Mutex<Vec<u8>>);

    impl Display for BrightnessLog {
        fn set_status(&self, _status: &str) {}
        fn show_notification(&self, _message: &str, _duration: Duration) {}
        fn set_chat_message(&self, _role: &str, _content: &str) {}
        fn set_emotion(&self, _emotion: &str) {}
        fn set_brightness(&self, brightness: u8) {
            self.0.lock().push(brightness);
        }
    }

    struct AlwaysIdle;

    impl SleepHost for AlwaysIdle {
        fn can_enter_sleep_mode(&self) -> bool {
            true
        }
        fn is_wake_word_running(&self) -> bool {
            false
        }
        fn enable_wake_word_detection(&self, _enable: bool) {}
        fn is_audio_input_enabled(&self) -> bool {
            false
        }
        fn enable_audio_input(&self, _enable: bool) {}
    }

    fn board(settings: &Settings, display: Arc<BrightnessLog>) -> LinuxBoard {
        let format = CodecFormat {
            input_sample_rate: 16000,
            output_sample_rate: 16000,
            input_reference: false,
            duplex: false,
        };
        let codec = Arc::new(Codec::new(format, MockDriver::default(), settings.clone()));
        LinuxBoard::new("linux", codec, display, Arc::new(NoLed), settings.clone())
    }

    #[test]
    fn light_sleep_dims_and_restores_saved_brightness() {
        let settings = Settings::in_memory();
        settings.set_int("display", "brightness", 60).unwrap();
        let display = Arc::new(BrightnessLog::default());
        let board = board(&settings, display.clone());

        board.enter_light_sleep();
        board.exit_light_sleep();
        assert_eq!(*display.0.lock(), vec![10, 60]);
    }

    #[tokio::test]
    async fn power_save_mode_drives_the_attached_timer() {
        let settings = Settings::in_memory();
        let board = board(&settings, Arc::new(BrightnessLog::default()));
        // Without a timer both calls are harmless.
        board.set_power_save_mode(true);
        board.wake_up();

        let host: Arc<dyn SleepHost> = Arc::new(AlwaysIdle);
        let weak: Weak<dyn SleepHost> = Arc::downgrade(&host);
        let timer = PowerSaveTimer::new(-1, 2, -1, settings, weak, None, Handle::current());
        board.attach_power_save_timer(timer.clone());

        board.set_power_save_mode(true);
        assert!(timer.is_enabled());
        timer.tick();
        assert_eq!(timer.ticks(), 1);
        board.wake_up();
        assert_eq!(timer.ticks(), 0);
        board.set_power_save_mode(false);
        assert!(!timer.is_enabled());
    }
}
