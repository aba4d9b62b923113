//! Output surfaces the core reports to. Rendering lives elsewhere.

use std::time::Duration;

use crate::state_machine::DeviceState;

pub trait Display: Send + Sync {
    fn set_status(&self, status: &str);
    fn show_notification(&self, message: &str, duration: Duration);
    fn set_chat_message(&self, role: &str, content: &str);
    fn set_emotion(&self, emotion: &str);
    fn set_brightness(&self, _brightness: u8) {}
}

pub trait Led: Send + Sync {
    fn on_state_changed(&self, state: DeviceState);
}

/// Boards without a status LED.
pub struct NoLed;

impl Led for NoLed {
    fn on_state_changed(&self, _state: DeviceState) {}
}
