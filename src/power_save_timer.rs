//! Idle watchdog: light sleep after `seconds_to_sleep` contiguous idle
//! seconds, shutdown request after `seconds_to_shutdown`. Either threshold
//! may be `-1` to disable it.

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

use crate::settings::Settings;
use crate::timer::PeriodicTimer;

const CHECK_PERIOD: Duration = Duration::from_secs(1);

/// What the timer needs to know about, and turn down on, the rest of the device.
pub trait SleepHost: Send + Sync {
    fn can_enter_sleep_mode(&self) -> bool;
    fn is_wake_word_running(&self) -> bool;
    fn enable_wake_word_detection(&self, enable: bool);
    fn is_audio_input_enabled(&self) -> bool;
    fn enable_audio_input(&self, enable: bool);
}

/// Caps the CPU clock during light sleep.
pub trait CpuGovernor: Send + Sync {
    fn limit_max_freq(&self, mhz: i32) -> Result<()>;
    fn restore(&self) -> Result<()>;
}

/// cpufreq policy in sysfs, e.g. `/sys/devices/system/cpu/cpufreq/policy0`.
pub struct SysfsCpuGovernor {
    policy_dir: PathBuf,
    original_khz: Mutex<Option<String>>,
}

impl SysfsCpuGovernor {
    pub fn new(policy_dir: impl Into<PathBuf>) -> Self {
        Self {
            policy_dir: policy_dir.into(),
            original_khz: Mutex::new(None),
        }
    }

    fn max_freq_path(&self) -> PathBuf {
        self.policy_dir.join("scaling_max_freq")
    }
}

impl CpuGovernor for SysfsCpuGovernor {
    fn limit_max_freq(&self, mhz: i32) -> Result<()> {
        let path = self.max_freq_path();
        let mut original = self.original_khz.lock();
        if original.is_none() {
            let current = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            *original = Some(current.trim().to_string());
        }
        fs::write(&path, format!("{}", mhz as i64 * 1000))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn restore(&self) -> Result<()> {
        let Some(original) = self.original_khz.lock().take() else {
            return Ok(());
        };
        let path = self.max_freq_path();
        fs::write(&path, original).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

type Callback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_enter_sleep_mode: Option<Callback>,
    on_exit_sleep_mode: Option<Callback>,
    on_shutdown_request: Option<Callback>,
}

#[derive(Default)]
struct PowerSaveState {
    enabled: bool,
    ticks: i32,
    in_sleep_mode: bool,
    shutdown_requested: bool,
    wake_word_was_running: bool,
    input_was_enabled: bool,
}

pub struct PowerSaveTimer {
    cpu_max_freq: i32,
    seconds_to_sleep: i32,
    seconds_to_shutdown: i32,
    settings: Settings,
    host: Weak<dyn SleepHost>,
    governor: Option<Arc<dyn CpuGovernor>>,
    state: Mutex<PowerSaveState>,
    callbacks: RwLock<Callbacks>,
    timer: PeriodicTimer,
}

impl PowerSaveTimer {
    pub fn new(
        cpu_max_freq: i32,
        seconds_to_sleep: i32,
        seconds_to_shutdown: i32,
        settings: Settings,
        host: Weak<dyn SleepHost>,
        governor: Option<Arc<dyn CpuGovernor>>,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            cpu_max_freq,
            seconds_to_sleep,
            seconds_to_shutdown,
            settings,
            host,
            governor,
            state: Mutex::new(PowerSaveState::default()),
            callbacks: RwLock::new(Callbacks::default()),
            timer: PeriodicTimer::new("power_save", runtime),
        })
    }

    pub fn on_enter_sleep_mode(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().on_enter_sleep_mode = Some(Box::new(callback));
    }

    pub fn on_exit_sleep_mode(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().on_exit_sleep_mode = Some(Box::new(callback));
    }

    pub fn on_shutdown_request(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().on_shutdown_request = Some(Box::new(callback));
    }

    #[cfg(test)]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    #[cfg(test)]
    pub fn in_sleep_mode(&self) -> bool {
        self.state.lock().in_sleep_mode
    }

    #[cfg(test)]
    pub fn ticks(&self) -> i32 {
        self.state.lock().ticks
    }

    pub fn set_enabled(self: &Arc<Self>, enabled: bool) {
        let mut state = self.state.lock();
        if enabled && !state.enabled {
            if !self.settings.get_bool("wifi", "sleep_mode", true) {
                log::info!("Power save timer is disabled by settings");
                return;
            }
            state.ticks = 0;
            state.shutdown_requested = false;
            state.enabled = true;
            drop(state);

            let weak = Arc::downgrade(self);
            self.timer.start(CHECK_PERIOD, move || {
                if let Some(timer) = weak.upgrade() {
                    timer.tick();
                }
            });
            log::info!("Power save timer enabled");
        } else if !enabled && state.enabled {
            state.enabled = false;
            drop(state);
            self.timer.stop();
            self.wake_up();
            log::info!("Power save timer disabled");
        }
    }

    /// One check period elapsed.
    pub fn tick(&self) {
        let host = self.host.upgrade();
        let (enter_sleep, shutdown) = {
            let mut state = self.state.lock();
            if !state.in_sleep_mode && !host.as_ref().is_some_and(|h| h.can_enter_sleep_mode()) {
                state.ticks = 0;
                return;
            }
            state.ticks += 1;

            let enter_sleep = self.seconds_to_sleep != -1
                && state.ticks >= self.seconds_to_sleep
                && !state.in_sleep_mode;
            if enter_sleep {
                state.in_sleep_mode = true;
            }

            let shutdown = self.seconds_to_shutdown != -1
                && state.ticks >= self.seconds_to_shutdown
                && !state.shutdown_requested;
            if shutdown {
                state.shutdown_requested = true;
            }
            (enter_sleep, shutdown)
        };

        if enter_sleep {
            self.enter_sleep_mode(host.as_deref());
        }
        if shutdown {
            log::info!("Power save timer requesting shutdown");
            if let Some(cb) = &self.callbacks.read().on_shutdown_request {
                cb();
            }
        }
    }

    fn enter_sleep_mode(&self, host: Option<&dyn SleepHost>) {
        log::info!("Entering light sleep");
        if let Some(cb) = &self.callbacks.read().on_enter_sleep_mode {
            cb();
        }
        if self.cpu_max_freq == -1 {
            return;
        }

        if let Some(host) = host {
            let wake_word_was_running = host.is_wake_word_running();
            let input_was_enabled = host.is_audio_input_enabled();
            {
                let mut state = self.state.lock();
                state.wake_word_was_running = wake_word_was_running;
                state.input_was_enabled = input_was_enabled;
            }
            if wake_word_was_running {
                host.enable_wake_word_detection(false);
            }
            host.enable_audio_input(false);
        }
        if let Some(governor) = &self.governor {
            if let Err(e) = governor.limit_max_freq(self.cpu_max_freq) {
                log::warn!("Failed to limit CPU frequency to {}MHz: {}", self.cpu_max_freq, e);
            }
        }
    }

    /// User interaction: reset the idle count and leave light sleep.
    pub fn wake_up(&self) {
        let (was_sleeping, wake_word_was_running, input_was_enabled) = {
            let mut state = self.state.lock();
            state.ticks = 0;
            state.shutdown_requested = false;
            let was_sleeping = state.in_sleep_mode;
            state.in_sleep_mode = false;
            (was_sleeping, state.wake_word_was_running, state.input_was_enabled)
        };
        if !was_sleeping {
            return;
        }

        log::info!("Leaving light sleep");
        if self.cpu_max_freq != -1 {
            if let Some(governor) = &self.governor {
                if let Err(e) = governor.restore() {
                    log::warn!("Failed to restore CPU frequency: {}", e);
                }
            }
            if let Some(host) = self.host.upgrade() {
                if input_was_enabled {
                    host.enable_audio_input(true);
                }
                if wake_word_was_running {
                    host.enable_wake_word_detection(true);
                }
            }
        }
        if let Some(cb) = &self.callbacks.read().on_exit_sleep_mode {
            cb();
        }
    }
}
