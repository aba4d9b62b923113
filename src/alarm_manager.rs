//! Up to ten named, persisted alarms with a single one-shot timer armed for
//! the nearest one.
//!
//! Alarms live in fixed slots of the `alarm_clock` settings namespace
//! (`alarm_N` / `alarm_time_N`, empty slot = `""` / `0`). Every alarm keeps
//! the index of its slot, so updates and removals address the slot directly.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::runtime::Handle;

use crate::settings::Settings;
use crate::timer::OneShotTimer;

pub const MAX_ALARMS: usize = 10;
const NAMESPACE: &str = "alarm_clock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    pub name: String,
    /// Unix seconds.
    pub time: i64,
    pub slot: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlarmError {
    #[error("alarm delay must be positive, got {0}s")]
    InvalidDuration(i64),
    #[error("alarm name must not be empty")]
    EmptyName,
    #[error("too many alarms, at most {MAX_ALARMS} can be set")]
    TooManyAlarms,
}

/// Wall clock in unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

type AlarmCallback = Box<dyn Fn(&Alarm) + Send + Sync>;

pub struct AlarmManager {
    settings: Settings,
    clock: Arc<dyn Clock>,
    alarms: Mutex<Vec<Alarm>>,
    ringing: AtomicBool,
    timer: OneShotTimer,
    on_alarm: RwLock<Option<AlarmCallback>>,
    weak_self: Weak<AlarmManager>,
}

fn name_key(slot: usize) -> String {
    format!("alarm_{}", slot)
}

fn time_key(slot: usize) -> String {
    format!("alarm_time_{}", slot)
}

impl AlarmManager {
    /// Load persisted alarms, drop the overdue ones and arm for the nearest.
    pub fn new(settings: Settings, clock: Arc<dyn Clock>, runtime: Handle) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak| Self {
            settings,
            clock,
            alarms: Mutex::new(Vec::new()),
            ringing: AtomicBool::new(false),
            timer: OneShotTimer::new("alarm", runtime),
            on_alarm: RwLock::new(None),
            weak_self: weak.clone(),
        });

        {
            let mut alarms = manager.alarms.lock();
            *alarms = manager.load();
            manager.clear_overdue_locked(&mut alarms, manager.clock.now());
            manager.arm_next(&alarms);
            log::info!("Alarm manager loaded {} alarm(s)", alarms.len());
        }
        manager
    }

    /// Called with the alarm that fired, outside the alarm lock.
    pub fn on_alarm(&self, callback: impl Fn(&Alarm) + Send + Sync + 'static) {
        *self.on_alarm.write() = Some(Box::new(callback));
    }

    pub fn set_alarm(&self, seconds_from_now: i64, name: &str) -> Result<(), AlarmError> {
        if seconds_from_now <= 0 {
            log::warn!("Rejecting alarm {} with non-positive delay {}s", name, seconds_from_now);
            return Err(AlarmError::InvalidDuration(seconds_from_now));
        }
        if name.is_empty() {
            log::warn!("Rejecting alarm with empty name");
            return Err(AlarmError::EmptyName);
        }

        let mut alarms = self.alarms.lock();
        let time = self.clock.now() + seconds_from_now;

        if let Some(alarm) = alarms.iter_mut().find(|a| a.name == name) {
            alarm.time = time;
            self.write_slot(alarm.slot, name, time);
        } else {
            if alarms.len() >= MAX_ALARMS {
                log::warn!("Too many alarms, rejecting {}", name);
                return Err(AlarmError::TooManyAlarms);
            }
            let slot = (0..MAX_ALARMS)
                .find(|slot| alarms.iter().all(|a| a.slot != *slot))
                .ok_or(AlarmError::TooManyAlarms)?;
            self.write_slot(slot, name, time);
            alarms.push(Alarm {
                name: name.to_string(),
                time,
                slot,
            });
        }

        log::info!("Alarm {} set to fire in {}s", name, seconds_from_now);
        self.arm_next(&alarms);
        Ok(())
    }

    /// Returns whether any alarm had this name.
    pub fn cancel_alarm(&self, name: &str) -> bool {
        let mut alarms = self.alarms.lock();
        let before = alarms.len();
        alarms.retain(|alarm| {
            if alarm.name == name {
                self.clear_slot(alarm.slot);
                false
            } else {
                true
            }
        });
        let removed = alarms.len() != before;
        if removed {
            log::info!("Alarm {} cancelled", name);
        }
        self.arm_next(&alarms);
        removed
    }

    /// Remove every alarm due at or before `now`.
    pub fn clear_overdue_alarm(&self, now: i64) {
        let mut alarms = self.alarms.lock();
        self.clear_overdue_locked(&mut alarms, now);
        self.arm_next(&alarms);
    }

    /// All alarms, soonest first.
    pub fn list_alarms(&self) -> Vec<Alarm> {
        let mut alarms = self.alarms.lock().clone();
        alarms.sort_by(|a, b| (a.time, &a.name).cmp(&(b.time, &b.name)));
        alarms
    }

    /// The alarm the timer is armed for.
    pub fn next_alarm(&self) -> Option<Alarm> {
        let alarms = self.alarms.lock();
        Self::nearest(&alarms, self.clock.now()).cloned()
    }

    pub fn timer_deadline(&self) -> Option<tokio::time::Instant> {
        self.timer.deadline()
    }

    pub fn is_ringing(&self) -> bool {
        self.ringing.load(Ordering::SeqCst)
    }

    pub fn stop_ringing(&self) {
        self.ringing.store(false, Ordering::SeqCst);
    }

    /// Timer expiry: ring for the earliest due alarm, drop everything due and
    /// re-arm for what is left.
    pub fn fire(&self) {
        let now = self.clock.now();
        let fired = {
            let mut alarms = self.alarms.lock();
            let fired = alarms
                .iter()
                .filter(|a| a.time <= now)
                .min_by(|a, b| (a.time, &a.name).cmp(&(b.time, &b.name)))
                .cloned();
            self.clear_overdue_locked(&mut alarms, now);
            self.arm_next(&alarms);
            fired
        };

        let Some(alarm) = fired else {
            log::debug!("Alarm timer fired with nothing due");
            return;
        };
        self.ringing.store(true, Ordering::SeqCst);
        log::info!("Alarm {} is ringing", alarm.name);
        if let Some(cb) = &*self.on_alarm.read() {
            cb(&alarm);
        }
    }

    fn nearest(alarms: &[Alarm], now: i64) -> Option<&Alarm> {
        alarms
            .iter()
            .filter(|a| a.time > now)
            .min_by(|a, b| (a.time, &a.name).cmp(&(b.time, &b.name)))
    }

    fn arm_next(&self, alarms: &[Alarm]) {
        let now = self.clock.now();
        let Some(next) = Self::nearest(alarms, now) else {
            self.timer.stop();
            return;
        };
        let delay = Duration::from_secs((next.time - now) as u64);
        let weak = self.weak_self.clone();
        self.timer.start(delay, move || {
            if let Some(manager) = weak.upgrade() {
                manager.fire();
            }
        });
    }

    fn clear_overdue_locked(&self, alarms: &mut Vec<Alarm>, now: i64) {
        alarms.retain(|alarm| {
            if alarm.time <= now {
                self.clear_slot(alarm.slot);
                false
            } else {
                true
            }
        });
    }

    fn load(&self) -> Vec<Alarm> {
        let mut alarms: Vec<Alarm> = Vec::new();
        for slot in 0..MAX_ALARMS {
            let name = self.settings.get_string(NAMESPACE, &name_key(slot), "");
            let time = self.settings.get_int(NAMESPACE, &time_key(slot), 0);
            if name.is_empty() && time == 0 {
                continue;
            }
            if name.is_empty() || time <= 0 {
                log::warn!("Clearing inconsistent alarm slot {}", slot);
                self.clear_slot(slot);
                continue;
            }

            match alarms.iter_mut().find(|a| a.name == name) {
                Some(existing) if existing.time >= time => {
                    log::warn!("Duplicate alarm {} in slot {}, keeping slot {}", name, slot, existing.slot);
                    self.clear_slot(slot);
                }
                Some(existing) => {
                    log::warn!("Duplicate alarm {} in slot {}, keeping slot {}", name, existing.slot, slot);
                    self.clear_slot(existing.slot);
                    existing.time = time;
                    existing.slot = slot;
                }
                None => alarms.push(Alarm { name, time, slot }),
            }
        }
        alarms
    }

    fn write_slot(&self, slot: usize, name: &str, time: i64) {
        if let Err(e) = self
            .settings
            .set_string(NAMESPACE, &name_key(slot), name)
            .and_then(|_| self.settings.set_int(NAMESPACE, &time_key(slot), time))
        {
            log::warn!("Failed to persist alarm {} in slot {}: {}", name, slot, e);
        }
    }

    fn clear_slot(&self, slot: usize) {
        self.write_slot(slot, "", 0);
    }
}
