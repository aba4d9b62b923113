//! Periodic and one-shot timers running on the tokio runtime.
//!
//! Callbacks run on a runtime worker and must not block.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub struct PeriodicTimer {
    name: &'static str,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTimer {
    pub fn new(name: &'static str, runtime: Handle) -> Self {
        Self {
            name,
            runtime,
            task: Mutex::new(None),
        }
    }

    /// (Re)start ticking. The first callback fires one `period` from now.
    pub fn start<F>(&self, period: Duration, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut task = self.task.lock();
        if let Some(old) = task.take() {
            old.abort();
        }
        let handle = self.runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                callback();
            }
        });
        *task = Some(handle);
        log::debug!("Timer {} started, period {:?}", self.name, period);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            log::debug!("Timer {} stopped", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

struct Armed {
    task: JoinHandle<()>,
    deadline: Instant,
}

pub struct OneShotTimer {
    name: &'static str,
    runtime: Handle,
    armed: Mutex<Option<Armed>>,
}

impl OneShotTimer {
    pub fn new(name: &'static str, runtime: Handle) -> Self {
        Self {
            name,
            runtime,
            armed: Mutex::new(None),
        }
    }

    /// Arm for `delay` from now, replacing any pending shot.
    pub fn start<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut armed = self.armed.lock();
        if let Some(old) = armed.take() {
            old.task.abort();
        }
        let deadline = Instant::now() + delay;
        let task = self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            callback();
        });
        *armed = Some(Armed { task, deadline });
        log::debug!("Timer {} armed for {:?}", self.name, delay);
    }

    pub fn stop(&self) {
        if let Some(armed) = self.armed.lock().take() {
            armed.task.abort();
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.armed.lock().as_ref().is_some_and(|a| !a.task.is_finished())
    }

    /// Deadline of the pending shot, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.armed
            .lock()
            .as_ref()
            .filter(|a| !a.task.is_finished())
            .map(|a| a.deadline)
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        if let Some(armed) = self.armed.get_mut().take() {
            armed.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let timer = PeriodicTimer::new("test", Handle::current());
        let c = count.clone();
        timer.start(Duration::from_secs(1), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        timer.stop();
        assert!(!timer.is_running());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_rearm_replaces_pending_shot() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = OneShotTimer::new("test", Handle::current());

        let f = fired.clone();
        timer.start(Duration::from_secs(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let f = fired.clone();
        timer.start(Duration::from_secs(20), move || {
            f.fetch_add(10, Ordering::SeqCst);
        });
        assert!(timer.deadline().is_some());

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
        assert!(!timer.is_running());
        assert!(timer.deadline().is_none());
    }
}
