//! Host-side codec driver for tests. Records every call for assertions.

use anyhow::{Result, bail};
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::codec::CodecDriver;

#[derive(Default)]
struct MockState {
    start_calls: usize,
    input_toggles: Vec<bool>,
    output_toggles: Vec<bool>,
    volume: i32,
    capture: VecDeque<i16>,
    written: Vec<i16>,
    fail_start: bool,
    fail_io: bool,
}

#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn start_calls(&self) -> usize {
        self.state.lock().start_calls
    }

    pub fn input_toggles(&self) -> Vec<bool> {
        self.state.lock().input_toggles.clone()
    }

    pub fn output_toggles(&self) -> Vec<bool> {
        self.state.lock().output_toggles.clone()
    }

    pub fn volume(&self) -> i32 {
        self.state.lock().volume
    }

    pub fn written(&self) -> Vec<i16> {
        self.state.lock().written.clone()
    }

    pub fn feed_capture(&self, samples: &[i16]) {
        self.state.lock().capture.extend(samples.iter().copied());
    }

    pub fn fail_start(&self) {
        self.state.lock().fail_start = true;
    }

    pub fn fail_io(&self) {
        self.state.lock().fail_io = true;
    }
}

impl CodecDriver for MockDriver {
    fn start_channels(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_start {
            bail!("mock channel claim failed");
        }
        state.start_calls += 1;
        Ok(())
    }

    fn read(&self, samples: &mut [i16]) -> Result<usize> {
        let mut state = self.state.lock();
        if state.fail_io {
            bail!("mock read failed");
        }
        let n = samples.len().min(state.capture.len());
        for slot in samples.iter_mut().take(n) {
            *slot = state.capture.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn write(&self, samples: &[i16], _volume: i32) -> Result<usize> {
        let mut state = self.state.lock();
        if state.fail_io {
            bail!("mock write failed");
        }
        state.written.extend_from_slice(samples);
        Ok(samples.len())
    }

    fn set_input_enabled(&self, enable: bool) -> Result<()> {
        self.state.lock().input_toggles.push(enable);
        Ok(())
    }

    fn set_output_enabled(&self, enable: bool) -> Result<()> {
        self.state.lock().output_toggles.push(enable);
        Ok(())
    }

    fn apply_output_volume(&self, volume: i32) -> Result<()> {
        self.state.lock().volume = volume;
        Ok(())
    }
}
