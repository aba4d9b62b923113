//! Safe wrapper around the SpeexDSP resampler.

use std::ffi::c_int;

/// Opaque type for SpeexResamplerState
#[repr(C)]
pub struct SpeexResamplerState {
    _private: [u8; 0],
}

const RESAMPLER_ERR_SUCCESS: c_int = 0;

unsafe extern "C" {
    fn speex_resampler_init(
        nb_channels: u32,
        in_rate: u32,
        out_rate: u32,
        quality: c_int,
        err: *mut c_int,
    ) -> *mut SpeexResamplerState;
    fn speex_resampler_destroy(st: *mut SpeexResamplerState);
    fn speex_resampler_process_int(
        st: *mut SpeexResamplerState,
        channel_index: u32,
        in_: *const i16,
        in_len: *mut u32,
        out: *mut i16,
        out_len: *mut u32,
    ) -> c_int;
    fn speex_resampler_reset_mem(st: *mut SpeexResamplerState) -> c_int;
}

/// Mono streaming resampler. Filter state carries over between calls, so
/// consecutive frames join without clicks.
pub struct SpeexResampler {
    state: *mut SpeexResamplerState,
}

// SpeexResamplerState is only touched through &mut self
unsafe impl Send for SpeexResampler {}

impl SpeexResampler {
    pub fn new(in_rate: u32, out_rate: u32, quality: i32) -> anyhow::Result<Self> {
        let mut err: c_int = 0;
        let state = unsafe { speex_resampler_init(1, in_rate, out_rate, quality, &mut err) };
        if err != RESAMPLER_ERR_SUCCESS || state.is_null() {
            anyhow::bail!("Failed to initialize speex resampler: err={}", err);
        }
        Ok(Self { state })
    }

    /// Returns `(input_samples_consumed, output_samples_produced)`.
    pub fn process(&mut self, input: &[i16], output: &mut [i16]) -> anyhow::Result<(usize, usize)> {
        let mut in_len = input.len() as u32;
        let mut out_len = output.len() as u32;
        let err = unsafe {
            speex_resampler_process_int(
                self.state,
                0,
                input.as_ptr(),
                &mut in_len,
                output.as_mut_ptr(),
                &mut out_len,
            )
        };
        if err != RESAMPLER_ERR_SUCCESS {
            anyhow::bail!("Speex resampler error: {}", err);
        }
        Ok((in_len as usize, out_len as usize))
    }

    pub fn reset(&mut self) {
        unsafe {
            speex_resampler_reset_mem(self.state);
        }
    }
}

impl Drop for SpeexResampler {
    fn drop(&mut self) {
        unsafe {
            speex_resampler_destroy(self.state);
        }
    }
}
