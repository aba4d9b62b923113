//! Audio pipeline between the codec and the session.
//!
//! Runs in dedicated OS threads (not tokio tasks) so real-time audio never
//! competes with network work:
//!
//! - `audio_input`: codec read → resample to 16kHz → encode queue
//! - `opus_codec`: encode queue → Opus → send queue, decode queue → PCM → playback queue
//! - `audio_output`: playback queue → codec write, marker callbacks
//!
//! All queues live under one mutex with one condition variable. Control
//! markers (`Start`, `SentenceStart`, `SentenceEnd`, `Stop`) travel through
//! the decode and playback queues alongside the audio they belong to.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

use anyhow::Result;

use super::codec::AudioCodec;
use super::opus_codec::{OpusDecoderWrapper, OpusEncoderWrapper};
use super::resampler::OpusResampler;
use crate::protocol::{AudioPacket, AudioPacketKind, AudioPayload, parse_binary_protocol3_stream};
use crate::timer::PeriodicTimer;

pub const OPUS_FRAME_DURATION_MS: u32 = 60;
pub const WIRE_SAMPLE_RATE: u32 = 16000;

const MAX_ENCODE_TASKS_IN_QUEUE: usize = 2;
const MAX_PLAYBACK_TASKS_IN_QUEUE: usize = 2;
const MAX_DECODE_PACKETS_IN_QUEUE: usize = (2400 / OPUS_FRAME_DURATION_MS) as usize;
const MAX_SEND_PACKETS_IN_QUEUE: usize = (2400 / OPUS_FRAME_DURATION_MS) as usize;
const AUDIO_TESTING_MAX_DURATION_MS: u32 = 10_000;
const MAX_AUDIO_TESTING_PACKETS: usize = (AUDIO_TESTING_MAX_DURATION_MS / OPUS_FRAME_DURATION_MS) as usize;
const MAX_TIMESTAMPS_IN_QUEUE: usize = 3;

const AUDIO_POWER_TIMEOUT: Duration = Duration::from_secs(15);
const AUDIO_POWER_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const INPUT_WARMUP: Duration = Duration::from_millis(120);
const INPUT_IDLE_BACKOFF: Duration = Duration::from_millis(10);

const BIT_AUDIO_TESTING: u8 = 1 << 0;
const BIT_WAKE_WORD: u8 = 1 << 1;
const BIT_VOICE_PROCESSING: u8 = 1 << 2;

/// Wake word engine fed with 16kHz mono frames by the input thread.
pub trait WakeWordDetector: Send {
    /// Samples per feed at 16kHz, mono.
    fn feed_size(&self) -> usize;
    /// Returns the detected wake word, if this frame completed one.
    fn feed(&mut self, data: &[i16]) -> Option<String>;
    fn start(&mut self);
    fn stop(&mut self);
}

type Callback = Box<dyn Fn() + Send + Sync>;
type TextCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
pub struct AudioServiceCallbacks {
    pub on_send_queue_available: Option<Callback>,
    pub on_wake_word_detected: Option<TextCallback>,
    pub on_sentence_start: Option<TextCallback>,
    pub on_sentence_end: Option<Callback>,
    pub on_playback_stopped: Option<Callback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncodeTarget {
    Send,
    Testing,
}

struct EncodeTask {
    target: EncodeTarget,
    pcm: Vec<i16>,
    timestamp: u32,
}

enum PlaybackTask {
    Pcm { pcm: Vec<i16>, timestamp: u32 },
    Marker { kind: AudioPacketKind, text: Option<String> },
}

#[derive(Default)]
struct Queues {
    encode: VecDeque<EncodeTask>,
    send: VecDeque<AudioPacket>,
    decode: VecDeque<AudioPacket>,
    playback: VecDeque<PlaybackTask>,
    testing: VecDeque<AudioPacket>,
    timestamps: VecDeque<u32>,
    /// Bumped by every reset so in-flight decodes of flushed packets are dropped.
    generation: u64,
}

impl Queues {
    fn can_decode(&self) -> bool {
        !self.decode.is_empty() && self.playback.len() < MAX_PLAYBACK_TASKS_IN_QUEUE
    }

    fn can_encode(&self) -> bool {
        !self.encode.is_empty() && self.send.len() < MAX_SEND_PACKETS_IN_QUEUE
    }
}

struct DecodeState {
    decoder: OpusDecoderWrapper,
    resampler: OpusResampler,
}

struct InputState {
    mic_resampler: OpusResampler,
    reference_resampler: OpusResampler,
}

struct Inner {
    codec: Arc<dyn AudioCodec>,
    queues: Mutex<Queues>,
    queue_cv: Condvar,
    bits: Mutex<u8>,
    bits_cv: Condvar,
    stopped: AtomicBool,
    break_speaking: AtomicBool,
    skip_to_end: AtomicBool,
    input_need_warmup: AtomicBool,
    encoder: Mutex<OpusEncoderWrapper>,
    decode: Mutex<DecodeState>,
    input: Mutex<InputState>,
    wake_word: Mutex<Option<Box<dyn WakeWordDetector>>>,
    callbacks: RwLock<AudioServiceCallbacks>,
    last_input: Mutex<Instant>,
    last_output: Mutex<Instant>,
    power_timer: PeriodicTimer,
}

pub struct AudioService {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl AudioService {
    /// Start the codec and prepare the Opus state. Codec start failure is fatal.
    pub fn new(codec: Arc<dyn AudioCodec>, runtime: Handle) -> Result<Self> {
        codec.start()?;

        let encoder = OpusEncoderWrapper::new(WIRE_SAMPLE_RATE, 1, OPUS_FRAME_DURATION_MS)?;
        let decoder = OpusDecoderWrapper::new(codec.output_sample_rate(), 1, OPUS_FRAME_DURATION_MS)?;

        let mut input = InputState {
            mic_resampler: OpusResampler::default(),
            reference_resampler: OpusResampler::default(),
        };
        if codec.input_sample_rate() != WIRE_SAMPLE_RATE {
            input.mic_resampler.configure(codec.input_sample_rate(), WIRE_SAMPLE_RATE)?;
            input.reference_resampler.configure(codec.input_sample_rate(), WIRE_SAMPLE_RATE)?;
        }

        let now = Instant::now();
        Ok(Self {
            inner: Arc::new(Inner {
                codec,
                queues: Mutex::new(Queues::default()),
                queue_cv: Condvar::new(),
                bits: Mutex::new(0),
                bits_cv: Condvar::new(),
                stopped: AtomicBool::new(false),
                break_speaking: AtomicBool::new(false),
                skip_to_end: AtomicBool::new(false),
                input_need_warmup: AtomicBool::new(false),
                encoder: Mutex::new(encoder),
                decode: Mutex::new(DecodeState {
                    decoder,
                    resampler: OpusResampler::default(),
                }),
                input: Mutex::new(input),
                wake_word: Mutex::new(None),
                callbacks: RwLock::new(AudioServiceCallbacks::default()),
                last_input: Mutex::new(now),
                last_output: Mutex::new(now),
                power_timer: PeriodicTimer::new("audio_power", runtime),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn start(&self) -> Result<()> {
        if self.inner.stopped.swap(false, Ordering::SeqCst) {
            // stop() raised every bit to release the input thread
            *self.inner.bits.lock() = 0;
        }
        self.inner.start_power_timer();

        let mut threads = self.threads.lock();
        let inner = self.inner.clone();
        threads.push(
            thread::Builder::new()
                .name("audio_input".into())
                .spawn(move || inner.audio_input_task())?,
        );
        let inner = self.inner.clone();
        threads.push(
            thread::Builder::new()
                .name("audio_output".into())
                .spawn(move || inner.audio_output_task())?,
        );
        let inner = self.inner.clone();
        threads.push(
            thread::Builder::new()
                .name("opus_codec".into())
                .spawn(move || inner.opus_codec_task())?,
        );
        log::info!("Audio service started");
        Ok(())
    }

    /// Stop the threads and drop everything queued.
    pub fn stop(&self) {
        self.inner.power_timer.stop();
        self.inner.stopped.store(true, Ordering::SeqCst);
        {
            let mut bits = self.inner.bits.lock();
            *bits = BIT_AUDIO_TESTING | BIT_WAKE_WORD | BIT_VOICE_PROCESSING;
            self.inner.bits_cv.notify_all();
        }
        {
            let mut q = self.inner.queues.lock();
            q.encode.clear();
            q.decode.clear();
            q.playback.clear();
            q.testing.clear();
            self.inner.queue_cv.notify_all();
        }
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                log::error!("Audio thread panicked");
            }
        }
        log::info!("Audio service stopped");
    }

    pub fn set_callbacks(&self, callbacks: AudioServiceCallbacks) {
        *self.inner.callbacks.write() = callbacks;
    }

    #[cfg(test)]
    pub fn set_wake_word(&self, detector: Box<dyn WakeWordDetector>) {
        *self.inner.wake_word.lock() = Some(detector);
    }

    pub fn enable_wake_word_detection(&self, enable: bool) {
        let mut wake_word = self.inner.wake_word.lock();
        let Some(detector) = wake_word.as_mut() else {
            return;
        };
        log::debug!("{} wake word detection", if enable { "Enabling" } else { "Disabling" });
        if enable {
            detector.start();
            self.inner.set_bits(BIT_WAKE_WORD);
        } else {
            detector.stop();
            self.inner.clear_bits(BIT_WAKE_WORD);
        }
    }

    pub fn is_wake_word_running(&self) -> bool {
        *self.inner.bits.lock() & BIT_WAKE_WORD != 0
    }

    /// Mic frames go to the send queue while enabled.
    pub fn enable_voice_processing(&self, enable: bool) {
        log::debug!("{} voice processing", if enable { "Enabling" } else { "Disabling" });
        if enable {
            // Nothing may still be playing while the mic feeds the server.
            self.reset_decoder();
            self.inner.encoder.lock().reset_state();
            self.inner.input_need_warmup.store(true, Ordering::SeqCst);
            self.inner.set_bits(BIT_VOICE_PROCESSING);
        } else {
            self.inner.clear_bits(BIT_VOICE_PROCESSING);
        }
    }

    pub fn is_voice_processing(&self) -> bool {
        *self.inner.bits.lock() & BIT_VOICE_PROCESSING != 0
    }

    /// Record up to ten seconds; disabling plays the recording back.
    pub fn enable_audio_testing(&self, enable: bool) {
        self.inner.enable_audio_testing(enable);
    }

    pub fn is_audio_testing(&self) -> bool {
        *self.inner.bits.lock() & BIT_AUDIO_TESTING != 0
    }

    /// Returns `false` if the queue is full and `wait` is not set.
    pub fn push_packet_to_decode_queue(&self, packet: AudioPacket, wait: bool) -> bool {
        self.inner.push_packet_to_decode_queue(packet, wait)
    }

    pub fn pop_packet_from_send_queue(&self) -> Option<AudioPacket> {
        let mut q = self.inner.queues.lock();
        let packet = q.send.pop_front();
        if packet.is_some() {
            self.inner.queue_cv.notify_all();
        }
        packet
    }

    /// Queue concatenated v3 frames of 16kHz/60ms Opus for playback.
    pub fn play_sound(&self, sound: &[u8]) {
        self.inner.break_speaking.store(false, Ordering::SeqCst);
        self.inner.skip_to_end.store(false, Ordering::SeqCst);
        for frame in parse_binary_protocol3_stream(sound) {
            let packet = AudioPacket::opus(
                frame.payload.to_vec(),
                WIRE_SAMPLE_RATE,
                OPUS_FRAME_DURATION_MS,
                0,
            );
            self.inner.push_packet_to_decode_queue(packet, true);
        }
    }

    /// Drop queued inbound audio and decoder history.
    pub fn reset_decoder(&self) {
        self.inner.reset_decoder();
    }

    pub fn is_idle(&self) -> bool {
        let q = self.inner.queues.lock();
        q.encode.is_empty() && q.decode.is_empty() && q.playback.is_empty() && q.testing.is_empty()
    }

    /// Inbound packets waiting for decode or playback.
    pub fn pending_playback(&self) -> usize {
        let q = self.inner.queues.lock();
        q.decode.len() + q.playback.len()
    }

    /// Drop inbound audio until cleared. Markers still pass.
    pub fn set_break_speaking(&self, value: bool) {
        self.inner.break_speaking.store(value, Ordering::SeqCst);
    }

    pub fn break_speaking(&self) -> bool {
        self.inner.break_speaking.load(Ordering::SeqCst)
    }

    /// Drop inbound audio up to the next sentence end or stop marker.
    pub fn skip_to_end(&self) {
        self.inner.skip_to_end.store(true, Ordering::SeqCst);
    }

    pub fn check_audio_power(&self, now: Instant) {
        self.inner.check_audio_power(now);
    }

    #[cfg(test)]
    fn send_queue_len(&self) -> usize {
        self.inner.queues.lock().send.len()
    }

    #[cfg(test)]
    fn testing_queue_len(&self) -> usize {
        self.inner.queues.lock().testing.len()
    }
}

impl Drop for AudioService {
    fn drop(&mut self) {
        if !self.threads.get_mut().is_empty() {
            self.stop();
        }
    }
}

impl Inner {
    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn set_bits(&self, mask: u8) {
        let mut bits = self.bits.lock();
        *bits |= mask;
        self.bits_cv.notify_all();
    }

    fn clear_bits(&self, mask: u8) {
        *self.bits.lock() &= !mask;
    }

    fn start_power_timer(self: &Arc<Self>) {
        if self.power_timer.is_running() {
            return;
        }
        let weak = Arc::downgrade(self);
        self.power_timer.start(AUDIO_POWER_CHECK_INTERVAL, move || {
            if let Some(inner) = weak.upgrade() {
                inner.check_audio_power(Instant::now());
            }
        });
    }

    fn check_audio_power(&self, now: Instant) {
        let input_idle = now.saturating_duration_since(*self.last_input.lock());
        let output_idle = now.saturating_duration_since(*self.last_output.lock());
        if input_idle > AUDIO_POWER_TIMEOUT && self.codec.input_enabled() {
            self.codec.enable_input(false);
        }
        if output_idle > AUDIO_POWER_TIMEOUT && self.codec.output_enabled() {
            self.codec.enable_output(false);
        }
        if !self.codec.input_enabled() && !self.codec.output_enabled() {
            self.power_timer.stop();
        }
    }

    fn enable_audio_testing(&self, enable: bool) {
        log::info!("{} audio testing", if enable { "Enabling" } else { "Disabling" });
        if enable {
            self.set_bits(BIT_AUDIO_TESTING);
        } else {
            self.clear_bits(BIT_AUDIO_TESTING);
            let mut q = self.queues.lock();
            let recorded = std::mem::take(&mut q.testing);
            q.decode = recorded;
            self.queue_cv.notify_all();
        }
    }

    fn reset_decoder(&self) {
        let mut q = self.queues.lock();
        {
            let mut decode = self.decode.lock();
            decode.decoder.reset_state();
            decode.resampler.reset();
        }
        q.generation += 1;
        q.timestamps.clear();
        q.decode.clear();
        q.playback.clear();
        q.testing.clear();
        self.queue_cv.notify_all();
    }

    fn push_packet_to_decode_queue(&self, packet: AudioPacket, wait: bool) -> bool {
        let mut q = self.queues.lock();
        if q.decode.len() >= MAX_DECODE_PACKETS_IN_QUEUE {
            if !wait {
                return false;
            }
            self.queue_cv.wait_while(&mut q, |q| {
                q.decode.len() >= MAX_DECODE_PACKETS_IN_QUEUE && !self.stopped()
            });
            if self.stopped() {
                return false;
            }
        }
        q.decode.push_back(packet);
        self.queue_cv.notify_all();
        true
    }

    fn push_task_to_encode_queue(&self, target: EncodeTarget, pcm: Vec<i16>) {
        let mut task = EncodeTask {
            target,
            pcm,
            timestamp: 0,
        };
        let mut q = self.queues.lock();
        if target == EncodeTarget::Send {
            if let Some(timestamp) = q.timestamps.pop_front() {
                if q.timestamps.len() < MAX_TIMESTAMPS_IN_QUEUE {
                    task.timestamp = timestamp;
                } else {
                    log::warn!("Timestamp queue ({}) is full, dropping timestamp", q.timestamps.len() + 1);
                }
            }
        }
        self.queue_cv.wait_while(&mut q, |q| {
            q.encode.len() >= MAX_ENCODE_TASKS_IN_QUEUE && !self.stopped()
        });
        if self.stopped() {
            return;
        }
        q.encode.push_back(task);
        self.queue_cv.notify_all();
    }

    /// Read `samples` per channel worth of 16kHz audio. With a reference
    /// input the result stays interleaved (mic, reference).
    fn read_audio_data(self: &Arc<Self>, samples: usize) -> Option<Vec<i16>> {
        if !self.codec.input_enabled() {
            self.codec.enable_input(true);
            self.start_power_timer();
        }

        let channels = self.codec.input_channels() as usize;
        let codec_rate = self.codec.input_sample_rate();
        let per_channel = samples * codec_rate as usize / WIRE_SAMPLE_RATE as usize;
        let mut data = vec![0i16; per_channel * channels];
        if !self.codec.input_data(&mut data) {
            return None;
        }

        if codec_rate != WIRE_SAMPLE_RATE {
            let mut input = self.input.lock();
            data = if channels == 2 {
                let mic: Vec<i16> = data.chunks_exact(2).map(|c| c[0]).collect();
                let reference: Vec<i16> = data.chunks_exact(2).map(|c| c[1]).collect();
                let mic = input.mic_resampler.process_vec(&mic);
                let reference = input.reference_resampler.process_vec(&reference);
                mic.iter()
                    .zip(reference.iter())
                    .flat_map(|(&m, &r)| [m, r])
                    .collect()
            } else {
                input.mic_resampler.process_vec(&data)
            };
        }

        *self.last_input.lock() = Instant::now();
        Some(data)
    }

    fn mic_channel(&self, data: Vec<i16>) -> Vec<i16> {
        if self.codec.input_channels() == 2 {
            data.chunks_exact(2).map(|c| c[0]).collect()
        } else {
            data
        }
    }

    fn audio_input_task(self: Arc<Self>) {
        let frame_samples = (OPUS_FRAME_DURATION_MS * WIRE_SAMPLE_RATE / 1000) as usize;
        loop {
            let bits = {
                let mut bits = self.bits.lock();
                self.bits_cv.wait_while(&mut bits, |b| *b == 0 && !self.stopped());
                *bits
            };
            if self.stopped() {
                break;
            }
            if self.input_need_warmup.swap(false, Ordering::SeqCst) {
                thread::sleep(INPUT_WARMUP);
                continue;
            }

            if bits & BIT_AUDIO_TESTING != 0 {
                if self.queues.lock().testing.len() >= MAX_AUDIO_TESTING_PACKETS {
                    log::warn!("Audio testing queue is full, stopping audio testing");
                    self.enable_audio_testing(false);
                    continue;
                }
                if let Some(data) = self.read_audio_data(frame_samples) {
                    let mono = self.mic_channel(data);
                    self.push_task_to_encode_queue(EncodeTarget::Testing, mono);
                    continue;
                }
            }

            if bits & BIT_WAKE_WORD != 0 {
                let feed_size = self.wake_word.lock().as_ref().map_or(0, |w| w.feed_size());
                if feed_size > 0 {
                    if let Some(data) = self.read_audio_data(feed_size) {
                        let mono = self.mic_channel(data);
                        let detected = self
                            .wake_word
                            .lock()
                            .as_mut()
                            .and_then(|w| w.feed(&mono));
                        if let Some(word) = detected {
                            log::info!("Wake word detected: {}", word);
                            if let Some(cb) = &self.callbacks.read().on_wake_word_detected {
                                cb(&word);
                            }
                        }
                        continue;
                    }
                }
            }

            if bits & BIT_VOICE_PROCESSING != 0 {
                if let Some(data) = self.read_audio_data(frame_samples) {
                    let mono = self.mic_channel(data);
                    self.push_task_to_encode_queue(EncodeTarget::Send, mono);
                    continue;
                }
            }

            // Nothing captured, yield instead of spinning on the codec.
            thread::sleep(INPUT_IDLE_BACKOFF);
        }
        log::warn!("Audio input task stopped");
    }

    fn audio_output_task(self: Arc<Self>) {
        loop {
            let task = {
                let mut q = self.queues.lock();
                self.queue_cv
                    .wait_while(&mut q, |q| q.playback.is_empty() && !self.stopped());
                if self.stopped() {
                    break;
                }
                let task = q.playback.pop_front();
                self.queue_cv.notify_all();
                task
            };
            let Some(task) = task else { continue };

            match task {
                PlaybackTask::Pcm { pcm, timestamp } => {
                    if self.break_speaking.load(Ordering::SeqCst) {
                        continue;
                    }
                    if !self.codec.output_enabled() {
                        self.codec.enable_output(true);
                        self.start_power_timer();
                    }
                    self.codec.output_data(&pcm);
                    *self.last_output.lock() = Instant::now();

                    // Server side AEC pairs outgoing mic frames with what was played.
                    if timestamp > 0 {
                        self.queues.lock().timestamps.push_back(timestamp);
                    }
                }
                PlaybackTask::Marker { kind, text } => {
                    let callbacks = self.callbacks.read();
                    match kind {
                        AudioPacketKind::SentenceStart => {
                            if let Some(cb) = &callbacks.on_sentence_start {
                                cb(text.as_deref().unwrap_or_default());
                            }
                        }
                        AudioPacketKind::SentenceEnd => {
                            if let Some(cb) = &callbacks.on_sentence_end {
                                cb();
                            }
                        }
                        AudioPacketKind::Stop => {
                            if let Some(cb) = &callbacks.on_playback_stopped {
                                cb();
                            }
                        }
                        AudioPacketKind::Start | AudioPacketKind::Data => {}
                    }
                }
            }
        }
        log::warn!("Audio output task stopped");
    }

    fn opus_codec_task(self: Arc<Self>) {
        loop {
            let (decode, encode, generation) = {
                let mut q = self.queues.lock();
                self.queue_cv.wait_while(&mut q, |q| {
                    !self.stopped() && !q.can_decode() && !q.can_encode()
                });
                if self.stopped() {
                    break;
                }
                let decode = if q.can_decode() { q.decode.pop_front() } else { None };
                let encode = if q.can_encode() { q.encode.pop_front() } else { None };
                self.queue_cv.notify_all();
                (decode, encode, q.generation)
            };

            if let Some(packet) = decode {
                if let Some(task) = self.decode_packet(packet) {
                    let mut q = self.queues.lock();
                    if q.generation == generation {
                        q.playback.push_back(task);
                        self.queue_cv.notify_all();
                    }
                }
            }

            if let Some(task) = encode {
                self.encode_task(task);
            }
        }
        log::warn!("Opus codec task stopped");
    }

    fn decode_packet(&self, packet: AudioPacket) -> Option<PlaybackTask> {
        match packet.kind {
            AudioPacketKind::Data => {}
            AudioPacketKind::SentenceStart | AudioPacketKind::SentenceEnd
                if self.break_speaking.load(Ordering::SeqCst) =>
            {
                return None;
            }
            kind => {
                if matches!(kind, AudioPacketKind::SentenceEnd | AudioPacketKind::Stop) {
                    self.skip_to_end.store(false, Ordering::SeqCst);
                }
                return Some(PlaybackTask::Marker {
                    kind,
                    text: packet.text,
                });
            }
        }

        if self.break_speaking.load(Ordering::SeqCst) || self.skip_to_end.load(Ordering::SeqCst) {
            return None;
        }

        let AudioPayload::Opus(payload) = packet.payload else {
            log::warn!("Dropping inbound audio packet without opus payload");
            return None;
        };

        let mut state = self.decode.lock();
        self.set_decode_sample_rate(&mut state, packet.sample_rate, packet.frame_duration);
        let pcm = match state.decoder.decode(&payload) {
            Ok(pcm) => pcm,
            Err(e) => {
                log::error!("Failed to decode audio: {}", e);
                return None;
            }
        };
        let pcm = if state.decoder.sample_rate() != self.codec.output_sample_rate() {
            state.resampler.process_vec(&pcm)
        } else {
            pcm
        };
        Some(PlaybackTask::Pcm {
            pcm,
            timestamp: packet.timestamp,
        })
    }

    fn set_decode_sample_rate(&self, state: &mut DecodeState, sample_rate: u32, frame_duration: u32) {
        if sample_rate == 0
            || (state.decoder.sample_rate() == sample_rate
                && state.decoder.duration_ms() == frame_duration)
        {
            return;
        }
        match OpusDecoderWrapper::new(sample_rate, 1, frame_duration) {
            Ok(decoder) => state.decoder = decoder,
            Err(e) => {
                log::error!("Failed to create decoder for {}Hz: {}", sample_rate, e);
                return;
            }
        }
        let output_rate = self.codec.output_sample_rate();
        if sample_rate != output_rate {
            log::info!("Resampling audio from {} to {}", sample_rate, output_rate);
            if let Err(e) = state.resampler.configure(sample_rate, output_rate) {
                log::error!("Failed to configure output resampler: {}", e);
            }
        }
    }

    fn encode_task(&self, task: EncodeTask) {
        let packets = match self.encoder.lock().encode(&task.pcm) {
            Ok(packets) => packets,
            Err(e) => {
                log::error!("Failed to encode audio: {}", e);
                return;
            }
        };
        if packets.is_empty() {
            return;
        }

        {
            let mut q = self.queues.lock();
            for data in packets {
                let packet =
                    AudioPacket::opus(data, WIRE_SAMPLE_RATE, OPUS_FRAME_DURATION_MS, task.timestamp);
                match task.target {
                    EncodeTarget::Send => q.send.push_back(packet),
                    EncodeTarget::Testing => q.testing.push_back(packet),
                }
            }
        }
        if task.target == EncodeTarget::Send {
            if let Some(cb) = &self.callbacks.read().on_send_queue_available {
                cb();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{Codec, CodecFormat};
    use crate::audio::mock::MockDriver;
    use crate::protocol::allocate_binary_protocol3;
    use crate::settings::Settings;
    use std::sync::mpsc;

    type MockCodec = Codec<MockDriver>;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn mock_codec(output_sample_rate: u32) -> Arc<MockCodec> {
        let format = CodecFormat {
            input_sample_rate: 16000,
            output_sample_rate,
            input_reference: false,
            duplex: false,
        };
        Arc::new(Codec::new(format, MockDriver::default(), Settings::in_memory()))
    }

    fn service(rt: &tokio::runtime::Runtime, codec: &Arc<MockCodec>) -> AudioService {
        AudioService::new(codec.clone(), rt.handle().clone()).unwrap()
    }

    fn sine_packets(count: usize) -> Vec<AudioPacket> {
        let mut encoder = OpusEncoderWrapper::new(16000, 1, 60).unwrap();
        let pcm: Vec<i16> = (0..960 * count)
            .map(|i| ((i as f32 * 0.1).sin() * 6000.0) as i16)
            .collect();
        encoder
            .encode(&pcm)
            .unwrap()
            .into_iter()
            .map(|data| AudioPacket::opus(data, 16000, 60, 0))
            .collect()
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn playback_stopped_channel(service: &AudioService) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        service.set_callbacks(AudioServiceCallbacks {
            on_playback_stopped: Some(Box::new(move || {
                let _ = tx.lock().send(());
            })),
            ..Default::default()
        });
        rx
    }

    #[test]
    fn reset_decoder_empties_inbound_queues() {
        let rt = runtime();
        let codec = mock_codec(16000);
        let service = service(&rt, &codec);
        for packet in sine_packets(3) {
            assert!(service.push_packet_to_decode_queue(packet, false));
        }
        assert_eq!(service.pending_playback(), 3);
        assert!(!service.is_idle());

        service.reset_decoder();
        assert_eq!(service.pending_playback(), 0);
        assert!(service.is_idle());
    }

    #[test]
    fn full_decode_queue_rejects_without_wait() {
        let rt = runtime();
        let codec = mock_codec(16000);
        let service = service(&rt, &codec);
        for _ in 0..MAX_DECODE_PACKETS_IN_QUEUE {
            assert!(service.push_packet_to_decode_queue(AudioPacket::opus(vec![1], 16000, 60, 0), false));
        }
        assert!(!service.push_packet_to_decode_queue(AudioPacket::opus(vec![1], 16000, 60, 0), false));
    }

    #[test]
    fn play_sound_queues_every_frame() {
        let rt = runtime();
        let codec = mock_codec(16000);
        let service = service(&rt, &codec);
        let mut sound = Vec::new();
        for packet in sine_packets(3) {
            let AudioPayload::Opus(data) = packet.payload else { unreachable!() };
            sound.extend_from_slice(&allocate_binary_protocol3(0, &data).unwrap());
        }
        service.set_break_speaking(true);
        service.play_sound(&sound);
        assert_eq!(service.pending_playback(), 3);
        assert!(!service.break_speaking());
    }

    #[test]
    fn inbound_audio_is_played_then_stop_fires() {
        let rt = runtime();
        let codec = mock_codec(16000);
        let service = service(&rt, &codec);
        let stopped = playback_stopped_channel(&service);
        service.start().unwrap();

        for packet in sine_packets(4) {
            service.push_packet_to_decode_queue(packet, true);
        }
        service.push_packet_to_decode_queue(AudioPacket::marker(AudioPacketKind::Stop, None), true);

        stopped.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(codec.driver().written().len(), 960 * 4);
        service.stop();
    }

    #[test]
    fn inbound_audio_is_resampled_to_codec_rate() {
        let rt = runtime();
        let codec = mock_codec(24000);
        let service = service(&rt, &codec);
        let stopped = playback_stopped_channel(&service);
        service.start().unwrap();

        for packet in sine_packets(2) {
            service.push_packet_to_decode_queue(packet, true);
        }
        service.push_packet_to_decode_queue(AudioPacket::marker(AudioPacketKind::Stop, None), true);

        stopped.recv_timeout(Duration::from_secs(5)).unwrap();
        let written = codec.driver().written().len();
        assert!(written > 1440 && written <= 1440 * 2, "wrote {}", written);
        service.stop();
    }

    #[test]
    fn break_speaking_drops_audio_but_not_stop() {
        let rt = runtime();
        let codec = mock_codec(16000);
        let service = service(&rt, &codec);
        let stopped = playback_stopped_channel(&service);
        service.set_break_speaking(true);
        service.start().unwrap();

        for packet in sine_packets(3) {
            service.push_packet_to_decode_queue(packet, true);
        }
        service.push_packet_to_decode_queue(AudioPacket::marker(AudioPacketKind::Stop, None), true);

        stopped.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(codec.driver().written().is_empty());
        service.stop();
    }

    #[test]
    fn skip_to_end_resumes_after_sentence_end() {
        let rt = runtime();
        let codec = mock_codec(16000);
        let service = service(&rt, &codec);
        let stopped = playback_stopped_channel(&service);

        let mut packets = sine_packets(3).into_iter();
        service.push_packet_to_decode_queue(packets.next().unwrap(), false);
        service.push_packet_to_decode_queue(AudioPacket::marker(AudioPacketKind::SentenceEnd, None), false);
        service.push_packet_to_decode_queue(packets.next().unwrap(), false);
        service.push_packet_to_decode_queue(AudioPacket::marker(AudioPacketKind::Stop, None), false);
        service.skip_to_end();
        service.start().unwrap();

        stopped.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(codec.driver().written().len(), 960);
        service.stop();
    }

    #[test]
    fn sentence_markers_reach_callbacks_in_order() {
        let rt = runtime();
        let codec = mock_codec(16000);
        let service = service(&rt, &codec);
        let (tx, rx) = mpsc::channel::<String>();
        let (start_tx, end_tx, stop_tx) = (
            Mutex::new(tx.clone()),
            Mutex::new(tx.clone()),
            Mutex::new(tx),
        );
        service.set_callbacks(AudioServiceCallbacks {
            on_sentence_start: Some(Box::new(move |text| {
                let _ = start_tx.lock().send(format!("start:{}", text));
            })),
            on_sentence_end: Some(Box::new(move || {
                let _ = end_tx.lock().send("end".into());
            })),
            on_playback_stopped: Some(Box::new(move || {
                let _ = stop_tx.lock().send("stop".into());
            })),
            ..Default::default()
        });
        service.start().unwrap();

        service.push_packet_to_decode_queue(
            AudioPacket::marker(AudioPacketKind::SentenceStart, Some("你好".into())),
            true,
        );
        for packet in sine_packets(1) {
            service.push_packet_to_decode_queue(packet, true);
        }
        service.push_packet_to_decode_queue(AudioPacket::marker(AudioPacketKind::SentenceEnd, None), true);
        service.push_packet_to_decode_queue(AudioPacket::marker(AudioPacketKind::Stop, None), true);

        let events: Vec<String> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(events, vec!["start:你好", "end", "stop"]);
        service.stop();
    }

    #[test]
    fn voice_processing_encodes_mic_frames() {
        let rt = runtime();
        let codec = mock_codec(16000);
        let service = service(&rt, &codec);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        service.set_callbacks(AudioServiceCallbacks {
            on_send_queue_available: Some(Box::new(move || {
                let _ = tx.lock().send(());
            })),
            ..Default::default()
        });
        codec.driver().feed_capture(&vec![500i16; 960 * 3]);
        service.enable_voice_processing(true);
        service.start().unwrap();

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        let packets: Vec<_> = std::iter::from_fn(|| service.pop_packet_from_send_queue()).collect();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.sample_rate == 16000 && p.frame_duration == 60));
        assert_eq!(service.send_queue_len(), 0);
        service.stop();
    }

    #[test]
    fn audio_testing_plays_back_recording() {
        let rt = runtime();
        let codec = mock_codec(16000);
        let service = service(&rt, &codec);
        codec.driver().feed_capture(&vec![800i16; 960 * 2]);
        service.enable_audio_testing(true);
        service.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || service.testing_queue_len() == 2));
        service.enable_audio_testing(false);
        assert!(wait_until(Duration::from_secs(5), || {
            codec.driver().written().len() == 960 * 2
        }));
        service.stop();
    }

    struct KeywordDetector;

    impl WakeWordDetector for KeywordDetector {
        fn feed_size(&self) -> usize {
            512
        }

        fn feed(&mut self, data: &[i16]) -> Option<String> {
            data.contains(&1234).then(|| "你好小智".to_string())
        }

        fn start(&mut self) {}
        fn stop(&mut self) {}
    }

    #[test]
    fn wake_word_detection_reports_word() {
        let rt = runtime();
        let codec = mock_codec(16000);
        let service = service(&rt, &codec);
        assert!(!service.is_wake_word_running());
        service.enable_wake_word_detection(true);
        assert!(!service.is_wake_word_running());

        service.set_wake_word(Box::new(KeywordDetector));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        service.set_callbacks(AudioServiceCallbacks {
            on_wake_word_detected: Some(Box::new(move |word| {
                let _ = tx.lock().send(word.to_string());
            })),
            ..Default::default()
        });
        service.enable_wake_word_detection(true);
        assert!(service.is_wake_word_running());
        codec.driver().feed_capture(&[1234i16; 512]);
        service.start().unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "你好小智");
        service.stop();
    }

    #[test]
    fn power_check_disables_idle_codec() {
        let rt = runtime();
        let codec = mock_codec(16000);
        let service = service(&rt, &codec);
        assert!(codec.input_enabled() && codec.output_enabled());

        service.check_audio_power(Instant::now());
        assert!(codec.input_enabled() && codec.output_enabled());

        service.check_audio_power(Instant::now() + Duration::from_secs(16));
        assert!(!codec.input_enabled());
        assert!(!codec.output_enabled());
    }
}
