//! Session orchestration: device state, the main task queue and the control
//! surface buttons and GUI events call into.
//!
//! Everything that touches the protocol or the state machine runs on the
//! main loop thread. Other threads (audio, network, timers) hand work over
//! with [`Application::schedule`].

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::alarm_manager::Alarm;
use crate::assets::{SOUND_EXCLAMATION, SOUND_SUCCESS, SOUND_VIBRATION, SoundAssets};
use crate::audio::{AudioService, AudioServiceCallbacks};
use crate::board::Board;
use crate::power_save_timer::SleepHost;
use crate::protocol::{
    AbortReason, AudioPacket, AudioPacketKind, ListeningMode, Protocol, ProtocolListener,
    ServerMessage,
};
use crate::settings::Settings;
use crate::state_machine::{DeviceState, StateMachine, StateObserver};

const NOTIFICATION_DURATION: Duration = Duration::from_secs(3);
const MAIN_LOOP_TICK: Duration = Duration::from_secs(1);

pub type MainTask = Box<dyn FnOnce(&Application) + Send>;

pub struct Application {
    board: Arc<dyn Board>,
    audio_service: AudioService,
    assets: SoundAssets,
    state: StateMachine,
    protocol: RwLock<Option<Arc<dyn Protocol>>>,
    main_tasks: Mutex<VecDeque<MainTask>>,
    main_tasks_cv: Condvar,
    running: AtomicBool,
    keep_listening: AtomicBool,
    listening_mode: Mutex<ListeningMode>,
    realtime_chat: bool,
    send_scheduled: AtomicBool,
    weak_self: Weak<Application>,
}

impl Application {
    pub fn new(
        board: Arc<dyn Board>,
        audio_service: AudioService,
        assets: SoundAssets,
        settings: &Settings,
    ) -> Arc<Self> {
        let realtime_chat = settings.get_bool("audio", "realtime_chat", false);
        let app = Arc::new_cyclic(|weak: &Weak<Application>| Self {
            board,
            audio_service,
            assets,
            state: StateMachine::new(),
            protocol: RwLock::new(None),
            main_tasks: Mutex::new(VecDeque::new()),
            main_tasks_cv: Condvar::new(),
            running: AtomicBool::new(true),
            keep_listening: AtomicBool::new(false),
            listening_mode: Mutex::new(ListeningMode::AutoStop),
            realtime_chat,
            send_scheduled: AtomicBool::new(false),
            weak_self: weak.clone(),
        });

        let led = app.board.led();
        app.state
            .add_observer(Box::new(move |_, next| led.on_state_changed(next)));
        app.audio_service.set_callbacks(app.audio_callbacks());
        app
    }

    fn audio_callbacks(&self) -> AudioServiceCallbacks {
        let weak = self.weak_self.clone();
        let on_send_queue_available = move || {
            if let Some(app) = weak.upgrade() {
                // One drain task in flight is enough.
                if !app.send_scheduled.swap(true, Ordering::SeqCst) {
                    app.schedule(|app| {
                        app.send_scheduled.store(false, Ordering::SeqCst);
                        app.send_pending_audio();
                    });
                }
            }
        };

        let weak = self.weak_self.clone();
        let on_wake_word_detected = move |word: &str| {
            if let Some(app) = weak.upgrade() {
                let word = word.to_string();
                app.schedule(move |app| app.handle_wake_word(&word));
            }
        };

        let weak = self.weak_self.clone();
        let on_sentence_start = move |text: &str| {
            if let Some(app) = weak.upgrade() {
                log::info!("<< {}", text);
                app.board.display().set_chat_message("assistant", text);
            }
        };

        let weak = self.weak_self.clone();
        let on_playback_stopped = move || {
            if let Some(app) = weak.upgrade() {
                app.schedule(|app| app.handle_playback_stopped());
            }
        };

        AudioServiceCallbacks {
            on_send_queue_available: Some(Box::new(on_send_queue_available)),
            on_wake_word_detected: Some(Box::new(on_wake_word_detected)),
            on_sentence_start: Some(Box::new(on_sentence_start)),
            on_sentence_end: None,
            on_playback_stopped: Some(Box::new(on_playback_stopped)),
        }
    }

    pub fn set_protocol(&self, protocol: Arc<dyn Protocol>) {
        *self.protocol.write() = Some(protocol);
    }

    fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.protocol.read().clone()
    }

    pub fn add_state_observer(&self, observer: StateObserver) {
        self.state.add_observer(observer);
    }

    pub fn device_state(&self) -> DeviceState {
        self.state.current()
    }

    pub fn audio_service(&self) -> &AudioService {
        &self.audio_service
    }

    pub fn listening_mode(&self) -> ListeningMode {
        *self.listening_mode.lock()
    }

    /// Boot: Starting, protocol start, Idle.
    pub fn start(&self) -> anyhow::Result<()> {
        self.set_device_state(DeviceState::Starting);
        if let Some(protocol) = self.protocol() {
            self.board.display().set_status("初始化协议");
            protocol.start()?;
        }
        self.set_device_state(DeviceState::Idle);
        self.play_sound(SOUND_SUCCESS);
        Ok(())
    }

    /// Queue `task` for the main loop. Safe from any thread.
    pub fn schedule(&self, task: impl FnOnce(&Application) + Send + 'static) {
        let mut tasks = self.main_tasks.lock();
        tasks.push_back(Box::new(task));
        self.main_tasks_cv.notify_one();
    }

    /// Run queued tasks until [`Application::quit`]. Wakes on every
    /// enqueue and at least once per tick.
    pub fn run_main_loop(&self) {
        log::info!("Main loop started");
        while self.running.load(Ordering::SeqCst) {
            {
                let mut tasks = self.main_tasks.lock();
                self.main_tasks_cv.wait_while_for(
                    &mut tasks,
                    |t| t.is_empty() && self.running.load(Ordering::SeqCst),
                    MAIN_LOOP_TICK,
                );
            }
            self.run_pending_tasks();
        }
        log::info!("Main loop stopped");
    }

    /// Run everything queued so far in FIFO order. Returns how many ran.
    pub fn run_pending_tasks(&self) -> usize {
        let tasks = std::mem::take(&mut *self.main_tasks.lock());
        let count = tasks.len();
        for task in tasks {
            task(self);
        }
        count
    }

    pub fn quit(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _tasks = self.main_tasks.lock();
        self.main_tasks_cv.notify_all();
    }

    pub fn toggle_chat_state(&self) {
        self.schedule(|app| app.toggle_chat_state_now());
    }

    /// Press-and-hold start.
    pub fn start_listening(&self) {
        self.schedule(|app| app.start_listening_now());
    }

    /// Press-and-hold release.
    pub fn stop_listening(&self) {
        self.schedule(|app| app.stop_listening_now());
    }

    /// Drop the rest of the sentence being spoken.
    pub fn skip_sentence(&self) {
        self.schedule(|app| {
            if app.device_state() == DeviceState::Speaking {
                log::info!("Skipping to the end of the sentence");
                app.audio_service.skip_to_end();
            }
        });
    }

    fn toggle_chat_state_now(&self) {
        self.board.wake_up();
        match self.device_state() {
            DeviceState::WifiConfiguring => {
                self.audio_service.enable_audio_testing(true);
                self.set_device_state(DeviceState::AudioTesting);
                return;
            }
            DeviceState::AudioTesting => {
                self.audio_service.enable_audio_testing(false);
                self.set_device_state(DeviceState::WifiConfiguring);
                return;
            }
            _ => {}
        }

        let Some(protocol) = self.protocol() else {
            log::error!("Protocol not initialized");
            return;
        };
        match self.device_state() {
            DeviceState::Idle => {
                if !self.ensure_audio_channel(protocol.as_ref()) {
                    return;
                }
                let mode = if self.realtime_chat {
                    ListeningMode::Realtime
                } else {
                    ListeningMode::AutoStop
                };
                self.keep_listening.store(true, Ordering::SeqCst);
                self.begin_listening(protocol.as_ref(), mode);
            }
            DeviceState::Speaking => {
                self.abort_speaking(AbortReason::None);
                self.keep_listening.store(false, Ordering::SeqCst);
                protocol.close_audio_channel();
                self.set_device_state(DeviceState::Idle);
            }
            DeviceState::Listening => {
                self.keep_listening.store(false, Ordering::SeqCst);
                protocol.close_audio_channel();
                self.set_device_state(DeviceState::Idle);
            }
            state => log::debug!("Toggle ignored in state {}", state.name()),
        }
    }

    fn start_listening_now(&self) {
        self.board.wake_up();
        let Some(protocol) = self.protocol() else {
            log::error!("Protocol not initialized");
            return;
        };
        match self.device_state() {
            DeviceState::Idle => {
                if !self.ensure_audio_channel(protocol.as_ref()) {
                    return;
                }
                self.keep_listening.store(false, Ordering::SeqCst);
                self.begin_listening(protocol.as_ref(), ListeningMode::ManualStop);
            }
            DeviceState::Speaking => {
                self.abort_speaking(AbortReason::None);
                self.keep_listening.store(false, Ordering::SeqCst);
                self.begin_listening(protocol.as_ref(), ListeningMode::ManualStop);
            }
            _ => {}
        }
    }

    fn stop_listening_now(&self) {
        if self.device_state() != DeviceState::Listening {
            return;
        }
        if let Some(protocol) = self.protocol() {
            protocol.send_stop_listening();
        }
        self.set_device_state(DeviceState::Idle);
    }

    /// Open the audio channel if needed, passing through Connecting.
    /// On failure the user is alerted and the device is back to Idle.
    fn ensure_audio_channel(&self, protocol: &dyn Protocol) -> bool {
        if protocol.is_audio_channel_opened() {
            return true;
        }
        self.set_device_state(DeviceState::Connecting);
        if let Err(e) = protocol.open_audio_channel() {
            log::warn!("Failed to open audio channel: {:#}", e);
            self.set_device_state(DeviceState::Idle);
            self.alert("错误", "无法连接服务器", "sad", Some(SOUND_EXCLAMATION));
            return false;
        }
        true
    }

    fn begin_listening(&self, protocol: &dyn Protocol, mode: ListeningMode) {
        *self.listening_mode.lock() = mode;
        protocol.send_start_listening(mode);
        self.set_device_state(DeviceState::Listening);
    }

    fn handle_wake_word(&self, wake_word: &str) {
        let Some(protocol) = self.protocol() else {
            return;
        };
        match self.device_state() {
            DeviceState::Idle => {
                self.set_device_state(DeviceState::WakeWordDetected);
                if !self.ensure_audio_channel(protocol.as_ref()) {
                    return;
                }
                protocol.send_wake_word_detected(wake_word);
                self.keep_listening.store(true, Ordering::SeqCst);
                self.begin_listening(protocol.as_ref(), ListeningMode::AutoStop);
            }
            DeviceState::Speaking => self.abort_speaking(AbortReason::WakeWordDetected),
            state => log::debug!("Wake word ignored in state {}", state.name()),
        }
    }

    fn handle_playback_stopped(&self) {
        if self.device_state() != DeviceState::Speaking {
            return;
        }
        let protocol = self.protocol();
        match protocol {
            Some(protocol) if self.keep_listening.load(Ordering::SeqCst) => {
                let mode = self.listening_mode();
                protocol.send_start_listening(mode);
                self.set_device_state(DeviceState::Listening);
            }
            _ => self.set_device_state(DeviceState::Idle),
        }
    }

    /// Hand queued mic packets to the protocol.
    fn send_pending_audio(&self) {
        let protocol = self.protocol();
        while let Some(packet) = self.audio_service.pop_packet_from_send_queue() {
            let sent = protocol.as_ref().is_some_and(|p| p.send_audio(packet));
            if !sent {
                log::debug!("Dropping outgoing audio, channel not open");
            }
        }
    }

    /// The single place the device state changes.
    pub fn set_device_state(&self, state: DeviceState) {
        let result = self
            .state
            .transition(state, |_previous, next| self.apply_state(next));
        if let Err(e) = result {
            log::warn!("{}", e);
        }
    }

    fn apply_state(&self, state: DeviceState) {
        let display = self.board.display();
        let codec = self.board.audio_codec();
        match state {
            DeviceState::Unknown | DeviceState::Idle => {
                display.set_status("待命");
                display.set_emotion("neutral");
                self.audio_service.enable_voice_processing(false);
                self.audio_service.enable_wake_word_detection(true);
                if !self.audio_service.is_wake_word_running() {
                    codec.enable_input(false);
                }
            }
            DeviceState::Starting => display.set_status("初始化中..."),
            DeviceState::WifiConfiguring => display.set_status("配网模式"),
            DeviceState::Connecting => {
                display.set_status("连接中...");
                display.set_chat_message("system", "");
            }
            DeviceState::WakeWordDetected => display.set_status("唤醒"),
            DeviceState::Listening => {
                display.set_status("聆听中...");
                display.set_emotion("neutral");
                self.audio_service.reset_decoder();
                if !self.audio_service.is_voice_processing() {
                    self.audio_service.enable_voice_processing(true);
                    self.audio_service.enable_wake_word_detection(false);
                }
            }
            DeviceState::Speaking => {
                display.set_status("说话中...");
                if self.listening_mode() != ListeningMode::Realtime {
                    self.audio_service.enable_voice_processing(false);
                    self.audio_service.enable_wake_word_detection(true);
                }
                self.audio_service.reset_decoder();
            }
            DeviceState::Upgrading => display.set_status("升级中..."),
            DeviceState::Activating => display.set_status("激活中..."),
            DeviceState::AudioTesting => display.set_status("音频测试"),
            DeviceState::FatalError => display.set_status("错误"),
        }
    }

    /// Show a system message. Whatever was queued for playback is dropped,
    /// then the optional sound plays.
    pub fn alert(&self, status: &str, message: &str, emotion: &str, sound: Option<&str>) {
        log::warn!("Alert {}: {} [{}]", status, message, emotion);
        let display = self.board.display();
        display.set_status(status);
        display.set_emotion(emotion);
        display.set_chat_message("system", message);
        self.audio_service.reset_decoder();
        if let Some(sound) = sound {
            self.play_sound(sound);
        }
    }

    pub fn dismiss_alert(&self) {
        if self.device_state() == DeviceState::Idle {
            let display = self.board.display();
            display.set_status("待命");
            display.set_emotion("neutral");
            display.set_chat_message("system", "");
        }
    }

    /// Stop the current reply: drop what is queued and tell the server.
    pub fn abort_speaking(&self, reason: AbortReason) {
        log::info!("Abort speaking");
        self.audio_service.set_break_speaking(true);
        self.audio_service.reset_decoder();
        if let Some(protocol) = self.protocol() {
            protocol.send_abort_speaking(reason);
        }
    }

    /// Queue a bundled sound by name.
    pub fn play_sound(&self, name: &str) {
        match self.assets.load(name) {
            Ok(sound) => self.audio_service.play_sound(&sound),
            Err(e) => log::warn!("Cannot play sound {}: {:#}", name, e),
        }
    }

    pub fn can_enter_sleep_mode(&self) -> bool {
        if self.device_state() != DeviceState::Idle {
            return false;
        }
        if self
            .protocol()
            .is_some_and(|p| p.is_audio_channel_opened())
        {
            return false;
        }
        self.audio_service.is_idle()
    }

    /// Alarm fired: show it, ring, and let the server announce it.
    pub fn on_alarm(&self, alarm: &Alarm) {
        let name = alarm.name.clone();
        self.schedule(move |app| {
            app.board.wake_up();
            let display = app.board.display();
            display.set_status("闹钟");
            display.show_notification(&name, NOTIFICATION_DURATION);

            if app.device_state() == DeviceState::Idle {
                if let Some(protocol) = app.protocol() {
                    if app.ensure_audio_channel(protocol.as_ref()) {
                        protocol.send_wake_word_detected(&name);
                        app.keep_listening.store(false, Ordering::SeqCst);
                        app.begin_listening(protocol.as_ref(), ListeningMode::AutoStop);
                    }
                }
            }
            app.play_sound(SOUND_VIBRATION);
        });
    }

    /// Main loop only. Markers share the decode queue with the audio so they
    /// fire in playback order.
    fn push_marker(&self, kind: AudioPacketKind, text: Option<String>) {
        let packet = AudioPacket::marker(kind, text);
        if !self.audio_service.push_packet_to_decode_queue(packet, true) {
            log::warn!("Audio service stopped, dropping {:?} marker", kind);
        }
    }

    // Every tts state goes through the main loop so markers land after the
    // decoder reset done by the switch to Speaking.
    fn handle_tts(&self, message: ServerMessage) {
        match message.state.as_deref() {
            Some("start") => self.schedule(|app| {
                app.audio_service.set_break_speaking(false);
                if matches!(app.device_state(), DeviceState::Idle | DeviceState::Listening) {
                    app.set_device_state(DeviceState::Speaking);
                }
            }),
            Some("stop") => self.schedule(|app| {
                if app.device_state() == DeviceState::Speaking {
                    app.push_marker(AudioPacketKind::Stop, None);
                }
            }),
            Some("sentence_start") => {
                if let Some(text) = message.text {
                    self.schedule(move |app| {
                        app.push_marker(AudioPacketKind::SentenceStart, Some(text));
                    });
                }
            }
            Some("sentence_end") => {
                self.schedule(|app| app.push_marker(AudioPacketKind::SentenceEnd, None));
            }
            other => log::debug!("Unhandled tts state {:?}", other),
        }
    }
}

impl ProtocolListener for Application {
    fn on_incoming_audio(&self, packet: AudioPacket) {
        if self.device_state() != DeviceState::Speaking || self.audio_service.break_speaking() {
            return;
        }
        if !self.audio_service.push_packet_to_decode_queue(packet, false) {
            log::debug!("Decode queue full, dropping inbound packet");
        }
    }

    fn on_incoming_json(&self, message: ServerMessage) {
        match message.msg_type.as_str() {
            "tts" => self.handle_tts(message),
            "stt" => {
                if let Some(text) = message.text {
                    log::info!(">> {}", text);
                    self.schedule(move |app| app.board.display().set_chat_message("user", &text));
                }
            }
            "llm" => {
                if let Some(emotion) = message.emotion {
                    self.schedule(move |app| app.board.display().set_emotion(&emotion));
                }
            }
            other => log::debug!("Unhandled message type: {}", other),
        }
    }

    fn on_audio_channel_opened(&self) {
        self.board.set_power_save_mode(false);
        let codec = self.board.audio_codec();
        if let Some(protocol) = self.protocol() {
            if protocol.server_sample_rate() != codec.output_sample_rate() {
                log::warn!(
                    "Server sample rate {} differs from output rate {}, audio will be resampled",
                    protocol.server_sample_rate(),
                    codec.output_sample_rate()
                );
            }
        }
    }

    fn on_audio_channel_closed(&self) {
        self.board.set_power_save_mode(true);
        self.schedule(|app| {
            app.board.display().set_chat_message("system", "");
            app.set_device_state(DeviceState::Idle);
        });
    }

    fn on_network_error(&self, message: &str) {
        let message = message.to_string();
        self.schedule(move |app| {
            app.set_device_state(DeviceState::Idle);
            app.alert("错误", &message, "sad", Some(SOUND_EXCLAMATION));
        });
    }
}

impl SleepHost for Application {
    fn can_enter_sleep_mode(&self) -> bool {
        Application::can_enter_sleep_mode(self)
    }

    fn is_wake_word_running(&self) -> bool {
        self.audio_service.is_wake_word_running()
    }

    fn enable_wake_word_detection(&self, enable: bool) {
        self.audio_service.enable_wake_word_detection(enable);
    }

    fn is_audio_input_enabled(&self) -> bool {
        self.board.audio_codec().input_enabled()
    }

    fn enable_audio_input(&self, enable: bool) {
        self.board.audio_codec().enable_input(enable);
    }
}
