mod alarm_manager;
mod application;
mod assets;
mod audio;
mod board;
mod config;
mod display;
mod gui_bridge;
mod net_link;
mod power_save_timer;
mod protocol;
mod settings;
mod state_machine;
mod timer;

use alarm_manager::{AlarmManager, SystemClock};
use application::Application;
use assets::{SOUND_POPUP, SoundAssets};
use audio::{AudioCodec, AudioService, alsa_codec};
use board::{Board, LinuxBoard};
use config::Config;
use display::{Display, NoLed};
use gui_bridge::{GuiBridge, GuiDisplay, GuiEvent};
use mac_address::get_mac_address;
use net_link::WebsocketProtocol;
use power_save_timer::{CpuGovernor, PowerSaveTimer, SleepHost, SysfsCpuGovernor};
use protocol::ProtocolListener;
use settings::Settings;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::signal;
use tokio::sync::mpsc;
use uuid::Uuid;

const CLIENT_ID_FILE: &str = "xiaozhi_uuid.txt";
const CPUFREQ_POLICY: &str = "/sys/devices/system/cpu/cpufreq/policy0";

// 设备id和客户端id的处理
fn resolve_identity(config: &mut Config) {
    if config.device_id == "unknown-device" {
        config.device_id = match get_mac_address() {
            Ok(Some(mac)) => mac.to_string().to_lowercase(),
            _ => Uuid::new_v4().to_string(),
        };
    }

    // 设备端UUID，先从本地文件读取以保持重启间身份一致，如果不存在则生成新的并保存
    if config.client_id == "unknown-client" {
        if let Ok(content) = std::fs::read_to_string(CLIENT_ID_FILE) {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                config.client_id = trimmed.to_string();
                log::info!("Loaded client id from {}: {}", CLIENT_ID_FILE, config.client_id);
            }
        }
    }
    if config.client_id == "unknown-client" {
        config.client_id = Uuid::new_v4().to_string();
        log::info!("Generated new client id: {}", config.client_id);
        if let Err(e) = std::fs::write(CLIENT_ID_FILE, &config.client_id) {
            log::warn!("Failed to save client id to {}: {}", CLIENT_ID_FILE, e);
        }
    }
}

fn open_codec(config: &Config, settings: &Settings) -> anyhow::Result<Arc<dyn AudioCodec>> {
    let codec: Arc<dyn AudioCodec> = if config.audio_duplex {
        Arc::new(alsa_codec::duplex(
            config.audio_capture_device,
            config.audio_input_sample_rate,
            config.audio_output_sample_rate,
            config.audio_input_reference,
            settings.clone(),
        )?)
    } else {
        Arc::new(alsa_codec::simplex(
            config.audio_capture_device,
            config.audio_playback_device,
            config.audio_input_sample_rate,
            config.audio_output_sample_rate,
            config.audio_input_reference,
            settings.clone(),
        ))
    };
    Ok(codec)
}

fn log_next_alarm(alarm_manager: &AlarmManager) {
    let Some(alarm) = alarm_manager.next_alarm() else {
        log::info!("No alarm armed");
        return;
    };
    let remaining = alarm_manager
        .timer_deadline()
        .map(|deadline| deadline.saturating_duration_since(tokio::time::Instant::now()))
        .unwrap_or_default();
    log::info!("Next alarm: {} in {}s", alarm.name, remaining.as_secs());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let mut config = match Config::new() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    resolve_identity(&mut config);
    log::info!(
        "{} {} on {} ({})",
        config.app_name,
        config.app_version,
        config.board_name,
        config.device_id
    );

    let settings = Settings::open(config.settings_path)?;
    let codec = open_codec(&config, &settings)?;

    // GUI进程通道
    let (tx_gui_event, mut rx_gui_event) = mpsc::channel::<GuiEvent>(100);
    let (tx_gui_out, rx_gui_out) = mpsc::unbounded_channel::<String>();
    let gui_display = Arc::new(GuiDisplay::new(tx_gui_out));

    let board = Arc::new(LinuxBoard::new(
        config.board_type,
        codec.clone(),
        gui_display.clone(),
        Arc::new(NoLed),
        settings.clone(),
    ));
    log::info!("Board type: {}", board.board_type());

    let audio_service = AudioService::new(codec.clone(), Handle::current())?;
    audio_service.start()?;

    let app = Application::new(
        board.clone(),
        audio_service,
        SoundAssets::new(config.assets_dir),
        &settings,
    );
    let display = gui_display.clone();
    app.add_state_observer(Box::new(move |_, next| display.set_state(next.code())));

    // 节能定时器
    let governor: Option<Arc<dyn CpuGovernor>> = if config.cpu_max_freq_mhz != -1 {
        Some(Arc::new(SysfsCpuGovernor::new(CPUFREQ_POLICY)))
    } else {
        None
    };
    let host: Weak<dyn SleepHost> = Arc::downgrade(&app) as Weak<dyn SleepHost>;
    let power_save_timer = PowerSaveTimer::new(
        config.cpu_max_freq_mhz,
        config.seconds_to_sleep,
        config.seconds_to_shutdown,
        settings.clone(),
        host,
        governor,
        Handle::current(),
    );
    let sleep_board = board.clone();
    power_save_timer.on_enter_sleep_mode(move || sleep_board.enter_light_sleep());
    let wake_board = board.clone();
    power_save_timer.on_exit_sleep_mode(move || wake_board.exit_light_sleep());
    let weak_app = Arc::downgrade(&app);
    power_save_timer.on_shutdown_request(move || {
        log::warn!("Idle for too long, shutting down");
        if let Some(app) = weak_app.upgrade() {
            app.quit();
        }
    });
    board.attach_power_save_timer(power_save_timer);
    board.set_power_save_mode(true);

    // 闹钟
    let alarm_manager = AlarmManager::new(settings.clone(), Arc::new(SystemClock), Handle::current());
    let weak_app = Arc::downgrade(&app);
    alarm_manager.on_alarm(move |alarm| {
        if let Some(app) = weak_app.upgrade() {
            app.on_alarm(alarm);
        }
    });
    for alarm in alarm_manager.list_alarms() {
        log::info!("Alarm {} armed in slot {} for {}", alarm.name, alarm.slot, alarm.time);
    }

    // 网络协议
    let protocol = WebsocketProtocol::new(config.clone(), Handle::current());
    let listener: Weak<dyn ProtocolListener> = Arc::downgrade(&app) as Weak<dyn ProtocolListener>;
    protocol.set_listener(listener);
    app.set_protocol(protocol);
    app.start()?;

    let loop_app = app.clone();
    let main_loop = std::thread::Builder::new()
        .name("main_loop".into())
        .spawn(move || loop_app.run_main_loop())?;

    // 启动GUI桥，与GUI进程通信
    let gui_bridge = Arc::new(GuiBridge::new(&config, tx_gui_event).await?);
    let gui_bridge_clone = gui_bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = gui_bridge_clone.run().await {
            log::error!("GuiBridge error: {}", e);
        }
    });
    tokio::spawn(async move {
        gui_bridge.forward(rx_gui_out).await;
    });

    log::info!("Xiaozhi core started, state {}", app.device_state().name());
    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            // 监听来自GUI桥的GUI事件
            event = rx_gui_event.recv() => {
                let Some(event) = event else { break };
                log::debug!("GUI event: {:?}", event);
                match event {
                    // 闹钟响铃时，按键只用于关闭闹钟
                    GuiEvent::ToggleChat if alarm_manager.is_ringing() => {
                        alarm_manager.stop_ringing();
                        app.dismiss_alert();
                    }
                    GuiEvent::ToggleChat => app.toggle_chat_state(),
                    GuiEvent::StartListening => app.start_listening(),
                    GuiEvent::StopListening => app.stop_listening(),
                    GuiEvent::SkipSentence => app.skip_sentence(),
                    GuiEvent::SetVolume(volume) => {
                        board.wake_up();
                        codec.set_output_volume(volume);
                    }
                    GuiEvent::SetAlarm { seconds, name } => {
                        match alarm_manager.set_alarm(seconds, &name) {
                            Ok(()) => app.play_sound(SOUND_POPUP),
                            Err(e) => {
                                gui_display.show_notification(&e.to_string(), Duration::from_secs(3));
                            }
                        }
                        log_next_alarm(&alarm_manager);
                    }
                    GuiEvent::CancelAlarm(name) => {
                        if !alarm_manager.cancel_alarm(&name) {
                            log::warn!("No alarm named {}", name);
                        }
                        log_next_alarm(&alarm_manager);
                    }
                }
            }
        }
    }

    app.quit();
    if main_loop.join().is_err() {
        log::error!("Main loop panicked");
    }
    app.audio_service().stop();
    Ok(())
}
