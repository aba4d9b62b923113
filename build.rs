use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    board: Board,
    audio: Audio,
    gui: Gui,
    network: Network,
    hello_message: HelloMessage,
    power_save: PowerSave,
    storage: Storage,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Board {
    #[serde(rename = "type")]
    type_: String,
    name: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    input_sample_rate: u32,
    output_sample_rate: u32,
    duplex: bool,
    input_reference: bool,
}

#[derive(Deserialize)]
struct Gui {
    local_port: u16,
    remote_port: u16,
    local_ip: String,
    remote_ip: String,
    buffer_size: usize,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    ws_token: String,
    device_id: String,
    client_id: String,
    protocol_version: u8,
}

#[derive(Deserialize)]
struct HelloMessage {
    format: String,
    sample_rate: u32,
    channels: u8,
    frame_duration: u32,
}

#[derive(Deserialize)]
struct PowerSave {
    cpu_max_freq_mhz: i32,
    seconds_to_sleep: i32,
    seconds_to_shutdown: i32,
}

#[derive(Deserialize)]
struct Storage {
    settings_path: String,
    assets_dir: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用和板子信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);
    println!("cargo:rustc-env=BOARD_TYPE={}", config.board.type_);
    println!("cargo:rustc-env=BOARD_NAME={}", config.board.name);

    // 音频配置
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_INPUT_SAMPLE_RATE={}", config.audio.input_sample_rate);
    println!("cargo:rustc-env=AUDIO_OUTPUT_SAMPLE_RATE={}", config.audio.output_sample_rate);
    println!("cargo:rustc-env=AUDIO_DUPLEX={}", config.audio.duplex);
    println!("cargo:rustc-env=AUDIO_INPUT_REFERENCE={}", config.audio.input_reference);

    // GUI 配置
    println!("cargo:rustc-env=GUI_LOCAL_PORT={}", config.gui.local_port);
    println!("cargo:rustc-env=GUI_REMOTE_PORT={}", config.gui.remote_port);
    println!("cargo:rustc-env=GUI_LOCAL_IP={}", config.gui.local_ip);
    println!("cargo:rustc-env=GUI_REMOTE_IP={}", config.gui.remote_ip);
    println!("cargo:rustc-env=GUI_BUFFER_SIZE={}", config.gui.buffer_size);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=WS_TOKEN={}", config.network.ws_token);
    println!("cargo:rustc-env=DEVICE_ID={}", config.network.device_id);
    println!("cargo:rustc-env=CLIENT_ID={}", config.network.client_id);
    println!("cargo:rustc-env=PROTOCOL_VERSION={}", config.network.protocol_version);

    // Hello 消息配置
    println!("cargo:rustc-env=HELLO_FORMAT={}", config.hello_message.format);
    println!("cargo:rustc-env=HELLO_SAMPLE_RATE={}", config.hello_message.sample_rate);
    println!("cargo:rustc-env=HELLO_CHANNELS={}", config.hello_message.channels);
    println!("cargo:rustc-env=HELLO_FRAME_DURATION={}", config.hello_message.frame_duration);

    // 节能配置，-1 表示禁用
    println!("cargo:rustc-env=CPU_MAX_FREQ_MHZ={}", config.power_save.cpu_max_freq_mhz);
    println!("cargo:rustc-env=SECONDS_TO_SLEEP={}", config.power_save.seconds_to_sleep);
    println!("cargo:rustc-env=SECONDS_TO_SHUTDOWN={}", config.power_save.seconds_to_shutdown);

    // 存储
    println!("cargo:rustc-env=SETTINGS_PATH={}", config.storage.settings_path);
    println!("cargo:rustc-env=ASSETS_DIR={}", config.storage.assets_dir);

    link_speexdsp();
}

fn link_speexdsp() {
    let target = std::env::var("TARGET").unwrap_or_default();

    if target.contains("musl") {
        // musl 目标：使用手动编译的静态库，不依赖 pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speexdsp");
        return;
    }

    // 其他目标：通过 pkg-config 查找 libspeexdsp
    pkg_config::Config::new()
        .probe("speexdsp")
        .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");
}
