use serde::Serialize;

#[derive(Debug, Serialize, Clone)]
pub struct Config {
    // 应用与板子信息
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub board_type: &'static str,
    pub board_name: &'static str,

    // 音频设备配置
    pub audio_capture_device: &'static str,
    pub audio_playback_device: &'static str,
    pub audio_input_sample_rate: u32,
    pub audio_output_sample_rate: u32,
    pub audio_duplex: bool,
    pub audio_input_reference: bool,

    // GUI进程配置
    pub gui_local_port: u16,
    pub gui_remote_port: u16,
    pub gui_local_ip: &'static str,
    pub gui_remote_ip: &'static str,
    pub gui_buffer_size: usize,

    // 网络配置（静态部分）
    pub ws_url: &'static str,
    pub ws_token: &'static str,
    pub protocol_version: u8,

    // 设备标识（动态部分，可在运行时修改）
    pub device_id: String,
    pub client_id: String,

    // Hello消息参数
    pub hello_format: &'static str,
    pub hello_sample_rate: u32,
    pub hello_channels: u8,
    pub hello_frame_duration: u32,

    // 节能定时器参数，-1 表示禁用
    pub cpu_max_freq_mhz: i32,
    pub seconds_to_sleep: i32,
    pub seconds_to_shutdown: i32,

    // 存储路径
    pub settings_path: &'static str,
    pub assets_dir: &'static str,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),
            board_type: env!("BOARD_TYPE"),
            board_name: env!("BOARD_NAME"),

            // 音频设备配置
            audio_capture_device: env!("AUDIO_CAPTURE_DEVICE"),
            audio_playback_device: env!("AUDIO_PLAYBACK_DEVICE"),
            audio_input_sample_rate: env!("AUDIO_INPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse AUDIO_INPUT_SAMPLE_RATE")?,
            audio_output_sample_rate: env!("AUDIO_OUTPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse AUDIO_OUTPUT_SAMPLE_RATE")?,
            audio_duplex: env!("AUDIO_DUPLEX").parse()
                .map_err(|_| "Failed to parse AUDIO_DUPLEX")?,
            audio_input_reference: env!("AUDIO_INPUT_REFERENCE").parse()
                .map_err(|_| "Failed to parse AUDIO_INPUT_REFERENCE")?,

            // GUI进程配置
            gui_local_port: env!("GUI_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse GUI_LOCAL_PORT")?,
            gui_remote_port: env!("GUI_REMOTE_PORT").parse()
                .map_err(|_| "Failed to parse GUI_REMOTE_PORT")?,
            gui_local_ip: env!("GUI_LOCAL_IP"),
            gui_remote_ip: env!("GUI_REMOTE_IP"),
            gui_buffer_size: env!("GUI_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse GUI_BUFFER_SIZE")?,

            // 网络配置
            ws_url: env!("WS_URL"),
            ws_token: env!("WS_TOKEN"),
            protocol_version: env!("PROTOCOL_VERSION").parse()
                .map_err(|_| "Failed to parse PROTOCOL_VERSION")?,

            // 设备标识初始化为config.toml中的值
            device_id: env!("DEVICE_ID").to_string(),
            client_id: env!("CLIENT_ID").to_string(),

            // Hello消息参数
            hello_format: env!("HELLO_FORMAT"),
            hello_sample_rate: env!("HELLO_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse HELLO_SAMPLE_RATE")?,
            hello_channels: env!("HELLO_CHANNELS").parse()
                .map_err(|_| "Failed to parse HELLO_CHANNELS")?,
            hello_frame_duration: env!("HELLO_FRAME_DURATION").parse()
                .map_err(|_| "Failed to parse HELLO_FRAME_DURATION")?,

            // 节能配置
            cpu_max_freq_mhz: env!("CPU_MAX_FREQ_MHZ").parse()
                .map_err(|_| "Failed to parse CPU_MAX_FREQ_MHZ")?,
            seconds_to_sleep: env!("SECONDS_TO_SLEEP").parse()
                .map_err(|_| "Failed to parse SECONDS_TO_SLEEP")?,
            seconds_to_shutdown: env!("SECONDS_TO_SHUTDOWN").parse()
                .map_err(|_| "Failed to parse SECONDS_TO_SHUTDOWN")?,

            settings_path: env!("SETTINGS_PATH"),
            assets_dir: env!("ASSETS_DIR"),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_time_config_parses() {
        let config = Config::new().expect("config.toml values must parse");
        assert!(config.hello_sample_rate > 0);
        assert!(config.hello_frame_duration > 0);
        assert!(config.seconds_to_sleep == -1 || config.seconds_to_sleep > 0);
    }
}
