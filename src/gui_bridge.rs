use crate::config::Config;
use crate::display::Display;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Button and control events coming from the GUI process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuiEvent {
    ToggleChat,
    StartListening,
    StopListening,
    SkipSentence,
    SetVolume(i32),
    SetAlarm { seconds: i64, name: String },
    CancelAlarm(String),
}

#[derive(Deserialize)]
struct GuiMessage {
    #[serde(rename = "type")]
    msg_type: String,
    action: Option<String>,
    value: Option<i64>,
    seconds: Option<i64>,
    name: Option<String>,
}

pub fn parse_gui_event(text: &str) -> Option<GuiEvent> {
    let msg: GuiMessage = serde_json::from_str(text).ok()?;
    match (msg.msg_type.as_str(), msg.action.as_deref()) {
        ("button", Some("toggle")) => Some(GuiEvent::ToggleChat),
        ("button", Some("press")) => Some(GuiEvent::StartListening),
        ("button", Some("release")) => Some(GuiEvent::StopListening),
        ("button", Some("skip")) => Some(GuiEvent::SkipSentence),
        // 音量范围 0-100
        ("volume", _) => msg.value.map(|v| GuiEvent::SetVolume(v.clamp(0, 100) as i32)),
        ("alarm", Some("set")) => Some(GuiEvent::SetAlarm {
            seconds: msg.seconds?,
            name: msg.name?,
        }),
        ("alarm", Some("cancel")) => msg.name.map(GuiEvent::CancelAlarm),
        _ => None,
    }
}

// GUI进程和Core进程通过本地UDP通信，端口在配置中指定
pub struct GuiBridge {
    socket: Arc<UdpSocket>,
    target_addr: String,
    buffer_size: usize,
    tx: mpsc::Sender<GuiEvent>,
}

impl GuiBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<GuiEvent>) -> anyhow::Result<Self> {
        // 绑定本地UDP端口
        let socket =
            UdpSocket::bind(format!("{}:{}", config.gui_local_ip, config.gui_local_port)).await?;
        let target_addr = format!("{}:{}", config.gui_remote_ip, config.gui_remote_port);

        Ok(Self {
            socket: Arc::new(socket),
            target_addr,
            buffer_size: config.gui_buffer_size,
            tx,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, _) = self.socket.recv_from(&mut buf).await?;
            let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                continue;
            };
            match parse_gui_event(text) {
                Some(event) => {
                    if self.tx.send(event).await.is_err() {
                        log::warn!("GUI event receiver dropped");
                        break;
                    }
                }
                None => log::debug!("Ignoring GUI message: {}", text),
            }
        }
        Ok(())
    }

    pub async fn send_message(&self, msg: &str) -> anyhow::Result<()> {
        self.socket.send_to(msg.as_bytes(), &self.target_addr).await?;
        Ok(())
    }

    /// Forward everything a [`GuiDisplay`] produces until all senders drop.
    pub async fn forward(&self, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = self.send_message(&msg).await {
                log::warn!("Failed to send to GUI: {}", e);
            }
        }
    }
}

/// [`Display`] that renders by sending JSON to the GUI process. Callable
/// from any thread; the bridge task does the socket work.
pub struct GuiDisplay {
    tx: mpsc::UnboundedSender<String>,
}

impl GuiDisplay {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Device state code, as the GUI expects it.
    pub fn set_state(&self, code: u8) {
        self.send(json!({ "state": code }));
    }

    fn send(&self, value: serde_json::Value) {
        if self.tx.send(value.to_string()).is_err() {
            log::debug!("GUI bridge is gone, dropping display update");
        }
    }
}

impl Display for GuiDisplay {
    fn set_status(&self, status: &str) {
        self.send(json!({ "type": "status", "text": status }));
    }

    fn show_notification(&self, message: &str, duration: Duration) {
        self.send(json!({
            "type": "toast",
            "text": message,
            "duration_ms": duration.as_millis() as u64,
        }));
    }

    fn set_chat_message(&self, role: &str, content: &str) {
        self.send(json!({ "type": "chat", "role": role, "content": content }));
    }

    fn set_emotion(&self, emotion: &str) {
        self.send(json!({ "type": "emotion", "emotion": emotion }));
    }

    fn set_brightness(&self, brightness: u8) {
        self.send(json!({ "type": "brightness", "value": brightness }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn button_events_parse() {
        assert_eq!(
            parse_gui_event(r#"{"type":"button","action":"toggle"}"#),
            Some(GuiEvent::ToggleChat)
        );
        assert_eq!(
            parse_gui_event(r#"{"type":"button","action":"press"}"#),
            Some(GuiEvent::StartListening)
        );
        assert_eq!(
            parse_gui_event(r#"{"type":"volume","value":40}"#),
            Some(GuiEvent::SetVolume(40))
        );
        assert_eq!(
            parse_gui_event(r#"{"type":"alarm","action":"set","seconds":600,"name":"tea"}"#),
            Some(GuiEvent::SetAlarm {
                seconds: 600,
                name: "tea".into()
            })
        );
        assert_eq!(
            parse_gui_event(r#"{"type":"alarm","action":"cancel","name":"tea"}"#),
            Some(GuiEvent::CancelAlarm("tea".into()))
        );
        assert_eq!(parse_gui_event(r#"{"type":"alarm","action":"set","name":"x"}"#), None);
        assert_eq!(parse_gui_event(r#"{"type":"button"}"#), None);
        assert_eq!(parse_gui_event("not json"), None);
    }

    #[test]
    fn skip_button_parses() {
        assert_eq!(
            parse_gui_event(r#"{"type":"button","action":"skip"}"#),
            Some(GuiEvent::SkipSentence)
        );
    }

    #[test]
    fn out_of_range_volume_is_clamped() {
        assert_eq!(
            parse_gui_event(r#"{"type":"volume","value":4294967336}"#),
            Some(GuiEvent::SetVolume(100))
        );
        assert_eq!(
            parse_gui_event(r#"{"type":"volume","value":-5}"#),
            Some(GuiEvent::SetVolume(0))
        );
        assert_eq!(
            parse_gui_event(r#"{"type":"volume","value":100}"#),
            Some(GuiEvent::SetVolume(100))
        );
    }

    #[test]
    fn display_calls_become_json_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let display = GuiDisplay::new(tx);
        display.set_status("聆听中...");
        display.show_notification("闹钟", Duration::from_secs(3));
        display.set_state(5);

        let status: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(status["type"], "status");
        assert_eq!(status["text"], "聆听中...");

        let toast: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(toast["duration_ms"], 3000);

        let state: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(state["state"], 5);
    }

    #[tokio::test]
    async fn bridge_forwards_display_updates_over_udp() {
        let gui = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let core = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = gui.local_addr().unwrap().to_string();
        let (event_tx, _event_rx) = mpsc::channel(4);
        let bridge = GuiBridge {
            socket: Arc::new(core),
            target_addr: target,
            buffer_size: 1024,
            tx: event_tx,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        GuiDisplay::new(tx).set_emotion("happy");
        bridge.forward(rx).await;

        let mut buf = [0u8; 256];
        let (len, _) = gui.recv_from(&mut buf).await.unwrap();
        let msg: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(msg["emotion"], "happy");
    }
}
