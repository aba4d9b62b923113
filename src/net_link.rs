//! WebSocket session transport.
//!
//! The audio channel is one WebSocket connection: opened on demand with the
//! device headers and a hello exchange, closed when the conversation ends.
//! Opus packets travel as binary messages (wrapped in `BinaryProtocol3`
//! frames for protocol version 3), control messages as JSON text.

use crate::config::Config;
use crate::protocol::{
    AbortReason, AudioPacket, AudioPayload, BINARY_TYPE_AUDIO, ListeningMode, Protocol,
    ProtocolListener, ServerMessage, abort_speaking_json, allocate_binary_protocol3,
    parse_binary_protocol3_stream, start_listening_json, stop_listening_json,
    wake_word_detected_json,
};
use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SERVER_SAMPLE_RATE: u32 = 24000;
const DEFAULT_SERVER_FRAME_DURATION: u32 = 60;

// 音频参数结构体
#[derive(Serialize)]
struct AudioParams {
    format: String,
    sample_rate: u32,
    channels: u8,
    frame_duration: u32,
}

// Hello Message，用于初始化连接
#[derive(Serialize)]
struct HelloMessage {
    #[serde(rename = "type")]
    msg_type: String,
    version: u8,
    transport: String,
    audio_params: AudioParams,
}

#[derive(Default)]
struct Link {
    tx: Option<mpsc::UnboundedSender<Message>>,
    session_id: String,
}

pub struct WebsocketProtocol {
    config: Config,
    runtime: Handle,
    listener: RwLock<Option<Weak<dyn ProtocolListener>>>,
    link: Mutex<Link>,
    // Bumped on every open so tasks of an old connection cannot close the new one.
    generation: AtomicU64,
    opened: AtomicBool,
    server_sample_rate: AtomicU32,
    server_frame_duration: AtomicU32,
    weak_self: Weak<WebsocketProtocol>,
}

impl WebsocketProtocol {
    pub fn new(config: Config, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            runtime,
            listener: RwLock::new(None),
            link: Mutex::new(Link::default()),
            generation: AtomicU64::new(0),
            opened: AtomicBool::new(false),
            server_sample_rate: AtomicU32::new(DEFAULT_SERVER_SAMPLE_RATE),
            server_frame_duration: AtomicU32::new(DEFAULT_SERVER_FRAME_DURATION),
            weak_self: weak.clone(),
        })
    }

    pub fn set_listener(&self, listener: Weak<dyn ProtocolListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn session_id(&self) -> String {
        self.link.lock().session_id.clone()
    }

    fn listener(&self) -> Option<Arc<dyn ProtocolListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    fn request(&self) -> Result<tokio_tungstenite::tungstenite::http::Request<()>> {
        // 根据配置构建WebSocket请求
        let url = Url::parse(self.config.ws_url).context("Invalid WebSocket url")?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => bail!("WebSocket url {} has no host", self.config.ws_url),
        };

        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(self.config.ws_url)
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Authorization", format!("Bearer {}", self.config.ws_token))
            .header("Device-Id", &self.config.device_id)
            .header("Client-Id", &self.config.client_id)
            .header("Protocol-Version", self.config.protocol_version.to_string())
            .body(())?;
        Ok(request)
    }

    fn hello_message(&self) -> HelloMessage {
        HelloMessage {
            msg_type: "hello".to_string(),
            version: self.config.protocol_version,
            transport: "websocket".to_string(),
            audio_params: AudioParams {
                format: self.config.hello_format.to_string(),
                sample_rate: self.config.hello_sample_rate,
                channels: self.config.hello_channels,
                frame_duration: self.config.hello_frame_duration,
            },
        }
    }

    /// Connect, send our hello and wait for the server's.
    async fn handshake(
        &self,
    ) -> Result<(SplitSink<WsStream, Message>, SplitStream<WsStream>, ServerMessage)> {
        let request = self.request()?;
        log::info!("Connecting to {}", self.config.ws_url);
        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("Failed to connect to {}", self.config.ws_url))?;
        let (mut write, mut read) = ws_stream.split();

        let hello = serde_json::to_string(&self.hello_message())?;
        log::debug!("Sending hello: {}", hello);
        write.send(Message::Text(hello.into())).await?;

        while let Some(msg) = read.next().await {
            match msg? {
                Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) if msg.msg_type == "hello" => return Ok((write, read, msg)),
                    _ => log::warn!("Unexpected message before server hello: {}", text.as_str()),
                },
                Message::Close(frame) => bail!("Server closed during handshake: {:?}", frame),
                _ => {}
            }
        }
        bail!("Connection closed before server hello")
    }

    fn apply_server_hello(&self, hello: &ServerMessage) {
        if let Some(session_id) = &hello.session_id {
            self.link.lock().session_id = session_id.clone();
        }
        if let Some(params) = &hello.audio_params {
            if let Some(rate) = params.sample_rate {
                self.server_sample_rate.store(rate, Ordering::SeqCst);
            }
            if let Some(duration) = params.frame_duration {
                self.server_frame_duration.store(duration, Ordering::SeqCst);
            }
        }
        log::info!(
            "Server hello: session {:?}, {}Hz, {}ms",
            hello.session_id,
            self.server_sample_rate(),
            self.server_frame_duration()
        );
    }

    async fn write_loop(
        weak: Weak<Self>,
        mut write: SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        generation: u64,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                if let Some(this) = weak.upgrade() {
                    this.channel_lost(generation, Some(e.to_string()));
                }
                return;
            }
        }
        // Every sender dropped: the channel was closed locally.
        if let Err(e) = write.close().await {
            log::debug!("WebSocket close: {}", e);
        }
    }

    async fn read_loop(weak: Weak<Self>, mut read: SplitStream<WsStream>, generation: u64) {
        let mut error = None;
        while let Some(msg) = read.next().await {
            let Some(this) = weak.upgrade() else {
                return;
            };
            match msg {
                Ok(Message::Text(text)) => this.handle_text(&text),
                Ok(Message::Binary(data)) => this.handle_binary(&data),
                Ok(Message::Close(frame)) => {
                    log::info!("Server closed connection: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }
        if let Some(this) = weak.upgrade() {
            this.channel_lost(generation, error);
        }
    }

    fn handle_text(&self, text: &str) {
        let msg = match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Invalid server message ({}): {}", e, text);
                return;
            }
        };
        log::debug!("Received text: {}", text);
        if let Some(session_id) = &msg.session_id {
            let mut link = self.link.lock();
            if link.session_id != *session_id {
                log::info!("New session id: {}", session_id);
                link.session_id = session_id.clone();
            }
        }
        if msg.msg_type == "hello" {
            return;
        }
        if let Some(listener) = self.listener() {
            listener.on_incoming_json(msg);
        }
    }

    fn handle_binary(&self, data: &[u8]) {
        let packets = decode_incoming(
            self.config.protocol_version,
            data,
            self.server_sample_rate(),
            self.server_frame_duration(),
        );
        if let Some(listener) = self.listener() {
            for packet in packets {
                listener.on_incoming_audio(packet);
            }
        }
    }

    fn channel_lost(&self, generation: u64, error: Option<String>) {
        if generation != self.generation.load(Ordering::SeqCst) {
            return;
        }
        if !self.opened.swap(false, Ordering::SeqCst) {
            return;
        }
        self.link.lock().tx = None;
        let listener = self.listener();
        if let Some(error) = error {
            log::warn!("WebSocket error: {}", error);
            if let Some(listener) = &listener {
                listener.on_network_error(&error);
            }
        }
        log::info!("Audio channel closed by peer");
        if let Some(listener) = &listener {
            listener.on_audio_channel_closed();
        }
    }

    /// Drop the current connection. Returns whether one was open.
    fn shutdown_link(&self) -> bool {
        let was_open = self.opened.swap(false, Ordering::SeqCst);
        // Dropping the sender ends the write task, which sends the close frame.
        self.link.lock().tx = None;
        was_open
    }

    fn send_message(&self, msg: Message) -> bool {
        let link = self.link.lock();
        match &link.tx {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    fn send_text(&self, text: String) -> bool {
        log::debug!("Sending text: {}", text);
        self.send_message(Message::Text(text.into()))
    }
}

/// Split an inbound binary message into Opus packets.
fn decode_incoming(
    protocol_version: u8,
    data: &[u8],
    sample_rate: u32,
    frame_duration: u32,
) -> Vec<AudioPacket> {
    if protocol_version != 3 {
        return vec![AudioPacket::opus(data.to_vec(), sample_rate, frame_duration, 0)];
    }
    parse_binary_protocol3_stream(data)
        .filter(|frame| frame.packet_type == BINARY_TYPE_AUDIO)
        .map(|frame| AudioPacket::opus(frame.payload.to_vec(), sample_rate, frame_duration, 0))
        .collect()
}

/// Binary message for an outbound packet. Only Opus data goes on the wire.
fn encode_outgoing(protocol_version: u8, packet: AudioPacket) -> Option<Message> {
    let AudioPayload::Opus(data) = packet.payload else {
        return None;
    };
    if protocol_version != 3 {
        return Some(Message::Binary(Bytes::from(data)));
    }
    match allocate_binary_protocol3(BINARY_TYPE_AUDIO, &data) {
        Ok(frame) => Some(Message::Binary(frame)),
        Err(e) => {
            log::warn!("Dropping outgoing packet: {}", e);
            None
        }
    }
}

impl Protocol for WebsocketProtocol {
    fn start(&self) -> Result<()> {
        Url::parse(self.config.ws_url)
            .with_context(|| format!("Invalid WebSocket url {}", self.config.ws_url))?;
        log::info!("WebSocket protocol ready, server {}", self.config.ws_url);
        Ok(())
    }

    /// Must be called from outside the runtime; it blocks on the handshake.
    fn open_audio_channel(&self) -> Result<()> {
        self.shutdown_link();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (write, read, hello) = self
            .runtime
            .block_on(async { tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake()).await })
            .map_err(|_| anyhow!("Timed out waiting for server hello"))??;
        self.apply_server_hello(&hello);

        let (tx, rx) = mpsc::unbounded_channel();
        self.link.lock().tx = Some(tx);
        self.opened.store(true, Ordering::SeqCst);
        self.runtime
            .spawn(Self::write_loop(self.weak_self.clone(), write, rx, generation));

        log::info!("Audio channel opened");
        if let Some(listener) = self.listener() {
            listener.on_audio_channel_opened();
        }
        self.runtime
            .spawn(Self::read_loop(self.weak_self.clone(), read, generation));
        Ok(())
    }

    fn close_audio_channel(&self) {
        if self.shutdown_link() {
            log::info!("Audio channel closed");
            if let Some(listener) = self.listener() {
                listener.on_audio_channel_closed();
            }
        }
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    fn send_audio(&self, packet: AudioPacket) -> bool {
        if !self.is_audio_channel_opened() {
            return false;
        }
        match encode_outgoing(self.config.protocol_version, packet) {
            Some(msg) => self.send_message(msg),
            None => false,
        }
    }

    fn send_start_listening(&self, mode: ListeningMode) {
        let json = start_listening_json(&self.session_id(), mode);
        self.send_text(json);
    }

    fn send_stop_listening(&self) {
        let json = stop_listening_json(&self.session_id());
        self.send_text(json);
    }

    fn send_abort_speaking(&self, reason: AbortReason) {
        let json = abort_speaking_json(&self.session_id(), reason);
        self.send_text(json);
    }

    fn send_wake_word_detected(&self, wake_word: &str) {
        let json = wake_word_detected_json(&self.session_id(), wake_word);
        self.send_text(json);
    }

    fn server_sample_rate(&self) -> u32 {
        self.server_sample_rate.load(Ordering::SeqCst)
    }

    fn server_frame_duration(&self) -> u32 {
        self.server_frame_duration.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AudioPacketKind, parse_binary_protocol3};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        audio: Mutex<Vec<AudioPacket>>,
    }

    impl ProtocolListener for Recorder {
        fn on_incoming_audio(&self, packet: AudioPacket) {
            self.audio.lock().push(packet);
        }
        fn on_incoming_json(&self, message: ServerMessage) {
            self.events.lock().push(format!("json:{}", message.msg_type));
        }
        fn on_audio_channel_opened(&self) {
            self.events.lock().push("opened".into());
        }
        fn on_audio_channel_closed(&self) {
            self.events.lock().push("closed".into());
        }
        fn on_network_error(&self, message: &str) {
            self.events.lock().push(format!("error:{}", message));
        }
    }

    #[test]
    fn v3_binary_splits_into_audio_frames() {
        let mut data = Vec::new();
        data.extend_from_slice(&allocate_binary_protocol3(BINARY_TYPE_AUDIO, &[1, 2]).unwrap());
        data.extend_from_slice(&allocate_binary_protocol3(7, &[9]).unwrap());
        data.extend_from_slice(&allocate_binary_protocol3(BINARY_TYPE_AUDIO, &[3]).unwrap());

        let packets = decode_incoming(3, &data, 24000, 60);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].payload, AudioPayload::Opus(vec![1, 2]));
        assert_eq!(packets[1].payload, AudioPayload::Opus(vec![3]));
        assert_eq!(packets[1].sample_rate, 24000);
        assert_eq!(packets[1].kind, AudioPacketKind::Data);

        let raw = decode_incoming(1, &data, 16000, 20);
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].payload, AudioPayload::Opus(data.clone()));
    }

    #[test]
    fn only_opus_packets_are_sent() {
        let packet = AudioPacket::opus(vec![5; 10], 16000, 60, 0);
        let Some(Message::Binary(frame)) = encode_outgoing(3, packet) else {
            panic!("expected a binary message");
        };
        let (parsed, consumed) = parse_binary_protocol3(&frame).unwrap();
        assert_eq!(consumed, 14);
        assert_eq!(parsed.payload, &[5; 10]);

        assert!(encode_outgoing(3, AudioPacket::marker(AudioPacketKind::Stop, None)).is_none());
    }

    #[test]
    fn hello_carries_configured_audio_params() {
        let config = Config::new().unwrap();
        let protocol = WebsocketProtocol::new(
            config.clone(),
            tokio::runtime::Runtime::new().unwrap().handle().clone(),
        );
        let hello: serde_json::Value =
            serde_json::to_value(protocol.hello_message()).unwrap();
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["transport"], "websocket");
        assert_eq!(hello["version"], config.protocol_version);
        assert_eq!(hello["audio_params"]["sample_rate"], config.hello_sample_rate);

        let request = protocol.request().unwrap();
        assert_eq!(
            request.headers()["Authorization"],
            format!("Bearer {}", config.ws_token).as_str()
        );
        assert!(request.headers().contains_key("Device-Id"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn audio_channel_round_trip_against_local_server() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, _) = server.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let hello = ws.next().await.unwrap().unwrap();
            let hello: serde_json::Value = serde_json::from_str(hello.to_text().unwrap()).unwrap();
            assert_eq!(hello["type"], "hello");

            let reply = r#"{"type":"hello","transport":"websocket","session_id":"s1","audio_params":{"sample_rate":16000,"frame_duration":60}}"#;
            ws.send(Message::Text(reply.into())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"tts","state":"start"}"#.into()))
                .await
                .unwrap();
            let frame = allocate_binary_protocol3(BINARY_TYPE_AUDIO, &[7, 7, 7]).unwrap();
            ws.send(Message::Binary(frame)).await.unwrap();

            // Start listening, then one audio frame from the device.
            let listen = ws.next().await.unwrap().unwrap();
            let listen: serde_json::Value =
                serde_json::from_str(listen.to_text().unwrap()).unwrap();
            assert_eq!(listen["session_id"], "s1");
            assert_eq!(listen["mode"], "auto");
            let audio = ws.next().await.unwrap().unwrap().into_data();
            assert_eq!(&audio[..4], &[0, 0, 0, 2]);

            ws.close(None).await.unwrap();
        });

        let mut config = Config::new().unwrap();
        config.ws_url = Box::leak(format!("ws://{}/", addr).into_boxed_str());
        config.protocol_version = 3;
        let protocol = WebsocketProtocol::new(config, Handle::current());
        let recorder = Arc::new(Recorder::default());
        let listener: Weak<dyn ProtocolListener> =
            Arc::downgrade(&recorder) as Weak<dyn ProtocolListener>;
        protocol.set_listener(listener);

        let p = protocol.clone();
        tokio::task::spawn_blocking(move || p.open_audio_channel())
            .await
            .unwrap()
            .unwrap();
        assert!(protocol.is_audio_channel_opened());
        assert_eq!(protocol.session_id(), "s1");
        assert_eq!(protocol.server_sample_rate(), 16000);

        protocol.send_start_listening(ListeningMode::AutoStop);
        assert!(protocol.send_audio(AudioPacket::opus(vec![1, 2], 16000, 60, 0)));

        server_task.await.unwrap();
        for _ in 0..100 {
            if !protocol.is_audio_channel_opened() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!protocol.is_audio_channel_opened());

        let events = recorder.events.lock().clone();
        assert_eq!(events, vec!["opened", "json:tts", "closed"]);
        let audio = recorder.audio.lock();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].payload, AudioPayload::Opus(vec![7, 7, 7]));
        assert!(!protocol.send_audio(AudioPacket::opus(vec![1], 16000, 60, 0)));
    }
}
