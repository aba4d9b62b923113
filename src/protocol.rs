//! Session protocol types shared by the application and the transports.
//!
//! Audio travels as [`AudioPacket`]s. On the wire each Opus packet is wrapped
//! in a [`BinaryProtocol3`] frame: `type:u8, reserved:u8, payload_size:u16`
//! followed by the payload, no padding, `payload_size` in network byte order.
//! Framed sound assets use the same layout back to back.

use anyhow::{Result, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const BINARY_PROTOCOL3_HEADER_SIZE: usize = 4;
pub const BINARY_TYPE_AUDIO: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioPacketKind {
    Start,
    Stop,
    Data,
    SentenceStart,
    SentenceEnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPayload {
    Opus(Vec<u8>),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub kind: AudioPacketKind,
    /// Caption for `SentenceStart`.
    pub text: Option<String>,
    pub payload: AudioPayload,
    pub sample_rate: u32,
    pub frame_duration: u32,
    pub timestamp: u32,
}

impl AudioPacket {
    pub fn opus(data: Vec<u8>, sample_rate: u32, frame_duration: u32, timestamp: u32) -> Self {
        Self {
            kind: AudioPacketKind::Data,
            text: None,
            payload: AudioPayload::Opus(data),
            sample_rate,
            frame_duration,
            timestamp,
        }
    }

    pub fn marker(kind: AudioPacketKind, text: Option<String>) -> Self {
        Self {
            kind,
            text,
            payload: AudioPayload::Empty,
            sample_rate: 0,
            frame_duration: 0,
            timestamp: 0,
        }
    }
}

/// One decoded v3 frame borrowing its payload from the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryProtocol3<'a> {
    pub packet_type: u8,
    pub reserved: u8,
    pub payload: &'a [u8],
}

/// Header plus payload in one buffer.
pub fn allocate_binary_protocol3(packet_type: u8, payload: &[u8]) -> Result<Bytes> {
    ensure!(
        payload.len() <= u16::MAX as usize,
        "payload of {} bytes does not fit a v3 frame",
        payload.len()
    );
    let mut buf = BytesMut::with_capacity(BINARY_PROTOCOL3_HEADER_SIZE + payload.len());
    buf.put_u8(packet_type);
    buf.put_u8(0);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Parse a single frame. Returns `None` when `data` is shorter than the
/// header or the payload it announces.
pub fn parse_binary_protocol3(data: &[u8]) -> Option<(BinaryProtocol3<'_>, usize)> {
    if data.len() < BINARY_PROTOCOL3_HEADER_SIZE {
        return None;
    }
    let mut header = &data[..BINARY_PROTOCOL3_HEADER_SIZE];
    let packet_type = header.get_u8();
    let reserved = header.get_u8();
    let payload_size = header.get_u16() as usize;
    let end = BINARY_PROTOCOL3_HEADER_SIZE + payload_size;
    if data.len() < end {
        return None;
    }
    Some((
        BinaryProtocol3 {
            packet_type,
            reserved,
            payload: &data[BINARY_PROTOCOL3_HEADER_SIZE..end],
        },
        end,
    ))
}

/// Iterate back to back frames, stopping at the first truncated one.
pub fn parse_binary_protocol3_stream(data: &[u8]) -> BinaryProtocol3Frames<'_> {
    BinaryProtocol3Frames { remaining: data }
}

pub struct BinaryProtocol3Frames<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for BinaryProtocol3Frames<'a> {
    type Item = BinaryProtocol3<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (frame, consumed) = parse_binary_protocol3(self.remaining)?;
        self.remaining = &self.remaining[consumed..];
        Some(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListeningMode {
    AutoStop,
    ManualStop,
    Realtime,
}

impl ListeningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListeningMode::AutoStop => "auto",
            ListeningMode::ManualStop => "manual",
            ListeningMode::Realtime => "realtime",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    None,
    WakeWordDetected,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ServerAudioParams {
    pub sample_rate: Option<u32>,
    pub frame_duration: Option<u32>,
}

/// Inbound JSON control message. Unknown fields are ignored.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub command: Option<String>,
    pub text: Option<String>,
    pub state: Option<String>,
    pub emotion: Option<String>,
    pub session_id: Option<String>,
    pub audio_params: Option<ServerAudioParams>,
}

#[derive(Serialize, Debug)]
struct ListenMessage<'a> {
    session_id: &'a str,
    #[serde(rename = "type")]
    msg_type: &'static str,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Serialize, Debug)]
struct AbortMessage<'a> {
    session_id: &'a str,
    #[serde(rename = "type")]
    msg_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

pub fn start_listening_json(session_id: &str, mode: ListeningMode) -> String {
    to_json(&ListenMessage {
        session_id,
        msg_type: "listen",
        state: "start",
        mode: Some(mode.as_str()),
        text: None,
    })
}

pub fn stop_listening_json(session_id: &str) -> String {
    to_json(&ListenMessage {
        session_id,
        msg_type: "listen",
        state: "stop",
        mode: None,
        text: None,
    })
}

pub fn wake_word_detected_json(session_id: &str, wake_word: &str) -> String {
    to_json(&ListenMessage {
        session_id,
        msg_type: "listen",
        state: "detect",
        mode: None,
        text: Some(wake_word),
    })
}

pub fn abort_speaking_json(session_id: &str, reason: AbortReason) -> String {
    to_json(&AbortMessage {
        session_id,
        msg_type: "abort",
        reason: match reason {
            AbortReason::None => None,
            AbortReason::WakeWordDetected => Some("wake_word_detected"),
        },
    })
}

fn to_json<T: Serialize>(value: &T) -> String {
    // Plain structs of strings cannot fail to serialize.
    serde_json::to_string(value).unwrap_or_default()
}

/// Session transport as seen by the application. Calls come from the main
/// loop thread; implementations hand work to their own runtime.
pub trait Protocol: Send + Sync {
    fn start(&self) -> Result<()>;
    /// Blocks until the server answered the hello or the attempt failed.
    fn open_audio_channel(&self) -> Result<()>;
    fn close_audio_channel(&self);
    fn is_audio_channel_opened(&self) -> bool;
    /// Returns `false` when the packet could not be queued for sending.
    fn send_audio(&self, packet: AudioPacket) -> bool;
    fn send_start_listening(&self, mode: ListeningMode);
    fn send_stop_listening(&self);
    fn send_abort_speaking(&self, reason: AbortReason);
    fn send_wake_word_detected(&self, wake_word: &str);
    fn server_sample_rate(&self) -> u32;
    fn server_frame_duration(&self) -> u32;
}

/// Callbacks from a [`Protocol`] into the application. Invoked from the
/// transport's tasks, so implementations must only schedule work.
pub trait ProtocolListener: Send + Sync {
    fn on_incoming_audio(&self, packet: AudioPacket);
    fn on_incoming_json(&self, message: ServerMessage);
    fn on_audio_channel_opened(&self);
    fn on_audio_channel_closed(&self);
    fn on_network_error(&self, message: &str);
}
