//! The framed packet protocol spoken over side-channel sockets.
//!
//! Packets are JSON objects carrying a `command` field, framed with a
//! 4-byte big-endian length prefix. File content travels as base64 in
//! `chunk` fields, terminated by an explicit `chunk: null`.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::{Map, Value, json};
use tokio_util::codec::{Decoder, Encoder};

use crate::ChannelError;

/// Frames larger than this are a protocol violation, not a big file: file
/// content is chunked well below it.
pub const MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

/// Source bytes per file chunk before base64 expansion.
pub const FILE_CHUNK_SIZE: usize = 100 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Inbound packet commands the monitor understands, plus a fallback so
/// unknown commands can be logged rather than dropped on the floor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    AgentStart,
    AgentStop,
    IsSystemRunningResponse,
    GatherFactsResponse,
    GetFileResponse,
    WatchFileResponse,
    ExecuteResponse,
    ChmodResponse,
    ChownResponse,
    Ping,
    Pong,
    Unknown(String),
}

impl AgentCommand {
    fn parse(command: &str) -> Self {
        match command {
            "agent-start" => Self::AgentStart,
            "agent-stop" => Self::AgentStop,
            "is-system-running-response" => Self::IsSystemRunningResponse,
            "gather-facts-response" => Self::GatherFactsResponse,
            "get-file-response" => Self::GetFileResponse,
            "watch-file-response" => Self::WatchFileResponse,
            "execute-response" => Self::ExecuteResponse,
            "chmod-response" => Self::ChmodResponse,
            "chown-response" => Self::ChownResponse,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet(Map<String, Value>);

impl Packet {
    pub fn new(command: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("command".to_owned(), json!(command));
        Self(fields)
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.to_owned(), value);
        self
    }

    pub fn from_value(value: Value) -> Result<Self, ChannelError> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(ChannelError::BadPacket(format!(
                "packet is not an object: {other}"
            ))),
        }
    }

    pub fn command(&self) -> AgentCommand {
        AgentCommand::parse(
            self.0
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        )
    }

    pub fn command_name(&self) -> &str {
        self.0
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        self.0.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    fn encode_bytes(&self) -> Result<Vec<u8>, ChannelError> {
        serde_json::to_vec(&Value::Object(self.0.clone()))
            .map_err(|err| ChannelError::BadPacket(err.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct PacketCodec;

impl Encoder<Packet> for PacketCodec {
    type Error = ChannelError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = packet.encode_bytes()?;
        if body.len() > MAX_PACKET_SIZE {
            return Err(ChannelError::BadPacket(format!(
                "outbound packet of {} bytes exceeds limit",
                body.len()
            )));
        }
        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > MAX_PACKET_SIZE {
            return Err(ChannelError::BadPacket(format!(
                "inbound frame of {length} bytes exceeds limit"
            )));
        }

        if src.len() < LENGTH_PREFIX_SIZE + length {
            src.reserve(LENGTH_PREFIX_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(length);
        let value: Value = serde_json::from_slice(&body)
            .map_err(|err| ChannelError::BadPacket(err.to_string()))?;
        Packet::from_value(value).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: Packet) -> BytesMut {
        let mut buffer = BytesMut::new();
        PacketCodec
            .encode(packet, &mut buffer)
            .expect("encode");
        buffer
    }

    #[test]
    fn packets_round_trip_through_the_codec() {
        let mut buffer = encode(
            Packet::new("chmod")
                .with("path", json!("/tmp/target"))
                .with("mode", json!(0o755)),
        );

        let decoded = PacketCodec
            .decode(&mut buffer)
            .expect("decode")
            .expect("complete frame");
        assert_eq!(decoded.command(), AgentCommand::Unknown("chmod".to_owned()));
        assert_eq!(decoded.get_str("path"), Some("/tmp/target"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn split_frames_reassemble() {
        let full = encode(Packet::new("ping"));
        let mut first_half = BytesMut::from(&full[..3]);

        let mut codec = PacketCodec;
        assert!(codec.decode(&mut first_half).expect("decode").is_none());

        first_half.extend_from_slice(&full[3..]);
        let decoded = codec
            .decode(&mut first_half)
            .expect("decode")
            .expect("complete frame");
        assert_eq!(decoded.command(), AgentCommand::Ping);
    }

    #[test]
    fn two_frames_in_one_read_both_decode() {
        let mut buffer = encode(Packet::new("agent-start").with("system_boot_time", json!(100)));
        buffer.extend_from_slice(&encode(Packet::new("pong")));

        let mut codec = PacketCodec;
        let first = codec.decode(&mut buffer).expect("decode").expect("frame");
        assert_eq!(first.command(), AgentCommand::AgentStart);
        assert_eq!(first.get_f64("system_boot_time"), 100.0);

        let second = codec.decode(&mut buffer).expect("decode").expect("frame");
        assert_eq!(second.command(), AgentCommand::Pong);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buffer = BytesMut::new();
        buffer.put_u32((MAX_PACKET_SIZE + 1) as u32);
        buffer.put_slice(b"garbage");

        assert!(matches!(
            PacketCodec.decode(&mut buffer),
            Err(ChannelError::BadPacket(_))
        ));
    }

    #[test]
    fn non_object_packets_are_rejected() {
        let body = b"[1, 2, 3]";
        let mut buffer = BytesMut::new();
        buffer.put_u32(body.len() as u32);
        buffer.put_slice(body);

        assert!(matches!(
            PacketCodec.decode(&mut buffer),
            Err(ChannelError::BadPacket(_))
        ));
    }
}
