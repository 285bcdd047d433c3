//! Source-RCON client used for the game console.
//!
//! Frames are little-endian `size | id | type | body | 0x00 | 0x00`, where `size` counts every
//! byte after itself.

use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

pub const SERVERDATA_AUTH: i32 = 3;
pub const SERVERDATA_EXECCOMMAND: i32 = 2;
pub const SERVERDATA_AUTH_RESPONSE: i32 = 2;
pub const SERVERDATA_RESPONSE_VALUE: i32 = 0;

/// Largest `size` field accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 4096 + 10;
/// `id + type + two terminators`.
const MIN_FRAME_SIZE: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum RconError {
    #[error("rcon i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("rcon authentication rejected")]
    AuthRejected,
    #[error("rcon timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed rcon packet: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RconError> {
        if !self.body.is_ascii() {
            return Err(RconError::Protocol("body must be ASCII".to_string()));
        }
        let size = MIN_FRAME_SIZE + self.body.len();
        if size > MAX_FRAME_SIZE {
            return Err(RconError::Protocol(format!(
                "frame of {size} bytes exceeds {MAX_FRAME_SIZE}"
            )));
        }
        let mut buf = Vec::with_capacity(4 + size);
        buf.extend_from_slice(&(size as i32).to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(self.body.as_bytes());
        buf.extend_from_slice(&[0, 0]);
        Ok(buf)
    }

    /// Decodes the bytes following the size prefix.
    pub fn decode(frame: &[u8]) -> Result<Self, RconError> {
        if frame.len() < MIN_FRAME_SIZE {
            return Err(RconError::Protocol(format!(
                "frame of {} bytes is too short",
                frame.len()
            )));
        }
        let id = i32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let kind = i32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let body = &frame[8..frame.len() - 2];
        let body = match body.iter().position(|b| *b == 0) {
            Some(end) => &body[..end],
            None => body,
        };
        Ok(Self {
            id,
            kind,
            body: String::from_utf8_lossy(body).into_owned(),
        })
    }
}

pub(crate) async fn read_packet(stream: &mut TcpStream) -> Result<Packet, RconError> {
    let mut size = [0u8; 4];
    stream.read_exact(&mut size).await?;
    let size = i32::from_le_bytes(size);
    let size = usize::try_from(size)
        .ok()
        .filter(|s| (MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(s))
        .ok_or_else(|| RconError::Protocol(format!("invalid frame size {size}")))?;
    let mut frame = vec![0u8; size];
    stream.read_exact(&mut frame).await?;
    Packet::decode(&frame)
}

pub(crate) async fn write_packet(stream: &mut TcpStream, packet: &Packet) -> Result<(), RconError> {
    stream.write_all(&packet.encode()?).await?;
    stream.flush().await?;
    Ok(())
}

/// An authenticated RCON session.
pub struct RconClient {
    stream: TcpStream,
    next_id: i32,
}

impl RconClient {
    pub async fn connect(addr: SocketAddr, password: &str) -> Result<Self, RconError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut client = Self { stream, next_id: 1 };
        client.authenticate(password).await?;
        Ok(client)
    }

    fn next_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        id
    }

    async fn authenticate(&mut self, password: &str) -> Result<(), RconError> {
        let id = self.next_id();
        write_packet(
            &mut self.stream,
            &Packet::new(id, SERVERDATA_AUTH, password),
        )
        .await?;

        // Some servers send an empty RESPONSE_VALUE before the auth response.
        loop {
            let packet = read_packet(&mut self.stream).await?;
            if packet.kind != SERVERDATA_AUTH_RESPONSE {
                continue;
            }
            if packet.id == -1 {
                return Err(RconError::AuthRejected);
            }
            if packet.id != id {
                return Err(RconError::Protocol(format!(
                    "auth response id {} does not match request {id}",
                    packet.id
                )));
            }
            return Ok(());
        }
    }

    /// Sends one command and returns the body of its response packet.
    pub async fn exec(&mut self, command: &str) -> Result<String, RconError> {
        let id = self.next_id();
        write_packet(
            &mut self.stream,
            &Packet::new(id, SERVERDATA_EXECCOMMAND, command),
        )
        .await?;

        loop {
            let packet = read_packet(&mut self.stream).await?;
            if packet.id == id && packet.kind == SERVERDATA_RESPONSE_VALUE {
                return Ok(packet.body);
            }
            tracing::debug!(id = packet.id, kind = packet.kind, "skipping unrelated rcon packet");
        }
    }
}

/// Connect, authenticate and run `command`, all bounded by `timeout`.
pub async fn execute(
    addr: SocketAddr,
    password: &str,
    command: &str,
    timeout: Duration,
) -> Result<String, RconError> {
    tokio::time::timeout(timeout, async {
        let mut client = RconClient::connect(addr, password).await?;
        client.exec(command).await
    })
    .await
    .map_err(|_| RconError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_rcon_server;

    const PASSWORD: &str = "hunter2";

    #[test]
    fn encode_layout() {
        let bytes = Packet::new(7, SERVERDATA_EXECCOMMAND, "Info").encode().unwrap();
        assert_eq!(&bytes[0..4], &14i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &7i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2i32.to_le_bytes());
        assert_eq!(&bytes[12..16], b"Info");
        assert_eq!(&bytes[16..], &[0, 0]);
        assert_eq!(Packet::decode(&bytes[4..]).unwrap().body, "Info");
    }

    #[test]
    fn rejects_oversized_and_non_ascii_bodies() {
        assert!(Packet::new(1, SERVERDATA_EXECCOMMAND, "x".repeat(4097)).encode().is_err());
        assert!(Packet::new(1, SERVERDATA_EXECCOMMAND, "héllo").encode().is_err());
        assert!(Packet::decode(&[0u8; 4]).is_err());
    }

    #[tokio::test]
    async fn exec_round_trip() {
        let addr = fake_rcon_server(PASSWORD, true).await;
        let out = execute(addr, PASSWORD, "ShowPlayers", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "echo: ShowPlayers");
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let addr = fake_rcon_server(PASSWORD, true).await;
        let err = execute(addr, "nope", "ShowPlayers", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RconError::AuthRejected));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let addr = fake_rcon_server(PASSWORD, false).await;
        let err = execute(addr, PASSWORD, "Save", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, RconError::Timeout(_)));
    }
}
