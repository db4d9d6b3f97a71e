//! Control-channel wire format.
//!
//! Every datagram is exactly [`WIRE_SIZE`] bytes in native byte order:
//!
//! ```text
//! 0   msg_id    u32
//! 4   version   u32
//! 8   client_id u32
//! 12  fd        i32   (-1 unless a descriptor rides along as SCM_RIGHTS)
//! 16  payload   [u8; 128]
//! ```

use crate::errors::IpcError;
use crate::layout::PixelFormat;
use std::os::fd::{AsRawFd, OwnedFd};

pub const PAYLOAD_LEN: usize = 128;
pub const WIRE_SIZE: usize = 16 + PAYLOAD_LEN;
pub const PROTOCOL_VERSION: u32 = 0;

const PARAMS_DATA_OFFSET: usize = 4;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Heartbeat = 0,
    Register = 1,
    Unregister = 2,
    Start = 3,
    Stop = 4,
    Params = 5,
    Status = 6,
    Buffer = 7,
    ServerHeartbeat = 8,
}

impl TryFrom<u32> for MessageId {
    type Error = IpcError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageId::Heartbeat,
            1 => MessageId::Register,
            2 => MessageId::Unregister,
            3 => MessageId::Start,
            4 => MessageId::Stop,
            5 => MessageId::Params,
            6 => MessageId::Status,
            7 => MessageId::Buffer,
            8 => MessageId::ServerHeartbeat,
            other => {
                return Err(IpcError::Protocol(format!("unknown message id {other}")));
            }
        })
    }
}

#[derive(Debug)]
pub struct WireMessage {
    pub id: MessageId,
    pub version: u32,
    pub client_id: u32,
    pub fd: Option<OwnedFd>,
    pub payload: [u8; PAYLOAD_LEN],
}

impl WireMessage {
    pub fn new(id: MessageId, client_id: u32) -> Self {
        Self {
            id,
            version: PROTOCOL_VERSION,
            client_id,
            fd: None,
            payload: [0; PAYLOAD_LEN],
        }
    }

    pub fn with_payload(id: MessageId, client_id: u32, data: &[u8]) -> Result<Self, IpcError> {
        if data.len() > PAYLOAD_LEN {
            return Err(IpcError::PayloadTooLarge(data.len()));
        }
        let mut msg = Self::new(id, client_id);
        msg.payload[..data.len()].copy_from_slice(data);
        Ok(msg)
    }

    pub fn encode(&self) -> [u8; WIRE_SIZE] {
        let mut buf = [0u8; WIRE_SIZE];
        let fd = self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1);
        buf[0..4].copy_from_slice(&(self.id as u32).to_ne_bytes());
        buf[4..8].copy_from_slice(&self.version.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.client_id.to_ne_bytes());
        buf[12..16].copy_from_slice(&fd.to_ne_bytes());
        buf[16..].copy_from_slice(&self.payload);
        buf
    }

    /// Decode a received datagram. The descriptor field on the wire is the
    /// sender's number and meaningless here; `fd` is whatever arrived as
    /// ancillary data.
    pub fn decode(buf: &[u8], fd: Option<OwnedFd>) -> Result<Self, IpcError> {
        if buf.len() != WIRE_SIZE {
            return Err(IpcError::Protocol(format!(
                "datagram of {} bytes, expected {}",
                buf.len(),
                WIRE_SIZE
            )));
        }

        let id = MessageId::try_from(read_u32(buf, 0))?;
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&buf[16..]);

        Ok(Self {
            id,
            version: read_u32(buf, 4),
            client_id: read_u32(buf, 8),
            fd,
            payload,
        })
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

/// Messages the camera server sends to its clients.
#[derive(Debug)]
pub enum ServerMessage {
    /// Confirms that the server processed the given client request
    Status { acked: MessageId },
    /// Hands over a new shared frame buffer
    Buffer { fd: OwnedFd, size: u32 },
    Heartbeat,
}

impl TryFrom<WireMessage> for ServerMessage {
    type Error = IpcError;

    fn try_from(msg: WireMessage) -> Result<Self, Self::Error> {
        match msg.id {
            MessageId::Status => {
                let acked = MessageId::try_from(u32::from(msg.payload[0]))?;
                Ok(ServerMessage::Status { acked })
            }
            MessageId::Buffer => {
                let fd = msg.fd.ok_or_else(|| {
                    IpcError::Protocol("buffer announce without a descriptor".into())
                })?;
                let size = read_u32(&msg.payload, 0);
                Ok(ServerMessage::Buffer { fd, size })
            }
            MessageId::ServerHeartbeat => Ok(ServerMessage::Heartbeat),
            other => Err(IpcError::Protocol(format!(
                "unexpected message from server: {other:?}"
            ))),
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamsId {
    Exposure = 0,
    WhiteBalance = 1,
    Format = 2,
    Snapshot = 3,
}

/// Sensor parameters carried by a `Params` request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CameraParams {
    Exposure { exposure_ms: u16, gain: f32 },
    WhiteBalance { r_gain: f32, g_gain: f32, b_gain: f32 },
    CaptureFormat(PixelFormat),
    Snapshot(bool),
}

impl CameraParams {
    fn id(&self) -> ParamsId {
        match self {
            CameraParams::Exposure { .. } => ParamsId::Exposure,
            CameraParams::WhiteBalance { .. } => ParamsId::WhiteBalance,
            CameraParams::CaptureFormat(_) => ParamsId::Format,
            CameraParams::Snapshot(_) => ParamsId::Snapshot,
        }
    }

    pub fn to_message(&self, client_id: u32) -> WireMessage {
        let mut msg = WireMessage::new(MessageId::Params, client_id);
        msg.payload[0..4].copy_from_slice(&(self.id() as u32).to_ne_bytes());

        let data = &mut msg.payload[PARAMS_DATA_OFFSET..];
        match *self {
            // u16 followed by an f32 at its natural 4-byte alignment
            CameraParams::Exposure { exposure_ms, gain } => {
                data[0..2].copy_from_slice(&exposure_ms.to_ne_bytes());
                data[4..8].copy_from_slice(&gain.to_ne_bytes());
            }
            CameraParams::WhiteBalance {
                r_gain,
                g_gain,
                b_gain,
            } => {
                data[0..4].copy_from_slice(&r_gain.to_ne_bytes());
                data[4..8].copy_from_slice(&g_gain.to_ne_bytes());
                data[8..12].copy_from_slice(&b_gain.to_ne_bytes());
            }
            CameraParams::CaptureFormat(format) => {
                data[0..4].copy_from_slice(&(format as u32).to_ne_bytes());
            }
            CameraParams::Snapshot(start) => {
                data[0] = u8::from(start);
            }
        }
        msg
    }
}
