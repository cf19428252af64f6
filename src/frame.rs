//! Frame codec.
//!
//! One frame is one unit of protocol traffic: a fixed 15-byte header
//! followed by three variable-length fields. All integers are little-endian.
//!
//! ```text
//! offset  size  field
//! 0       1     kind         (1=Request, 2=Response, 3=Oneway, 4=PubMessage)
//! 1       4     status       (i32; 0 for non-response kinds)
//! 5       4     msgid        (u32; 0 for oneway and pub-messages)
//! 9       1     method_len   (u8)
//! 10      1     topic_len    (u8)
//! 11      4     payload_len  (u32)
//! 15      ...   method bytes, then topic bytes, then payload bytes
//! ```
//!
//! Stream transports prefix each encoded frame with a 4-byte little-endian
//! length counting everything after the prefix; on UDP the datagram boundary
//! delimits the frame and no prefix is used. The inproc transport passes
//! `Frame` values without encoding them at all.

use crate::error::{RpcError, Status};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 15;

/// Upper bound on the method and topic fields, whose lengths travel as one
/// byte each.
pub const MAX_SHORT_FIELD: usize = 255;

/// Discriminates the four kinds of protocol traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A call expecting exactly one response.
    Request = 1,
    /// The response correlated to a request by msgid.
    Response = 2,
    /// A fire-and-forget call; no response, msgid is zero.
    Oneway = 3,
    /// A broadcast publication, filtered by topic on the subscriber side.
    PubMessage = 4,
}

impl FrameKind {
    fn from_wire(byte: u8) -> Option<FrameKind> {
        match byte {
            1 => Some(FrameKind::Request),
            2 => Some(FrameKind::Response),
            3 => Some(FrameKind::Oneway),
            4 => Some(FrameKind::PubMessage),
            _ => None,
        }
    }
}

/// One decoded unit of protocol traffic.
///
/// Fields that do not apply to a given kind are empty (`method` on
/// responses, `topic` on everything but publications, and so on); the codec
/// encodes them with length zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Wire status code; see [`Status`]. Zero for non-response kinds.
    pub status: i32,
    /// Correlation id. Zero is reserved for oneway and pub-message frames.
    pub msgid: u32,
    pub method: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(msgid: u32, method: &str, payload: Vec<u8>) -> Frame {
        Frame {
            kind: FrameKind::Request,
            status: 0,
            msgid,
            method: method.to_string(),
            topic: String::new(),
            payload,
        }
    }

    pub fn response(msgid: u32, status: Status, payload: Vec<u8>) -> Frame {
        Frame {
            kind: FrameKind::Response,
            status: status.as_wire(),
            msgid,
            method: String::new(),
            topic: String::new(),
            payload,
        }
    }

    pub fn oneway(method: &str, payload: Vec<u8>) -> Frame {
        Frame {
            kind: FrameKind::Oneway,
            status: 0,
            msgid: 0,
            method: method.to_string(),
            topic: String::new(),
            payload,
        }
    }

    pub fn publication(topic: &str, payload: Vec<u8>) -> Frame {
        Frame {
            kind: FrameKind::PubMessage,
            status: 0,
            msgid: 0,
            method: String::new(),
            topic: topic.to_string(),
            payload,
        }
    }

    /// Serialized size of this frame, header included.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.method.len() + self.topic.len() + self.payload.len()
    }

    /// Encode into the on-wire layout. Deterministic: succeeds whenever the
    /// length constraints hold, and equal frames encode to equal bytes.
    pub fn encode(&self, max_payload: usize) -> Result<Vec<u8>, RpcError> {
        if self.method.len() > MAX_SHORT_FIELD {
            return Err(RpcError::InvalidArgument(format!(
                "method of {} bytes exceeds the {MAX_SHORT_FIELD}-byte limit",
                self.method.len()
            )));
        }
        if self.topic.len() > MAX_SHORT_FIELD {
            return Err(RpcError::InvalidArgument(format!(
                "topic of {} bytes exceeds the {MAX_SHORT_FIELD}-byte limit",
                self.topic.len()
            )));
        }
        if self.payload.len() > max_payload {
            return Err(RpcError::InvalidArgument(format!(
                "payload of {} bytes exceeds the {max_payload}-byte limit",
                self.payload.len()
            )));
        }

        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(&self.status.to_le_bytes());
        bytes.extend_from_slice(&self.msgid.to_le_bytes());
        bytes.push(self.method.len() as u8);
        bytes.push(self.topic.len() as u8);
        bytes.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(self.method.as_bytes());
        bytes.extend_from_slice(self.topic.as_bytes());
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Decode one complete frame. The input must contain exactly one frame:
    /// truncated, over-long, or impossible-kind input is rejected with
    /// [`RpcError::Protocol`].
    pub fn decode(bytes: &[u8], max_payload: usize) -> Result<Frame, RpcError> {
        if bytes.len() < HEADER_LEN {
            return Err(RpcError::Protocol(format!(
                "truncated header: {} of {HEADER_LEN} bytes",
                bytes.len()
            )));
        }

        let kind = FrameKind::from_wire(bytes[0])
            .ok_or_else(|| RpcError::Protocol(format!("impossible frame kind {}", bytes[0])))?;
        let status = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let msgid = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let method_len = bytes[9] as usize;
        let topic_len = bytes[10] as usize;
        let payload_len = u32::from_le_bytes([bytes[11], bytes[12], bytes[13], bytes[14]]) as usize;

        if payload_len > max_payload {
            return Err(RpcError::Protocol(format!(
                "payload of {payload_len} bytes exceeds the {max_payload}-byte limit"
            )));
        }
        let expected = HEADER_LEN + method_len + topic_len + payload_len;
        if bytes.len() != expected {
            return Err(RpcError::Protocol(format!(
                "frame of {} bytes, header describes {expected}",
                bytes.len()
            )));
        }

        let method_end = HEADER_LEN + method_len;
        let topic_end = method_end + topic_len;
        let method = std::str::from_utf8(&bytes[HEADER_LEN..method_end])
            .map_err(|_| RpcError::Protocol("method is not valid UTF-8".to_string()))?
            .to_string();
        let topic = std::str::from_utf8(&bytes[method_end..topic_end])
            .map_err(|_| RpcError::Protocol("topic is not valid UTF-8".to_string()))?
            .to_string();
        let payload = bytes[topic_end..].to_vec();

        Ok(Frame {
            kind,
            status,
            msgid,
            method,
            topic,
            payload,
        })
    }
}
