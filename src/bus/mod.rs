//! Multiplexed request/response messaging over a framed byte transport.
//!
//! Messages carry a number, a set of string properties, and a body. They
//! are chunked into frames; frames from distinct messages may interleave,
//! with each message's frames in order. Both sides may send requests at
//! any time. Flow control is credit-based: a sender stops emitting frames
//! once too many bytes are unacknowledged.

mod codec;
mod connection;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use codec::{Frame, FrameCodec, MAX_FRAME_PAYLOAD};
pub use connection::{Connection, ConnectionOptions, IncomingRequest};

/// Subprotocol identifier exchanged during the handshake.
pub const SUBPROTOCOL: &str = "BLIP_3+CBMobile_4";

/// Default per-direction credit window in bytes.
pub const DEFAULT_CREDIT: u64 = 128 * 1024;

/// Property naming a request's purpose.
pub const PROFILE_PROPERTY: &str = "Profile";

/// Frame-flag bits. The low three bits carry the message type.
pub mod flags {
    pub const TYPE_MASK: u8 = 0x07;
    pub const MORE_COMING: u8 = 0x08;
    pub const URGENT: u8 = 0x10;
    pub const NO_REPLY: u8 = 0x20;
    pub const COMPRESSED: u8 = 0x40;
}

/// Kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Error = 2,
    AckRequest = 4,
    AckResponse = 5,
}

impl MessageType {
    pub fn from_bits(bits: u8) -> Result<MessageType> {
        Ok(match bits & flags::TYPE_MASK {
            0 => MessageType::Request,
            1 => MessageType::Response,
            2 => MessageType::Error,
            4 => MessageType::AckRequest,
            5 => MessageType::AckResponse,
            other => {
                return Err(Error::corrupt(format!("unknown message type {other}")));
            }
        })
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, MessageType::AckRequest | MessageType::AckResponse)
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error)
    }
}

/// A complete message (request, reply, or error).
#[derive(Debug, Clone)]
pub struct Message {
    pub number: u64,
    pub msg_type: MessageType,
    /// Urgent / no-reply / compressed bits.
    pub flags: u8,
    pub properties: Vec<(String, String)>,
    pub body: Bytes,
}

impl Message {
    /// A new request with the given profile.
    pub fn request(profile: &str) -> Message {
        Message {
            number: 0,
            msg_type: MessageType::Request,
            flags: 0,
            properties: vec![(PROFILE_PROPERTY.into(), profile.into())],
            body: Bytes::new(),
        }
    }

    /// A successful reply to `request`.
    pub fn response_to(request: &Message) -> Message {
        Message {
            number: request.number,
            msg_type: MessageType::Response,
            flags: 0,
            properties: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// An error reply carrying the external error identity.
    pub fn error_response(request: &Message, domain: &str, code: i32, message: &str) -> Message {
        Message {
            number: request.number,
            msg_type: MessageType::Error,
            flags: 0,
            properties: vec![
                ("Error-Domain".into(), domain.into()),
                ("Error-Code".into(), code.to_string()),
            ],
            body: Bytes::copy_from_slice(message.as_bytes()),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl ToString) -> Message {
        self.properties.push((name.into(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Message {
        self.body = body.into();
        self
    }

    pub fn no_reply(mut self) -> Message {
        self.flags |= flags::NO_REPLY;
        self
    }

    pub fn urgent(mut self) -> Message {
        self.flags |= flags::URGENT;
        self
    }

    pub fn is_no_reply(&self) -> bool {
        self.flags & flags::NO_REPLY != 0
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn profile(&self) -> Option<&str> {
        self.property(PROFILE_PROPERTY)
    }

    /// If this is an error reply, its `(domain, code, message)`.
    pub fn error(&self) -> Option<(String, i32, String)> {
        if self.msg_type != MessageType::Error {
            return None;
        }
        Some((
            self.property("Error-Domain").unwrap_or("Db").to_string(),
            self.property("Error-Code")
                .and_then(|c| c.parse().ok())
                .unwrap_or(-1),
            String::from_utf8_lossy(&self.body).into_owned(),
        ))
    }

    /// Serialize properties + body into the frame payload stream.
    pub(crate) fn encode_payload(&self) -> Result<Bytes> {
        let mut out = postcard::to_allocvec(&self.properties)?;
        out.extend_from_slice(&self.body);
        Ok(out.into())
    }

    /// Reassemble from a complete payload.
    pub(crate) fn decode_payload(
        number: u64,
        msg_type: MessageType,
        msg_flags: u8,
        payload: &[u8],
    ) -> Result<Message> {
        let (properties, rest): (Vec<(String, String)>, &[u8]) =
            postcard::take_from_bytes(payload)?;
        Ok(Message {
            number,
            msg_type,
            flags: msg_flags & !flags::TYPE_MASK & !flags::MORE_COMING,
            properties,
            body: Bytes::copy_from_slice(rest),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let msg = Message::request("changes")
            .with_property("since", 42)
            .with_body(&b"[1,2,3]"[..]);
        let payload = msg.encode_payload().unwrap();
        let decoded =
            Message::decode_payload(7, MessageType::Request, flags::URGENT, &payload).unwrap();
        assert_eq!(decoded.number, 7);
        assert_eq!(decoded.profile(), Some("changes"));
        assert_eq!(decoded.property("since"), Some("42"));
        assert_eq!(&decoded.body[..], b"[1,2,3]");
        assert_eq!(decoded.flags & flags::URGENT, flags::URGENT);
    }

    #[test]
    fn error_identity_round_trip() {
        let req = Message {
            number: 3,
            ..Message::request("rev")
        };
        let err = Message::error_response(&req, "Network", 503, "try later");
        let (domain, code, text) = err.error().unwrap();
        assert_eq!(domain, "Network");
        assert_eq!(code, 503);
        assert_eq!(text, "try later");
        assert!(Message::response_to(&req).error().is_none());
    }

    #[test]
    fn type_bits_round_trip() {
        for t in [
            MessageType::Request,
            MessageType::Response,
            MessageType::Error,
            MessageType::AckRequest,
            MessageType::AckResponse,
        ] {
            assert_eq!(MessageType::from_bits(t as u8).unwrap(), t);
        }
        assert!(MessageType::from_bits(3).is_err());
    }
}
