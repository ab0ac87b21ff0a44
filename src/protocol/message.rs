use chrono::{DateTime, TimeZone, Utc};

use crate::constants::{MAX_TARGET_LEN, MSG_DATA_MAX_SIZE};
use crate::error::{ChatError, Result};

/// Bytes of the fixed header part: msg_len (4), time_stamp (8), target_len (2)
pub const HEADER_FIXED_LEN: usize = 4 + 8 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    /// Payload length in bytes, always equal to the payload actually carried
    pub msg_len: u32,
    /// Sender's clock, milliseconds since the Unix epoch
    pub time_stamp: u64,
    /// Recipient display name; `None` broadcasts
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: MessageHeader,
    payload: Vec<u8>,
}

impl Message {
    /// A broadcast message stamped with the current time
    pub fn new(payload: impl Into<Vec<u8>>) -> Result<Self> {
        Self::build(None, payload.into(), now_millis())
    }

    /// A message routed only to the peer named `target`
    pub fn direct(target: impl Into<String>, payload: impl Into<Vec<u8>>) -> Result<Self> {
        let target = target.into();
        let target = if target.is_empty() { None } else { Some(target) };
        Self::build(target, payload.into(), now_millis())
    }

    /// Assemble a message from decoded wire parts
    pub fn from_parts(target: Option<String>, payload: Vec<u8>, time_stamp: u64) -> Result<Self> {
        let target = target.filter(|t| !t.is_empty());
        Self::build(target, payload, time_stamp)
    }

    fn build(target: Option<String>, payload: Vec<u8>, time_stamp: u64) -> Result<Self> {
        if payload.len() > MSG_DATA_MAX_SIZE {
            return Err(ChatError::MessageTooLarge(payload.len()));
        }
        if let Some(ref t) = target {
            if t.len() > MAX_TARGET_LEN {
                return Err(ChatError::TargetTooLong(t.len()));
            }
        }

        Ok(Self {
            header: MessageHeader {
                msg_len: payload.len() as u32,
                time_stamp,
                target,
            },
            payload,
        })
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn target(&self) -> Option<&str> {
        self.header.target.as_deref()
    }

    pub fn is_broadcast(&self) -> bool {
        self.header.target.is_none()
    }

    /// Sender timestamp as a UTC date, if it is representable
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        let millis = i64::try_from(self.header.time_stamp).ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// Length of the encoded frame
    pub fn wire_len(&self) -> usize {
        HEADER_FIXED_LEN + self.target().map_or(0, str::len) + self.payload.len()
    }

    /// Encode header and payload in network byte order:
    /// `msg_len u32 | time_stamp u64 | target_len u16 | target | payload`
    pub fn encode(&self) -> Vec<u8> {
        let target = self.target().unwrap_or("").as_bytes();
        let mut frame = Vec::with_capacity(self.wire_len());
        frame.extend_from_slice(&self.header.msg_len.to_be_bytes());
        frame.extend_from_slice(&self.header.time_stamp.to_be_bytes());
        frame.extend_from_slice(&(target.len() as u16).to_be_bytes());
        frame.extend_from_slice(target);
        frame.extend_from_slice(&self.payload);
        frame
    }
}

/// Fixed header fields as read off the wire, before bounds checking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub msg_len: u32,
    pub time_stamp: u64,
    pub target_len: u16,
}

impl RawHeader {
    pub fn decode(bytes: &[u8; HEADER_FIXED_LEN]) -> Self {
        let mut msg_len = [0u8; 4];
        let mut time_stamp = [0u8; 8];
        let mut target_len = [0u8; 2];
        msg_len.copy_from_slice(&bytes[0..4]);
        time_stamp.copy_from_slice(&bytes[4..12]);
        target_len.copy_from_slice(&bytes[12..14]);

        Self {
            msg_len: u32::from_be_bytes(msg_len),
            time_stamp: u64::from_be_bytes(time_stamp),
            target_len: u16::from_be_bytes(target_len),
        }
    }

    /// Length of the whole frame this header announces
    pub fn frame_len(&self) -> usize {
        HEADER_FIXED_LEN + self.target_len as usize + self.msg_len as usize
    }

    /// Reject lengths a peer could use to force oversized reads.
    pub fn validate(&self) -> Result<()> {
        if self.msg_len as usize > MSG_DATA_MAX_SIZE {
            return Err(ChatError::MessageTooLarge(self.msg_len as usize));
        }
        if self.target_len as usize > MAX_TARGET_LEN {
            return Err(ChatError::TargetTooLong(self.target_len as usize));
        }
        Ok(())
    }
}

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("Hello").unwrap();
        assert_eq!(msg.header().msg_len, 5);
        assert_eq!(msg.payload(), b"Hello");
        assert!(msg.is_broadcast());
        assert!(msg.sent_at().is_some());
    }

    #[test]
    fn test_direct_message_with_empty_target_broadcasts() {
        let msg = Message::direct("", "hi").unwrap();
        assert!(msg.is_broadcast());

        let msg = Message::direct("10.0.0.1:4000", "hi").unwrap();
        assert_eq!(msg.target(), Some("10.0.0.1:4000"));
    }

    #[test]
    fn test_payload_bound() {
        assert!(Message::new(vec![0u8; MSG_DATA_MAX_SIZE]).is_ok());
        match Message::new(vec![0u8; MSG_DATA_MAX_SIZE + 1]) {
            Err(ChatError::MessageTooLarge(n)) => assert_eq!(n, MSG_DATA_MAX_SIZE + 1),
            other => panic!("expected MessageTooLarge, got {:?}", other),
        }
        assert!(Message::direct("x".repeat(MAX_TARGET_LEN + 1), "hi").is_err());
    }

    #[test]
    fn test_encoded_header_layout() {
        let msg = Message::from_parts(Some("bob".to_string()), b"moo".to_vec(), 10).unwrap();
        let frame = msg.encode();
        assert_eq!(frame.len(), msg.wire_len());

        let mut fixed = [0u8; HEADER_FIXED_LEN];
        fixed.copy_from_slice(&frame[..HEADER_FIXED_LEN]);
        let raw = RawHeader::decode(&fixed);
        assert_eq!(raw.msg_len, 3);
        assert_eq!(raw.time_stamp, 10);
        assert_eq!(raw.target_len, 3);
        assert_eq!(&frame[HEADER_FIXED_LEN..HEADER_FIXED_LEN + 3], b"bob");
        assert_eq!(&frame[HEADER_FIXED_LEN + 3..], b"moo");
    }

    #[test]
    fn test_raw_header_validation() {
        let ok = RawHeader {
            msg_len: 400,
            time_stamp: 0,
            target_len: 255,
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.frame_len(), HEADER_FIXED_LEN + 255 + 400);

        let huge = RawHeader {
            msg_len: u32::MAX,
            time_stamp: 0,
            target_len: 0,
        };
        assert!(matches!(huge.validate(), Err(ChatError::MessageTooLarge(_))));

        let long_target = RawHeader {
            msg_len: 1,
            time_stamp: 0,
            target_len: 256,
        };
        assert!(matches!(long_target.validate(), Err(ChatError::TargetTooLong(256))));
    }
}
