//! Chat wire protocol
//!
//! A frame is a fixed header followed by an optional target name and at
//! most [`MSG_DATA_MAX_SIZE`](crate::constants::MSG_DATA_MAX_SIZE) payload
//! bytes. All integers travel in network byte order.

pub mod io;
pub mod message;

pub use io::{
    read_full, read_message, reliable_read, reliable_write, write_frame, write_message, FrameBuffer,
};
pub use message::{Message, MessageHeader, RawHeader, HEADER_FIXED_LEN};
