// Integration tests for the wire protocol over real sockets

use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::thread;

use rusty_chat::constants::MSG_DATA_MAX_SIZE;
use rusty_chat::net::{bind_listener, connect_socket};
use rusty_chat::protocol::{read_message, write_message, Message, HEADER_FIXED_LEN};
use rusty_chat::ChatError;

#[test]
fn test_round_trip_over_unix_socket() {
    let (mut writer, mut reader) = UnixStream::pair().unwrap();

    for len in [0, 1, 17, MSG_DATA_MAX_SIZE] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let sent = Message::new(payload.clone()).unwrap();
        write_message(&mut writer, &sent).unwrap();

        let received = read_message(&mut reader).unwrap().expect("message expected");
        assert_eq!(received.header().msg_len as usize, len);
        assert_eq!(received.payload(), payload.as_slice());
        assert_eq!(received, sent);
    }
}

#[test]
fn test_direct_message_over_tcp() {
    let listener = bind_listener("127.0.0.1", 0, 20).unwrap();
    listener.set_nonblocking(false).unwrap();
    let port = listener.local_addr().unwrap().port();

    let sender = thread::spawn(move || {
        let mut stream = connect_socket("127.0.0.1", port).unwrap();
        let msg = Message::direct("127.0.0.1:5555", "psst").unwrap();
        write_message(&mut stream, &msg).unwrap();
        msg
    });

    let (mut stream, _) = listener.accept().unwrap();
    let received = read_message(&mut stream).unwrap().unwrap();
    let sent = sender.join().unwrap();

    assert_eq!(received, sent);
    assert_eq!(received.target(), Some("127.0.0.1:5555"));
    assert!(!received.is_broadcast());
    // Peer has closed: clean end-of-stream
    assert!(read_message(&mut stream).unwrap().is_none());
}

#[test]
fn test_oversized_length_rejected_before_payload() {
    let (mut writer, mut reader) = UnixStream::pair().unwrap();

    let mut header = Vec::with_capacity(HEADER_FIXED_LEN);
    header.extend_from_slice(&((MSG_DATA_MAX_SIZE as u32) + 1).to_be_bytes());
    header.extend_from_slice(&0u64.to_be_bytes());
    header.extend_from_slice(&0u16.to_be_bytes());
    writer.write_all(&header).unwrap();

    // No payload follows; the header alone must be enough to reject it
    match read_message(&mut reader) {
        Err(ChatError::MessageTooLarge(len)) => assert_eq!(len, MSG_DATA_MAX_SIZE + 1),
        other => panic!("expected MessageTooLarge, got {:?}", other),
    }
}

#[test]
fn test_short_header_is_framing_error() {
    let (mut writer, mut reader) = UnixStream::pair().unwrap();
    writer.write_all(&[0, 0, 0]).unwrap();
    writer.shutdown(Shutdown::Write).unwrap();

    assert!(matches!(read_message(&mut reader), Err(ChatError::Framing(_))));
}

#[test]
fn test_truncated_payload_is_framing_error() {
    let (mut writer, mut reader) = UnixStream::pair().unwrap();
    let frame = Message::new("truncated").unwrap().encode();
    writer.write_all(&frame[..frame.len() - 3]).unwrap();
    drop(writer);

    assert!(matches!(read_message(&mut reader), Err(ChatError::Framing(_))));
}

#[test]
fn test_clean_end_of_stream() {
    let (writer, mut reader) = UnixStream::pair().unwrap();
    drop(writer);
    assert!(read_message(&mut reader).unwrap().is_none());
}
