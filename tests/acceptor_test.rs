// Integration tests for the connection acceptor over loopback TCP

use socket2::SockRef;
use std::net::TcpStream;
use std::sync::mpsc;
use std::time::Duration;

use rusty_chat::core::{Acceptor, AcceptorState};
use rusty_chat::net::{bind_listener, connect_socket};

#[test]
fn test_connections_reach_handler() {
    let listener = bind_listener("127.0.0.1", 0, 20).unwrap();
    let (tx, rx) = mpsc::channel();
    let mut acceptor = Acceptor::new(listener, move |stream: TcpStream, peer: String| {
        let _ = tx.send((stream, peer));
    })
    .unwrap();
    let port = acceptor.local_addr().unwrap().port();

    acceptor.start().unwrap();

    let clients: Vec<TcpStream> = (0..3)
        .map(|_| connect_socket("127.0.0.1", port).unwrap())
        .collect();

    for _ in &clients {
        let (stream, peer) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(peer.starts_with("127.0.0.1:"));
        // Accepted sockets are handed over in blocking mode
        assert!(!SockRef::from(&stream).nonblocking().unwrap());
    }

    acceptor.stop().unwrap();
    assert_eq!(acceptor.state(), AcceptorState::Idle);
}

#[test]
fn test_peer_names_match_clients() {
    let listener = bind_listener("127.0.0.1", 0, 20).unwrap();
    let (tx, rx) = mpsc::channel();
    let mut acceptor = Acceptor::new(listener, move |_stream: TcpStream, peer: String| {
        let _ = tx.send(peer);
    })
    .unwrap();
    let port = acceptor.local_addr().unwrap().port();
    acceptor.start().unwrap();

    let client = connect_socket("127.0.0.1", port).unwrap();
    let peer = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(peer, format!("127.0.0.1:{}", client.local_addr().unwrap().port()));
}

#[test]
fn test_restart_after_stop() {
    let listener = bind_listener("127.0.0.1", 0, 20).unwrap();
    let (tx, rx) = mpsc::channel();
    let mut acceptor = Acceptor::new(listener, move |_stream: TcpStream, peer: String| {
        let _ = tx.send(peer);
    })
    .unwrap();
    let port = acceptor.local_addr().unwrap().port();

    for _ in 0..3 {
        acceptor.start().unwrap();
        assert_eq!(acceptor.state(), AcceptorState::Running);

        let _client = connect_socket("127.0.0.1", port).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());

        acceptor.stop().unwrap();
        assert_eq!(acceptor.state(), AcceptorState::Idle);
        assert!(matches!(acceptor.last_result(), Some(Ok(()))));
    }
}
