//! Socket setup shared by the server and its clients

use log::{debug, info};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;

use crate::error::{ChatError, Result};

/// Parse a numeric host and a port into a socket address.
///
/// Host names are not looked up; only literal IPv4/IPv6 addresses are
/// accepted.
pub fn numeric_address(address: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = address.parse().map_err(|_| {
        ChatError::Bind(format!("'{}' is not a numeric IPv4/IPv6 address", address))
    })?;
    Ok(SocketAddr::new(ip, port))
}

/// Bind a non-blocking stream socket to `address:port` and mark it for
/// listening with the given backlog.
pub fn bind_listener(address: &str, port: u16, backlog: i32) -> Result<TcpListener> {
    let addr = numeric_address(address, port)?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ChatError::Bind(format!("socket: {}", e)))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ChatError::Bind(format!("SO_REUSEADDR: {}", e)))?;
    socket
        .set_cloexec(true)
        .map_err(|e| ChatError::Bind(format!("FD_CLOEXEC: {}", e)))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ChatError::Bind(format!("O_NONBLOCK: {}", e)))?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|e| ChatError::Bind(format!("unable to bind {}: {}", addr, e)))?;
    socket
        .listen(backlog)
        .map_err(|e| ChatError::Listen(format!("{}: {}", addr, e)))?;

    let listener: TcpListener = socket.into();
    info!("Listening on {} (backlog {})", listener.local_addr()?, backlog);
    Ok(listener)
}

/// Open a blocking connection to `address:port`.
pub fn connect_socket(address: &str, port: u16) -> Result<TcpStream> {
    let addr = numeric_address(address, port)?;
    let stream = TcpStream::connect(addr).map_err(|e| {
        ChatError::Io(io::Error::new(
            e.kind(),
            format!("unable to connect to {}: {}", addr, e),
        ))
    })?;
    debug!("Connected to {}", addr);
    Ok(stream)
}

/// Numeric `host:service` name of the connected peer.
pub fn resolve_peer_name(stream: &TcpStream) -> Result<String> {
    let addr = stream
        .peer_addr()
        .map_err(|e| ChatError::Resolve(format!("peer address unavailable: {}", e)))?;
    Ok(format_peer(&addr))
}

/// Read whatever is already queued on `stream` without blocking.
///
/// The socket itself stays in blocking mode, so a duplicated write handle
/// keeps its send timeout. Nothing queued yields `WouldBlock`; `Ok(0)` is
/// end-of-stream.
pub fn recv_available(stream: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe {
            libc::recv(
                stream.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// `a.b.c.d:port` for IPv4 and `addr:port` (no brackets) for IPv6, the
/// same text numeric name-info lookups produce for host and service.
pub fn format_peer(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_address_only() {
        assert!(numeric_address("127.0.0.1", 80).is_ok());
        assert!(numeric_address("::1", 80).is_ok());
        assert!(matches!(
            numeric_address("localhost", 80),
            Err(ChatError::Bind(_))
        ));
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = bind_listener("127.0.0.1", 0, 20).expect("Failed to bind");
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let stream = connect_socket("127.0.0.1", addr.port()).expect("Failed to connect");
        let name = resolve_peer_name(&stream).unwrap();
        assert_eq!(name, format!("127.0.0.1:{}", addr.port()));
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let first = bind_listener("127.0.0.1", 0, 20).expect("Failed to bind");
        let port = first.local_addr().unwrap().port();
        // SO_REUSEADDR does not allow two listeners on one port
        assert!(bind_listener("127.0.0.1", port, 20).is_err());
    }

    #[test]
    fn test_recv_available_never_blocks() {
        use std::io::Write;

        let listener = bind_listener("127.0.0.1", 0, 20).expect("Failed to bind");
        let port = listener.local_addr().unwrap().port();
        let mut client = connect_socket("127.0.0.1", port).unwrap();
        listener.set_nonblocking(false).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(false).unwrap();

        let mut buf = [0u8; 16];
        let err = recv_available(&server_side, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        client.write_all(b"hi").unwrap();
        drop(client);
        server_side
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        // Wait for the bytes to land, then drain them without blocking
        let mut peek = [0u8; 2];
        server_side.peek(&mut peek).unwrap();
        assert_eq!(recv_available(&server_side, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
    }
}
