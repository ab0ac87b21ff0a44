// Integration tests for readiness multiplexing over pipes

use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use rusty_chat::mplex::{drain_wakeups, Channel, FdInfo, IoMultiplexor, MplexFlags, Multiplexor};
use rusty_chat::ChatError;

#[test]
fn test_readable_after_write() {
    let channel = Channel::new().unwrap();
    let mut mplex = Multiplexor::new(4).unwrap();
    mplex.add(FdInfo::readable(channel.read_fd())).unwrap();

    assert_eq!(channel.write(b"abc").unwrap(), 3);

    let mut events = Vec::new();
    let ready = mplex.wait(Some(Duration::from_secs(3)), &mut events).unwrap();
    assert_eq!(ready, 1);
    assert_eq!(mplex.ready_count(), 1);
    assert_eq!(events[0].fd, channel.read_fd());
    assert!(events[0].is_readable());

    assert_eq!(drain_wakeups(channel.read_end()), 3);
}

#[test]
fn test_timeout_without_data() {
    let channel = Channel::new().unwrap();
    let mut mplex = Multiplexor::new(4).unwrap();
    mplex.add(FdInfo::readable(channel.read_fd())).unwrap();

    let mut events = Vec::new();
    let started = Instant::now();
    let ready = mplex.wait(Some(Duration::from_secs(3)), &mut events).unwrap();
    assert_eq!(ready, 0);
    assert!(events.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[test]
fn test_oneshot_fires_once_until_rearmed() {
    let channel = Channel::new().unwrap();
    let mut mplex = Multiplexor::new(4).unwrap();
    let info = FdInfo::readable(channel.read_fd()).with_flags(MplexFlags::ONESHOT);
    mplex.add(info).unwrap();

    let mut events = Vec::new();
    channel.notify().unwrap();
    assert_eq!(mplex.wait(Some(Duration::from_secs(3)), &mut events).unwrap(), 1);
    drain_wakeups(channel.read_end());

    channel.notify().unwrap();
    assert_eq!(mplex.wait(Some(Duration::from_millis(200)), &mut events).unwrap(), 0);

    mplex.modify(info).unwrap();
    assert_eq!(mplex.wait(Some(Duration::from_secs(3)), &mut events).unwrap(), 1);
}

#[test]
fn test_write_end_is_writable() {
    let channel = Channel::new().unwrap();
    let mut mplex = Multiplexor::new(4).unwrap();
    mplex.add(FdInfo::writable(channel.write_fd())).unwrap();

    let mut events = Vec::new();
    assert_eq!(mplex.wait(Some(Duration::ZERO), &mut events).unwrap(), 1);
    assert!(events[0].is_writable());
    assert!(!events[0].is_readable());
}

#[test]
fn test_remove_unregistered_descriptor() {
    let channel = Channel::new().unwrap();
    let other = Channel::new().unwrap();
    let mut mplex = Multiplexor::new(4).unwrap();
    mplex.add(FdInfo::readable(channel.read_fd())).unwrap();

    channel.notify().unwrap();
    let mut events = Vec::new();
    assert_eq!(mplex.wait(Some(Duration::from_secs(3)), &mut events).unwrap(), 1);

    assert!(matches!(
        mplex.remove(other.read_fd()),
        Err(ChatError::NotRegistered(fd)) if fd == other.read_fd()
    ));
    assert_eq!(mplex.ready_count(), 1);

    mplex.remove(channel.read_fd()).unwrap();
    assert!(mplex.remove(channel.read_fd()).is_err());
    assert_eq!(mplex.wait(Some(Duration::from_millis(100)), &mut events).unwrap(), 0);
}

#[test]
fn test_add_all_and_remove_all() {
    let first = Channel::new().unwrap();
    let second = Channel::new().unwrap();
    let mut mplex = Multiplexor::new(4).unwrap();
    mplex
        .add_all(&[FdInfo::readable(first.read_fd()), FdInfo::readable(second.read_fd())])
        .unwrap();

    first.notify().unwrap();
    second.notify().unwrap();

    let mut events = Vec::new();
    assert_eq!(mplex.wait(Some(Duration::from_secs(3)), &mut events).unwrap(), 2);
    let mut fds: Vec<_> = events.iter().map(|e| e.fd).collect();
    fds.sort();
    let mut expected = vec![first.read_fd(), second.read_fd()];
    expected.sort();
    assert_eq!(fds, expected);

    mplex.remove_all(&[first.read_fd(), second.read_fd()]).unwrap();
    assert_eq!(mplex.wait(Some(Duration::from_millis(100)), &mut events).unwrap(), 0);
}

#[test]
fn test_peer_hangup_reports_eof() {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let mut mplex = Multiplexor::new(4).unwrap();
    mplex.add(FdInfo::readable(ours.as_raw_fd())).unwrap();

    drop(theirs);

    let mut events = Vec::new();
    assert_eq!(mplex.wait(Some(Duration::from_secs(3)), &mut events).unwrap(), 1);
    assert_eq!(events[0].fd, ours.as_raw_fd());
    assert!(events[0].is_closed());
}
