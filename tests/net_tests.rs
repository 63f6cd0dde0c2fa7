use std::sync::mpsc;
use std::time::Duration;

use stratus::net::{
    BytesReadable, KeepAlive, NoDelay, RecvBufferSize, SocketExt, TcpListener, TcpStream,
    UdpSocket,
};
use stratus::{AsHandle, ConstBuf, Dispatcher, MutBuf};

const RECV_WAIT: Duration = Duration::from_secs(10);

#[test]
fn connect_accept_round_trip() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let listener =
        TcpListener::bind(&dispatcher, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
    dispatcher.bind(listener.handle()).unwrap();
    let addr = listener.local_addr().unwrap();

    // async accept on our side, async connect from a second handle
    let (accept_tx, accept_rx) = mpsc::channel();
    listener
        .async_accept(TcpStream::prepared(&dispatcher), move |res| {
            accept_tx.send(res).unwrap();
        })
        .unwrap();

    let client = TcpStream::open(&dispatcher, &addr).unwrap();
    dispatcher.bind(client.handle()).unwrap();
    let (connect_tx, connect_rx) = mpsc::channel();
    client
        .async_connect(addr, move |res| connect_tx.send(res).unwrap())
        .unwrap();

    connect_rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    let (server, remote) = accept_rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    assert_eq!(remote.unwrap(), client.local_addr().unwrap());
    dispatcher.bind(server.handle()).unwrap();

    // one message each way through the single-shot primitives
    let (tx, rx) = mpsc::channel();
    client
        .async_write_some(ConstBuf::from("ping"), move |res| tx.send(res).unwrap())
        .unwrap();
    assert_eq!(rx.recv_timeout(RECV_WAIT).unwrap().unwrap(), 4);

    let mut buf = vec![0u8; 16];
    let (tx, rx) = mpsc::channel();
    server
        .async_read_some(MutBuf::from(&mut buf), move |res| tx.send(res).unwrap())
        .unwrap();
    let n = rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    assert_eq!(&buf[..n], b"ping");

    dispatcher.stop().unwrap();
}

#[test]
fn blocking_accept_with_prepared_peer() {
    let dispatcher = Dispatcher::new(1).unwrap();
    let listener =
        TcpListener::bind(&dispatcher, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = std::thread::spawn(move || std::net::TcpStream::connect(addr).unwrap());

    let slot = TcpStream::prepared(&dispatcher);
    assert!(!slot.is_open());
    let (server, remote) = listener.accept(slot).unwrap();
    assert!(server.is_open());
    assert!(remote.is_some());

    drop(peer.join().unwrap());
    dispatcher.stop().unwrap();
}

#[test]
fn accept_refuses_an_open_peer_slot() {
    let dispatcher = Dispatcher::new(1).unwrap();
    let listener =
        TcpListener::bind(&dispatcher, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
    dispatcher.bind(listener.handle()).unwrap();
    let addr = listener.local_addr().unwrap();

    // an already-open socket is not a valid peer slot
    let opened = TcpStream::open(&dispatcher, &addr).unwrap();
    let err = listener
        .async_accept(opened, |_res| {})
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

    dispatcher.stop().unwrap();
}

#[test]
fn socket_options_round_trip() {
    let dispatcher = Dispatcher::new(1).unwrap();
    let listener =
        TcpListener::bind(&dispatcher, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
    let addr = listener.local_addr().unwrap();

    let stream = TcpStream::open(&dispatcher, &addr).unwrap();
    stream.connect(addr).unwrap();

    stream.set_option(KeepAlive, true).unwrap();
    assert!(stream.get_option(KeepAlive).unwrap());

    stream.set_option(NoDelay, true).unwrap();
    assert!(stream.get_option(NoDelay).unwrap());

    stream.set_option(RecvBufferSize, 64 * 1024).unwrap();
    // the kernel doubles SO_RCVBUF; only assert it took effect
    assert!(stream.get_option(RecvBufferSize).unwrap() >= 64 * 1024);

    dispatcher.stop().unwrap();
}

#[test]
fn io_control_reports_readable_bytes() {
    let dispatcher = Dispatcher::new(1).unwrap();
    let listener =
        TcpListener::bind(&dispatcher, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
    let addr = listener.local_addr().unwrap();

    let client = TcpStream::open(&dispatcher, &addr).unwrap();
    client.connect(addr).unwrap();
    let (server, _) = listener.accept(TcpStream::prepared(&dispatcher)).unwrap();

    assert_eq!(client.write_some(ConstBuf::from("12345")).unwrap(), 5);
    // give loopback delivery a moment
    std::thread::sleep(Duration::from_millis(50));

    let mut readable = BytesReadable::new();
    server.io_control(&mut readable).unwrap();
    assert_eq!(readable.get(), 5);

    dispatcher.stop().unwrap();
}

#[test]
fn udp_round_trip() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let receiver = UdpSocket::bind(&dispatcher, "127.0.0.1:0".parse().unwrap()).unwrap();
    let sender = UdpSocket::bind(&dispatcher, "127.0.0.1:0".parse().unwrap()).unwrap();
    dispatcher.bind(receiver.handle()).unwrap();
    dispatcher.bind(sender.handle()).unwrap();

    let to = receiver.local_addr().unwrap();

    let mut buf = vec![0u8; 64];
    let (recv_tx, recv_rx) = mpsc::channel();
    receiver
        .async_recv_from(MutBuf::from(&mut buf), move |res| {
            recv_tx.send(res).unwrap();
        })
        .unwrap();

    let (send_tx, send_rx) = mpsc::channel();
    sender
        .async_send_to(ConstBuf::from("datagram"), to, move |res| {
            send_tx.send(res).unwrap();
        })
        .unwrap();
    assert_eq!(send_rx.recv_timeout(RECV_WAIT).unwrap().unwrap(), 8);

    let (n, from) = recv_rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    assert_eq!(&buf[..n], b"datagram");
    assert_eq!(from, sender.local_addr().unwrap());

    dispatcher.stop().unwrap();
}

#[test]
fn udp_blocking_round_trip() {
    let dispatcher = Dispatcher::new(1).unwrap();
    let receiver = UdpSocket::bind(&dispatcher, "127.0.0.1:0".parse().unwrap()).unwrap();
    let sender = UdpSocket::bind(&dispatcher, "127.0.0.1:0".parse().unwrap()).unwrap();
    let to = receiver.local_addr().unwrap();

    assert_eq!(sender.send_to(ConstBuf::from("hello"), to).unwrap(), 5);

    let mut buf = vec![0u8; 64];
    let (n, from) = receiver.recv_from(MutBuf::from(&mut buf)).unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(from, sender.local_addr().unwrap());

    dispatcher.stop().unwrap();
}

#[test]
fn watch_reports_directory_changes() {
    let dispatcher = Dispatcher::new(1).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let watch = stratus::watch::DirWatch::new(&dispatcher).unwrap();
    let wd = watch
        .watch(dir.path(), stratus::watch::mask::CREATE)
        .unwrap();

    std::fs::write(dir.path().join("fresh-file"), b"x").unwrap();

    let mut buf = vec![0u8; 1024];
    let n = watch.changes(MutBuf::from(&mut buf)).unwrap();
    assert!(n >= std::mem::size_of::<libc::inotify_event>());

    watch.unwatch(wd).unwrap();
    dispatcher.stop().unwrap();
}
