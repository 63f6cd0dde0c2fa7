use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use stratus::net::{TcpListener, TcpStream};
use stratus::transfer::{self, transfer_all, transfer_at_least, CompletionCondition};
use stratus::{AsHandle, ConstBuf, Dispatcher, MutBuf};

const RECV_WAIT: Duration = Duration::from_secs(10);

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Accept one connection from `peer` and hand it back bound.
fn accept_one(dispatcher: &Dispatcher, listener: &TcpListener) -> TcpStream {
    let (tx, rx) = mpsc::channel();
    listener
        .async_accept(TcpStream::prepared(dispatcher), move |res| {
            tx.send(res.map(|(stream, _)| stream)).unwrap();
        })
        .unwrap();
    let stream = rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    dispatcher.bind(stream.handle()).unwrap();
    stream
}

fn listener_on(dispatcher: &Dispatcher) -> (TcpListener, std::net::SocketAddr) {
    let listener =
        TcpListener::bind(dispatcher, "127.0.0.1:0".parse().unwrap(), 16).unwrap();
    dispatcher.bind(listener.handle()).unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[test]
fn transfer_all_collects_segmented_stream() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let (listener, addr) = listener_on(&dispatcher);
    let data = payload(200);

    let sent = data.clone();
    let peer = std::thread::spawn(move || {
        let mut socket = std::net::TcpStream::connect(addr).unwrap();
        // three segments: 90 / 90 / 20
        for range in [0..90, 90..180, 180..200] {
            socket.write_all(&sent[range]).unwrap();
            socket.flush().unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        socket
    });

    let stream = accept_one(&dispatcher, &listener);

    let mut received = vec![0u8; 200];
    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    let (tx, rx) = mpsc::channel();
    transfer::async_read(
        &stream,
        MutBuf::from(&mut received),
        transfer_all(),
        move |res| {
            handler_calls.fetch_add(1, Ordering::SeqCst);
            tx.send(res).unwrap();
        },
    )
    .unwrap();

    let n = rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    assert_eq!(n, 200);
    assert_eq!(received, data);

    // exactly-once delivery
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(peer.join().unwrap());
    dispatcher.stop().unwrap();
}

#[test]
fn transfer_at_least_returns_early() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let (listener, addr) = listener_on(&dispatcher);

    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    let peer = std::thread::spawn(move || {
        let mut socket = std::net::TcpStream::connect(addr).unwrap();
        socket.write_all(&[7u8; 10]).unwrap();
        socket.flush().unwrap();
        // stall: keep the connection open until told otherwise
        let _ = hold_rx.recv_timeout(RECV_WAIT);
    });

    let stream = accept_one(&dispatcher, &listener);

    let mut received = vec![0u8; 1024];
    let (tx, rx) = mpsc::channel();
    transfer::async_read(
        &stream,
        MutBuf::from(&mut received),
        transfer_at_least(1),
        move |res| tx.send(res).unwrap(),
    )
    .unwrap();

    let n = rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    assert_eq!(n, 10, "must not wait for the buffer to fill");
    assert!(stream.is_open());

    hold_tx.send(()).unwrap();
    peer.join().unwrap();
    dispatcher.stop().unwrap();
}

#[test]
fn zero_byte_read_closes_the_handle() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let (listener, addr) = listener_on(&dispatcher);

    let peer = std::thread::spawn(move || {
        let mut socket = std::net::TcpStream::connect(addr).unwrap();
        socket.write_all(&[1u8; 10]).unwrap();
        // orderly shutdown after 10 bytes
    });

    let stream = accept_one(&dispatcher, &listener);

    let mut received = vec![0u8; 1024];
    let (tx, rx) = mpsc::channel();
    transfer::async_read(
        &stream,
        MutBuf::from(&mut received),
        transfer_all(),
        move |res| tx.send(res).unwrap(),
    )
    .unwrap();

    let n = rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    assert_eq!(n, 10);
    assert!(
        !stream.is_open(),
        "orderly shutdown must close the handle"
    );

    peer.join().unwrap();
    dispatcher.stop().unwrap();
}

/// transfer-all with a narrowed per-request cap; counts submissions.
struct CappedAll {
    cap: usize,
    issued: Arc<AtomicUsize>,
}

impl CompletionCondition for CappedAll {
    fn required(&self, _transferred: usize) -> usize {
        usize::MAX
    }

    fn max_chunk(&self) -> usize {
        self.issued.fetch_add(1, Ordering::SeqCst);
        self.cap
    }
}

#[test]
fn chunk_cap_bounds_each_request_blocking() {
    let dispatcher = Dispatcher::new(1).unwrap();
    let (reader, writer) = stratus::pipe::pair(&dispatcher).unwrap();

    // All 200 bytes are buffered before the first read, so a 64-byte cap
    // makes exactly ceil(200/64) = 4 requests.
    let data = payload(200);
    assert_eq!(writer.write_some(ConstBuf::from(&data)).unwrap(), 200);

    let issued = Arc::new(AtomicUsize::new(0));
    let mut received = vec![0u8; 200];
    let n = transfer::read(
        &reader,
        MutBuf::from(&mut received),
        CappedAll {
            cap: 64,
            issued: Arc::clone(&issued),
        },
    )
    .unwrap();

    assert_eq!(n, 200);
    assert_eq!(received, data);
    assert_eq!(issued.load(Ordering::SeqCst), 4);
    dispatcher.stop().unwrap();
}

#[test]
fn chunk_cap_bounds_each_request_async() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let (listener, addr) = listener_on(&dispatcher);
    let data = payload(200);

    let sent = data.clone();
    let peer = std::thread::spawn(move || {
        let mut socket = std::net::TcpStream::connect(addr).unwrap();
        socket.write_all(&sent).unwrap();
        socket.flush().unwrap();
        socket
    });

    let stream = accept_one(&dispatcher, &listener);

    let issued = Arc::new(AtomicUsize::new(0));
    let mut received = vec![0u8; 200];
    let (tx, rx) = mpsc::channel();
    transfer::async_read(
        &stream,
        MutBuf::from(&mut received),
        CappedAll {
            cap: 64,
            issued: Arc::clone(&issued),
        },
        move |res| tx.send(res).unwrap(),
    )
    .unwrap();

    let n = rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    assert_eq!(n, 200);
    assert_eq!(received, data);
    // a 64-byte cap cannot move 200 bytes in fewer than 4 requests
    assert!(issued.load(Ordering::SeqCst) >= 4);

    drop(peer.join().unwrap());
    dispatcher.stop().unwrap();
}

#[test]
fn async_write_delivers_whole_buffer() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let (listener, addr) = listener_on(&dispatcher);
    let data = payload(64 * 1024 + 513);

    let expected = data.clone();
    let peer = std::thread::spawn(move || {
        use std::io::Read;
        let mut socket = std::net::TcpStream::connect(addr).unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).unwrap();
        assert_eq!(received, expected);
    });

    let stream = accept_one(&dispatcher, &listener);

    let (tx, rx) = mpsc::channel();
    transfer::async_write(
        &stream,
        ConstBuf::from(&data),
        transfer_all(),
        move |res| tx.send(res).unwrap(),
    )
    .unwrap();

    let n = rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    assert_eq!(n, data.len());

    stream.close().unwrap();
    peer.join().unwrap();
    dispatcher.stop().unwrap();
}

#[test]
fn zero_length_transfer_completes_without_io() {
    let dispatcher = Dispatcher::new(1).unwrap();
    let (reader, _writer) = stratus::pipe::pair(&dispatcher).unwrap();

    let mut empty: Vec<u8> = Vec::new();
    let (tx, rx) = mpsc::channel();
    transfer::async_read(
        &reader,
        MutBuf::from(&mut empty),
        transfer_all(),
        move |res| {
            tx.send(res).unwrap();
        },
    )
    .unwrap();

    let n = rx.recv_timeout(RECV_WAIT).unwrap().unwrap();
    assert_eq!(n, 0);
    dispatcher.stop().unwrap();
}

#[test]
fn cancel_aborts_pending_read() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let (reader, _writer) = stratus::pipe::pair(&dispatcher).unwrap();
    dispatcher.bind(reader.handle()).unwrap();

    let mut received = vec![0u8; 64];
    let (tx, rx) = mpsc::channel();
    reader
        .async_read_some(MutBuf::from(&mut received), move |res| {
            tx.send(res).unwrap();
        })
        .unwrap();

    // nothing will ever arrive; abort the request
    std::thread::sleep(Duration::from_millis(50));
    reader.cancel().unwrap();

    let err = rx.recv_timeout(RECV_WAIT).unwrap().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ECANCELED));
    dispatcher.stop().unwrap();
}
