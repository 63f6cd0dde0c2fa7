use std::io::Write;
use std::sync::mpsc;
use std::time::Duration;

use stratus::fs::File;
use stratus::transfer::{self, transfer_all};
use stratus::{ConstBuf, Dispatcher, MutBuf};

const HELLO: &[u8] = b"hello completion world";

#[test]
fn read_at_returns_file_contents() {
    let dispatcher = Dispatcher::new(1).unwrap();
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(HELLO).unwrap();

    let file = File::open(&dispatcher, tmp.path()).unwrap();
    let mut buf = vec![0u8; 64];
    let n = file.read_at(MutBuf::from(&mut buf), 0).unwrap();
    assert_eq!(&buf[..n], HELLO);

    dispatcher.stop().unwrap();
}

#[test]
fn async_read_at_with_offset() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(HELLO).unwrap();

    let file = File::open(&dispatcher, tmp.path()).unwrap();
    dispatcher.bind(stratus::AsHandle::handle(&file)).unwrap();

    let mut buf = vec![0u8; 64];
    let (tx, rx) = mpsc::channel();
    file.async_read_at(MutBuf::from(&mut buf), 6, move |res| tx.send(res).unwrap())
        .unwrap();

    let n = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(&buf[..n], &HELLO[6..]);
    dispatcher.stop().unwrap();
}

#[test]
fn composed_write_at_advances_the_offset() {
    let dispatcher = Dispatcher::new(2).unwrap();
    let tmp = tempfile::NamedTempFile::new().unwrap();

    let file = File::create(&dispatcher, tmp.path()).unwrap();
    dispatcher.bind(stratus::AsHandle::handle(&file)).unwrap();

    // larger than one 64 KiB chunk, so the chain must advance the offset
    let data: Vec<u8> = (0..80_000usize).map(|i| (i % 250) as u8).collect();
    let (tx, rx) = mpsc::channel();
    transfer::async_write_at(
        &file,
        ConstBuf::from(&data),
        0,
        transfer_all(),
        move |res| tx.send(res).unwrap(),
    )
    .unwrap();

    let n = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    assert_eq!(n, data.len());
    file.sync_all().unwrap();

    let written = std::fs::read(tmp.path()).unwrap();
    assert_eq!(written, data);
    dispatcher.stop().unwrap();
}

#[test]
fn blocking_composed_read_at() {
    let dispatcher = Dispatcher::new(1).unwrap();
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..100_000usize).map(|i| (i % 241) as u8).collect();
    tmp.write_all(&data).unwrap();

    let file = File::open(&dispatcher, tmp.path()).unwrap();
    let mut buf = vec![0u8; 100_000];
    let n = transfer::read_at(&file, MutBuf::from(&mut buf), 0, transfer_all()).unwrap();
    assert_eq!(n, data.len());
    assert_eq!(buf, data);

    dispatcher.stop().unwrap();
}

#[test]
fn async_sync_all_completes() {
    let dispatcher = Dispatcher::new(1).unwrap();
    let tmp = tempfile::NamedTempFile::new().unwrap();

    let file = File::create(&dispatcher, tmp.path()).unwrap();
    dispatcher.bind(stratus::AsHandle::handle(&file)).unwrap();
    file.write_at(ConstBuf::from(HELLO), 0).unwrap();

    let (tx, rx) = mpsc::channel();
    file.async_sync_all(move |res| tx.send(res).unwrap()).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    dispatcher.stop().unwrap();
}
