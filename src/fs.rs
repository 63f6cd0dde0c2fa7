//! File handle with offset-addressed I/O.

use std::io;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::Path;

use io_uring::{opcode, types};

use crate::buf::{ConstBuf, MutBuf};
use crate::dispatcher::Dispatcher;
use crate::handle::{AsHandle, Handle};
use crate::op::Continuation;

/// A regular file registered with a dispatcher. All I/O is
/// offset-addressed; the file position is never used.
pub struct File {
    handle: Handle,
}

impl AsHandle for File {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl File {
    /// Open an existing file read-only.
    pub fn open(dispatcher: &Dispatcher, path: impl AsRef<Path>) -> io::Result<File> {
        let file = std::fs::File::open(path)?;
        Ok(File::from_std(dispatcher, file))
    }

    /// Create (or truncate) a file read-write.
    pub fn create(dispatcher: &Dispatcher, path: impl AsRef<Path>) -> io::Result<File> {
        let file = std::fs::File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(File::from_std(dispatcher, file))
    }

    /// Adopt an already-open standard file.
    pub fn from_std(dispatcher: &Dispatcher, file: std::fs::File) -> File {
        File {
            handle: Handle::from_fd(dispatcher, file.into_raw_fd()),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.handle.raw_fd()
    }

    /// Blocking read at `offset`.
    pub fn read_at(&self, buf: MutBuf, offset: u64) -> io::Result<usize> {
        self.handle.read_some_at(buf, offset)
    }

    /// Blocking write at `offset`.
    pub fn write_at(&self, buf: ConstBuf, offset: u64) -> io::Result<usize> {
        self.handle.write_some_at(buf, offset)
    }

    /// Single-shot asynchronous read at `offset`.
    pub fn async_read_at(
        &self,
        buf: MutBuf,
        offset: u64,
        handler: impl FnOnce(io::Result<usize>) + Send + 'static,
    ) -> io::Result<()> {
        self.handle.async_read_some_at(buf, offset, Box::new(handler))
    }

    /// Single-shot asynchronous write at `offset`.
    pub fn async_write_at(
        &self,
        buf: ConstBuf,
        offset: u64,
        handler: impl FnOnce(io::Result<usize>) + Send + 'static,
    ) -> io::Result<()> {
        self.handle.async_write_some_at(buf, offset, Box::new(handler))
    }

    /// Blocking fsync.
    pub fn sync_all(&self) -> io::Result<()> {
        crate::util::cvt(unsafe { libc::fsync(self.handle.raw_fd()) }).map(|_| ())
    }

    /// Asynchronous fsync; the handler fires once the data is durable.
    pub fn async_sync_all(
        &self,
        handler: impl FnOnce(io::Result<()>) + Send + 'static,
    ) -> io::Result<()> {
        let sqe = opcode::Fsync::new(types::Fd(self.handle.raw_fd())).build();
        self.handle
            .submit(
                sqe,
                Continuation::Io(Box::new(move |res| handler(res.map(|_| ())))),
            )
            .map_err(|(e, _)| e)
    }

    /// Preallocate `size` bytes.
    pub fn allocate(&self, size: u64) -> io::Result<()> {
        crate::util::cvt(unsafe {
            libc::fallocate(self.handle.raw_fd(), 0, 0, size as libc::off_t)
        })
        .map(|_| ())
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    pub fn close(&self) -> io::Result<()> {
        self.handle.close()
    }

    pub fn cancel(&self) -> io::Result<()> {
        self.handle.cancel()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.handle.dispatcher()
    }
}
