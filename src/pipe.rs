//! Anonymous pipe, exposed as a read end and a write end.

use std::io;

use crate::buf::{ConstBuf, MutBuf};
use crate::dispatcher::Dispatcher;
use crate::handle::{AsHandle, Handle};
use crate::util::cvt;

/// Read end of a pipe.
pub struct PipeReader {
    handle: Handle,
}

/// Write end of a pipe.
pub struct PipeWriter {
    handle: Handle,
}

impl AsHandle for PipeReader {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl AsHandle for PipeWriter {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

/// Create a pipe pair on `dispatcher`.
pub fn pair(dispatcher: &Dispatcher) -> io::Result<(PipeReader, PipeWriter)> {
    let mut fds = [0 as libc::c_int; 2];
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    Ok((
        PipeReader {
            handle: Handle::from_fd(dispatcher, fds[0]),
        },
        PipeWriter {
            handle: Handle::from_fd(dispatcher, fds[1]),
        },
    ))
}

impl PipeReader {
    pub fn read_some(&self, buf: MutBuf) -> io::Result<usize> {
        self.handle.read_some(buf)
    }

    pub fn async_read_some(
        &self,
        buf: MutBuf,
        handler: impl FnOnce(io::Result<usize>) + Send + 'static,
    ) -> io::Result<()> {
        self.handle.async_read_some(buf, handler)
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
}

impl PipeWriter {
    pub fn write_some(&self, buf: ConstBuf) -> io::Result<usize> {
        self.handle.write_some(buf)
    }

    pub fn async_write_some(
        &self,
        buf: ConstBuf,
        handler: impl FnOnce(io::Result<usize>) + Send + 'static,
    ) -> io::Result<()> {
        self.handle.async_write_some(buf, handler)
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
}
