//! Shared handle core: a kernel descriptor tied to one dispatcher.
//!
//! Every typed handle (stream socket, datagram socket, file, pipe end,
//! directory watch) wraps a [`Handle`]. The core is cheap to clone so a
//! composed-transfer chain can keep the handle alive across completions;
//! clones share the descriptor and its open/bound state.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use io_uring::{opcode, squeue, types};

use crate::buf::{ConstBuf, MutBuf};
use crate::dispatcher::Dispatcher;
use crate::op::{Continuation, IoHandler};
use crate::util::retry_eintr;

#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    fd: AtomicI32,
    dispatcher: Dispatcher,
    open: AtomicBool,
    bound: AtomicBool,
}

impl Handle {
    /// A prepared, not-yet-open handle (the peer slot of an accept).
    pub(crate) fn prepared(dispatcher: &Dispatcher) -> Handle {
        Handle {
            inner: Arc::new(HandleInner {
                fd: AtomicI32::new(-1),
                dispatcher: dispatcher.clone(),
                open: AtomicBool::new(false),
                bound: AtomicBool::new(false),
            }),
        }
    }

    /// Wrap an already-open descriptor.
    pub(crate) fn from_fd(dispatcher: &Dispatcher, fd: RawFd) -> Handle {
        let handle = Handle::prepared(dispatcher);
        handle.adopt(fd);
        handle
    }

    /// Take ownership of a descriptor produced by the kernel (accept) or
    /// by a later `open` on a prepared handle.
    pub(crate) fn adopt(&self, fd: RawFd) {
        debug_assert!(!self.is_open(), "adopt on an open handle");
        self.inner.fd.store(fd, Ordering::Release);
        self.inner.open.store(true, Ordering::Release);
    }

    pub fn raw_fd(&self) -> RawFd {
        self.inner.fd.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn belongs_to(&self, dispatcher: &Dispatcher) -> bool {
        Arc::ptr_eq(&self.inner.dispatcher.inner, &dispatcher.inner)
    }

    pub(crate) fn mark_bound(&self) {
        self.inner.bound.store(true, Ordering::Release);
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bound.load(Ordering::Acquire)
    }

    /// Close the descriptor.
    ///
    /// Pending operations must be cancelled first; closing with
    /// operations in flight is caller misuse. Closing twice is an error.
    pub fn close(&self) -> io::Result<()> {
        if self
            .inner
            .open
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(not_open());
        }
        let fd = self.raw_fd();
        if self.inner.bound.swap(false, Ordering::AcqRel) {
            self.inner.dispatcher.unbind_fd(fd);
        }
        crate::util::cvt(unsafe { libc::close(fd) }).map(|_| ())
    }

    /// Ask the kernel to abort every pending operation on this handle.
    /// Safe to call from any thread; aborted operations complete through
    /// their handlers with `ECANCELED`.
    pub fn cancel(&self) -> io::Result<()> {
        if !self.is_open() {
            return Err(not_open());
        }
        self.inner.dispatcher.cancel_fd(self.raw_fd())
    }

    /// Submit one SQE against this handle, checking the lifecycle
    /// preconditions for async operations.
    pub(crate) fn submit(
        &self,
        sqe: squeue::Entry,
        cont: Continuation,
    ) -> Result<(), (io::Error, Continuation)> {
        if !self.is_open() {
            return Err((not_open(), cont));
        }
        if !self.is_bound() {
            return Err((
                io::Error::new(
                    io::ErrorKind::NotConnected,
                    "handle is not bound to its dispatcher",
                ),
                cont,
            ));
        }
        self.inner.dispatcher.submit_op(self.raw_fd(), sqe, cont)
    }

    /// Issue exactly one kernel read; the handler fires exactly once with
    /// `(error, bytes_transferred)`.
    pub fn async_read_some(
        &self,
        buf: MutBuf,
        handler: impl FnOnce(io::Result<usize>) + Send + 'static,
    ) -> io::Result<()> {
        self.async_read_some_at(buf, 0, Box::new(handler))
    }

    /// Issue exactly one kernel write; the handler fires exactly once.
    pub fn async_write_some(
        &self,
        buf: ConstBuf,
        handler: impl FnOnce(io::Result<usize>) + Send + 'static,
    ) -> io::Result<()> {
        self.async_write_some_at(buf, 0, Box::new(handler))
    }

    pub(crate) fn async_read_some_at(
        &self,
        buf: MutBuf,
        offset: u64,
        handler: IoHandler,
    ) -> io::Result<()> {
        let sqe = read_sqe(self.raw_fd(), buf, offset);
        self.submit(sqe, Continuation::Io(handler)).map_err(|(e, _)| e)
    }

    pub(crate) fn async_write_some_at(
        &self,
        buf: ConstBuf,
        offset: u64,
        handler: IoHandler,
    ) -> io::Result<()> {
        let sqe = write_sqe(self.raw_fd(), buf, offset);
        self.submit(sqe, Continuation::Io(handler)).map_err(|(e, _)| e)
    }

    /// Blocking single-shot read.
    pub fn read_some(&self, buf: MutBuf) -> io::Result<usize> {
        if !self.is_open() {
            return Err(not_open());
        }
        let fd = self.raw_fd();
        retry_eintr(|| unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
    }

    /// Blocking single-shot write.
    pub fn write_some(&self, buf: ConstBuf) -> io::Result<usize> {
        if !self.is_open() {
            return Err(not_open());
        }
        let fd = self.raw_fd();
        retry_eintr(|| unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
    }

    /// Blocking single-shot read at an explicit offset.
    pub fn read_some_at(&self, buf: MutBuf, offset: u64) -> io::Result<usize> {
        if !self.is_open() {
            return Err(not_open());
        }
        let fd = self.raw_fd();
        retry_eintr(|| unsafe {
            libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), offset as libc::off_t)
        })
    }

    /// Blocking single-shot write at an explicit offset.
    pub fn write_some_at(&self, buf: ConstBuf, offset: u64) -> io::Result<usize> {
        if !self.is_open() {
            return Err(not_open());
        }
        let fd = self.raw_fd();
        retry_eintr(|| unsafe {
            libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), offset as libc::off_t)
        })
    }
}

pub(crate) fn read_sqe(fd: RawFd, buf: MutBuf, offset: u64) -> squeue::Entry {
    opcode::Read::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32)
        .offset(offset)
        .build()
}

pub(crate) fn write_sqe(fd: RawFd, buf: ConstBuf, offset: u64) -> squeue::Entry {
    opcode::Write::new(types::Fd(fd), buf.as_ptr(), buf.len() as u32)
        .offset(offset)
        .build()
}

pub(crate) fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "handle is not open")
}

/// Access to the shared handle core of a typed handle.
pub trait AsHandle {
    fn handle(&self) -> &Handle;
}

impl AsHandle for Handle {
    fn handle(&self) -> &Handle {
        self
    }
}
