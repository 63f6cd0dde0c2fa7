//! Directory-change watch handle over an inotify descriptor.
//!
//! The handle delivers the kernel's raw event bytes; decoding them into
//! structured change records belongs to the layer above.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::buf::MutBuf;
use crate::dispatcher::Dispatcher;
use crate::handle::{AsHandle, Handle};
use crate::util::cvt;

/// Event classes a watch can subscribe to.
pub mod mask {
    pub const CREATE: u32 = libc::IN_CREATE;
    pub const DELETE: u32 = libc::IN_DELETE;
    pub const MODIFY: u32 = libc::IN_MODIFY;
    pub const MOVED_FROM: u32 = libc::IN_MOVED_FROM;
    pub const MOVED_TO: u32 = libc::IN_MOVED_TO;
    pub const ATTRIB: u32 = libc::IN_ATTRIB;
    pub const ALL: u32 = CREATE | DELETE | MODIFY | MOVED_FROM | MOVED_TO | ATTRIB;
}

/// Identifier of one watched directory within a [`DirWatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchDescriptor(libc::c_int);

/// A directory-change notification handle.
pub struct DirWatch {
    handle: Handle,
}

impl AsHandle for DirWatch {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl DirWatch {
    /// Open the notification descriptor.
    pub fn new(dispatcher: &Dispatcher) -> io::Result<DirWatch> {
        let fd = cvt(unsafe { libc::inotify_init1(libc::IN_CLOEXEC) })?;
        Ok(DirWatch {
            handle: Handle::from_fd(dispatcher, fd),
        })
    }

    /// Subscribe to changes under `path`.
    pub fn watch(&self, path: impl AsRef<Path>, mask: u32) -> io::Result<WatchDescriptor> {
        let path = CString::new(path.as_ref().as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
        let wd = cvt(unsafe {
            libc::inotify_add_watch(self.handle.raw_fd(), path.as_ptr(), mask)
        })?;
        Ok(WatchDescriptor(wd))
    }

    /// Drop a subscription.
    pub fn unwatch(&self, wd: WatchDescriptor) -> io::Result<()> {
        cvt(unsafe { libc::inotify_rm_watch(self.handle.raw_fd(), wd.0) }).map(|_| ())
    }

    /// Blocking read of raw change events.
    pub fn changes(&self, buf: MutBuf) -> io::Result<usize> {
        self.handle.read_some(buf)
    }

    /// Single-shot asynchronous read of raw change events; the handler
    /// receives the number of event bytes written into `buf`.
    pub fn async_changes(
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
