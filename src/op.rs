//! Per-operation context: the state bridging a submitted kernel request to
//! its continuation.
//!
//! Every in-flight operation is one arena slot keyed by the SQE
//! `user_data` token. The slot owns a [`Continuation`], a tagged value
//! carrying the user handler plus whatever the pending request needs kept
//! alive (buffer views, sockaddr storage, a prepared peer handle). A
//! worker thread removes the slot when the matching CQE arrives and runs
//! the continuation exactly once, with no dispatcher lock held, so a
//! continuation is free to submit follow-up operations.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use os_socketaddr::OsSocketAddr;

use crate::dispatcher::Dispatcher;
use crate::net::TcpStream;
use crate::transfer::TransferMachine;

/// Completions carrying this token have no context slot and are dropped
/// by the drain loop (cancel requests, best-effort internal submissions).
pub(crate) const ORPHAN_TOKEN: u64 = u64::MAX;

/// Synthetic completion posted by `stop()` to terminate one worker.
pub(crate) const POISON_TOKEN: u64 = u64::MAX - 1;

pub type IoHandler = Box<dyn FnOnce(io::Result<usize>) + Send + 'static>;
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;
pub type AcceptHandler =
    Box<dyn FnOnce(io::Result<(TcpStream, Option<SocketAddr>)>) + Send + 'static>;
pub type ConnectHandler = Box<dyn FnOnce(io::Result<()>) + Send + 'static>;
pub type RecvFromHandler = Box<dyn FnOnce(io::Result<(usize, SocketAddr)>) + Send + 'static>;

/// Scratch kept alive for the kernel across an address-carrying request:
/// the msghdr/iovec pair for datagram transfers and the sockaddr storage
/// the kernel reads or fills in.
#[repr(C)]
pub(crate) struct MsgBlock {
    pub msghdr: libc::msghdr,
    pub iov: libc::iovec,
    pub storage: libc::sockaddr_storage,
    pub addrlen: libc::socklen_t,
}

/// Pooled [`MsgBlock`]; allocated from the dispatcher's fixed pool at
/// submission and released when the completion fires.
pub(crate) struct AddrBlock(pub(crate) NonNull<MsgBlock>);

// The block is exclusively owned by the in-flight operation.
unsafe impl Send for AddrBlock {}

impl AddrBlock {
    pub(crate) fn get(&self) -> *mut MsgBlock {
        self.0.as_ptr()
    }

    /// Decode the peer address accept wrote into the block; accept
    /// reports the length through the block's own `addrlen`.
    pub(crate) fn accept_addr(&self) -> Option<SocketAddr> {
        let block = unsafe { &*self.get() };
        self.decode(block.addrlen)
    }

    /// Decode the source address of a recvmsg; the kernel reports the
    /// length through `msghdr.msg_namelen`.
    pub(crate) fn msg_addr(&self) -> Option<SocketAddr> {
        let block = unsafe { &*self.get() };
        self.decode(block.msghdr.msg_namelen)
    }

    fn decode(&self, len: libc::socklen_t) -> Option<SocketAddr> {
        unsafe {
            let block = &*self.get();
            OsSocketAddr::copy_from_raw(
                &block.storage as *const _ as *const libc::sockaddr,
                len,
            )
            .into_addr()
        }
    }
}

/// The continuation of one in-flight operation.
///
/// One tag per completion shape; the drain loop dispatches on the tag
/// instead of chasing a callback hierarchy.
pub(crate) enum Continuation {
    /// Single-shot read/write delivered to a user handler as
    /// `(error, bytes_transferred)`.
    Io(IoHandler),
    /// Accept: the prepared peer adopts the new descriptor, the retained
    /// storage yields the remote address.
    Accept {
        peer: TcpStream,
        addr: AddrBlock,
        handler: AcceptHandler,
    },
    /// Connect: the encoded destination must outlive the kernel request.
    Connect {
        addr: AddrBlock,
        handler: ConnectHandler,
    },
    /// Datagram receive with source address capture.
    RecvFrom {
        addr: AddrBlock,
        handler: RecvFromHandler,
    },
    /// Datagram send toward the retained destination.
    SendTo {
        addr: AddrBlock,
        handler: IoHandler,
    },
    /// `post()`ed work item: a zero-byte, no-error pseudo-completion.
    Task(TaskFn),
    /// One step of a composed transfer; may re-submit itself.
    Transfer(TransferMachine),
}

/// Arena entry: the continuation plus the handle the request was issued
/// on, so `cancel()` can find every operation belonging to one handle.
pub(crate) struct OpSlot {
    pub(crate) fd: RawFd,
    pub(crate) cont: Continuation,
}

impl Continuation {
    /// Run the continuation. Called by a worker with no dispatcher lock
    /// held; the slot has already been vacated, so exactly-once delivery
    /// holds even if the continuation submits new work.
    pub(crate) fn complete(self, dispatcher: &Dispatcher, result: io::Result<usize>) {
        match self {
            Continuation::Io(handler) => handler(result),
            Continuation::Task(task) => task(),
            Continuation::Accept {
                peer,
                addr,
                handler,
            } => {
                let res = result.map(|fd| {
                    peer.handle.adopt(fd as RawFd);
                    let remote = addr.accept_addr();
                    (peer, remote)
                });
                dispatcher.free_msg_block(addr);
                handler(res);
            }
            Continuation::Connect { addr, handler } => {
                dispatcher.free_msg_block(addr);
                handler(result.map(|_| ()));
            }
            Continuation::RecvFrom { addr, handler } => {
                let res = result.and_then(|n| match addr.msg_addr() {
                    Some(remote) => Ok((n, remote)),
                    None => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "kernel returned an unparseable peer address",
                    )),
                });
                dispatcher.free_msg_block(addr);
                handler(res);
            }
            Continuation::SendTo { addr, handler } => {
                dispatcher.free_msg_block(addr);
                handler(result);
            }
            Continuation::Transfer(machine) => machine.on_complete(dispatcher, result),
        }
    }
}

/// Map a CQE result to the `(error, byte_count)` contract.
pub(crate) fn cqe_result(res: i32) -> io::Result<usize> {
    if res >= 0 {
        Ok(res as usize)
    } else {
        Err(io::Error::from_raw_os_error(-res))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cqe_result_maps_errno() {
        assert_eq!(cqe_result(17).unwrap(), 17);
        assert_eq!(cqe_result(0).unwrap(), 0);
        let err = cqe_result(-libc::ECONNRESET).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ECONNRESET));
    }
}
