//! Socket handles: stream listener and stream, datagram socket, socket
//! options, and control commands.
//!
//! Accept and connect follow the proactor discipline of preparing state
//! ahead of the kernel call: connect requires an already-opened socket,
//! and accept takes a caller-constructed peer slot that adopts the new
//! descriptor on completion. The sockaddr/msghdr scratch those requests
//! retain comes from the dispatcher's fixed pool and lives in the
//! operation context until the completion fires.

use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::RawFd;
use std::time::Duration;

use io_uring::{opcode, types};
use os_socketaddr::OsSocketAddr;

use crate::buf::{ConstBuf, MutBuf};
use crate::dispatcher::Dispatcher;
use crate::handle::{AsHandle, Handle};
use crate::op::{AddrBlock, Continuation};
use crate::util::{cvt, retry_eintr};

fn domain_of(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

fn new_socket(domain: libc::c_int, socket_type: libc::c_int) -> io::Result<RawFd> {
    cvt(unsafe { libc::socket(domain, socket_type | libc::SOCK_CLOEXEC, 0) })
}

fn local_addr_of(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;
    unsafe { OsSocketAddr::copy_from_raw(&storage as *const _ as *const libc::sockaddr, len) }
        .into_addr()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unparseable local address"))
}

/// Fill the block's storage with an encoded destination address.
fn store_addr(block: &AddrBlock, addr: SocketAddr) -> libc::socklen_t {
    let os_addr = OsSocketAddr::from(addr);
    unsafe {
        let slot = &mut (*block.get()).storage;
        std::ptr::copy_nonoverlapping(
            os_addr.as_ptr() as *const u8,
            slot as *mut _ as *mut u8,
            os_addr.len() as usize,
        );
        (*block.get()).addrlen = os_addr.len();
    }
    os_addr.len()
}

/// A connected (or connectable) stream socket.
pub struct TcpStream {
    pub(crate) handle: Handle,
}

impl AsHandle for TcpStream {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl TcpStream {
    /// A prepared, not-yet-open peer slot for [`TcpListener::async_accept`].
    pub fn prepared(dispatcher: &Dispatcher) -> TcpStream {
        TcpStream {
            handle: Handle::prepared(dispatcher),
        }
    }

    /// Open the socket descriptor for the address family of `peer`.
    ///
    /// Connecting requires this to have happened first: the kernel call
    /// never creates the socket.
    pub fn open(dispatcher: &Dispatcher, peer: &SocketAddr) -> io::Result<TcpStream> {
        let fd = new_socket(domain_of(peer), libc::SOCK_STREAM)?;
        Ok(TcpStream {
            handle: Handle::from_fd(dispatcher, fd),
        })
    }

    /// Blocking connect. The socket must already be open.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let os_addr = OsSocketAddr::from(addr);
        cvt(unsafe { libc::connect(self.handle.raw_fd(), os_addr.as_ptr(), os_addr.len()) })
            .map(|_| ())
    }

    /// Single-shot asynchronous connect; the handler fires exactly once.
    pub fn async_connect(
        &self,
        addr: SocketAddr,
        handler: impl FnOnce(io::Result<()>) + Send + 'static,
    ) -> io::Result<()> {
        let dispatcher = self.handle.dispatcher().clone();
        let block = dispatcher.alloc_msg_block();
        let len = store_addr(&block, addr);
        let sqe = opcode::Connect::new(
            types::Fd(self.handle.raw_fd()),
            unsafe { &(*block.get()).storage as *const _ as *const libc::sockaddr },
            len,
        )
        .build();
        self.handle
            .submit(
                sqe,
                Continuation::Connect {
                    addr: block,
                    handler: Box::new(handler),
                },
            )
            .map_err(|(e, cont)| {
                if let Continuation::Connect { addr, .. } = cont {
                    dispatcher.free_msg_block(addr);
                }
                e
            })
    }

    /// Shut down the reading and/or writing side.
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        cvt(unsafe { libc::shutdown(self.handle.raw_fd(), how) }).map(|_| ())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        local_addr_of(self.handle.raw_fd())
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

    /// Single-shot asynchronous read.
    pub fn async_read_some(
        &self,
        buf: MutBuf,
        handler: impl FnOnce(io::Result<usize>) + Send + 'static,
    ) -> io::Result<()> {
        self.handle.async_read_some(buf, handler)
    }

    /// Single-shot asynchronous write.
    pub fn async_write_some(
        &self,
        buf: ConstBuf,
        handler: impl FnOnce(io::Result<usize>) + Send + 'static,
    ) -> io::Result<()> {
        self.handle.async_write_some(buf, handler)
    }

    /// Blocking single-shot read.
    pub fn read_some(&self, buf: MutBuf) -> io::Result<usize> {
        self.handle.read_some(buf)
    }

    /// Blocking single-shot write.
    pub fn write_some(&self, buf: ConstBuf) -> io::Result<usize> {
        self.handle.write_some(buf)
    }
}

/// A listening stream socket.
pub struct TcpListener {
    handle: Handle,
}

impl AsHandle for TcpListener {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl TcpListener {
    /// Open, bind, and listen.
    pub fn bind(
        dispatcher: &Dispatcher,
        addr: SocketAddr,
        backlog: u32,
    ) -> io::Result<TcpListener> {
        let fd = new_socket(domain_of(&addr), libc::SOCK_STREAM)?;
        let handle = Handle::from_fd(dispatcher, fd);
        let reuse: libc::c_int = 1;
        cvt(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &reuse as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
        let os_addr = OsSocketAddr::from(addr);
        cvt(unsafe { libc::bind(fd, os_addr.as_ptr(), os_addr.len()) })?;
        cvt(unsafe { libc::listen(fd, backlog as libc::c_int) })?;
        Ok(TcpListener { handle })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        local_addr_of(self.handle.raw_fd())
    }

    /// Blocking accept into a prepared peer slot.
    pub fn accept(&self, peer: TcpStream) -> io::Result<(TcpStream, Option<SocketAddr>)> {
        check_prepared(&peer, self.handle.dispatcher())?;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = cvt(unsafe {
            libc::accept4(
                self.handle.raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_CLOEXEC,
            )
        })?;
        peer.handle.adopt(fd);
        let remote =
            unsafe { OsSocketAddr::copy_from_raw(&storage as *const _ as *const libc::sockaddr, len) }
                .into_addr();
        Ok((peer, remote))
    }

    /// Single-shot asynchronous accept.
    ///
    /// `peer` must be a prepared, unopened slot created against the same
    /// dispatcher; it adopts the accepted descriptor and is handed back
    /// through the handler together with the remote address.
    pub fn async_accept(
        &self,
        peer: TcpStream,
        handler: impl FnOnce(io::Result<(TcpStream, Option<SocketAddr>)>) + Send + 'static,
    ) -> io::Result<()> {
        check_prepared(&peer, self.handle.dispatcher())?;
        let dispatcher = self.handle.dispatcher().clone();
        let block = dispatcher.alloc_msg_block();
        unsafe {
            (*block.get()).addrlen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        }
        let sqe = opcode::Accept::new(
            types::Fd(self.handle.raw_fd()),
            unsafe { &mut (*block.get()).storage as *mut _ as *mut libc::sockaddr },
            unsafe { &mut (*block.get()).addrlen },
        )
        .flags(libc::SOCK_CLOEXEC)
        .build();
        self.handle
            .submit(
                sqe,
                Continuation::Accept {
                    peer,
                    addr: block,
                    handler: Box::new(handler),
                },
            )
            .map_err(|(e, cont)| {
                if let Continuation::Accept { addr, .. } = cont {
                    dispatcher.free_msg_block(addr);
                }
                e
            })
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

fn check_prepared(peer: &TcpStream, dispatcher: &Dispatcher) -> io::Result<()> {
    if peer.handle.is_open() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "accept peer must be a prepared, unopened handle",
        ));
    }
    if !peer.handle.belongs_to(dispatcher) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "accept peer was prepared for a different dispatcher",
        ));
    }
    Ok(())
}

/// A datagram socket.
pub struct UdpSocket {
    handle: Handle,
}

impl AsHandle for UdpSocket {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl UdpSocket {
    /// Open and bind.
    pub fn bind(dispatcher: &Dispatcher, addr: SocketAddr) -> io::Result<UdpSocket> {
        let socket = UdpSocket::open(dispatcher, &addr)?;
        let os_addr = OsSocketAddr::from(addr);
        cvt(unsafe { libc::bind(socket.handle.raw_fd(), os_addr.as_ptr(), os_addr.len()) })?;
        Ok(socket)
    }

    /// Open an unbound socket for the address family of `peer`.
    pub fn open(dispatcher: &Dispatcher, peer: &SocketAddr) -> io::Result<UdpSocket> {
        let fd = new_socket(domain_of(peer), libc::SOCK_DGRAM)?;
        Ok(UdpSocket {
            handle: Handle::from_fd(dispatcher, fd),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        local_addr_of(self.handle.raw_fd())
    }

    /// Blocking datagram send.
    pub fn send_to(&self, buf: ConstBuf, addr: SocketAddr) -> io::Result<usize> {
        let os_addr = OsSocketAddr::from(addr);
        let fd = self.handle.raw_fd();
        retry_eintr(|| unsafe {
            libc::sendto(
                fd,
                buf.as_ptr().cast(),
                buf.len(),
                0,
                os_addr.as_ptr(),
                os_addr.len(),
            )
        })
    }

    /// Blocking datagram receive with source capture.
    pub fn recv_from(&self, buf: MutBuf) -> io::Result<(usize, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = self.handle.raw_fd();
        let n = retry_eintr(|| unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        let addr =
            unsafe { OsSocketAddr::copy_from_raw(&storage as *const _ as *const libc::sockaddr, len) }
                .into_addr()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "unparseable peer address")
                })?;
        Ok((n, addr))
    }

    /// Single-shot asynchronous send toward `addr`. The encoded address
    /// is retained in the operation context until completion.
    pub fn async_send_to(
        &self,
        buf: ConstBuf,
        addr: SocketAddr,
        handler: impl FnOnce(io::Result<usize>) + Send + 'static,
    ) -> io::Result<()> {
        let dispatcher = self.handle.dispatcher().clone();
        let block = dispatcher.alloc_msg_block();
        let len = store_addr(&block, addr);
        unsafe {
            let b = &mut *block.get();
            b.iov.iov_base = buf.as_ptr() as *mut libc::c_void;
            b.iov.iov_len = buf.len();
            b.msghdr.msg_name = &mut b.storage as *mut _ as *mut libc::c_void;
            b.msghdr.msg_namelen = len;
            b.msghdr.msg_iov = &mut b.iov;
            b.msghdr.msg_iovlen = 1;
        }
        let sqe = opcode::SendMsg::new(types::Fd(self.handle.raw_fd()), unsafe {
            &(*block.get()).msghdr
        })
        .build();
        self.handle
            .submit(
                sqe,
                Continuation::SendTo {
                    addr: block,
                    handler: Box::new(handler),
                },
            )
            .map_err(|(e, cont)| {
                if let Continuation::SendTo { addr, .. } = cont {
                    dispatcher.free_msg_block(addr);
                }
                e
            })
    }

    /// Single-shot asynchronous receive with source capture.
    pub fn async_recv_from(
        &self,
        buf: MutBuf,
        handler: impl FnOnce(io::Result<(usize, SocketAddr)>) + Send + 'static,
    ) -> io::Result<()> {
        let dispatcher = self.handle.dispatcher().clone();
        let block = dispatcher.alloc_msg_block();
        unsafe {
            let b = &mut *block.get();
            b.iov.iov_base = buf.as_mut_ptr().cast();
            b.iov.iov_len = buf.len();
            b.msghdr.msg_name = &mut b.storage as *mut _ as *mut libc::c_void;
            b.msghdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            b.msghdr.msg_iov = &mut b.iov;
            b.msghdr.msg_iovlen = 1;
        }
        let sqe = opcode::RecvMsg::new(types::Fd(self.handle.raw_fd()), unsafe {
            &mut (*block.get()).msghdr
        })
        .build();
        self.handle
            .submit(
                sqe,
                Continuation::RecvFrom {
                    addr: block,
                    handler: Box::new(handler),
                },
            )
            .map_err(|(e, cont)| {
                if let Continuation::RecvFrom { addr, .. } = cont {
                    dispatcher.free_msg_block(addr);
                }
                e
            })
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

/// A socket option: a `(level, name)` pair plus the typed value and its
/// raw kernel representation.
pub trait SocketOption {
    type Value;
    type Raw: Copy;
    const LEVEL: libc::c_int;
    const NAME: libc::c_int;
    fn encode(value: &Self::Value) -> Self::Raw;
    fn decode(raw: Self::Raw) -> Self::Value;
}

macro_rules! bool_option {
    ($(#[$doc:meta])* $name:ident, $level:expr, $opt:expr) => {
        $(#[$doc])*
        pub struct $name;

        impl SocketOption for $name {
            type Value = bool;
            type Raw = libc::c_int;
            const LEVEL: libc::c_int = $level;
            const NAME: libc::c_int = $opt;

            fn encode(value: &bool) -> libc::c_int {
                *value as libc::c_int
            }

            fn decode(raw: libc::c_int) -> bool {
                raw != 0
            }
        }
    };
}

bool_option!(
    /// SO_KEEPALIVE.
    KeepAlive,
    libc::SOL_SOCKET,
    libc::SO_KEEPALIVE
);
bool_option!(
    /// TCP_NODELAY.
    NoDelay,
    libc::IPPROTO_TCP,
    libc::TCP_NODELAY
);
bool_option!(
    /// SO_REUSEADDR.
    ReuseAddress,
    libc::SOL_SOCKET,
    libc::SO_REUSEADDR
);
bool_option!(
    /// SO_BROADCAST.
    Broadcast,
    libc::SOL_SOCKET,
    libc::SO_BROADCAST
);

macro_rules! size_option {
    ($(#[$doc:meta])* $name:ident, $opt:expr) => {
        $(#[$doc])*
        pub struct $name;

        impl SocketOption for $name {
            type Value = usize;
            type Raw = libc::c_int;
            const LEVEL: libc::c_int = libc::SOL_SOCKET;
            const NAME: libc::c_int = $opt;

            fn encode(value: &usize) -> libc::c_int {
                *value as libc::c_int
            }

            fn decode(raw: libc::c_int) -> usize {
                raw as usize
            }
        }
    };
}

size_option!(
    /// SO_SNDBUF.
    SendBufferSize,
    libc::SO_SNDBUF
);
size_option!(
    /// SO_RCVBUF.
    RecvBufferSize,
    libc::SO_RCVBUF
);

/// SO_LINGER: `None` disables lingering, `Some(d)` blocks close for up
/// to `d`.
pub struct Linger;

impl SocketOption for Linger {
    type Value = Option<Duration>;
    type Raw = libc::linger;
    const LEVEL: libc::c_int = libc::SOL_SOCKET;
    const NAME: libc::c_int = libc::SO_LINGER;

    fn encode(value: &Option<Duration>) -> libc::linger {
        match value {
            Some(timeout) => libc::linger {
                l_onoff: 1,
                l_linger: timeout.as_secs() as libc::c_int,
            },
            None => libc::linger {
                l_onoff: 0,
                l_linger: 0,
            },
        }
    }

    fn decode(raw: libc::linger) -> Option<Duration> {
        (raw.l_onoff != 0).then(|| Duration::from_secs(raw.l_linger as u64))
    }
}

macro_rules! timeout_option {
    ($(#[$doc:meta])* $name:ident, $opt:expr) => {
        $(#[$doc])*
        pub struct $name;

        impl SocketOption for $name {
            type Value = Option<Duration>;
            type Raw = libc::timeval;
            const LEVEL: libc::c_int = libc::SOL_SOCKET;
            const NAME: libc::c_int = $opt;

            fn encode(value: &Option<Duration>) -> libc::timeval {
                match value {
                    Some(timeout) => libc::timeval {
                        tv_sec: timeout.as_secs() as libc::time_t,
                        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
                    },
                    None => libc::timeval {
                        tv_sec: 0,
                        tv_usec: 0,
                    },
                }
            }

            fn decode(raw: libc::timeval) -> Option<Duration> {
                if raw.tv_sec == 0 && raw.tv_usec == 0 {
                    None
                } else {
                    Some(
                        Duration::from_secs(raw.tv_sec as u64)
                            + Duration::from_micros(raw.tv_usec as u64),
                    )
                }
            }
        }
    };
}

timeout_option!(
    /// SO_SNDTIMEO.
    SendTimeout,
    libc::SO_SNDTIMEO
);
timeout_option!(
    /// SO_RCVTIMEO.
    RecvTimeout,
    libc::SO_RCVTIMEO
);

/// A control command for [`SocketExt::io_control`]: an ioctl request
/// with a typed in/out payload.
pub trait IoControl {
    type Data;
    const REQUEST: libc::c_ulong;
    fn data(&mut self) -> *mut Self::Data;
}

/// FIONBIO: toggle non-blocking mode.
pub struct NonBlockingIo {
    on: libc::c_int,
}

impl NonBlockingIo {
    pub fn new(on: bool) -> Self {
        NonBlockingIo {
            on: on as libc::c_int,
        }
    }
}

impl IoControl for NonBlockingIo {
    type Data = libc::c_int;
    const REQUEST: libc::c_ulong = libc::FIONBIO as libc::c_ulong;

    fn data(&mut self) -> *mut libc::c_int {
        &mut self.on
    }
}

/// FIONREAD: bytes available to read without blocking.
#[derive(Default)]
pub struct BytesReadable {
    count: libc::c_int,
}

impl BytesReadable {
    pub fn new() -> Self {
        BytesReadable::default()
    }

    pub fn get(&self) -> usize {
        self.count as usize
    }
}

impl IoControl for BytesReadable {
    type Data = libc::c_int;
    const REQUEST: libc::c_ulong = libc::FIONREAD as libc::c_ulong;

    fn data(&mut self) -> *mut libc::c_int {
        &mut self.count
    }
}

/// Option get/set and control commands shared by every socket handle.
pub trait SocketExt: AsHandle {
    fn set_option<O: SocketOption>(&self, _opt: O, value: O::Value) -> io::Result<()> {
        let raw = O::encode(&value);
        cvt(unsafe {
            libc::setsockopt(
                self.handle().raw_fd(),
                O::LEVEL,
                O::NAME,
                &raw as *const _ as *const libc::c_void,
                mem::size_of::<O::Raw>() as libc::socklen_t,
            )
        })
        .map(|_| ())
    }

    fn get_option<O: SocketOption>(&self, _opt: O) -> io::Result<O::Value> {
        let mut raw: O::Raw = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<O::Raw>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockopt(
                self.handle().raw_fd(),
                O::LEVEL,
                O::NAME,
                &mut raw as *mut _ as *mut libc::c_void,
                &mut len,
            )
        })?;
        Ok(O::decode(raw))
    }

    fn io_control<C: IoControl>(&self, command: &mut C) -> io::Result<()> {
        cvt(unsafe {
            libc::ioctl(
                self.handle().raw_fd(),
                C::REQUEST as _,
                command.data(),
            )
        })
        .map(|_| ())
    }
}

impl SocketExt for TcpStream {}
impl SocketExt for TcpListener {}
impl SocketExt for UdpSocket {}
