use std::io;

/// Convert a `-1`-on-error libc return value into an `io::Result`.
pub(crate) fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

/// Same conversion for the `ssize_t`-returning read/write family.
pub(crate) fn cvt_len(res: libc::ssize_t) -> io::Result<usize> {
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

pub(crate) fn set_nonblock(fd: libc::c_int, on: bool) -> io::Result<()> {
    unsafe {
        let flags = cvt(libc::fcntl(fd, libc::F_GETFL))?;
        let flags = if on {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        cvt(libc::fcntl(fd, libc::F_SETFL, flags)).map(|_| ())
    }
}

pub(crate) fn set_cloexec(fd: libc::c_int) -> io::Result<()> {
    unsafe {
        let flags = cvt(libc::fcntl(fd, libc::F_GETFD))?;
        cvt(libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC)).map(|_| ())
    }
}

/// Retry a syscall that may be interrupted by a signal.
pub(crate) fn retry_eintr<F>(mut f: F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    loop {
        match cvt_len(f()) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            res => return res,
        }
    }
}
