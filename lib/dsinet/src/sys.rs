//! Raw socket plumbing that std cannot express: the local acceptors are
//! bound to abstract-namespace names that embed their own file descriptor,
//! and the TCP acceptor needs address reuse before bind when its port is
//! pinned.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::process;

/// Abstract-namespace name (without the leading NUL) under which a process
/// exposes one of its local acceptor sockets.
#[inline]
pub fn local_name(pid: u32, chid: i32) -> String {
    format!("dsi/{}/{}", pid, chid)
}

fn last_error<T>() -> io::Result<T> {
    Err(io::Error::last_os_error())
}

fn abstract_sockaddr(name: &str) -> (libc::sockaddr_un, libc::socklen_t) {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    // leading NUL selects the abstract namespace
    for (idx, byte) in name.bytes().enumerate() {
        addr.sun_path[idx + 1] = byte as libc::c_char;
    }

    let len = mem::size_of::<libc::sa_family_t>() + 1 + name.len();
    (addr, len as libc::socklen_t)
}

/// Create a listening local socket whose abstract name contains the file
/// descriptor it ended up on. The descriptor doubles as the channel id
/// announced to the servicebroker.
pub fn local_acceptor() -> io::Result<(UnixListener, i32)> {
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return last_error();
        }

        let name = local_name(process::id(), fd);
        let (addr, len) = abstract_sockaddr(&name);

        if libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) < 0
            || libc::listen(fd, 64) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok((UnixListener::from_raw_fd(fd), fd))
    }
}

/// Listen on a fixed abstract name. Used by broker implementations.
pub fn abstract_listener(name: &str) -> io::Result<UnixListener> {
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return last_error();
        }

        let (addr, len) = abstract_sockaddr(name);

        if libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) < 0
            || libc::listen(fd, 64) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(UnixListener::from_raw_fd(fd))
    }
}

/// Connect to an abstract-namespace name.
pub fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return last_error();
        }

        let (addr, len) = abstract_sockaddr(name);

        if libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(UnixStream::from_raw_fd(fd))
    }
}

/// Bind the TCP acceptor. A pinned port is bound with address reuse so
/// restarting engines do not trip over lingering sockets.
pub fn tcp_acceptor(port: Option<u16>) -> io::Result<TcpListener> {
    let port = match port {
        Some(port) => port,
        None => {
            return TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        }
    };

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return last_error();
        }

        let reuse: libc::c_int = 1;
        let mut addr: libc::sockaddr_in = mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
            || libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ) < 0
            || libc::listen(fd, 64) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

/// Create a pipe, read end first. Used for in-engine wakeup plumbing and
/// as a generic pollable device.
pub fn pipe() -> io::Result<(RawFd, RawFd)> {
    unsafe {
        let mut fds = [0 as libc::c_int; 2];

        if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) < 0 {
            return last_error();
        }

        Ok((fds[0], fds[1]))
    }
}
