// src/syscalls.rs
use crate::error::KilnResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ptr;

// ---- Socket Operations ----

fn set_reuseaddr(fd: c_int) -> io::Result<()> {
    let optval: c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const c_void,
            mem::size_of_val(&optval) as socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a non-blocking TCP listener on `0.0.0.0:port` with SO_REUSEADDR.
///
/// Port `0` asks the kernel for an ephemeral port; use [`local_port`] to
/// find out which one was picked.
pub fn create_listen_socket(port: u16, backlog: c_int) -> KilnResult<c_int> {
    unsafe {
        // 1. Create socket
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // 2. Allow quick restarts on the same port
        if let Err(err) = set_reuseaddr(fd) {
            libc::close(fd);
            return Err(err.into());
        }

        // 3. Bind
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(Ipv4Addr::UNSPECIFIED.octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // 4. Listen
        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// The port a bound socket ended up on.
pub fn local_port(fd: c_int) -> KilnResult<u16> {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
    let rc = unsafe { libc::getsockname(fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(u16::from_be(sin.sin_port))
}

/// Accept one pending connection.
///
/// Returns `Ok(None)` once the backlog is drained. The accepted socket is
/// left blocking; [`prepare_stream`] switches it to non-blocking mode when
/// it is registered.
pub fn accept_connection(listen_fd: c_int) -> KilnResult<Option<(c_int, SocketAddrV4)>> {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
    loop {
        let fd = unsafe {
            libc::accept4(
                listen_fd,
                &mut sin as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_CLOEXEC,
            )
        };

        if fd >= 0 {
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            return Ok(Some((fd, SocketAddrV4::new(ip, u16::from_be(sin.sin_port)))));
        }

        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            // The peer gave up between SYN and accept; nothing to hand out.
            io::ErrorKind::ConnectionAborted => continue,
            _ => return Err(err.into()),
        }
    }
}

/// SO_REUSEADDR plus O_NONBLOCK on an accepted socket.
pub fn prepare_stream(fd: c_int) -> KilnResult<()> {
    set_reuseaddr(fd)?;
    set_nonblocking(fd)
}

pub fn set_nonblocking(fd: c_int) -> KilnResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

pub fn close_fd(fd: c_int) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Ignore SIGPIPE process-wide so writes to a half-closed peer surface as
/// `EPIPE` instead of killing the process.
pub fn ignore_sigpipe() -> KilnResult<()> {
    let prev = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if prev == libc::SIG_ERR {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Soft `RLIMIT_NOFILE`: every descriptor the process can hold is below it.
pub fn descriptor_limit() -> usize {
    let mut rl: libc::rlimit = unsafe { mem::zeroed() };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } < 0 {
        return 1024;
    }
    usize::try_from(rl.rlim_cur).unwrap_or(usize::MAX)
}

// ---- Non-blocking reads and writes ----

/// Read into `buf`. `Ok(None)` means the socket would block, `Ok(Some(0))`
/// means the peer closed its side.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> KilnResult<Option<usize>> {
    loop {
        let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

/// Vectored write of up to eight segments in one syscall. `Ok(None)` means
/// the socket buffer is full.
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> KilnResult<Option<usize>> {
    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let mut iov_count = 0;
    for buf in bufs.iter().filter(|b| !b.is_empty()).take(iovecs.len()) {
        iovecs[iov_count] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        iov_count += 1;
    }
    if iov_count == 0 {
        return Ok(Some(0));
    }

    loop {
        let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iov_count as c_int) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

// ---- Epoll Operations ----

/// What a connection wants to be woken up for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    fn bits(self) -> u32 {
        match self {
            Interest::Read => libc::EPOLLIN as u32,
            Interest::Write => libc::EPOLLOUT as u32,
        }
    }
}

const ONESHOT_FLAGS: u32 = (libc::EPOLLET | libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32;

/// A single readiness notification, copied out of the kernel's event array.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub token: u64,
    bits: u32,
}

impl Readiness {
    pub fn new(token: u64, bits: u32) -> Self {
        Self { token, bits }
    }

    pub fn is_readable(&self) -> bool {
        self.bits & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.bits & libc::EPOLLOUT as u32 != 0
    }

    /// Peer hang-up (full or read side) or a socket error.
    pub fn is_hangup(&self) -> bool {
        self.bits & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
    }
}

pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> KilnResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { fd })
    }

    fn ctl(&self, op: c_int, fd: c_int, token: u64, events: u32) -> KilnResult<()> {
        let mut event = libc::epoll_event { events, u64: token };
        if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Register the listening socket. Level-triggered and persistent: the
    /// reactor drains the accept backlog on every wakeup anyway.
    pub fn add_listener(&self, fd: c_int, token: u64) -> KilnResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, libc::EPOLLIN as u32)
    }

    /// Register a connection edge-triggered and one-shot: after one event
    /// the descriptor stays silent until [`Epoll::rearm`] is called.
    pub fn add_oneshot(&self, fd: c_int, token: u64, interest: Interest) -> KilnResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest.bits() | ONESHOT_FLAGS)
    }

    pub fn rearm(&self, fd: c_int, token: u64, interest: Interest) -> KilnResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest.bits() | ONESHOT_FLAGS)
    }

    pub fn delete(&self, fd: c_int) -> KilnResult<()> {
        if unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Block until at least one event is ready or `timeout_ms` elapses.
    /// Appends to `out` (cleared first). EINTR yields an empty batch.
    pub fn wait(
        &self,
        events: &mut [libc::epoll_event],
        out: &mut Vec<Readiness>,
        timeout_ms: i32,
    ) -> KilnResult<usize> {
        out.clear();
        let res = unsafe {
            libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as c_int, timeout_ms)
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err.into());
        }
        for ev in &events[..res as usize] {
            // epoll_event is packed on x86_64; copy the fields out by value.
            let (bits, token) = (ev.events, ev.u64);
            out.push(Readiness::new(token, bits));
        }
        Ok(res as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        close_fd(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;
    use std::os::fd::IntoRawFd;

    fn empty_events(n: usize) -> Vec<libc::epoll_event> {
        vec![libc::epoll_event { events: 0, u64: 0 }; n]
    }

    #[test]
    fn descriptor_limit_covers_open_descriptors() {
        let listen_fd = create_listen_socket(0, 5).unwrap();
        assert!((listen_fd as usize) < descriptor_limit());
        close_fd(listen_fd);
    }

    #[test]
    fn readiness_flags() {
        let r = Readiness::new(7, (libc::EPOLLIN | libc::EPOLLRDHUP) as u32);
        assert!(r.is_readable());
        assert!(!r.is_writable());
        assert!(r.is_hangup());
        assert_eq!(r.token, 7);
    }

    #[test]
    fn oneshot_fires_once_until_rearmed() {
        let listen_fd = create_listen_socket(0, 5).unwrap();
        let port = local_port(listen_fd).unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let (fd, peer) = loop {
            if let Some(pair) = accept_connection(listen_fd).unwrap() {
                break pair;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };
        assert_eq!(*peer.ip(), Ipv4Addr::LOCALHOST);
        prepare_stream(fd).unwrap();

        let epoll = Epoll::new().unwrap();
        epoll.add_oneshot(fd, fd as u64, Interest::Read).unwrap();
        let mut events = empty_events(8);
        let mut ready = Vec::new();

        client.write_all(b"ping").unwrap();
        assert_eq!(epoll.wait(&mut events, &mut ready, 1000).unwrap(), 1);
        assert!(ready[0].is_readable());

        // Disarmed: more data produces no event.
        client.write_all(b"pong").unwrap();
        assert_eq!(epoll.wait(&mut events, &mut ready, 50).unwrap(), 0);

        // Re-arming reports the still-unread bytes.
        epoll.rearm(fd, fd as u64, Interest::Read).unwrap();
        assert_eq!(epoll.wait(&mut events, &mut ready, 1000).unwrap(), 1);

        let mut buf = [0u8; 16];
        assert_eq!(read_nonblocking(fd, &mut buf).unwrap(), Some(8));
        assert_eq!(read_nonblocking(fd, &mut buf).unwrap(), None);

        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(read_nonblocking(fd, &mut buf).unwrap(), Some(0));

        epoll.delete(fd).unwrap();
        close_fd(fd);
        close_fd(listen_fd);
    }

    #[test]
    fn writev_skips_empty_segments() {
        let listen_fd = create_listen_socket(0, 5).unwrap();
        let port = local_port(listen_fd).unwrap();
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let fd = client.into_raw_fd();
        assert_eq!(writev_nonblocking(fd, &[b"", b""]).unwrap(), Some(0));
        assert_eq!(writev_nonblocking(fd, &[b"ab", b"", b"cd"]).unwrap(), Some(4));
        close_fd(fd);
        close_fd(listen_fd);
    }
}
