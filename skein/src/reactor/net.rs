//! Non-blocking TCP on top of the reactor.

use crate::reactor::{Async, Reactor};
use std::io::{self, Read, Write};
use std::net::{self, Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Convert a `SocketAddr` to a raw `(sockaddr_storage, socklen_t)` pair.
fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Pending socket error after a non-blocking connect.
fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

    let res = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if res < 0 {
        Err(io::Error::last_os_error())
    } else if error != 0 {
        Err(io::Error::from_raw_os_error(error))
    } else {
        Ok(())
    }
}

fn create_socket(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    set_nonblocking(owned.as_raw_fd())?;
    Ok(owned)
}

#[derive(Debug)]
pub(crate) struct TcpStream {
    io: Async<net::TcpStream>,
}

impl TcpStream {
    pub(crate) async fn connect(reactor: &Arc<Reactor>, addr: SocketAddr) -> io::Result<Self> {
        let fd = create_socket(&addr)?;
        let raw = fd.as_raw_fd();

        let (raw_addr, addr_len) = socket_addr_to_raw(&addr);
        let res = unsafe {
            libc::connect(raw, &raw_addr as *const _ as *const libc::sockaddr, addr_len)
        };

        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err);
            }
        }

        let io = Async::new(reactor, net::TcpStream::from(fd));

        if res != 0 {
            io.writable().await?;
            take_socket_error(raw)?;
        }

        Ok(Self { io })
    }

    pub(crate) fn from_std(reactor: &Arc<Reactor>, stream: net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            io: Async::new(reactor, stream),
        })
    }

    /// Returns 0 on EOF.
    pub(crate) async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.io
            .read_with(|mut stream| loop {
                match stream.read(buf) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    res => return res,
                }
            })
            .await
    }

    pub(crate) async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self
                .io
                .write_with(|mut stream| stream.write(buf))
                .await?;

            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            buf = &buf[n..];
        }

        Ok(())
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.io.get_ref().peer_addr()
    }

    pub(crate) fn shutdown(&self) -> io::Result<()> {
        match self.io.get_ref().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            res => res,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TcpListener {
    io: Async<net::TcpListener>,
}

impl TcpListener {
    pub(crate) fn bind(reactor: &Arc<Reactor>, addr: SocketAddr) -> io::Result<Self> {
        let listener = net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            io: Async::new(reactor, listener),
        })
    }

    pub(crate) async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.io.read_with(|listener| listener.accept()).await?;
        let stream = TcpStream::from_std(self.io.reactor(), stream)?;
        Ok((stream, peer))
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.get_ref().local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::with_reactor;
    use futures::executor::block_on;

    #[test]
    fn test_connect_accept_echo() -> anyhow::Result<()> {
        with_reactor(|reactor| {
            let listener = TcpListener::bind(reactor, "127.0.0.1:0".parse()?)?;
            let addr = listener.local_addr()?;

            block_on(async {
                let client = TcpStream::connect(reactor, addr).await?;
                let (server, peer) = listener.accept().await?;
                assert_eq!(peer, client.io.get_ref().local_addr()?);

                client.write_all(b"ping").await?;

                let mut buf = [0u8; 4];
                let mut read = 0;
                while read < buf.len() {
                    read += server.read(&mut buf[read..]).await?;
                }
                assert_eq!(&buf, b"ping");

                client.shutdown()?;
                assert_eq!(server.read(&mut buf).await?, 0);
                Ok(())
            })
        })
    }

    #[test]
    fn test_connect_refused() -> anyhow::Result<()> {
        with_reactor(|reactor| {
            // Bind then drop to get a port nobody listens on.
            let addr = net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;

            let err = block_on(TcpStream::connect(reactor, addr)).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
            Ok(())
        })
    }
}
