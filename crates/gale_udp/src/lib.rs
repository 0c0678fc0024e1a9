//! UDP socket driver for gale.
//!
//! One non-blocking [`UdpSocket`] per driver, owned by the endpoint that
//! runs on it; there is no process-global socket state. Servers bind a known
//! port, clients bind an OS-assigned one. Datagrams are drained without
//! blocking on every poll, and sending never blocks: a send the OS is not
//! ready for is treated like any other lost datagram.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
};

use gale::Driver;
use tracing::debug;

/// Error from the UDP transport.
#[derive(Debug, thiserror::Error)]
pub enum UdpError {
    /// Driver was used before [`Driver::start`] or after [`Driver::stop`].
    #[error("socket not open")]
    NotOpen,
    /// The socket call failed.
    #[error("socket error")]
    Io(#[from] io::Error),
}

/// [`Driver`] implementation over a non-blocking UDP socket.
#[derive(Debug)]
pub struct UdpDriver {
    bind_addr: SocketAddr,
    socket: Option<UdpSocket>,
}

impl UdpDriver {
    /// Driver for a client: binds an OS-assigned port on all interfaces.
    ///
    /// # Panics
    ///
    /// Never; the unspecified address always parses.
    #[must_use]
    pub fn client() -> Self {
        Self::bound("0.0.0.0:0".parse().expect("valid bind address"))
    }

    /// Driver for a server listening on `port`, on all interfaces.
    #[must_use]
    pub fn server(port: u16) -> Self {
        Self::bound(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    /// Driver bound to an explicit local address.
    #[must_use]
    pub const fn bound(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            socket: None,
        }
    }

    /// Local address of the open socket. Useful with an OS-assigned port.
    ///
    /// # Errors
    ///
    /// Errors if the driver is not started.
    pub fn local_addr(&self) -> Result<SocketAddr, UdpError> {
        Ok(self.socket.as_ref().ok_or(UdpError::NotOpen)?.local_addr()?)
    }
}

impl Driver for UdpDriver {
    type Peer = SocketAddr;
    type Error = UdpError;

    fn start(&mut self) -> Result<(), Self::Error> {
        let socket = UdpSocket::bind(self.bind_addr)?;
        socket.set_nonblocking(true)?;
        debug!(addr = ?socket.local_addr(), "socket open");
        self.socket = Some(socket);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(socket) = self.socket.take() {
            debug!(addr = ?socket.local_addr(), "socket closed");
        }
    }

    fn poll_recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, Self::Error> {
        let socket = self.socket.as_ref().ok_or(UdpError::NotOpen)?;
        match socket.recv_from(buf) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // a remote port answering with ICMP unreachable surfaces here on
            // some platforms; that is link noise, not a socket failure
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn send_to(&mut self, peer: SocketAddr, datagram: &[u8]) -> Result<(), Self::Error> {
        let socket = self.socket.as_ref().ok_or(UdpError::NotOpen)?;
        match socket.send_to(datagram, peer) {
            Ok(_) => Ok(()),
            // full send buffer loses the datagram, like the network would
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn not_open_before_start() {
        let mut driver = UdpDriver::client();
        let mut buf = [0u8; 16];
        assert_matches!(driver.poll_recv(&mut buf), Err(UdpError::NotOpen));
        assert_matches!(driver.local_addr(), Err(UdpError::NotOpen));
    }

    #[test]
    fn start_assigns_port() {
        let mut driver = UdpDriver::client();
        driver.start().unwrap();
        assert_ne!(0, driver.local_addr().unwrap().port());
        driver.stop();
        assert_matches!(driver.local_addr(), Err(UdpError::NotOpen));
    }

    #[test]
    fn loopback_datagram() {
        let mut a = UdpDriver::bound("127.0.0.1:0".parse().unwrap());
        let mut b = UdpDriver::bound("127.0.0.1:0".parse().unwrap());
        a.start().unwrap();
        b.start().unwrap();
        let to = b.local_addr().unwrap();

        a.send_to(to, b"ping").unwrap();

        let mut buf = [0u8; 16];
        let mut got = None;
        // non-blocking; give the loopback a few tries
        for _ in 0..100 {
            if let Some((len, from)) = b.poll_recv(&mut buf).unwrap() {
                got = Some((buf[..len].to_vec(), from));
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let (data, from) = got.expect("datagram should arrive on loopback");
        assert_eq!(b"ping", &data[..]);
        assert_eq!(a.local_addr().unwrap(), from);
    }
}
