use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
};

/// Datagram sent by a session to its own receiving port to stop its listener.
///
/// The first byte (`'S'`) is not a valid message tag, so the sentinel can never be
/// mistaken for a protocol message.
pub const SHUTDOWN: [u8; 4] = *b"STOP";

/// A connectionless, unreliable datagram socket.
///
/// One clone of the transport is handed to the receiver thread, which is the only
/// caller of [`Transport::recv`]; sends may come from any thread.
pub trait Transport: Send + Sync {
    fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<()>;

    /// Blocks until one datagram arrives and returns its length.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Address at which this transport receives its own datagrams.
    fn loopback_addr(&self) -> io::Result<SocketAddr> {
        let mut addr = self.local_addr()?;
        if addr.ip().is_unspecified() {
            let ip = match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            addr.set_ip(ip);
        }
        Ok(addr)
    }
}

impl Transport for UdpSocket {
    fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<()> {
        let sent = UdpSocket::send_to(self, datagram, target)?;
        if sent != datagram.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("datagram truncated: sent {sent} of {} bytes", datagram.len()),
            ));
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (len, _) = self.recv_from(buf)?;
        Ok(len)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Binds an ephemeral client socket in the same address family as `server`.
pub(crate) fn bind_for(server: SocketAddr) -> io::Result<UdpSocket> {
    let any: SocketAddr = match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    UdpSocket::bind(any)
}
