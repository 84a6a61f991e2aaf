//! Ground link transport: a single unacknowledged UDP socket and the
//! destination it sends to.

use crate::error::OutputError;
use arrayvec::ArrayString;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use tracing::info;

pub const IP_STR_LEN: usize = 16;
pub const DEFAULT_TLM_PORT: u16 = 1235;
const UNSET_DEST_IP: &str = "000.000.000.000";

pub type IpString = ArrayString<IP_STR_LEN>;

pub trait DatagramSocket {
    fn send_to(&mut self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;

    /// Identifier reported in housekeeping.
    fn socket_id(&self) -> u16;
}

pub trait SocketFactory {
    type Socket: DatagramSocket;

    fn open(&mut self) -> io::Result<Self::Socket>;
}

/// Non-blocking UDP socket bound to an ephemeral port.
#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: UdpSocket,
    id: u16,
}

impl DatagramSocket for UdpDatagramSocket {
    fn send_to(&mut self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, dest)
    }

    fn socket_id(&self) -> u16 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UdpSocketFactory;

impl SocketFactory for UdpSocketFactory {
    type Socket = UdpDatagramSocket;

    fn open(&mut self) -> io::Result<Self::Socket> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        let id = socket.local_addr()?.port();
        Ok(UdpDatagramSocket { socket, id })
    }
}

/// Whether a send error leaves the link usable. Such errors drop the packet
/// but do not latch suppression.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Where downlinked packets go. The socket is opened on the first enable and
/// kept until shutdown; later enables only retarget it.
#[derive(Debug)]
pub struct Destination<S: DatagramSocket> {
    ip: IpString,
    addr: Option<SocketAddr>,
    port: u16,
    socket: Option<S>,
    suppress_send: bool,
}

impl<S: DatagramSocket> Destination<S> {
    pub fn new(port: u16) -> Self {
        let mut ip = IpString::new();
        ip.push_str(UNSET_DEST_IP);
        Self {
            ip,
            addr: None,
            port,
            socket: None,
            suppress_send: true,
        }
    }

    /// Enable output to `dest_ip`, opening the socket through `factory` if
    /// none is open yet. Nothing changes if the address or the socket open is
    /// rejected. Returns true when a new socket was opened.
    pub fn enable<F>(&mut self, factory: &mut F, dest_ip: &str) -> Result<bool, OutputError>
    where
        F: SocketFactory<Socket = S>,
    {
        let trimmed = dest_ip.trim();
        let ipv4: Ipv4Addr = trimmed
            .parse()
            .map_err(|_| OutputError::InvalidAddress(dest_ip.to_string()))?;
        let ip = IpString::from(trimmed).map_err(|_| OutputError::InvalidAddress(dest_ip.to_string()))?;

        let opened = if self.socket.is_none() {
            let socket = factory.open().map_err(OutputError::SocketOpen)?;
            info!(socket_id = socket.socket_id(), "telemetry output socket opened");
            self.socket = Some(socket);
            true
        } else {
            false
        };

        self.ip = ip;
        self.addr = Some(SocketAddr::V4(SocketAddrV4::new(ipv4, self.port)));
        self.suppress_send = false;

        Ok(opened)
    }

    /// Send one datagram. Callers check [`Destination::can_send`] first.
    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match (self.socket.as_mut(), self.addr) {
            (Some(socket), Some(addr)) => socket.send_to(buf, addr),
            _ => Err(io::Error::new(io::ErrorKind::NotConnected, "telemetry output disabled")),
        }
    }

    /// Latch send suppression after a transport failure. Only a new enable clears it.
    pub fn suppress(&mut self) {
        self.suppress_send = true;
    }

    pub fn can_send(&self) -> bool {
        self.downlink_enabled() && !self.suppress_send
    }

    pub fn downlink_enabled(&self) -> bool {
        self.socket.is_some()
    }

    pub fn suppress_send(&self) -> bool {
        self.suppress_send
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_id(&self) -> u16 {
        self.socket.as_ref().map_or(0, |socket| socket.socket_id())
    }

    /// Close the socket. Safe to call more than once; only the first call closes.
    pub fn close(&mut self) -> bool {
        match self.socket.take() {
            Some(socket) => {
                info!(socket_id = socket.socket_id(), ip = %self.ip, "closing telemetry output socket");
                drop(socket);
                self.suppress_send = true;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NullSocket(u16);

    impl DatagramSocket for NullSocket {
        fn send_to(&mut self, buf: &[u8], _dest: SocketAddr) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn socket_id(&self) -> u16 {
            self.0
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        opened: u16,
        fail: bool,
    }

    impl SocketFactory for CountingFactory {
        type Socket = NullSocket;

        fn open(&mut self) -> io::Result<NullSocket> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "no sockets"));
            }
            self.opened += 1;
            Ok(NullSocket(100 + self.opened))
        }
    }

    #[test]
    fn test_enable_opens_socket_once() {
        let mut factory = CountingFactory::default();
        let mut dest = Destination::new(DEFAULT_TLM_PORT);
        assert!(!dest.downlink_enabled());
        assert!(!dest.can_send());

        assert!(dest.enable(&mut factory, "127.0.0.1").unwrap());
        assert!(!dest.enable(&mut factory, "10.0.0.2").unwrap());

        assert_eq!(factory.opened, 1);
        assert_eq!(dest.ip(), "10.0.0.2");
        assert_eq!(dest.socket_id(), 101);
        assert!(dest.can_send());
    }

    #[test]
    fn test_invalid_address_changes_nothing() {
        let mut factory = CountingFactory::default();
        let mut dest = Destination::new(DEFAULT_TLM_PORT);

        assert!(matches!(
            dest.enable(&mut factory, "ground.station"),
            Err(OutputError::InvalidAddress(_))
        ));
        assert_eq!(factory.opened, 0);
        assert_eq!(dest.ip(), UNSET_DEST_IP);
        assert!(!dest.downlink_enabled());
    }

    #[test]
    fn test_socket_open_failure_leaves_downlink_disabled() {
        let mut factory = CountingFactory { opened: 0, fail: true };
        let mut dest = Destination::new(DEFAULT_TLM_PORT);

        assert!(matches!(dest.enable(&mut factory, "127.0.0.1"), Err(OutputError::SocketOpen(_))));
        assert!(!dest.downlink_enabled());
        assert!(dest.suppress_send());
    }

    #[test]
    fn test_suppress_latches_until_enable() {
        let mut factory = CountingFactory::default();
        let mut dest = Destination::new(DEFAULT_TLM_PORT);
        dest.enable(&mut factory, "127.0.0.1").unwrap();

        dest.suppress();
        assert!(!dest.can_send());

        dest.enable(&mut factory, "127.0.0.1").unwrap();
        assert!(dest.can_send());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut factory = CountingFactory::default();
        let mut dest = Destination::new(DEFAULT_TLM_PORT);
        dest.enable(&mut factory, "127.0.0.1").unwrap();

        assert!(dest.close());
        assert!(!dest.close());
        assert!(!dest.downlink_enabled());
        assert_eq!(dest.socket_id(), 0);
    }

    #[test]
    fn test_send_error_kinds() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::NetworkUnreachable)));
    }
}
