//! Multicast discovery shared by the service and the client.
//!
//! Services periodically send `mnc,<tag>,<ip:port>[,<ip:port>...]` to a
//! well-known group. Clients listen for a bounded window and keep the
//! endpoint list of the most recent announcement carrying their tag.

use std::{
    fmt,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    str::FromStr,
    thread,
    time::{Duration, Instant},
};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const ANNOUNCE_MARKER: &str = "mnc";
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(225, 5, 5, 5);
pub const DEFAULT_PORT: u16 = 4555;
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LISTEN_WINDOW: Duration = Duration::from_secs(20);
pub const MATCH_THROTTLE: Duration = Duration::from_millis(100);

/// Largest announcement a service may send and a listener will accept.
pub const MAX_DATAGRAM: usize = 1024;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Multicast group announcements are sent to.
    pub group: Ipv4Addr,
    pub port: u16,
    /// How often a service announces itself.
    pub announce_interval: Duration,
    /// Pause after each matching announcement before reading again.
    pub throttle: Duration,
    pub ttl: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            throttle: MATCH_THROTTLE,
            ttl: 1,
        }
    }
}

impl DiscoveryConfig {
    pub fn group_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

/// One reachable service instance, `address:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        self.0
            .parse()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl FromStr for Endpoint {
    type Err = AnnouncementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s
            .parse()
            .map_err(|_| AnnouncementError::BadEndpoint(s.to_string()))?;
        Ok(Self::from(addr))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnouncementError {
    #[error("announcement has too few fields")]
    TooShort,
    #[error("unexpected marker `{0}`")]
    BadMarker(String),
    #[error("`{0}` is not an ip:port endpoint")]
    BadEndpoint(String),
}

/// The text carried by one discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub tag: String,
    pub endpoints: Vec<Endpoint>,
}

impl Announcement {
    pub fn new(tag: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            tag: tag.into(),
            endpoints,
        }
    }

    pub fn parse(text: &str) -> Result<Self, AnnouncementError> {
        let mut fields = text.trim().split(',');
        let marker = fields.next().unwrap_or_default();
        if marker != ANNOUNCE_MARKER {
            return Err(AnnouncementError::BadMarker(marker.to_string()));
        }
        let tag = fields.next().ok_or(AnnouncementError::TooShort)?;

        let mut endpoints: Vec<Endpoint> = Vec::new();
        for field in fields {
            let endpoint = field.parse()?;
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }
        if endpoints.is_empty() {
            return Err(AnnouncementError::TooShort);
        }

        Ok(Self::new(tag, endpoints))
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ANNOUNCE_MARKER},{}", self.tag)?;
        for endpoint in &self.endpoints {
            write!(f, ",{endpoint}")?;
        }
        Ok(())
    }
}

/// Opens a socket on the group port and joins the group on all interfaces.
///
/// Address reuse is enabled so several listeners on one host can coexist.
pub fn join_group(config: &DiscoveryConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));
    socket.bind(&bind_addr.into())?;

    let socket: UdpSocket = socket.into();
    socket.join_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}

/// Socket used by a service to send announcements.
pub fn announce_socket(config: &DiscoveryConfig) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_multicast_ttl_v4(config.ttl)?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}

/// Joins the group and listens for `window`, returning the endpoint set of
/// the last matching announcement. Any failure yields an empty set.
pub fn discover(tag: &str, window: Duration, config: &DiscoveryConfig) -> Vec<Endpoint> {
    if window.is_zero() {
        return Vec::new();
    }

    let socket = match join_group(config) {
        Ok(socket) => socket,
        Err(error) => {
            warn!(group = %config.group_addr(), ?error, "failed to join discovery group");
            return Vec::new();
        }
    };

    let endpoints = listen(&socket, tag, window, config.throttle);
    if let Err(error) = socket.leave_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED) {
        debug!(?error, "failed to leave discovery group");
    }
    endpoints
}

/// Reads announcements from `socket` until `window` elapses.
///
/// Every matching announcement replaces the set gathered so far.
pub fn listen(socket: &UdpSocket, tag: &str, window: Duration, throttle: Duration) -> Vec<Endpoint> {
    let deadline = Instant::now() + window;
    let mut endpoints = Vec::new();
    // One spare byte tells an oversized datagram apart from one that fits.
    let mut buf = [0u8; MAX_DATAGRAM + 1];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if let Err(error) = socket.set_read_timeout(Some(remaining)) {
            warn!(?error, "failed to arm discovery timeout");
            break;
        }

        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(error) => {
                warn!(?error, "discovery receive failed");
                break;
            }
        };

        if len > MAX_DATAGRAM {
            debug!(%from, "ignoring oversized announcement");
            continue;
        }

        let text = String::from_utf8_lossy(&buf[..len]);
        match Announcement::parse(&text) {
            Ok(announcement) if announcement.tag == tag => {
                info!(%from, tag, servers = announcement.endpoints.len(), "discovered service");
                endpoints = announcement.endpoints;
                thread::sleep(throttle.min(deadline.saturating_duration_since(Instant::now())));
            }
            Ok(announcement) => {
                debug!(%from, tag = %announcement.tag, "ignoring announcement for another tag");
            }
            Err(error) => {
                debug!(%from, %error, "ignoring malformed announcement");
            }
        }
    }

    endpoints
}
