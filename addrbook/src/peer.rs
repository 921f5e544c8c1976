//! Peer address structures and network-group classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::ops::BitOr;

/// Service bits a peer advertises on the Ember network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceFlags(u64);

impl ServiceFlags {
    /// No services advertised.
    pub const NONE: ServiceFlags = ServiceFlags(0);
    /// Full node able to relay blocks and transactions.
    pub const NODE: ServiceFlags = ServiceFlags(1 << 0);
    /// Serves peer lists to bootstrapping nodes.
    pub const INTRODUCER: ServiceFlags = ServiceFlags(1 << 1);

    /// Checks whether all bits of `flags` are set.
    pub fn has(&self, flags: ServiceFlags) -> bool {
        self.0 & flags.0 == flags.0
    }

    /// Raw bit representation.
    pub fn to_u64(self) -> u64 {
        self.0
    }

    /// Build flags from a raw bit representation.
    pub fn from_u64(bits: u64) -> Self {
        ServiceFlags(bits)
    }
}

impl BitOr for ServiceFlags {
    type Output = ServiceFlags;

    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            if self.has(ServiceFlags::NODE) {
                Some("NODE")
            } else {
                None
            },
            if self.has(ServiceFlags::INTRODUCER) {
                Some("INTRODUCER")
            } else {
                None
            },
        ]
        .iter()
        .filter_map(|&name| name)
        .collect();

        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Represents the service state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerServices {
    /// Known services with specific flags.
    Known(ServiceFlags),
    /// Unknown services state.
    Unknown,
}

/// Coarse routing-prefix classification of an address.
///
/// IPv4 addresses group by their /16 prefix, IPv6 by their /32. The
/// connection scheduler caps outbound connections at one per group to keep
/// the node's topology spread across routing domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkGroup {
    /// First two octets of an IPv4 address.
    Ipv4([u8; 2]),
    /// First four octets of an IPv6 address.
    Ipv6([u8; 4]),
}

impl NetworkGroup {
    /// Classify a host address.
    ///
    /// IPv4-mapped IPv6 addresses classify by their embedded IPv4 prefix so
    /// a dual-stack peer cannot occupy two groups at once.
    pub fn of(host: &IpAddr) -> Self {
        match host {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                NetworkGroup::Ipv4([octets[0], octets[1]])
            }
            IpAddr::V6(v6) => {
                if let Some(v4) = v6.to_ipv4_mapped() {
                    let octets = v4.octets();
                    NetworkGroup::Ipv4([octets[0], octets[1]])
                } else {
                    let octets = v6.octets();
                    NetworkGroup::Ipv6([octets[0], octets[1], octets[2], octets[3]])
                }
            }
        }
    }

    /// Stable byte form used for bucket hashing.
    pub(crate) fn as_bytes(&self) -> [u8; 5] {
        match self {
            NetworkGroup::Ipv4(prefix) => [4, prefix[0], prefix[1], 0, 0],
            NetworkGroup::Ipv6(prefix) => [6, prefix[0], prefix[1], prefix[2], prefix[3]],
        }
    }
}

impl fmt::Display for NetworkGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkGroup::Ipv4(prefix) => write!(f, "{}.{}.0.0/16", prefix[0], prefix[1]),
            NetworkGroup::Ipv6(prefix) => write!(
                f,
                "{:02x}{:02x}:{:02x}{:02x}::/32",
                prefix[0], prefix[1], prefix[2], prefix[3]
            ),
        }
    }
}

/// A network-reachable peer endpoint.
///
/// Identity is `(host, port)`: equality and hashing ignore the service
/// knowledge, which varies with who reported the address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Host address of the peer.
    pub host: IpAddr,
    /// Port the peer is listening on.
    pub port: u16,
    /// Services the peer declared, if any were reported.
    pub services: PeerServices,
}

impl PeerAddress {
    /// Create a new peer address with unknown services.
    pub fn new(host: IpAddr, port: u16) -> Self {
        PeerAddress {
            host,
            port,
            services: PeerServices::Unknown,
        }
    }

    /// Create a new peer address with known services.
    pub fn with_services(host: IpAddr, port: u16, services: ServiceFlags) -> Self {
        PeerAddress {
            host,
            port,
            services: PeerServices::Known(services),
        }
    }

    /// Checks if the peer declared the specified service.
    pub fn has_service(&self, service: ServiceFlags) -> bool {
        match self.services {
            PeerServices::Known(flags) => flags.has(service),
            PeerServices::Unknown => false,
        }
    }

    /// The routing group this endpoint belongs to.
    pub fn group(&self) -> NetworkGroup {
        NetworkGroup::of(&self.host)
    }

    /// Identity key of the endpoint.
    pub fn key(&self) -> (IpAddr, u16) {
        (self.host, self.port)
    }

    /// Stable byte form of the identity, used for bucket hashing.
    pub(crate) fn key_bytes(&self) -> [u8; 19] {
        let mut bytes = [0u8; 19];
        match self.host {
            IpAddr::V4(v4) => {
                bytes[0] = 4;
                bytes[1..5].copy_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                bytes[0] = 6;
                bytes[1..17].copy_from_slice(&v6.octets());
            }
        }
        bytes[17..19].copy_from_slice(&self.port.to_le_bytes());
        bytes
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            IpAddr::V4(v4) => write!(f, "{v4}:{}", self.port),
            IpAddr::V6(v6) => write!(f, "[{v6}]:{}", self.port),
        }
    }
}
