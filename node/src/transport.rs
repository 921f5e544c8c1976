//! Collaborator seams for the transport and connection layer.
//!
//! The scheduling core decides *whom* and *when* to dial; establishing
//! connections, the protocol handshake and encryption belong to the
//! implementor of these traits. The traits return `impl Future` so mock
//! implementations can be injected in tests without boxing.

use crate::message::PeerList;
use ember_peers_addrbook::{NetworkGroup, PeerAddress};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Errors reported by a failed connection attempt.
#[derive(Debug)]
pub enum DialError {
    /// An I/O error occurred while connecting.
    Io(io::Error),
    /// The connection was established but the protocol handshake failed.
    HandshakeFailed,
    /// The peer violated the protocol after the handshake.
    ProtocolFailed,
    /// The attempt did not conclude within the transport's deadline.
    Timeout,
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialError::Io(err) => write!(f, "Connection error: {err}"),
            DialError::HandshakeFailed => write!(f, "Protocol handshake failed"),
            DialError::ProtocolFailed => write!(f, "Protocol violation after handshake"),
            DialError::Timeout => write!(f, "Connection attempt timed out"),
        }
    }
}

impl Error for DialError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DialError::Io(err) => Some(err),
            DialError::HandshakeFailed => None,
            DialError::ProtocolFailed => None,
            DialError::Timeout => None,
        }
    }
}

impl From<io::Error> for DialError {
    fn from(err: io::Error) -> Self {
        DialError::Io(err)
    }
}

/// Outbound connection establishment.
pub trait Dialer: Send + Sync + 'static {
    /// Attempt an outbound connection to `peer`.
    ///
    /// Resolves once the attempt concludes. With
    /// `disconnect_after_handshake` the session is torn down right after
    /// the protocol handshake completes; the attempt still counts as a
    /// success for the address book.
    fn dial(
        &self,
        peer: PeerAddress,
        disconnect_after_handshake: bool,
    ) -> impl Future<Output = Result<(), DialError>> + Send;

    /// Connect to `introducer`, send a [`RequestPeerList`] message,
    /// collect the [`PeerList`] response, and disconnect.
    ///
    /// [`RequestPeerList`]: crate::message::RequestPeerList
    fn request_peer_list(
        &self,
        introducer: PeerAddress,
    ) -> impl Future<Output = Result<PeerList, DialError>> + Send;
}

/// Read access to the live connection registry.
pub trait ConnectionRegistry: Send + Sync + 'static {
    /// Number of established outbound connections.
    fn outbound_count(&self) -> usize;

    /// Network groups currently used by outbound connections.
    fn outbound_groups(&self) -> HashSet<NetworkGroup>;

    /// Every connected peer, inbound and outbound.
    fn connections(&self) -> Vec<PeerAddress>;

    /// Close the connection to `peer`, if one exists.
    fn disconnect(&self, peer: &PeerAddress);

    /// Total connections in the pool.
    fn pool_size(&self) -> usize;

    /// Take ownership of an accepted inbound socket.
    fn handle_inbound(&self, stream: TcpStream, addr: SocketAddr);
}

/// Full transport collaborator: dialing plus registry access.
pub trait Transport: Dialer + ConnectionRegistry {}

impl<T: Dialer + ConnectionRegistry> Transport for T {}
