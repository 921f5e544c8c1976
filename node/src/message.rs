//! Peer-list protocol records.
//!
//! Plain data carried by the protocol layer; the scheduling core only
//! consumes the decoded address list.

use ember_peers_addrbook::PeerAddress;
use serde::{Deserialize, Serialize};

/// Ask a peer for the addresses it knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPeerList;

/// Batch of peer addresses sent in response to [`RequestPeerList`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerList {
    /// Addresses in the order the responder chose to reveal them.
    pub peers: Vec<PeerAddress>,
}
