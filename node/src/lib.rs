//! Connection scheduling and lifecycle supervision for Ember network
//! nodes.
//!
//! Decides whom and when to dial — outbound target maintenance, Poisson
//! feeler probing, network-group diversity, introducer bootstrap — and
//! supervises every background task of the networking layer as one unit.
//! The transport itself (TCP, handshake, encryption) is consumed through
//! the traits in [`transport`](Transport).

mod config;
mod introducer;
mod message;
mod reconnect;
mod scheduler;
mod service;
mod transport;

pub use config::{
    Config, DEFAULT_FEELER_AVERAGE_INTERVAL, DEFAULT_INTRODUCER_POLL_INTERVAL,
    DEFAULT_POLL_INTERVAL, DEFAULT_SHUTDOWN_GRACE, DEFAULT_STALE_AGE,
    DEFAULT_STALE_FAILURE_THRESHOLD, DEFAULT_TARGET_OUTBOUND,
};
pub use introducer::IntroducerPoller;
pub use message::{PeerList, RequestPeerList};
pub use reconnect::start_reconnect_task;
pub use scheduler::ConnectionScheduler;
pub use service::{
    NodeApi, RpcCleanup, Service, ServiceBuilder, ServiceError, ServiceState, StopHandle,
    SupportsServerBinding,
};
pub use transport::{ConnectionRegistry, DialError, Dialer, Transport};

// Re-exports.
pub use ember_peers_addrbook::{
    AddressBook, AddressBookConfig, ExtendedPeerInfo, NetworkGroup, PeerAddress, PeerSelector,
    PeerServices, RandomSource, ServiceFlags, StdRandom,
};

/// Address book shared by the scheduler, the introducer poller and any
/// inbound handler that learns new addresses.
pub type SharedAddressBook = std::sync::Arc<tokio::sync::Mutex<AddressBook>>;
