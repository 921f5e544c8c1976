//! Bucketed peer address book for the Ember network.
//!
//! Maintains a bounded, churn-resistant view of reachable addresses split
//! into unverified (*new*) and confirmed (*tried*) tables, and the policy
//! for choosing which of them to dial next.

mod book;
mod peer;
mod random;
mod selector;
pub mod time;

pub use book::{
    AddressBook, AddressBookConfig, ExtendedPeerInfo, BUCKET_SIZE, COLLISION_GRACE_SECS,
    COLLISION_STALENESS_SECS, NEW_BUCKET_COUNT, TRIED_BUCKET_COUNT,
};
pub use peer::{NetworkGroup, PeerAddress, PeerServices, ServiceFlags};
pub use random::{RandomSource, StdRandom};
pub use selector::{
    PeerSelector, DEFAULT_BACKOFF_OVERRIDE_AFTER, DEFAULT_DIAL_BACKOFF, DEFAULT_RETRY_BUDGET,
};
