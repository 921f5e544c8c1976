//! Dial-candidate policy over the address book.
//!
//! The selector turns raw address-book draws into a scheduling decision:
//! feeler iterations test pending collision occupants first, ordinary
//! iterations keep outbound connections spread across network groups, and
//! recently attempted addresses are skipped until the pool runs thin.

use crate::book::{AddressBook, ExtendedPeerInfo};
use crate::peer::{NetworkGroup, PeerAddress};
use crate::random::RandomSource;
use std::collections::HashSet;
use std::time::Duration;

/// Candidates attempted more recently than this are skipped.
pub const DEFAULT_DIAL_BACKOFF: Duration = Duration::from_secs(600);
/// Candidate draws per scheduling decision before giving up.
pub const DEFAULT_RETRY_BUDGET: u32 = 100;
/// Rejections after which the recency backoff no longer applies, so a
/// small pool cannot starve the dial loop.
pub const DEFAULT_BACKOFF_OVERRIDE_AFTER: u32 = 30;

/// Stateless dial-candidate policy.
#[derive(Debug, Clone)]
pub struct PeerSelector {
    dial_backoff: Duration,
    retry_budget: u32,
    backoff_override_after: u32,
}

impl Default for PeerSelector {
    fn default() -> Self {
        PeerSelector {
            dial_backoff: DEFAULT_DIAL_BACKOFF,
            retry_budget: DEFAULT_RETRY_BUDGET,
            backoff_override_after: DEFAULT_BACKOFF_OVERRIDE_AFTER,
        }
    }
}

impl PeerSelector {
    /// Selector with the default policy constants.
    pub fn new() -> Self {
        PeerSelector::default()
    }

    /// Override the recency backoff window.
    pub fn with_dial_backoff(mut self, backoff: Duration) -> Self {
        self.dial_backoff = backoff;
        self
    }

    /// Override the per-decision draw budget.
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Override the rejection count that lifts the recency backoff.
    pub fn with_backoff_override_after(mut self, rejections: u32) -> Self {
        self.backoff_override_after = rejections;
        self
    }

    /// Whether `info` is still inside its retry backoff window.
    pub fn is_backed_off(&self, info: &ExtendedPeerInfo, now: u64) -> bool {
        info.last_try() > 0
            && now.saturating_sub(info.last_try()) < self.dial_backoff.as_secs()
    }

    /// Pick the next address to dial, or none if the book cannot offer an
    /// eligible candidate within the draw budget.
    ///
    /// Feeler iterations prefer the occupant of a pending tried-slot
    /// collision and are exempt from group diversity. Ordinary iterations
    /// reject candidates whose network group is already used by an
    /// outbound connection.
    pub fn next_candidate(
        &self,
        book: &AddressBook,
        is_feeler: bool,
        occupied_groups: &HashSet<NetworkGroup>,
        now: u64,
        rng: &mut dyn RandomSource,
    ) -> Option<PeerAddress> {
        let mut tries = 0u32;
        loop {
            let info = if is_feeler {
                book.select_tried_collision()
                    .or_else(|| book.select_peer(true, now, rng))
            } else {
                book.select_peer(false, now, rng)
            };
            let info = info?;
            tries += 1;
            if tries > self.retry_budget {
                return None;
            }
            if !is_feeler && occupied_groups.contains(&info.peer().group()) {
                continue;
            }
            if self.is_backed_off(&info, now) && tries < self.backoff_override_after {
                continue;
            }
            return Some(info.peer().clone());
        }
    }
}
