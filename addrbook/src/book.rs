//! Bucketed storage of known peer addresses.
//!
//! The book is split into a *new* table of unverified candidates and a
//! *tried* table of addresses that completed a handshake at least once.
//! Bucket placement is a keyed hash of the address's network group (and,
//! for the new table, the group of the address's source), so a single
//! routing prefix cannot flood either table. Promotion into an occupied
//! tried slot is deferred through a collision record, giving the occupant
//! a grace window to reconfirm liveness before it is displaced.

use crate::peer::{NetworkGroup, PeerAddress, PeerServices};
use crate::random::RandomSource;
use log::debug;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::IpAddr;

/// Number of buckets in the new table.
pub const NEW_BUCKET_COUNT: u32 = 1024;
/// Number of buckets in the tried table.
pub const TRIED_BUCKET_COUNT: u32 = 256;
/// Slots per bucket in either table.
pub const BUCKET_SIZE: u32 = 64;

/// How many tried buckets the addresses of one network group can map into.
const TRIED_BUCKETS_PER_GROUP: u64 = 8;
/// How many new buckets the addresses told by one source group can map into.
const NEW_BUCKETS_PER_SOURCE_GROUP: u64 = 64;
/// Maximum new-table buckets a single address may be referenced from.
const MAX_NEW_BUCKETS_PER_ADDRESS: usize = 8;

/// A tried occupant whose last success is older than this is considered
/// stale when resolving slot collisions.
pub const COLLISION_STALENESS_SECS: u64 = 4 * 60 * 60;
/// Minimum collision age before a stale occupant can be displaced.
pub const COLLISION_GRACE_SECS: u64 = 40 * 60;

/// An attempt within this window shields an entry from eviction.
const RECENT_TRY_SECS: u64 = 60;
/// Entries unseen for longer than the horizon are eviction fodder.
const HORIZON_SECS: u64 = 30 * 24 * 60 * 60;
/// Failed attempts, without a single success, before an entry is judged
/// low value.
const MAX_UNTRIED_RETRIES: u32 = 3;
/// Selection penalty window for recently tried addresses.
const SELECT_RECENT_TRY_SECS: u64 = 600;

/// Hard cap on a gossip sample.
const GOSSIP_SAMPLE_MAX: usize = 1000;
/// Share of the book a single gossip sample may reveal.
const GOSSIP_SAMPLE_SHARE: f64 = 0.23;

/// Tunables of the address book.
#[derive(Debug, Clone)]
pub struct AddressBookConfig {
    /// Probability of drawing from the tried table when both tables are
    /// non-empty.
    pub tried_bias: f64,
    /// Failed attempts before an entry becomes a removal candidate.
    pub stale_failure_threshold: u32,
    /// Age of the last success past which the failure threshold applies.
    pub stale_age_secs: u64,
}

impl Default for AddressBookConfig {
    fn default() -> Self {
        AddressBookConfig {
            tried_bias: 0.5,
            stale_failure_threshold: 10,
            stale_age_secs: 30 * 24 * 60 * 60,
        }
    }
}

/// The address book's record for one peer address.
#[derive(Debug, Clone)]
pub struct ExtendedPeerInfo {
    pub(crate) peer: PeerAddress,
    pub(crate) source: IpAddr,
    pub(crate) last_try: u64,
    pub(crate) last_success: u64,
    pub(crate) last_seen: u64,
    pub(crate) attempts: u32,
    pub(crate) tried_slot: Option<(u32, u32)>,
    pub(crate) new_buckets: BTreeSet<u32>,
}

impl ExtendedPeerInfo {
    /// The stored peer address.
    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    /// Host that reported this address.
    pub fn source(&self) -> IpAddr {
        self.source
    }

    /// Unix time of the last connection attempt, 0 if never attempted.
    pub fn last_try(&self) -> u64 {
        self.last_try
    }

    /// Unix time of the last successful handshake, 0 if never.
    pub fn last_success(&self) -> u64 {
        self.last_success
    }

    /// Unix time this address was last reported to us.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Failed attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the entry is resident in the tried table.
    pub fn is_tried(&self) -> bool {
        self.tried_slot.is_some()
    }

    /// Number of new-table buckets referencing the entry.
    pub fn new_bucket_refs(&self) -> usize {
        self.new_buckets.len()
    }

    /// Relative selection weight, biasing the random walk away from
    /// recently and repeatedly failed addresses.
    fn chance(&self, now: u64) -> f64 {
        let mut chance = 1.0;
        if self.last_try > 0 && now.saturating_sub(self.last_try) < SELECT_RECENT_TRY_SECS {
            chance *= 0.01;
        }
        chance * 0.66f64.powi(self.attempts.min(8) as i32)
    }
}

#[derive(Debug, Clone)]
struct Collision {
    candidate: u64,
    since: u64,
}

/// Bucketed new/tried address tables with collision-based eviction.
#[derive(Debug)]
pub struct AddressBook {
    config: AddressBookConfig,
    /// Secret hashing key; randomizes bucket placement per book instance.
    key: [u8; 32],
    entries: HashMap<u64, ExtendedPeerInfo>,
    index: HashMap<(IpAddr, u16), u64>,
    new_table: Vec<Option<u64>>,
    tried_table: Vec<Option<u64>>,
    new_count: usize,
    tried_count: usize,
    collisions: VecDeque<Collision>,
    next_id: u64,
}

fn table_index(bucket: u32, slot: u32) -> usize {
    bucket as usize * BUCKET_SIZE as usize + slot as usize
}

impl AddressBook {
    /// Create an empty book with a hashing key drawn from `rng`.
    pub fn new(config: AddressBookConfig, rng: &mut dyn RandomSource) -> Self {
        let mut key = [0u8; 32];
        for chunk in key.chunks_mut(8) {
            chunk.copy_from_slice(&rng.next_u64().to_le_bytes());
        }
        AddressBook {
            config,
            key,
            entries: HashMap::new(),
            index: HashMap::new(),
            new_table: vec![None; table_index(NEW_BUCKET_COUNT - 1, BUCKET_SIZE - 1) + 1],
            tried_table: vec![None; table_index(TRIED_BUCKET_COUNT - 1, BUCKET_SIZE - 1) + 1],
            new_count: 0,
            tried_count: 0,
            collisions: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Total stored entries.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Entries resident in the new table.
    pub fn new_size(&self) -> usize {
        self.new_count
    }

    /// Entries resident in the tried table.
    pub fn tried_size(&self) -> usize {
        self.tried_count
    }

    /// Pending tried-slot collisions.
    pub fn collision_count(&self) -> usize {
        self.collisions.len()
    }

    /// Look up the record for an endpoint.
    pub fn get(&self, peer: &PeerAddress) -> Option<&ExtendedPeerInfo> {
        let id = self.index.get(&peer.key())?;
        self.entries.get(id)
    }

    /// Record a peer address learned from `source`.
    ///
    /// Returns whether a new entry was stored. Known addresses are
    /// refreshed in place (timestamp bump, service knowledge union, at most
    /// one additional new-bucket reference for a fresh source), and
    /// unroutable records are dropped silently.
    pub fn add(&mut self, peer: PeerAddress, source: Option<IpAddr>, now: u64) -> bool {
        if peer.port == 0 || peer.host.is_unspecified() {
            return false;
        }
        let source = source.unwrap_or(peer.host);

        if let Some(&id) = self.index.get(&peer.key()) {
            let bucket = self.new_bucket(&peer, &source);
            let consider_ref = {
                let Some(info) = self.entries.get_mut(&id) else {
                    return false;
                };
                info.last_seen = now;
                if let PeerServices::Known(flags) = peer.services {
                    info.peer.services = match info.peer.services {
                        PeerServices::Known(existing) => PeerServices::Known(existing | flags),
                        PeerServices::Unknown => PeerServices::Known(flags),
                    };
                }
                info.tried_slot.is_none()
                    && !info.new_buckets.contains(&bucket)
                    && info.new_buckets.len() < MAX_NEW_BUCKETS_PER_ADDRESS
            };
            if consider_ref {
                self.place_in_new_bucket(id, bucket, now);
            }
            return false;
        }

        let id = self.next_id;
        self.next_id += 1;
        let bucket = self.new_bucket(&peer, &source);
        let info = ExtendedPeerInfo {
            peer: peer.clone(),
            source,
            last_try: 0,
            last_success: 0,
            last_seen: now,
            attempts: 0,
            tried_slot: None,
            new_buckets: BTreeSet::new(),
        };
        self.entries.insert(id, info);
        self.index.insert(peer.key(), id);
        if self.place_in_new_bucket(id, bucket, now) {
            self.new_count += 1;
            true
        } else {
            // target slot held by a higher value entry, drop the newcomer
            self.entries.remove(&id);
            self.index.remove(&peer.key());
            false
        }
    }

    /// Record the outcome of a connection attempt against `peer`.
    ///
    /// A success resets the failure counter and promotes the entry toward
    /// the tried table. Failures past the configured count and age
    /// thresholds remove the entry entirely.
    pub fn mark_attempt(&mut self, peer: &PeerAddress, success: bool, now: u64) {
        let Some(&id) = self.index.get(&peer.key()) else {
            return;
        };
        let promote = {
            let Some(info) = self.entries.get_mut(&id) else {
                return;
            };
            info.last_try = now;
            if success {
                info.attempts = 0;
                info.last_success = now;
                info.last_seen = now;
                info.tried_slot.is_none()
            } else {
                info.attempts += 1;
                false
            }
        };
        if promote {
            self.promote_to_tried(peer, now);
        } else if !success {
            let drop = self
                .entries
                .get(&id)
                .map(|info| self.past_failure_thresholds(info, now))
                .unwrap_or(false);
            if drop {
                debug!("dropping {peer} after repeated failed attempts");
                self.remove_entry(id);
            }
        }
    }

    /// Move a confirmed-reachable address toward the tried table.
    ///
    /// When the computed slot is held by a different address the move is
    /// deferred as a collision record and the occupant is returned as the
    /// next feeler-test target. At most one collision is kept per slot.
    pub fn promote_to_tried(&mut self, peer: &PeerAddress, now: u64) -> Option<ExtendedPeerInfo> {
        let id = *self.index.get(&peer.key())?;
        if self.entries.get(&id)?.tried_slot.is_some() {
            return None;
        }
        let (bucket, slot) = self.tried_position(peer);
        let idx = table_index(bucket, slot);
        match self.tried_table[idx] {
            None => {
                self.seat_in_tried(id, bucket, slot);
                None
            }
            Some(occupant) if occupant == id => None,
            Some(occupant) => {
                let pending = self.collisions.iter().any(|c| {
                    c.candidate == id
                        || self
                            .entries
                            .get(&c.candidate)
                            .map(|info| self.tried_position(&info.peer) == (bucket, slot))
                            .unwrap_or(false)
                });
                if !pending {
                    debug!("tried slot for {peer} occupied, deferring promotion");
                    self.collisions.push_back(Collision {
                        candidate: id,
                        since: now,
                    });
                }
                self.entries.get(&occupant).cloned()
            }
        }
    }

    /// Occupant of the oldest pending collision slot, if any.
    ///
    /// The occupant, not the challenger, is what a feeler should test: a
    /// fresh success lets it keep the slot.
    pub fn select_tried_collision(&self) -> Option<ExtendedPeerInfo> {
        for collision in &self.collisions {
            let Some(candidate) = self.entries.get(&collision.candidate) else {
                continue;
            };
            let (bucket, slot) = self.tried_position(&candidate.peer);
            let Some(occupant) = self.tried_table[table_index(bucket, slot)] else {
                continue;
            };
            if occupant == collision.candidate {
                continue;
            }
            if let Some(info) = self.entries.get(&occupant) {
                return Some(info.clone());
            }
        }
        None
    }

    /// Settle pending tried-slot collisions.
    ///
    /// An occupant with a success inside [`COLLISION_STALENESS_SECS`] keeps
    /// its slot and the challenger is discarded. A stale occupant is
    /// displaced once the collision is older than [`COLLISION_GRACE_SECS`];
    /// until then the collision stays pending so a feeler can test the
    /// occupant. Safe to call with nothing pending.
    pub fn resolve_tried_collisions(&mut self, now: u64) {
        let pending: Vec<Collision> = self.collisions.drain(..).collect();
        for collision in pending {
            let Some(candidate) = self.entries.get(&collision.candidate) else {
                continue;
            };
            if candidate.tried_slot.is_some() {
                continue;
            }
            let peer = candidate.peer.clone();
            let (bucket, slot) = self.tried_position(&peer);
            let idx = table_index(bucket, slot);
            match self.tried_table[idx] {
                None => {
                    self.seat_in_tried(collision.candidate, bucket, slot);
                }
                Some(occupant) if occupant == collision.candidate => {}
                Some(occupant) => {
                    let occupant_fresh = self
                        .entries
                        .get(&occupant)
                        .map(|info| {
                            info.last_success > 0
                                && now.saturating_sub(info.last_success)
                                    <= COLLISION_STALENESS_SECS
                        })
                        .unwrap_or(false);
                    if occupant_fresh {
                        debug!("tried occupant reconfirmed, discarding challenger {peer}");
                    } else if now.saturating_sub(collision.since) >= COLLISION_GRACE_SECS {
                        if let Some(info) = self.entries.get(&occupant) {
                            debug!("evicting stale tried entry {} for {peer}", info.peer);
                        }
                        self.tried_table[idx] = None;
                        self.demote_to_new(occupant, now);
                        self.seat_in_tried(collision.candidate, bucket, slot);
                    } else {
                        self.collisions.push_back(collision);
                    }
                }
            }
        }
    }

    /// Weighted random selection of a dial candidate.
    ///
    /// Feeler selection draws from the new table only. Otherwise a biased
    /// coin picks the table and a random walk inside it favors entries
    /// that failed less and were not tried just now.
    pub fn select_peer(
        &self,
        is_feeler: bool,
        now: u64,
        rng: &mut dyn RandomSource,
    ) -> Option<ExtendedPeerInfo> {
        let use_tried = if is_feeler || self.tried_count == 0 {
            false
        } else if self.new_count == 0 {
            true
        } else {
            rng.next_f64() < self.config.tried_bias
        };
        self.select_from(use_tried, now, rng)
    }

    /// Random share of the book suitable for answering a peer-list request.
    pub fn gossip_sample(&self, now: u64, rng: &mut dyn RandomSource) -> Vec<PeerAddress> {
        let limit = GOSSIP_SAMPLE_MAX.min((self.entries.len() as f64 * GOSSIP_SAMPLE_SHARE) as usize);
        let mut ids: Vec<u64> = self.entries.keys().copied().collect();
        let mut sample = Vec::with_capacity(limit);
        let mut cursor = 0;
        while sample.len() < limit && cursor < ids.len() {
            let pick = cursor + rng.gen_range((ids.len() - cursor) as u64) as usize;
            ids.swap(cursor, pick);
            let id = ids[cursor];
            cursor += 1;
            if self.is_low_value(id, now) {
                continue;
            }
            if let Some(info) = self.entries.get(&id) {
                sample.push(info.peer.clone());
            }
        }
        sample
    }

    fn select_from(
        &self,
        tried: bool,
        now: u64,
        rng: &mut dyn RandomSource,
    ) -> Option<ExtendedPeerInfo> {
        let (table, buckets, population) = if tried {
            (&self.tried_table, TRIED_BUCKET_COUNT, self.tried_count)
        } else {
            (&self.new_table, NEW_BUCKET_COUNT, self.new_count)
        };
        if population == 0 {
            return None;
        }
        let mut factor = 1.0;
        loop {
            let bucket = rng.gen_range(buckets as u64) as u32;
            let slot = rng.gen_range(BUCKET_SIZE as u64) as u32;
            let Some(id) = table[table_index(bucket, slot)] else {
                continue;
            };
            let Some(info) = self.entries.get(&id) else {
                continue;
            };
            if rng.next_f64() < info.chance(now) * factor {
                return Some(info.clone());
            }
            factor *= 1.2;
        }
    }

    fn past_failure_thresholds(&self, info: &ExtendedPeerInfo, now: u64) -> bool {
        info.attempts >= self.config.stale_failure_threshold
            && (info.last_success == 0
                || now.saturating_sub(info.last_success) > self.config.stale_age_secs)
    }

    fn is_low_value(&self, id: u64, now: u64) -> bool {
        let Some(info) = self.entries.get(&id) else {
            return true;
        };
        if info.last_try > 0 && now.saturating_sub(info.last_try) < RECENT_TRY_SECS {
            return false;
        }
        if info.last_seen == 0 || now.saturating_sub(info.last_seen) > HORIZON_SECS {
            return true;
        }
        if info.last_success == 0 && info.attempts >= MAX_UNTRIED_RETRIES {
            return true;
        }
        self.past_failure_thresholds(info, now)
    }

    /// Insert a reference to `id` into `bucket` of the new table.
    ///
    /// An occupied slot is reclaimed only from a low value occupant;
    /// otherwise the placement fails and the caller drops the newcomer.
    fn place_in_new_bucket(&mut self, id: u64, bucket: u32, now: u64) -> bool {
        let Some(peer) = self.entries.get(&id).map(|info| info.peer.clone()) else {
            return false;
        };
        let slot = self.bucket_slot(b"new-slot", bucket, &peer);
        let idx = table_index(bucket, slot);
        match self.new_table[idx] {
            Some(occupant) if occupant == id => true,
            Some(occupant) => {
                if !self.is_low_value(occupant, now) {
                    return false;
                }
                if let Some(info) = self.entries.get(&occupant) {
                    debug!("evicting low value address {} from new table", info.peer);
                }
                self.new_table[idx] = Some(id);
                self.drop_new_ref(occupant, bucket);
                if let Some(info) = self.entries.get_mut(&id) {
                    info.new_buckets.insert(bucket);
                }
                true
            }
            None => {
                self.new_table[idx] = Some(id);
                if let Some(info) = self.entries.get_mut(&id) {
                    info.new_buckets.insert(bucket);
                }
                true
            }
        }
    }

    /// Forget one new-bucket reference; the table cell itself is already
    /// cleared or overwritten by the caller.
    fn drop_new_ref(&mut self, id: u64, bucket: u32) {
        let (now_empty, untried) = {
            let Some(info) = self.entries.get_mut(&id) else {
                return;
            };
            info.new_buckets.remove(&bucket);
            (info.new_buckets.is_empty(), info.tried_slot.is_none())
        };
        if now_empty {
            self.new_count = self.new_count.saturating_sub(1);
            if untried {
                if let Some(info) = self.entries.remove(&id) {
                    self.index.remove(&info.peer.key());
                }
                self.collisions.retain(|c| c.candidate != id);
            }
        }
    }

    fn seat_in_tried(&mut self, id: u64, bucket: u32, slot: u32) {
        let Some(info) = self.entries.get(&id) else {
            return;
        };
        let peer = info.peer.clone();
        let refs: Vec<u32> = info.new_buckets.iter().copied().collect();
        if !refs.is_empty() {
            for b in refs {
                let s = self.bucket_slot(b"new-slot", b, &peer);
                let idx = table_index(b, s);
                if self.new_table[idx] == Some(id) {
                    self.new_table[idx] = None;
                }
            }
            self.new_count = self.new_count.saturating_sub(1);
        }
        if let Some(info) = self.entries.get_mut(&id) {
            info.new_buckets.clear();
            info.tried_slot = Some((bucket, slot));
        }
        self.tried_table[table_index(bucket, slot)] = Some(id);
        self.tried_count += 1;
    }

    /// Move a displaced tried entry back to its new-table bucket, dropping
    /// it entirely when the bucket has no room.
    fn demote_to_new(&mut self, id: u64, now: u64) {
        let (peer, source) = {
            let Some(info) = self.entries.get_mut(&id) else {
                return;
            };
            info.tried_slot = None;
            (info.peer.clone(), info.source)
        };
        self.tried_count = self.tried_count.saturating_sub(1);
        let bucket = self.new_bucket(&peer, &source);
        if self.place_in_new_bucket(id, bucket, now) {
            self.new_count += 1;
        } else {
            debug!("no new table room for demoted address {peer}, dropping");
            if let Some(info) = self.entries.remove(&id) {
                self.index.remove(&info.peer.key());
            }
            self.collisions.retain(|c| c.candidate != id);
        }
    }

    fn remove_entry(&mut self, id: u64) {
        let Some(info) = self.entries.remove(&id) else {
            return;
        };
        self.index.remove(&info.peer.key());
        if !info.new_buckets.is_empty() {
            self.new_count = self.new_count.saturating_sub(1);
            for bucket in &info.new_buckets {
                let slot = self.bucket_slot(b"new-slot", *bucket, &info.peer);
                let idx = table_index(*bucket, slot);
                if self.new_table[idx] == Some(id) {
                    self.new_table[idx] = None;
                }
            }
        }
        if let Some((bucket, slot)) = info.tried_slot {
            let idx = table_index(bucket, slot);
            if self.tried_table[idx] == Some(id) {
                self.tried_table[idx] = None;
            }
            self.tried_count = self.tried_count.saturating_sub(1);
        }
        self.collisions.retain(|c| c.candidate != id);
    }

    fn tried_position(&self, peer: &PeerAddress) -> (u32, u32) {
        let bucket = self.tried_bucket(peer);
        let slot = self.bucket_slot(b"tried-slot", bucket, peer);
        (bucket, slot)
    }

    fn new_bucket(&self, peer: &PeerAddress, source: &IpAddr) -> u32 {
        let addr_group = peer.group().as_bytes();
        let source_group = NetworkGroup::of(source).as_bytes();
        let range = self.hash_to_u64(&[b"new-range", &peer.key_bytes(), &source_group])
            % NEW_BUCKETS_PER_SOURCE_GROUP;
        (self.hash_to_u64(&[
            b"new-bucket",
            &addr_group,
            &source_group,
            &range.to_le_bytes(),
        ]) % NEW_BUCKET_COUNT as u64) as u32
    }

    fn tried_bucket(&self, peer: &PeerAddress) -> u32 {
        let range =
            self.hash_to_u64(&[b"tried-range", &peer.key_bytes()]) % TRIED_BUCKETS_PER_GROUP;
        (self.hash_to_u64(&[
            b"tried-bucket",
            &peer.group().as_bytes(),
            &range.to_le_bytes(),
        ]) % TRIED_BUCKET_COUNT as u64) as u32
    }

    fn bucket_slot(&self, tag: &[u8], bucket: u32, peer: &PeerAddress) -> u32 {
        (self.hash_to_u64(&[tag, &bucket.to_le_bytes(), &peer.key_bytes()]) % BUCKET_SIZE as u64)
            as u32
    }

    fn hash_to_u64(&self, parts: &[&[u8]]) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        for part in parts {
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }
}
