//! Periodic outbound connection scheduling.
//!
//! Each poll the scheduler compares the outbound connection count against
//! the configured target, resolves pending tried-slot collisions, asks the
//! selection policy for a candidate, and spawns a fire-and-forget dial
//! task. A slow or hanging attempt never blocks the loop; its outcome is
//! reported back to the address book when it concludes.
//!
//! Feeler connections grow the pool of addresses known to be currently
//! reachable: a short-lived probe drawn from the new table (or a pending
//! collision occupant), disconnected right after the handshake, fired at
//! Poisson-distributed instants so probing stays rare and uncorrelated
//! with connection demand.

use crate::config::Config;
use crate::transport::Transport;
use crate::SharedAddressBook;
use ember_peers_addrbook::time::{unix_micros, unix_secs};
use ember_peers_addrbook::{PeerSelector, RandomSource};
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The periodic dial loop.
pub struct ConnectionScheduler<T, R> {
    book: SharedAddressBook,
    transport: Arc<T>,
    selector: PeerSelector,
    target_outbound: usize,
    poll_interval: Duration,
    feeler_average_interval: Duration,
    rng: R,
    next_feeler_at: u64,
}

impl<T: Transport, R: RandomSource> ConnectionScheduler<T, R> {
    /// Build a scheduler over a shared address book and transport.
    pub fn new(book: SharedAddressBook, transport: Arc<T>, config: &Config, mut rng: R) -> Self {
        let next_feeler_at =
            poisson_next_send(unix_micros(), config.feeler_average_interval, &mut rng);
        ConnectionScheduler {
            book,
            transport,
            selector: config.selector(),
            target_outbound: config.target_outbound_connections,
            poll_interval: config.poll_interval,
            feeler_average_interval: config.feeler_average_interval,
            rng,
            next_feeler_at,
        }
    }

    /// Drive the dial loop until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!("connection scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            self.poll_once(unix_micros()).await;
        }
        debug!("connection scheduler stopped");
    }

    /// One scheduling decision at `now_micros`.
    async fn poll_once(&mut self, now_micros: u64) {
        if self.book.lock().await.size() == 0 {
            // nothing to dial; bootstrap is the introducer poller's job
            return;
        }

        let outbound = self.transport.outbound_count();
        let occupied_groups = self.transport.outbound_groups();
        let needed = self.target_outbound.saturating_sub(outbound);

        // While below target, only the rare feeler instants dial; at
        // target every poll may probe.
        let mut is_feeler = false;
        if needed > 0 {
            if now_micros < self.next_feeler_at {
                return;
            }
            self.next_feeler_at =
                poisson_next_send(now_micros, self.feeler_average_interval, &mut self.rng);
            is_feeler = true;
        }

        let now = now_micros / 1_000_000;
        let candidate = {
            let mut book = self.book.lock().await;
            book.resolve_tried_collisions(now);
            self.selector
                .next_candidate(&book, is_feeler, &occupied_groups, now, &mut self.rng)
        };
        let Some(peer) = candidate else {
            return;
        };

        let disconnect_after_handshake = is_feeler || needed == 0;
        let transport = Arc::clone(&self.transport);
        let book = Arc::clone(&self.book);
        tokio::spawn(async move {
            debug!("dialing {peer} (feeler: {is_feeler})");
            let outcome = transport.dial(peer.clone(), disconnect_after_handshake).await;
            if let Err(err) = &outcome {
                debug!("dial to {peer} failed: {err}");
            }
            book.lock().await.mark_attempt(&peer, outcome.is_ok(), unix_secs());
        });
    }
}

/// Next instant of a Poisson process with the given average interval.
fn poisson_next_send(now_micros: u64, avg: Duration, rng: &mut dyn RandomSource) -> u64 {
    // 1 - u lies in (0, 1], keeping ln() finite
    let u = 1.0 - rng.next_f64();
    now_micros + (-u.ln() * avg.as_micros() as f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PeerList;
    use crate::transport::{ConnectionRegistry, DialError, Dialer};
    use ember_peers_addrbook::{
        AddressBook, AddressBookConfig, NetworkGroup, PeerAddress, StdRandom,
    };
    use std::collections::{HashSet, VecDeque};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpStream;
    use tokio::sync::Mutex;

    /// Mock transport recording dial requests and serving scripted results.
    #[derive(Default)]
    struct MockTransport {
        dials: StdMutex<Vec<(PeerAddress, bool)>>,
        dial_results: StdMutex<VecDeque<Result<(), DialError>>>,
        outbound: AtomicUsize,
        groups: StdMutex<HashSet<NetworkGroup>>,
    }

    impl MockTransport {
        fn with_outbound(outbound: usize) -> Self {
            let mock = MockTransport::default();
            mock.outbound.store(outbound, Ordering::SeqCst);
            mock
        }

        fn add_group(&self, group: NetworkGroup) {
            self.groups.lock().unwrap().insert(group);
        }

        fn push_dial_result(&self, result: Result<(), DialError>) {
            self.dial_results.lock().unwrap().push_back(result);
        }

        fn dials(&self) -> Vec<(PeerAddress, bool)> {
            self.dials.lock().unwrap().clone()
        }
    }

    impl Dialer for MockTransport {
        async fn dial(
            &self,
            peer: PeerAddress,
            disconnect_after_handshake: bool,
        ) -> Result<(), DialError> {
            self.dials
                .lock()
                .unwrap()
                .push((peer, disconnect_after_handshake));
            self.dial_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn request_peer_list(
            &self,
            _introducer: PeerAddress,
        ) -> Result<PeerList, DialError> {
            Ok(PeerList { peers: Vec::new() })
        }
    }

    impl ConnectionRegistry for MockTransport {
        fn outbound_count(&self) -> usize {
            self.outbound.load(Ordering::SeqCst)
        }

        fn outbound_groups(&self) -> HashSet<NetworkGroup> {
            self.groups.lock().unwrap().clone()
        }

        fn connections(&self) -> Vec<PeerAddress> {
            Vec::new()
        }

        fn disconnect(&self, _peer: &PeerAddress) {}

        fn pool_size(&self) -> usize {
            self.outbound.load(Ordering::SeqCst)
        }

        fn handle_inbound(&self, _stream: TcpStream, _addr: SocketAddr) {}
    }

    fn addr(a: u8, b: u8, c: u8, d: u8) -> PeerAddress {
        PeerAddress::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), 9444)
    }

    fn shared_book() -> SharedAddressBook {
        let mut rng = StdRandom::from_seed(42);
        Arc::new(Mutex::new(AddressBook::new(
            AddressBookConfig::default(),
            &mut rng,
        )))
    }

    fn scheduler(
        book: SharedAddressBook,
        transport: Arc<MockTransport>,
        config: &Config,
    ) -> ConnectionScheduler<MockTransport, StdRandom> {
        ConnectionScheduler::new(book, transport, config, StdRandom::from_seed(7))
    }

    async fn wait_for_dials(mock: &MockTransport, n: usize) {
        for _ in 0..200 {
            if mock.dials().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("never observed {n} dial(s)");
    }

    #[tokio::test]
    async fn test_empty_book_makes_no_dials() {
        let book = shared_book();
        let mock = Arc::new(MockTransport::with_outbound(0));
        let config = Config::new().with_target_outbound(2);
        let mut scheduler = scheduler(book, Arc::clone(&mock), &config);
        scheduler.next_feeler_at = 0;

        scheduler.poll_once(unix_micros()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mock.dials().is_empty());
    }

    #[tokio::test]
    async fn test_probe_when_target_met() {
        let book = shared_book();
        let peer = addr(10, 0, 0, 1);
        book.lock().await.add(peer.clone(), None, unix_secs());

        let mock = Arc::new(MockTransport::with_outbound(2));
        let config = Config::new().with_target_outbound(2);
        let mut scheduler = scheduler(Arc::clone(&book), Arc::clone(&mock), &config);

        scheduler.poll_once(unix_micros()).await;
        wait_for_dials(&mock, 1).await;
        let dials = mock.dials();
        assert_eq!(dials[0].0, peer);
        // target already met, so the attempt is only a probe
        assert!(dials[0].1);

        // a successful probe promotes the address
        for _ in 0..200 {
            if book.lock().await.tried_size() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("successful attempt never promoted the address");
    }

    #[tokio::test]
    async fn test_below_target_waits_for_feeler_deadline() {
        let book = shared_book();
        book.lock().await.add(addr(10, 0, 0, 1), None, unix_secs());

        let mock = Arc::new(MockTransport::with_outbound(0));
        let config = Config::new().with_target_outbound(2);
        let mut scheduler = scheduler(Arc::clone(&book), Arc::clone(&mock), &config);

        scheduler.next_feeler_at = u64::MAX;
        scheduler.poll_once(unix_micros()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mock.dials().is_empty());

        scheduler.next_feeler_at = 0;
        let now = unix_micros();
        scheduler.poll_once(now).await;
        wait_for_dials(&mock, 1).await;
        // feelers disconnect after the handshake, and the deadline is redrawn
        assert!(mock.dials()[0].1);
        assert!(scheduler.next_feeler_at > now);
    }

    #[tokio::test]
    async fn test_group_diversity_blocks_probes() {
        let book = shared_book();
        {
            let mut book = book.lock().await;
            let now = unix_secs();
            for d in 1..=3u8 {
                book.add(addr(10, 5, 0, d), None, now);
            }
        }
        let mock = Arc::new(MockTransport::with_outbound(2));
        mock.add_group(addr(10, 5, 0, 1).group());
        let config = Config::new().with_target_outbound(2);
        let mut scheduler = scheduler(Arc::clone(&book), Arc::clone(&mock), &config);

        scheduler.poll_once(unix_micros()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mock.dials().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dial_marks_attempt() {
        let book = shared_book();
        let peer = addr(10, 0, 0, 1);
        book.lock().await.add(peer.clone(), None, unix_secs());

        let mock = Arc::new(MockTransport::with_outbound(2));
        mock.push_dial_result(Err(DialError::Timeout));
        let config = Config::new().with_target_outbound(2);
        let mut scheduler = scheduler(Arc::clone(&book), Arc::clone(&mock), &config);

        scheduler.poll_once(unix_micros()).await;
        wait_for_dials(&mock, 1).await;
        for _ in 0..200 {
            let attempts = book.lock().await.get(&peer).map(|i| i.attempts());
            if attempts == Some(1) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("failed attempt never recorded");
    }

    #[test]
    fn test_poisson_mean_within_ten_percent() {
        let mut rng = StdRandom::from_seed(1234);
        let avg = Duration::from_secs(120);
        let draws = 10_000u64;
        let mut total = 0u64;
        for _ in 0..draws {
            total += poisson_next_send(0, avg, &mut rng);
        }
        let mean_secs = total as f64 / draws as f64 / 1_000_000.0;
        assert!(
            (108.0..=132.0).contains(&mean_secs),
            "empirical mean {mean_secs:.1}s outside 120s +/- 10%"
        );
    }
}
