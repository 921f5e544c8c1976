//! Periodic introducer polling for bootstrap addresses.
//!
//! The introducer is a well-known peer whose only job here is handing out
//! address lists. While the node is short of its outbound target the
//! poller asks it for peers and feeds the response into the address book;
//! once the target is met any lingering introducer session is closed.

use crate::config::Config;
use crate::transport::Transport;
use crate::SharedAddressBook;
use ember_peers_addrbook::time::unix_secs;
use ember_peers_addrbook::PeerAddress;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Background loop polling the introducer for fresh addresses.
pub struct IntroducerPoller<T> {
    book: SharedAddressBook,
    transport: Arc<T>,
    introducer: PeerAddress,
    poll_interval: Duration,
    target_outbound: usize,
}

impl<T: Transport> IntroducerPoller<T> {
    /// Build a poller for the configured introducer.
    pub fn new(
        book: SharedAddressBook,
        transport: Arc<T>,
        introducer: PeerAddress,
        config: &Config,
    ) -> Self {
        IntroducerPoller {
            book,
            transport,
            introducer,
            poll_interval: config.introducer_poll_interval,
            target_outbound: config.target_outbound_connections,
        }
    }

    /// Poll until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!("introducer poller started for {}", self.introducer);
        loop {
            self.poll_once().await;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        debug!("introducer poller stopped");
    }

    async fn poll_once(&self) {
        let outbound = self.transport.outbound_count();
        if outbound < self.target_outbound {
            debug!(
                "outbound {outbound}/{} below target, polling introducer",
                self.target_outbound
            );
            match self.transport.request_peer_list(self.introducer.clone()).await {
                Ok(list) => {
                    let total = list.peers.len();
                    let now = unix_secs();
                    let mut book = self.book.lock().await;
                    let mut added = 0usize;
                    for peer in list.peers {
                        if book.add(peer, Some(self.introducer.host), now) {
                            added += 1;
                        }
                    }
                    info!("introducer returned {total} addresses, {added} new");
                }
                Err(err) => debug!("introducer poll failed: {err}"),
            }
        }
        // the introducer is a bootstrap aid, not a long-term peer
        if self.transport.outbound_count() >= self.target_outbound
            && self
                .transport
                .connections()
                .iter()
                .any(|peer| peer == &self.introducer)
        {
            debug!("outbound target met, disconnecting from introducer");
            self.transport.disconnect(&self.introducer);
        }
    }
}
