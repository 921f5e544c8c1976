//! Reconnect maintenance for statically configured peers.

use crate::transport::Transport;
use ember_peers_addrbook::PeerAddress;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How often a configured peer's connection is checked.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// Spawn a task keeping `peer` connected until shutdown is signalled.
///
/// The dial is long-lived, never a probe; a failed attempt is retried on
/// the next tick.
pub fn start_reconnect_task<T: Transport>(
    transport: Arc<T>,
    peer: PeerAddress,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if !transport.connections().iter().any(|p| p == &peer) {
                debug!("connecting to configured peer {peer}");
                if let Err(err) = transport.dial(peer.clone(), false).await {
                    debug!("connection to {peer} failed: {err}");
                }
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PeerList;
    use crate::transport::{ConnectionRegistry, DialError, Dialer};
    use ember_peers_addrbook::NetworkGroup;
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpStream;

    struct MockTransport {
        dials: AtomicUsize,
        connections: StdMutex<Vec<PeerAddress>>,
    }

    impl Dialer for MockTransport {
        async fn dial(
            &self,
            peer: PeerAddress,
            _disconnect_after_handshake: bool,
        ) -> Result<(), DialError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.connections.lock().unwrap().push(peer);
            Ok(())
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
            self.connections.lock().unwrap().len()
        }
        fn outbound_groups(&self) -> HashSet<NetworkGroup> {
            HashSet::new()
        }
        fn connections(&self) -> Vec<PeerAddress> {
            self.connections.lock().unwrap().clone()
        }
        fn disconnect(&self, _peer: &PeerAddress) {}
        fn pool_size(&self) -> usize {
            self.connections.lock().unwrap().len()
        }
        fn handle_inbound(&self, _stream: TcpStream, _addr: SocketAddr) {}
    }

    #[tokio::test]
    async fn test_dials_once_then_idles_while_connected() {
        let mock = Arc::new(MockTransport {
            dials: AtomicUsize::new(0),
            connections: StdMutex::new(Vec::new()),
        });
        let peer = PeerAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9444);
        let (tx, rx) = watch::channel(false);

        let task = start_reconnect_task(Arc::clone(&mock), peer, rx);
        for _ in 0..100 {
            if mock.dials.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(mock.dials.load(Ordering::SeqCst), 1);

        let _ = tx.send(true);
        task.await.expect("reconnect task panicked");
        // still connected, never redialed
        assert_eq!(mock.dials.load(Ordering::SeqCst), 1);
    }
}
