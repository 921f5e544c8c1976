//! Integration tests for service lifecycle supervision.

use ember_peers_node::{
    AddressBook, AddressBookConfig, Config, ConnectionRegistry, DialError, Dialer, NetworkGroup,
    NodeApi, PeerAddress, PeerList, RpcCleanup, ServiceBuilder, ServiceError, ServiceState,
    SharedAddressBook, StdRandom, SupportsServerBinding,
};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

#[derive(Default)]
struct MockTransport {
    dials: StdMutex<Vec<PeerAddress>>,
    connections: StdMutex<Vec<PeerAddress>>,
    disconnected: StdMutex<Vec<PeerAddress>>,
    inbound: StdMutex<Vec<SocketAddr>>,
}

impl Dialer for MockTransport {
    async fn dial(
        &self,
        peer: PeerAddress,
        _disconnect_after_handshake: bool,
    ) -> Result<(), DialError> {
        self.dials.lock().unwrap().push(peer.clone());
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
        self.connections
            .lock()
            .unwrap()
            .iter()
            .map(|peer| peer.group())
            .collect()
    }

    fn connections(&self) -> Vec<PeerAddress> {
        self.connections.lock().unwrap().clone()
    }

    fn disconnect(&self, peer: &PeerAddress) {
        self.disconnected.lock().unwrap().push(peer.clone());
        self.connections.lock().unwrap().retain(|p| p != peer);
    }

    fn pool_size(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    fn handle_inbound(&self, _stream: TcpStream, addr: SocketAddr) {
        self.inbound.lock().unwrap().push(addr);
    }
}

#[derive(Default)]
struct MockApi {
    shutdowns: AtomicUsize,
    server_bound: AtomicBool,
}

impl NodeApi for MockApi {
    fn begin_shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

impl SupportsServerBinding<MockTransport> for MockApi {
    fn bind_server(&self, _transport: &Arc<MockTransport>) {
        self.server_bound.store(true, Ordering::SeqCst);
    }
}

fn shared_book() -> SharedAddressBook {
    let mut rng = StdRandom::from_seed(42);
    Arc::new(Mutex::new(AddressBook::new(
        AddressBookConfig::default(),
        &mut rng,
    )))
}

fn quick_config() -> Config {
    Config::new()
        .with_poll_interval(Duration::from_millis(20))
        .with_shutdown_grace(Duration::from_secs(2))
}

#[tokio::test]
async fn test_lifecycle_start_stop_close() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::default());
    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let closed = Arc::new(AtomicBool::new(false));
    let rpc_cleaned = Arc::new(AtomicBool::new(false));

    let started_hook = Arc::clone(&started);
    let stopped_hook = Arc::clone(&stopped);
    let closed_hook = Arc::clone(&closed);
    let rpc_flag = Arc::clone(&rpc_cleaned);

    let mut service = ServiceBuilder::new(
        quick_config(),
        shared_book(),
        Arc::clone(&transport),
        Arc::clone(&api),
    )
    .with_listen_addr("127.0.0.1:0".parse().unwrap())
    .bind_api_server()
    .on_start(async move {
        started_hook.store(true, Ordering::SeqCst);
    })
    .on_stop(move || {
        stopped_hook.store(true, Ordering::SeqCst);
    })
    .on_closed(async move {
        closed_hook.store(true, Ordering::SeqCst);
    })
    .with_rpc(move |_handle| async move {
        let cleanup: RpcCleanup = Box::pin(async move {
            rpc_flag.store(true, Ordering::SeqCst);
        });
        cleanup
    })
    .build();

    assert_eq!(service.state(), ServiceState::Created);
    assert!(api.server_bound.load(Ordering::SeqCst));

    service.start().await.expect("startup failed");
    assert_eq!(service.state(), ServiceState::Running);
    assert!(started.load(Ordering::SeqCst));
    let listen_addr = service.local_addrs()[0];
    assert_ne!(listen_addr.port(), 0);

    // an inbound connection reaches the transport
    let _client = TcpStream::connect(listen_addr)
        .await
        .expect("listener not accepting");
    for _ in 0..200 {
        if !transport.inbound.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(!transport.inbound.lock().unwrap().is_empty());

    // starting again is a no-op
    service.start().await.expect("restart must be a no-op");
    assert_eq!(service.state(), ServiceState::Running);

    service.stop();
    assert_eq!(service.state(), ServiceState::Stopping);
    assert_eq!(api.shutdowns.load(Ordering::SeqCst), 1);
    // double stop is a no-op
    service.stop();
    assert_eq!(api.shutdowns.load(Ordering::SeqCst), 1);

    service.wait_closed().await;
    assert_eq!(service.state(), ServiceState::Closed);
    assert!(stopped.load(Ordering::SeqCst));
    assert!(closed.load(Ordering::SeqCst));
    assert!(rpc_cleaned.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_bind_failure_aborts_startup() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").expect("blocker bind");
    let taken = blocker.local_addr().expect("blocker addr");

    let mut service = ServiceBuilder::new(
        quick_config(),
        shared_book(),
        Arc::new(MockTransport::default()),
        Arc::new(MockApi::default()),
    )
    .with_listen_addr(taken)
    .build();

    match service.start().await {
        Err(ServiceError::Bind(addr, _)) => assert_eq!(addr, taken),
        other => panic!("expected bind failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reconnect_task_dials_static_peer() {
    let transport = Arc::new(MockTransport::default());
    let peer = PeerAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 9444);

    let mut service = ServiceBuilder::new(
        quick_config(),
        shared_book(),
        Arc::clone(&transport),
        Arc::new(MockApi::default()),
    )
    .with_connect_peer(peer.clone())
    .build();

    service.start().await.expect("startup failed");
    for _ in 0..200 {
        if transport.dials.lock().unwrap().contains(&peer) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(transport.dials.lock().unwrap().contains(&peer));

    service.stop();
    service.wait_closed().await;
    // stop closes the connection the reconnect task opened
    assert!(transport.disconnected.lock().unwrap().contains(&peer));
}

#[tokio::test]
async fn test_rpc_task_can_stop_the_service() {
    let mut service = ServiceBuilder::new(
        quick_config(),
        shared_book(),
        Arc::new(MockTransport::default()),
        Arc::new(MockApi::default()),
    )
    .with_rpc(|handle| async move {
        handle.stop();
        let cleanup: RpcCleanup = Box::pin(async {});
        cleanup
    })
    .build();

    // run returns because the rpc task requested a stop
    service.run().await.expect("run failed");
    assert_eq!(service.state(), ServiceState::Closed);
}
