//! Dry-run of the peer service against a simulated network.
//!
//! Wires a [`Service`] around a transport whose dials never succeed and an
//! introducer that hands out a fixed address list, so the bootstrap,
//! feeler and backoff behaviour can be watched in the logs without any
//! real peers. Stop it with ctrl-c.

use clap::Parser;
use ember_peers_node::{
    AddressBook, Config, ConnectionRegistry, DialError, Dialer, NetworkGroup, NodeApi,
    PeerAddress, PeerList, ServiceBuilder, StdRandom,
};
use log::LevelFilter;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Desired number of outbound connections.
    #[arg(short, long, default_value = "4")]
    target: usize,

    /// Optional listening address, e.g. 127.0.0.1:9444.
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log level.
    #[arg(long, default_value = "debug")]
    log_level: String,
}

/// Transport that simulates an unreachable network: every dial times out,
/// only the introducer answers.
struct SimTransport {
    connections: StdMutex<Vec<PeerAddress>>,
}

impl Dialer for SimTransport {
    async fn dial(
        &self,
        _peer: PeerAddress,
        _disconnect_after_handshake: bool,
    ) -> Result<(), DialError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err(DialError::Timeout)
    }

    async fn request_peer_list(
        &self,
        _introducer: PeerAddress,
    ) -> Result<PeerList, DialError> {
        let mut peers = Vec::new();
        for d in 1..=16u8 {
            peers.push(PeerAddress::new(
                IpAddr::V4(Ipv4Addr::new(198, 51, 100, d)),
                9444,
            ));
            peers.push(PeerAddress::new(
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, d)),
                9444,
            ));
        }
        Ok(PeerList { peers })
    }
}

impl ConnectionRegistry for SimTransport {
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
        self.connections.lock().unwrap().retain(|p| p != peer);
    }

    fn pool_size(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    fn handle_inbound(&self, _stream: TcpStream, addr: SocketAddr) {
        log::info!("dropping simulated inbound connection from {addr}");
    }
}

struct Api;

impl NodeApi for Api {
    fn begin_shutdown(&self) {
        log::info!("api layer shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Debug,
    };

    // Configure fern logger
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {} - {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stderr())
        .apply()
        .unwrap();

    let introducer = PeerAddress::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)), 9444);
    let config = Config::new()
        .with_target_outbound(args.target)
        .with_introducer(introducer, Duration::from_secs(15));

    let mut rng = StdRandom::from_entropy();
    let book = Arc::new(tokio::sync::Mutex::new(AddressBook::new(
        config.book_config(),
        &mut rng,
    )));
    let transport = Arc::new(SimTransport {
        connections: StdMutex::new(Vec::new()),
    });

    let mut builder = ServiceBuilder::new(config, book, transport, Arc::new(Api));
    if let Some(listen) = args.listen {
        builder = builder.with_listen_addr(listen);
    }
    let mut service = builder.build();

    log::info!("starting simulated peer service, ctrl-c to stop");
    service.run().await?;
    Ok(())
}
