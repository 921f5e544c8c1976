//! Lifecycle supervision for the peer networking layer.
//!
//! A [`Service`] owns every background piece of the layer as one unit: the
//! connection scheduler, the introducer poller, reconnect maintenance for
//! statically configured peers, the listening sockets and the optional RPC
//! task. Startup is ordered, shutdown is signalled through a single watch
//! channel that every task observes at its next suspension point, and
//! `stop` is idempotent.

use crate::config::Config;
use crate::introducer::IntroducerPoller;
use crate::reconnect::start_reconnect_task;
use crate::scheduler::ConnectionScheduler;
use crate::transport::Transport;
use crate::SharedAddressBook;
use ember_peers_addrbook::{PeerAddress, StdRandom};
use log::{debug, info, warn};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Lifecycle phases of a [`Service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    /// Built but not started.
    Created = 0,
    /// Spawning tasks and binding listeners.
    Starting = 1,
    /// All listeners bound, tasks running.
    Running = 2,
    /// Stop requested, tasks winding down.
    Stopping = 3,
    /// Every owned task joined.
    Closed = 4,
}

impl ServiceState {
    fn from_u8(value: u8) -> ServiceState {
        match value {
            0 => ServiceState::Created,
            1 => ServiceState::Starting,
            2 => ServiceState::Running,
            3 => ServiceState::Stopping,
            _ => ServiceState::Closed,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Created => write!(f, "created"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Closed => write!(f, "closed"),
        }
    }
}

/// Errors raised while starting a service.
#[derive(Debug)]
pub enum ServiceError {
    /// A configured listening socket could not be bound.
    Bind(SocketAddr, io::Error),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Bind(addr, err) => {
                write!(f, "Failed to bind listening socket {addr}: {err}")
            }
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServiceError::Bind(_, err) => Some(err),
        }
    }
}

/// Behaviour the service requires from the node's API layer.
pub trait NodeApi: Send + Sync + 'static {
    /// Flag the API layer as shutting down. Called exactly once, from
    /// `stop`.
    fn begin_shutdown(&self);
}

/// Capability interface for API layers that accept a server handle.
///
/// Implemented only by API variants that want the transport at
/// construction; [`ServiceBuilder::bind_api_server`] compiles solely for
/// those.
pub trait SupportsServerBinding<T>: NodeApi {
    /// Receive the transport the service was built around.
    fn bind_server(&self, transport: &Arc<T>);
}

/// Cleanup future an RPC task hands back once it stops serving.
pub type RpcCleanup = Pin<Box<dyn Future<Output = ()> + Send>>;

type RpcTask = Pin<Box<dyn Future<Output = RpcCleanup> + Send>>;
type RpcFactory<T, A> = Box<dyn FnOnce(StopHandle<T, A>) -> RpcTask + Send>;
type StartHook = Pin<Box<dyn Future<Output = ()> + Send>>;
type ClosedHook = Pin<Box<dyn Future<Output = ()> + Send>>;
type StopHook = Box<dyn FnOnce() + Send>;

struct StopShared<T, A> {
    stopping: AtomicBool,
    state: AtomicU8,
    shutdown: watch::Sender<bool>,
    transport: Arc<T>,
    api: Arc<A>,
}

/// Cloneable handle triggering an idempotent service stop.
///
/// Handed to signal handlers and the RPC task so any of them can wind the
/// service down.
pub struct StopHandle<T, A> {
    inner: Arc<StopShared<T, A>>,
}

impl<T, A> Clone for StopHandle<T, A> {
    fn clone(&self) -> Self {
        StopHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport, A: NodeApi> StopHandle<T, A> {
    /// Stop the service: signal every owned task, close active
    /// connections, flag the API layer. Repeated calls are no-ops.
    pub fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ServiceState::Stopping);
        let open = self.inner.transport.pool_size();
        info!("service stopping, closing {open} connection(s)");
        let _ = self.inner.shutdown.send(true);
        for peer in self.inner.transport.connections() {
            self.inner.transport.disconnect(&peer);
        }
        self.inner.api.begin_shutdown();
    }

    /// Whether a stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ServiceState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Builder for a [`Service`].
pub struct ServiceBuilder<T: Transport, A: NodeApi> {
    config: Config,
    book: SharedAddressBook,
    transport: Arc<T>,
    api: Arc<A>,
    listen_addrs: Vec<SocketAddr>,
    connect_peers: Vec<PeerAddress>,
    rpc: Option<RpcFactory<T, A>>,
    on_start: Option<StartHook>,
    on_stop: Option<StopHook>,
    on_closed: Option<ClosedHook>,
}

impl<T: Transport, A: NodeApi> ServiceBuilder<T, A> {
    /// Start building a service around a shared book, a transport and the
    /// node's API layer.
    pub fn new(config: Config, book: SharedAddressBook, transport: Arc<T>, api: Arc<A>) -> Self {
        ServiceBuilder {
            config,
            book,
            transport,
            api,
            listen_addrs: Vec::new(),
            connect_peers: Vec::new(),
            rpc: None,
            on_start: None,
            on_stop: None,
            on_closed: None,
        }
    }

    /// Add a listening socket address. Binding it is part of `start` and
    /// a bind failure aborts startup.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addrs.push(addr);
        self
    }

    /// Add a statically configured peer kept connected by a reconnect
    /// task.
    pub fn with_connect_peer(mut self, peer: PeerAddress) -> Self {
        self.connect_peers.push(peer);
        self
    }

    /// Attach an RPC task. The factory receives a [`StopHandle`] and its
    /// future resolves to the task's own cleanup future, awaited after
    /// close.
    pub fn with_rpc<F, Fut>(mut self, factory: F) -> Self
    where
        F: FnOnce(StopHandle<T, A>) -> Fut + Send + 'static,
        Fut: Future<Output = RpcCleanup> + Send + 'static,
    {
        self.rpc = Some(Box::new(move |handle| Box::pin(factory(handle))));
        self
    }

    /// Run a hook before any task is spawned.
    pub fn on_start<Fut>(mut self, hook: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_start = Some(Box::pin(hook));
        self
    }

    /// Run a hook after every owned task has been joined.
    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_stop = Some(Box::new(hook));
        self
    }

    /// Run an async hook once the service has reached `Closed`.
    pub fn on_closed<Fut>(mut self, hook: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_closed = Some(Box::pin(hook));
        self
    }

    /// Hand the transport to an API layer with the server-binding
    /// capability.
    pub fn bind_api_server(self) -> Self
    where
        A: SupportsServerBinding<T>,
    {
        self.api.bind_server(&self.transport);
        self
    }

    /// Assemble the service.
    pub fn build(self) -> Service<T, A> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stop_handle = StopHandle {
            inner: Arc::new(StopShared {
                stopping: AtomicBool::new(false),
                state: AtomicU8::new(ServiceState::Created as u8),
                shutdown: shutdown_tx,
                transport: Arc::clone(&self.transport),
                api: self.api,
            }),
        };
        Service {
            config: self.config,
            book: self.book,
            transport: self.transport,
            listen_addrs: self.listen_addrs,
            connect_peers: self.connect_peers,
            rpc: self.rpc,
            on_start: self.on_start,
            on_stop: self.on_stop,
            on_closed: self.on_closed,
            stop_handle,
            shutdown_rx,
            tasks: Vec::new(),
            rpc_task: None,
            local_addrs: Vec::new(),
        }
    }
}

/// Owns and supervises the networking layer's tasks and sockets.
pub struct Service<T: Transport, A: NodeApi> {
    config: Config,
    book: SharedAddressBook,
    transport: Arc<T>,
    listen_addrs: Vec<SocketAddr>,
    connect_peers: Vec<PeerAddress>,
    rpc: Option<RpcFactory<T, A>>,
    on_start: Option<StartHook>,
    on_stop: Option<StopHook>,
    on_closed: Option<ClosedHook>,
    stop_handle: StopHandle<T, A>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
    rpc_task: Option<JoinHandle<RpcCleanup>>,
    local_addrs: Vec<SocketAddr>,
}

impl<T: Transport, A: NodeApi> Service<T, A> {
    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.stop_handle.state()
    }

    /// Addresses the listeners actually bound to. Useful with port 0.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// A cloneable handle that stops this service.
    pub fn stop_handle(&self) -> StopHandle<T, A> {
        self.stop_handle.clone()
    }

    /// Request a stop. Idempotent.
    pub fn stop(&self) {
        self.stop_handle.stop();
    }

    /// Spawn every owned task and bind the listening sockets.
    ///
    /// The only fatal startup condition is a listener that cannot be
    /// bound; everything else degrades gracefully at runtime. Calling
    /// `start` on an already started service is a no-op.
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        if self.state() != ServiceState::Created {
            return Ok(());
        }
        self.stop_handle.set_state(ServiceState::Starting);
        info!("service starting: {}", self.config);

        if let Some(hook) = self.on_start.take() {
            hook.await;
        }

        let shutdown = self.shutdown_rx.clone();

        if let Some(introducer) = self.config.introducer.clone() {
            let poller = IntroducerPoller::new(
                Arc::clone(&self.book),
                Arc::clone(&self.transport),
                introducer,
                &self.config,
            );
            self.tasks.push(tokio::spawn(poller.run(shutdown.clone())));
        }

        let scheduler = ConnectionScheduler::new(
            Arc::clone(&self.book),
            Arc::clone(&self.transport),
            &self.config,
            StdRandom::from_entropy(),
        );
        self.tasks.push(tokio::spawn(scheduler.run(shutdown.clone())));

        if let Some(factory) = self.rpc.take() {
            self.rpc_task = Some(tokio::spawn(factory(self.stop_handle())));
        }

        for peer in self.connect_peers.clone() {
            self.tasks.push(start_reconnect_task(
                Arc::clone(&self.transport),
                peer,
                shutdown.clone(),
            ));
        }

        for addr in self.listen_addrs.clone() {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|err| ServiceError::Bind(addr, err))?;
            let local = listener
                .local_addr()
                .map_err(|err| ServiceError::Bind(addr, err))?;
            info!("listening on {local}");
            self.local_addrs.push(local);
            self.tasks.push(tokio::spawn(accept_loop(
                listener,
                Arc::clone(&self.transport),
                shutdown.clone(),
            )));
        }

        self.install_signal_handlers();
        self.stop_handle.set_state(ServiceState::Running);
        info!("service running");
        Ok(())
    }

    /// Wait for shutdown, then join every owned task.
    ///
    /// Tasks outliving the configured grace period are aborted. Runs the
    /// stop hook, transitions to `Closed`, runs the close hook, and
    /// finally awaits the RPC task's own cleanup.
    pub async fn wait_closed(&mut self) {
        let mut shutdown = self.shutdown_rx.clone();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        for mut task in self.tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                warn!("task exceeded shutdown grace, aborting");
                task.abort();
                let _ = task.await;
            }
        }

        if let Some(hook) = self.on_stop.take() {
            hook();
        }
        self.stop_handle.set_state(ServiceState::Closed);
        if let Some(hook) = self.on_closed.take() {
            hook.await;
        }
        if let Some(rpc) = self.rpc_task.take() {
            match rpc.await {
                Ok(cleanup) => {
                    cleanup.await;
                    info!("rpc task closed");
                }
                Err(err) => warn!("rpc task failed: {err}"),
            }
        }
        info!("service fully closed");
    }

    /// Start the service and block until it is fully closed.
    pub async fn run(&mut self) -> Result<(), ServiceError> {
        self.start().await?;
        self.wait_closed().await;
        Ok(())
    }

    /// Map OS termination signals to `stop`.
    ///
    /// Installation failure is logged and non-fatal; the service then runs
    /// without signal integration.
    fn install_signal_handlers(&mut self) {
        let handle = self.stop_handle();
        let mut shutdown = self.shutdown_rx.clone();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut interrupt, mut terminate) =
                match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                    (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
                    (Err(err), _) | (_, Err(err)) => {
                        info!("signal handlers unsupported: {err}");
                        return;
                    }
                };
            self.tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = interrupt.recv() => info!("received SIGINT"),
                    _ = terminate.recv() => info!("received SIGTERM"),
                }
                handle.stop();
            }));
        }

        #[cfg(not(unix))]
        {
            self.tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    signal = tokio::signal::ctrl_c() => match signal {
                        Ok(()) => info!("received interrupt"),
                        Err(err) => {
                            info!("signal handlers unsupported: {err}");
                            return;
                        }
                    },
                }
                handle.stop();
            }));
        }
    }
}

async fn accept_loop<T: Transport>(
    listener: TcpListener,
    transport: Arc<T>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("inbound connection from {addr}");
                    transport.handle_inbound(stream, addr);
                }
                Err(err) => warn!("accept failed: {err}"),
            }
        }
    }
    // dropping the listener closes the socket
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            ServiceState::Created,
            ServiceState::Starting,
            ServiceState::Running,
            ServiceState::Stopping,
            ServiceState::Closed,
        ] {
            assert_eq!(ServiceState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::Running.to_string(), "running");
        assert_eq!(ServiceState::Closed.to_string(), "closed");
    }
}
