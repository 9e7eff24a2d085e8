//! Tunnel lifecycle: bind, accept, relay, shut down

use crate::TunnelError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zbtunnel_codec::CoderPool;
use zbtunnel_config::{ChainConfig, GlobalConfig, TransportKind};
use zbtunnel_connection::{ChainContext, ConnectionManager, PoolOptions};
use zbtunnel_transport::{SocketTransport, StdioTransport};

const ACCEPT_BACKLOG: i32 = 1024;

/// A running tunnel and the handle to stop and join it.
pub struct Tunnel {
    name: String,
    local_addr: Option<SocketAddr>,
    manager: Arc<ConnectionManager>,
    cancel: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
}

impl Tunnel {
    /// Start a socket tunnel: bind the local acceptor (so bind failures
    /// surface to the caller) and hand it to a fresh reactor thread.
    pub fn spawn_socket(
        name: &str,
        chain: ChainConfig,
        global: &GlobalConfig,
        coders: Arc<CoderPool>,
    ) -> Result<Self, TunnelError> {
        let options = chain.tunnel_options(global)?;
        warm_coders(&chain, &coders)?;

        let ip: IpAddr = options
            .local_address
            .parse()
            .map_err(|_| TunnelError::BadLocalAddress(options.local_address.clone()))?;
        let bind_addr = SocketAddr::new(ip, options.local_port);

        // Bind and listen before the reactor spawns, so bind failures
        // surface to the caller and early clients land in the backlog.
        let socket = Socket::new(
            Domain::for_address(bind_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&bind_addr.into())
            .map_err(|source| TunnelError::Bind {
                addr: bind_addr,
                source,
            })?;
        socket
            .listen(ACCEPT_BACKLOG)
            .map_err(|source| TunnelError::Bind {
                addr: bind_addr,
                source,
            })?;
        let listener: std::net::TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let context = ChainContext::new(name, chain, coders);
        let manager = ConnectionManager::new(context, PoolOptions::from(&options));
        let cancel = manager.cancel_token();

        info!("{}: starting on {}", name, local_addr);
        let thread = {
            let name = name.to_owned();
            let manager = Arc::clone(&manager);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(format!("tunnel-{name}"))
                .spawn(move || {
                    let task_name = name.clone();
                    run_reactor(&name, move || {
                        accept_loop(task_name, listener, manager, cancel)
                    });
                })?
        };

        Ok(Self {
            name: name.to_owned(),
            local_addr: Some(local_addr),
            manager,
            cancel,
            thread: Some(thread),
        })
    }

    /// Start an io tunnel: one connection bridging stdin/stdout through the
    /// chain.
    pub fn spawn_io(
        name: &str,
        chain: ChainConfig,
        global: &GlobalConfig,
        coders: Arc<CoderPool>,
    ) -> Result<Self, TunnelError> {
        let options = chain.tunnel_options(global)?;
        warm_coders(&chain, &coders)?;

        let context = ChainContext::new(name, chain, coders);
        let manager = ConnectionManager::new(context, PoolOptions::from(&options));
        let cancel = manager.cancel_token();

        info!("{}: starting on stdin", name);
        let thread = {
            let name = name.to_owned();
            let manager = Arc::clone(&manager);
            thread::Builder::new()
                .name(format!("tunnel-{name}"))
                .spawn(move || {
                    let task_name = name.clone();
                    run_reactor(&name, move || io_loop(task_name, manager));
                })?
        };

        Ok(Self {
            name: name.to_owned(),
            local_addr: None,
            manager,
            cancel,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound acceptor address; `None` for an io tunnel.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn reusable_connections(&self) -> usize {
        self.manager.reusable_count()
    }

    pub fn active_connections(&self) -> usize {
        self.manager.active_count()
    }

    /// Ask the reactor to shut down: the acceptor closes and every pool
    /// connection stops. Safe to call from any thread, and more than once.
    pub fn stop(&self) {
        debug!("{}: stop requested", self.name);
        self.cancel.cancel();
    }

    /// Whether the reactor thread has already exited (e.g. an io tunnel
    /// whose stdin reached EOF).
    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map_or(true, |thread| thread.is_finished())
    }

    /// Wait for the reactor thread to exit.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{}: reactor thread panicked", self.name);
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

/// Build a current-thread runtime and drive the tunnel's main future on it.
fn run_reactor<F, Fut>(name: &str, main: F)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    debug!("{}: worker started", name);
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("{}: failed to build reactor: {}", name, e);
            return;
        }
    };
    runtime.block_on(main());
    info!("{}: service exited", name);
}

async fn accept_loop(
    name: String,
    listener: std::net::TcpListener,
    manager: Arc<ConnectionManager>,
    cancel: CancellationToken,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("{}: unable to register the acceptor: {}", name, e);
            manager.stop_all().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{}: acceptor stopped", name);
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("{}: accepted a new connection from {}", name, peer);
                    let _ = stream.set_nodelay(true);
                    let conn = manager.get_or_create();
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move {
                        manager
                            .serve(conn, Box::new(SocketTransport::from_stream(stream)))
                            .await;
                    });
                }
                Err(e) => {
                    warn!("{}: accept failed: {}", name, e);
                }
            },
        }
    }

    drop(listener);
    manager.stop_all().await;
}

async fn io_loop(name: String, manager: Arc<ConnectionManager>) {
    let conn = manager.get_or_create();
    manager.serve(conn, Box::new(StdioTransport::new())).await;
    debug!("{}: stdio bridge finished", name);
    manager.stop_all().await;
}

/// Build every shadow codec the chain will need, so table construction
/// overlaps tunnel startup instead of the first connection.
fn warm_coders(chain: &ChainConfig, coders: &Arc<CoderPool>) -> Result<(), TunnelError> {
    for hop in chain.iter() {
        if hop.transport()? == TransportKind::Shadow {
            let key = hop.get_or("key", "");
            if key.is_empty() {
                continue;
            }
            coders.get(hop.get_or("method", ""), key)?;
        }
    }
    Ok(())
}
