//! Per-tunnel connection pool

use crate::connection::{ChainContext, Connection, ConnectionState};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zbtunnel_config::TunnelOptions;
use zbtunnel_transport::Transport;

/// Pool policy: how many spares to build ahead, how many idle chains to
/// keep, and whether finished chains may be kept at all.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub preconnect: usize,
    pub max_reuse: usize,
    pub recycle: bool,
}

impl From<&TunnelOptions> for PoolOptions {
    fn from(options: &TunnelOptions) -> Self {
        Self {
            preconnect: options.preconnect,
            max_reuse: options.max_reuse,
            recycle: options.recycle,
        }
    }
}

#[derive(Default)]
struct PoolInner {
    /// Ids of connections currently owned by serving tasks.
    active: HashSet<u64>,
    /// Fully built idle chains, awaiting an inbound.
    reusable: Vec<Connection>,
    /// Preconnects still building; they count against `max_reuse`.
    pending_preconnects: usize,
}

/// Pool of live and reusable connections for one tunnel.
pub struct ConnectionManager {
    context: Arc<ChainContext>,
    options: PoolOptions,
    inner: Mutex<PoolInner>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(context: Arc<ChainContext>, options: PoolOptions) -> Arc<Self> {
        Arc::new(Self {
            context,
            options,
            inner: Mutex::new(PoolInner::default()),
            next_id: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    /// Token fired by `stop_all`; relays watch it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Hand out a reusable connection, or create a fresh one and top up the
    /// spare pool behind it.
    pub fn get_or_create(self: &Arc<Self>) -> Connection {
        let mut inner = self.lock();

        if let Some(conn) = inner.reusable.pop() {
            inner.active.insert(conn.id());
            info!("{} reused", conn.label());
            return conn;
        }

        let conn = self.create_locked(&mut inner);

        let room = self
            .options
            .max_reuse
            .saturating_sub(inner.reusable.len() + inner.pending_preconnects);
        for _ in 0..self.options.preconnect.min(room) {
            let spare = Connection::new(
                self.next_id.fetch_add(1, Ordering::Relaxed),
                Arc::clone(&self.context),
            );
            debug!("{} created for preconnecting", spare.label());
            inner.pending_preconnects += 1;
            self.spawn_preconnect(spare);
        }

        conn
    }

    /// Serve one inbound: finish building the chain if needed, relay, then
    /// recycle or drop.
    pub async fn serve(&self, mut conn: Connection, inbound: Box<dyn Transport>) {
        if conn.state() != ConnectionState::Connected {
            let established = tokio::select! {
                _ = self.cancel.cancelled() => false,
                result = conn.establish() => result.is_ok(),
            };
            if !established {
                self.finish(conn, false).await;
                return;
            }
        }
        let recycle_hint = conn.relay(inbound, &self.cancel).await;
        self.finish(conn, recycle_hint).await;
    }

    /// Return a finished connection to the pool when policy and its state
    /// allow, otherwise drop it.
    pub async fn finish(&self, mut conn: Connection, recycle_hint: bool) {
        {
            let mut inner = self.lock();
            inner.active.remove(&conn.id());

            if recycle_hint
                && self.options.recycle
                && !self.cancel.is_cancelled()
                && conn.state() == ConnectionState::Connected
                && conn.is_open()
                && inner.reusable.len() < self.options.max_reuse
            {
                info!("{} recycled", conn.label());
                inner.reusable.push(conn);
                return;
            }
        }

        debug!("{} stopped", conn.label());
        conn.close().await;
    }

    /// Drop a connection from the pool without recycling.
    pub fn remove(&self, id: u64) {
        let mut inner = self.lock();
        inner.active.remove(&id);
        inner.reusable.retain(|conn| conn.id() != id);
    }

    /// Force-stop everything: cancel active relays and close idle chains.
    pub async fn stop_all(&self) {
        info!("force stop all connections");
        self.cancel.cancel();

        let reusable = {
            let mut inner = self.lock();
            inner.active.clear();
            std::mem::take(&mut inner.reusable)
        };
        for mut conn in reusable {
            conn.close().await;
        }
    }

    pub fn reusable_count(&self) -> usize {
        self.lock().reusable.len()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    fn create_locked(self: &Arc<Self>, inner: &mut PoolInner) -> Connection {
        let conn = Connection::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            Arc::clone(&self.context),
        );
        inner.active.insert(conn.id());
        debug!("{} added", conn.label());
        conn
    }

    fn spawn_preconnect(self: &Arc<Self>, mut conn: Connection) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = manager.cancel.clone();
            let established = tokio::select! {
                _ = cancel.cancelled() => false,
                result = conn.establish() => result.is_ok(),
            };

            let leftover = {
                let mut inner = manager.lock();
                inner.pending_preconnects -= 1;
                if established
                    && !cancel.is_cancelled()
                    && inner.reusable.len() < manager.options.max_reuse
                {
                    debug!("{} parked for reuse", conn.label());
                    inner.reusable.push(conn);
                    None
                } else {
                    Some(conn)
                }
            };

            if let Some(mut conn) = leftover {
                conn.close().await;
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use zbtunnel_codec::CoderPool;
    use zbtunnel_config::ChainConfig;
    use zbtunnel_transport::SocketTransport;

    async fn echo_listener() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn manager_for(
        addr: SocketAddr,
        options: PoolOptions,
    ) -> Arc<ConnectionManager> {
        let chain = ChainConfig::from_hops(vec![vec![
            ("host", addr.ip().to_string()),
            ("port", addr.port().to_string()),
        ]]);
        let context = ChainContext::new("pool", chain, Arc::new(CoderPool::new()));
        ConnectionManager::new(context, options)
    }

    const NO_POOLING: PoolOptions = PoolOptions {
        preconnect: 0,
        max_reuse: 0,
        recycle: false,
    };

    #[tokio::test]
    async fn fresh_connections_get_distinct_ids() {
        let addr = echo_listener().await;
        let manager = manager_for(addr, NO_POOLING);

        let a = manager.get_or_create();
        let b = manager.get_or_create();
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.active_count(), 2);
    }

    #[tokio::test]
    async fn recycle_respects_policy_and_bounds() {
        let addr = echo_listener().await;
        let manager = manager_for(
            addr,
            PoolOptions {
                preconnect: 0,
                max_reuse: 1,
                recycle: true,
            },
        );

        let mut a = manager.get_or_create();
        a.establish().await.unwrap();
        let mut b = manager.get_or_create();
        b.establish().await.unwrap();

        manager.finish(a, true).await;
        assert_eq!(manager.reusable_count(), 1);

        // The pool is full, so the second one is dropped.
        manager.finish(b, true).await;
        assert_eq!(manager.reusable_count(), 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn recycling_disabled_never_parks() {
        let addr = echo_listener().await;
        let manager = manager_for(
            addr,
            PoolOptions {
                preconnect: 0,
                max_reuse: 4,
                recycle: false,
            },
        );

        let mut conn = manager.get_or_create();
        conn.establish().await.unwrap();
        manager.finish(conn, true).await;
        assert_eq!(manager.reusable_count(), 0);
    }

    #[tokio::test]
    async fn unconnected_chains_are_not_recycled() {
        let addr = echo_listener().await;
        let manager = manager_for(
            addr,
            PoolOptions {
                preconnect: 0,
                max_reuse: 4,
                recycle: true,
            },
        );

        let conn = manager.get_or_create();
        assert_eq!(conn.state(), ConnectionState::Init);
        manager.finish(conn, true).await;
        assert_eq!(manager.reusable_count(), 0);
    }

    #[tokio::test]
    async fn handed_out_connections_come_from_the_reusable_pool_first() {
        let addr = echo_listener().await;
        let manager = manager_for(
            addr,
            PoolOptions {
                preconnect: 0,
                max_reuse: 2,
                recycle: true,
            },
        );

        let mut conn = manager.get_or_create();
        conn.establish().await.unwrap();
        let id = conn.id();
        manager.finish(conn, true).await;

        let again = manager.get_or_create();
        assert_eq!(again.id(), id);
        assert_eq!(again.state(), ConnectionState::Connected);
        assert_eq!(manager.reusable_count(), 0);
    }

    #[tokio::test]
    async fn preconnect_tops_up_to_the_reuse_bound() {
        let addr = echo_listener().await;
        let manager = manager_for(
            addr,
            PoolOptions {
                preconnect: 3,
                max_reuse: 2,
                recycle: true,
            },
        );

        let _first = manager.get_or_create();

        // Preconnects park once their chains finish building.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while manager.reusable_count() < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(manager.reusable_count(), 2);
    }

    #[tokio::test]
    async fn remove_drops_from_both_sets() {
        let addr = echo_listener().await;
        let manager = manager_for(
            addr,
            PoolOptions {
                preconnect: 0,
                max_reuse: 4,
                recycle: true,
            },
        );

        let active = manager.get_or_create();
        let active_id = active.id();
        let mut idle = manager.get_or_create();
        idle.establish().await.unwrap();
        let idle_id = idle.id();
        manager.finish(idle, true).await;
        assert_eq!(manager.reusable_count(), 1);

        manager.remove(active_id);
        manager.remove(idle_id);
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.reusable_count(), 0);
    }

    #[tokio::test]
    async fn stop_all_clears_both_sets() {
        let addr = echo_listener().await;
        let manager = manager_for(
            addr,
            PoolOptions {
                preconnect: 0,
                max_reuse: 4,
                recycle: true,
            },
        );

        let mut idle = manager.get_or_create();
        idle.establish().await.unwrap();
        manager.finish(idle, true).await;
        let _active = manager.get_or_create();
        assert_eq!(manager.reusable_count(), 1);

        manager.stop_all().await;
        assert_eq!(manager.reusable_count(), 0);
        assert_eq!(manager.active_count(), 0);

        // Nothing is recycled after shutdown.
        let mut late = Connection::new(99, manager.context.clone());
        late.force_state(ConnectionState::Connected);
        manager.finish(late, true).await;
        assert_eq!(manager.reusable_count(), 0);
    }

    #[tokio::test]
    async fn serve_relays_and_recycles() {
        let addr = echo_listener().await;
        let manager = manager_for(
            addr,
            PoolOptions {
                preconnect: 0,
                max_reuse: 2,
                recycle: true,
            },
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let inbound_addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(inbound_addr).await.unwrap();
            stream.write_all(b"probe").await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"probe");
        });

        let conn = manager.get_or_create();
        let (accepted, _) = listener.accept().await.unwrap();
        manager
            .serve(conn, Box::new(SocketTransport::from_stream(accepted)))
            .await;

        client.await.unwrap();
        assert_eq!(manager.reusable_count(), 1);
    }
}
