//! The pool / topology manager: owns the host table and the connection list,
//! selects connections for operations, and recovers from partial outages.
//!
//! Shared mutable state lives behind one async mutex (`PoolState`); each
//! connection's pending-waiter table is the only other shared state and is
//! owned by the connection itself.

use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::{Duration, Instant, timeout_at};
use tokio_rustls::TlsConnector;

use crate::bson::{Bson, Document};
use crate::config::{ClientOptions, HostAddr};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::{REPLY_QUERY_FAILURE, RequestIds};
use crate::tls;
use crate::topology::{self, Host, HostState, ServerInfo};

/// Cheap clonable handle to the shared manager.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    options: ClientOptions,
    connector: Option<TlsConnector>,
    ids: RequestIds,
    state: AsyncMutex<PoolState>,
    /// Counting semaphore bounding concurrent operations process-wide.
    op_slots: Arc<Semaphore>,
    /// Signalled when capacity frees: an operation finished or a connection
    /// was removed.
    freed: Notify,
    /// Capabilities cached from whichever host answered first.
    server_info: OnceLock<ServerInfo>,
    shutdown: watch::Sender<bool>,
}

struct PoolState {
    hosts: Vec<Host>,
    connections: Vec<Arc<Connection>>,
    /// Reserved-but-not-yet-established connections; counted against the
    /// caps so concurrent checkouts cannot stampede past them.
    pending_opens: usize,
    next_connection_id: u64,
    /// Single in-flight guard so reinitialization attempts never overlap.
    reinit_in_flight: bool,
}

enum Plan {
    Reuse(Arc<Connection>),
    Open { addr: HostAddr, connection_id: u64 },
    Wait,
    NoEligibleHost(String),
}

impl Pool {
    /// Build the pool, discover the topology, and start maintenance.
    pub async fn connect(options: ClientOptions) -> Result<Pool> {
        options.validate()?;
        let connector = match &options.tls {
            Some(tls_options) => Some(tls::build_tls_connector(tls_options)?),
            None => None,
        };

        let op_capacity = options.max_connections * options.max_operations_per_connection;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let hosts = options.hosts.iter().cloned().map(Host::new).collect();
        let maintenance_interval = options.maintenance_interval;

        let inner = Arc::new(PoolInner {
            options,
            connector,
            ids: RequestIds::new(),
            state: AsyncMutex::new(PoolState {
                hosts,
                connections: Vec::new(),
                pending_opens: 0,
                next_connection_id: 0,
                reinit_in_flight: false,
            }),
            op_slots: Arc::new(Semaphore::new(op_capacity)),
            freed: Notify::new(),
            server_info: OnceLock::new(),
            shutdown,
        });

        discover(&inner).await;
        {
            let state = inner.state.lock().await;
            if !state.hosts.iter().any(Host::is_online) {
                return Err(Error::NoServersAvailable(
                    "no configured host answered the handshake".to_string(),
                ));
            }
        }

        tokio::spawn(maintenance_loop(
            Arc::downgrade(&inner),
            maintenance_interval,
            shutdown_rx,
        ));
        Ok(Pool { inner })
    }

    /// Run one command against an eligible connection and return the server's
    /// reply document.
    pub async fn run_command(
        &self,
        db: &str,
        cmd: Document,
        write_intent: bool,
    ) -> Result<Document> {
        self.run_command_with_source(db, cmd, write_intent)
            .await
            .map(|(doc, _)| doc)
    }

    /// Like `run_command`, also reporting which host served the request so
    /// cursors can pin their follow-ups.
    pub async fn run_command_with_source(
        &self,
        db: &str,
        cmd: Document,
        write_intent: bool,
    ) -> Result<(Document, HostAddr)> {
        let pooled = checkout(&self.inner, db, write_intent, None).await?;
        self.issue(pooled, db, cmd).await
    }

    /// Run one command on the given host (cursor `getMore`/`killCursors`).
    pub async fn run_command_on(
        &self,
        addr: &HostAddr,
        db: &str,
        cmd: Document,
    ) -> Result<Document> {
        let pooled = checkout(&self.inner, db, false, Some(addr)).await?;
        self.issue(pooled, db, cmd).await.map(|(doc, _)| doc)
    }

    async fn issue(
        &self,
        pooled: PooledConnection,
        db: &str,
        mut cmd: Document,
    ) -> Result<(Document, HostAddr)> {
        cmd.insert("$db", db);
        let request_id = self.inner.ids.next();
        let result = pooled
            .conn
            .run_command(&cmd, request_id, self.inner.options.operation_timeout)
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_network_error() {
                    // Transport errors fail the operation immediately; the
                    // connection leaves the pool and, on a replica set, a
                    // reinitialization runs for the benefit of later calls.
                    remove_connection(&self.inner, &pooled.conn).await;
                    trigger_reinit(&self.inner);
                }
                return Err(e);
            }
        };

        let doc = reply.first_document()?.clone();
        if reply.flags & REPLY_QUERY_FAILURE != 0 || !command_ok(&doc) {
            return Err(Error::from_command_response(doc));
        }
        Ok((doc, pooled.conn.addr().clone()))
    }

    /// Capabilities reported during initial connect.
    pub fn server_info(&self) -> ServerInfo {
        self.inner
            .server_info
            .get()
            .cloned()
            .unwrap_or_default()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Snapshot of the host table.
    pub async fn hosts(&self) -> Vec<Host> {
        self.inner.state.lock().await.hosts.clone()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .await
            .connections
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Force a topology reinitialization pass (no-op while one is running).
    pub async fn reinitialize(&self) {
        reinitialize(&self.inner).await;
    }

    /// Close every connection and stop the maintenance loop.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let connections: Vec<Arc<Connection>> = {
            let mut state = self.inner.state.lock().await;
            state.connections.drain(..).collect()
        };
        for conn in connections {
            conn.close();
        }
        self.inner.op_slots.close();
        tracing::debug!("pool shut down");
    }
}

/// An operation's hold on one connection. Dropping it releases the in-use
/// count, the operation slot, and wakes one queued waiter.
pub struct PooledConnection {
    inner: Arc<PoolInner>,
    conn: Arc<Connection>,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.conn.release();
        self.inner.freed.notify_one();
    }
}

fn command_ok(doc: &Document) -> bool {
    doc.get("ok").and_then(Bson::as_numeric_i64) == Some(1)
}

/// Select or create a connection for an operation.
async fn checkout(
    inner: &Arc<PoolInner>,
    db: &str,
    write_intent: bool,
    pinned: Option<&HostAddr>,
) -> Result<PooledConnection> {
    let deadline = Instant::now() + inner.options.wait_queue_timeout;

    let permit = match timeout_at(deadline, inner.op_slots.clone().acquire_owned()).await {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => {
            return Err(Error::NoServersAvailable("pool is shut down".to_string()));
        }
        Err(_) => {
            return Err(Error::Timeout(
                "acquiring an operation slot".to_string(),
            ));
        }
    };

    loop {
        let plan = {
            let mut state = inner.state.lock().await;
            plan_checkout(&mut state, &inner.options, db, write_intent, pinned)
        };
        match plan {
            Plan::Reuse(conn) => {
                conn.acquire();
                return Ok(PooledConnection {
                    inner: inner.clone(),
                    conn,
                    _permit: permit,
                });
            }
            Plan::Open {
                addr,
                connection_id,
            } => {
                match Connection::establish(
                    connection_id,
                    addr.clone(),
                    &inner.options,
                    inner.connector.as_ref(),
                    &inner.ids,
                )
                .await
                {
                    Ok(established) => {
                        let conn = established.connection;
                        conn.acquire();
                        {
                            let mut state = inner.state.lock().await;
                            state.connections.push(conn.clone());
                            state.pending_opens = state.pending_opens.saturating_sub(1);
                        }
                        // The new connection can take multiplexed operations.
                        inner.freed.notify_waiters();
                        return Ok(PooledConnection {
                            inner: inner.clone(),
                            conn,
                            _permit: permit,
                        });
                    }
                    Err(e) => {
                        // Give the reservation back. Transport failures take
                        // the host out of rotation until a reinitialization
                        // revisits it; credential problems leave it alone.
                        let host_down =
                            e.is_network_error() || matches!(e, Error::Timeout(_));
                        {
                            let mut state = inner.state.lock().await;
                            state.pending_opens = state.pending_opens.saturating_sub(1);
                            if let Some(host) =
                                state.hosts.iter_mut().find(|h| h.addr == addr)
                            {
                                host.open_connections =
                                    host.open_connections.saturating_sub(1);
                                if host_down {
                                    host.state = HostState::Offline;
                                }
                            }
                        }
                        tracing::warn!(%addr, error = %e, "failed to open connection");
                        if host_down {
                            trigger_reinit(inner);
                        }
                        return Err(e);
                    }
                }
            }
            Plan::NoEligibleHost(reason) => {
                return Err(Error::NoServersAvailable(reason));
            }
            Plan::Wait => {
                if timeout_at(deadline, inner.freed.notified()).await.is_err() {
                    return Err(Error::Timeout(
                        "waiting for a pooled connection".to_string(),
                    ));
                }
            }
        }
    }
}

fn plan_checkout(
    state: &mut PoolState,
    options: &ClientOptions,
    db: &str,
    write_intent: bool,
    pinned: Option<&HostAddr>,
) -> Plan {
    // Reuse: live, below the per-connection operation cap, and satisfying the
    // read/write requirement. Prefer a connection already authenticated to
    // the target database, then fewest in-flight operations.
    let mut best: Option<&Arc<Connection>> = None;
    for conn in &state.connections {
        if conn.is_closed() || conn.in_use() >= options.max_operations_per_connection {
            continue;
        }
        let suitable = match pinned {
            Some(addr) => conn.addr() == addr,
            None => {
                conn.is_writable() || (!write_intent && options.read_from_secondaries)
            }
        };
        if !suitable {
            continue;
        }
        let better = match best {
            None => true,
            Some(current) => {
                let (a, b) = (
                    conn.is_authenticated_for(db),
                    current.is_authenticated_for(db),
                );
                a && !b || (a == b && conn.in_use() < current.in_use())
            }
        };
        if better {
            best = Some(conn);
        }
    }
    if let Some(conn) = best {
        return Plan::Reuse(conn.clone());
    }

    // Open a new connection: eligible hosts, primary-preferring, fewest open.
    let eligible = |host: &Host| match pinned {
        Some(addr) => host.addr == *addr && host.is_online(),
        None => match host.state {
            HostState::Primary => true,
            HostState::Secondary => !write_intent && options.read_from_secondaries,
            HostState::Unknown | HostState::Offline => false,
        },
    };
    if !state.hosts.iter().any(|h| eligible(h)) {
        let reason = match pinned {
            Some(addr) => format!("host {} is not available", addr),
            None if write_intent => "no primary available for writes".to_string(),
            None => "no readable host available".to_string(),
        };
        return Plan::NoEligibleHost(reason);
    }

    let total_open = state.connections.iter().filter(|c| !c.is_closed()).count()
        + state.pending_opens;
    if total_open < options.max_connections {
        let candidate = state
            .hosts
            .iter_mut()
            .filter(|h| eligible(h) && h.open_connections < options.max_connections_per_host)
            .min_by_key(|h| (h.state != HostState::Primary, h.open_connections));
        if let Some(host) = candidate {
            host.open_connections += 1; // reserved before the connect await
            state.pending_opens += 1;
            let connection_id = state.next_connection_id;
            state.next_connection_id += 1;
            return Plan::Open {
                addr: host.addr.clone(),
                connection_id,
            };
        }
    }
    Plan::Wait
}

async fn remove_connection(inner: &Arc<PoolInner>, conn: &Arc<Connection>) {
    conn.close();
    let mut state = inner.state.lock().await;
    if let Some(pos) = state
        .connections
        .iter()
        .position(|c| Arc::ptr_eq(c, conn))
    {
        state.connections.remove(pos);
        if let Some(host) = state.hosts.iter_mut().find(|h| h.addr == *conn.addr()) {
            host.open_connections = host.open_connections.saturating_sub(1);
        }
        tracing::info!(conn = conn.id(), addr = %conn.addr(), "removed dead connection");
    }
    drop(state);
    inner.freed.notify_waiters();
}

/// Probe every configured host and rewrite the host table. Handshake results
/// are applied under the manager's lock; a failure against one host never
/// aborts discovery for the others.
async fn discover(inner: &Arc<PoolInner>) {
    let addrs: Vec<HostAddr> = {
        let state = inner.state.lock().await;
        state.hosts.iter().map(|h| h.addr.clone()).collect()
    };

    for addr in addrs {
        let outcome = topology::probe_host(
            &addr,
            inner.connector.as_ref(),
            &inner.ids,
            &inner.options,
        )
        .await;

        let mut state = inner.state.lock().await;
        let Some(host) = state.hosts.iter_mut().find(|h| h.addr == addr) else {
            continue;
        };
        match outcome {
            Ok(reply) => {
                host.state = if topology::reports_writable(&reply) {
                    HostState::Primary
                } else {
                    HostState::Secondary
                };
                tracing::info!(%addr, state = ?host.state, "host handshake succeeded");
                let _ = inner
                    .server_info
                    .set(ServerInfo::from_handshake(&reply));
            }
            Err(e) => {
                // Offline, but kept as a candidate for the next pass.
                host.state = HostState::Offline;
                tracing::warn!(%addr, error = %e, "host handshake failed");
            }
        }
    }

    // Rebind connection writability to the refreshed host roles.
    let state = inner.state.lock().await;
    for conn in &state.connections {
        let writable = state
            .hosts
            .iter()
            .any(|h| h.addr == *conn.addr() && h.state == HostState::Primary);
        conn.set_writable(writable);
    }
}

/// Re-run discovery, guarded by the single in-flight flag.
async fn reinitialize(inner: &Arc<PoolInner>) {
    {
        let mut state = inner.state.lock().await;
        if state.reinit_in_flight {
            return;
        }
        state.reinit_in_flight = true;
    }
    tracing::info!("reinitializing topology");
    discover(inner).await;
    inner.state.lock().await.reinit_in_flight = false;
    inner.freed.notify_waiters();
}

/// Kick off reinitialization without blocking the caller. Only replica-set
/// topologies reinitialize on disconnects.
fn trigger_reinit(inner: &Arc<PoolInner>) {
    if inner.options.replica_set.is_none() {
        return;
    }
    let inner = inner.clone();
    tokio::spawn(async move {
        reinitialize(&inner).await;
    });
}

/// Long-lived maintenance task: each tick scans for dead connections and
/// hands them to the disconnect handler. Holds only a weak handle so an
/// abandoned pool can drop.
async fn maintenance_loop(
    inner: Weak<PoolInner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                maintenance_pass(&inner).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("maintenance loop stopped");
}

async fn maintenance_pass(inner: &Arc<PoolInner>) {
    let dead: Vec<Arc<Connection>> = {
        let mut state = inner.state.lock().await;
        let mut dead = Vec::new();
        let mut live = Vec::new();
        for conn in state.connections.drain(..) {
            if conn.is_closed() {
                dead.push(conn);
            } else {
                live.push(conn);
            }
        }
        state.connections = live;
        for conn in &dead {
            if let Some(host) = state.hosts.iter_mut().find(|h| h.addr == *conn.addr()) {
                host.open_connections = host.open_connections.saturating_sub(1);
            }
        }
        dead
    };

    for conn in &dead {
        tracing::info!(conn = conn.id(), addr = %conn.addr(), "maintenance removed dead connection");
    }
    if !dead.is_empty() {
        inner.freed.notify_waiters();
    }

    let all_offline = {
        let state = inner.state.lock().await;
        !state.hosts.iter().any(Host::is_online)
    };
    // Reinitialize after member disconnects on a replica set, and whenever
    // the whole topology has gone dark (offline hosts are revisited only by
    // these passes, never mid-operation).
    if (!dead.is_empty() && inner.options.replica_set.is_some()) || all_offline {
        reinitialize(inner).await;
    }
}
