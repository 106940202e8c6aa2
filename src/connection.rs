//! One socket, one reader task, and a table of waiters keyed by request id.
//!
//! Requests on the same connection are matched to replies strictly by id,
//! never by send order, so multiplexed callers tolerate out-of-order replies.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tokio_rustls::TlsConnector;

use crate::bson::Document;
use crate::config::{ClientOptions, HostAddr};
use crate::error::{Error, Result};
use crate::protocol::compress::{self, Compressor};
use crate::protocol::{
    DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN, MessageHeader, OP_MSG, Reply, RequestIds, decode_reply,
    encode_op_msg,
};
use crate::scram::ScramAuth;
use crate::tls::{self, MaybeTlsStream};
use crate::topology;

pub struct Connection {
    id: u64,
    addr: HostAddr,
    writer: AsyncMutex<WriteHalf<MaybeTlsStream>>,
    pending: Mutex<Pending>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// In-flight operations currently holding this connection.
    in_use: AtomicUsize,
    /// Bound to the host's primary role at establish time; cleared when a
    /// reinitialization demotes the host.
    writable: AtomicBool,
    /// The logical database this connection authenticated against, if any.
    /// One-way: never reinterpreted for a different database.
    authenticated_db: Option<String>,
    compressor: Option<Compressor>,
    max_message_size: i32,
}

struct Pending {
    closed: bool,
    waiters: HashMap<i32, oneshot::Sender<Reply>>,
}

pub(crate) struct Established {
    pub connection: Arc<Connection>,
    pub handshake: Document,
}

impl Connection {
    /// Open a socket to `addr`, run the handshake and (when credentials are
    /// configured) authentication, then start the reader task.
    pub(crate) async fn establish(
        id: u64,
        addr: HostAddr,
        options: &ClientOptions,
        connector: Option<&TlsConnector>,
        ids: &RequestIds,
    ) -> Result<Established> {
        let mut stream = tls::connect(&addr, connector, options.connect_timeout).await?;
        let handshake =
            topology::is_master_exchange(&mut stream, ids, options, options.connect_timeout)
                .await?;
        let compressor = topology::negotiated_compressor(&handshake, &options.compressors);
        let max_message_size = handshake
            .get_i32("maxMessageSizeBytes")
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);

        let mut authenticated_db = None;
        if let Some(cred) = &options.credential {
            let mut auth = ScramAuth::new(
                cred.username.clone(),
                cred.password.clone(),
                cred.source.clone(),
            );
            auth.authenticate(&mut stream, ids, options.operation_timeout)
                .await?;
            authenticated_db = Some(cred.source.clone());
        }

        let writable = topology::reports_writable(&handshake);
        let connection = Connection::spawn(
            stream,
            id,
            addr,
            writable,
            authenticated_db,
            compressor,
            max_message_size,
        );
        tracing::debug!(conn = id, addr = %connection.addr, writable, "connection established");
        Ok(Established {
            connection,
            handshake,
        })
    }

    /// Wrap an already-negotiated stream and start its reader task.
    pub(crate) fn spawn(
        stream: MaybeTlsStream,
        id: u64,
        addr: HostAddr,
        writable: bool,
        authenticated_db: Option<String>,
        compressor: Option<Compressor>,
        max_message_size: i32,
    ) -> Arc<Connection> {
        let (read_half, write_half) = tokio::io::split(stream);
        let connection = Arc::new(Connection {
            id,
            addr,
            writer: AsyncMutex::new(write_half),
            pending: Mutex::new(Pending {
                closed: false,
                waiters: HashMap::new(),
            }),
            reader: Mutex::new(None),
            in_use: AtomicUsize::new(0),
            writable: AtomicBool::new(writable),
            authenticated_db,
            compressor,
            max_message_size,
        });
        let handle = tokio::spawn(read_loop(read_half, Arc::clone(&connection)));
        *connection.reader.lock().unwrap() = Some(handle);
        connection
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &HostAddr {
        &self.addr
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.in_use.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().unwrap().closed
    }

    /// True when this connection authenticated against `db`. A connection
    /// authenticated to one database is never treated as authenticated for
    /// another.
    pub fn is_authenticated_for(&self, db: &str) -> bool {
        self.authenticated_db.as_deref() == Some(db)
    }

    /// Install a waiter for `request_id`. The closed check and the insertion
    /// happen under one lock, so no waiter can slip in after `close`.
    fn register_waiter(&self, request_id: i32) -> Result<oneshot::Receiver<Reply>> {
        let mut pending = self.pending.lock().unwrap();
        if pending.closed {
            return Err(Error::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(request_id, tx);
        Ok(rx)
    }

    fn remove_waiter(&self, request_id: i32) {
        self.pending.lock().unwrap().waiters.remove(&request_id);
    }

    #[cfg(test)]
    fn pending_waiters(&self) -> usize {
        self.pending.lock().unwrap().waiters.len()
    }

    /// Write one full frame. Back-pressure comes from the socket buffer.
    pub(crate) async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    fn encode_command(&self, cmd: &Document, request_id: i32) -> Result<Bytes> {
        let plain = encode_op_msg(cmd, 0, request_id)?;
        match self.compressor {
            Some(c) => {
                compress::encode_op_compressed(OP_MSG, &plain[HEADER_LEN..], c, 0, request_id)
            }
            None => Ok(plain),
        }
    }

    /// Register a waiter, send the command, and await the matching reply with
    /// a bounded timeout. On timeout the waiter is removed and the in-flight
    /// request is abandoned locally, not cancelled on the wire.
    pub(crate) async fn run_command(
        &self,
        cmd: &Document,
        request_id: i32,
        dur: Duration,
    ) -> Result<Reply> {
        let rx = self.register_waiter(request_id)?;
        let wire = self.encode_command(cmd, request_id)?;
        if let Err(e) = self.send(&wire).await {
            self.remove_waiter(request_id);
            self.close();
            return Err(e);
        }
        match timeout(dur, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.remove_waiter(request_id);
                Err(Error::Timeout(format!(
                    "waiting for reply to request {}",
                    request_id
                )))
            }
        }
    }

    /// Mark the connection dead and fail every pending waiter. Atomic with
    /// the dead-mark: a waiter observing the connection as open always gets
    /// either its reply or a `ConnectionClosed` failure.
    pub(crate) fn close(&self) {
        let waiters = {
            let mut pending = self.pending.lock().unwrap();
            if pending.closed {
                return;
            }
            pending.closed = true;
            std::mem::take(&mut pending.waiters)
        };
        if !waiters.is_empty() {
            tracing::debug!(conn = self.id, waiters = waiters.len(),
                "closing connection with pending waiters");
        }
        // Dropping the senders wakes each receiver with a closed-channel
        // error, surfaced as ConnectionClosed.
        drop(waiters);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(mut reader: ReadHalf<MaybeTlsStream>, conn: Arc<Connection>) {
    loop {
        let mut header = [0u8; HEADER_LEN];
        if let Err(e) = reader.read_exact(&mut header).await {
            tracing::debug!(conn = conn.id, error = %e, "read loop ending");
            break;
        }
        let Some((hdr, _)) = MessageHeader::parse(&header) else {
            tracing::warn!(conn = conn.id, "unparseable reply header");
            break;
        };
        let body_len = match hdr.body_len(conn.max_message_size) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(conn = conn.id, error = %e, "invalid reply length");
                break;
            }
        };
        let mut body = vec![0u8; body_len];
        if let Err(e) = reader.read_exact(&mut body).await {
            tracing::debug!(conn = conn.id, error = %e, "read loop ending mid-frame");
            break;
        }
        match decode_reply(&hdr, &body) {
            Ok(reply) => {
                let waiter = conn
                    .pending
                    .lock()
                    .unwrap()
                    .waiters
                    .remove(&reply.response_to);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => {
                        tracing::debug!(conn = conn.id, response_to = reply.response_to,
                            "dropping reply with no matching waiter");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(conn = conn.id, error = %e, "failed to decode reply");
                break;
            }
        }
    }
    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::protocol::decode_op_msg_section0;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_pair() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = Connection::spawn(
            MaybeTlsStream::Plain(client),
            1,
            HostAddr::new("127.0.0.1", addr.port()),
            true,
            None,
            None,
            DEFAULT_MAX_MESSAGE_SIZE,
        );
        (conn, server)
    }

    async fn read_request(server: &mut TcpStream) -> (i32, Document) {
        let mut header = [0u8; HEADER_LEN];
        server.read_exact(&mut header).await.unwrap();
        let (hdr, _) = MessageHeader::parse(&header).unwrap();
        let mut body = vec![0u8; hdr.message_length as usize - HEADER_LEN];
        server.read_exact(&mut body).await.unwrap();
        let (_flags, doc) = decode_op_msg_section0(&body).unwrap();
        (hdr.request_id, doc)
    }

    #[tokio::test]
    async fn test_replies_route_by_id_not_send_order() {
        let (conn, mut server) = test_pair().await;

        let server_task = tokio::spawn(async move {
            let (id_a, doc_a) = read_request(&mut server).await;
            let (id_b, doc_b) = read_request(&mut server).await;
            // Answer in reverse order of arrival.
            for (id, doc) in [(id_b, doc_b), (id_a, doc_a)] {
                let echo = doc! {"ok": 1.0, "echo": doc.get_i32("value").unwrap()};
                let reply = encode_op_msg(&echo, id, 0).unwrap();
                server.write_all(&reply).await.unwrap();
            }
            server
        });

        let dur = Duration::from_secs(5);
        let doc_1 = doc! {"value": 1i32};
        let doc_2 = doc! {"value": 2i32};
        let (a, b) = tokio::join!(
            conn.run_command(&doc_1, 101, dur),
            conn.run_command(&doc_2, 102, dur),
        );
        let a = a.unwrap().first_document().unwrap().clone();
        let b = b.unwrap().first_document().unwrap().clone();
        assert_eq!(a.get_i32("echo").unwrap(), 1);
        assert_eq!(b.get_i32("echo").unwrap(), 2);
        drop(server_task);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_blocks_new_waiters() {
        let (conn, _server) = test_pair().await;

        let rx = conn.register_waiter(7).unwrap();
        conn.close();

        // The pending waiter fails...
        assert!(rx.await.is_err());
        // ...and no new waiter can register after the dead-mark.
        assert!(matches!(
            conn.register_waiter(8),
            Err(Error::ConnectionClosed)
        ));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_peer_disconnect_fails_in_flight_command() {
        let (conn, mut server) = test_pair().await;

        let task = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move {
                conn.run_command(&doc! {"ping": 1i32}, 1, Duration::from_secs(5))
                    .await
            }
        });
        // Swallow the request, then drop the socket.
        let _ = read_request(&mut server).await;
        drop(server);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter_and_surfaces_timeout() {
        let (conn, mut server) = test_pair().await;

        let result = conn
            .run_command(&doc! {"ping": 1i32}, 9, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(conn.pending_waiters(), 0);

        // The connection itself stays usable after an abandoned request.
        let _ = read_request(&mut server).await;
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_dropped() {
        let (conn, mut server) = test_pair().await;

        // A reply nobody asked for.
        let stray = encode_op_msg(&doc! {"ok": 1.0}, 999, 0).unwrap();
        server.write_all(&stray).await.unwrap();

        // The connection keeps working afterwards.
        let task = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move {
                conn.run_command(&doc! {"ping": 1i32}, 5, Duration::from_secs(5))
                    .await
            }
        });
        let (id, _) = read_request(&mut server).await;
        assert_eq!(id, 5);
        let reply = encode_op_msg(&doc! {"ok": 1.0}, id, 0).unwrap();
        server.write_all(&reply).await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }
}
