//! In-process mock server for driver e2e tests: accepts wire-protocol
//! connections on an ephemeral port, answers handshakes and a useful subset
//! of commands against an in-memory store, and exposes counters the tests
//! assert on.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use rmongo::bson::{Bson, Document};
use rmongo::doc;
use rmongo::protocol::compress::{Compressor, OpCompressed, decompress, encode_op_compressed};
use rmongo::protocol::{
    HEADER_LEN, MessageHeader, OP_COMPRESSED, OP_MSG, OP_QUERY, decode_op_msg_section0,
    decode_op_query, encode_op_msg, encode_op_reply,
};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .try_init();
}

#[derive(Default)]
pub struct MockOptions {
    pub primary: bool,
    pub set_name: Option<String>,
    /// Require SCRAM-SHA-256 with this username/password.
    pub credential: Option<(String, String)>,
    pub compressors: Vec<Compressor>,
}

impl MockOptions {
    pub fn primary() -> MockOptions {
        MockOptions {
            primary: true,
            ..Default::default()
        }
    }

    pub fn secondary() -> MockOptions {
        MockOptions::default()
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

pub struct MockState {
    primary: AtomicBool,
    online: AtomicBool,
    set_name: Option<String>,
    credential: Option<(String, String)>,
    compressors: Vec<Compressor>,

    collections: Mutex<HashMap<String, Vec<Document>>>,
    cursors: Mutex<HashMap<i64, CursorEntry>>,
    next_cursor_id: AtomicI64,

    pub connections_accepted: AtomicUsize,
    open_connections: AtomicUsize,
    max_open_connections: AtomicUsize,
    pub get_more_count: AtomicUsize,
    pub compressed_frames: AtomicUsize,

    handlers: Mutex<Vec<JoinHandle<()>>>,
}

struct CursorEntry {
    ns: String,
    docs: Vec<Document>,
    pos: usize,
}

impl MockServer {
    pub async fn spawn(options: MockOptions) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState {
            primary: AtomicBool::new(options.primary),
            online: AtomicBool::new(true),
            set_name: options.set_name,
            credential: options.credential,
            compressors: options.compressors,
            collections: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            next_cursor_id: AtomicI64::new(1),
            connections_accepted: AtomicUsize::new(0),
            open_connections: AtomicUsize::new(0),
            max_open_connections: AtomicUsize::new(0),
            get_more_count: AtomicUsize::new(0),
            compressed_frames: AtomicUsize::new(0),
            handlers: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                if !accept_state.online.load(Ordering::Acquire) {
                    drop(socket);
                    continue;
                }
                accept_state.connections_accepted.fetch_add(1, Ordering::AcqRel);
                let conn_state = accept_state.clone();
                let handle = tokio::spawn(async move {
                    let open = conn_state.open_connections.fetch_add(1, Ordering::AcqRel) + 1;
                    conn_state.max_open_connections.fetch_max(open, Ordering::AcqRel);
                    let _ = handle_connection(conn_state.clone(), socket).await;
                    conn_state.open_connections.fetch_sub(1, Ordering::AcqRel);
                });
                accept_state.handlers.lock().await.push(handle);
            }
        });

        MockServer {
            addr,
            state,
            accept_task,
        }
    }

    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn state(&self) -> &Arc<MockState> {
        &self.state
    }

    pub fn set_primary(&self, primary: bool) {
        self.state.primary.store(primary, Ordering::Release);
    }

    /// Stop answering: new sockets are dropped, established ones are killed.
    pub async fn go_offline(&self) {
        self.state.online.store(false, Ordering::Release);
        for handle in self.state.handlers.lock().await.drain(..) {
            handle.abort();
        }
    }

    pub async fn come_online(&self) {
        self.state.online.store(true, Ordering::Release);
    }

    pub async fn documents(&self, ns: &str) -> Vec<Document> {
        self.state
            .collections
            .lock()
            .await
            .get(ns)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn open_cursor_count(&self) -> usize {
        self.state.cursors.lock().await.len()
    }

    pub fn max_open_connections(&self) -> usize {
        self.state.max_open_connections.load(Ordering::Acquire)
    }

    /// Reset the open-connection high-water mark (e.g. after initial probes).
    pub fn reset_connection_watermark(&self) {
        let open = self.state.open_connections.load(Ordering::Acquire);
        self.state.max_open_connections.store(open, Ordering::Release);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

struct ConnState {
    authenticated: bool,
    compressor: Option<Compressor>,
    scram: Option<ScramServer>,
}

async fn handle_connection(state: Arc<MockState>, mut socket: TcpStream) -> std::io::Result<()> {
    let mut conn = ConnState {
        authenticated: false,
        compressor: None,
        scram: None,
    };
    loop {
        let mut header = [0u8; HEADER_LEN];
        socket.read_exact(&mut header).await?;
        let Some((hdr, _)) = MessageHeader::parse(&header) else {
            return Ok(());
        };
        let mut body = vec![0u8; hdr.message_length as usize - HEADER_LEN];
        socket.read_exact(&mut body).await?;

        let reply = match hdr.op_code {
            OP_QUERY => {
                let (_flags, _ns, _skip, _n, query) = decode_op_query(&body).unwrap();
                let doc = dispatch(&state, &mut conn, query).await;
                encode_op_reply(&[doc], 0, 0, hdr.request_id, next_server_id()).unwrap()
            }
            OP_MSG => {
                let (_flags, cmd) = decode_op_msg_section0(&body).unwrap();
                let doc = dispatch(&state, &mut conn, cmd).await;
                encode_op_msg(&doc, hdr.request_id, next_server_id()).unwrap()
            }
            OP_COMPRESSED => {
                state.compressed_frames.fetch_add(1, Ordering::AcqRel);
                let op = OpCompressed::parse(&body).unwrap();
                let inner = decompress(&op).unwrap();
                assert_eq!(op.original_opcode, OP_MSG, "mock only compresses OP_MSG");
                let (_flags, cmd) = decode_op_msg_section0(&inner).unwrap();
                let doc = dispatch(&state, &mut conn, cmd).await;
                let plain = encode_op_msg(&doc, hdr.request_id, next_server_id()).unwrap();
                let compressor = conn.compressor.unwrap_or(Compressor::Snappy);
                encode_op_compressed(
                    OP_MSG,
                    &plain[HEADER_LEN..],
                    compressor,
                    hdr.request_id,
                    next_server_id(),
                )
                .unwrap()
            }
            other => panic!("mock received unsupported op code {other}"),
        };
        socket.write_all(&reply).await?;
    }
}

fn next_server_id() -> i32 {
    static NEXT: AtomicI64 = AtomicI64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed) as i32
}

async fn dispatch(state: &Arc<MockState>, conn: &mut ConnState, cmd: Document) -> Document {
    let Some(name) = cmd.keys().next().map(|k| k.to_string()) else {
        return error_doc(59, "empty command");
    };

    // Everything except the handshake and auth requires authentication when
    // the mock carries credentials.
    if state.credential.is_some()
        && !conn.authenticated
        && !matches!(name.as_str(), "isMaster" | "saslStart" | "saslContinue")
    {
        return error_doc(13, "command requires authentication");
    }

    match name.as_str() {
        "isMaster" => is_master_reply(state, conn, &cmd),
        "ping" => doc! {"ok": 1.0},
        "slowPing" => {
            let ms = cmd.get_i64("ms").unwrap_or(100) as u64;
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            doc! {"ok": 1.0}
        }
        "saslStart" => sasl_start(state, conn, &cmd),
        "saslContinue" => sasl_continue(state, conn, &cmd),
        "insert" => insert(state, &cmd).await,
        "find" => find(state, &cmd).await,
        "getMore" => get_more(state, &cmd).await,
        "killCursors" => kill_cursors(state, &cmd).await,
        "count" => count(state, &cmd).await,
        "listCollections" => list_collections(state, &cmd).await,
        "aggregate" => aggregate(state, &cmd).await,
        "update" => update(state, &cmd).await,
        "delete" => delete(state, &cmd).await,
        "createIndexes" => doc! {
            "createdCollectionAutomatically": false,
            "numIndexesBefore": 1i32,
            "numIndexesAfter": 2i32,
            "ok": 1.0,
        },
        other => error_doc(59, &format!("no such command: '{other}'")),
    }
}

fn error_doc(code: i32, errmsg: &str) -> Document {
    doc! {"ok": 0.0, "errmsg": errmsg, "code": code}
}

fn is_master_reply(state: &Arc<MockState>, conn: &mut ConnState, cmd: &Document) -> Document {
    let mut reply = doc! {
        "ismaster": state.primary.load(Ordering::Acquire),
        "maxBsonObjectSize": 16_777_216i32,
        "maxMessageSizeBytes": 48_000_000i32,
        "maxWriteBatchSize": 100_000i32,
        "minWireVersion": 0i32,
        "maxWireVersion": 17i32,
    };
    if let Some(set_name) = &state.set_name {
        reply.insert("setName", set_name.as_str());
        reply.insert("secondary", !state.primary.load(Ordering::Acquire));
    }
    if let Ok(requested) = cmd.get_array("compression") {
        let accepted: Vec<Bson> = state
            .compressors
            .iter()
            .filter(|c| requested.iter().any(|r| r.as_str() == Some(c.name())))
            .map(|c| Bson::from(c.name()))
            .collect();
        if let Some(first) = accepted.first() {
            if let Bson::String(name) = first {
                conn.compressor = Compressor::from_name(name);
            }
            reply.insert("compression", Bson::Array(accepted));
        }
    }
    reply.insert("ok", 1.0);
    reply
}

fn namespace(cmd: &Document, key: &str) -> String {
    let coll = cmd.get_str(key).unwrap_or_default();
    let db = cmd.get_str("$db").unwrap_or("test");
    format!("{db}.{coll}")
}

fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, expected)| doc.get(key) == Some(expected))
}

async fn insert(state: &Arc<MockState>, cmd: &Document) -> Document {
    let ns = namespace(cmd, "insert");
    let Ok(documents) = cmd.get_array("documents") else {
        return error_doc(9, "insert requires documents");
    };
    let mut collections = state.collections.lock().await;
    let bucket = collections.entry(ns).or_default();
    let mut n = 0;
    for value in documents {
        if let Bson::Document(doc) = value {
            bucket.push(doc.clone());
            n += 1;
        }
    }
    doc! {"n": n, "ok": 1.0}
}

async fn find(state: &Arc<MockState>, cmd: &Document) -> Document {
    let ns = namespace(cmd, "find");
    let filter = cmd.get_document("filter").cloned().unwrap_or_default();
    let matched: Vec<Document> = state
        .collections
        .lock()
        .await
        .get(&ns)
        .map(|docs| {
            docs.iter()
                .filter(|d| matches_filter(d, &filter))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    open_cursor(state, ns, matched, cmd.get_i32("batchSize").ok(), "firstBatch").await
}

async fn aggregate(state: &Arc<MockState>, cmd: &Document) -> Document {
    let ns = namespace(cmd, "aggregate");
    // Pipeline support is intentionally tiny: an optional leading $match.
    let filter = cmd
        .get_array("pipeline")
        .ok()
        .and_then(|stages| stages.first().cloned())
        .and_then(|stage| match stage {
            Bson::Document(stage) => stage.get_document("$match").cloned().ok(),
            _ => None,
        })
        .unwrap_or_default();
    let matched: Vec<Document> = state
        .collections
        .lock()
        .await
        .get(&ns)
        .map(|docs| {
            docs.iter()
                .filter(|d| matches_filter(d, &filter))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    let batch_size = cmd
        .get_document("cursor")
        .ok()
        .and_then(|c| c.get_i32("batchSize").ok());
    open_cursor(state, ns, matched, batch_size, "firstBatch").await
}

async fn open_cursor(
    state: &Arc<MockState>,
    ns: String,
    docs: Vec<Document>,
    batch_size: Option<i32>,
    batch_key: &str,
) -> Document {
    let take = batch_size.map(|b| b as usize).unwrap_or(docs.len());
    let first: Vec<Bson> = docs
        .iter()
        .take(take)
        .cloned()
        .map(Bson::Document)
        .collect();

    let cursor_id = if first.len() < docs.len() {
        let id = state.next_cursor_id.fetch_add(1, Ordering::AcqRel);
        state.cursors.lock().await.insert(
            id,
            CursorEntry {
                ns: ns.clone(),
                pos: first.len(),
                docs,
            },
        );
        id
    } else {
        0
    };

    let mut cursor = doc! {"id": cursor_id, "ns": &ns};
    cursor.insert(batch_key, Bson::Array(first));
    doc! {"cursor": cursor, "ok": 1.0}
}

async fn get_more(state: &Arc<MockState>, cmd: &Document) -> Document {
    state.get_more_count.fetch_add(1, Ordering::AcqRel);
    let Ok(id) = cmd.get_i64("getMore") else {
        return error_doc(9, "getMore requires a cursor id");
    };
    let batch_size = cmd.get_i32("batchSize").unwrap_or(i32::MAX).max(1) as usize;

    let mut cursors = state.cursors.lock().await;
    let Some(entry) = cursors.get_mut(&id) else {
        return error_doc(43, &format!("cursor id {id} not found"));
    };
    let end = (entry.pos + batch_size).min(entry.docs.len());
    let batch: Vec<Bson> = entry.docs[entry.pos..end]
        .iter()
        .cloned()
        .map(Bson::Document)
        .collect();
    entry.pos = end;

    let ns = entry.ns.clone();
    let exhausted = entry.pos >= entry.docs.len();
    if exhausted {
        cursors.remove(&id);
    }
    let next_id = if exhausted { 0 } else { id };

    let mut cursor = doc! {"id": next_id, "ns": &ns};
    cursor.insert("nextBatch", Bson::Array(batch));
    doc! {"cursor": cursor, "ok": 1.0}
}

async fn kill_cursors(state: &Arc<MockState>, cmd: &Document) -> Document {
    let ids = cmd.get_array("cursors").cloned().unwrap_or_default();
    let mut killed = Vec::new();
    let mut cursors = state.cursors.lock().await;
    for id in ids {
        if let Bson::Int64(id) = id {
            if cursors.remove(&id).is_some() {
                killed.push(Bson::Int64(id));
            }
        }
    }
    doc! {"cursorsKilled": Bson::Array(killed), "ok": 1.0}
}

async fn count(state: &Arc<MockState>, cmd: &Document) -> Document {
    let ns = namespace(cmd, "count");
    let filter = cmd.get_document("query").cloned().unwrap_or_default();
    let n = state
        .collections
        .lock()
        .await
        .get(&ns)
        .map(|docs| docs.iter().filter(|d| matches_filter(d, &filter)).count())
        .unwrap_or(0);
    doc! {"n": n as i64, "ok": 1.0}
}

async fn list_collections(state: &Arc<MockState>, cmd: &Document) -> Document {
    let db = cmd.get_str("$db").unwrap_or("test");
    let prefix = format!("{db}.");
    let names: Vec<Document> = state
        .collections
        .lock()
        .await
        .keys()
        .filter_map(|ns| ns.strip_prefix(&prefix))
        .map(|coll| doc! {"name": coll, "type": "collection"})
        .collect();
    open_cursor(
        state,
        format!("{db}.$cmd.listCollections"),
        names,
        None,
        "firstBatch",
    )
    .await
}

async fn update(state: &Arc<MockState>, cmd: &Document) -> Document {
    let ns = namespace(cmd, "update");
    let Ok(updates) = cmd.get_array("updates") else {
        return error_doc(9, "update requires updates");
    };
    let mut collections = state.collections.lock().await;
    let bucket = collections.entry(ns).or_default();
    let (mut n, mut n_modified) = (0i32, 0i32);
    for entry in updates {
        let Bson::Document(entry) = entry else { continue };
        let filter = entry.get_document("q").cloned().unwrap_or_default();
        let update = entry.get_document("u").cloned().unwrap_or_default();
        let multi = entry.get_bool("multi").unwrap_or(false);
        for doc in bucket.iter_mut() {
            if !matches_filter(doc, &filter) {
                continue;
            }
            n += 1;
            if let Ok(set) = update.get_document("$set") {
                for (key, value) in set.iter() {
                    doc.insert(key, value.clone());
                }
                n_modified += 1;
            }
            if !multi {
                break;
            }
        }
    }
    doc! {"n": n, "nModified": n_modified, "ok": 1.0}
}

async fn delete(state: &Arc<MockState>, cmd: &Document) -> Document {
    let ns = namespace(cmd, "delete");
    let Ok(deletes) = cmd.get_array("deletes") else {
        return error_doc(9, "delete requires deletes");
    };
    let mut collections = state.collections.lock().await;
    let bucket = collections.entry(ns).or_default();
    let mut n = 0i32;
    for entry in deletes {
        let Bson::Document(entry) = entry else { continue };
        let filter = entry.get_document("q").cloned().unwrap_or_default();
        let limit = entry.get_i32("limit").unwrap_or(0);
        let mut removed = 0;
        bucket.retain(|doc| {
            if matches_filter(doc, &filter) && (limit == 0 || removed < limit) {
                removed += 1;
                false
            } else {
                true
            }
        });
        n += removed;
    }
    doc! {"n": n, "ok": 1.0}
}

// ---- SCRAM-SHA-256 server side -------------------------------------------

struct ScramServer {
    salt: Vec<u8>,
    iterations: u32,
    client_first_bare: String,
    combined_nonce: String,
}

fn sasl_start(state: &Arc<MockState>, conn: &mut ConnState, cmd: &Document) -> Document {
    let Some((username, _password)) = &state.credential else {
        return error_doc(2, "authentication is not configured");
    };
    if cmd.get_str("mechanism") != Ok("SCRAM-SHA-256") {
        return error_doc(2, "unsupported mechanism");
    }
    let Ok(payload) = cmd.get_binary_generic("payload") else {
        return error_doc(2, "missing payload");
    };
    let client_first = String::from_utf8_lossy(payload).into_owned();

    let mut client_user = None;
    let mut client_nonce = None;
    for part in client_first.split(',') {
        if let Some(rest) = part.strip_prefix("n=") {
            client_user = Some(rest.to_string());
        } else if let Some(rest) = part.strip_prefix("r=") {
            client_nonce = Some(rest.to_string());
        }
    }
    let (Some(client_user), Some(client_nonce)) = (client_user, client_nonce) else {
        return error_doc(2, "malformed client-first message");
    };
    if client_user != *username {
        return error_doc(18, "authentication failed");
    }

    let mut salt = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut server_nonce = vec![0u8; 18];
    rand::thread_rng().fill_bytes(&mut server_nonce);
    let combined_nonce = format!("{}{}", client_nonce, BASE64.encode(&server_nonce));

    let server_first = format!(
        "r={},s={},i=4096",
        combined_nonce,
        BASE64.encode(&salt)
    );
    conn.scram = Some(ScramServer {
        salt,
        iterations: 4096,
        client_first_bare: client_first,
        combined_nonce,
    });

    doc! {
        "conversationId": 1i32,
        "done": false,
        "payload": binary(server_first.as_bytes()),
        "ok": 1.0,
    }
}

fn sasl_continue(state: &Arc<MockState>, conn: &mut ConnState, cmd: &Document) -> Document {
    let Some((_username, password)) = &state.credential else {
        return error_doc(2, "authentication is not configured");
    };
    let Some(scram) = conn.scram.take() else {
        // Final empty round after a successful exchange.
        if conn.authenticated {
            return doc! {"conversationId": 1i32, "done": true, "payload": binary(b""), "ok": 1.0};
        }
        return error_doc(2, "saslContinue without saslStart");
    };
    let Ok(payload) = cmd.get_binary_generic("payload") else {
        return error_doc(2, "missing payload");
    };
    let client_final = String::from_utf8_lossy(payload).into_owned();

    let Some((without_proof, proof_b64)) = client_final.rsplit_once(",p=") else {
        return error_doc(2, "malformed client-final message");
    };
    let Ok(proof) = BASE64.decode(proof_b64) else {
        return error_doc(2, "malformed client proof");
    };

    let server_first = format!(
        "r={},s={},i={}",
        scram.combined_nonce,
        BASE64.encode(&scram.salt),
        scram.iterations
    );
    let auth_message = format!(
        "{},{},{}",
        scram.client_first_bare, server_first, without_proof
    );

    let mut salted = vec![0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &scram.salt, scram.iterations, &mut salted);
    let client_key = hmac(&salted, b"Client Key");
    let stored_key = Sha256::digest(&client_key).to_vec();
    let client_signature = hmac(&stored_key, auth_message.as_bytes());
    let recovered_key: Vec<u8> = proof
        .iter()
        .zip(client_signature.iter())
        .map(|(a, b)| a ^ b)
        .collect();
    if Sha256::digest(&recovered_key).to_vec() != stored_key {
        return error_doc(18, "authentication failed");
    }

    let server_key = hmac(&salted, b"Server Key");
    let server_signature = hmac(&server_key, auth_message.as_bytes());
    conn.authenticated = true;

    let server_final = format!("v={}", BASE64.encode(&server_signature));
    doc! {
        "conversationId": 1i32,
        "done": true,
        "payload": binary(server_final.as_bytes()),
        "ok": 1.0,
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn binary(bytes: &[u8]) -> Bson {
    Bson::Binary(rmongo::bson::Binary {
        subtype: rmongo::bson::spec::BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}
