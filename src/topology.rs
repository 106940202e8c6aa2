//! Host records and the `isMaster` handshake.
//!
//! Per-host state machine: `Unknown` moves to `Primary` or `Secondary` when a
//! handshake answers, or to `Offline` when it fails. Offline hosts are only
//! retried by an explicit reinitialization pass.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, timeout};
use tokio_rustls::TlsConnector;

use crate::bson::{Bson, Document};
use crate::config::{ClientOptions, HostAddr};
use crate::doc;
use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::protocol::compress::Compressor;
use crate::protocol::{
    DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN, MessageHeader, QUERY_SECONDARY_OK, REPLY_QUERY_FAILURE,
    RequestIds, decode_reply, encode_op_query,
};
use crate::tls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Unknown,
    Primary,
    Secondary,
    Offline,
}

/// One record per configured address, mutated only under the pool's lock.
#[derive(Debug, Clone)]
pub struct Host {
    pub addr: HostAddr,
    pub state: HostState,
    pub open_connections: usize,
}

impl Host {
    pub fn new(addr: HostAddr) -> Host {
        Host {
            addr,
            state: HostState::Unknown,
            open_connections: 0,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self.state, HostState::Primary | HostState::Secondary)
    }
}

/// Protocol capability fields cached from whichever host answered first.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub max_bson_object_size: i32,
    pub max_message_size_bytes: i32,
    pub max_write_batch_size: i32,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            max_bson_object_size: 16 * 1024 * 1024,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE,
            max_write_batch_size: 100_000,
            min_wire_version: 0,
            max_wire_version: 0,
        }
    }
}

impl ServerInfo {
    pub fn from_handshake(doc: &Document) -> ServerInfo {
        let defaults = ServerInfo::default();
        ServerInfo {
            max_bson_object_size: doc
                .get_i32("maxBsonObjectSize")
                .unwrap_or(defaults.max_bson_object_size),
            max_message_size_bytes: doc
                .get_i32("maxMessageSizeBytes")
                .unwrap_or(defaults.max_message_size_bytes),
            max_write_batch_size: doc
                .get_i32("maxWriteBatchSize")
                .unwrap_or(defaults.max_write_batch_size),
            min_wire_version: doc.get_i32("minWireVersion").unwrap_or(0),
            max_wire_version: doc.get_i32("maxWireVersion").unwrap_or(0),
        }
    }
}

/// Whether the handshake reply marks the host as the writable primary.
pub fn reports_writable(doc: &Document) -> bool {
    doc.get_bool("isWritablePrimary")
        .or_else(|_| doc.get_bool("ismaster"))
        .unwrap_or(false)
}

/// First compressor we advertise that the server accepted.
pub fn negotiated_compressor(doc: &Document, advertised: &[Compressor]) -> Option<Compressor> {
    let accepted = doc.get_array("compression").ok()?;
    advertised.iter().copied().find(|c| {
        accepted
            .iter()
            .any(|name| name.as_str() == Some(c.name()))
    })
}

fn build_is_master(options: &ClientOptions) -> Document {
    let mut client = doc! {
        "driver": {"name": "rmongo", "version": env!("CARGO_PKG_VERSION")},
        "os": {"type": std::env::consts::OS},
    };
    if let Some(app_name) = &options.app_name {
        client.insert("application", doc! {"name": app_name});
    }

    let mut cmd = doc! {"isMaster": 1i32, "client": client};
    if !options.compressors.is_empty() {
        let names: Vec<Bson> = options
            .compressors
            .iter()
            .map(|c| Bson::from(c.name()))
            .collect();
        cmd.insert("compression", Bson::Array(names));
    }
    cmd
}

/// Issue the handshake on an already-open stream and return the reply
/// document. Sent as a legacy OP_QUERY so it works before any negotiation.
pub(crate) async fn is_master_exchange<S>(
    stream: &mut S,
    ids: &RequestIds,
    options: &ClientOptions,
    dur: Duration,
) -> Result<Document>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cmd = build_is_master(options);
    let wire = encode_op_query(
        &cmd,
        &Namespace::command("admin"),
        QUERY_SECONDARY_OK,
        -1,
        ids.next(),
    )?;
    timeout(dur, stream.write_all(&wire))
        .await
        .map_err(|_| Error::Timeout("handshake write".to_string()))??;

    let mut header = [0u8; HEADER_LEN];
    timeout(dur, stream.read_exact(&mut header))
        .await
        .map_err(|_| Error::Timeout("handshake read".to_string()))??;
    let (hdr, _) = MessageHeader::parse(&header)
        .ok_or_else(|| Error::Protocol("failed to parse handshake header".to_string()))?;
    let mut body = vec![0u8; hdr.body_len(DEFAULT_MAX_MESSAGE_SIZE)?];
    timeout(dur, stream.read_exact(&mut body))
        .await
        .map_err(|_| Error::Timeout("handshake read".to_string()))??;

    let reply = decode_reply(&hdr, &body)?;
    let doc = reply.first_document()?;
    if reply.flags & REPLY_QUERY_FAILURE != 0
        || doc.get_f64("ok").map(|ok| ok != 1.0).unwrap_or(false)
    {
        return Err(Error::from_command_response(doc.clone()));
    }
    Ok(doc.clone())
}

/// Open a short-lived monitor socket to `addr` and run the handshake.
pub(crate) async fn probe_host(
    addr: &HostAddr,
    connector: Option<&TlsConnector>,
    ids: &RequestIds,
    options: &ClientOptions,
) -> Result<Document> {
    let mut stream = tls::connect(addr, connector, options.connect_timeout).await?;
    is_master_exchange(&mut stream, ids, options, options.connect_timeout).await
}
