// TLS support for server connections, via tokio-rustls.

use std::io::{self, BufReader};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls_pemfile::certs;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::config::{HostAddr, TlsOptions};
use crate::error::{Error, Result};

/// Build a TLS connector from client options.
pub fn build_tls_connector(cfg: &TlsOptions) -> Result<TlsConnector> {
    let root_store = if let Some(ca_file) = &cfg.ca_file {
        let ca_data = std::fs::read(ca_file)?;
        let mut reader = BufReader::new(&ca_data[..]);
        let mut store = RootCertStore::empty();
        for cert in certs(&mut reader) {
            let cert =
                cert.map_err(|e| Error::Configuration(format!("invalid CA certificate: {}", e)))?;
            store
                .add(cert)
                .map_err(|e| Error::Configuration(format!("rejected CA certificate: {}", e)))?;
        }
        store
    } else {
        RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
    };

    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let config = if let (Some(cert_file), Some(key_file)) = (&cfg.client_cert, &cfg.client_key) {
        let cert_data = std::fs::read(cert_file)?;
        let key_data = std::fs::read(key_file)?;

        let mut cert_reader = BufReader::new(&cert_data[..]);
        let cert_chain = certs(&mut cert_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Configuration(format!("invalid client certificate: {}", e)))?;

        let mut key_reader = BufReader::new(&key_data[..]);
        let keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Configuration(format!("invalid client key: {}", e)))?;
        let key = keys
            .into_iter()
            .next()
            .ok_or_else(|| Error::Configuration("no private key found".to_string()))?;
        let key = PrivateKeyDer::try_from(key)
            .map_err(|e| Error::Configuration(format!("invalid private key: {}", e)))?;

        builder
            .with_client_auth_cert(cert_chain, key)
            .map_err(|e| Error::Configuration(format!("failed to set client certificate: {}", e)))?
    } else {
        builder.with_no_client_auth()
    };

    if cfg.allow_invalid_certificates {
        tracing::warn!("TLS certificate validation disabled - this is insecure!");
    }

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Open a TCP stream to `addr`, wrapping it in TLS when a connector is given.
pub async fn connect(
    addr: &HostAddr,
    connector: Option<&TlsConnector>,
    connect_timeout: Duration,
) -> Result<MaybeTlsStream> {
    let stream = tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((addr.host.as_str(), addr.port)),
    )
    .await
    .map_err(|_| Error::Timeout(format!("connecting to {}", addr)))??;
    stream.set_nodelay(true)?;

    let Some(connector) = connector else {
        return Ok(MaybeTlsStream::Plain(stream));
    };

    let server_name = ServerName::try_from(addr.host.clone())
        .map_err(|_| Error::Configuration(format!("invalid server name {:?}", addr.host)))?;
    let tls_stream = tokio::time::timeout(connect_timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| Error::Timeout(format!("TLS handshake with {}", addr)))??;
    tracing::debug!(%addr, "TLS connection established");
    Ok(MaybeTlsStream::Tls(Box::new(tls_stream)))
}

/// One socket, with or without TLS on top.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
