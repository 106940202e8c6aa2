use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::compress::Compressor;

/// One server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new(host: impl Into<String>, port: u16) -> HostAddr {
        HostAddr {
            host: host.into(),
            port,
        }
    }

    /// Parse `"host"` or `"host:port"`, defaulting to Mongo's standard port.
    pub fn parse(s: &str) -> Result<HostAddr> {
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    Error::Configuration(format!("invalid port in host address {:?}", s))
                })?;
                (host, port)
            }
            None => (s, 27017),
        };
        if host.is_empty() {
            return Err(Error::Configuration(format!(
                "empty hostname in address {:?}",
                s
            )));
        }
        Ok(HostAddr::new(host, port))
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Credentials bound to one logical database.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
    /// The database the credential authenticates against.
    pub source: String,
}

/// TLS settings, mirroring what the server side accepts.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub ca_file: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    pub allow_invalid_certificates: bool,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub hosts: Vec<HostAddr>,
    /// Set when connecting to a replica set; enables topology
    /// reinitialization on member failures.
    pub replica_set: Option<String>,
    pub credential: Option<Credential>,
    pub app_name: Option<String>,

    /// Process-wide cap on open connections.
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    /// How many in-flight operations may share one connection.
    pub max_operations_per_connection: usize,

    /// How long a caller waits for a connection slot.
    pub wait_queue_timeout: Duration,
    /// How long a caller waits for a reply to a sent request.
    pub operation_timeout: Duration,
    pub connect_timeout: Duration,
    pub maintenance_interval: Duration,

    pub read_from_secondaries: bool,
    pub compressors: Vec<Compressor>,
    pub tls: Option<TlsOptions>,
    /// Cursor fetch strategy: batches requested ahead of consumption.
    pub prefetch_batches: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            hosts: vec![HostAddr::new("127.0.0.1", 27017)],
            replica_set: None,
            credential: None,
            app_name: None,
            max_connections: 16,
            max_connections_per_host: 8,
            max_operations_per_connection: 32,
            wait_queue_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(10),
            read_from_secondaries: false,
            compressors: Vec::new(),
            tls: None,
            prefetch_batches: 1,
        }
    }
}

impl ClientOptions {
    pub fn single(addr: HostAddr) -> ClientOptions {
        ClientOptions {
            hosts: vec![addr],
            ..Default::default()
        }
    }

    pub fn replica_set(hosts: Vec<HostAddr>, name: impl Into<String>) -> ClientOptions {
        ClientOptions {
            hosts,
            replica_set: Some(name.into()),
            ..Default::default()
        }
    }

    /// Parse a `mongodb://` connection string. Deliberately thin: host list,
    /// credentials, auth database and a handful of query options.
    pub fn parse(uri: &str) -> Result<ClientOptions> {
        let rest = uri
            .strip_prefix("mongodb://")
            .ok_or_else(|| Error::Configuration(format!("unsupported scheme in {:?}", uri)))?;

        let (authority_and_path, params) = match rest.split_once('?') {
            Some((a, p)) => (a, Some(p)),
            None => (rest, None),
        };
        let (authority, path) = match authority_and_path.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (authority_and_path, None),
        };

        let mut options = ClientOptions::default();

        let (userinfo, host_list) = match authority.rsplit_once('@') {
            Some((u, h)) => (Some(u), h),
            None => (None, authority),
        };

        options.hosts = host_list
            .split(',')
            .map(HostAddr::parse)
            .collect::<Result<Vec<HostAddr>>>()?;

        let mut auth_source = path
            .filter(|p| !p.is_empty())
            .map(|p| p.to_string())
            .unwrap_or_else(|| "admin".to_string());

        if let Some(params) = params {
            for pair in params.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    Error::Configuration(format!("malformed query option {:?}", pair))
                })?;
                match key {
                    "replicaSet" => options.replica_set = Some(value.to_string()),
                    "appName" => options.app_name = Some(value.to_string()),
                    "authSource" => auth_source = value.to_string(),
                    "maxPoolSize" => {
                        options.max_connections = value.parse().map_err(|_| {
                            Error::Configuration(format!("invalid maxPoolSize {:?}", value))
                        })?;
                    }
                    "readPreference" => {
                        options.read_from_secondaries =
                            matches!(value, "secondary" | "secondaryPreferred" | "nearest");
                    }
                    "compressors" => {
                        options.compressors = value
                            .split(',')
                            .filter_map(Compressor::from_name)
                            .collect();
                    }
                    "tls" | "ssl" => {
                        if value == "true" {
                            options.tls = Some(TlsOptions::default());
                        }
                    }
                    "connectTimeoutMS" => {
                        options.connect_timeout = parse_millis(key, value)?;
                    }
                    "socketTimeoutMS" => {
                        options.operation_timeout = parse_millis(key, value)?;
                    }
                    "waitQueueTimeoutMS" => {
                        options.wait_queue_timeout = parse_millis(key, value)?;
                    }
                    other => {
                        tracing::warn!(option = other, "ignoring unrecognized connection option");
                    }
                }
            }
        }

        if let Some(userinfo) = userinfo {
            let (username, password) = userinfo.split_once(':').ok_or_else(|| {
                Error::Configuration("credentials must be username:password".to_string())
            })?;
            options.credential = Some(Credential {
                username: username.to_string(),
                password: password.to_string(),
                source: auth_source,
            });
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::Configuration("no hosts configured".to_string()));
        }
        if self.max_connections == 0
            || self.max_connections_per_host == 0
            || self.max_operations_per_connection == 0
        {
            return Err(Error::Configuration(
                "connection caps must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    let millis: u64 = value
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid {} value {:?}", key, value)))?;
    Ok(Duration::from_millis(millis))
}
