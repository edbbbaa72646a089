//! Configuration for a [`ReplicaSetClient`](crate::ReplicaSetClient).

use std::{
    fmt::{self, Display, Formatter},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;

use crate::{
    error::{Error, ErrorKind, Result},
    read_preference::ReadPreference,
};

/// The port used when an address string does not specify one.
pub(crate) const DEFAULT_PORT: u16 = 27017;

const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// The `(host, port)` of a single replica set member.
///
/// Addresses are totally ordered (host, then port) so that candidate and probe
/// iteration during a topology refresh is deterministic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    /// The hostname or IP address. IPv6 literals are stored unbracketed.
    pub host: String,

    /// The TCP port the member is listening on.
    pub port: u16,
}

impl ServerAddress {
    /// Parses a `host`, `host:port`, `[v6literal]` or `[v6literal]:port`
    /// string. The port defaults to 27017 and brackets are stripped.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            match rest.split_once(']') {
                Some((host, "")) => (host, None),
                Some((host, port)) => match port.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => {
                        return Err(Error::configuration(format!(
                            "invalid server address \"{}\"",
                            address
                        )))
                    }
                },
                None => {
                    return Err(Error::configuration(format!(
                        "invalid server address \"{}\": unterminated IPv6 literal",
                        address
                    )))
                }
            }
        } else {
            match address.rsplit_once(':') {
                // More than one ':' means a bare IPv6 literal with no port.
                Some((host, _)) if host.contains(':') => (address, None),
                Some((host, port)) => (host, Some(port)),
                None => (address, None),
            }
        };

        if host.is_empty() {
            return Err(Error::configuration(format!(
                "invalid server address \"{}\": hostname cannot be empty",
                address
            )));
        }

        let port = match port {
            Some(port) => {
                let port = u16::from_str(port).ok().filter(|p| *p != 0).ok_or_else(|| {
                    Error::configuration(format!(
                        "invalid server address \"{}\": port must be a non-zero 16-bit integer",
                        address
                    ))
                })?;
                port
            }
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_lowercase(),
            port,
        })
    }
}

impl Display for ServerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(serde::de::Error::custom)
    }
}

/// TLS material used when connecting to the members of the set.
///
/// The presence of a `TlsOptions` value on [`ClientOptions`] enables TLS for
/// every connection the client makes.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct TlsOptions {
    /// Skip server certificate verification entirely.
    pub allow_invalid_certificates: bool,

    /// Path to a PEM file of concatenated CA certificates used to validate
    /// the certificates presented by the members.
    pub ca_file_path: Option<PathBuf>,

    /// Path to a PEM file containing the client certificate and private key
    /// used to identify this client to the members.
    pub cert_key_file_path: Option<PathBuf>,
}

/// A write-concern `w` value: a node count or a named tag/mode.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// Wait for replication to the given number of members (0 disables
    /// acknowledgement).
    Nodes(u32),

    /// Wait for replication to a majority of the members.
    Majority,

    /// A custom getLastErrorModes name configured on the set.
    Custom(String),
}

/// Default write-concern parameters. These are forwarded to the message
/// builder; the client core does not interpret them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct WriteConcern {
    /// The `w` value.
    pub w: Option<Acknowledgment>,

    /// How long the server waits for write propagation before erroring.
    pub w_timeout: Option<Duration>,

    /// Block until writes have been committed to the journal.
    pub journal: Option<bool>,

    /// Force the server to fsync before acknowledging.
    pub fsync: Option<bool>,
}

/// All configuration understood by the client core.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ClientOptions {
    /// The seed list used to discover the set.
    pub hosts: Vec<ServerAddress>,

    /// The name of the replica set. Required; every member the client talks
    /// to must report this set name in its handshake.
    pub repl_set_name: Option<String>,

    /// The maximum number of concurrently checked-out sockets per member, and
    /// the cap on idle sockets kept in each pool. `None` disables the limit.
    pub max_pool_size: Option<u32>,

    /// Timeout for reads and writes on an established socket.
    pub socket_timeout: Option<Duration>,

    /// Timeout for establishing a connection to a member.
    pub connect_timeout: Option<Duration>,

    /// How long a checkout may wait for a pool permit before failing.
    pub wait_queue_timeout: Option<Duration>,

    /// Caps concurrent waiters for a pool permit at
    /// `max_pool_size * wait_queue_multiple`.
    pub wait_queue_multiple: Option<u32>,

    /// TLS configuration; `None` disables TLS.
    pub tls_options: Option<TlsOptions>,

    /// The default read preference for operations that do not specify one.
    pub read_preference: ReadPreference,

    /// If true, every task implicitly enters a request the first time it
    /// touches a socket, giving it a dedicated socket per member.
    pub auto_start_request: bool,

    /// Default write-concern parameters, forwarded but not interpreted.
    pub write_concern: WriteConcern,

    /// How often the monitor refreshes the view of the set when idle.
    /// Defaults to 30 seconds.
    pub heartbeat_freq: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            repl_set_name: None,
            max_pool_size: Some(DEFAULT_MAX_POOL_SIZE),
            socket_timeout: None,
            connect_timeout: None,
            wait_queue_timeout: None,
            wait_queue_multiple: None,
            tls_options: None,
            read_preference: ReadPreference::default(),
            auto_start_request: false,
            write_concern: WriteConcern::default(),
            heartbeat_freq: None,
        }
    }
}

impl ClientOptions {
    /// Builds options from a comma-separated `host[:port]` seed list and a
    /// replica set name. URI parsing is left to an external collaborator;
    /// this accepts the plain seed-list form.
    pub fn parse(seed_list: impl AsRef<str>, repl_set_name: impl Into<String>) -> Result<Self> {
        let hosts = seed_list
            .as_ref()
            .split(',')
            .map(|h| ServerAddress::parse(h.trim()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            hosts,
            repl_set_name: Some(repl_set_name.into()),
            ..Default::default()
        })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self
            .repl_set_name
            .as_ref()
            .map_or(true, |name| name.is_empty())
        {
            return Err(Error::configuration(
                "the replicaSet option is required".to_string(),
            ));
        }

        if self.max_pool_size == Some(0) {
            return Err(Error::configuration("max_pool_size must be at least 1"));
        }

        if self.wait_queue_multiple == Some(0) {
            return Err(Error::configuration(
                "wait_queue_multiple must be at least 1",
            ));
        }

        if self.wait_queue_multiple.is_some() && self.max_pool_size.is_none() {
            return Err(Error::configuration(
                "wait_queue_multiple requires max_pool_size to be set",
            ));
        }

        if let Some(ref tls) = self.tls_options {
            if !tls.allow_invalid_certificates && tls.ca_file_path.is_none() {
                return Err(ErrorKind::Configuration {
                    message: "a CA file is required to validate server certificates; provide \
                              ca_file_path or set allow_invalid_certificates"
                        .to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    pub(crate) fn set_name(&self) -> &str {
        // Enforced by validate() before the client is constructed.
        self.repl_set_name.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_parsing_defaults_the_port() {
        let addr = ServerAddress::parse("db0.example.com").unwrap();
        assert_eq!(addr.host, "db0.example.com");
        assert_eq!(addr.port, 27017);
        assert_eq!(addr.to_string(), "db0.example.com:27017");
    }

    #[test]
    fn address_parsing_accepts_explicit_ports_and_lowercases() {
        let addr = ServerAddress::parse("DB1:27018").unwrap();
        assert_eq!(addr.host, "db1");
        assert_eq!(addr.port, 27018);
    }

    #[test]
    fn address_parsing_strips_ipv6_brackets() {
        let addr = ServerAddress::parse("[::1]:27018").unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, 27018);

        let addr = ServerAddress::parse("[fe80::1]").unwrap();
        assert_eq!(addr.host, "fe80::1");
        assert_eq!(addr.port, 27017);

        let addr = ServerAddress::parse("fe80::1").unwrap();
        assert_eq!(addr.host, "fe80::1");
        assert_eq!(addr.port, 27017);
    }

    #[test]
    fn address_parsing_rejects_bad_input() {
        assert!(ServerAddress::parse("").is_err());
        assert!(ServerAddress::parse(":27017").is_err());
        assert!(ServerAddress::parse("db0:0").is_err());
        assert!(ServerAddress::parse("db0:notaport").is_err());
        assert!(ServerAddress::parse("[::1").is_err());
    }

    #[test]
    fn addresses_order_deterministically() {
        let mut addrs = vec![
            ServerAddress::parse("b:27017").unwrap(),
            ServerAddress::parse("a:27018").unwrap(),
            ServerAddress::parse("a:27017").unwrap(),
        ];
        addrs.sort();
        assert_eq!(
            addrs.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["a:27017", "a:27018", "b:27017"]
        );
    }

    #[test]
    fn seed_list_parsing() {
        let options = ClientOptions::parse("a:27017, b:27018,c", "rs0").unwrap();
        assert_eq!(options.hosts.len(), 3);
        assert_eq!(options.hosts[2].port, 27017);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn replica_set_name_is_required() {
        let mut options = ClientOptions::parse("a:27017", "rs0").unwrap();
        options.repl_set_name = None;
        let err = options.validate().unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn tls_verification_requires_a_ca_file() {
        let mut options = ClientOptions::parse("a:27017", "rs0").unwrap();
        options.tls_options = Some(TlsOptions::default());
        assert!(options.validate().unwrap_err().is_configuration_error());

        options.tls_options = Some(TlsOptions {
            allow_invalid_certificates: true,
            ..Default::default()
        });
        assert!(options.validate().is_ok());
    }

    #[test]
    fn wait_queue_multiple_requires_a_bounded_pool() {
        let mut options = ClientOptions::parse("a:27017", "rs0").unwrap();
        options.wait_queue_multiple = Some(2);
        options.max_pool_size = None;
        assert!(options.validate().unwrap_err().is_configuration_error());
    }
}
