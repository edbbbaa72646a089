use std::{
    fs::File,
    io::{BufReader, Seek, SeekFrom},
    sync::Arc,
    time::SystemTime,
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier, ServerName},
    Certificate, ClientConfig, Error as RustlsError, OwnedTrustAnchor, RootCertStore,
};
use rustls_pemfile::{certs, read_one, Item};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use webpki_roots::TLS_SERVER_ROOTS;

use crate::{
    error::{Error, ErrorKind, Result},
    options::TlsOptions,
};

/// Configuration required to use TLS. Creating this is expensive, so one
/// instance is built per client and shared by every pool.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish()
    }
}

impl TlsConfig {
    pub(crate) fn new(options: &TlsOptions) -> Result<Self> {
        let mut config = make_rustls_config(options)?;
        config.enable_sni = true;

        let connector: TlsConnector = Arc::new(config).into();
        Ok(Self { connector })
    }

    /// Performs the TLS handshake over an established TCP stream.
    pub(crate) async fn wrap(
        &self,
        host: &str,
        tcp_stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let name = ServerName::try_from(host).map_err(|e| ErrorKind::Tls {
            message: format!("{:?} is not a valid TLS server name: {}", host, e),
        })?;

        self.connector
            .connect_with(name, tcp_stream, |conn| {
                conn.set_buffer_limit(None);
            })
            .await
            .map_err(|e| {
                Error::new(ErrorKind::Tls {
                    message: e.to_string(),
                })
            })
    }
}

fn make_rustls_config(cfg: &TlsOptions) -> Result<ClientConfig> {
    let mut store = RootCertStore::empty();
    if let Some(ref path) = cfg.ca_file_path {
        let ders = certs(&mut BufReader::new(File::open(path)?)).map_err(|_| ErrorKind::Tls {
            message: format!(
                "unable to parse PEM-encoded root certificates from {}",
                path.display()
            ),
        })?;
        store.add_parsable_certificates(&ders);
    } else {
        let trust_anchors = TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        });
        store.add_trust_anchors(trust_anchors);
    }

    let mut config = if let Some(ref path) = cfg.cert_key_file_path {
        let mut file = BufReader::new(File::open(path)?);
        let certs: Vec<Certificate> = match certs(&mut file) {
            Ok(certs) => certs.into_iter().map(Certificate).collect(),
            Err(error) => {
                return Err(ErrorKind::Tls {
                    message: format!(
                        "unable to parse PEM-encoded client certificate from {}: {}",
                        path.display(),
                        error
                    ),
                }
                .into())
            }
        };

        file.seek(SeekFrom::Start(0))?;
        let key = loop {
            match read_one(&mut file) {
                Ok(Some(Item::PKCS8Key(bytes))) | Ok(Some(Item::RSAKey(bytes))) => {
                    break rustls::PrivateKey(bytes)
                }
                Ok(Some(_)) => continue,
                Ok(None) => {
                    return Err(ErrorKind::Tls {
                        message: format!("no PEM-encoded keys in {}", path.display()),
                    }
                    .into())
                }
                Err(_) => {
                    return Err(ErrorKind::Tls {
                        message: format!("unable to parse PEM-encoded item from {}", path.display()),
                    }
                    .into())
                }
            }
        };

        ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(store)
            .with_single_cert(certs, key)
            .map_err(|error| ErrorKind::Tls {
                message: error.to_string(),
            })?
    } else {
        ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(store)
            .with_no_client_auth()
    };

    if cfg.allow_invalid_certificates {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier {}));
    }

    Ok(config)
}

struct NoCertVerifier {}

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _: &Certificate,
        _: &[Certificate],
        _: &ServerName,
        _: &mut dyn Iterator<Item = &[u8]>,
        _: &[u8],
        _: SystemTime,
    ) -> std::result::Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }
}
