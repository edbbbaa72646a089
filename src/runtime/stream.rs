use std::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::FutureExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, Interest, ReadBuf},
    net::TcpStream,
};

use super::tls::TlsConfig;
use crate::{
    error::{Error, Result},
    options::ServerAddress,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// An async stream to one member, possibly using TLS.
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// A plain TCP connection.
    Tcp(TcpStream),

    /// A TLS session over TCP.
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

async fn try_connect(address: &SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await??;
    stream.set_nodelay(true)?;

    let socket = socket2::Socket::from(stream.into_std()?);
    let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    socket.set_tcp_keepalive(&conf)?;
    let std_stream = std::net::TcpStream::from(socket);
    Ok(TcpStream::from_std(std_stream)?)
}

async fn connect_tcp(
    address: &ServerAddress,
    connect_timeout: Option<Duration>,
) -> Result<TcpStream> {
    let timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

    let mut socket_addrs: Vec<_> = tokio::net::lookup_host((address.host.as_str(), address.port))
        .await
        .map_err(|e| Error::connection(format!("failed to resolve {}: {}", address, e)))?
        .collect();

    if socket_addrs.is_empty() {
        return Err(Error::connection(format!(
            "no addresses found for {}",
            address
        )));
    }

    // Try each resolved address in sequence with a preference for IPv4, the
    // same order other drivers for this database use.
    socket_addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });

    let mut connect_error = None;
    for socket_addr in &socket_addrs {
        connect_error = match try_connect(socket_addr, timeout).await {
            Ok(stream) => return Ok(stream),
            Err(err) => Some(err),
        };
    }

    Err(connect_error
        .unwrap_or_else(|| Error::connection(format!("could not connect to {}", address))))
}

impl AsyncStream {
    /// Connects to `address`, performing the TLS handshake when a config is
    /// given. The handshake failing is fatal for this attempt.
    pub(crate) async fn connect(
        address: &ServerAddress,
        connect_timeout: Option<Duration>,
        tls: Option<&TlsConfig>,
    ) -> Result<Self> {
        let inner = connect_tcp(address, connect_timeout).await?;

        match tls {
            Some(cfg) => {
                let session = cfg.wrap(&address.host, inner).await?;
                Ok(Self::Tls(Box::new(session)))
            }
            None => Ok(Self::Tcp(inner)),
        }
    }

    /// Best-effort check for a peer-closed connection: an idle socket that
    /// polls readable has either a pending byte nobody asked for or an EOF,
    /// and in both cases it must not be handed to a caller.
    pub(crate) fn probably_closed(&self) -> bool {
        let tcp = match self {
            Self::Tcp(stream) => stream,
            Self::Tls(stream) => stream.get_ref().0,
        };
        match tcp.ready(Interest::READABLE).now_or_never() {
            Some(Ok(ready)) => ready.is_readable() || ready.is_read_closed(),
            Some(Err(_)) => true,
            None => false,
        }
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match *self {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match *self {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match *self {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match *self {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_shutdown(cx),
        }
    }
}
