//! Mutual-TLS dialer for the push and feedback gateways.
//!
//! The gateway is a fixed, private endpoint authenticated against a pinned
//! CA, not the public web PKI, and the client always presents its own
//! certificate. Connection setup mirrors a plain happy-path TCP connect plus
//! keepalive tuning; there is no multi-address racing since the gateway
//! hostname is expected to resolve to a single address in practice.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use socket2::{Domain, Socket, TcpKeepalive, Type};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::warn;

use crate::error::TlsError;

pub type PushStream = TlsStream<TcpStream>;

pub struct TlsDialer {
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn new(cacerts_file: &Path, cert_file: &Path, key_file: &Path) -> Result<Self, TlsError> {
        let roots = load_root_store(cacerts_file)?;
        let cert_chain = load_certs(cert_file)?;
        let key = load_private_key(key_file)?;

        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder_with_provider(provider.into())
            .with_safe_default_protocol_versions()
            .expect("rustls protocol version list is always valid")
            .with_root_certificates(roots)
            .with_client_auth_cert(cert_chain, key)
            .map_err(TlsError::Config)?;

        Ok(Self { connector: TlsConnector::from(Arc::new(config)) })
    }

    /// Dials `peer`, retrying according to the relay's connection policy:
    /// DNS failures back off for 1s, TLS/auth failures back off for the
    /// full `retry_interval`, anything else (e.g. connection refused) backs
    /// off for roughly a tenth of `retry_interval`, floored at 1s. A zero
    /// `retry_interval` means "probe mode": try once and give up on any
    /// failure instead of looping forever.
    pub async fn dial(&self, peer: &(String, u16), retry_interval: Duration, context: &str) -> Option<PushStream> {
        loop {
            match self.try_dial(peer).await {
                Ok(stream) => return Some(stream),
                Err(failure) => {
                    warn!(host = %peer.0, port = peer.1, error = %failure, context, "gateway dial attempt failed");
                    if retry_interval.is_zero() {
                        return None;
                    }
                    tokio::time::sleep(failure.backoff(retry_interval)).await;
                }
            }
        }
    }

    async fn try_dial(&self, peer: &(String, u16)) -> Result<PushStream, DialFailure> {
        let addr = format!("{}:{}", peer.0, peer.1);
        let mut addrs = lookup_host(&addr).await.map_err(DialFailure::Resolve)?;
        let sockaddr = addrs
            .next()
            .ok_or_else(|| DialFailure::Resolve(io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")))?;

        let tcp = connect_with_keepalive(sockaddr).await.map_err(DialFailure::Connect)?;

        let server_name = ServerName::try_from(peer.0.clone())
            .map_err(|_| DialFailure::Connect(io::Error::new(io::ErrorKind::InvalidInput, "invalid server name")))?;

        self.connector.connect(server_name, tcp).await.map_err(DialFailure::Tls)
    }
}

enum DialFailure {
    Resolve(io::Error),
    Tls(io::Error),
    Connect(io::Error),
}

impl DialFailure {
    fn backoff(&self, retry_interval: Duration) -> Duration {
        match self {
            DialFailure::Resolve(_) => Duration::from_secs(1),
            DialFailure::Tls(_) => retry_interval,
            DialFailure::Connect(_) => {
                let secs = (retry_interval.as_secs() + 9) / 10;
                Duration::from_secs(secs.max(1))
            }
        }
    }
}

impl std::fmt::Display for DialFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialFailure::Resolve(e) => write!(f, "resolve failed: {e}"),
            DialFailure::Tls(e) => write!(f, "tls handshake failed: {e}"),
            DialFailure::Connect(e) => write!(f, "connect failed: {e}"),
        }
    }
}

async fn connect_with_keepalive(addr: SocketAddr) -> io::Result<TcpStream> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    socket.set_tcp_keepalive(&keepalive)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    let stream = TcpStream::from_std(socket.into())?;
    stream.writable().await?;
    // Becoming writable only means the connect attempt finished, not that it
    // succeeded: a refused or reset connection also wakes `writable()`, so
    // SO_ERROR must be checked to tell the two apart.
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    Ok(stream)
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut store = RootCertStore::empty();
    let mut added = 0;
    for cert in read_pem_certs(path)? {
        if store.add(cert).is_ok() {
            added += 1;
        }
    }
    if added == 0 {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(store)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = read_pem_certs(path)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn read_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let bytes = std::fs::read(path).map_err(|source| TlsError::ReadFile {
        which: "certificate",
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = std::io::Cursor::new(bytes);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::ReadFile { which: "certificate", path: path.to_path_buf(), source })
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let bytes = std::fs::read(path).map_err(|source| TlsError::ReadFile {
        which: "private key",
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = std::io::Cursor::new(bytes);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::ReadFile { which: "private key", path: path.to_path_buf(), source })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}
