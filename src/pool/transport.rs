//! Sockets: resolve, connect, keepalive and optional TLS.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error_handling::SessionError;
use crate::pool::{PoolEndpoint, SecureLevel};

/// Idle time before keepalive probes start, and the probe interval.
pub const KEEPALIVE: Duration = Duration::from_secs(10);

/// Upper bound on a single line write.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest line accepted from a pool, newline included.
pub const MAX_LINE: usize = 64 * 1024;

pub trait PoolIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PoolIo for T {}

pub type PoolStream = Box<dyn PoolIo>;

/// Resolve the endpoint and connect to the first address that answers.
pub async fn connect(endpoint: &PoolEndpoint) -> Result<TcpStream, SessionError> {
    let addrs: Vec<_> = tokio::net::lookup_host(endpoint.address())
        .await
        .map_err(|e| SessionError::Resolve { host: endpoint.host.clone(), message: e.to_string() })?
        .collect();
    if addrs.is_empty() {
        return Err(SessionError::Resolve {
            host: endpoint.host.clone(),
            message: "no addresses".to_string(),
        });
    }

    let mut last = None;
    for addr in addrs {
        debug!(%addr, "connecting");
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                configure(&stream)?;
                return Ok(stream);
            }
            Err(e) => last = Some((addr, e)),
        }
    }
    match last {
        Some((addr, source)) => Err(SessionError::Connect { addr: addr.to_string(), source }),
        None => Err(SessionError::Closed),
    }
}

fn configure(stream: &TcpStream) -> Result<(), SessionError> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE).with_interval(KEEPALIVE);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Wrap the socket in TLS when the endpoint asks for it.
pub async fn secure(stream: TcpStream, endpoint: &PoolEndpoint) -> Result<PoolStream, SessionError> {
    if endpoint.secure == SecureLevel::None {
        return Ok(Box::new(stream));
    }

    let tls_error = |message: String| SessionError::Tls { host: endpoint.host.clone(), message };
    let config = client_config(endpoint.secure, endpoint.allow_self_signed).map_err(|e| tls_error(e.to_string()))?;
    let name = ServerName::try_from(endpoint.host.clone()).map_err(|e| tls_error(e.to_string()))?;

    match TlsConnector::from(Arc::new(config)).connect(name, stream).await {
        Ok(tls) => Ok(Box::new(tls)),
        Err(e) => {
            if !endpoint.allow_self_signed {
                warn!(host = %endpoint.host, "certificate verification may have failed; the pool may use a self-signed certificate");
            }
            Err(tls_error(e.to_string()))
        }
    }
}

fn client_config(level: SecureLevel, allow_self_signed: bool) -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let versions: &[&rustls::SupportedProtocolVersion] = match level {
        SecureLevel::Tls12 => &[&rustls::version::TLS12],
        _ => rustls::DEFAULT_VERSIONS,
    };
    let builder = ClientConfig::builder_with_provider(provider.clone()).with_protocol_versions(versions)?;

    let config = if allow_self_signed {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(config)
}

/// Skips chain and name checks; signatures are still verified.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), SessionError> {
    let write = async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    };
    match tokio::time::timeout(SEND_TIMEOUT, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(SessionError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "send timed out",
        ))),
    }
}

/// One newline-terminated unit read from the pool.
#[derive(Debug, PartialEq)]
pub enum Incoming {
    Line(String),
    NotUtf8,
    /// Longer than `MAX_LINE`; skipped up to the next newline.
    Oversized,
}

/// Splits a byte stream into lines without holding more than `limit` bytes.
///
/// `next` is cancel safe: bytes consumed from the inner reader are kept in
/// the partial line buffer.
pub struct LineReader<R> {
    inner: R,
    limit: usize,
    partial: Vec<u8>,
    discarding: bool,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_LINE)
    }

    pub fn with_limit(inner: R, limit: usize) -> Self {
        Self { inner, limit, partial: Vec::new(), discarding: false }
    }

    /// `None` at end of stream. A trailing unterminated line is dropped.
    pub async fn next(&mut self) -> std::io::Result<Option<Incoming>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }
            let newline = available.iter().position(|&b| b == b'\n');
            let used = newline.map_or(available.len(), |i| i + 1);
            if !self.discarding {
                if self.partial.len() + used > self.limit {
                    self.discarding = true;
                    self.partial = Vec::new();
                } else {
                    self.partial.extend_from_slice(&available[..used]);
                }
            }
            self.inner.consume(used);

            if newline.is_none() {
                continue;
            }
            if std::mem::take(&mut self.discarding) {
                return Ok(Some(Incoming::Oversized));
            }
            let mut bytes = std::mem::take(&mut self.partial);
            while matches!(bytes.last(), Some(b'\n' | b'\r')) {
                bytes.pop();
            }
            return Ok(Some(match String::from_utf8(bytes) {
                Ok(line) => Incoming::Line(line),
                Err(_) => Incoming::NotUtf8,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn tls_configs_build_for_every_level() {
        assert!(client_config(SecureLevel::Tls, false).is_ok());
        assert!(client_config(SecureLevel::Tls12, false).is_ok());
        assert!(client_config(SecureLevel::Tls12, true).is_ok());
    }

    #[tokio::test]
    async fn connects_and_writes_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = PoolEndpoint::parse(&format!("stratum+tcp://u@127.0.0.1:{port}")).unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut lines = tokio::io::BufReader::new(sock).lines();
            lines.next_line().await.unwrap()
        });

        let tcp = connect(&endpoint).await.unwrap();
        let mut stream = secure(tcp, &endpoint).await.unwrap();
        write_line(&mut stream, "{\"id\":1}\n").await.unwrap();
        assert_eq!(server.await.unwrap().as_deref(), Some("{\"id\":1}"));
    }

    #[tokio::test]
    async fn refused_connection_names_the_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let endpoint = PoolEndpoint::parse(&format!("stratum+tcp://u@127.0.0.1:{port}")).unwrap();
        match connect(&endpoint).await {
            Err(SessionError::Connect { addr, .. }) => assert!(addr.ends_with(&port.to_string())),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn line_reader_skips_bad_and_oversized_lines() {
        let input: &[u8] = b"{\"id\":1}\r\n\xff\xfe garbage\n0123456789abcdef\nok\ntail";
        let mut reader = LineReader::with_limit(input, 12);
        assert_eq!(reader.next().await.unwrap(), Some(Incoming::Line("{\"id\":1}".to_string())));
        assert_eq!(reader.next().await.unwrap(), Some(Incoming::NotUtf8));
        assert_eq!(reader.next().await.unwrap(), Some(Incoming::Oversized));
        assert_eq!(reader.next().await.unwrap(), Some(Incoming::Line("ok".to_string())));
        assert_eq!(reader.next().await.unwrap(), None);
    }
}
