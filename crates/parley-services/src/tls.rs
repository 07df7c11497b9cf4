//! TLS transport: certificate provisioning, rustls configs, listener and
//! client connector.
//!
//! The server presents a certificate/key pair from disk and writes a
//! self-signed ECDSA P-256 pair when either file is missing. Clients either
//! pin that certificate or accept any certificate.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use time::OffsetDateTime;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use parley_core::config::TlsConfig;

use crate::SessionError;

/// Validity of a generated certificate.
const GENERATED_CERT_DAYS: i64 = 365;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn cert_error(what: &str, e: impl std::fmt::Display) -> SessionError {
    SessionError::Certificate(format!("{what}: {e}"))
}

// ── Certificate provisioning ──────────────────────────────────────────────────

/// Make sure a certificate and key exist at the configured paths.
/// Returns `true` when a new self-signed pair was written.
pub fn ensure_certificate(tls: &TlsConfig) -> Result<bool, SessionError> {
    if tls.cert_path.exists() && tls.key_path.exists() {
        return Ok(false);
    }

    let (cert_pem, key_pem) = generate_self_signed(&tls.subject_alt_names)?;
    for path in [&tls.cert_path, &tls.key_path] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| cert_error(&format!("cannot create {}", parent.display()), e))?;
        }
    }
    std::fs::write(&tls.cert_path, cert_pem)
        .map_err(|e| cert_error(&format!("cannot write {}", tls.cert_path.display()), e))?;
    write_private(&tls.key_path, key_pem.as_bytes())
        .map_err(|e| cert_error(&format!("cannot write {}", tls.key_path.display()), e))?;

    tracing::info!(
        cert = %tls.cert_path.display(),
        key = %tls.key_path.display(),
        names = ?tls.subject_alt_names,
        "generated self-signed certificate"
    );
    Ok(true)
}

/// PEM certificate and PEM PKCS#8 key for the given subject alternative
/// names. Entries that parse as IP addresses become IP SANs.
pub fn generate_self_signed(names: &[String]) -> Result<(String, String), SessionError> {
    let mut params =
        CertificateParams::new(names.to_vec()).map_err(|e| cert_error("invalid subject name", e))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "parley relay");
    dn.push(DnType::OrganizationName, "Parley");
    params.distinguished_name = dn;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(5);
    params.not_after = now + time::Duration::days(GENERATED_CERT_DAYS);

    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| cert_error("key generation failed", e))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| cert_error("self-signing failed", e))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SessionError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| cert_error(&format!("cannot read {}", path.display()), e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| cert_error(&format!("bad certificate in {}", path.display()), e))?;
    if certs.is_empty() {
        return Err(SessionError::Certificate(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

// ── Server side ───────────────────────────────────────────────────────────────

/// rustls server config from the configured PEM files.
pub fn load_server_config(tls: &TlsConfig) -> Result<Arc<rustls::ServerConfig>, SessionError> {
    let certs = load_certs(&tls.cert_path)?;
    let key = PrivateKeyDer::from_pem_file(&tls.key_path)
        .map_err(|e| cert_error(&format!("cannot load key {}", tls.key_path.display()), e))?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// TCP listener whose connections still need their TLS handshake.
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    pub async fn bind(addr: SocketAddr, config: Arc<rustls::ServerConfig>) -> Result<Self, SessionError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept a TCP connection. The handshake is left to the caller so a
    /// slow client cannot stall the accept loop.
    pub async fn accept(&self) -> Result<(PendingTls, SocketAddr), SessionError> {
        let (stream, peer) = self.listener.accept().await?;
        Ok((
            PendingTls {
                stream,
                acceptor: self.acceptor.clone(),
            },
            peer,
        ))
    }
}

/// An accepted TCP stream before its TLS handshake.
pub struct PendingTls {
    stream: TcpStream,
    acceptor: TlsAcceptor,
}

impl PendingTls {
    pub async fn handshake(self, limit: Duration) -> Result<server::TlsStream<TcpStream>, SessionError> {
        match tokio::time::timeout(limit, self.acceptor.accept(self.stream)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SessionError::HandshakeTimeout),
        }
    }
}

// ── Client side ───────────────────────────────────────────────────────────────

/// rustls client config. With `ca_cert` only that certificate (or its
/// issuer) is trusted; without it any server certificate is accepted.
pub fn client_config(ca_cert: Option<&Path>) -> Result<Arc<rustls::ClientConfig>, SessionError> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?;

    let config = match ca_cert {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        None => {
            tracing::warn!("server certificate will not be verified");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
                .with_no_client_auth()
        }
    };
    Ok(Arc::new(config))
}

/// Open a TCP connection to `host:port` and run the TLS handshake.
pub async fn connect(
    host: &str,
    port: u16,
    config: Arc<rustls::ClientConfig>,
) -> Result<client::TlsStream<TcpStream>, SessionError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| cert_error(&format!("invalid server name {host:?}"), e))?;
    let tcp = TcpStream::connect((host, port)).await?;
    let stream = TlsConnector::from(config).connect(server_name, tcp).await?;
    Ok(stream)
}

/// Skips certificate chain and name checks. Handshake signatures are still
/// verified, so the server must hold the key for the certificate it shows.
#[derive(Debug)]
pub struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    pub fn new() -> Self {
        Self {
            provider: provider(),
        }
    }
}

impl Default for AcceptAnyServerCert {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
