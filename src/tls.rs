//! TLS profiles.
//!
//! One [`TlsConfig`] resolves to a pair of rustls client configurations
//! (TCP with `h2,http/1.1` ALPN and QUIC with `h3`) plus a stable profile
//! key that participates in the pool's origin identity: requests with
//! different trust anchors, verification modes or client certificates
//! must never share a connection.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;

use crate::config::ProtocolConfig;
use crate::error::{self, Result, SslReason};

/// TLS settings for a client.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM bundle of trust anchors. Falls back to `SSL_CERT_FILE`, then
    /// `SSL_CERT_DIR`, then the bundled webpki roots.
    pub ca_file: Option<PathBuf>,
    /// Directory of PEM trust anchors, consulted after `ca_file`.
    pub ca_dir: Option<PathBuf>,
    /// Verify the peer certificate chain and hostname.
    pub verify: bool,
    /// Client certificate chain + key (PEM paths) for mutual TLS.
    pub client_cert: Option<ClientCert>,
    /// Send SNI in the handshake.
    pub sni: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientCert {
    pub cert_pem: PathBuf,
    pub key_pem: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_file: None,
            ca_dir: None,
            verify: true,
            client_cert: None,
            sni: true,
        }
    }
}

/// Hash of everything that makes two TLS setups non-poolable together.
pub(crate) type TlsProfileKey = u64;

/// Prebuilt rustls configurations shared by every connection of a client.
pub(crate) struct TlsContext {
    tcp: Arc<rustls::ClientConfig>,
    /// ALPN pinned to `http/1.1`: plain WebSocket upgrades cannot ride h2.
    tcp_h1: Arc<rustls::ClientConfig>,
    /// ALPN pinned to `h2`: RFC 8441 upgrades need a multiplexed stream.
    tcp_h2: Arc<rustls::ClientConfig>,
    quic: Option<Arc<rustls::ClientConfig>>,
    profile: TlsProfileKey,
    sni: bool,
}

impl TlsContext {
    pub(crate) fn new(cfg: &TlsConfig, protocols: &ProtocolConfig) -> Result<TlsContext> {
        let roots = load_roots(cfg)?;

        let mut alpn_tcp: Vec<Vec<u8>> = Vec::new();
        if protocols.enable_http2 {
            alpn_tcp.push(b"h2".to_vec());
        }
        alpn_tcp.push(b"http/1.1".to_vec());

        let mut tcp = base_config(cfg, roots.clone())?;
        tcp.alpn_protocols = alpn_tcp.clone();

        let mut tcp_h1 = base_config(cfg, roots.clone())?;
        tcp_h1.alpn_protocols = vec![b"http/1.1".to_vec()];

        let mut tcp_h2 = base_config(cfg, roots.clone())?;
        tcp_h2.alpn_protocols = vec![b"h2".to_vec()];

        let quic = if protocols.enable_http3 {
            let mut q = base_config(cfg, roots)?;
            q.alpn_protocols = vec![b"h3".to_vec()];
            Some(Arc::new(q))
        } else {
            None
        };

        let mut hasher = DefaultHasher::new();
        cfg.ca_file.hash(&mut hasher);
        cfg.ca_dir.hash(&mut hasher);
        std::env::var_os("SSL_CERT_FILE").hash(&mut hasher);
        std::env::var_os("SSL_CERT_DIR").hash(&mut hasher);
        cfg.verify.hash(&mut hasher);
        cfg.client_cert.hash(&mut hasher);
        cfg.sni.hash(&mut hasher);
        alpn_tcp.hash(&mut hasher);

        Ok(TlsContext {
            tcp: Arc::new(tcp),
            tcp_h1: Arc::new(tcp_h1),
            tcp_h2: Arc::new(tcp_h2),
            quic,
            profile: hasher.finish(),
            sni: cfg.sni,
        })
    }

    pub(crate) fn profile(&self) -> TlsProfileKey {
        self.profile
    }

    pub(crate) fn sni(&self) -> bool {
        self.sni
    }

    pub(crate) fn connector(&self) -> tokio_rustls::TlsConnector {
        tokio_rustls::TlsConnector::from(self.tcp.clone())
    }

    pub(crate) fn connector_h1(&self) -> tokio_rustls::TlsConnector {
        tokio_rustls::TlsConnector::from(self.tcp_h1.clone())
    }

    pub(crate) fn connector_h2(&self) -> tokio_rustls::TlsConnector {
        tokio_rustls::TlsConnector::from(self.tcp_h2.clone())
    }

    pub(crate) fn quic_client_config(&self) -> Result<quinn::ClientConfig> {
        let tls = self
            .quic
            .as_ref()
            .ok_or_else(|| error::builder("HTTP/3 is not enabled"))?;
        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls.as_ref().clone())
            .map_err(|e| error::ssl(SslReason::Handshake, e))?;
        Ok(quinn::ClientConfig::new(Arc::new(crypto)))
    }
}

fn base_config(cfg: &TlsConfig, roots: RootCertStore) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder();
    let builder = if cfg.verify {
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify::new()))
    };
    let mut config = match &cfg.client_cert {
        Some(identity) => {
            let (chain, key) = load_identity(identity)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| error::ssl(SslReason::Handshake, e))?
        }
        None => builder.with_no_client_auth(),
    };
    config.enable_sni = cfg.sni;
    Ok(config)
}

fn load_roots(cfg: &TlsConfig) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    let ca_file = cfg
        .ca_file
        .clone()
        .or_else(|| std::env::var_os("SSL_CERT_FILE").map(PathBuf::from));
    let ca_dir = cfg
        .ca_dir
        .clone()
        .or_else(|| std::env::var_os("SSL_CERT_DIR").map(PathBuf::from));

    let mut custom = false;
    if let Some(path) = ca_file {
        add_pem_file(&mut roots, &path)?;
        custom = true;
    }
    if let Some(dir) = ca_dir {
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| error::builder(format!("cannot read CA dir {}: {e}", dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if matches!(ext, Some("pem") | Some("crt")) {
                add_pem_file(&mut roots, &path)?;
                custom = true;
            }
        }
    }
    if !custom {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    Ok(roots)
}

fn add_pem_file(roots: &mut RootCertStore, path: &std::path::Path) -> Result<()> {
    let data = std::fs::read(path)
        .map_err(|e| error::builder(format!("cannot read CA bundle {}: {e}", path.display())))?;
    let mut reader = std::io::Cursor::new(data);
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| {
            error::builder(format!("malformed certificate in {}: {e}", path.display()))
        })?;
        roots
            .add(cert)
            .map_err(|e| error::builder(format!("rejected CA certificate: {e}")))?;
    }
    Ok(())
}

fn load_identity(
    identity: &ClientCert,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_data = std::fs::read(&identity.cert_pem).map_err(error::builder)?;
    let chain = rustls_pemfile::certs(&mut std::io::Cursor::new(cert_data))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(error::builder)?;

    let key_data = std::fs::read(&identity.key_pem).map_err(error::builder)?;
    let key = rustls_pemfile::private_key(&mut std::io::Cursor::new(key_data))
        .map_err(error::builder)?
        .ok_or_else(|| error::builder("no private key found in key PEM"))?;
    Ok((chain, key))
}

/// Map a handshake I/O failure onto the SSL error taxonomy.
pub(crate) fn classify_handshake_error(err: &std::io::Error) -> SslReason {
    let Some(tls_err) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    else {
        return SslReason::Handshake;
    };
    match tls_err {
        rustls::Error::InvalidCertificate(cert_err) => match cert_err {
            rustls::CertificateError::NotValidForName => SslReason::HostnameMismatch,
            rustls::CertificateError::NotValidForNameContext { .. } => SslReason::HostnameMismatch,
            _ => SslReason::Certificate,
        },
        _ => SslReason::Handshake,
    }
}

#[derive(Debug)]
struct NoVerify {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl NoVerify {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_key_differs_by_verify_mode() {
        let protocols = ProtocolConfig::default();
        let strict = TlsContext::new(&TlsConfig::default(), &protocols).unwrap();
        let lax = TlsContext::new(
            &TlsConfig {
                verify: false,
                ..TlsConfig::default()
            },
            &protocols,
        )
        .unwrap();
        assert_ne!(strict.profile(), lax.profile());
    }

    #[test]
    fn profile_key_is_stable() {
        let protocols = ProtocolConfig::default();
        let a = TlsContext::new(&TlsConfig::default(), &protocols).unwrap();
        let b = TlsContext::new(&TlsConfig::default(), &protocols).unwrap();
        assert_eq!(a.profile(), b.profile());
    }
}
