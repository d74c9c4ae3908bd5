use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub fn config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("dftpd");
    }
    PathBuf::from(".dftpd")
}

/// Load the configured certificate pair, or generate and persist a
/// self-signed one under `default_dir` when none is given.
pub fn load_or_generate_server_config(
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    default_dir: &Path,
) -> Result<rustls::ServerConfig> {
    let (cert_path, key_path) = match (cert, key) {
        (Some(c), Some(k)) => (c, k),
        (None, None) => (default_dir.join("dftpd-cert.pem"), default_dir.join("dftpd-key.pem")),
        _ => return Err(anyhow!("tls_cert and tls_key must be set together")),
    };
    if !(cert_path.exists() && key_path.exists()) {
        write_self_signed(&cert_path, &key_path)?;
    }

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(read_certs(&cert_path)?, read_key(&key_path)?)
        .with_context(|| format!("tls config from {}", cert_path.display()))
}

fn write_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    for dir in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let pair = rcgen::generate_simple_self_signed(vec!["dftpd.local".to_string()])
        .context("self-signed certificate")?;
    fs::write(cert_path, pair.serialize_pem()?)
        .with_context(|| format!("write {}", cert_path.display()))?;
    fs::write(key_path, pair.serialize_private_key_pem())
        .with_context(|| format!("write {}", key_path.display()))?;
    log::info!("generated self-signed certificate at {}", cert_path.display());
    Ok(())
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("certificates in {}", path.display()))
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key in {}", path.display()))
}

pub fn acceptor(cfg: rustls::ServerConfig) -> TlsAcceptor {
    TlsAcceptor::from(Arc::new(cfg))
}

/// FTP clients present self-signed certificates on their data channels, so
/// the connecting side of a data channel accepts whatever it is shown.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

pub fn data_channel_connector() -> TlsConnector {
    let cfg = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(cfg))
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|e| anyhow!("invalid server name {host}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reloads_self_signed_pair() {
        let dir = tempfile::tempdir().unwrap();
        load_or_generate_server_config(None, None, dir.path()).unwrap();
        assert!(dir.path().join("dftpd-cert.pem").exists());
        assert!(dir.path().join("dftpd-key.pem").exists());
        // second load reads the persisted pair
        load_or_generate_server_config(None, None, dir.path()).unwrap();
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_or_generate_server_config(Some(dir.path().join("c.pem")), None, dir.path());
        assert!(err.is_err());
    }

    #[test]
    fn server_names() {
        assert!(matches!(server_name_for("10.0.0.1").unwrap(), ServerName::IpAddress(_)));
        assert!(server_name_for("slave.example").is_ok());
    }
}
