//! TLS / mutual TLS for the gRPC stream backend.
//! PEM material is checked up front so a bad path fails connect with a clear error
//! instead of a handshake failure.

use crate::error::{ExecutorError, ExecutorResult};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use talkgate_core::StreamTls;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

/// Read a PEM file holding at least one certificate.
fn load_certs(path: &Path) -> ExecutorResult<Vec<u8>> {
    let f = File::open(path).map_err(|e| ExecutorError::Tls(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(f);
    let count = rustls_pemfile::certs(&mut reader)
        .filter_map(|r| r.ok())
        .count();
    if count == 0 {
        return Err(ExecutorError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    std::fs::read(path).map_err(|e| ExecutorError::Tls(format!("{}: {e}", path.display())))
}

/// Read a PEM file holding a private key.
fn load_private_key(path: &Path) -> ExecutorResult<Vec<u8>> {
    let f = File::open(path).map_err(|e| ExecutorError::Tls(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(f);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ExecutorError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| ExecutorError::Tls(format!("{}: no private key", path.display())))?;
    std::fs::read(path).map_err(|e| ExecutorError::Tls(format!("{}: {e}", path.display())))
}

/// Client TLS for an executor endpoint. `None` means plaintext HTTP/2.
///
/// Without a CA file the platform roots are trusted. A client certificate and key turn
/// on mutual TLS; giving only one of the two is a configuration error.
pub fn client_tls(tls: &StreamTls) -> ExecutorResult<Option<ClientTlsConfig>> {
    let StreamTls::Tls {
        ca_cert,
        client_cert,
        client_key,
        domain,
    } = tls
    else {
        return Ok(None);
    };

    let mut config = ClientTlsConfig::new();
    config = match ca_cert {
        Some(path) => config.ca_certificate(Certificate::from_pem(load_certs(path)?)),
        None => config.with_native_roots(),
    };
    match (client_cert, client_key) {
        (Some(cert), Some(key)) => {
            let identity = Identity::from_pem(load_certs(cert)?, load_private_key(key)?);
            config = config.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(ExecutorError::Tls(
                "client_cert and client_key must be given together".into(),
            ))
        }
    }
    if let Some(domain) = domain {
        config = config.domain_name(domain.clone());
    }
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn insecure_means_no_tls() {
        assert!(client_tls(&StreamTls::Insecure).unwrap().is_none());
    }

    #[test]
    fn half_configured_identity_is_rejected() {
        let tls = StreamTls::Tls {
            ca_cert: None,
            client_cert: Some(PathBuf::from("/nonexistent/client.pem")),
            client_key: None,
            domain: None,
        };
        assert!(matches!(client_tls(&tls), Err(ExecutorError::Tls(_))));
    }

    #[test]
    fn missing_ca_file_is_reported() {
        let tls = StreamTls::Tls {
            ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
            client_cert: None,
            client_key: None,
            domain: Some("executor.local".into()),
        };
        let err = client_tls(&tls).unwrap_err();
        assert!(err.to_string().contains("ca.pem"));
    }
}
