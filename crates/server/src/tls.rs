use std::{path::Path, sync::Arc};

use tokio_rustls::{
    rustls::{
        self,
        crypto::{ring, CryptoProvider},
        pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName},
    },
    TlsAcceptor, TlsConnector,
};
use tracing::debug;

use crate::ServerError;

/// Every config built here uses ring, whatever backends are compiled in.
fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Server side TLS from a PEM certificate chain and its private key.
pub fn acceptor(cert: &Path, pkey: &Path) -> Result<TlsAcceptor, ServerError> {
    let certs = CertificateDer::pem_file_iter(cert)
        .map_err(|e| ServerError::tls_error(format!("{}: {e:?}", cert.display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::tls_error(format!("{}: {e:?}", cert.display())))?;
    let key = PrivateKeyDer::from_pem_file(pkey)
        .map_err(|e| ServerError::tls_error(format!("{}: {e:?}", pkey.display())))?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::tls_error(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::tls_error(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client side TLS trusting `cafile` if given, else the webpki roots.
pub fn connector(cafile: Option<&Path>) -> Result<TlsConnector, ServerError> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    if let Some(cafile) = cafile {
        debug!(cafile = %cafile.display(), "Trusting custom CA");
        let certs = CertificateDer::pem_file_iter(cafile)
            .map_err(|e| ServerError::tls_error(format!("{}: {e:?}", cafile.display())))?;
        for cert in certs {
            let cert =
                cert.map_err(|e| ServerError::tls_error(format!("{}: {e:?}", cafile.display())))?;
            root_cert_store
                .add(cert)
                .map_err(|e| ServerError::tls_error(e.to_string()))?;
        }
    } else {
        root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let config = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::tls_error(e.to_string()))?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_name(domain: &str) -> Result<ServerName<'static>, ServerError> {
    ServerName::try_from(domain.to_string()).map_err(|_| ServerError::InvalidServerName {
        name: domain.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    /// A localhost certificate signed by `ca.pem`, both under `testdata/`.
    pub(crate) fn testdata(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("testdata")
            .join(name)
    }

    #[test]
    fn acceptor_from_pem_pair() {
        assert!(acceptor(&testdata("cert.pem"), &testdata("key.pem")).is_ok());
        assert!(connector(Some(&testdata("ca.pem"))).is_ok());
    }

    #[test]
    fn server_names() {
        assert!(server_name("localhost").is_ok());
        assert!(server_name("kudos.example.com").is_ok());
        assert!(matches!(
            server_name("not a host"),
            Err(ServerError::InvalidServerName { .. })
        ));
    }

    #[test]
    fn missing_pem_files_are_tls_errors() {
        let missing = std::env::temp_dir().join("kudos-missing-cert.pem");
        assert!(matches!(
            acceptor(&missing, &missing),
            Err(ServerError::TlsError { .. })
        ));
        assert!(matches!(
            connector(Some(&missing)),
            Err(ServerError::TlsError { .. })
        ));
        assert!(connector(None).is_ok());
    }
}
