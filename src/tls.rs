use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

fn read_cert_chain(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader).collect()
}

fn read_private_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("{path} contains no private key"),
        )
    })
}

/// Build the TLS acceptor when a certificate/key pair is configured. Setting
/// only one of the two is a configuration mistake and refuses startup rather
/// than silently serving plaintext.
pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    if cert_path.is_none() && key_path.is_none() {
        return Ok(None);
    }
    let (Some(cert_path), Some(key_path)) = (cert_path, key_path) else {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "BOOKEND_TLS_CERT and BOOKEND_TLS_KEY must be set together",
        ));
    };

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(read_cert_chain(cert_path)?, read_private_key(key_path)?)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, format!("bad TLS key pair: {e}")))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
