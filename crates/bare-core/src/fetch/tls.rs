//! TLS connector for outbound `https:`/`wss:` remotes (spec.md §4.D).
//!
//! The teacher's stack is `smol`, which has no TLS of its own;
//! `swindon-rs-tk-http`'s dev-dependencies (`rustls`/`tokio-rustls`)
//! show the expected webpki-roots-backed client-config shape for this
//! corpus, adapted to the `futures-rustls` bridge so the same
//! `smol::net::TcpStream` (which implements `futures_io::AsyncRead`/
//! `AsyncWrite`) can be wrapped without switching runtimes.

use std::sync::Arc;

use futures_rustls::TlsConnector;
use futures_rustls::rustls::pki_types::ServerName;
use futures_rustls::rustls::{ClientConfig, RootCertStore};

use crate::error::BareError;

pub fn client_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(ClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
}

pub async fn connect<S>(host: &str, stream: S) -> Result<futures_rustls::client::TlsStream<S>, BareError>
where
    S: futures_lite::AsyncRead + futures_lite::AsyncWrite + Unpin,
{
    let connector = TlsConnector::from(client_config());
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| BareError::invalid(format!("invalid TLS server name {host:?}: {e}")))?;
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| BareError::ConnectionRefused { detail: format!("TLS handshake with {host} failed: {e}") })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builds_without_panicking() {
        let _cfg = client_config();
    }
}
