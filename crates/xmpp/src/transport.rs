//! Byte transport under the XML stream: TCP plus the STARTTLS upgrade.

use std::future::Future;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, instrument};

use crate::error::XmppError;
use crate::stream::BoxedStream;

/// Opens transport streams and upgrades them to TLS.
///
/// The negotiation engine only sees boxed byte streams, so tests can supply
/// in-memory pipes.
pub trait Connector: Send + Sync + 'static {
    /// Open a plain stream to `host:port`.
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<BoxedStream, XmppError>> + Send;

    /// Run a TLS handshake over `stream`, verifying the certificate for
    /// `domain`.
    fn upgrade_to_tls(
        &self,
        stream: BoxedStream,
        domain: &str,
    ) -> impl Future<Output = Result<BoxedStream, XmppError>> + Send;
}

/// TCP connector with rustls for STARTTLS, trusting the webpki root set.
#[derive(Clone)]
pub struct TcpConnector {
    tls: TlsConnector,
}

impl TcpConnector {
    /// Build a connector with the bundled Mozilla root certificates.
    pub fn new() -> Result<Self, XmppError> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| XmppError::tls(format!("failed to configure TLS: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self::with_config(Arc::new(config)))
    }

    /// Build a connector from an existing rustls client configuration.
    pub fn with_config(config: Arc<ClientConfig>) -> Self {
        Self {
            tls: TlsConnector::from(config),
        }
    }
}

impl Connector for TcpConnector {
    #[instrument(skip(self), name = "xmpp.transport.connect")]
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream, XmppError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "TCP connection established");
        Ok(Box::new(stream))
    }

    #[instrument(skip(self, stream), name = "xmpp.transport.upgrade_to_tls")]
    async fn upgrade_to_tls(
        &self,
        stream: BoxedStream,
        domain: &str,
    ) -> Result<BoxedStream, XmppError> {
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| XmppError::tls(format!("invalid server name '{}': {}", domain, e)))?;

        let tls_stream = self.tls.connect(server_name, stream).await.map_err(|e| {
            error!(domain, error = %e, "TLS handshake failed");
            XmppError::tls(format!("TLS handshake with {} failed: {}", domain, e))
        })?;

        Ok(Box::new(tls_stream))
    }
}
