//! The client side of the Log Cache ingress API.
//!
//! [`Ingress`] is the single operation the emitter needs from Log Cache and
//! [`Connector`] hands out one fresh [`Ingress`] per source ID. The gRPC
//! implementations live here, alongside the TLS setup they require.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, warn};

use crate::{
    config::{Config, TlsConfig},
    proto::logcache::v1::{SendRequest, ingress_client::IngressClient},
};

/// Errors produced by [`GrpcConnector`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The Log Cache address could not be resolved from configuration.
    #[error(transparent)]
    Config(#[from] crate::config::Error),
    /// gRPC transport error
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    /// TLS material could not be read from disk.
    #[error("Failed to read TLS material {path:?}: {source}")]
    ReadTls {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

/// A sink for envelope batches.
#[async_trait]
pub trait Ingress: Send {
    /// Write one batch, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the status reported by the remote or by the transport.
    async fn send(
        &mut self,
        request: SendRequest,
        timeout: Duration,
    ) -> Result<(), tonic::Status>;
}

/// Source of [`Ingress`] clients, one per emitting task.
pub trait Connector: Send + Sync + 'static {
    /// The client handed to each emitting task.
    type Client: Ingress + 'static;

    /// Create a new client with its own connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be created.
    fn connect(&self) -> Result<Self::Client, Error>;
}

#[async_trait]
impl Ingress for IngressClient<Channel> {
    async fn send(
        &mut self,
        request: SendRequest,
        timeout: Duration,
    ) -> Result<(), tonic::Status> {
        let mut request = tonic::Request::new(request);
        request.set_timeout(timeout);
        IngressClient::send(self, request).await?;
        Ok(())
    }
}

/// Connects to Log Cache over gRPC, with mutual TLS when configured.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    endpoint: Endpoint,
}

impl GrpcConnector {
    /// Create a new [`GrpcConnector`] from the emitter configuration.
    ///
    /// TLS material is read eagerly so that a bad path is reported at boot
    /// rather than on the first request.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate or TLS
    /// material cannot be loaded.
    pub fn new(config: &Config, connect_timeout: Duration) -> Result<Self, Error> {
        config.validate()?;
        let uri = config.log_cache_uri()?;

        let mut endpoint = Endpoint::from(uri.clone()).connect_timeout(connect_timeout);
        match &config.tls {
            Some(tls) => {
                endpoint = endpoint.tls_config(make_tls_config(tls)?)?;
            }
            None => warn!("insecure_plaintext is set, connecting to {uri} without TLS"),
        }

        debug!("Log Cache endpoint prepared for {uri}");
        Ok(Self { endpoint })
    }
}

impl Connector for GrpcConnector {
    type Client = IngressClient<Channel>;

    fn connect(&self) -> Result<Self::Client, Error> {
        // A lazy channel dials on first use, so an unreachable Log Cache shows
        // up as failed sends.
        let channel = self.endpoint.connect_lazy();
        Ok(IngressClient::new(channel))
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|source| Error::ReadTls {
        path: path.to_path_buf(),
        source: Box::new(source),
    })
}

fn make_tls_config(tls: &TlsConfig) -> Result<ClientTlsConfig, Error> {
    let ca = read_pem(&tls.ca_path)?;
    let cert = read_pem(&tls.cert_path)?;
    let key = read_pem(&tls.key_path)?;

    Ok(ClientTlsConfig::new()
        .domain_name(tls.server_name.clone())
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key)))
}
