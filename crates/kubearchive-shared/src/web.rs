//! A TLS-terminating HTTP server wrapping an Axum [`Router`].
//!
//! Certificates are mounted files (the standard cert-manager deployment
//! shape); each accepted TCP connection is TLS-terminated and then handed to
//! Hyper, which drives the router.

use std::{io::BufReader, net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{Router, extract::Request};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use snafu::{ResultExt, Snafu};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        crypto::ring::default_provider,
        pki_types::{CertificateDer, PrivateKeyDer},
        version::{TLS12, TLS13},
    },
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read certificate file {path:?}"))]
    ReadCertificate {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read private key file {path:?}"))]
    ReadPrivateKey {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("private key file {path:?} contains no key"))]
    NoPrivateKey { path: PathBuf },

    #[snafu(display("failed to set safe TLS protocol versions"))]
    SetSafeTlsProtocolVersions { source: tokio_rustls::rustls::Error },

    #[snafu(display("certificate and private key do not form a usable identity"))]
    BuildServerConfig { source: tokio_rustls::rustls::Error },

    #[snafu(display("failed to bind TCP listener to {socket_addr}"))]
    BindTcpListener {
        source: std::io::Error,
        socket_addr: SocketAddr,
    },
}

/// Paths of the mounted serving certificate.
#[derive(Clone, Debug)]
pub struct TlsOptions {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
}

/// A server which terminates TLS and serves the provided router over HTTPS.
pub struct TlsServer {
    socket_addr: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
}

impl TlsServer {
    pub fn new(socket_addr: SocketAddr, router: Router, tls: &TlsOptions) -> Result<Self> {
        let certificates = load_certificates(&tls.certificate_path)?;
        let private_key = load_private_key(&tls.private_key_path)?;

        let mut config = ServerConfig::builder_with_provider(default_provider().into())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .context(SetSafeTlsProtocolVersionsSnafu)?
            .with_no_client_auth()
            .with_single_cert(certificates, private_key)
            .context(BuildServerConfigSnafu)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            socket_addr,
            acceptor: TlsAcceptor::from(Arc::new(config)),
            router,
        })
    }

    /// Accepts connections until the process ends. Individual connection
    /// failures (bad handshakes, resets) are logged and do not stop the
    /// accept loop.
    pub async fn run(self) -> Result<()> {
        let listener =
            TcpListener::bind(self.socket_addr)
                .await
                .context(BindTcpListenerSnafu {
                    socket_addr: self.socket_addr,
                })?;
        tracing::info!(socket_addr = %self.socket_addr, "HTTPS server listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::trace!(%error, "failed to accept incoming TCP connection");
                    continue;
                }
            };

            let acceptor = self.acceptor.clone();
            let router = self.router.clone();
            tokio::spawn(handle_connection(stream, peer, acceptor, router));
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
) {
    // Wait for the TLS handshake to happen
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(error) => {
            tracing::trace!(%error, %peer, "error during TLS handshake");
            return;
        }
    };

    // Hyper has its own `AsyncRead`/`AsyncWrite` traits and doesn't use
    // tokio; `TokioIo` converts between them. Likewise its own `Service`
    // trait: `service_fn` bridges into the Tower service the router is.
    let tls_stream = TokioIo::new(tls_stream);
    let hyper_service =
        service_fn(move |request: Request<Incoming>| router.clone().oneshot(request));

    auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(tls_stream, hyper_service)
        .await
        .unwrap_or_else(|error| {
            tracing::debug!(error = %error, %peer, "failed to serve connection");
        });
}

fn load_certificates(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).context(ReadCertificateSnafu { path })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .context(ReadCertificateSnafu { path })
}

fn load_private_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).context(ReadPrivateKeySnafu { path })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .context(ReadPrivateKeySnafu { path })?
        .ok_or_else(|| Error::NoPrivateKey { path: path.clone() })
}
