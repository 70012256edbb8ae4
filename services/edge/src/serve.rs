//! Process bootstrap: local HTTP/HTTPS listeners and supervisor tunnels.
//!
//! ```text
//! fd 3 (public :80)  --tunnel--> 127.0.0.1:http_port  --> router
//! fd 4 (public :443) --tunnel--> 127.0.0.1:https_port --> TLS --> router
//! ```

use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use axum::Router;
use futures_util::future::select_all;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, error, info};

use crate::app::{self, AppState};
use crate::config::{Settings, TlsFiles, SUPERVISED_LISTENER_COUNT};
use crate::dispatch::{ClientAddr, DispatchEngine, HttpsUpstream, InboundScheme};
use crate::rules::{RuleStore, StoreResolver};
use crate::stats::ConnectionCounter;
use crate::tunnel::{InheritedListeners, SocketTunnel, ACCEPT_ERROR_BACKOFF};

/// Load the certificate chain and private key for the secure port.
pub fn load_tls_config(files: &TlsFiles) -> Result<Arc<rustls::ServerConfig>> {
    let cert_file = File::open(&files.cert_path)
        .with_context(|| format!("failed to open {}", files.cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse {}", files.cert_path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", files.cert_path.display());
    }

    let key_file = File::open(&files.key_path)
        .with_context(|| format!("failed to open {}", files.key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("failed to parse {}", files.key_path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", files.key_path.display()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("unsupported TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate and private key do not match")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Serve plaintext HTTP on `listener`.
pub fn serve_plain(listener: TcpListener, router: Router) -> JoinHandle<()> {
    tokio::spawn(async move {
        log_listening(&listener, InboundScheme::Http);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let router = router.clone();
                    tokio::spawn(serve_connection(stream, peer, InboundScheme::Http, router));
                }
                Err(e) => {
                    error!(error = %e, "HTTP accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    })
}

/// Terminate TLS and serve HTTP on `listener`.
pub fn serve_tls(listener: TcpListener, router: Router, acceptor: TlsAcceptor) -> JoinHandle<()> {
    tokio::spawn(async move {
        log_listening(&listener, InboundScheme::Https);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let router = router.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls) => {
                                serve_connection(tls, peer, InboundScheme::Https, router).await
                            }
                            Err(e) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "HTTPS accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    })
}

fn log_listening(listener: &TcpListener, scheme: InboundScheme) {
    info!(
        listen_addr = ?listener.local_addr().ok(),
        scheme = scheme.as_str(),
        "Listening"
    );
}

/// Serve HTTP/1.1 or HTTP/2 on one connection until the peer hangs up.
async fn serve_connection<I>(io: I, peer: SocketAddr, scheme: InboundScheme, router: Router)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |mut request: hyper::Request<Incoming>| {
        request.extensions_mut().insert(ClientAddr(peer));
        request.extensions_mut().insert(scheme);
        router.clone().oneshot(request)
    });

    let builder = Builder::new(TokioExecutor::new());
    if let Err(e) = builder.serve_connection(TokioIo::new(io), service).await {
        debug!(peer = %peer, error = %e, "Connection error");
    }
}

/// Build every component from `settings` and serve until shutdown.
pub async fn run(settings: Arc<Settings>) -> Result<()> {
    let store = RuleStore::open(&settings.rules_db)
        .with_context(|| format!("failed to open {}", settings.rules_db.display()))?;
    let optimizer = store.spawn_optimize_loop();

    let upstream =
        HttpsUpstream::new(settings.ignore_backend_tls_errors).context("backend client")?;
    let resolver = StoreResolver::new(store.clone(), &settings.host_a, &settings.host_b);
    let engine = DispatchEngine::new(
        settings.host_a.clone(),
        Arc::new(resolver),
        Arc::new(upstream),
    );

    let counter = Arc::new(ConnectionCounter::new());
    let router = app::router(AppState {
        engine: Arc::new(engine),
        store,
        counter: Arc::clone(&counter),
        api_key: Arc::from(settings.api_key.as_str()),
    });

    // Behind the supervisor only the tunnels may reach the local ports.
    let bind_ip = if settings.is_supervised() {
        Ipv4Addr::LOCALHOST
    } else {
        Ipv4Addr::UNSPECIFIED
    };

    let mut handles = vec![optimizer];

    let http = bind(bind_ip, settings.http_port).await?;
    handles.push(serve_plain(http, router.clone()));

    match &settings.tls {
        Some(files) => {
            let acceptor = TlsAcceptor::from(load_tls_config(files)?);
            let https = bind(bind_ip, settings.https_port).await?;
            handles.push(serve_tls(https, router, acceptor));
        }
        None => info!("No TLS certificate configured, secure port disabled"),
    }

    if settings.is_supervised() {
        let mut inherited = InheritedListeners::from_supervisor(SUPERVISED_LISTENER_COUNT);
        for (index, port) in [settings.http_port, settings.https_port]
            .into_iter()
            .enumerate()
        {
            let tunnel =
                SocketTunnel::from_inherited(&mut inherited, index, port, Arc::clone(&counter))
                    .with_context(|| format!("failed to acquire inherited listener {index}"))?;
            handles.push(tunnel.spawn());
        }
    }

    info!(
        host_a = %settings.host_a,
        host_b = %settings.host_b,
        mode = ?settings.mode,
        "Edge ready"
    );

    tokio::select! {
        (result, index, _) = select_all(handles) => {
            error!(task = index, ?result, "Background task exited");
            bail!("background task {index} exited unexpectedly");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            Ok(())
        }
    }
}

async fn bind(ip: Ipv4Addr, port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from((ip, port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn pem_files() -> (NamedTempFile, NamedTempFile) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(cert.cert.pem().as_bytes()).unwrap();
        let mut key_file = NamedTempFile::new().unwrap();
        key_file
            .write_all(cert.key_pair.serialize_pem().as_bytes())
            .unwrap();
        (cert_file, key_file)
    }

    #[test]
    fn test_load_tls_config() {
        let (cert, key) = pem_files();
        let config = load_tls_config(&TlsFiles {
            cert_path: cert.path().to_path_buf(),
            key_path: key.path().to_path_buf(),
        })
        .unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_load_tls_config_rejects_swapped_files() {
        let (cert, key) = pem_files();
        let result = load_tls_config(&TlsFiles {
            cert_path: key.path().to_path_buf(),
            key_path: cert.path().to_path_buf(),
        });
        assert!(result.is_err());
    }
}
