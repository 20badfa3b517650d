use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;

use crate::challenge::{CHALLENGE_PATH_PREFIX, ChallengePublisher, PublishError, validate_token};

const MAX_CONCURRENT_CONNECTIONS: usize = 100;
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Pending proofs, token -> key authorization.
#[derive(Debug, Default)]
pub struct ChallengeStore {
    challenges: RwLock<HashMap<String, String>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: &str, key_authorization: &str) {
        self.challenges
            .write()
            .await
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub async fn remove(&self, token: &str) -> Option<String> {
        self.challenges.write().await.remove(token)
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.challenges.read().await.get(token).cloned()
    }

    pub async fn len(&self) -> usize {
        self.challenges.read().await.len()
    }
}

/// Built-in HTTP/1 server answering `/.well-known/acme-challenge/<token>`.
/// Binds on construction; stops accepting connections when dropped.
pub struct StandaloneResponder {
    local_addr: SocketAddr,
    store: Arc<ChallengeStore>,
    server: JoinHandle<()>,
}

impl StandaloneResponder {
    pub async fn bind(addr: SocketAddr) -> Result<Self, PublishError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| PublishError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| PublishError::Bind { addr, source })?;
        info!("[responder] HTTP-01 responder listening on {}", local_addr);

        let store = Arc::new(ChallengeStore::new());
        let server = tokio::spawn(serve(listener, store.clone()));
        Ok(Self {
            local_addr,
            store,
            server,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &Arc<ChallengeStore> {
        &self.store
    }
}

impl Drop for StandaloneResponder {
    fn drop(&mut self) {
        debug!("[responder] shutting down {}", self.local_addr);
        self.server.abort();
    }
}

#[async_trait]
impl ChallengePublisher for StandaloneResponder {
    async fn publish(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<(), PublishError> {
        validate_token(token)?;
        self.store.insert(token, key_authorization).await;
        info!("[responder] serving challenge for {}", domain);
        Ok(())
    }

    async fn withdraw(&self, domain: &str, token: &str) -> Result<(), PublishError> {
        if self.store.remove(token).await.is_some() {
            debug!("[responder] withdrew challenge for {}", domain);
        }
        Ok(())
    }
}

async fn serve(listener: TcpListener, store: Arc<ChallengeStore>) {
    let connections = Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS));
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("[responder] accept failed: {}", err);
                continue;
            }
        };
        let Ok(permit) = connections.clone().try_acquire_owned() else {
            warn!("[responder] connection limit reached, rejecting {}", remote_addr);
            continue;
        };

        let store = store.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle_request(req, store.clone(), remote_addr));
            let served = tokio::time::timeout(
                CONNECTION_TIMEOUT,
                http1::Builder::new().serve_connection(io, service),
            )
            .await;
            match served {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!("[responder] connection from {} ended: {}", remote_addr, err),
                Err(_) => debug!("[responder] connection from {} timed out", remote_addr),
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    store: Arc<ChallengeStore>,
    remote_addr: SocketAddr,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"));
    }

    let Some(token) = req.uri().path().strip_prefix(CHALLENGE_PATH_PREFIX) else {
        return Ok(plain(StatusCode::NOT_FOUND, "Not found"));
    };

    match store.get(token).await {
        Some(key_authorization) => {
            info!("[responder] answering challenge request from {}", remote_addr);
            Ok(plain(StatusCode::OK, key_authorization))
        }
        None => {
            warn!("[responder] unknown token requested by {}", remote_addr);
            Ok(plain(StatusCode::NOT_FOUND, "Challenge not found"))
        }
    }
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain"),
    );
    response
}
