//! HTTP shim around [`MockRegistry::dispatch`].

use crate::config::{self, Settings};
use crate::error::{AssertionError, Error};
use crate::mock::{Mock, Mocker};
use crate::registry::{mock_info_hook, MockRegistry, PreResponseHook};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// Collects mocks, sources, hooks and settings for a [`MockServer`].
pub struct MockServerBuilder {
    mocks: Vec<Arc<dyn Mocker>>,
    sources: Vec<PathBuf>,
    hooks: Vec<PreResponseHook>,
    mock_info_prefix: Option<String>,
    settings: Settings,
    test_id: Option<String>,
    port: u16,
}

impl Default for MockServerBuilder {
    fn default() -> Self {
        Self {
            mocks: Vec::new(),
            sources: Vec::new(),
            hooks: Vec::new(),
            mock_info_prefix: None,
            settings: Settings::default(),
            test_id: None,
            port: 0,
        }
    }
}

impl MockServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mock(mut self, mock: impl Into<Arc<dyn Mocker>>) -> Self {
        self.mocks.push(mock.into());
        self
    }

    pub fn mocks<I, M>(mut self, mocks: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Arc<dyn Mocker>>,
    {
        self.mocks.extend(mocks.into_iter().map(Into::into));
        self
    }

    /// Load mocks from a file, a directory or a glob pattern when the server
    /// starts.
    pub fn mocks_from(mut self, source: impl Into<PathBuf>) -> Self {
        self.sources.push(source.into());
        self
    }

    pub fn hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&dyn Mocker, &mut Response<Bytes>) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Tag responses with `<prefix>-Name` and `<prefix>-Path`.
    ///
    /// An empty prefix uses the log header.
    pub fn with_mock_info_headers(mut self, prefix: impl Into<String>) -> Self {
        self.mock_info_prefix = Some(prefix.into());
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn log_header(mut self, header: impl Into<String>) -> Self {
        self.settings.log_header = header.into();
        self
    }

    pub fn without_log(mut self) -> Self {
        self.settings.log_matches = false;
        self.settings.log_unmatched = false;
        self
    }

    pub fn without_partial_matching(mut self) -> Self {
        self.settings.partial_matching = false;
        self
    }

    pub fn test_id(mut self, test_id: impl Into<String>) -> Self {
        self.test_id = Some(test_id.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Load and validate the mocks, then bind and start serving.
    pub async fn start(self) -> Result<MockServer, Error> {
        let mut mocks = self.mocks;
        if !self.sources.is_empty() {
            let loaded = config::load_mocks(&self.sources).map_err(Error::Load)?;
            mocks.extend(
                loaded
                    .into_iter()
                    .map(|definition| Arc::new(Mock::from(definition)) as Arc<dyn Mocker>),
            );
        }

        let mut hooks = self.hooks;
        if let Some(prefix) = self.mock_info_prefix {
            let prefix = if prefix.is_empty() {
                self.settings.log_header.clone()
            } else {
                prefix
            };
            hooks.push(mock_info_hook(&prefix));
        }

        let mut registry = MockRegistry::new(self.settings);
        if let Some(test_id) = self.test_id {
            registry = registry.with_test_id(test_id);
        }
        for hook in hooks {
            registry = registry.with_hook(move |mock, response| hook(mock, response));
        }
        let registry = Arc::new(registry.with_mocks(mocks));
        registry.validate()?;

        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Bind(addr, e))?;
        let address = listener.local_addr().map_err(Error::LocalAddr)?;

        let (shutdown, signal) = oneshot::channel();
        tokio::spawn(run_accept_loop(listener, Arc::clone(&registry), signal));

        info!(
            header = %registry.settings().log_header,
            address = %address,
            mocks = registry.len(),
            "Mock server listening"
        );

        Ok(MockServer {
            address,
            registry,
            shutdown: Some(shutdown),
        })
    }
}

/// A running mock server; stops accepting connections when dropped.
pub struct MockServer {
    address: SocketAddr,
    registry: Arc<MockRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockServer {
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start a server for `mocks` with default settings.
    pub async fn start<I, M>(mocks: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = M>,
        M: Into<Arc<dyn Mocker>>,
    {
        MockServerBuilder::new().mocks(mocks).start().await
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    pub fn registry(&self) -> &Arc<MockRegistry> {
        &self.registry
    }

    /// Append mocks; see [`MockRegistry::register`].
    pub fn register<I, M>(&self, mocks: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = M>,
        M: Into<Arc<dyn Mocker>>,
    {
        self.registry.register(mocks)
    }

    pub fn verify(&self) -> Result<(), AssertionError> {
        self.registry.verify()
    }

    /// Panic with the mismatch report if any hit assertion fails.
    pub fn assert_hits(&self) {
        if let Err(e) = self.verify() {
            panic!("{}", e);
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn run_accept_loop(
    listener: TcpListener,
    registry: Arc<MockRegistry>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(registry, stream).await {
                                debug!(remote = %remote, error = %e, "Connection closed with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "TCP error"),
                }
            }
            _ = &mut shutdown => {
                debug!("Mock server shutting down");
                break;
            }
        }
    }
}

async fn serve_connection(
    registry: Arc<MockRegistry>,
    stream: TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let server_builder = ServerBuilder::new(TokioExecutor::new());
    server_builder
        .serve_connection(
            TokioIo::new(stream),
            service_fn(move |request| handle(Arc::clone(&registry), request)),
        )
        .await
}

async fn handle(
    registry: Arc<MockRegistry>,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    trace!(method = %request.method(), uri = %request.uri(), "New HTTP request received");

    let response = match buffer_request(request).await {
        Ok(request) => registry.dispatch(request).await,
        Err(e) => {
            warn!(error = %e, "Cannot read request body");
            let mut response = Response::new(Bytes::from(e.to_string()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    };

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Full::new(body)))
}

async fn buffer_request(request: Request<Incoming>) -> Result<Request<Bytes>, hyper::Error> {
    let (parts, body) = request.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(Request::from_parts(parts, body))
}
