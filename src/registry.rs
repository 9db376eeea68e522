//! Mock registry and request dispatcher.
//!
//! Holds the ordered mock list, routes every request through it and keeps
//! hit assertions per test identity.

use crate::config::Settings;
use crate::error::{AssertionError, Error};
use crate::matcher::{MatchLevel, MatchOutcome};
use crate::mock::{Mock, Mocker};
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Runs before the matched mock responds; may adjust the outgoing response.
pub type PreResponseHook = Arc<dyn Fn(&dyn Mocker, &mut Response<Bytes>) + Send + Sync>;

type Snapshot = Arc<Vec<Arc<dyn Mocker>>>;

impl From<Mock> for Arc<dyn Mocker> {
    fn from(mock: Mock) -> Self {
        Arc::new(mock)
    }
}

/// Ordered collection of mocks; the first registered mock has the highest
/// priority.
///
/// Dispatch works on a snapshot of the list, so a registration never waits
/// for in-flight responses (including their delays) and only affects
/// requests dispatched after it returns.
pub struct MockRegistry {
    mocks: RwLock<Snapshot>,
    hooks: Vec<PreResponseHook>,
    settings: Settings,
    test_id: String,
}

impl MockRegistry {
    /// Create an empty registry.
    ///
    /// Hits are counted under the name of the current thread, which is the
    /// test name when running under the test harness.
    pub fn new(settings: Settings) -> Self {
        let test_id = std::thread::current()
            .name()
            .unwrap_or("main")
            .to_string();
        Self {
            mocks: RwLock::new(Arc::new(Vec::new())),
            hooks: Vec::new(),
            settings,
            test_id,
        }
    }

    /// Use `test_id` as the identity hits are counted under.
    pub fn with_test_id(mut self, test_id: impl Into<String>) -> Self {
        self.test_id = test_id.into();
        self
    }

    /// Add a hook; hooks run in the order they were added.
    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&dyn Mocker, &mut Response<Bytes>) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Add mocks without validating them; see [`MockRegistry::validate`].
    pub fn with_mocks<I, M>(self, mocks: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Arc<dyn Mocker>>,
    {
        let added: Vec<Arc<dyn Mocker>> = mocks.into_iter().map(Into::into).collect();
        {
            let mut current = self.mocks.write().unwrap_or_else(PoisonError::into_inner);
            let mut merged = Vec::clone(&current);
            merged.extend(added.iter().cloned());
            *current = Arc::new(merged);
        }
        for mock in &added {
            self.log_registered(mock.as_ref());
        }
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// The mocks currently registered, in priority order.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.mocks.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Validate every registered mock, aggregating the failures.
    pub fn validate(&self) -> Result<(), Error> {
        validate_all(&self.snapshot(), &self.settings.log_header)
    }

    /// Append mocks at the lowest priority.
    ///
    /// The merged list is validated as a whole; on failure nothing is
    /// appended and the error lists every invalid mock.
    pub fn register<I, M>(&self, mocks: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = M>,
        M: Into<Arc<dyn Mocker>>,
    {
        let added: Vec<Arc<dyn Mocker>> = mocks.into_iter().map(Into::into).collect();

        let mut current = self.mocks.write().unwrap_or_else(PoisonError::into_inner);
        let mut merged = Vec::clone(&current);
        merged.extend(added.iter().cloned());
        validate_all(&merged, &self.settings.log_header)?;
        *current = Arc::new(merged);
        drop(current);

        for mock in &added {
            self.log_registered(mock.as_ref());
        }
        Ok(())
    }

    /// Route one request through the registered mocks.
    ///
    /// The first full match is served, as is the first partial match of a
    /// mock that accepts partial matches. Otherwise partial candidates get
    /// 400 Bad Request and anything else 404 Not Found.
    pub async fn dispatch(&self, request: Request<Bytes>) -> Response<Bytes> {
        let snapshot = self.snapshot();
        let header = &self.settings.log_header;
        let mut candidates = Vec::new();

        for mock in snapshot.iter() {
            let outcome = mock.matches(&request, self.settings.partial_matching);
            match outcome.level {
                MatchLevel::Full => {
                    if self.settings.log_matches {
                        info!(header = %header, mock = %mock, "Request matched");
                    }
                    return self.serve(mock.as_ref(), &request, &outcome).await;
                }
                MatchLevel::Partial if mock.accepts_partial_match() => {
                    if self.settings.log_matches {
                        info!(header = %header, mock = %mock, "Request partially matched");
                    }
                    return self.serve(mock.as_ref(), &request, &outcome).await;
                }
                MatchLevel::Partial => {
                    if self.settings.log_unmatched {
                        warn!(
                            header = %header,
                            mock = %mock,
                            details = %outcome.log,
                            "Request did not match"
                        );
                    }
                    candidates.push(mock);
                }
                MatchLevel::None => {
                    debug!(header = %header, mock = %mock, details = %outcome.log, "Mock skipped");
                }
            }
        }

        let method = request.method();
        let uri = request.uri();
        if !candidates.is_empty() {
            if self.settings.log_unmatched {
                warn!(
                    header = %header,
                    method = %method,
                    uri = %uri,
                    candidates = candidates.len(),
                    "Mock candidates for request"
                );
                for candidate in &candidates {
                    warn!(header = %header, mock = %candidate, "Partial match details");
                }
            }
            return status_only(StatusCode::BAD_REQUEST);
        }

        if self.settings.log_unmatched {
            warn!(header = %header, method = %method, uri = %uri, "Request not matched");
        }
        status_only(StatusCode::NOT_FOUND)
    }

    /// Check the expected hits of every mock for `test_id`.
    pub fn assert_all(&self, test_id: &str) -> Result<(), AssertionError> {
        let mismatches: Vec<_> = self
            .snapshot()
            .iter()
            .filter_map(|mock| mock.assert_hits(test_id).err())
            .collect();
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(AssertionError(mismatches))
        }
    }

    /// Check the expected hits of every mock for this registry's test id.
    pub fn verify(&self) -> Result<(), AssertionError> {
        self.assert_all(&self.test_id)
    }

    async fn serve(
        &self,
        mock: &dyn Mocker,
        request: &Request<Bytes>,
        outcome: &MatchOutcome,
    ) -> Response<Bytes> {
        let mut response = Response::new(Bytes::new());
        for hook in &self.hooks {
            hook(mock, &mut response);
        }
        mock.respond(request, &outcome.captured, &mut response).await;
        mock.register_hit(&self.test_id);
        response
    }

    fn log_registered(&self, mock: &dyn Mocker) {
        if self.settings.log_matches {
            info!(header = %self.settings.log_header, mock = %mock, "Registered mock");
        }
    }
}

/// Hook that tags responses with `<prefix>-Name` and `<prefix>-Path`.
///
/// `-`, `_` and `.` are trimmed from both ends of the prefix.
pub fn mock_info_hook(prefix: &str) -> PreResponseHook {
    let prefix = prefix.trim_matches(|c| c == '-' || c == '_' || c == '.');
    let name_header = HeaderName::from_bytes(format!("{}-Name", prefix).as_bytes()).ok();
    let path_header = HeaderName::from_bytes(format!("{}-Path", prefix).as_bytes()).ok();

    Arc::new(move |mock: &dyn Mocker, response: &mut Response<Bytes>| {
        for (header, value) in [(&name_header, mock.name()), (&path_header, mock.path())] {
            if let (Some(header), Ok(value)) = (header, HeaderValue::from_str(value)) {
                response.headers_mut().insert(header.clone(), value);
            }
        }
    })
}

fn validate_all(mocks: &[Arc<dyn Mocker>], header: &str) -> Result<(), Error> {
    if mocks.is_empty() {
        return Err(Error::NoMocks(header.to_string()));
    }
    let errors: Vec<_> = mocks
        .iter()
        .filter_map(|mock| mock.validate().err())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation {
            header: header.to_string(),
            errors,
        })
    }
}

fn status_only(status: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_LOG_HEADER;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn request(method: &str, uri: &str) -> Request<Bytes> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Bytes::new())
            .unwrap()
    }

    fn registry(mocks: Vec<Mock>) -> MockRegistry {
        let registry = MockRegistry::new(Settings::default())
            .with_test_id("registry-tests")
            .with_mocks(mocks);
        registry.validate().unwrap();
        registry
    }

    fn without_partial_matching() -> Settings {
        Settings {
            partial_matching: false,
            ..Settings::default()
        }
    }

    fn orders_mock(accept_partial: bool) -> Mock {
        Mock::new("POST", "/orders")
            .with_header("Api-Key", "secret")
            .with_partial_match(accept_partial)
            .with_response_status(201)
    }

    #[tokio::test]
    async fn test_exact_match() {
        let registry = registry(vec![Mock::new("GET", "/health")
            .with_response_status(200)
            .with_response_body("OK")]);

        let response = registry.dispatch(request("GET", "/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"OK"));
    }

    #[tokio::test]
    async fn test_method_mismatch_is_not_found() {
        let registry = registry(vec![
            Mock::new("GET", "/items").with_response_status(200),
            Mock::new("PUT", "/items")
                .with_header("X-Id", "1")
                .with_response_status(200),
        ]);

        let response = registry.dispatch(request("DELETE", "/items")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.body().is_empty());
    }

    #[tokio::test]
    async fn test_first_registered_mock_wins() {
        let registry = registry(vec![
            Mock::new("GET", "/users/{id}")
                .with_response_status(200)
                .with_response_body("template"),
            Mock::new("GET", "/users/me")
                .with_response_status(200)
                .with_response_body("literal"),
        ]);

        let response = registry.dispatch(request("GET", "/users/me")).await;
        assert_eq!(response.body(), &Bytes::from_static(b"template"));
    }

    #[tokio::test]
    async fn test_accepted_partial_match_is_served() {
        let registry = registry(vec![orders_mock(true)]);

        let response = registry.dispatch(request("POST", "/orders")).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_partial_candidate_is_bad_request() {
        let registry = registry(vec![orders_mock(false)]);

        let response = registry.dispatch(request("POST", "/orders")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.body().is_empty());
    }

    #[tokio::test]
    async fn test_partial_candidate_with_partial_matching_disabled_is_not_found() {
        let registry = MockRegistry::new(without_partial_matching()).with_mocks(vec![orders_mock(false)]);

        let response = registry.dispatch(request("POST", "/orders")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_accepting_mock_is_not_served_when_partial_matching_disabled() {
        let registry = MockRegistry::new(without_partial_matching()).with_mocks(vec![orders_mock(true)]);

        let response = registry.dispatch(request("POST", "/orders")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_later_full_match_beats_earlier_candidate() {
        let registry = registry(vec![
            orders_mock(false),
            Mock::new("POST", "/orders").with_response_status(202),
        ]);

        let response = registry.dispatch(request("POST", "/orders")).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_body_canonicalization_through_dispatch() {
        let registry = registry(vec![Mock::new("POST", "/users")
            .with_body(json!({"a": 1, "b": 2}))
            .with_response_status(201)]);

        let req = Request::builder()
            .method("POST")
            .uri("/users")
            .body(Bytes::from_static(br#"{"b":2,"a":1}"#))
            .unwrap();
        let response = registry.dispatch(req).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_path_param_capture_reaches_custom_handler() {
        let registry = registry(vec![Mock::new("GET", "/users/{id}")
            .with_path_param("id", "123")
            .with_response_status(200)
            .with_custom_handler(|ctx, _, response| {
                *response.body_mut() = Bytes::from(ctx.get_path_value("id").to_string());
            })]);

        let response = registry.dispatch(request("GET", "/users/123")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"123"));
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_before_response() {
        let registry = MockRegistry::new(Settings::default())
            .with_hook(|_, response| {
                response
                    .headers_mut()
                    .append("x-order", HeaderValue::from_static("first"));
            })
            .with_hook(|_, response| {
                response
                    .headers_mut()
                    .append("x-order", HeaderValue::from_static("second"));
            })
            .with_mocks(vec![Mock::new("GET", "/health").with_response_status(200)]);

        let response = registry.dispatch(request("GET", "/health")).await;
        let order: Vec<_> = response.headers().get_all("x-order").iter().collect();
        assert_eq!(order, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_mock_info_hook() {
        let hook = mock_info_hook("-Mock_");
        let registry = MockRegistry::new(Settings::default())
            .with_hook(move |mock, response| hook(mock, response))
            .with_mocks(vec![Mock::new("GET", "/users/{id}")
                .with_name("user")
                .with_response_status(200)]);

        let response = registry.dispatch(request("GET", "/users/1")).await;
        assert_eq!(response.headers()["mock-name"], "user");
        assert_eq!(response.headers()["mock-path"], "/users/{id}");
    }

    #[tokio::test]
    async fn test_hits_are_asserted_per_test_id() {
        let registry = registry(vec![Mock::new("GET", "/health")
            .with_response_status(200)
            .with_assertion(true, 2)]);

        registry.dispatch(request("GET", "/health")).await;
        let err = registry.verify().unwrap_err();
        assert_eq!(err.0.len(), 1);
        assert_eq!(err.0[0].discrepancy(), 1);

        registry.dispatch(request("GET", "/health")).await;
        assert!(registry.verify().is_ok());
        assert!(registry.assert_all("another-test").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dispatch_counts_every_hit() {
        let registry = Arc::new(registry(vec![Mock::new("GET", "/health")
            .with_response_status(200)
            .with_assertion(true, 100)]));

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.dispatch(request("GET", "/health")).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().status(), StatusCode::OK);
        }

        assert!(registry.verify().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delay_suspends_only_its_own_request() {
        let registry = Arc::new(registry(vec![
            Mock::new("GET", "/slow")
                .with_delay(Duration::from_millis(50))
                .with_response_status(200),
            Mock::new("GET", "/fast").with_response_status(200),
        ]));

        let slow = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let started = Instant::now();
                registry.dispatch(request("GET", "/slow")).await;
                started.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let started = Instant::now();
        let response = registry.dispatch(request("GET", "/fast")).await;
        let fast = started.elapsed();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!slow.is_finished());

        let slow = slow.await.unwrap();
        assert!(slow >= Duration::from_millis(50));
        assert!(fast < Duration::from_millis(25), "fast request took {:?}", fast);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_register_is_visible_to_later_dispatches() {
        let registry = Arc::new(registry(vec![Mock::new("GET", "/slow")
            .with_delay(Duration::from_millis(50))
            .with_response_status(200)]));

        let in_flight = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.dispatch(request("GET", "/slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        registry
            .register(vec![Mock::new("GET", "/new").with_response_status(204)])
            .unwrap();
        assert_eq!(registry.len(), 2);

        let response = registry.dispatch(request("GET", "/new")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(in_flight.await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_registration_is_rolled_back() {
        let registry = registry(vec![Mock::new("GET", "/health").with_response_status(200)]);

        let err = registry
            .register(vec![
                Mock::new("GET", "/ok").with_response_status(200),
                Mock::new("BREW", "/coffee").with_response_status(418),
                Mock::new("GET", "/bad").with_response_status(42),
            ])
            .unwrap_err();
        match err {
            Error::Validation { header, errors } => {
                assert_eq!(header, DEFAULT_LOG_HEADER);
                assert_eq!(errors.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(registry.len(), 1);
        let response = registry.dispatch(request("GET", "/ok")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_empty_registry_is_invalid() {
        let registry = MockRegistry::new(Settings::default());
        assert!(matches!(registry.validate(), Err(Error::NoMocks(_))));
    }

    /// Counts how often it is rendered.
    #[derive(Default)]
    struct RootOnly(AtomicUsize);

    impl std::fmt::Display for RootOnly {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fetch_add(1, Ordering::SeqCst);
            f.write_str("root-only GET /")
        }
    }

    #[async_trait::async_trait]
    impl Mocker for RootOnly {
        fn name(&self) -> &str {
            "root-only"
        }

        fn path(&self) -> &str {
            "/"
        }

        fn accepts_partial_match(&self) -> bool {
            false
        }

        fn validate(&self) -> Result<(), crate::error::ValidationError> {
            Ok(())
        }

        fn matches(&self, request: &Request<Bytes>, _partial_matching: bool) -> MatchOutcome {
            let level = if request.method() == http::Method::GET && request.uri().path() == "/" {
                MatchLevel::Full
            } else {
                MatchLevel::None
            };
            MatchOutcome {
                level,
                ..MatchOutcome::default()
            }
        }

        async fn respond(
            &self,
            _request: &Request<Bytes>,
            _captured: &crate::matcher::CapturedData,
            response: &mut Response<Bytes>,
        ) {
            *response.body_mut() = Bytes::from_static(b"root-only");
        }

        fn register_hit(&self, _test_id: &str) {}

        fn assert_hits(&self, _test_id: &str) -> Result<(), crate::error::HitMismatch> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_custom_mocker_can_be_registered() {
        let custom: Arc<dyn Mocker> = Arc::new(RootOnly::default());
        let registry = MockRegistry::new(Settings::default()).with_mocks(vec![custom]);

        let response = registry.dispatch(request("GET", "/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(b"root-only"));
    }

    #[test]
    fn test_chained_with_mocks_logs_each_mock_once() {
        let root = Arc::new(RootOnly::default());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(std::io::sink)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let registry = MockRegistry::new(Settings::default())
                .with_mocks(vec![Arc::clone(&root) as Arc<dyn Mocker>])
                .with_mocks(vec![Mock::new("GET", "/health").with_response_status(200)]);
            assert_eq!(registry.len(), 2);
        });

        assert_eq!(root.0.load(Ordering::SeqCst), 1);
    }
}
