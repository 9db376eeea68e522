//! Mock entries: criteria, response, hit bookkeeping and custom handlers.

use crate::config::{Body, MockDefinition, RequestCriteria};
use crate::error::{HitMismatch, ValidationError};
use crate::matcher::{CapturedData, MatchOutcome, RequestMatcher};
use crate::response::write_response;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Custom response logic for a mock, replacing its static response.
pub type CustomHandler =
    Arc<dyn Fn(&MockContext<'_>, &Request<Bytes>, &mut Response<Bytes>) + Send + Sync>;

/// Anything the registry can dispatch requests to.
///
/// [`Mock`] is the standard implementation; custom types can be
/// registered to take over matching and responding entirely.
#[async_trait]
pub trait Mocker: fmt::Display + Send + Sync {
    fn name(&self) -> &str;

    /// Route template the mock answers on.
    fn path(&self) -> &str;

    /// Serve this mock on a [`MatchLevel::Partial`](crate::MatchLevel::Partial) outcome.
    fn accepts_partial_match(&self) -> bool;

    fn validate(&self) -> Result<(), ValidationError>;

    /// Evaluate `request` against this mock.
    fn matches(&self, request: &Request<Bytes>, partial_matching: bool) -> MatchOutcome;

    /// Write this mock's response.
    async fn respond(
        &self,
        request: &Request<Bytes>,
        captured: &CapturedData,
        response: &mut Response<Bytes>,
    );

    /// Count a hit for `test_id` when assertion is enabled.
    fn register_hit(&self, test_id: &str);

    /// Compare expected and actual hits for `test_id`.
    fn assert_hits(&self, test_id: &str) -> Result<(), HitMismatch>;
}

/// What a [`CustomHandler`] sees of the mock that matched.
pub struct MockContext<'a> {
    mock: &'a Mock,
    captured: &'a CapturedData,
}

impl<'a> MockContext<'a> {
    pub fn mock(&self) -> &'a Mock {
        self.mock
    }

    pub fn name(&self) -> &'a str {
        self.mock.name()
    }

    /// Path parameter captured from the matched request, or `""`.
    pub fn get_path_value(&self, key: &str) -> &'a str {
        self.captured.path_value(key)
    }

    /// Query parameter captured from the matched request, or `""`.
    pub fn get_query_value(&self, key: &str) -> &'a str {
        self.captured.query_value(key)
    }

    /// Header captured from the matched request, or `""`.
    pub fn get_header_value(&self, key: &str) -> &'a str {
        self.captured.header_value(key)
    }
}

/// A request matcher paired with a response.
pub struct Mock {
    definition: MockDefinition,
    matcher: RequestMatcher,
    handler: Option<CustomHandler>,
    /// Hits per test identity
    hits: Mutex<HashMap<String, u64>>,
}

impl Mock {
    /// Start a mock for `method` and `path`; configure it with the
    /// `with_*` methods.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self::from(MockDefinition::new(method, path))
    }

    pub fn definition(&self) -> &MockDefinition {
        &self.definition
    }

    /// Hits registered for `test_id` so far.
    pub fn hits(&self, test_id: &str) -> u64 {
        self.hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(test_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.definition.name = name.into();
        self
    }

    pub fn with_query_param(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_request(|r| {
            r.query_params.insert(key.into(), value.into());
        })
    }

    pub fn with_path_param(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_request(|r| {
            r.path_params.insert(key.into(), value.into());
        })
    }

    pub fn with_header(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_request(|r| {
            r.headers.insert(key.into(), value.into());
        })
    }

    pub fn with_body(self, body: impl Into<Body>) -> Self {
        self.with_request(|r| r.body = Some(body.into()))
    }

    pub fn with_partial_match(self, accept: bool) -> Self {
        self.with_request(|r| r.partial_match = accept)
    }

    pub fn with_response_status(mut self, status: u16) -> Self {
        self.definition.response.status = status;
        self
    }

    pub fn with_response_body(mut self, body: impl Into<Body>) -> Self {
        self.definition.response.body = Some(body.into());
        self
    }

    pub fn with_response_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.definition.response.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.definition.response.delay_ms = delay.as_millis() as u64;
        self
    }

    /// Enable or disable hit assertion with the expected hit count.
    pub fn with_assertion(mut self, enabled: bool, expected_hits: u64) -> Self {
        self.definition.assertion = enabled;
        self.definition.expected_hits = expected_hits;
        self
    }

    pub fn with_custom_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&MockContext<'_>, &Request<Bytes>, &mut Response<Bytes>) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    fn with_request(mut self, edit: impl FnOnce(&mut RequestCriteria)) -> Self {
        edit(&mut self.definition.request);
        self.matcher = RequestMatcher::new(self.definition.request.clone());
        self
    }
}

impl From<MockDefinition> for Mock {
    fn from(definition: MockDefinition) -> Self {
        Self {
            matcher: RequestMatcher::new(definition.request.clone()),
            definition,
            handler: None,
            hits: Mutex::new(HashMap::new()),
        }
    }
}

impl fmt::Display for Mock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.definition, f)
    }
}

impl fmt::Debug for Mock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mock")
            .field("definition", &self.definition)
            .field("custom_handler", &self.handler.is_some())
            .finish()
    }
}

#[async_trait]
impl Mocker for Mock {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn path(&self) -> &str {
        &self.definition.request.path
    }

    fn accepts_partial_match(&self) -> bool {
        self.definition.request.partial_match
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.definition.validate()
    }

    fn matches(&self, request: &Request<Bytes>, partial_matching: bool) -> MatchOutcome {
        self.matcher.evaluate(request, partial_matching)
    }

    async fn respond(
        &self,
        request: &Request<Bytes>,
        captured: &CapturedData,
        response: &mut Response<Bytes>,
    ) {
        let Some(handler) = &self.handler else {
            write_response(&self.definition.response, response).await;
            return;
        };

        if let Some(delay) = self.definition.response.delay() {
            debug!(mock = %self.definition.display_name(), delay_ms = self.definition.response.delay_ms, "Applying delay");
            tokio::time::sleep(delay).await;
        }
        let context = MockContext {
            mock: self,
            captured,
        };
        handler(&context, request, response);
    }

    fn register_hit(&self, test_id: &str) {
        if !self.definition.assertion {
            return;
        }
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        *hits.entry(test_id.to_string()).or_insert(0) += 1;
    }

    fn assert_hits(&self, test_id: &str) -> Result<(), HitMismatch> {
        if !self.definition.assertion {
            return Ok(());
        }
        let actual = self.hits(test_id);
        if actual == self.definition.expected_hits {
            Ok(())
        } else {
            Err(HitMismatch {
                mock: self.to_string(),
                test_id: test_id.to_string(),
                expected: self.definition.expected_hits,
                actual,
            })
        }
    }
}
