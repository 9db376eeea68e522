//! httptest-mock
//!
//! A declarative HTTP mock server for tests. Mocks describe the request they
//! accept and the response they produce; incoming requests are routed to the
//! first mock that matches.
//!
//! # Features
//!
//! - **Request Matching**: Match by method, path template, query and path params, headers and body
//! - **Canonical Bodies**: JSON bodies compare equal regardless of key order or whitespace
//! - **Partial Matches**: Near misses are reported with a per-field match log and answered with 400
//! - **Latency Simulation**: Per-mock response delays that never block other requests
//! - **Hit Assertions**: Expected hit counts tracked per test
//! - **Dynamic Registration**: Append mocks while the server is running
//!
//! # Example Definition
//!
//! ```yaml
//! name: get-user
//! request:
//!   method: GET
//!   path: /users/{id}
//!   path_params:
//!     id: "123"
//! response:
//!   status: 200
//!   headers:
//!     Content-Type: application/json
//!   body:
//!     id: 123
//!     name: Ada
//! assertion: true
//! expected_hits: 1
//! ```
//!
//! # Example Usage
//!
//! ```no_run
//! use httptest_mock::{Mock, MockServer};
//!
//! # async fn run() -> Result<(), httptest_mock::Error> {
//! let server = MockServer::builder()
//!     .mock(Mock::new("GET", "/health").with_response_status(200).with_response_body("OK"))
//!     .mocks_from("tests/mocks/*.yaml")
//!     .start()
//!     .await?;
//!
//! let url = server.url("/health");
//! # let _ = url;
//! server.assert_hits();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod matcher;
pub mod mock;
pub mod registry;
pub mod response;
pub mod server;

pub use config::{Body, MockDefinition, RequestCriteria, ResponseDefinition, Settings};
pub use error::{AssertionError, Error, HitMismatch, LoadError, ValidationError};
pub use matcher::{CapturedData, MatchLevel, MatchLog, MatchOutcome, PathValues, RequestMatcher};
pub use mock::{CustomHandler, Mock, MockContext, Mocker};
pub use registry::{mock_info_hook, MockRegistry, PreResponseHook};
pub use server::{MockServer, MockServerBuilder};
