//! Renders a mock's response definition onto an outgoing response.

use crate::config::{Body, ResponseDefinition};
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Response, StatusCode};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Wait out the configured delay, then write status, headers and body.
///
/// The delay only suspends the task serving this request.
pub async fn write_response(definition: &ResponseDefinition, response: &mut Response<Bytes>) {
    if let Some(delay) = definition.delay() {
        debug!(delay_ms = definition.delay_ms, "Applying delay");
        tokio::time::sleep(delay).await;
    }
    render(definition, response);
}

/// Write status, headers and body without delay.
///
/// Defaults such as the JSON content type are applied to a copy of the
/// configured headers, never to the shared definition.
pub fn render(definition: &ResponseDefinition, response: &mut Response<Bytes>) {
    let mut status = definition.status;
    let mut headers = definition.headers.clone();

    let body = match &definition.body {
        None => Bytes::new(),
        Some(Body::Text(text)) => Bytes::from(text.clone()),
        Some(Body::Bytes(raw)) => raw.clone(),
        Some(Body::Structured(value)) => encode_body(value, &mut status, &mut headers),
    };

    let sorted: BTreeMap<_, _> = headers.iter().collect();
    for (name, value) in sorted {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid response header"),
        }
    }

    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if !body.is_empty() {
        *response.body_mut() = body;
    }
}

/// Serialize a structured body as JSON.
///
/// On failure the status becomes 500 and the body carries the error text;
/// on success a JSON content type is added unless one is configured.
fn encode_body<T: Serialize + ?Sized>(
    value: &T,
    status: &mut u16,
    headers: &mut HashMap<String, String>,
) -> Bytes {
    match serde_json::to_vec(value) {
        Ok(encoded) => {
            set_content_type_if_missing(headers, JSON_CONTENT_TYPE);
            Bytes::from(encoded)
        }
        Err(e) => {
            warn!(error = %e, "Cannot encode response body");
            *status = StatusCode::INTERNAL_SERVER_ERROR.as_u16();
            Bytes::from(e.to_string())
        }
    }
}

fn set_content_type_if_missing(headers: &mut HashMap<String, String>, content_type: &str) {
    if headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case("content-type"))
    {
        return;
    }
    headers.insert("Content-Type".to_string(), content_type.to_string());
}
