//! HTTP-client adapter (§6), feature-gated behind `http`.
//!
//! Wraps a `reqwest::Client` call as a [`Request`]: a 5xx response is treated as
//! a breaker failure, a 4xx passes straight through as `Ok` for the caller to
//! interpret, and the resource name defaults to scheme+host+path with the
//! query string stripped.

use std::sync::Arc;

use reqwest::{Client, Method, Response, Url};

use crate::breaker::Request;

/// Error returned by a guarded HTTP call: either the transport itself failed,
/// or the response landed in the 5xx range.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server error: {status}")]
    ServerError { status: reqwest::StatusCode },
}

/// Builds a [`Request`] that performs one HTTP round-trip. `resource` defaults
/// to the URL's scheme, host and path when `None`. The request carries a
/// fallback that serves a synthetic 503 response whenever the breaker rejects
/// the call or the round-trip itself fails, so a caller only ever has to
/// handle a `Response`, never the rejection/transport-error split.
pub fn guarded_request<'a>(
    client: Client,
    method: Method,
    url: Url,
    resource: Option<&str>,
) -> Request<'a, Response, HttpError> {
    let resource_name: Arc<str> = match resource {
        Some(name) => Arc::from(name),
        None => Arc::from(default_resource_name(&url).as_str()),
    };

    Request::new(resource_name, move || async move {
        let response = client.request(method, url).send().await?;
        if response.status().is_server_error() {
            Err(HttpError::ServerError {
                status: response.status(),
            })
        } else {
            Ok(response)
        }
    })
    .with_fallback(|_err| async { Ok(degraded_response()) })
}

/// A synthetic 503 response handed back by the adapter's fallback in place of
/// the downstream's own response.
fn degraded_response() -> Response {
    http::Response::builder()
        .status(reqwest::StatusCode::SERVICE_UNAVAILABLE)
        .body(reqwest::Body::from("circuit breaker: downstream unavailable"))
        .expect("status and body are both valid, this builder call cannot fail")
        .into()
}

/// `scheme://host/path`, query string stripped.
fn default_resource_name(url: &Url) -> String {
    let mut stripped = url.clone();
    stripped.set_query(None);
    stripped.set_fragment(None);
    stripped.to_string()
}
