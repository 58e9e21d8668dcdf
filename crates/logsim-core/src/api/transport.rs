//! The seam between the pipeline and the network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use tracing::debug;

use super::classify::RawResult;
use super::request::{Body, HttpRequest, Method};

/// Sends one request and reports what came back, without interpreting it.
///
/// Implementations must not fail: every failure is expressed as a
/// `RawResult` so the classifier can apply one policy to all of them.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> RawResult;
}

/// Production transport backed by reqwest.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }

    fn failure(err: reqwest::Error) -> RawResult {
        if err.is_timeout() {
            RawResult::Timeout
        } else {
            RawResult::Connect(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> RawResult {
        let mut builder = self
            .client
            .request(Self::method(request.method), &request.url)
            .header(header::ACCEPT, "application/json");

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref value) = request.authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder = match request.body {
            Body::Empty => builder,
            Body::Json(ref value) => builder.json(value),
            Body::Form(ref fields) => builder.form(fields),
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return Self::failure(e),
        };

        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => {
                debug!(url = %request.url, status, "Response received");
                RawResult::Response { status, body }
            }
            Err(e) => Self::failure(e),
        }
    }
}
