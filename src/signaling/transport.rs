//! HTTP transport for the rendezvous protocol.
//!
//! The rendezvous client only needs a status code, the `Pragma` header and
//! the body text from each exchange, so the transport boundary is kept that
//! small. `HyperTransport` is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use url::Url;

use crate::error::TransportError;

/// One request to the rendezvous server.
#[derive(Clone, Debug)]
pub struct SignalRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<String>,
    pub authorization: Option<String>,
    pub timeout: Duration,
}

impl SignalRequest {
    pub fn get(url: Url, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            url,
            body: None,
            authorization: None,
            timeout,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_authorization(mut self, authorization: Option<String>) -> Self {
        self.authorization = authorization;
        self
    }

    /// Request path without the query string (`/sign_in`, `/wait`, ...).
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// First value of a query parameter.
    pub fn query(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

/// Response from the rendezvous server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalResponse {
    pub status: u16,
    pub pragma: Option<String>,
    pub body: String,
}

impl SignalResponse {
    pub fn new(status: u16, pragma: Option<&str>, body: impl Into<String>) -> Self {
        Self {
            status,
            pragma: pragma.map(str::to_string),
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Peer id carried in the `Pragma` header.
    pub fn pragma_id(&self) -> Option<i64> {
        self.pragma.as_deref().and_then(parse_leading_int)
    }
}

/// Parse the first run of digits, the way the server formats `Pragma`.
fn parse_leading_int(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if let Ok(id) = trimmed.parse::<i64>() {
        return Some(id);
    }
    let digits: String = trimmed
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Executes rendezvous requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: SignalRequest) -> Result<SignalResponse, TransportError>;
}

/// hyper-based transport with rustls for `https://` servers.
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HyperTransport {
    pub fn new() -> Self {
        // Create HTTP client with webpki roots for TLS
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(https);

        Self { client }
    }

    async fn send(&self, request: SignalRequest) -> Result<SignalResponse, TransportError> {
        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.url.as_str());

        if let Some(ref auth) = request.authorization {
            builder = builder.header("Authorization", auth.as_str());
        }

        let body = match request.body {
            Some(text) => {
                builder = builder.header("Content-Type", "text/plain");
                Full::new(Bytes::from(text))
            }
            None => Full::new(Bytes::new()),
        };

        let http_request = builder
            .body(body)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .request(http_request)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let pragma = response
            .headers()
            .get("Pragma")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body_bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?
            .to_bytes();

        Ok(SignalResponse {
            status,
            pragma,
            body: String::from_utf8_lossy(&body_bytes).to_string(),
        })
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for HyperTransport {
    async fn execute(&self, request: SignalRequest) -> Result<SignalResponse, TransportError> {
        let timeout = request.timeout;
        match tokio::time::timeout(timeout, self.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport used by the rendezvous and end-to-end tests.

    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::{mpsc, Mutex as AsyncMutex};

    use super::*;

    /// Answers `/wait` from a queue the test feeds, everything else from a
    /// per-path script (falling back to `200 OK`). Every request is recorded.
    pub struct ScriptedTransport {
        requests: Mutex<Vec<SignalRequest>>,
        scripted: Mutex<Vec<(String, VecDeque<Result<SignalResponse, TransportError>>)>>,
        wait_rx: AsyncMutex<mpsc::UnboundedReceiver<Result<SignalResponse, TransportError>>>,
        wait_tx: mpsc::UnboundedSender<Result<SignalResponse, TransportError>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Arc<Self> {
            let (wait_tx, wait_rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                scripted: Mutex::new(Vec::new()),
                wait_rx: AsyncMutex::new(wait_rx),
                wait_tx,
            })
        }

        /// Queue a response for the next request to `path`.
        pub fn script(&self, path: &str, response: Result<SignalResponse, TransportError>) {
            let mut scripted = self.scripted.lock();
            match scripted.iter_mut().find(|(p, _)| p == path) {
                Some((_, queue)) => queue.push_back(response),
                None => scripted.push((path.to_string(), VecDeque::from([response]))),
            }
        }

        /// Script a successful sign-in.
        pub fn script_sign_in(&self, self_id: i64, roster: &str) {
            self.script(
                "/sign_in",
                Ok(SignalResponse::new(200, Some(&self_id.to_string()), roster)),
            );
        }

        /// Release one pending (or the next) `/wait` request.
        pub fn push_wait(&self, response: Result<SignalResponse, TransportError>) {
            let _ = self.wait_tx.send(response);
        }

        pub fn requests(&self) -> Vec<SignalRequest> {
            self.requests.lock().clone()
        }

        pub fn requests_to(&self, path: &str) -> Vec<SignalRequest> {
            self.requests()
                .into_iter()
                .filter(|r| r.path() == path)
                .collect()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, request: SignalRequest) -> Result<SignalResponse, TransportError> {
            let path = request.path().to_string();
            self.requests.lock().push(request);

            if path == "/wait" {
                let mut rx = self.wait_rx.lock().await;
                return match rx.recv().await {
                    Some(response) => response,
                    None => Err(TransportError::Http("script finished".to_string())),
                };
            }

            let next = {
                let mut scripted = self.scripted.lock();
                scripted
                    .iter_mut()
                    .find(|(p, _)| *p == path)
                    .and_then(|(_, queue)| queue.pop_front())
            };
            next.unwrap_or_else(|| Ok(SignalResponse::new(200, None, "")))
        }
    }
}
