//! The client seam shared by SDK callers, the adapter, and the physical sender

use crate::error::{Result, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use cloudshim_config::TransportSettings;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// One physical request. Rebuilt between attempts when the endpoint or the
/// bearer changes.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub method: Method,
    pub base_url: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutgoingRequest {
    pub fn new(method: Method, base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            base_url: base_url.into(),
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// POST with a JSON body and `content-type: application/json`
    pub fn post_json(
        base_url: impl Into<String>,
        path: impl Into<String>,
        body: &serde_json::Value,
    ) -> Result<Self> {
        let body = serde_json::to_vec(body)?;
        Ok(Self::new(Method::POST, base_url, path)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(body))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Base URL joined with the path, without the query string
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.path)
    }
}

pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(ByteStream),
}

impl ResponseBody {
    pub fn into_stream(self) -> ByteStream {
        match self {
            Self::Buffered(bytes) if bytes.is_empty() => Box::pin(stream::empty()),
            Self::Buffered(bytes) => Box::pin(stream::once(async move { Ok(bytes) })),
            Self::Streaming(stream) => stream,
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            Self::Streaming(_) => write!(f, "Streaming"),
        }
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
    /// Set when draining the body failed; every later read fails too
    read_error: Option<String>,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body,
            read_error: None,
        }
    }

    pub fn buffered(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self::new(status, headers, ResponseBody::Buffered(body.into()))
    }

    pub fn streaming(status: StatusCode, headers: HeaderMap, stream: ByteStream) -> Self {
        Self::new(status, headers, ResponseBody::Streaming(stream))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Streaming(_))
    }

    /// Buffer the whole body. Repeated calls return the same bytes, or the
    /// same failure once the body could not be drained.
    pub async fn read(&mut self) -> Result<Bytes> {
        if let Some(message) = &self.read_error {
            return Err(TransportError::Stream(message.clone()));
        }
        if let ResponseBody::Buffered(bytes) = &self.body {
            return Ok(bytes.clone());
        }

        let body = std::mem::replace(&mut self.body, ResponseBody::Buffered(Bytes::new()));
        let mut stream = body.into_stream();
        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(e) => {
                    self.read_error = Some(format!("response body read failed: {}", e));
                    return Err(e);
                }
            }
        }

        let bytes = buffer.freeze();
        self.body = ResponseBody::Buffered(bytes.clone());
        Ok(bytes)
    }

    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.read().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.read().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The body if it has already been buffered
    pub fn content(&self) -> Option<&Bytes> {
        if self.read_error.is_some() {
            return None;
        }
        match &self.body {
            ResponseBody::Buffered(bytes) => Some(bytes),
            ResponseBody::Streaming(_) => None,
        }
    }

    pub fn into_stream(self) -> ByteStream {
        self.body.into_stream()
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, ResponseBody) {
        (self.status, self.headers, self.body)
    }
}

/// Async HTTP client interface. The adapter consumes one and exposes one.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: OutgoingRequest) -> Result<HttpResponse>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for Arc<T> {
    async fn send(&self, request: OutgoingRequest) -> Result<HttpResponse> {
        (**self).send(request).await
    }
}

/// Physical sends over `reqwest`. Bodies are returned unbuffered.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn from_settings(settings: &TransportSettings) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs));

        if let Some(proxy) = &settings.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| TransportError::Configuration(format!("invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url())
            .headers(request.headers)
            .body(request.body);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from));

        Ok(HttpResponse::streaming(status, headers, Box::pin(stream)))
    }
}
