use bytes::Bytes;
use cyder_tools::log::{debug, error};
use flate2::read::GzDecoder;
use futures::{Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, HeaderMap, HeaderValue};
use serde_json::Value;
use std::io::Read;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::controller::BaseError;

pub type ChatByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

const STREAM_CHANNEL_CAPACITY: usize = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub proxy: Option<String>,
    pub discovery_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            proxy: None,
            discovery_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(600),
        }
    }
}

/// HTTP client bound to one backend base URL and credential.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    discovery_timeout: Duration,
    request_timeout: Duration,
}

fn transport_error(context: &str, e: reqwest::Error) -> BaseError {
    error!("{}: {}", context, e);
    BaseError::Inference {
        status: e.status().map(|s| s.as_u16()),
        body: format!("{}: {}", context, e),
    }
}

impl ChatClient {
    pub fn new(base_url: &str, api_key: Option<&str>, options: &ClientOptions) -> Result<Self, BaseError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.map(str::trim).filter(|k| !k.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|_| BaseError::Configuration(Some("api key contains invalid header characters".to_string())))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(proxy_url) = options.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
                error!("Failed to create proxy from '{}': {}", proxy_url, e);
                BaseError::Configuration(Some(format!("invalid proxy '{}': {}", proxy_url, e)))
            })?;
            builder = builder.proxy(proxy);
        }
        let http = builder.build().map_err(|e| {
            error!("Failed to build reqwest client: {}", e);
            BaseError::InternalServerError(Some(format!("failed to build http client: {}", e)))
        })?;

        Ok(ChatClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            discovery_timeout: options.discovery_timeout,
            request_timeout: options.request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Calls the discovery endpoint and returns the raw entries of its `data` array.
    pub async fn list_models(&self) -> Result<Vec<Value>, BaseError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(self.discovery_timeout)
            .send()
            .await
            .map_err(|e| transport_error("model discovery failed", e))?;
        let body = Self::read_success_body(response).await?;

        let mut payload: Value = serde_json::from_slice(&body).map_err(|e| BaseError::Inference {
            status: None,
            body: format!("model discovery returned invalid json: {}", e),
        })?;
        match payload.get_mut("data").map(Value::take) {
            Some(Value::Array(entries)) => Ok(entries),
            _ => Err(BaseError::Inference {
                status: None,
                body: "model discovery response has no data array".to_string(),
            }),
        }
    }

    /// Buffered completion. The backend body is returned whole.
    pub async fn create_completion(&self, request: &Value) -> Result<Value, BaseError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error("completion request failed", e))?;
        let body = Self::read_success_body(response).await?;
        serde_json::from_slice(&body).map_err(|e| BaseError::Inference {
            status: None,
            body: format!("backend returned invalid json: {}", e),
        })
    }

    /// Streaming completion. Bytes are yielded exactly as the backend sent them.
    ///
    /// A forwarder task owns the upstream response. Dropping the returned stream closes
    /// the channel, the forwarder notices and drops the response, which closes the
    /// backend connection.
    pub async fn create_completion_stream(&self, request: &Value) -> Result<ChatByteStream, BaseError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error("streaming request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = Self::read_body(response).await.unwrap_or_default();
            return Err(BaseError::Inference {
                status: Some(status.as_u16()),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let (tx, mut rx) = mpsc::channel::<Result<Bytes, reqwest::Error>>(STREAM_CHANNEL_CAPACITY);
        let base_url = self.base_url.clone();
        tokio::spawn(async move {
            let mut upstream = response.bytes_stream();
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!("[{}] caller went away, closing backend stream", base_url);
                        break;
                    }
                    chunk = upstream.next() => match chunk {
                        Some(chunk_result) => {
                            if tx.send(chunk_result).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let relayed = async_stream::stream! {
            while let Some(chunk_result) = rx.recv().await {
                match chunk_result {
                    Ok(chunk) => yield Ok(chunk),
                    Err(e) => {
                        error!("backend stream error: {}", e);
                        yield Err(std::io::Error::other(e));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(relayed))
    }

    async fn read_success_body(response: reqwest::Response) -> Result<Bytes, BaseError> {
        let status = response.status();
        let body = Self::read_body(response).await?;
        if !status.is_success() {
            return Err(BaseError::Inference {
                status: Some(status.as_u16()),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }

    /// Reads the whole body, inflating it when the backend gzip-encoded it.
    async fn read_body(response: reqwest::Response) -> Result<Bytes, BaseError> {
        let is_gzip = response
            .headers()
            .get(CONTENT_ENCODING)
            .is_some_and(|value| value.to_str().unwrap_or("").contains("gzip"));
        let body_bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error("failed to read backend response body", e))?;

        if !is_gzip || body_bytes.is_empty() {
            return Ok(body_bytes);
        }
        let mut gz = GzDecoder::new(&body_bytes[..]);
        let mut decompressed = Vec::new();
        match gz.read_to_end(&mut decompressed) {
            Ok(_) => Ok(Bytes::from(decompressed)),
            Err(e) => {
                error!("Gzip decoding of backend body failed: {}", e);
                Ok(body_bytes)
            }
        }
    }
}
