use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use futures_util::StreamExt;
use reqwest::{Body, ClientBuilder, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::error::{ClientError, Result};
use super::realtime::EventSubscriber;
use super::{Client, EventStream, UploadSource};
use crate::file::{FileMetadata, GbFile};

#[derive(Debug, Serialize)]
struct PathBody<'a> {
    path: &'a str,
}

#[derive(Debug, Serialize)]
struct MoveBody<'a> {
    from: &'a str,
    to: &'a str,
    copy: bool,
}

#[derive(Debug, serde::Deserialize)]
struct ErrorResponse {
    message: String,
}

/// Builder for [`HttpClient`]
pub struct HttpClientBuilder {
    base_url: String,
    client_id: String,
    token: Option<String>,
    timeout: Duration,
    user_agent: String,
}

impl HttpClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
            token: None,
            timeout: Duration::from_secs(30),
            user_agent: concat!("gbsync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> Result<HttpClient> {
        url::Url::parse(&self.base_url)?;

        let http = ClientBuilder::new()
            .timeout(self.timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(self.user_agent)
            .build()?;

        info!(base_url = %self.base_url, client_id = %self.client_id, "Storage HTTP client created");
        Ok(HttpClient {
            http,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            client_id: self.client_id,
            token: self.token,
        })
    }
}

/// Remote storage reached over HTTP
pub struct HttpClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    token: Option<String>,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        HttpClientBuilder::new(base_url).build()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("X-Client-Id", &self.client_id);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn wire_path(file: &GbFile) -> Result<String> {
        if file.path_segments().is_none() {
            return Err(ClientError::InvalidPath(format!(
                "{} has no resolved path",
                file.display_path()
            )));
        }
        Ok(file.display_path())
    }

    /// Send the request built by `build`, retrying transient failures
    async fn send<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> RequestBuilder,
    {
        self.retry_operation(|| {
            let request = self.authorize(build());
            async move { Self::check_status(request.send().await?).await }
        })
        .await
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(response)
        } else {
            Err(Self::parse_error_response(response).await)
        }
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(response.url().path().to_string()));
        }
        Ok(response.json().await?)
    }

    async fn parse_error_response(response: reqwest::Response) -> ClientError {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&error_text)
            .map(|error| error.message)
            .unwrap_or(error_text);

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Authentication(message),
            StatusCode::CONFLICT => ClientError::AlreadyExists(message),
            StatusCode::BAD_REQUEST => ClientError::InvalidPath(message),
            status => ClientError::Server {
                status: status.as_u16(),
                message,
            },
        }
    }

    async fn retry_operation<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        retry(backoff, || {
            let attempt = operation();
            async move {
                match attempt.await {
                    Ok(result) => Ok(result),
                    Err(error) if error.is_retryable() => {
                        warn!("Retryable storage error: {}", error);
                        Err(backoff::Error::transient(error))
                    }
                    Err(error) => {
                        debug!("Non-retryable storage error: {}", error);
                        Err(backoff::Error::permanent(error))
                    }
                }
            }
        })
        .await
    }
}

#[async_trait]
impl Client for HttpClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn get_info(&self, file: &GbFile) -> Result<Option<FileMetadata>> {
        let path = Self::wire_path(file)?;
        let response = self
            .send(|| self.http.get(self.url("/api/files/info")).query(&[("path", &path)]))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    async fn get_file(
        &self,
        file: &GbFile,
        destination: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let path = Self::wire_path(file)?;
        let response = self
            .send(|| self.http.get(self.url("/api/files/content")).query(&[("path", &path)]))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(path));
        }

        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            destination.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        destination.flush().await?;
        Ok(written)
    }

    async fn upload_file(&self, file: &GbFile, source: &dyn UploadSource) -> Result<FileMetadata> {
        let path = Self::wire_path(file)?;
        let last_update = file.last_update_time.timestamp_millis().to_string();

        // Each attempt reopens the source and streams it from the start
        let response = self
            .retry_operation(|| {
                let path = &path;
                let last_update = &last_update;
                async move {
                    let reader = source.open().await?;
                    let request = self.authorize(
                        self.http
                            .put(self.url("/api/files/content"))
                            .query(&[("path", path), ("lastUpdate", last_update)])
                            .body(Body::wrap_stream(ReaderStream::new(reader))),
                    );
                    Self::check_status(request.send().await?).await
                }
            })
            .await?;
        Self::handle_response(response).await
    }

    async fn create_directory(&self, file: &GbFile) -> Result<FileMetadata> {
        let path = Self::wire_path(file)?;
        let response = self
            .send(|| {
                self.http
                    .post(self.url("/api/files/directory"))
                    .json(&PathBody { path: &path })
            })
            .await?;
        Self::handle_response(response).await
    }

    async fn remove_file(&self, file: &GbFile) -> Result<()> {
        let path = Self::wire_path(file)?;
        let response = self
            .send(|| self.http.delete(self.url("/api/files")).query(&[("path", &path)]))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(path = %path, "Remove of unknown storage file ignored");
        }
        Ok(())
    }

    async fn move_file(
        &self,
        source: &GbFile,
        destination: &GbFile,
        copy: bool,
    ) -> Result<FileMetadata> {
        let from = Self::wire_path(source)?;
        let to = Self::wire_path(destination)?;
        let response = self
            .send(|| {
                self.http.post(self.url("/api/files/move")).json(&MoveBody {
                    from: &from,
                    to: &to,
                    copy,
                })
            })
            .await?;
        Self::handle_response(response).await
    }

    async fn subscribe(&self, after: Option<u64>) -> Result<EventStream> {
        let subscriber =
            EventSubscriber::new(&self.base_url, &self.client_id).with_token(self.token.clone());
        Ok(subscriber.spawn(after))
    }
}
