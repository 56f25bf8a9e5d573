use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::error::{ClientError, Result};
use super::{EventStream, EVENT_CHANNEL_CAPACITY};
use crate::event::SyncEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound of the reconnect delay exponent (2^6 = 64s)
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Pushes storage events from the `/api/events` WebSocket into an
/// [`EventStream`], reconnecting with exponential delay and resuming after
/// the last event delivered.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    base_url: String,
    client_id: String,
    auth_token: Option<String>,
}

impl EventSubscriber {
    pub fn new(base_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: client_id.into(),
            auth_token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// Start the background connection task. The task ends when the returned
    /// stream is dropped.
    pub fn spawn(self, after: Option<u64>) -> EventStream {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut last_heard = after;
            let mut reconnect_attempts: u32 = 0;

            loop {
                match self.establish_connection(last_heard).await {
                    Ok(mut stream) => {
                        info!("Storage event stream connected");
                        reconnect_attempts = 0;

                        loop {
                            tokio::select! {
                                msg = stream.next() => match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        match serde_json::from_str::<SyncEvent>(&text) {
                                            Ok(event) => {
                                                if last_heard.is_some_and(|last| event.id <= last) {
                                                    debug!(event_id = event.id, "Skipping already heard event");
                                                    continue;
                                                }
                                                last_heard = Some(event.id);
                                                if tx.send(event).await.is_err() {
                                                    let _ = stream.close(None).await;
                                                    return;
                                                }
                                            }
                                            Err(e) => warn!("Failed to decode storage event: {}", e),
                                        }
                                    }
                                    Some(Ok(Message::Ping(payload))) => {
                                        if let Err(e) = stream.send(Message::Pong(payload)).await {
                                            warn!("Failed to answer ping: {}", e);
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) | None => {
                                        info!("Storage event stream closed by server");
                                        break;
                                    }
                                    Some(Err(e)) => {
                                        error!("Storage event stream error: {}", e);
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                },
                                _ = tx.closed() => {
                                    debug!("Event stream receiver dropped, closing connection");
                                    let _ = stream.close(None).await;
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        reconnect_attempts = reconnect_attempts.saturating_add(1);
                        warn!(
                            "Failed to connect to storage events (attempt {}): {}",
                            reconnect_attempts, e
                        );
                    }
                }

                let delay = Duration::from_secs(2_u64.pow(reconnect_attempts.min(MAX_BACKOFF_EXPONENT)));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = tx.closed() => return,
                }
            }
        });

        rx
    }

    fn events_url(&self, after: Option<u64>) -> Result<String> {
        let ws_base = self.base_url.replacen("http", "ws", 1);
        let mut params = vec![("client", self.client_id.clone())];
        if let Some(after) = after {
            params.push(("after", after.to_string()));
        }
        let query = serde_urlencoded::to_string(&params)
            .map_err(|e| ClientError::Unknown(format!("Failed to encode query: {}", e)))?;
        Ok(format!("{}/api/events?{}", ws_base.trim_end_matches('/'), query))
    }

    async fn establish_connection(&self, after: Option<u64>) -> Result<WsStream> {
        let url = self.events_url(after)?;
        debug!("Connecting to storage events: {}", url);

        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::WebSocket(format!("Invalid request: {}", e)))?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ClientError::Authentication(e.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (stream, _) = timeout(Duration::from_secs(10), connect_async(request))
            .await
            .map_err(|_| ClientError::WebSocket("Connection timeout".to_string()))?
            .map_err(|e| ClientError::WebSocket(format!("Connection failed: {}", e)))?;

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_url_switches_scheme_and_carries_cursor() {
        let subscriber = EventSubscriber::new("https://storage.example.com/", "laptop");
        let url = subscriber.events_url(Some(42)).unwrap();
        assert_eq!(url, "wss://storage.example.com/api/events?client=laptop&after=42");

        let url = subscriber.events_url(None).unwrap();
        assert!(!url.contains("after"));
    }
}
