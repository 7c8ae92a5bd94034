//! Change notification channel listener.
//!
//! Keeps a WebSocket open to the server, answers `PING` with `PONG` and turns
//! `SYNC_REQUIRED` / `ITEM_CHANGED` into debounced pulls. Lost connections are
//! retried with capped exponential backoff; every (re)connect also triggers a
//! full cycle, since notifications sent while offline are gone.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::scheduler::SchedulerHandle;
use crate::error::{Error, Result};
use crate::models::GLOBAL_METADATA_KEY;
use crate::protocol::ChannelMessage;
use crate::util::{is_ws_url, normalize_text_option};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Why a connected session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    ClosedByServer,
}

#[derive(Clone)]
pub struct NotificationClient {
    url: String,
    token: String,
    scheduler: SchedulerHandle,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl std::fmt::Debug for NotificationClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("NotificationClient")
            .field("url", &self.url)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// What to do with one incoming frame
fn dispatch(message: &ChannelMessage, scheduler: &SchedulerHandle) -> Option<ChannelMessage> {
    match message {
        ChannelMessage::Ping => Some(ChannelMessage::Pong),
        ChannelMessage::Pong => None,
        ChannelMessage::SyncRequired { entity_type } if entity_type == GLOBAL_METADATA_KEY => {
            scheduler.trigger();
            None
        }
        ChannelMessage::SyncRequired { entity_type }
        | ChannelMessage::ItemChanged { entity_type, .. } => {
            scheduler.request_pull(entity_type);
            None
        }
    }
}

impl NotificationClient {
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        scheduler: SchedulerHandle,
    ) -> Result<Self> {
        let url = normalize_text_option(Some(url.into()))
            .filter(|url| is_ws_url(url))
            .ok_or_else(|| {
                Error::InvalidInput("notification URL must include ws:// or wss://".to_string())
            })?;
        let token = normalize_text_option(Some(token.into()))
            .ok_or_else(|| Error::InvalidInput("API token must not be empty".to_string()))?;
        Ok(Self {
            url,
            token,
            scheduler,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        })
    }

    /// Override the reconnect backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Listen until `shutdown` turns `true`.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = self.initial_backoff;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.session(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::ClosedByServer) => {
                    tracing::info!("Notification channel closed by server");
                    backoff = self.initial_backoff;
                }
                Err(error) => {
                    tracing::warn!(%error, retry_in = ?backoff, "Notification channel unavailable");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
        tracing::debug!("Notification listener stopped");
    }

    async fn session(&self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|error| Error::InvalidInput(format!("notification URL: {error}")))?;
        let header = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|error| Error::InvalidInput(format!("API token: {error}")))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|error| Error::Network(format!("notification channel: {error}")))?;
        tracing::info!(url = %self.url, "Notification channel connected");
        self.scheduler.trigger();

        let (mut write, mut read) = stream.split();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                frame = read.next() => match frame {
                    None | Some(Ok(Message::Close(_))) => return Ok(SessionEnd::ClosedByServer),
                    Some(Err(error)) => return Err(Error::Network(format!("notification channel: {error}"))),
                    Some(Ok(Message::Text(text))) => {
                        let message = match serde_json::from_str::<ChannelMessage>(text.as_str()) {
                            Ok(message) => message,
                            Err(error) => {
                                tracing::debug!(%error, "Ignoring unrecognized notification");
                                continue;
                            }
                        };
                        if let Some(reply) = dispatch(&message, &self.scheduler) {
                            write
                                .send(Message::text(serde_json::to_string(&reply)?))
                                .await
                                .map_err(|error| Error::Network(format!("notification channel: {error}")))?;
                        }
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}
