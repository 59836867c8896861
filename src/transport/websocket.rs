//! WebSocket connector
//!
//! Opens the streaming channel with `tokio-tungstenite`, authenticating with
//! an `Authorization: Bearer` header on the upgrade request. Two pump tasks
//! bridge the socket to the [`Link`] channels; when either side ends, the
//! inbound channel closes and the connection reports the loss.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::error::{AgrichatError, AuthError, Result, TransportError};
use crate::transport::{Connector, Link};

/// [`Connector`] for `ws://` and `wss://` endpoints.
///
/// # Examples
///
/// ```
/// use agrichat::transport::WebSocketConnector;
///
/// let connector = WebSocketConnector::new("wss://assistant.example.org/chat").unwrap();
/// assert_eq!(connector.url().scheme(), "wss");
/// ```
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: url::Url,
}

impl WebSocketConnector {
    /// Create a connector for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`AgrichatError::Config`] if `url` is not a `ws`/`wss` URL.
    pub fn new(url: &str) -> Result<Self> {
        let url = url::Url::parse(url)
            .map_err(|e| AgrichatError::Config(format!("invalid stream URL '{}': {}", url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(AgrichatError::Config(format!(
                "stream URL must use ws or wss, got '{}'",
                url.scheme()
            ))
            .into());
        }
        Ok(Self { url })
    }

    /// The endpoint this connector dials.
    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

/// A refused upgrade (401/403) means the token is no good.
fn handshake_error(e: WsError) -> anyhow::Error {
    let kind = match &e {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            AgrichatError::Auth(AuthError::SessionExpired)
        }
        _ => AgrichatError::Transport(TransportError::ConnectionLost),
    };
    anyhow::Error::from(kind).context(format!("websocket connect failed: {}", e))
}

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, token: &str) -> Result<Link> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| AgrichatError::Config(format!("invalid stream request: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| AgrichatError::Config("access token is not a valid header".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(handshake_error)?;
        info!(host = self.url.host_str().unwrap_or("-"), "WebSocket established");

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<String>();

        // Writer: ends when the Link's sender is dropped or the socket fails.
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            debug!("WebSocket writer finished");
        });

        // Reader: dropping `inbound_tx` signals the loss to the supervisor.
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        info!("Server closed the stream: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("WebSocket reader finished");
        });

        Ok(Link { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_http_scheme() {
        assert!(WebSocketConnector::new("http://localhost:3000/chat").is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(WebSocketConnector::new("not a url").is_err());
    }

    #[test]
    fn test_refused_upgrade_is_token_rejection() {
        let response = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .unwrap();
        let error = handshake_error(WsError::Http(response));
        assert!(matches!(
            error.downcast_ref::<AgrichatError>(),
            Some(AgrichatError::Auth(AuthError::SessionExpired))
        ));

        let error = handshake_error(WsError::ConnectionClosed);
        assert!(matches!(
            error.downcast_ref::<AgrichatError>(),
            Some(AgrichatError::Transport(TransportError::ConnectionLost))
        ));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:9/chat").unwrap();
        assert!(connector.connect("tok").await.is_err());
    }
}
