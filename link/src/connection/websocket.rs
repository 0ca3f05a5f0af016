//! Low-level WebSocket helpers: URL resolution, dialing, frame codec.

use crate::{
    error::{PvLinkError, Result},
    models::{ClientMessage, ConnectionOptions, FeedEvent, ServerMessage},
    timeouts::PvLinkTimeouts,
};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::error::Error as WsError};

pub(crate) type WebSocketStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// Work out which WebSocket URL the channel should dial.
///
/// An explicit `ws_url` override wins; otherwise the base URL's scheme is
/// mapped `http→ws` / `https→wss` and `ws_path` replaces its path.
pub(crate) fn resolve_ws_url(base_url: &str, options: &ConnectionOptions) -> Result<String> {
    let base = Url::parse(base_url.trim()).map_err(|e| {
        PvLinkError::ConfigurationError(format!("Invalid base_url '{}': {}", base_url, e))
    })?;

    if base.host_str().is_none() {
        return Err(PvLinkError::ConfigurationError("base_url must include a host".to_string()));
    }

    if let Some(url) = options.ws_url.as_deref() {
        let override_parsed = Url::parse(url.trim()).map_err(|e| {
            PvLinkError::ConfigurationError(format!("Invalid ws_url '{}': {}", url, e))
        })?;
        match override_parsed.scheme() {
            "ws" | "wss" => {},
            other => {
                return Err(PvLinkError::ConfigurationError(format!(
                    "ws_url must use ws:// or wss:// (found '{}')",
                    other
                )));
            },
        }
        if base.scheme() == "https" && override_parsed.scheme() == "ws" {
            return Err(PvLinkError::ConfigurationError(
                "Refusing insecure ws:// override when base_url uses https://".to_string(),
            ));
        }
        return Ok(override_parsed.to_string());
    }

    let ws_scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(PvLinkError::ConfigurationError(format!(
                "Unsupported base_url scheme '{}'; expected http(s) or ws(s)",
                other
            )));
        },
    };

    let mut ws_url = base.clone();
    ws_url.set_scheme(ws_scheme).map_err(|_| {
        PvLinkError::ConfigurationError("Failed to set WebSocket URL scheme".to_string())
    })?;
    ws_url.set_fragment(None);
    ws_url.set_query(None);
    let path = if options.ws_path.starts_with('/') {
        options.ws_path.clone()
    } else {
        format!("/{}", options.ws_path)
    };
    ws_url.set_path(&path);

    Ok(ws_url.to_string())
}

/// Dial the live feed, bounded by the configured connection timeout.
pub(crate) async fn dial(url: &str, timeouts: &PvLinkTimeouts) -> Result<WebSocketStream> {
    let attempt = connect_async(url);
    let result = if PvLinkTimeouts::is_no_timeout(timeouts.connection_timeout) {
        attempt.await
    } else {
        match tokio::time::timeout(timeouts.connection_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                return Err(PvLinkError::TimeoutError(format!(
                    "Connection timeout ({:?})",
                    timeouts.connection_timeout
                )));
            },
        }
    };

    match result {
        Ok((stream, _response)) => Ok(stream),
        Err(WsError::Http(response)) => Err(PvLinkError::WebSocketError(format!(
            "WebSocket HTTP error: {}",
            response.status().as_u16()
        ))),
        Err(e) => Err(PvLinkError::WebSocketError(format!("Connection failed: {}", e))),
    }
}

/// Decode one text frame from the feed.
///
/// Unknown `type` values decode to [`FeedEvent::Unknown`]. Value entries that
/// do not decode are skipped on their own; only malformed JSON or a frame
/// without a usable `type` is an error.
pub(crate) fn parse_message(text: &str) -> Result<FeedEvent> {
    serde_json::from_str::<ServerMessage>(text)
        .map(FeedEvent::from)
        .map_err(|e| {
            PvLinkError::SerializationError(format!("Failed to parse feed message: {}", e))
        })
}

/// Serialize an outbound protocol message.
pub(crate) fn encode_message(msg: &ClientMessage) -> Result<String> {
    serde_json::to_string(msg).map_err(|e| {
        PvLinkError::SerializationError(format!("Failed to serialize {:?}: {}", msg, e))
    })
}
