//! Connection target construction.
//!
//! Credentials travel in the query string of the WebSocket URL:
//!
//! ```text
//! wss://host/path?header=<base64 {"host": .., "Authorization": <id token>}>&payload=<base64 {}>
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use url::Url;

use crate::auth::Credential;
use crate::subscription::protocol::SUB_PROTOCOL;
use crate::subscription::types::{StreamError, StreamResult};

/// Parse an endpoint, rewriting `http(s)` to `ws(s)`.
pub fn parse_endpoint(endpoint: &str) -> StreamResult<Url> {
    let mut url = Url::parse(endpoint).map_err(|e| StreamError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(StreamError::InvalidEndpoint(format!("unsupported scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| StreamError::InvalidEndpoint(format!("cannot use scheme '{scheme}'")))?;
    if url.host_str().is_none() {
        return Err(StreamError::InvalidEndpoint(format!("{endpoint}: missing host")));
    }
    Ok(url)
}

/// Endpoint plus the encoded `header` and `payload` query parameters.
pub fn connection_url(endpoint: &Url, credential: &Credential) -> Url {
    let host = match (endpoint.host_str(), endpoint.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };
    let header = json!({
        "host": host,
        "Authorization": credential.id_token,
    });

    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair("header", &STANDARD.encode(header.to_string()))
        .append_pair("payload", &STANDARD.encode("{}"));
    url
}

/// Handshake request asking for the streaming sub-protocol.
pub fn connection_request(endpoint: &Url, credential: &Credential) -> StreamResult<Request> {
    let url = connection_url(endpoint, credential);
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| StreamError::InvalidEndpoint(e.to_string()))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUB_PROTOCOL));
    Ok(request)
}
