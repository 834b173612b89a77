use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration};

use crate::constants::{
    HANDSHAKE_MAX_BYTES, HANDSHAKE_READ_ATTEMPTS, HANDSHAKE_READ_WAIT_MS,
};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad upgrade request: {0}")]
    BadRequest(String),
    #[error("connection closed during handshake")]
    Closed,
}

/// Performs the server side of the opening handshake. The request is read
/// until the header terminator, 8 KiB, or ten ~20 ms read attempts,
/// whichever comes first; a rejected request gets an HTTP 400 before the
/// error is returned. The request path is ignored.
pub async fn accept(stream: &mut TcpStream) -> Result<(), HandshakeError> {
    let request = read_request(stream).await?;
    match validate(&request) {
        Ok(key) => {
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\
                 Server: MazeGameServer/1.0\r\n\r\n",
                accept_key(&key)
            );
            stream.write_all(response.as_bytes()).await?;
            Ok(())
        }
        Err(reason) => {
            let body = "Invalid WebSocket request";
            let response = format!(
                "HTTP/1.1 400 Bad Request\r\n\
                 Content-Type: text/plain\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            Err(HandshakeError::BadRequest(reason))
        }
    }
}

async fn read_request(stream: &mut TcpStream) -> Result<String, HandshakeError> {
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    for attempt in 0..HANDSHAKE_READ_ATTEMPTS {
        match tokio::time::timeout(
            Duration::from_millis(HANDSHAKE_READ_WAIT_MS),
            stream.read(&mut buf),
        )
        .await
        {
            Ok(Ok(0)) => return Err(HandshakeError::Closed),
            Ok(Ok(read)) => {
                request.extend_from_slice(&buf[..read]);
                if request.windows(4).any(|chunk| chunk == b"\r\n\r\n") {
                    break;
                }
                if request.len() > HANDSHAKE_MAX_BYTES {
                    break;
                }
            }
            Ok(Err(error)) => return Err(HandshakeError::Io(error)),
            Err(_elapsed) => {
                if attempt + 1 < HANDSHAKE_READ_ATTEMPTS {
                    sleep(Duration::from_millis(1)).await;
                }
            }
        }
    }
    if request.is_empty() {
        return Err(HandshakeError::BadRequest("empty request".to_string()));
    }
    Ok(String::from_utf8_lossy(&request).into_owned())
}

/// Header checks are case-insensitive; returns the client key.
fn validate(request: &str) -> Result<String, String> {
    if !request.get(..4).map(|s| s.eq_ignore_ascii_case("GET ")).unwrap_or(false) {
        return Err("not a GET request".to_string());
    }
    let lower = request.to_ascii_lowercase();
    if !lower.contains("upgrade: websocket") {
        return Err("missing Upgrade header".to_string());
    }
    let connection_ok = header_value(&lower, "connection")
        .map(|value| value.contains("upgrade"))
        .unwrap_or(false);
    if !connection_ok {
        return Err("Connection header does not request an upgrade".to_string());
    }
    let version_ok = header_value(&lower, "sec-websocket-version")
        .map(|value| value.trim() == "13")
        .unwrap_or(false);
    if !version_ok {
        return Err("unsupported websocket version".to_string());
    }

    // the key is case-sensitive base64, so slice it out of the raw request
    let key_start = lower
        .find("sec-websocket-key:")
        .ok_or_else(|| "missing Sec-WebSocket-Key".to_string())?
        + "sec-websocket-key:".len();
    let key_end = request[key_start..]
        .find("\r\n")
        .map(|offset| key_start + offset)
        .unwrap_or(request.len());
    let key: String = request[key_start..key_end]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if key.is_empty() {
        return Err("empty Sec-WebSocket-Key".to_string());
    }
    Ok(key)
}

fn header_value<'a>(lower_request: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("{name}:");
    let start = lower_request.find(&marker)? + marker.len();
    let end = lower_request[start..]
        .find("\r\n")
        .map(|offset| start + offset)
        .unwrap_or(lower_request.len());
    Some(lower_request[start..end].trim())
}

/// `base64(SHA-1(key || GUID))` per RFC 6455.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> String {
        concat!(
            "GET /game HTTP/1.1\r\n",
            "Host: localhost\r\n",
            "Upgrade: websocket\r\n",
            "Connection: Upgrade\r\n",
            "Sec-WebSocket-Version: 13\r\n",
            "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
            "\r\n"
        )
        .to_string()
    }

    #[test]
    fn valid_request_yields_the_client_key() {
        assert_eq!(
            validate(&sample_request()),
            Ok("dGhlIHNhbXBsZSBub25jZQ==".to_string())
        );
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let request = sample_request()
            .replace("Upgrade: websocket", "upgrade: WebSocket")
            .replace("Connection: Upgrade", "CONNECTION: keep-alive, Upgrade")
            .to_ascii_lowercase()
            .replace("dghlihnhbxbszsbub25jzq==", "dGhlIHNhbXBsZSBub25jZQ==");
        assert!(validate(&request).is_ok());
    }

    #[test]
    fn missing_key_is_rejected() {
        let request = sample_request().replace(
            "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
            "",
        );
        assert!(validate(&request).is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let request = sample_request().replace("Version: 13", "Version: 8");
        assert!(validate(&request).is_err());
        let request = sample_request().replace("Sec-WebSocket-Version: 13\r\n", "");
        assert!(validate(&request).is_err());
    }

    #[test]
    fn post_requests_are_rejected() {
        let request = sample_request().replace("GET /game", "POST /game");
        assert!(validate(&request).is_err());
    }

    #[test]
    fn plain_http_browse_is_rejected() {
        let request = "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        assert!(validate(request).is_err());
    }

    #[test]
    fn accept_key_is_deterministic_base64() {
        let key = accept_key("dGhlIHNhbXBsZSBub25jZQ==");
        // 20 SHA-1 bytes encode to 28 base64 characters with one pad
        assert_eq!(key.len(), 28);
        assert!(key.ends_with('='));
        assert_eq!(key, accept_key("dGhlIHNhbXBsZSBub25jZQ=="));
        assert_ne!(key, accept_key("b3RoZXIga2V5IGhlcmUuLi4="));
    }
}
