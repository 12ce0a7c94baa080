use thiserror::Error;

/// Taxonomy of everything that can go wrong while serving one exchange.
///
/// Every fallible path in the proxy returns into this enum; [`ProxyError::response`]
/// is the single place that maps a variant onto a status line and body.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("upstream sent invalid HTTP: {0}")]
    UpstreamProtocol(String),

    #[error("cache entry corrupted: {0}")]
    CacheCorruption(String),

    #[error("TLS interception failed: {0}")]
    TlsInterceptionFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Status code this error maps to when no response bytes have been sent yet.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::BadRequest(_) => 400,
            ProxyError::UpstreamUnreachable(_) | ProxyError::UpstreamProtocol(_) => 502,
            ProxyError::UpstreamTimeout => 504,
            ProxyError::TlsInterceptionFailure(_) => 500,
            ProxyError::CacheCorruption(_) | ProxyError::Internal(_) => 500,
        }
    }

    fn reason_phrase(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "Bad Request",
            ProxyError::UpstreamUnreachable(_) | ProxyError::UpstreamProtocol(_) => "Bad Gateway",
            ProxyError::UpstreamTimeout => "Gateway Timeout",
            ProxyError::TlsInterceptionFailure(_) => "Connection Error",
            ProxyError::CacheCorruption(_) | ProxyError::Internal(_) => "Internal Server Error",
        }
    }

    /// Render this error as a complete, close-terminated HTTP/1.1 response.
    ///
    /// `CacheCorruption` is never meant to reach here; the store repairs itself
    /// silently and callers fall back to a normal miss. It is still mapped so a
    /// stray propagation does not panic.
    pub fn to_wire_response(&self) -> Vec<u8> {
        let body = match self {
            ProxyError::BadRequest(msg) => msg.clone(),
            other => other.to_string(),
        };
        let status = self.status_code();
        let reason = self.reason_phrase();
        format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
            status = status,
            reason = reason,
            len = body.len(),
            body = body,
        )
        .into_bytes()
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
