use indexmap::IndexMap;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, ProxyResult};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// A parsed HTTP/1.1 request head. Bodies are handled separately by
/// [`read_body`] once the caller knows the framing.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version_minor: u8,
    pub headers: IndexMap<String, String>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed HTTP/1.1 response head.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: IndexMap<String, String>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Body framing as determined by `Content-Length` / `Transfer-Encoding`.
#[derive(Debug, Clone, Copy)]
pub enum Framing {
    ContentLength(usize),
    Chunked,
    None,
}

fn framing_of(headers: &IndexMap<String, String>) -> ProxyResult<Framing> {
    let has_cl = headers.keys().any(|k| k.eq_ignore_ascii_case("content-length"));
    let has_te = headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.eq_ignore_ascii_case("chunked"));

    if has_cl && has_te {
        return Err(ProxyError::BadRequest(
            "both Content-Length and chunked Transfer-Encoding present".into(),
        ));
    }
    if has_te {
        return Ok(Framing::Chunked);
    }
    if let Some((_, v)) = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("content-length")) {
        let len = v
            .trim()
            .parse::<usize>()
            .map_err(|_| ProxyError::BadRequest(format!("invalid Content-Length: {v}")))?;
        return Ok(Framing::ContentLength(len));
    }
    Ok(Framing::None)
}

/// Read from `reader` into `buf` (appending) until a full header block
/// (terminated by `\r\n\r\n`) is present, tolerating arrival split across
/// multiple reads. Returns the number of bytes that belong to the head.
async fn read_head<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> ProxyResult<usize> {
    loop {
        if let Some(pos) = find_head_end(buf) {
            return Ok(pos);
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::BadRequest("request head too large".into()));
        }
        let mut chunk = [0u8; 4096];
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| ProxyError::BadRequest(format!("reading request head: {e}")))?;
        if n == 0 {
            return Err(ProxyError::BadRequest("connection closed before head completed".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Read and parse a request head, consuming exactly the head bytes from
/// `reader` into `buf` (any bytes beyond the head remain in `buf` for the
/// caller to treat as the start of the body).
pub async fn read_request_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> ProxyResult<RequestHead> {
    let head_len = read_head(reader, buf).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req
        .parse(&buf[..head_len])
        .map_err(|e| ProxyError::BadRequest(format!("malformed request: {e}")))?;
    if status.is_partial() {
        return Err(ProxyError::BadRequest("incomplete request head".into()));
    }

    let method = req
        .method
        .ok_or_else(|| ProxyError::BadRequest("missing method".into()))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| ProxyError::BadRequest("missing request target".into()))?
        .to_string();
    let version_minor = req.version.unwrap_or(1);

    let mut headers = IndexMap::new();
    for h in req.headers.iter() {
        headers.insert(h.name.to_string(), String::from_utf8_lossy(h.value).into_owned());
    }

    buf.drain(..head_len);

    Ok(RequestHead {
        method,
        target,
        version_minor,
        headers,
    })
}

/// Same as [`read_request_head`] but for a response status line.
pub async fn read_response_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> ProxyResult<ResponseHead> {
    let head_len = read_head(reader, buf).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut header_storage);
    let status = resp
        .parse(&buf[..head_len])
        .map_err(|e| ProxyError::UpstreamProtocol(format!("malformed response: {e}")))?;
    if status.is_partial() {
        return Err(ProxyError::UpstreamProtocol("incomplete response head".into()));
    }

    let code = resp
        .code
        .ok_or_else(|| ProxyError::UpstreamProtocol("missing status code".into()))?;
    let reason = resp.reason.unwrap_or("").to_string();

    let mut headers = IndexMap::new();
    for h in resp.headers.iter() {
        headers.insert(h.name.to_string(), String::from_utf8_lossy(h.value).into_owned());
    }

    buf.drain(..head_len);

    Ok(ResponseHead {
        status: code,
        reason,
        headers,
    })
}

/// Read a request body of known framing, given bytes already buffered from
/// the head read (`leftover`) plus whatever remains to be read from
/// `reader`. A request with neither `Content-Length` nor chunked framing
/// has no body.
pub async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    leftover: Vec<u8>,
    headers: &IndexMap<String, String>,
) -> ProxyResult<Vec<u8>> {
    match framing_of(headers)? {
        Framing::None => Ok(Vec::new()),
        Framing::ContentLength(len) => {
            read_content_length_body(reader, leftover, len).await
        }
        Framing::Chunked => read_chunked_body(reader, leftover).await,
    }
}

/// Read a response body of known framing. Unlike a request, a response with
/// neither `Content-Length` nor chunked framing is delimited by the
/// connection closing, so the body is read to EOF.
pub async fn read_response_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    leftover: Vec<u8>,
    headers: &IndexMap<String, String>,
) -> ProxyResult<Vec<u8>> {
    match framing_of(headers)? {
        Framing::None => read_to_eof(reader, leftover).await,
        Framing::ContentLength(len) => {
            read_content_length_body(reader, leftover, len).await
        }
        Framing::Chunked => read_chunked_body(reader, leftover).await,
    }
}

async fn read_content_length_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    leftover: Vec<u8>,
    len: usize,
) -> ProxyResult<Vec<u8>> {
    let mut body = leftover;
    while body.len() < len {
        let mut chunk = vec![0u8; (len - body.len()).min(64 * 1024)];
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| ProxyError::UpstreamProtocol(format!("reading body: {e}")))?;
        if n == 0 {
            return Err(ProxyError::UpstreamProtocol("body truncated".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(len);
    Ok(body)
}

/// Read until the peer closes the connection, returning everything read
/// (including `leftover`, bytes already buffered from the head read).
async fn read_to_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    leftover: Vec<u8>,
) -> ProxyResult<Vec<u8>> {
    let mut body = leftover;
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| ProxyError::UpstreamProtocol(format!("reading body: {e}")))?;
        if n == 0 {
            return Ok(body);
        }
        body.extend_from_slice(&chunk[..n]);
    }
}

async fn read_chunked_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    mut buf: Vec<u8>,
) -> ProxyResult<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        while find_line_end(&buf).is_none() {
            fill_more(reader, &mut buf).await?;
        }
        let line_end = find_line_end(&buf).unwrap();
        let size_line = String::from_utf8_lossy(&buf[..line_end]).trim().to_string();
        let size_str = size_line.split(';').next().unwrap_or("");
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::UpstreamProtocol(format!("invalid chunk size: {size_line}")))?;
        buf.drain(..line_end + 2);

        if size == 0 {
            while buf.len() < 2 {
                fill_more(reader, &mut buf).await?;
            }
            buf.drain(..2);
            break;
        }

        while buf.len() < size + 2 {
            fill_more(reader, &mut buf).await?;
        }
        body.extend_from_slice(&buf[..size]);
        buf.drain(..size + 2);
    }
    Ok(body)
}

fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

async fn fill_more<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> ProxyResult<()> {
    let mut chunk = [0u8; 4096];
    let n = reader
        .read(&mut chunk)
        .await
        .map_err(|e| ProxyError::UpstreamProtocol(format!("reading chunked body: {e}")))?;
    if n == 0 {
        return Err(ProxyError::UpstreamProtocol("connection closed mid-chunk".into()));
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn parses_a_request_split_across_reads() {
        let mut buf = Vec::new();
        let mut reader = Cursor::new(b"GET /foo HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec());
        let head = read_request_head(&mut reader, &mut buf).await.unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/foo");
        assert_eq!(head.header("host"), Some("example.com"));
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let mut buf = Vec::new();
        let mut reader = Cursor::new(
            b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello".to_vec(),
        );
        let head = read_request_head(&mut reader, &mut buf).await.unwrap();
        let body = read_body(&mut reader, buf, &head.headers).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn reads_chunked_body() {
        let mut buf = Vec::new();
        let mut reader = Cursor::new(
            b"POST /x HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
                .to_vec(),
        );
        let head = read_request_head(&mut reader, &mut buf).await.unwrap();
        let body = read_body(&mut reader, buf, &head.headers).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn rejects_conflicting_framing_headers() {
        let mut buf = Vec::new();
        let mut reader = Cursor::new(
            b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\nhello"
                .to_vec(),
        );
        let head = read_request_head(&mut reader, &mut buf).await.unwrap();
        assert!(read_body(&mut reader, buf, &head.headers).await.is_err());
    }

    #[tokio::test]
    async fn request_with_no_framing_header_has_no_body() {
        let mut buf = Vec::new();
        let mut reader = Cursor::new(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        let head = read_request_head(&mut reader, &mut buf).await.unwrap();
        let body = read_body(&mut reader, buf, &head.headers).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn response_with_no_framing_header_is_read_to_eof() {
        let mut buf = Vec::new();
        let mut reader = Cursor::new(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nclose-delimited body".to_vec(),
        );
        let head = read_response_head(&mut reader, &mut buf).await.unwrap();
        let body = read_response_body(&mut reader, buf, &head.headers)
            .await
            .unwrap();
        assert_eq!(body, b"close-delimited body");
    }
}
