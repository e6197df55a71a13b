//! Keep-alive HTTP/1.1 session. Hand-rolled request/response framing --
//! there is no HTTP client in the ambient stack, and a raw socket plus a
//! small status-line/header reader is all the query-like services need.
//! Response bodies stream out through an async channel of `Bytes` chunks
//! so the row parser can consume them without the whole body landing in
//! memory at once.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{Error, ErrorKind, Result};

pub struct HttpRequest {
    pub method: &'static str,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn post(path: impl Into<String>, body: Bytes) -> Self {
        HttpRequest {
            method: "POST",
            path: path.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        HttpRequest {
            method: "GET",
            path: path.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

pub struct HttpResponseHead {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

/// A live HTTP/1.1 connection. Not multiplexed -- the owning pool limits
/// concurrent use to one in-flight request per session the same way the
/// KV session's pool limits connections per node.
pub struct HttpSession {
    remote: SocketAddr,
    stream: BufReader<TcpStream>,
}

impl HttpSession {
    pub async fn connect(remote: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(remote).await.map_err(|e| {
            Error::new(ErrorKind::ServiceNotAvailable, e.to_string())
                .with_context(crate::error::ErrorContext::new().with_endpoint(remote.to_string()))
        })?;
        stream.set_nodelay(true).ok();
        Ok(HttpSession {
            remote,
            stream: BufReader::new(stream),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Sends `request` and streams the response body through `tx` as it
    /// arrives. Returns the parsed status/headers once available; the
    /// body continues streaming after this call returns.
    pub async fn send(&mut self, request: HttpRequest, tx: mpsc::Sender<Result<Bytes>>) -> Result<HttpResponseHead> {
        let host = self.remote.ip().to_string();
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\nContent-Length: {}\r\n",
            request.method,
            request.path,
            host,
            request.body.len()
        );
        for (name, value) in &request.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");

        self.stream
            .get_mut()
            .write_all(head.as_bytes())
            .await
            .map_err(Error::from)?;
        if !request.body.is_empty() {
            self.stream
                .get_mut()
                .write_all(&request.body)
                .await
                .map_err(Error::from)?;
        }

        let response_head = self.read_head().await?;
        let content_length = response_head
            .headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok());
        let chunked = response_head
            .headers
            .get("transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);

        let remote = self.remote;
        let stream = &mut self.stream;
        if chunked {
            stream_chunked_body(stream, tx, remote).await?;
        } else if let Some(len) = content_length {
            stream_fixed_body(stream, len, tx, remote).await?;
        } else {
            let _ = tx.send(Ok(Bytes::new())).await;
        }

        Ok(response_head)
    }

    async fn read_head(&mut self) -> Result<HttpResponseHead> {
        let mut line = String::new();
        read_line(&mut self.stream, &mut line).await?;
        let status = line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| Error::new(ErrorKind::DecodingFailure, "malformed HTTP status line"))?;

        let mut headers = HashMap::new();
        loop {
            let mut header_line = String::new();
            read_line(&mut self.stream, &mut header_line).await?;
            if header_line.is_empty() {
                break;
            }
            if let Some((name, value)) = header_line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
        Ok(HttpResponseHead { status, headers })
    }
}

async fn read_line<R: AsyncReadExt + Unpin>(reader: &mut R, out: &mut String) -> Result<()> {
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await.map_err(Error::from)?;
        if n == 0 {
            return Err(Error::new(ErrorKind::DecodingFailure, "connection closed mid-header"));
        }
        if byte[0] == b'\n' {
            if out.ends_with('\r') {
                out.pop();
            }
            return Ok(());
        }
        out.push(byte[0] as char);
    }
}

async fn stream_fixed_body<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    len: usize,
    tx: mpsc::Sender<Result<Bytes>>,
    remote: SocketAddr,
) -> Result<()> {
    let mut remaining = len;
    let mut buf = BytesMut::with_capacity(8192);
    while remaining > 0 {
        buf.resize(remaining.min(8192), 0);
        let n = reader.read(&mut buf).await.map_err(Error::from)?;
        if n == 0 {
            let err = Error::new(ErrorKind::DecodingFailure, "body ended before Content-Length")
                .with_context(crate::error::ErrorContext::new().with_endpoint(remote.to_string()));
            let _ = tx.send(Err(err.clone())).await;
            return Err(err);
        }
        remaining -= n;
        let _ = tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await;
    }
    Ok(())
}

async fn stream_chunked_body<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    tx: mpsc::Sender<Result<Bytes>>,
    remote: SocketAddr,
) -> Result<()> {
    loop {
        let mut size_line = String::new();
        read_line(reader, &mut size_line).await?;
        let size = usize::from_str_radix(size_line.trim(), 16)
            .map_err(|_| Error::new(ErrorKind::DecodingFailure, "malformed chunk size"))?;
        if size == 0 {
            // trailing CRLF after the terminating 0-size chunk
            let mut trailer = String::new();
            read_line(reader, &mut trailer).await?;
            return Ok(());
        }
        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await.map_err(|e| {
            Error::new(ErrorKind::DecodingFailure, e.to_string())
                .with_context(crate::error::ErrorContext::new().with_endpoint(remote.to_string()))
        })?;
        let _ = tx.send(Ok(Bytes::from(chunk))).await;
        let mut crlf = String::new();
        read_line(reader, &mut crlf).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reads_fixed_length_body_in_chunks_through_the_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let mut session = HttpSession::connect(addr).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let head = session.send(HttpRequest::get("/"), tx).await.unwrap();
        assert_eq!(head.status, 200);

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello");
    }

    #[tokio::test]
    async fn reads_chunked_body_through_the_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            sock.write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        });

        let mut session = HttpSession::connect(addr).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        session.send(HttpRequest::get("/"), tx).await.unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hi");
    }
}
