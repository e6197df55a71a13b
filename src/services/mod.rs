//! Query, Analytics, Search, and Views: four HTTP-backed services that all
//! shape their responses the same way (a metadata header, a stream of
//! rows, a metadata trailer) and so all drive the same row parser.

pub mod analytics;
pub mod query;
pub mod search;
pub mod views;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::common::ServiceType;
use crate::error::{Error, ErrorKind, Result};
use crate::http::{HttpConnectionManager, HttpRequest};
use crate::row_stream::{JsonPointer, RowEvent, RowParser};

/// One executed request's row stream plus the metadata collected around it.
pub struct RowResultStream {
    pub header: String,
    rx: mpsc::Receiver<Result<RowEvent>>,
    trailer: Option<String>,
}

impl RowResultStream {
    pub async fn next_row(&mut self) -> Option<Result<String>> {
        loop {
            match self.rx.recv().await? {
                Ok(RowEvent::Row(row)) => return Some(Ok(row)),
                Ok(RowEvent::Trailer(t)) => {
                    self.trailer = Some(t);
                    continue;
                }
                Ok(RowEvent::Header(_)) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    pub fn trailer(&self) -> Option<&str> {
        self.trailer.as_deref()
    }
}

/// Posts `body` to `path` on `remote`, then drives the response through a
/// `RowParser` keyed on `rows_pointer`, returning once the header is
/// available. Shared by all four HTTP-backed services.
pub async fn execute_row_stream(
    http: &Arc<HttpConnectionManager>,
    service: ServiceType,
    remote: SocketAddr,
    path: &str,
    body: Bytes,
    extra_headers: &[(&str, &str)],
    rows_pointer: &str,
) -> Result<RowResultStream> {
    let mut session = http.checkout(service, remote).await?;
    let mut request = HttpRequest::post(path, body).with_header("Content-Type", "application/json");
    for (name, value) in extra_headers {
        request = request.with_header(*name, *value);
    }

    let (body_tx, mut body_rx) = mpsc::channel::<Result<Bytes>>(8);
    let send_fut = session.send(request, body_tx);

    let pointer = JsonPointer::parse(rows_pointer)?;
    let (event_tx, mut event_rx) = mpsc::channel::<Result<RowEvent>>(100);

    let driver = tokio::spawn(async move {
        let mut parser = RowParser::new(pointer);
        loop {
            match body_rx.recv().await {
                Some(Ok(chunk)) => {
                    parser.feed(&chunk);
                    let mut events = Vec::new();
                    if let Err(e) = parser.advance(&mut events) {
                        let _ = event_tx.send(Err(e)).await;
                        return;
                    }
                    for ev in events {
                        if event_tx.send(Ok(ev)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    let _ = event_tx.send(Err(e)).await;
                    return;
                }
                None => {
                    parser.finish();
                    let mut events = Vec::new();
                    if let Err(e) = parser.advance(&mut events) {
                        let _ = event_tx.send(Err(e)).await;
                        return;
                    }
                    for ev in events {
                        if event_tx.send(Ok(ev)).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
            }
        }
    });

    let response_head = send_fut.await?;
    // `send` streams the whole body before returning, so the session is
    // idle again here and safe to hand back to the pool.
    http.check_in(service, remote, session).await;
    if response_head.status >= 400 {
        driver.abort();
        return Err(Error::new(
            ErrorKind::InternalServerFailure,
            format!("{} returned HTTP {}", service.as_json_key(), response_head.status),
        )
        .with_context(crate::error::ErrorContext::new().with_http_status(response_head.status)));
    }

    let header = match event_rx.recv().await {
        Some(Ok(RowEvent::Header(h))) => h,
        Some(Err(e)) => return Err(e),
        _ => return Err(Error::new(ErrorKind::ParsingFailure, "response produced no metadata header")),
    };

    Ok(RowResultStream {
        header,
        rx: event_rx,
        trailer: None,
    })
}
