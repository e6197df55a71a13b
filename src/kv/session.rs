//! One multiplexed KV connection: resolves and dials a node, negotiates
//! HELLO features, authenticates over SASL, selects a bucket, then owns a
//! single TCP (or TLS) stream writing requests as they arrive and
//! demultiplexing responses back to callers by opaque value. Generalizes
//! the pooled-connection-plus-background-reader shape used for the wire
//! protocol, replacing blocking reads with a tokio reactor task.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use super::auth::{self, Credentials};
use super::codec::{Frame, KvCodec};
use super::{features, opcode, status};
use crate::error::{Error, ErrorKind, Result};

type PendingMap = Arc<Mutex<HashMap<u32, oneshot::Sender<Frame>>>>;

enum Outbound {
    Send(Frame),
}

/// Which address family a node's hostname should resolve to first; the rest
/// of the candidate list is tried in order if the preferred family fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpPreference {
    Ipv4Preferred,
    Ipv6Preferred,
    Any,
}

impl Default for IpPreference {
    fn default() -> Self {
        IpPreference::Ipv4Preferred
    }
}

/// Either side of the plain/TLS split a session's transport can be. Built
/// once by `dial()`; `Framed` only needs `AsyncRead + AsyncWrite + Unpin`,
/// which both variants give it without the rest of the session caring which
/// one it got.
enum KvStream {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(tokio_openssl::SslStream<TcpStream>),
}

impl AsyncRead for KvStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            KvStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            KvStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for KvStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            KvStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            KvStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            KvStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            KvStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            KvStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            KvStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(feature = "tls")]
async fn upgrade_tls(stream: TcpStream, host: &str) -> Result<KvStream> {
    use openssl::ssl::{SslConnector, SslMethod};

    let connector = SslConnector::builder(SslMethod::tls())
        .map_err(|e| Error::new(ErrorKind::HandshakeFailure, e.to_string()))?
        .build();
    let ssl = connector
        .configure()
        .map_err(|e| Error::new(ErrorKind::HandshakeFailure, e.to_string()))?
        .into_ssl(host)
        .map_err(|e| Error::new(ErrorKind::HandshakeFailure, e.to_string()))?;
    let mut tls_stream = tokio_openssl::SslStream::new(ssl, stream)
        .map_err(|e| Error::new(ErrorKind::HandshakeFailure, e.to_string()))?;
    Pin::new(&mut tls_stream)
        .connect()
        .await
        .map_err(|e| Error::new(ErrorKind::HandshakeFailure, e.to_string()))?;
    Ok(KvStream::Tls(tls_stream))
}

fn order_candidates(mut candidates: Vec<SocketAddr>, preference: IpPreference) -> Vec<SocketAddr> {
    let rank = |addr: &SocketAddr| -> u8 {
        match (preference, addr.ip()) {
            (IpPreference::Any, _) => 0,
            (IpPreference::Ipv4Preferred, IpAddr::V4(_)) => 0,
            (IpPreference::Ipv4Preferred, IpAddr::V6(_)) => 1,
            (IpPreference::Ipv6Preferred, IpAddr::V6(_)) => 0,
            (IpPreference::Ipv6Preferred, IpAddr::V4(_)) => 1,
        }
    };
    candidates.sort_by_key(rank);
    candidates
}

/// Handle to a running session; cheap to clone, shares the writer channel
/// and pending-response map with the background I/O task.
#[derive(Clone)]
pub struct KvSession {
    remote: SocketAddr,
    writer: mpsc::Sender<Outbound>,
    pending: PendingMap,
    next_opaque: Arc<AtomicU32>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl KvSession {
    /// Resolves `host` (honoring `ip_preference` when more than one address
    /// family comes back), dials the first reachable candidate, then runs
    /// the HELLO / SASL / select-bucket handshake before returning a
    /// session ready for ordinary KV traffic.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        host: &str,
        port: u16,
        ip_preference: IpPreference,
        connect_timeout: Duration,
        handshake_timeout: Duration,
        credentials: Option<&Credentials>,
        bucket: Option<&str>,
        tls: bool,
    ) -> Result<Self> {
        let tcp = Self::dial(host, port, ip_preference, connect_timeout).await?;
        let remote = tcp.peer_addr().map_err(Error::from)?;
        tcp.set_nodelay(true).ok();

        let stream = if tls {
            #[cfg(feature = "tls")]
            {
                upgrade_tls(tcp, host).await?
            }
            #[cfg(not(feature = "tls"))]
            {
                return Err(Error::new(ErrorKind::FeatureNotAvailable, "built without the 'tls' feature"));
            }
        } else {
            KvStream::Plain(tcp)
        };
        let session = Self::from_stream(remote, stream);

        let handshake_deadline = tokio::time::Instant::now() + handshake_timeout;
        session.hello(handshake_deadline).await?;
        if let Some(credentials) = credentials {
            session.authenticate(credentials, handshake_deadline).await?;
        }
        if let Some(bucket) = bucket {
            session.select_bucket(bucket, handshake_deadline).await?;
        }
        Ok(session)
    }

    async fn dial(host: &str, port: u16, ip_preference: IpPreference, connect_timeout: Duration) -> Result<TcpStream> {
        let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::new(ErrorKind::ResolveFailure, e.to_string()))?
            .collect();
        if candidates.is_empty() {
            return Err(Error::new(ErrorKind::ResolveFailure, format!("{host}:{port} resolved to no addresses")));
        }

        let mut last_err = None;
        for candidate in order_candidates(candidates, ip_preference) {
            match tokio::time::timeout(connect_timeout, TcpStream::connect(candidate)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_err = Some(Error::new(ErrorKind::ServiceNotAvailable, e.to_string())),
                Err(_) => last_err = Some(Error::new(ErrorKind::UnambiguousTimeout, format!("connect to {candidate} timed out"))),
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::new(ErrorKind::ServiceNotAvailable, "no candidate address could be reached"))
            .with_context(crate::error::ErrorContext::new().with_endpoint(format!("{host}:{port}"))))
    }

    fn from_stream(remote: SocketAddr, stream: KvStream) -> Self {
        let framed = Framed::new(stream, KvCodec);
        let (mut sink, mut source) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(frame) => {
                        let sender = reader_pending.lock().unwrap().remove(&frame.opaque);
                        if let Some(sender) = sender {
                            let _ = sender.send(frame);
                        }
                    }
                    Err(_) => break,
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            for (_, sender) in reader_pending.lock().unwrap().drain() {
                drop(sender);
            }
        });

        tokio::spawn(async move {
            while let Some(Outbound::Send(frame)) = rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        KvSession {
            remote,
            writer: tx,
            pending,
            next_opaque: Arc::new(AtomicU32::new(1)),
            closed,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends `frame` (after stamping a fresh opaque) and awaits its matching
    /// response, racing against `deadline`.
    pub async fn call(&self, mut frame: Frame, deadline: tokio::time::Instant) -> Result<Frame> {
        let opaque = self.next_opaque.fetch_add(1, Ordering::SeqCst);
        frame.opaque = opaque;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(opaque, tx);

        if self
            .writer
            .send(Outbound::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().unwrap().remove(&opaque);
            return Err(Error::new(ErrorKind::ServiceNotAvailable, "kv session writer closed")
                .with_context(crate::error::ErrorContext::new().with_endpoint(self.remote.to_string())));
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(Error::new(ErrorKind::ServiceNotAvailable, "kv session closed before response arrived")
                .with_context(crate::error::ErrorContext::new().with_endpoint(self.remote.to_string()))),
            Err(_) => {
                self.pending.lock().unwrap().remove(&opaque);
                Err(Error::new(ErrorKind::UnambiguousTimeout, "kv request timed out")
                    .with_context(crate::error::ErrorContext::new().with_endpoint(self.remote.to_string())))
            }
        }
    }

    /// Proposes this client's feature set; codes the server doesn't
    /// recognize are silently dropped by `features::from_wire`, so a
    /// mismatch never fails the handshake.
    async fn hello(&self, deadline: tokio::time::Instant) -> Result<features::KvFeatures> {
        let codes = features::requested_codes();
        let frame = Frame::request(opcode::HELLO, 0, 0)
            .with_key(b"couchdoc-rs".to_vec())
            .with_value(features::encode_codes(&codes));
        let response = self.call(frame, deadline).await?;
        if response.status() != status::SUCCESS {
            return Err(Error::new(ErrorKind::HandshakeFailure, format!("HELLO failed with status 0x{:04x}", response.status())));
        }
        Ok(features::from_wire(&response.value))
    }

    async fn authenticate(&self, credentials: &Credentials, deadline: tokio::time::Instant) -> Result<()> {
        let list_frame = Frame::request(opcode::SASL_LIST_MECHS, 0, 0);
        let list_response = self.call(list_frame, deadline).await?;
        if list_response.status() != status::SUCCESS {
            return Err(Error::new(ErrorKind::HandshakeFailure, "SASL_LIST_MECHS failed"));
        }
        let server_mechs = std::str::from_utf8(&list_response.value)
            .map_err(|_| Error::new(ErrorKind::HandshakeFailure, "SASL mechanism list is not UTF-8"))?;
        let mechanism = auth::choose_mechanism(server_mechs)
            .ok_or_else(|| Error::new(ErrorKind::AuthenticationFailure, "no common SASL mechanism"))?;

        match mechanism {
            auth::SaslMechanism::Plain => {
                let frame = Frame::request(opcode::SASL_AUTH, 0, 0)
                    .with_key(mechanism.name().as_bytes().to_vec())
                    .with_value(auth::plain_response(credentials));
                let response = self.call(frame, deadline).await?;
                self.check_auth_status(&response)
            }
            auth::SaslMechanism::CramMd5 => {
                let start_frame = Frame::request(opcode::SASL_AUTH, 0, 0).with_key(mechanism.name().as_bytes().to_vec());
                let challenge = self.call(start_frame, deadline).await?;
                if challenge.status() != status::AUTH_CONTINUE {
                    return self.check_auth_status(&challenge);
                }
                let response_value = auth::cram_md5_response(credentials, &challenge.value)?;
                let step_frame = Frame::request(opcode::SASL_STEP, 0, 0)
                    .with_key(mechanism.name().as_bytes().to_vec())
                    .with_value(response_value);
                let response = self.call(step_frame, deadline).await?;
                self.check_auth_status(&response)
            }
            auth::SaslMechanism::ScramSha1 => {
                let client = auth::ScramClient::new(credentials);
                let start_frame = Frame::request(opcode::SASL_AUTH, 0, 0)
                    .with_key(mechanism.name().as_bytes().to_vec())
                    .with_value(client.client_first_message());
                let server_first = self.call(start_frame, deadline).await?;
                if server_first.status() != status::AUTH_CONTINUE {
                    return self.check_auth_status(&server_first);
                }
                let (client_final, expected_signature) = client.client_final_message(&server_first.value)?;
                let step_frame = Frame::request(opcode::SASL_STEP, 0, 0)
                    .with_key(mechanism.name().as_bytes().to_vec())
                    .with_value(client_final);
                let server_final = self.call(step_frame, deadline).await?;
                if server_final.status() == status::SUCCESS {
                    auth::ScramClient::verify_server_final(&expected_signature, &server_final.value)?;
                    return Ok(());
                }
                self.check_auth_status(&server_final)
            }
        }
    }

    fn check_auth_status(&self, response: &Frame) -> Result<()> {
        if response.status() == status::SUCCESS {
            return Ok(());
        }
        Err(Error::new(ErrorKind::AuthenticationFailure, format!("SASL exchange failed with status 0x{:04x}", response.status())))
    }

    async fn select_bucket(&self, bucket: &str, deadline: tokio::time::Instant) -> Result<()> {
        let frame = Frame::request(opcode::SELECT_BUCKET, 0, 0).with_key(bucket.as_bytes().to_vec());
        let response = self.call(frame, deadline).await?;
        if response.status() != status::SUCCESS {
            return Err(Error::new(ErrorKind::BucketNotFound, format!("select-bucket {bucket} failed with status 0x{:04x}", response.status())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt as _, StreamExt as _};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed as TestFramed;

    /// A fake server that answers exactly one HELLO (so `connect()`'s
    /// handshake succeeds against an anonymous, bucket-less session) and
    /// then goes silent, so the real test below can exercise `call()`'s
    /// timeout path against it.
    async fn hello_then_silent_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut framed = TestFramed::new(sock, KvCodec);
            if let Some(Ok(request)) = framed.next().await {
                let response = Frame::request(request.opcode, status::SUCCESS, request.opaque);
                let _ = framed.send(response).await;
            }
            // Never respond again.
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        });
        addr
    }

    #[tokio::test]
    async fn call_times_out_when_server_never_responds() {
        let addr = hello_then_silent_server().await;
        let session = KvSession::connect(
            &addr.ip().to_string(),
            addr.port(),
            IpPreference::Any,
            Duration::from_secs(1),
            Duration::from_secs(1),
            None,
            None,
            false,
        )
        .await
        .unwrap();
        let frame = Frame::request(0x00, 0, 0).with_key("k");
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(50);
        let result = session.call(frame, deadline).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::UnambiguousTimeout);
    }

    #[test]
    fn ipv4_preference_sorts_v4_addresses_first() {
        let addrs = vec![
            "[::1]:11210".parse().unwrap(),
            "127.0.0.1:11210".parse().unwrap(),
        ];
        let ordered = order_candidates(addrs, IpPreference::Ipv4Preferred);
        assert!(ordered[0].is_ipv4());
    }
}
