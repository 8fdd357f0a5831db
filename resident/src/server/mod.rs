#[cfg(feature = "hyper_server")]
pub mod hyper_server;

#[cfg(feature = "hyper_server")]
pub use self::hyper_server::HyperServer;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::core::request::decode_with_limit;
use crate::core::response::ResponseSink;
use crate::lifecycle::Verdict;
use crate::middleware::cookies::Cookie;
use crate::worker::Worker;

#[async_trait]
pub trait ResidentServer {
    fn new(worker: Worker) -> Self;
    async fn build(self, host: &str, port: u16) -> io::Result<()>;
    fn start(self, host: &str, port: u16) -> io::Result<()>
    where
        Self: Sized,
    {
        tokio::runtime::Runtime::new()?.block_on(self.build(host, port))
    }
}

///
/// A plain HTTP/1.1 server that feeds every connection through one worker.
/// It stops accepting once the worker has terminated.
///
pub struct Server {
    worker: Arc<Worker>,
}

#[async_trait]
impl ResidentServer for Server {
    fn new(worker: Worker) -> Self {
        Server {
            worker: Arc::new(worker),
        }
    }

    async fn build(self, host: &str, port: u16) -> io::Result<()> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to bind"))?;
        let listener = TcpListener::bind(&addr).await?;
        info!("listening on {}", addr);

        serve_listener(self.worker, listener).await
    }
}

///
/// Accept connections until the worker terminates. A connection accepted in
/// the same instant the worker terminates is closed unanswered.
///
pub async fn serve_listener(worker: Arc<Worker>, listener: TcpListener) -> io::Result<()> {
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => accepted?.0,
            _ = worker.terminated() => break,
        };
        if worker.is_terminated() {
            break;
        }

        let worker = worker.clone();
        tokio::spawn(async move {
            if let Err(e) = process(worker, stream).await {
                warn!("failed to process connection; error = {}", e);
            }
        });
    }

    info!("worker terminated, no longer accepting connections");
    Ok(())
}

async fn process(worker: Arc<Worker>, stream: TcpStream) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    let (mut reader, writer) = stream.into_split();
    let mut sink = StreamSink::new(writer);
    let mut buf = BytesMut::with_capacity(4096);
    let max_body_size = worker.app().config().max_body_size;

    loop {
        let decoded = match decode_with_limit(&mut buf, max_body_size) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("refusing a malformed request from {}: {}", peer, e);
                bad_request(&mut sink).await?;
                return Ok(());
            }
        };

        if let Some(request) = decoded {
            let request = request
                .with_server("remote_addr", &peer.ip().to_string())
                .with_server("remote_port", &peer.port().to_string())
                .with_server("server_port", &local.port().to_string());

            let served = worker.serve(&request, &mut sink).await;
            sink.reset();

            if served.verdict == Verdict::Terminate {
                return Ok(());
            }
            continue;
        }

        if reader.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

async fn bad_request<W: AsyncWrite + Unpin + Send>(sink: &mut StreamSink<W>) -> io::Result<()> {
    sink.status(400).await?;
    sink.header("Connection", "close").await?;
    sink.end(Some(Bytes::from_static(b"Bad Request"))).await
}

///
/// Writes one HTTP/1.1 response at a time to `out`. The head is held back
/// until the first body write so that a buffered body can carry its length;
/// anything streamed without a `Content-Length` goes out chunked.
///
pub struct StreamSink<W> {
    out: W,
    status: u16,
    head: Vec<(String, String)>,
    head_sent: bool,
    chunked: bool,
}

impl<W: AsyncWrite + Unpin + Send> StreamSink<W> {
    pub fn new(out: W) -> StreamSink<W> {
        StreamSink {
            out,
            status: 200,
            head: Vec::new(),
            head_sent: false,
            chunked: false,
        }
    }

    pub fn reset(&mut self) {
        self.status = 200;
        self.head.clear();
        self.head_sent = false;
        self.chunked = false;
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    async fn send_head(&mut self, known_len: Option<usize>) -> io::Result<()> {
        let has_length = self
            .head
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("content-length"));
        if !has_length {
            match known_len {
                Some(len) => self.head.push(("Content-Length".to_owned(), len.to_string())),
                None => {
                    self.chunked = true;
                    self.head.push(("Transfer-Encoding".to_owned(), "chunked".to_owned()));
                }
            }
        }

        let reason = http::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("");
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason);
        for (name, value) in self.head.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        self.head_sent = true;
        self.out.write_all(head.as_bytes()).await
    }

    async fn write_body(&mut self, chunk: &[u8]) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        if self.chunked {
            self.out.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
            self.out.write_all(chunk).await?;
            self.out.write_all(b"\r\n").await
        } else {
            self.out.write_all(chunk).await
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ResponseSink for StreamSink<W> {
    async fn status(&mut self, code: u16) -> io::Result<()> {
        self.status = code;
        Ok(())
    }

    async fn header(&mut self, name: &str, value: &str) -> io::Result<()> {
        self.head.push((name.to_owned(), value.to_owned()));
        Ok(())
    }

    async fn cookie(&mut self, cookie: &Cookie) -> io::Result<()> {
        self.head.push(("Set-Cookie".to_owned(), cookie.to_header_value()));
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        if !self.head_sent {
            self.send_head(None).await?;
        }
        self.write_body(&chunk).await
    }

    async fn end(&mut self, chunk: Option<Bytes>) -> io::Result<()> {
        let chunk = chunk.unwrap_or_default();
        if !self.head_sent {
            self.send_head(Some(chunk.len())).await?;
        }
        self.write_body(&chunk).await?;
        if self.chunked {
            self.out.write_all(b"0\r\n\r\n").await?;
        }

        self.out.flush().await
    }
}
