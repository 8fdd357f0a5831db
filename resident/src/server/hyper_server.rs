use async_trait::async_trait;
use bytes::Bytes;
use hyper::body::Sender;
use hyper::server::conn::Http;
use hyper::service::{make_service_fn, Service};
use hyper::{Body, Response};
use socket2::{Domain, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::sync::oneshot;

use crate::core::request::{Request, RequestSource};
use crate::core::response::ResponseSink;
use crate::middleware::cookies::Cookie;
use crate::server::ResidentServer;
use crate::worker::Worker;

///
/// A hyper request plus the peer it came from, turned into a `Request` once
/// its body has been read.
///
pub struct HyperRequest {
    pub request: hyper::Request<Body>,
    pub peer: Option<SocketAddr>,
    pub local_port: u16,
}

#[async_trait]
impl RequestSource for HyperRequest {
    async fn into_request(self) -> io::Result<Request> {
        let (parts, body) = self.request.into_parts();
        let body = hyper::body::to_bytes(body)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());
        let protocol = match parts.version {
            hyper::Version::HTTP_10 => "HTTP/1.0",
            hyper::Version::HTTP_2 => "HTTP/2.0",
            _ => "HTTP/1.1",
        };

        let mut request = Request::new(parts.method.as_str(), &uri)
            .with_server("server_protocol", protocol)
            .with_server("server_port", &self.local_port.to_string());
        if let Some(peer) = self.peer {
            request = request
                .with_server("remote_addr", &peer.ip().to_string())
                .with_server("remote_port", &peer.port().to_string());
        }
        for (name, value) in parts.headers.iter() {
            request = request.with_header(name.as_str(), value.to_str().unwrap_or(""));
        }

        Ok(request.with_body(body))
    }
}

///
/// Hands hyper its response head on the first body write, then streams the
/// rest of the body through a channel.
///
struct HyperSink {
    status: u16,
    headers: Vec<(String, String)>,
    head: Option<oneshot::Sender<Response<Body>>>,
    body: Option<Sender>,
}

impl HyperSink {
    fn new(head: oneshot::Sender<Response<Body>>) -> HyperSink {
        HyperSink {
            status: 200,
            headers: Vec::new(),
            head: Some(head),
            body: None,
        }
    }

    fn send_head(&mut self, body: Body) -> io::Result<()> {
        let head = match self.head.take() {
            Some(head) => head,
            None => return Ok(()),
        };

        let mut builder = Response::builder().status(self.status);
        for (name, value) in self.headers.iter() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .body(body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        head.send(response)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))
    }
}

#[async_trait]
impl ResponseSink for HyperSink {
    async fn status(&mut self, code: u16) -> io::Result<()> {
        self.status = code;
        Ok(())
    }

    async fn header(&mut self, name: &str, value: &str) -> io::Result<()> {
        self.headers.push((name.to_owned(), value.to_owned()));
        Ok(())
    }

    async fn cookie(&mut self, cookie: &Cookie) -> io::Result<()> {
        self.headers
            .push(("Set-Cookie".to_owned(), cookie.to_header_value()));
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        if self.head.is_some() {
            let (sender, body) = Body::channel();
            self.body = Some(sender);
            self.send_head(body)?;
        }

        match self.body {
            Some(ref mut sender) => sender
                .send_data(chunk)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e)),
            None => Ok(()),
        }
    }

    async fn end(&mut self, chunk: Option<Bytes>) -> io::Result<()> {
        if self.head.is_some() {
            return self.send_head(Body::from(chunk.unwrap_or_default()));
        }

        if let Some(chunk) = chunk {
            self.write(chunk).await?;
        }
        self.body = None;

        Ok(())
    }
}

pub struct HyperServer {
    worker: Arc<Worker>,
}

impl HyperServer {
    async fn process(worker: Arc<Worker>, addr: &SocketAddr) -> io::Result<()> {
        let listener = {
            let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;

            let address = (*addr).into();
            socket.set_reuse_address(true)?;
            #[cfg(unix)]
            socket.set_reuse_port(true)?;
            socket.bind(&address)?;
            socket.listen(1024)?;
            socket.set_nonblocking(true)?;
            let _ = socket.set_nodelay(true);

            let listener: std::net::TcpListener = socket.into();
            tokio::net::TcpListener::from_std(listener)?
        };
        let local_port = listener.local_addr()?.port();
        let incoming = futures::stream::unfold(listener, |listener| async move {
            let accepted = listener.accept().await.map(|(stream, _)| stream);
            Some((accepted, listener))
        });

        let service = make_service_fn(move |stream: &tokio::net::TcpStream| {
            let peer = stream.peer_addr().ok();
            let worker = worker.clone();

            async move {
                Ok::<_, hyper::Error>(WorkerService {
                    worker,
                    peer,
                    local_port,
                })
            }
        });

        let mut http = Http::new();
        http.http1_only(true);

        hyper::server::Builder::new(hyper::server::accept::from_stream(incoming), http)
            .serve(service)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

#[async_trait]
impl ResidentServer for HyperServer {
    fn new(worker: Worker) -> Self {
        HyperServer {
            worker: Arc::new(worker),
        }
    }

    async fn build(self, host: &str, port: u16) -> io::Result<()> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to bind"))?;
        info!("listening on {}", addr);

        HyperServer::process(self.worker, &addr).await
    }
}

#[derive(Clone)]
struct WorkerService {
    worker: Arc<Worker>,
    peer: Option<SocketAddr>,
    local_port: u16,
}

impl Service<hyper::Request<Body>> for WorkerService {
    type Response = Response<Body>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: hyper::Request<Body>) -> Self::Future {
        let source = HyperRequest {
            request,
            peer: self.peer,
            local_port: self.local_port,
        };
        let worker = self.worker.clone();
        let (head, response) = oneshot::channel();

        tokio::spawn(async move {
            let mut sink = HyperSink::new(head);
            if let Err(e) = worker.serve_source(source, &mut sink).await {
                warn!("failed to read the request: {}", e);
                let _ = sink.status(400).await;
                let _ = sink.end(None).await;
            }
        });

        Box::pin(async move {
            response
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "the worker dropped the response"))
        })
    }
}
