use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;

use crate::core::request::{decode, Request};
use crate::core::response::ResponseSink;
use crate::middleware::cookies::Cookie;
use crate::worker::{Served, Worker};

///
/// A `ResponseSink` that keeps everything written to it, for asserting on
/// what a transport would have seen.
///
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<Cookie>,
    pub chunks: Vec<Bytes>,
    /// Number of times `end` was called.
    pub ends: usize,
}

impl RecordingSink {
    pub fn new() -> RecordingSink {
        RecordingSink::default()
    }

    pub fn body(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().rev().find(|c| c.key == name)
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    async fn status(&mut self, code: u16) -> io::Result<()> {
        self.status = Some(code);
        Ok(())
    }

    async fn header(&mut self, name: &str, value: &str) -> io::Result<()> {
        self.headers.push((name.to_owned(), value.to_owned()));
        Ok(())
    }

    async fn cookie(&mut self, cookie: &Cookie) -> io::Result<()> {
        self.cookies.push(cookie.clone());
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.chunks.push(chunk);
        Ok(())
    }

    async fn end(&mut self, chunk: Option<Bytes>) -> io::Result<()> {
        if let Some(chunk) = chunk {
            self.chunks.push(chunk);
        }
        self.ends += 1;
        Ok(())
    }
}

#[derive(Debug)]
pub struct TestResponse {
    pub served: Served,
    pub sink: RecordingSink,
}

impl TestResponse {
    pub fn status(&self) -> Option<u16> {
        self.sink.status
    }

    pub fn body(&self) -> String {
        self.sink.body_string()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.sink.header(name)
    }

    /// `Name=value` pairs suitable for the next request's `Cookie` header.
    pub fn cookie_header(&self) -> String {
        self.sink
            .cookies
            .iter()
            .filter(|c| !c.value.is_empty())
            .map(|c| format!("{}={}", c.key, c.value))
            .collect::<Vec<String>>()
            .join("; ")
    }
}

///
/// Build a request the way a transport would, from raw HTTP/1.1 text.
///
pub fn raw_request(method: &str, route: &str, headers: &[(&str, &str)], body: &str) -> Request {
    let mut head = format!("{} {} HTTP/1.1\r\nHost: localhost:8080\r\n", method, route);
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !body.is_empty() {
        head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    head.push_str("\r\n");
    head.push_str(body);

    let mut bytes = BytesMut::with_capacity(head.len());
    bytes.put(head.as_bytes());

    decode(&mut bytes)
        .ok()
        .flatten()
        .unwrap_or_else(|| Request::new(method, route))
}

pub async fn request(
    worker: &Worker,
    method: &str,
    route: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> TestResponse {
    let request = raw_request(method, route, headers, body);
    let mut sink = RecordingSink::new();
    let served = worker.serve(&request, &mut sink).await;

    TestResponse { served, sink }
}

pub async fn get(worker: &Worker, route: &str) -> TestResponse {
    request(worker, "GET", route, &[], "").await
}

pub async fn post(worker: &Worker, route: &str, content: &str) -> TestResponse {
    request(
        worker,
        "POST",
        route,
        &[("Content-Type", "application/x-www-form-urlencoded")],
        content,
    )
    .await
}
