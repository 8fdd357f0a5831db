use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::io::{self, SeekFrom};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

use crate::core::errors::{Fault, FaultSet};
use crate::core::request::Request;
use crate::middleware::cookies::{Cookie, CookieValidator};
use crate::middleware::file::{self, ByteRange};

/// Bytes read from a file or stream per transport write.
pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;

///
/// The transport side of a response. The lifecycle drives a sink through
/// `status`, `header`*, `cookie`*, `write`*, `end` exactly once per request.
///
#[async_trait]
pub trait ResponseSink: Send {
    async fn status(&mut self, code: u16) -> io::Result<()>;
    async fn header(&mut self, name: &str, value: &str) -> io::Result<()>;
    async fn cookie(&mut self, cookie: &Cookie) -> io::Result<()>;
    async fn write(&mut self, chunk: Bytes) -> io::Result<()>;
    async fn end(&mut self, chunk: Option<Bytes>) -> io::Result<()>;
}

pub enum Body {
    Buffer(Bytes),
    /// A file streamed from `begin` to `end`, both inclusive.
    File {
        file: tokio::fs::File,
        begin: u64,
        end: u64,
    },
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl Default for Body {
    fn default() -> Self {
        Body::Buffer(Bytes::new())
    }
}

#[derive(Default, Debug, Clone)]
pub struct FileOptions {
    pub mime_type: Option<String>,
    pub inline: bool,
    pub file_size: Option<u64>,
    pub x_header: Option<String>,
}

///
/// The response accumulator for one request. Everything is a no-op once the
/// response has been sent.
///
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    body: Body,
    is_sent: bool,
    validator: Option<CookieValidator>,
}

impl Default for Response {
    fn default() -> Self {
        Response::new()
    }
}

impl Response {
    pub fn new() -> Response {
        Response {
            status: 200,
            headers: Vec::new(),
            cookies: Vec::new(),
            body: Body::default(),
            is_sent: false,
            validator: None,
        }
    }

    pub fn sign_cookies_with(&mut self, validator: CookieValidator) {
        self.validator = Some(validator);
    }

    pub fn is_sent(&self) -> bool {
        self.is_sent
    }

    /// Mark the response as sent without going through `send`, used once
    /// something else has already written to the transport.
    pub fn mark_sent(&mut self) {
        self.is_sent = true;
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    ///
    /// Set the response status code
    ///
    pub fn status(&mut self, code: u16) -> &mut Self {
        if !self.is_sent {
            self.status = code;
        }
        self
    }

    ///
    /// Set a header, replacing earlier values with the same name
    ///
    pub fn set(&mut self, name: &str, value: &str) -> &mut Self {
        if !self.is_sent {
            self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            self.headers.push((name.to_owned(), value.to_owned()));
        }
        self
    }

    pub fn add(&mut self, name: &str, value: &str) -> &mut Self {
        if !self.is_sent {
            self.headers.push((name.to_owned(), value.to_owned()));
        }
        self
    }

    /// Set a header only if none with that name exists yet.
    pub fn set_default(&mut self, name: &str, value: &str) -> &mut Self {
        if self.header(name).is_none() {
            self.add(name, value);
        }
        self
    }

    pub fn remove(&mut self, name: &str) -> &mut Self {
        if !self.is_sent {
            self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        }
        self
    }

    /// The last value set for `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    ///
    /// Headers as the transport will see them: one entry per name, holding the
    /// last value written for it, in first-seen order.
    ///
    pub fn collapsed_headers(&self) -> Vec<(&str, &str)> {
        let mut collapsed: Vec<(&str, &str)> = Vec::new();

        for (name, value) in self.headers.iter() {
            match collapsed
                .iter_mut()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
            {
                Some(entry) => entry.1 = value,
                None => collapsed.push((name, value)),
            }
        }

        collapsed
    }

    pub fn cookie(&mut self, cookie: Cookie) -> &mut Self {
        if !self.is_sent {
            self.cookies.retain(|c| c.key != cookie.key);
            self.cookies.push(cookie);
        }
        self
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    ///
    /// Set the body as a string
    ///
    pub fn body(&mut self, body_string: &str) -> &mut Self {
        self.set_body_bytes(Bytes::from(body_string.to_owned()))
    }

    pub fn set_body_bytes(&mut self, bytes: Bytes) -> &mut Self {
        if !self.is_sent {
            self.body = Body::Buffer(bytes);
        }
        self
    }

    pub fn set_stream(&mut self, body: Body) -> &mut Self {
        if !self.is_sent {
            self.body = body;
        }
        self
    }

    /// The buffered body, empty when a stream is active.
    pub fn buffered_body(&self) -> &[u8] {
        match self.body {
            Body::Buffer(ref bytes) => bytes,
            _ => &[],
        }
    }

    pub fn has_stream(&self) -> bool {
        !matches!(self.body, Body::Buffer(_))
    }

    ///
    /// Drop whatever body has been buffered or attached so far.
    ///
    pub fn clear_output(&mut self) {
        if !self.is_sent {
            self.body = Body::default();
        }
    }

    ///
    /// Set the response as JSON. Sets both the `Content-Type` header and the
    /// body.
    ///
    pub fn json<T: Serialize>(&mut self, body: &T) -> serde_json::Result<&mut Self> {
        let encoded = serde_json::to_vec(body)?;

        self.set("Content-Type", "application/json; charset=UTF-8");
        Ok(self.set_body_bytes(Bytes::from(encoded)))
    }

    ///
    /// Set up a redirect. Ajax requests get `X-Redirect` (or `X-Pjax-Url` for
    /// pjax) instead of `Location` so client code can follow it.
    ///
    pub fn redirect(&mut self, request: &Request, url: &str, status: u16) -> &mut Self {
        let url = if url.starts_with('/') && !url.starts_with("//") {
            match request.header("host") {
                Some(host) => {
                    let scheme = if request.is_secure_connection() {
                        "https"
                    } else {
                        "http"
                    };
                    format!("{}://{}{}", scheme, host, url)
                }
                None => url.to_owned(),
            }
        } else {
            url.to_owned()
        };

        let mut status = status;
        if request.is_ajax() {
            if request.header("x-ie-redirect-compatibility").is_some() && status == 302 {
                status = 200;
            }
            if request.is_pjax() {
                self.set("X-Pjax-Url", &url);
            } else {
                self.set("X-Redirect", &url);
            }
        } else {
            self.set("Location", &url);
        }

        self.status(status)
    }

    ///
    /// Respond with `content` as a download, honouring the request's `Range`.
    ///
    pub fn send_content_as_file(
        &mut self,
        request: &Request,
        content: Bytes,
        attachment_name: &str,
        options: &FileOptions,
    ) -> Result<&mut Self, Fault> {
        let size = content.len() as u64;
        let range = self.apply_range(request, size)?;

        let body = match range {
            Some(range) if !range.is_empty() => {
                content.slice(range.start as usize..=range.end as usize)
            }
            _ => Bytes::new(),
        };
        let length = body.len() as u64;

        self.set_download_headers(
            attachment_name,
            options
                .mime_type
                .as_deref()
                .or(Some("application/octet-stream")),
            options.inline,
            Some(length),
        );

        Ok(self.set_body_bytes(body))
    }

    ///
    /// Stream `reader` as a download. The reader is assumed to be positioned
    /// at the start of the content; ranged reads skip ahead to the range.
    ///
    pub async fn send_stream_as_file<R>(
        &mut self,
        request: &Request,
        mut reader: R,
        attachment_name: &str,
        options: &FileOptions,
    ) -> Result<&mut Self, Fault>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let size = options
            .file_size
            .ok_or_else(|| Fault::internal_error("a stream download needs a file size"))?;
        let range = self.apply_range(request, size)?;
        let (begin, length) = match range {
            Some(range) => (range.start, range.len()),
            None => (0, 0),
        };

        if begin > 0 {
            let mut skipped = (&mut reader).take(begin);
            tokio::io::copy(&mut skipped, &mut tokio::io::sink()).await?;
        }

        self.set_download_headers(
            attachment_name,
            options
                .mime_type
                .as_deref()
                .or(Some("application/octet-stream")),
            options.inline,
            Some(length),
        );

        Ok(self.set_stream(Body::Stream(Box::new(reader.take(length)))))
    }

    ///
    /// Send a file from disk by seeking the file handle to the requested range.
    ///
    pub async fn send_file(
        &mut self,
        request: &Request,
        path: &Path,
        attachment_name: Option<&str>,
        options: &FileOptions,
    ) -> Result<&mut Self, Fault> {
        let handle = match tokio::fs::File::open(path).await {
            Ok(handle) => handle,
            Err(_) => return Err(Fault::not_found_error()),
        };
        let size = match options.file_size {
            Some(size) => size,
            None => handle.metadata().await?.len(),
        };
        let range = self.apply_range(request, size)?;

        let name = match attachment_name {
            Some(name) => name.to_owned(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let mime_type = options
            .mime_type
            .clone()
            .unwrap_or_else(|| file::mime_type_for(path).to_owned());

        match range {
            Some(range) if !range.is_empty() => {
                self.set_download_headers(&name, Some(&mime_type), options.inline, Some(range.len()));
                Ok(self.set_stream(Body::File {
                    file: handle,
                    begin: range.start,
                    end: range.end,
                }))
            }
            _ => {
                self.set_download_headers(&name, Some(&mime_type), options.inline, Some(0));
                Ok(self.set_body_bytes(Bytes::new()))
            }
        }
    }

    ///
    /// Let the front web server deliver the file (`X-Sendfile`,
    /// `X-Accel-Redirect`, ...).
    ///
    pub fn x_send_file(
        &mut self,
        path: &Path,
        attachment_name: Option<&str>,
        options: &FileOptions,
    ) -> &mut Self {
        let name = match attachment_name {
            Some(name) => name.to_owned(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let mime_type = options
            .mime_type
            .clone()
            .unwrap_or_else(|| file::mime_type_for(path).to_owned());
        let x_header = options.x_header.as_deref().unwrap_or("X-Sendfile");
        let disposition = if options.inline { "inline" } else { "attachment" };

        self.set_default(x_header, &path.to_string_lossy());
        self.set_default("Content-Type", &mime_type);
        self.set_default(
            "Content-Disposition",
            &file::disposition_header_value(disposition, &name),
        )
    }

    pub fn set_download_headers(
        &mut self,
        attachment_name: &str,
        mime_type: Option<&str>,
        inline: bool,
        content_length: Option<u64>,
    ) -> &mut Self {
        let disposition = if inline { "inline" } else { "attachment" };

        self.set_default("Pragma", "public")
            .set_default("Accept-Ranges", "bytes")
            .set_default("Expires", "0")
            .set_default("Cache-Control", "must-revalidate, post-check=0, pre-check=0")
            .set_default(
                "Content-Disposition",
                &file::disposition_header_value(disposition, attachment_name),
            );

        if let Some(mime_type) = mime_type {
            self.set_default("Content-Type", mime_type);
        }

        if let Some(length) = content_length {
            self.set_default("Content-Length", &length.to_string());
        }

        self
    }

    // Resolves the request's range against `size` and sets status and
    // `Content-Range` accordingly. `None` means an empty entity.
    fn apply_range(&mut self, request: &Request, size: u64) -> Result<Option<ByteRange>, Fault> {
        match file::http_range(request.header("range"), size) {
            file::RangeSpec::Unsatisfiable => {
                self.set("Content-Range", &format!("bytes */{}", size));
                Err(Fault::range_not_satisfiable_error())
            }
            file::RangeSpec::Full => {
                self.status(200);
                Ok(ByteRange::whole(size))
            }
            file::RangeSpec::Partial(range) => {
                self.status(206);
                self.set(
                    "Content-Range",
                    &format!("bytes {}-{}/{}", range.start, range.end, size),
                );
                Ok(Some(range))
            }
        }
    }

    ///
    /// Send the response to the transport. Only the first call does anything;
    /// the response counts as sent as soon as it starts.
    ///
    pub async fn send(&mut self, sink: &mut dyn ResponseSink) -> io::Result<()> {
        if self.is_sent {
            return Ok(());
        }
        self.is_sent = true;

        let headers: Vec<(String, String)> = self
            .collapsed_headers()
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        let cookies: Vec<Cookie> = self
            .cookies
            .iter()
            .map(|cookie| match self.validator {
                // Deletions carry an empty value and are sent as is.
                Some(ref validator) if !cookie.value.is_empty() => {
                    let mut signed = cookie.clone();
                    signed.value = validator.sign(&cookie.key, &cookie.value);
                    signed
                }
                _ => cookie.clone(),
            })
            .collect();

        sink.status(self.status).await?;
        for (name, value) in headers.iter() {
            sink.header(name, value).await?;
        }
        for cookie in cookies.iter() {
            sink.cookie(cookie).await?;
        }

        match std::mem::take(&mut self.body) {
            Body::Buffer(bytes) => sink.end(Some(bytes)).await,
            Body::File {
                mut file,
                begin,
                end,
            } => {
                file.seek(SeekFrom::Start(begin)).await?;
                let mut pos = begin;
                let mut buf = vec![0u8; CHUNK_SIZE.min((end - begin + 1) as usize)];

                while pos <= end {
                    let want = (CHUNK_SIZE as u64).min(end - pos + 1) as usize;
                    let read = file.read(&mut buf[..want]).await?;
                    if read == 0 {
                        break;
                    }
                    pos += read as u64;
                    sink.write(Bytes::copy_from_slice(&buf[..read])).await?;
                }

                sink.end(None).await
            }
            Body::Stream(mut reader) => {
                let mut buf = vec![0u8; CHUNK_SIZE];

                loop {
                    let read = reader.read(&mut buf).await?;
                    if read == 0 {
                        break;
                    }
                    sink.write(Bytes::copy_from_slice(&buf[..read])).await?;
                }

                sink.end(None).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::RecordingSink;

    #[test]
    fn it_should_collapse_duplicate_headers_to_the_last_value() {
        let mut response = Response::new();
        response.add("X-Trace", "1");
        response.add("Content-Type", "text/plain");
        response.add("x-trace", "2");

        assert_eq!(
            response.collapsed_headers(),
            vec![("X-Trace", "2"), ("Content-Type", "text/plain")]
        );
    }

    #[tokio::test]
    async fn it_should_send_only_once() {
        let mut response = Response::new();
        let mut sink = RecordingSink::new();
        response.body("hello");

        response.send(&mut sink).await.unwrap();
        response.body("changed");
        response.status(500);
        response.send(&mut sink).await.unwrap();

        assert!(response.is_sent());
        assert_eq!(sink.ends, 1);
        assert_eq!(sink.status, Some(200));
        assert_eq!(sink.body_string(), "hello");
    }

    #[test]
    fn it_should_answer_a_byte_range_of_buffered_content() {
        let content: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let request = Request::new("GET", "/download").with_header("Range", "bytes=500-999");
        let mut response = Response::new();

        response
            .send_content_as_file(
                &request,
                Bytes::from(content.clone()),
                "data.bin",
                &FileOptions::default(),
            )
            .unwrap();

        assert_eq!(response.status_code(), 206);
        assert_eq!(response.header("Content-Range"), Some("bytes 500-999/2000"));
        assert_eq!(response.header("Content-Length"), Some("500"));
        assert_eq!(response.buffered_body(), &content[500..1000]);
    }

    #[test]
    fn it_should_refuse_an_unsatisfiable_range() {
        let request = Request::new("GET", "/download").with_header("Range", "bytes=5000-");
        let mut response = Response::new();

        let fault = response
            .send_content_as_file(
                &request,
                Bytes::from(vec![0u8; 2000]),
                "data.bin",
                &FileOptions::default(),
            )
            .err()
            .unwrap();

        assert_eq!(fault.status_code(), 416);
        assert_eq!(response.header("Content-Range"), Some("bytes */2000"));
    }

    #[test]
    fn it_should_use_ajax_redirect_headers() {
        let request = Request::new("GET", "/")
            .with_header("Host", "example.com")
            .with_header("X-Requested-With", "XMLHttpRequest");
        let mut response = Response::new();

        response.redirect(&request, "/login", 302);

        assert_eq!(response.header("X-Redirect"), Some("http://example.com/login"));
        assert_eq!(response.header("Location"), None);
        assert_eq!(response.status_code(), 302);
    }
}
