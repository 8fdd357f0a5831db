use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::{fmt, io, str};

use crate::middleware::cookies;
use crate::middleware::query_params::parse_query;

///
/// A query or form value. `a=1` is `Single`, `a[]=1&a[]=2` is a `List` and
/// `a[x]=1` is `Map`.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamValue {
    Single(String),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Single(v) => Some(v),
            _ => None,
        }
    }
}

pub type ParamMap = HashMap<String, ParamValue>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadedFile {
    pub name: String,
    pub mime: String,
    pub tmp_name: String,
    pub size: u64,
    pub error: Option<i32>,
}

///
/// An upload field is either a single file (`<input name="avatar">`) or an
/// array-indexed one (`<input name="photos[]">`), keyed by index or name.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Upload {
    Single(UploadedFile),
    Indexed(BTreeMap<String, UploadedFile>),
}

///
/// Lower-cased header names with every value kept in arrival order.
///
#[derive(Clone, Debug, Default)]
pub struct Headers {
    entries: SmallVec<[(String, String); 16]>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    pub fn add(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_ascii_lowercase(), value.to_owned()));
    }

    /// The first value for `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

///
/// The request handed to the core by the transport. It is immutable for the
/// whole request and only ever borrowed by the lifecycle.
///
#[derive(Clone, Default)]
pub struct Request {
    method: String,
    path: String,
    query_string: String,
    pub query: ParamMap,
    pub post: ParamMap,
    pub headers: Headers,
    pub cookies: HashMap<String, String>,
    pub files: BTreeMap<String, Upload>,
    /// Transport metadata, e.g. `remote_addr`, `server_port`, `server_protocol`.
    pub server: BTreeMap<String, String>,
    body: Bytes,
}

impl Request {
    ///
    /// Create a new, blank, request.
    ///
    pub fn new(method: &str, uri: &str) -> Self {
        let (path, query_string) = match uri.find('?') {
            Some(idx) => (&uri[..idx], &uri[idx + 1..]),
            None => (uri, ""),
        };

        let mut server = BTreeMap::new();
        server.insert("request_method".to_owned(), method.to_ascii_uppercase());
        server.insert("request_uri".to_owned(), path.to_owned());
        if !query_string.is_empty() {
            server.insert("query_string".to_owned(), query_string.to_owned());
        }

        Request {
            method: method.to_ascii_uppercase(),
            path: path.to_owned(),
            query_string: query_string.to_owned(),
            query: parse_query(query_string),
            server,
            ..Request::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if name.eq_ignore_ascii_case("cookie") {
            for cookie in cookies::parse_string(value) {
                if !cookie.key.is_empty() {
                    self.cookies.insert(cookie.key, cookie.value);
                }
            }
        }
        self.headers.add(name, value);
        self
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.insert(name.to_owned(), value.to_owned());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();

        let is_form = self
            .headers
            .get("content-type")
            .map(|t| t.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if is_form {
            if let Ok(text) = str::from_utf8(&self.body) {
                self.post = parse_query(text);
            }
        }

        self
    }

    pub fn with_file(mut self, field: &str, upload: Upload) -> Self {
        self.files.insert(field.to_owned(), upload);
        self
    }

    pub fn with_server(mut self, key: &str, value: &str) -> Self {
        self.server.insert(key.to_ascii_lowercase(), value.to_owned());
        self
    }

    ///
    /// Get the method as a string
    ///
    pub fn method(&self) -> &str {
        &self.method
    }

    ///
    /// Get the path as a string ("/some/path"), without the query string
    ///
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    /// The path followed by `?query` when a query string is present.
    pub fn url(&self) -> String {
        if self.query_string.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query_string)
        }
    }

    ///
    /// The raw body. Only `POST`, `PUT` and `PATCH` requests are considered to
    /// carry one.
    ///
    pub fn raw_body(&self) -> &[u8] {
        match self.method.as_str() {
            "POST" | "PUT" | "PATCH" => &self.body,
            _ => &[],
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).and_then(ParamValue::as_str)
    }

    pub fn body_param(&self, name: &str) -> Option<&str> {
        self.post.get(name).and_then(ParamValue::as_str)
    }

    pub fn is_ajax(&self) -> bool {
        self.header("x-requested-with") == Some("XMLHttpRequest")
    }

    pub fn is_pjax(&self) -> bool {
        self.is_ajax() && self.header("x-pjax").is_some()
    }

    pub fn is_secure_connection(&self) -> bool {
        self.header("x-forwarded-proto") == Some("https")
    }

    pub fn user_ip(&self) -> Option<&str> {
        self.server.get("remote_addr").map(String::as_str)
    }

    pub fn server_port(&self) -> u16 {
        self.server
            .get("server_port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(80)
    }

    ///
    /// Automatically apply a serde deserialization to the body
    ///
    pub fn body_as<T>(&self) -> serde_json::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<HTTP Request {} {}>", self.method(), self.url())
    }
}

///
/// Anything a transport can turn into a `Request`. The lifecycle never sees
/// transport types, only the `Request` this produces.
///
#[async_trait]
pub trait RequestSource {
    async fn into_request(self) -> io::Result<Request>;
}

#[async_trait]
impl RequestSource for Request {
    async fn into_request(self) -> io::Result<Request> {
        Ok(self)
    }
}

#[async_trait]
impl RequestSource for BytesMut {
    async fn into_request(self) -> io::Result<Request> {
        let mut buf = self;

        decode(&mut buf)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "incomplete http request")
        })
    }
}

/// Largest body `decode` accepts.
pub const DEFAULT_MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

///
/// Decode a raw HTTP/1.x request. Returns `Ok(None)` while the buffer does not
/// yet hold the full head and body.
///
pub fn decode(buf: &mut BytesMut) -> io::Result<Option<Request>> {
    decode_with_limit(buf, DEFAULT_MAX_BODY_SIZE)
}

///
/// `decode`, refusing any request whose `Content-Length` is malformed or
/// above `max_body_size` before its body is buffered.
///
pub fn decode_with_limit(buf: &mut BytesMut, max_body_size: usize) -> io::Result<Option<Request>> {
    let (request, amt, body_len) = {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut r = httparse::Request::new(&mut headers);
        let status = r.parse(buf).map_err(|e| {
            let msg = format!("failed to parse http request: {:?}", e);
            io::Error::new(io::ErrorKind::InvalidData, msg)
        })?;
        let amt = match status {
            httparse::Status::Complete(amt) => amt,
            httparse::Status::Partial => return Ok(None),
        };

        let method = r.method.unwrap_or("GET");
        let path = r.path.unwrap_or("/");
        let version = r.version.unwrap_or(1);

        let mut request = Request::new(method, path).with_server(
            "server_protocol",
            if version == 0 { "HTTP/1.0" } else { "HTTP/1.1" },
        );
        let mut body_len: usize = 0;

        for header in r.headers.iter() {
            let value = str::from_utf8(header.value).unwrap_or("");

            if header.name.eq_ignore_ascii_case("content-length") {
                body_len = value.trim().parse::<usize>().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "invalid content-length")
                })?;
                if body_len > max_body_size {
                    let msg = format!("request body of {} bytes exceeds {}", body_len, max_body_size);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, msg));
                }
            }

            request = request.with_header(header.name, value);
        }

        (request, amt, body_len)
    };

    let total = amt
        .checked_add(body_len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "content-length overflow"))?;
    if total > buf.len() {
        return Ok(None);
    }

    let data = buf.split_to(total).freeze();

    Ok(Some(request.with_body(data.slice(amt..total))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn it_should_decode_a_get_with_headers_and_cookies() {
        let raw = "GET /site/index?page=2&tags[]=a&tags[]=b HTTP/1.1\r\nHost: localhost\r\nCookie: a=1; b=two\r\nX-Requested-With: XMLHttpRequest\r\n\r\n";
        let mut bytes = BytesMut::with_capacity(raw.len());
        bytes.put(raw.as_bytes());

        let request = decode(&mut bytes).unwrap().unwrap();

        assert_eq!(request.method(), "GET");
        assert_eq!(request.path(), "/site/index");
        assert_eq!(request.query_param("page"), Some("2"));
        assert_eq!(
            request.query.get("tags"),
            Some(&ParamValue::List(vec!["a".to_owned(), "b".to_owned()]))
        );
        assert_eq!(request.cookie("b"), Some("two"));
        assert_eq!(request.header("HOST"), Some("localhost"));
        assert!(request.is_ajax());
        assert!(!request.is_pjax());
    }

    #[test]
    fn it_should_wait_for_the_whole_body() {
        let raw = "POST /form HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        let mut bytes = BytesMut::from(raw.as_bytes());

        assert!(decode(&mut bytes).unwrap().is_none());
    }

    #[test]
    fn it_should_reject_a_content_length_past_the_address_space() {
        let raw = "POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\nabc";
        let mut bytes = BytesMut::from(raw.as_bytes());

        let err = decode(&mut bytes).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn it_should_reject_bodies_over_the_limit() {
        let raw = "POST /upload HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world";
        let mut bytes = BytesMut::from(raw.as_bytes());

        let err = decode_with_limit(&mut bytes, 10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut bytes = BytesMut::from(raw.as_bytes());
        let request = decode_with_limit(&mut bytes, 11).unwrap().unwrap();
        assert_eq!(request.raw_body(), b"hello world");
    }

    #[test]
    fn it_should_reject_a_malformed_content_length() {
        let raw = "POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n";
        let mut bytes = BytesMut::from(raw.as_bytes());

        assert!(decode(&mut bytes).is_err());
    }

    #[test]
    fn it_should_parse_urlencoded_post_bodies() {
        let raw = "POST /form HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 17\r\n\r\nname=Jo+Doe&x=%41";
        let mut bytes = BytesMut::from(raw.as_bytes());

        let request = decode(&mut bytes).unwrap().unwrap();

        assert_eq!(request.body_param("name"), Some("Jo Doe"));
        assert_eq!(request.body_param("x"), Some("A"));
        assert_eq!(request.raw_body(), b"name=Jo+Doe&x=%41");
    }

    #[test]
    fn it_should_hide_the_body_of_a_get() {
        let request = Request::new("get", "/").with_body("ignored");

        assert!(request.raw_body().is_empty());
        assert_eq!(request.method(), "GET");
    }
}
