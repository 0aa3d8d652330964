//! Minimal HTTP/1.1 over a single session: one request, one response, close.

use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::debug;
use url::{Host, Url};

use crate::config::Config;
use crate::error::{Result, TunnelError};
use crate::headers::{has_line_break, HeaderList};
use crate::proxy::host_port;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;
const BODY_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Where a request goes, derived from its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`
    pub path: String,
}

impl Target {
    pub fn parse(url: &str) -> Result<Self> {
        let parsed =
            Url::parse(url).map_err(|e| TunnelError::Url(format!("{:?}: {}", url, e)))?;

        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(TunnelError::Url(format!(
                    "unsupported scheme {:?} in {:?}",
                    other, url
                )))
            }
        };

        let host = match parsed.host() {
            Some(Host::Domain(d)) => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(TunnelError::Url(format!("{:?} has no host", url))),
        };

        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| TunnelError::Url(format!("{:?} has no port", url)))?;

        let mut path = parsed.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    pub fn use_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// `Host` header value; the port is omitted when it is the scheme default.
    pub fn host_header(&self) -> String {
        let default_port = match self.scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        };
        if self.port == default_port {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            host_port(&self.host, self.port)
        }
    }
}

/// Where a response body ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Memory,
    /// Created or truncated; device paths such as `/dev/stdout` work too
    File(PathBuf),
}

impl OutputTarget {
    /// `""` and `"-"` mean memory, anything else is a path.
    pub fn parse(s: &str) -> Self {
        match s {
            "" | "-" => OutputTarget::Memory,
            path => OutputTarget::File(PathBuf::from(path)),
        }
    }
}

impl From<&str> for OutputTarget {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<Option<&str>> for OutputTarget {
    fn from(s: Option<&str>) -> Self {
        s.map(Self::parse).unwrap_or(OutputTarget::Memory)
    }
}

/// Upper-cases the method; an empty method means GET.
pub fn normalize_method(method: &str) -> String {
    if method.is_empty() {
        "GET".to_string()
    } else {
        method.to_ascii_uppercase()
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    url: String,
    headers: HeaderList,
    body: Option<Vec<u8>>,
    allow_insecure_tls: bool,
}

impl Request {
    pub fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            method: normalize_method(method),
            url: url.into(),
            headers: HeaderList::new(),
            body: None,
            allow_insecure_tls: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new("POST", url).with_body(body)
    }

    pub fn with_headers(mut self, headers: HeaderList) -> Self {
        self.headers = headers;
        self
    }

    /// Parses `key=value;key=value`; an empty spec adds nothing.
    pub fn with_header_spec(self, spec: &str) -> Result<Self> {
        let headers = HeaderList::parse(spec)?;
        Ok(self.with_headers(headers))
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Skip certificate and hostname checks for this request only.
    pub fn allow_insecure_tls(mut self) -> Self {
        self.allow_insecure_tls = true;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn insecure_tls(&self) -> bool {
        self.allow_insecure_tls
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// Status line and headers as received, including the blank line
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub head: ResponseHead,
    pub body: Vec<u8>,
}

impl Response {
    pub fn status(&self) -> u16 {
        self.head.status
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// On a decode failure the error carries `"<status>: <body>"`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|_| TunnelError::Json(format!("{}: {}", self.status(), self.text())))
    }
}

#[derive(Debug, Clone)]
pub enum Fetched {
    Buffered(Response),
    Written {
        head: ResponseHead,
        path: PathBuf,
        bytes: u64,
    },
}

impl Fetched {
    pub fn head(&self) -> &ResponseHead {
        match self {
            Fetched::Buffered(response) => &response.head,
            Fetched::Written { head, .. } => head,
        }
    }

    pub fn status(&self) -> u16 {
        self.head().status
    }

    pub fn into_head(self) -> ResponseHead {
        match self {
            Fetched::Buffered(response) => response.head,
            Fetched::Written { head, .. } => head,
        }
    }
}

/// Serializes the request line, headers and body.
///
/// Order: `Host`, `User-Agent`, configured default headers, request headers,
/// `Authorization`, `Content-Length`, `Connection: close`. Custom `Host` and
/// `User-Agent` entries are dropped in favor of the derived values.
pub(crate) fn encode_request(request: &Request, target: &Target, config: &Config) -> Result<Vec<u8>> {
    let method = request.method();
    if !method
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(TunnelError::Config(format!("invalid HTTP method {:?}", method)));
    }

    if has_line_break(config.user_agent()) {
        return Err(TunnelError::Config(format!(
            "invalid User-Agent {:?}: contains a line break",
            config.user_agent()
        )));
    }

    let mut head = format!("{} {} HTTP/1.1\r\n", method, target.path);
    push_header(&mut head, "Host", &target.host_header());
    push_header(&mut head, "User-Agent", config.user_agent());

    for (key, value) in config.headers.iter().chain(request.headers().iter()) {
        if key.eq_ignore_ascii_case("host") || key.eq_ignore_ascii_case("user-agent") {
            debug!("Dropping custom {} header", key);
            continue;
        }
        push_header(&mut head, key, value);
    }

    if let Some(auth) = &config.basic_auth {
        let token = STANDARD.encode(format!("{}:{}", auth.user, auth.password));
        push_header(&mut head, "Authorization", &format!("Basic {}", token));
    }
    if let Some(body) = request.body() {
        push_header(&mut head, "Content-Length", &body.len().to_string());
    }
    push_header(&mut head, "Connection", "close");
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    if let Some(body) = request.body() {
        out.extend_from_slice(body);
    }
    Ok(out)
}

fn push_header(head: &mut String, key: &str, value: &str) {
    head.push_str(key);
    head.push_str(": ");
    head.push_str(value);
    head.push_str("\r\n");
}

pub(crate) async fn send_request<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    stream
        .write_all(bytes)
        .await
        .map_err(|e| TunnelError::Io(format!("sending request failed: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| TunnelError::Io(format!("flushing request failed: {}", e)))
}

/// Reads until the blank line ending the headers. Returns the parsed head and
/// whatever body bytes arrived in the same reads.
pub(crate) async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<(ResponseHead, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| TunnelError::Io(format!("reading response failed: {}", e)))?;
        if n == 0 {
            return Err(TunnelError::Response(if buf.is_empty() {
                "connection closed before any response".to_string()
            } else {
                "connection closed inside the response headers".to_string()
            }));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((head, len)) = parse_head(&buf)? {
            let leftover = buf.split_off(len);
            return Ok((head, leftover));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(TunnelError::Response(format!(
                "headers exceed {} bytes",
                MAX_HEAD_BYTES
            )));
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);

    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let head = ResponseHead {
                status: parsed.code.unwrap_or(0),
                reason: parsed.reason.unwrap_or("").to_string(),
                headers: parsed
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect(),
                raw: buf[..len].to_vec(),
            };
            Ok(Some((head, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(TunnelError::Response(e.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

pub(crate) fn framing(method: &str, head: &ResponseHead) -> Result<Framing> {
    if method == "HEAD"
        || (100..200).contains(&head.status)
        || head.status == 204
        || head.status == 304
    {
        return Ok(Framing::Empty);
    }

    if let Some(encoding) = head.header("transfer-encoding") {
        if encoding.to_ascii_lowercase().contains("chunked") {
            return Ok(Framing::Chunked);
        }
    }

    if let Some(length) = head.header("content-length") {
        let length = length.trim().parse::<u64>().map_err(|_| {
            TunnelError::Response(format!("invalid Content-Length {:?}", length))
        })?;
        return Ok(Framing::Length(length));
    }

    Ok(Framing::UntilClose)
}

/// Failure while moving body bytes, split by side so the caller can tell a
/// network problem from an output-target problem.
#[derive(Debug)]
pub(crate) enum BodyError {
    Read(TunnelError),
    Write(io::Error),
}

impl BodyError {
    pub fn into_error(self, output: &Path) -> TunnelError {
        match self {
            BodyError::Read(e) => e,
            BodyError::Write(e) => TunnelError::Output {
                path: output.display().to_string(),
                reason: e.to_string(),
            },
        }
    }
}

/// Copies the body into `sink` according to `framing`, starting with the
/// bytes already read alongside the head.
pub(crate) async fn read_body<S, W>(
    stream: &mut S,
    leftover: Vec<u8>,
    framing: Framing,
    sink: &mut W,
) -> std::result::Result<u64, BodyError>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(Cursor::new(leftover).chain(stream));

    match framing {
        Framing::Empty => Ok(0),
        Framing::Length(length) => {
            let copied = pump(&mut (&mut reader).take(length), sink).await?;
            if copied < length {
                return Err(truncated(length, copied));
            }
            Ok(copied)
        }
        Framing::UntilClose => pump(&mut reader, sink).await,
        Framing::Chunked => read_chunked(&mut reader, sink).await,
    }
}

async fn read_chunked<R, W>(reader: &mut R, sink: &mut W) -> std::result::Result<u64, BodyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = String::new();

    loop {
        read_line(reader, &mut line).await?;
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_field, 16).map_err(|_| {
            BodyError::Read(TunnelError::Response(format!(
                "invalid chunk size {:?}",
                size_field
            )))
        })?;

        if size == 0 {
            // trailers, up to the terminating blank line
            loop {
                let n = read_line(reader, &mut line).await?;
                if n == 0 || line.trim().is_empty() {
                    return Ok(total);
                }
            }
        }

        let copied = pump(&mut (&mut *reader).take(size), sink).await?;
        if copied < size {
            return Err(truncated(size, copied));
        }
        total += copied;

        read_line(reader, &mut line).await?;
        if !line.trim().is_empty() {
            return Err(BodyError::Read(TunnelError::Response(
                "missing CRLF after chunk".to_string(),
            )));
        }
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &mut String,
) -> std::result::Result<usize, BodyError> {
    line.clear();
    let n = reader.read_line(line).await.map_err(|e| {
        BodyError::Read(TunnelError::Io(format!("reading chunked body failed: {}", e)))
    })?;
    if n == 0 && line.is_empty() {
        return Err(BodyError::Read(TunnelError::Response(
            "connection closed inside chunked body".to_string(),
        )));
    }
    Ok(n)
}

async fn pump<R, W>(reader: &mut R, sink: &mut W) -> std::result::Result<u64, BodyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BODY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await.map_err(|e| {
            BodyError::Read(TunnelError::Io(format!("reading response body failed: {}", e)))
        })?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).await.map_err(BodyError::Write)?;
        total += n as u64;
    }
    sink.flush().await.map_err(BodyError::Write)?;
    Ok(total)
}

fn truncated(expected: u64, got: u64) -> BodyError {
    BodyError::Read(TunnelError::Response(format!(
        "body truncated: expected {} bytes, got {}",
        expected, got
    )))
}

/// Joins URL or path segments with `/`, collapsing duplicate separators.
///
/// `join_url(&["https://", "api.example.com", "v1"])` and
/// `join_url(&["https://api.example.com", "v1"])` both give
/// `https://api.example.com/v1`; without a scheme the result is a plain path.
pub fn join_url(parts: &[&str]) -> Result<String> {
    match parts {
        [] => return Ok(String::new()),
        [only] => return Ok(only.to_string()),
        _ => {}
    }

    if !parts[0].contains("://") {
        return Ok(join_path(parts.iter().copied()));
    }

    let (base, rest) = if parts[0].ends_with("://") {
        (format!("{}{}", parts[0], parts[1]), &parts[2..])
    } else {
        (parts[0].to_string(), &parts[1..])
    };

    let mut url =
        Url::parse(&base).map_err(|e| TunnelError::Url(format!("{:?}: {}", base, e)))?;
    let path = join_path(std::iter::once(url.path()).chain(rest.iter().copied()));
    url.set_path(&path);
    Ok(url.to_string())
}

fn join_path<'a>(segments: impl Iterator<Item = &'a str>) -> String {
    let mut absolute = None;
    let mut parts: Vec<&str> = Vec::new();
    for segment in segments {
        if absolute.is_none() {
            absolute = Some(segment.starts_with('/'));
        }
        for piece in segment.split('/') {
            match piece {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                piece => parts.push(piece),
            }
        }
    }
    let joined = parts.join("/");
    if absolute.unwrap_or(false) {
        format!("/{}", joined)
    } else {
        joined
    }
}
