//! Minimal HTTP/1.1 handling for the configuration UI: one request per connection, Basic
//! auth, prefix routing and `Connection: close` responses.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::{ConfigError, DeviceConfig},
    hal::{Platform, WebConnection},
    supervisor::Guard,
    types::StatusEnvelope,
};

pub const WEB_PORT: u16 = 80;
pub const LINE_CAPACITY: usize = 100;
pub const CREDENTIAL_CAPACITY: usize = 31;
pub const CLIENT_IDLE_MS: u32 = 250;
pub const MAX_FORM_BODY: usize = 4096;
pub const FAVICON_CHUNK_BYTES: usize = 48;

const HOME_HTML: &str = include_str!("../assets/index.html");
const DEVICE_HTML: &str = include_str!("../assets/device.html");
const AUTH_HTML: &str = include_str!("../assets/auth.html");
const NOT_FOUND_HTML: &str = include_str!("../assets/not_found.html");
const STYLE_CSS: &str = include_str!("../assets/style.css");
const FAVICON: &[u8] = include_bytes!("../assets/favicon.ico");

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("listener unavailable: {0}")]
    Listen(String),
    #[error("write to peer failed: {0}")]
    Write(String),
    #[error("serial bus unavailable: {0}")]
    SerialBus(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Fixed-capacity header line. Once full, each further byte overwrites the last slot.
#[derive(Debug, Clone)]
pub struct LineBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, byte: u8) {
        if self.bytes.len() < self.capacity {
            self.bytes.push(byte);
        } else if let Some(last) = self.bytes.last_mut() {
            *last = byte;
        }
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Style,
    Form,
    Publish,
    Config,
    Data,
    Device,
    Home,
    Favicon,
    NotFound,
}

impl Route {
    const TABLE: [(&'static str, Route); 8] = [
        ("GET /style.css", Route::Style),
        ("POST /form", Route::Form),
        ("GET /publish ", Route::Publish),
        ("GET /config ", Route::Config),
        ("GET /data ", Route::Data),
        ("GET /device ", Route::Device),
        ("GET / ", Route::Home),
        ("GET /favicon.ico", Route::Favicon),
    ];

    /// First prefix of the route table that `request_line` starts with.
    pub fn match_request(request_line: &str) -> Self {
        Self::TABLE
            .iter()
            .find(|(prefix, _)| request_line.starts_with(prefix))
            .map_or(Route::NotFound, |(_, route)| *route)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub route: Route,
    pub authorized: bool,
    pub body: Vec<u8>,
}

/// The base64 token a client must present for `user:password`.
pub fn expected_credentials(user: &str, password: &str) -> String {
    let pair = format!("{user}:{password}");
    let bytes = &pair.as_bytes()[..pair.len().min(CREDENTIAL_CAPACITY)];
    STANDARD.encode(bytes)
}

/// Next byte from the peer, polling in 1 ms steps for up to [`CLIENT_IDLE_MS`]. `None` means
/// the peer went idle.
fn next_byte<C, P, G>(conn: &mut C, platform: &mut P, guard: &mut G) -> Option<u8>
where
    C: WebConnection + ?Sized,
    P: Platform + ?Sized,
    G: Guard + ?Sized,
{
    if let Some(byte) = conn.read_byte() {
        return Some(byte);
    }
    for _ in 0..CLIENT_IDLE_MS {
        platform.delay_ms(1);
        guard.kick();
        if let Some(byte) = conn.read_byte() {
            return Some(byte);
        }
        if !conn.is_connected() {
            return None;
        }
    }
    None
}

fn content_length(line: &str) -> Option<usize> {
    let (name, value) = line.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

/// Reads one request up to the blank line, plus the body of an authorized form post.
/// Returns `None` when the peer goes idle before the headers end.
pub fn read_request<C, P, G>(
    conn: &mut C,
    platform: &mut P,
    guard: &mut G,
    credentials: &str,
) -> Option<Request>
where
    C: WebConnection + ?Sized,
    P: Platform + ?Sized,
    G: Guard + ?Sized,
{
    let mut line = LineBuffer::new(LINE_CAPACITY);
    let mut request_line = None;
    let mut authorized = false;
    let mut blank = true;
    let mut length = None;

    loop {
        let byte = next_byte(conn, platform, guard)?;
        match byte {
            b'\n' if blank => break,
            b'\n' => {
                blank = true;
                let text = line.text();
                if text.contains("Authorization: Basic ") && text.contains(credentials) {
                    authorized = true;
                }
                if text.contains("GET /") || text.contains("POST /") {
                    request_line = Some(text.clone());
                }
                if let Some(value) = content_length(&text) {
                    length = Some(value);
                }
                line.clear();
            }
            b'\r' => {}
            other => {
                blank = false;
                line.push(other);
            }
        }
    }

    let route = request_line
        .as_deref()
        .map_or(Route::NotFound, Route::match_request);
    debug!("request {:?} -> {route:?}", request_line.unwrap_or_default());

    let mut body = Vec::new();
    if authorized && route == Route::Form {
        let limit = length.map_or(MAX_FORM_BODY, |len| len.min(MAX_FORM_BODY));
        while body.len() < limit {
            match next_byte(conn, platform, guard) {
                Some(byte) => body.push(byte),
                None => break,
            }
        }
    }

    Some(Request {
        route,
        authorized,
        body,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    Static(&'static str),
    Binary(&'static [u8]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: &'static str,
    pub content_type: &'static str,
    pub challenge: bool,
    pub body: Body,
}

impl Response {
    fn ok(content_type: &'static str, body: Body) -> Self {
        Self {
            status: "HTTP/1.1 200 OK",
            content_type,
            challenge: false,
            body,
        }
    }

    pub fn home() -> Self {
        Self::ok("text/html", Body::Static(HOME_HTML))
    }

    pub fn device() -> Self {
        Self::ok("text/html", Body::Static(DEVICE_HTML))
    }

    pub fn style() -> Self {
        Self::ok("text/css", Body::Static(STYLE_CSS))
    }

    pub fn favicon() -> Self {
        Self::ok("image/x-icon", Body::Binary(FAVICON))
    }

    pub fn json(body: String) -> Self {
        Self::ok("application/json", Body::Text(body))
    }

    pub fn envelope(envelope: &StatusEnvelope) -> Self {
        Self::json(envelope_json(envelope))
    }

    pub fn unauthorized() -> Self {
        Self {
            status: "HTTP/1.1 401 Authorization Required",
            content_type: "text/html",
            challenge: true,
            body: Body::Static(AUTH_HTML),
        }
    }

    pub fn forbidden(envelope: &StatusEnvelope) -> Self {
        Self {
            status: "HTTP/1.1 403 FORBIDDEN",
            content_type: "application/json",
            challenge: false,
            body: Body::Text(envelope_json(envelope)),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: "HTTP/1.1 404 Not Found",
            content_type: "text/html",
            challenge: false,
            body: Body::Static(NOT_FOUND_HTML),
        }
    }

    pub fn write_to<C: WebConnection + ?Sized>(&self, conn: &mut C) -> Result<(), TransportError> {
        let mut head = format!("{}\r\n", self.status);
        if self.challenge {
            head.push_str("WWW-Authenticate: Basic realm=\"Secure Area\"\r\n");
        }
        head.push_str(&format!(
            "Content-Type: {}\r\nConnection: close\r\n\r\n",
            self.content_type
        ));
        conn.write_all(head.as_bytes())?;

        match &self.body {
            Body::Binary(bytes) => {
                for chunk in bytes.chunks(FAVICON_CHUNK_BYTES) {
                    conn.write_all(chunk)?;
                }
            }
            Body::Static(text) => {
                conn.write_all(text.as_bytes())?;
                conn.write_all(b"\r\n")?;
            }
            Body::Text(text) => {
                conn.write_all(text.as_bytes())?;
                conn.write_all(b"\r\n")?;
            }
        }
        Ok(())
    }
}

fn envelope_json(envelope: &StatusEnvelope) -> String {
    serde_json::to_string(envelope).unwrap_or_default()
}

/// Builds the configuration a form submission asks for without touching `current`.
/// Secrets submitted empty keep their stored value.
pub fn apply_form(current: &DeviceConfig, body: &[u8]) -> Result<DeviceConfig, ConfigError> {
    info!("parsing received configuration");
    let mut updated = current.clone();
    updated.apply_json(body)?;
    updated.validate_identity()?;

    if updated.device_password.is_empty() {
        debug!("keeping previous device password");
        updated.device_password = current.device_password.clone();
    }
    updated.set_time_offset(updated.time_offset());
    if updated.network.password.is_empty() {
        debug!("keeping previous wifi password");
        updated.network.password = current.network.password.clone();
    }
    if updated.broker.password.is_empty() {
        debug!("keeping previous broker password");
        updated.broker.password = current.broker.password.clone();
    }
    Ok(updated)
}

/// Writes `response` and logs, rather than returns, a failed write: the peer is gone either way.
pub fn send<C: WebConnection + ?Sized>(conn: &mut C, response: &Response) {
    if let Err(err) = response.write_to(conn) {
        warn!("web response not sent: {err}");
    }
}
