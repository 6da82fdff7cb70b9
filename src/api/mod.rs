use crate::config::ApiSettings;
use crate::distribute::FrameDistributor;
use crate::frame::{placeholder_frame, EncodedFrame};
use crate::state::LotRegistry;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const STREAM_BOUNDARY: &str = "frame";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Concurrent live-stream viewers across all sources.
    pub max_viewers: usize,
    /// How long a stream waits for a fresh frame before sending the placeholder.
    pub stream_wait: Duration,
    pub write_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            max_viewers: 16,
            stream_wait: Duration::from_millis(500),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ApiSettings> for ApiConfig {
    fn from(settings: &ApiSettings) -> Self {
        Self {
            addr: settings.addr.clone(),
            max_viewers: settings.max_viewers,
            stream_wait: settings.stream_wait,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Open streams end within one stream wait.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    registry: Arc<LotRegistry>,
    distributors: BTreeMap<String, Arc<FrameDistributor>>,
}

struct Shared {
    cfg: ApiConfig,
    registry: Arc<LotRegistry>,
    distributors: BTreeMap<String, Arc<FrameDistributor>>,
    placeholder: EncodedFrame,
    viewers: AtomicUsize,
    shutdown: Arc<AtomicBool>,
}

impl Shared {
    /// Map a `lot` query value to a configured source id. The dashboard sends bare
    /// lot numbers, so `1` resolves to `lot1` unless a source is literally named `1`.
    fn resolve_lot(&self, lot: &str) -> Option<String> {
        if self.distributors.contains_key(lot) {
            return Some(lot.to_string());
        }
        let numbered = format!("lot{}", lot);
        self.distributors.contains_key(&numbered).then_some(numbered)
    }
}

impl ApiServer {
    pub fn new(
        cfg: ApiConfig,
        registry: Arc<LotRegistry>,
        distributors: BTreeMap<String, Arc<FrameDistributor>>,
    ) -> Self {
        Self {
            cfg,
            registry,
            distributors,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared {
            cfg: self.cfg,
            registry: self.registry,
            distributors: self.distributors,
            placeholder: placeholder_frame()?,
            viewers: AtomicUsize::new(0),
            shutdown: shutdown.clone(),
        });
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, shared) {
                log::error!("parking api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, shared: Arc<Shared>) -> Result<()> {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &shared) {
                        log::debug!("parking api connection ended: {}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(shared.cfg.write_timeout))?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    match request.path.as_str() {
        "/health" => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        "/api/parking-data" => {
            let payload = serde_json::to_vec(&shared.registry.overview())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        "/api/parking-details" => {
            let Some(state) = request
                .query_param("lot")
                .and_then(|lot| shared.resolve_lot(lot))
                .and_then(|lot| shared.registry.get(&lot))
            else {
                return write_json_response(&mut stream, 400, r#"{"error":"invalid_lot"}"#);
            };
            let payload = serde_json::to_vec(state.as_ref())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        "/api/video-stream" => {
            let Some((lot, distributor)) = request
                .query_param("lot")
                .and_then(|lot| shared.resolve_lot(lot))
                .and_then(|lot| shared.distributors.get_key_value(lot.as_str()))
            else {
                return write_json_response(&mut stream, 400, r#"{"error":"invalid_lot"}"#);
            };
            let Some(_slot) = ViewerSlot::acquire(&shared.viewers, shared.cfg.max_viewers) else {
                log::warn!("parking api: viewer limit {} reached", shared.cfg.max_viewers);
                return write_json_response(&mut stream, 503, r#"{"error":"too_many_viewers"}"#);
            };
            log::info!("viewer {} attached to {}", peer, lot);
            let result = stream_frames(&mut stream, distributor, shared);
            log::info!("viewer {} detached from {}", peer, lot);
            result
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

/// Multipart JPEG stream. Runs until the viewer goes away or the server stops.
fn stream_frames(
    stream: &mut TcpStream,
    distributor: &FrameDistributor,
    shared: &Shared,
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        STREAM_BOUNDARY
    );
    stream.write_all(header.as_bytes())?;

    let subscription = distributor.subscribe();
    while !shared.shutdown.load(Ordering::SeqCst) {
        let frame = subscription
            .take(shared.cfg.stream_wait)
            .unwrap_or_else(|| shared.placeholder.clone());
        write_part(stream, &frame)?;
    }
    Ok(())
}

fn write_part(stream: &mut TcpStream, frame: &EncodedFrame) -> Result<()> {
    let part_header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        STREAM_BOUNDARY,
        frame.len()
    );
    stream.write_all(part_header.as_bytes())?;
    stream.write_all(frame.bytes())?;
    stream.write_all(b"\r\n")?;
    stream.flush()?;
    Ok(())
}

/// Counted stream slot, released on drop.
struct ViewerSlot<'a> {
    viewers: &'a AtomicUsize,
}

impl<'a> ViewerSlot<'a> {
    fn acquire(viewers: &'a AtomicUsize, limit: usize) -> Option<Self> {
        viewers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < limit).then_some(current + 1)
            })
            .ok()
            .map(|_| Self { viewers })
    }
}

impl Drop for ViewerSlot<'_> {
    fn drop(&mut self) {
        self.viewers.fetch_sub(1, Ordering::SeqCst);
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    HttpRequest::parse(&String::from_utf8_lossy(&data))
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: Option<String>,
}

impl HttpRequest {
    fn parse(text: &str) -> Result<Self> {
        let request_line = text
            .split("\r\n")
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| anyhow!("empty request"))?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
        let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (raw_path, None),
        };
        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            query,
        })
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .as_deref()?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}
