//! Local HTTP/1.1 server standing in for CDN mirrors and the save storage service.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const SAVESYNC_PREFIX: &str = "/api/v1/access/egstore/savesync/";

#[derive(Default)]
struct ServerState {
    /// Static GET responses by path.
    routes: HashMap<String, Vec<u8>>,
    /// Path prefixes answered with a fixed status.
    failing_prefixes: Vec<(String, u16)>,
    /// Stored objects by key (`{account}/{app}/{name}`).
    blobs: BTreeMap<String, Vec<u8>>,
    modified: HashMap<String, String>,
    modified_default: String,
    /// PUTs whose key contains this are rejected with 500.
    reject_puts_containing: Option<String>,
    /// `METHOD path` of every request, in arrival order.
    log: Vec<String>,
}

#[derive(Clone)]
pub struct TestServer {
    pub addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ServerState {
            modified_default: "2024-01-01T00:00:00.000Z".to_string(),
            ..ServerState::default()
        }));

        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = handle(stream, state, addr).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn serve(&self, path: &str, body: Vec<u8>) {
        self.state.lock().unwrap().routes.insert(path.to_string(), body);
    }

    pub fn fail_prefix(&self, prefix: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .failing_prefixes
            .push((prefix.to_string(), status));
    }

    pub fn reject_puts_containing(&self, pattern: &str) {
        self.state.lock().unwrap().reject_puts_containing = Some(pattern.to_string());
    }

    /// `lastModified` reported for objects stored from now on.
    pub fn set_upload_time(&self, timestamp: &str) {
        self.state.lock().unwrap().modified_default = timestamp.to_string();
    }

    pub fn put_blob(&self, key: &str, data: Vec<u8>, last_modified: &str) {
        let mut state = self.state.lock().unwrap();
        state.blobs.insert(key.to_string(), data);
        state.modified.insert(key.to_string(), last_modified.to_string());
    }

    pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().blobs.get(key).cloned()
    }

    pub fn blob_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().blobs.keys().cloned().collect()
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn count_requests(&self, prefix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.split(' ').nth(1).map_or(false, |p| p.starts_with(prefix)))
            .count()
    }
}

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

async fn read_request(stream: &mut BufReader<TcpStream>) -> std::io::Result<Option<Request>> {
    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default();
    let path = target.split('?').next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        stream.read_line(&mut header).await?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).await?;
    Ok(Some(Request { method, path, body }))
}

async fn handle(
    stream: TcpStream,
    state: Arc<Mutex<ServerState>>,
    addr: SocketAddr,
) -> std::io::Result<()> {
    let mut stream = BufReader::new(stream);
    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };
    let (status, content_type, body) = respond(&request, &state, addr);

    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Status",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        content_type,
        body.len()
    );
    let stream = stream.get_mut();
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    stream.shutdown().await
}

fn respond(
    request: &Request,
    state: &Mutex<ServerState>,
    addr: SocketAddr,
) -> (u16, &'static str, Vec<u8>) {
    let mut state = state.lock().unwrap();
    state.log.push(format!("{} {}", request.method, request.path));

    if let Some((_, status)) = state
        .failing_prefixes
        .iter()
        .find(|(prefix, _)| request.path.starts_with(prefix.as_str()))
    {
        return (*status, "text/plain", b"failure".to_vec());
    }

    if let Some(scope) = request.path.strip_prefix(SAVESYNC_PREFIX) {
        let scope = scope.trim_end_matches('/').to_string();
        return match request.method.as_str() {
            "GET" => (200, "application/json", listing(&state, &scope, addr)),
            "POST" => (200, "application/json", write_links(&request.body, &scope, addr)),
            _ => (404, "text/plain", Vec::new()),
        };
    }

    if let Some(key) = request.path.strip_prefix("/blob/") {
        let key = key.to_string();
        return match request.method.as_str() {
            "PUT" => {
                if let Some(pattern) = &state.reject_puts_containing {
                    if key.contains(pattern.as_str()) {
                        return (500, "text/plain", b"rejected".to_vec());
                    }
                }
                let modified = state.modified_default.clone();
                state.blobs.insert(key.clone(), request.body.clone());
                state.modified.insert(key, modified);
                (200, "text/plain", Vec::new())
            }
            "GET" => match state.blobs.get(&key) {
                Some(data) => (200, "application/octet-stream", data.clone()),
                None => (404, "text/plain", Vec::new()),
            },
            _ => (404, "text/plain", Vec::new()),
        };
    }

    match state.routes.get(&request.path) {
        Some(body) if request.method == "GET" => (200, "application/octet-stream", body.clone()),
        _ => (404, "text/plain", Vec::new()),
    }
}

fn listing(state: &ServerState, scope: &str, addr: SocketAddr) -> Vec<u8> {
    let prefix = format!("{}/", scope);
    let mut files = serde_json::Map::new();
    for (key, data) in state.blobs.range(prefix.clone()..) {
        if !key.starts_with(&prefix) {
            break;
        }
        let modified = state
            .modified
            .get(key)
            .cloned()
            .unwrap_or_else(|| state.modified_default.clone());
        files.insert(
            key.clone(),
            serde_json::json!({
                "hash": format!("{}", data.len()),
                "lastModified": modified,
                "readLink": format!("http://{}/blob/{}", addr, key),
            }),
        );
    }
    serde_json::to_vec(&serde_json::json!({ "files": files })).unwrap()
}

fn write_links(body: &[u8], scope: &str, addr: SocketAddr) -> Vec<u8> {
    let request: serde_json::Value = serde_json::from_slice(body).unwrap_or_default();
    let mut files = serde_json::Map::new();
    if let Some(names) = request["files"].as_array() {
        for name in names.iter().filter_map(|n| n.as_str()) {
            files.insert(
                name.to_string(),
                serde_json::json!({
                    "writeLink": format!("http://{}/blob/{}/{}", addr, scope, name),
                }),
            );
        }
    }
    serde_json::to_vec(&serde_json::json!({ "files": files })).unwrap()
}

/// Writes `data` to `root/relative`, creating parents.
pub fn write_file(root: &Path, relative: &str, data: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

/// Every file under `root` as relative path to contents.
pub fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let rel = chunksync::packager::relative_path(root, entry.path()).unwrap();
            out.insert(rel, std::fs::read(entry.path()).unwrap());
        }
    }
    out
}
