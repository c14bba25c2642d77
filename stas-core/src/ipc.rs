//! Local status/control surface: newline-delimited JSON over a Unix domain
//! socket, standing in for the original's D-Bus interface (no D-Bus binding
//! is part of the grounding pack). Exposes the same method/property/signal
//! set documented for the daemons: `tron`, `log_level`, `process_info`,
//! `controller_info`, `list_controllers`, and (stafd only) `get_log_pages`/
//! `get_all_log_pages`/`log_pages_changed`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, warn};

use crate::error::{self, IpcError};
use crate::registry::Registry;
use crate::tid::Tid;

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub struct IpcState {
    pub tron: AtomicBool,
    pub registry: Registry,
    pub prog_name: String,
    pub pid: u32,
    /// `get_log_pages`/`get_all_log_pages` only make sense on stafd, where
    /// controllers are Discovery Controllers with a cached log page.
    pub supports_log_pages: bool,
}

pub struct IpcServer {
    path: PathBuf,
}

impl IpcServer {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub async fn serve(&self, state: Arc<IpcState>) -> Result<(), IpcError> {
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path).context(error::BindSnafu {
            path: self.path.to_string_lossy().into_owned(),
        })?;

        loop {
            let (stream, _addr) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "ipc accept failed");
                    continue;
                }
            };
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, state).await {
                    error!(error = %e, "ipc connection error");
                }
            });
        }
    }
}

/// Issue a single request/response round trip against a running daemon's
/// IPC socket. Used by stacd to poll stafd's `get_all_log_pages`, the
/// substitute for the original's cross-daemon D-Bus call.
pub async fn query(path: impl AsRef<Path>, method: &str, params: serde_json::Value) -> Result<serde_json::Value, IpcError> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path).await.context(error::ClientConnectSnafu {
        path: path.to_string_lossy().into_owned(),
    })?;
    let (read_half, mut write_half) = stream.into_split();
    let mut line = serde_json::to_string(&Request { method: method.to_string(), params }).context(error::ClientDecodeSnafu)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await.context(error::ClientIoSnafu)?;

    let mut lines = BufReader::new(read_half).lines();
    let response_line = lines
        .next_line()
        .await
        .context(error::ClientIoSnafu)?
        .ok_or_else(|| IpcError::ClientIo { source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "ipc server closed connection") })?;
    let response: Response = serde_json::from_str(&response_line).context(error::ClientDecodeSnafu)?;
    match response.error {
        Some(msg) => Err(IpcError::ClientIo { source: std::io::Error::new(std::io::ErrorKind::Other, msg) }),
        None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
    }
}

async fn handle_connection(stream: UnixStream, state: Arc<IpcState>) -> Result<(), IpcError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) => dispatch(&req, &state).await,
            Err(e) => Response { result: None, error: Some(format!("malformed request: {}", e)) },
        };
        let mut bytes = serde_json::to_vec(&response).unwrap_or_default();
        bytes.push(b'\n');
        if write_half.write_all(&bytes).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn dispatch(req: &Request, state: &Arc<IpcState>) -> Response {
    match req.method.as_str() {
        "tron" => {
            if let Some(v) = req.params.as_bool() {
                state.tron.store(v, Ordering::SeqCst);
            }
            Response { result: Some(json!(state.tron.load(Ordering::SeqCst))), error: None }
        }
        "process_info" => Response {
            result: Some(json!({
                "pid": state.pid,
                "name": state.prog_name,
                "tron": state.tron.load(Ordering::SeqCst),
            })),
            error: None,
        },
        "list_controllers" => {
            let snapshots = state.registry.snapshot_all().await;
            Response { result: Some(json!(snapshots)), error: None }
        }
        "controller_info" => {
            let Some(tid) = tid_from_params(&req.params) else {
                return Response { result: None, error: Some("missing tid fields".into()) };
            };
            match state.registry.get(&tid).await {
                Some(handle) => {
                    let (tx, rx) = tokio::sync::oneshot::channel();
                    if handle.commands.send(crate::controller::ControllerCommand::Snapshot(tx)).await.is_ok() {
                        match rx.await {
                            Ok(snap) => Response { result: Some(json!(snap)), error: None },
                            Err(_) => Response { result: None, error: Some("controller gone".into()) },
                        }
                    } else {
                        Response { result: None, error: Some("controller gone".into()) }
                    }
                }
                None => Response { result: None, error: Some("controller not found".into()) },
            }
        }
        "get_log_pages" => {
            if !state.supports_log_pages {
                return Response { result: None, error: Some("not supported on this daemon".into()) };
            }
            let Some(tid) = tid_from_params(&req.params) else {
                return Response { result: None, error: Some("missing tid fields".into()) };
            };
            match fetch_log_page(state, &tid).await {
                Some(entries) => Response { result: Some(json!(entries)), error: None },
                None => Response { result: None, error: Some("controller not found".into()) },
            }
        }
        "get_all_log_pages" => {
            if !state.supports_log_pages {
                return Response { result: None, error: Some("not supported on this daemon".into()) };
            }
            let mut out = Vec::new();
            for tid in state.registry.tids().await {
                if let Some(entries) = fetch_log_page(state, &tid).await {
                    out.push(json!({
                        "tid": tid.to_string(),
                        "tid_fields": tid_to_json(&tid),
                        "log_page": entries,
                    }));
                }
            }
            Response { result: Some(json!(out)), error: None }
        }
        other => Response { result: None, error: Some(format!("unknown method {:?}", other)) },
    }
}

async fn fetch_log_page(state: &Arc<IpcState>, tid: &Tid) -> Option<Vec<crate::dlpe::Dlpe>> {
    let handle = state.registry.get(tid).await?;
    let (tx, rx) = tokio::sync::oneshot::channel();
    handle.commands.send(crate::controller::ControllerCommand::GetLogPage(tx)).await.ok()?;
    rx.await.ok()
}

/// The originating Discovery Controller's own TID, exposed as structured
/// fields alongside its `Display` form so a consumer (stacd's IPC polling
/// client) doesn't have to parse the human-readable rendering.
fn tid_to_json(tid: &Tid) -> serde_json::Value {
    json!({
        "transport": tid.transport,
        "traddr": tid.traddr,
        "trsvcid": tid.trsvcid,
        "subsysnqn": tid.subsysnqn,
        "host_traddr": tid.host_traddr,
        "host_iface": tid.host_iface,
    })
}

fn tid_from_params(params: &serde_json::Value) -> Option<Tid> {
    let transport = params.get("transport")?.as_str()?.to_string();
    let traddr = params.get("traddr")?.as_str()?.to_string();
    let trsvcid = params.get("trsvcid").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let subsysnqn = params.get("subsysnqn")?.as_str()?.to_string();
    let host_traddr = params.get("host-traddr").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let host_iface = params.get("host-iface").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    Some(Tid::new(transport, traddr, trsvcid, subsysnqn, host_traddr, host_iface))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::FakeFabric;
    use crate::registry::{ControllerHandle, Registry};

    #[test]
    fn tid_from_params_requires_mandatory_fields() {
        let v = json!({"transport": "tcp", "traddr": "10.0.0.1", "subsysnqn": "nqn.test"});
        assert!(tid_from_params(&v).is_some());
        let v = json!({"transport": "tcp"});
        assert!(tid_from_params(&v).is_none());
    }

    #[tokio::test]
    async fn get_log_pages_rejected_when_unsupported() {
        let state = Arc::new(IpcState {
            tron: AtomicBool::new(false),
            registry: Registry::new(),
            prog_name: "stacd".into(),
            pid: 1,
            supports_log_pages: false,
        });
        let req = Request {
            method: "get_log_pages".into(),
            params: json!({"transport": "tcp", "traddr": "10.0.0.1", "subsysnqn": "nqn.test"}),
        };
        let resp = dispatch(&req, &state).await;
        assert!(resp.error.is_some());
    }

    #[tokio::test]
    async fn client_query_round_trips_against_a_live_server() {
        let path = std::env::temp_dir().join(format!("stas-core-ipc-test-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let state = Arc::new(IpcState {
            tron: AtomicBool::new(false),
            registry: Registry::new(),
            prog_name: "stafd".into(),
            pid: 42,
            supports_log_pages: true,
        });
        let server = IpcServer::new(&path);
        tokio::spawn(async move {
            let _ = server.serve(state).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let result = query(&path, "process_info", serde_json::Value::Null).await.unwrap();
        assert_eq!(result["pid"], 42);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn get_log_pages_returns_cached_entries() {
        use crate::tid::Tid;

        let registry = Registry::new();
        let fabric = Arc::new(FakeFabric::new());
        let tid = Tid::new("tcp", "10.0.0.1", "8009", "nqn.test", "", "");
        let (tx, _handle) = crate::controller::ControllerActor::spawn(
            tid.clone(),
            crate::udev_bridge::ControllerKind::Discovery,
            fabric,
            crate::fabric::ConnectArgs::default(),
            None,
        );
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        registry
            .insert(ControllerHandle { tid: tid.clone(), commands: tx, task: tokio::spawn(async {}) })
            .await;

        let state = Arc::new(IpcState {
            tron: AtomicBool::new(false),
            registry,
            prog_name: "stafd".into(),
            pid: 1,
            supports_log_pages: true,
        });
        let req = Request {
            method: "get_log_pages".into(),
            params: json!({"transport": "tcp", "traddr": "10.0.0.1", "subsysnqn": "nqn.test"}),
        };
        let resp = dispatch(&req, &state).await;
        assert!(resp.error.is_none());
        assert!(resp.result.unwrap().is_array());
    }

    #[tokio::test]
    async fn get_all_log_pages_exposes_structured_tid_fields() {
        use crate::tid::Tid;

        let registry = Registry::new();
        let fabric = Arc::new(FakeFabric::new());
        let tid = Tid::new("tcp", "10.0.0.1", "8009", "nqn.test", "10.0.0.2", "");
        let (tx, _handle) = crate::controller::ControllerActor::spawn(
            tid.clone(),
            crate::udev_bridge::ControllerKind::Discovery,
            fabric,
            crate::fabric::ConnectArgs::default(),
            None,
        );
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        registry
            .insert(ControllerHandle { tid: tid.clone(), commands: tx, task: tokio::spawn(async {}) })
            .await;

        let state = Arc::new(IpcState {
            tron: AtomicBool::new(false),
            registry,
            prog_name: "stafd".into(),
            pid: 1,
            supports_log_pages: true,
        });
        let req = Request { method: "get_all_log_pages".into(), params: serde_json::Value::Null };
        let resp = dispatch(&req, &state).await;
        let result = resp.result.unwrap();
        let entries = result.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["tid_fields"]["host_traddr"], "10.0.0.2");
    }
}
