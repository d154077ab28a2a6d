use std::sync::Arc;

use rekindle_keys::entities::DeletedKeys;
use rekindle_keys::{
    DeviceAddress, HealthSnapshot, IdentityKey, KeyBundle, KeyError, KeyService,
    ManualCleanupReport, PreKeyDto, PreKeyStatus, RotationRecommendations, SignedPreKeyDto,
};
use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use crate::server_state::ServerState;

/// JSON-RPC request to the key server.
///
/// `user_id`/`device_id` are the caller's identity, already authenticated by
/// the process on the other end of the socket. `target_*` fields name the
/// device whose public keys a peer wants.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum IpcRequest {
    UploadIdentityKey {
        user_id: String,
        device_id: String,
        public_key: String,
    },
    UploadSignedPreKey {
        user_id: String,
        device_id: String,
        signed_pre_key: SignedPreKeyDto,
    },
    UploadPreKeys {
        user_id: String,
        device_id: String,
        pre_keys: Vec<PreKeyDto>,
    },
    GetRotationRecommendations { user_id: String, device_id: String },
    /// Device ownership must be confirmed by the sender beforehand.
    DeleteDeviceKeys { user_id: String, device_id: String },
    DeleteAllUserKeys { user_id: String },
    GetKeyBundle {
        target_user_id: String,
        target_device_id: String,
    },
    /// Fetch bundles for several devices; failing devices are left out.
    GetKeyBundles { targets: Vec<DeviceAddress> },
    GetPreKeyStatus {
        target_user_id: String,
        target_device_id: String,
    },
    GetHealth,
    TriggerManualCleanup,
    /// Shut down the server.
    Shutdown,
}

/// JSON-RPC response from the key server.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IpcResponse {
    /// Generic success.
    Ok,
    IdentityKey(IdentityKey),
    SignedPreKeyStored {
        key_id: u32,
        expires_at: String,
    },
    PreKeysStored { count: usize },
    Recommendations(RotationRecommendations),
    Deleted(DeletedKeys),
    Bundle(KeyBundle),
    Bundles { bundles: Vec<KeyBundle> },
    PreKeyStatus(PreKeyStatus),
    Health {
        uptime_secs: u64,
        snapshot: HealthSnapshot,
    },
    CleanupReport(ManualCleanupReport),
    /// Error. `code` distinguishes validation, conflict, capacity, and
    /// not-found failures so clients can react differently.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl From<KeyError> for IpcResponse {
    fn from(e: KeyError) -> Self {
        Self::Error {
            code: e.code().to_string(),
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }
}

/// Longest request line accepted, excluding the newline.
const MAX_REQUEST_BYTES: usize = 1 << 20;

fn respond<T>(
    result: Result<T, KeyError>,
    wrap: impl FnOnce(T) -> IpcResponse,
) -> IpcResponse {
    result.map_or_else(IpcResponse::from, wrap)
}

fn invalid_request(message: String) -> IpcResponse {
    IpcResponse::Error {
        code: "invalid_request".into(),
        message,
        retryable: false,
    }
}

/// Start the IPC listener on a Unix socket.
///
/// Reads newline-delimited JSON requests and writes JSON responses.
pub async fn start_ipc_listener(
    socket_path: &str,
    state: Arc<ServerState>,
    shutdown_tx: mpsc::Sender<()>,
) {
    // Remove stale socket file if it exists
    let _ = std::fs::remove_file(socket_path);

    let listener = match UnixListener::bind(socket_path) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, path = %socket_path, "failed to bind IPC socket");
            let _ = shutdown_tx.send(()).await;
            return;
        }
    };

    tracing::info!(path = %socket_path, "IPC listener started");

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = Arc::clone(&state);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    serve_connection(reader, writer, &state, &shutdown_tx, MAX_REQUEST_BYTES)
                        .await;
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "IPC accept error");
            }
        }
    }
}

/// Answer newline-delimited requests on one connection until the peer
/// closes it, a read fails, or a line exceeds `max_line` bytes.
async fn serve_connection<R, W>(
    reader: R,
    mut writer: W,
    state: &Arc<ServerState>,
    shutdown_tx: &mpsc::Sender<()>,
    max_line: usize,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let limit = u64::try_from(max_line)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    let mut line = Vec::new();

    loop {
        line.clear();
        match (&mut reader).take(limit).read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "IPC read failed; closing connection");
                break;
            }
        }

        let too_long = !line.ends_with(b"\n") && line.len() > max_line;
        let response = if too_long {
            tracing::warn!(limit = max_line, "IPC request too large; closing connection");
            IpcResponse::Error {
                code: "request_too_large".into(),
                message: format!("request exceeds {max_line} bytes"),
                retryable: false,
            }
        } else {
            let body = line.strip_suffix(b"\n").unwrap_or(&line);
            let body = body.strip_suffix(b"\r").unwrap_or(body);
            match serde_json::from_slice::<IpcRequest>(body) {
                Ok(request) => handle_ipc_request(state, request, shutdown_tx).await,
                Err(e) => invalid_request(format!("invalid request: {e}")),
            }
        };

        let mut buf = serde_json::to_vec(&response).unwrap_or_default();
        buf.push(b'\n');
        if let Err(e) = writer.write_all(&buf).await {
            tracing::warn!(error = %e, "failed to write IPC response");
            break;
        }
        if too_long {
            break;
        }
    }
}

pub async fn handle_ipc_request(
    state: &Arc<ServerState>,
    request: IpcRequest,
    shutdown_tx: &mpsc::Sender<()>,
) -> IpcResponse {
    match request {
        IpcRequest::Shutdown => {
            tracing::info!("shutdown requested via IPC");
            let _ = shutdown_tx.send(()).await;
            IpcResponse::Ok
        }
        IpcRequest::GetHealth => IpcResponse::Health {
            uptime_secs: timestamp_now().saturating_sub(state.started_at),
            snapshot: state.keys.health_snapshot(),
        },
        request => {
            // Key operations hit SQLite; keep them off the async workers.
            let keys = Arc::clone(&state.keys);
            match tokio::task::spawn_blocking(move || handle_key_request(&keys, request)).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, "key request task panicked");
                    IpcResponse::Error {
                        code: "internal_error".into(),
                        message: "request failed unexpectedly".into(),
                        retryable: true,
                    }
                }
            }
        }
    }
}

fn handle_key_request(keys: &KeyService, request: IpcRequest) -> IpcResponse {
    match request {
        IpcRequest::UploadIdentityKey {
            user_id,
            device_id,
            public_key,
        } => respond(
            keys.upload_identity_key(&user_id, &device_id, &public_key),
            IpcResponse::IdentityKey,
        ),
        IpcRequest::UploadSignedPreKey {
            user_id,
            device_id,
            signed_pre_key,
        } => respond(
            keys.upload_signed_prekey(&user_id, &device_id, &signed_pre_key),
            |stored| IpcResponse::SignedPreKeyStored {
                key_id: stored.key_id,
                expires_at: stored.expires_at.to_rfc3339(),
            },
        ),
        IpcRequest::UploadPreKeys {
            user_id,
            device_id,
            pre_keys,
        } => respond(keys.upload_prekeys(&user_id, &device_id, &pre_keys), |count| {
            IpcResponse::PreKeysStored { count }
        }),
        IpcRequest::GetRotationRecommendations { user_id, device_id } => respond(
            keys.get_rotation_recommendations(&user_id, &device_id),
            IpcResponse::Recommendations,
        ),
        IpcRequest::DeleteDeviceKeys { user_id, device_id } => respond(
            keys.delete_device_keys(&user_id, &device_id),
            IpcResponse::Deleted,
        ),
        IpcRequest::DeleteAllUserKeys { user_id } => {
            respond(keys.delete_all_user_keys(&user_id), IpcResponse::Deleted)
        }
        IpcRequest::GetKeyBundle {
            target_user_id,
            target_device_id,
        } => respond(
            keys.get_key_bundle(&target_user_id, &target_device_id),
            IpcResponse::Bundle,
        ),
        IpcRequest::GetKeyBundles { targets } => IpcResponse::Bundles {
            bundles: keys.get_key_bundles(&targets).into_values().collect(),
        },
        IpcRequest::GetPreKeyStatus {
            target_user_id,
            target_device_id,
        } => respond(
            keys.get_pre_key_status(&target_user_id, &target_device_id),
            IpcResponse::PreKeyStatus,
        ),
        IpcRequest::TriggerManualCleanup => {
            IpcResponse::CleanupReport(keys.trigger_manual_cleanup())
        }
        IpcRequest::GetHealth | IpcRequest::Shutdown => {
            invalid_request("not a key operation".into())
        }
    }
}

pub fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
