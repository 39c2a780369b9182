//! Stdio transport
//!
//! Newline-delimited JSON over stdin/stdout. Requests are dispatched onto
//! their own tasks so sessions stay independent; all outbound traffic funnels
//! through a single writer task so frames never interleave. Agent-initiated
//! permission requests get an id from the same outbound path and block their
//! prompt loop until the client answers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bridge_session_lib::{
    AdapterKind, BridgeError, NewSessionOptions, PermissionRequest, SessionRegistry,
};
use shared::{
    AgentRequestFrame, ClientMessage, ClientRequest, ErrorFrame, ErrorObject, NotificationFrame,
    RequestPermissionOutcome, ResponseFrame, SessionNotification,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type PendingPermissions = Arc<Mutex<HashMap<u64, oneshot::Sender<RequestPermissionOutcome>>>>;

/// Run the bridge over stdio until the client disconnects.
pub async fn run(
    registry: Arc<SessionRegistry>,
    notifications: mpsc::UnboundedReceiver<SessionNotification>,
    permissions: mpsc::UnboundedReceiver<PermissionRequest>,
) -> Result<()> {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let pending: PendingPermissions = Arc::new(Mutex::new(HashMap::new()));
    let request_ids = Arc::new(AtomicU64::new(1));

    let writer_task = spawn_writer(out_rx);
    let notify_task = spawn_notification_forwarder(notifications, out_tx.clone());
    let permission_task = spawn_permission_forwarder(
        permissions,
        out_tx.clone(),
        Arc::clone(&pending),
        Arc::clone(&request_ids),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<ClientMessage>(line) {
            Ok(ClientMessage::Request { id, request }) => {
                let registry = Arc::clone(&registry);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let result = dispatch(&registry, request).await;
                    let Some(id) = id else {
                        if let Err(e) = result {
                            warn!("Unacknowledged request failed: {}", e);
                        }
                        return;
                    };
                    let frame = match result {
                        Ok(value) => serde_json::to_string(&ResponseFrame { id, result: value }),
                        Err(e) => serde_json::to_string(&ErrorFrame {
                            id,
                            error: ErrorObject {
                                code: e.code(),
                                message: e.to_string(),
                                data: None,
                            },
                        }),
                    };
                    match frame {
                        Ok(frame) => {
                            let _ = out_tx.send(frame);
                        }
                        Err(e) => error!("Failed to encode response frame: {}", e),
                    }
                });
            }
            Ok(ClientMessage::Response { id, result }) => {
                let responder = pending.lock().unwrap().remove(&id);
                match responder {
                    Some(responder) => {
                        let outcome = serde_json::from_value::<RequestPermissionOutcome>(result)
                            .unwrap_or(RequestPermissionOutcome::Cancelled);
                        let _ = responder.send(outcome);
                    }
                    None => warn!("Response for unknown request id {}", id),
                }
            }
            Err(e) => {
                warn!("Skipping unparseable frame: {}", e);
            }
        }
    }

    info!("Client disconnected, shutting down");
    notify_task.abort();
    permission_task.abort();
    writer_task.abort();
    Ok(())
}

/// The single stdout writer: one frame per line, flushed per frame.
fn spawn_writer(mut out_rx: mpsc::UnboundedReceiver<String>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut frame) = out_rx.recv().await {
            frame.push('\n');
            if stdout.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    })
}

fn spawn_notification_forwarder(
    mut notifications: mpsc::UnboundedReceiver<SessionNotification>,
    out_tx: mpsc::UnboundedSender<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            let frame = NotificationFrame {
                method: shared::SESSION_UPDATE_METHOD.to_string(),
                params: match serde_json::to_value(&notification) {
                    Ok(params) => params,
                    Err(e) => {
                        error!("Failed to encode notification: {}", e);
                        continue;
                    }
                },
            };
            match serde_json::to_string(&frame) {
                Ok(frame) => {
                    if out_tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to encode notification frame: {}", e),
            }
        }
    })
}

fn spawn_permission_forwarder(
    mut permissions: mpsc::UnboundedReceiver<PermissionRequest>,
    out_tx: mpsc::UnboundedSender<String>,
    pending: PendingPermissions,
    request_ids: Arc<AtomicU64>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = permissions.recv().await {
            let id = request_ids.fetch_add(1, Ordering::SeqCst);
            let frame = AgentRequestFrame {
                id,
                method: shared::REQUEST_PERMISSION_METHOD.to_string(),
                params: match serde_json::to_value(&request.params) {
                    Ok(params) => params,
                    Err(e) => {
                        error!("Failed to encode permission request: {}", e);
                        continue;
                    }
                },
            };

            pending.lock().unwrap().insert(id, request.responder);
            match serde_json::to_string(&frame) {
                Ok(frame) => {
                    if out_tx.send(frame).is_err() {
                        // Writer gone; unblock the evaluator as a rejection.
                        if let Some(responder) = pending.lock().unwrap().remove(&id) {
                            drop(responder);
                        }
                        break;
                    }
                }
                Err(e) => error!("Failed to encode permission frame: {}", e),
            }
        }
    })
}

/// Route one protocol request into the registry.
async fn dispatch(
    registry: &SessionRegistry,
    request: ClientRequest,
) -> Result<serde_json::Value, BridgeError> {
    match request {
        ClientRequest::Initialize {
            protocol_version,
            client_capabilities,
        } => {
            debug!("initialize (client protocol v{})", protocol_version);
            let response = registry.initialize(client_capabilities).await?;
            Ok(serde_json::to_value(response)?)
        }

        ClientRequest::Authenticate { method_id } => {
            registry.authenticate(&method_id).await?;
            Ok(serde_json::json!({}))
        }

        ClientRequest::NewSession {
            cwd,
            mcp_servers,
            system_prompt_append,
            backend,
            task_run_id,
        } => {
            let kind = backend
                .as_deref()
                .map(|id| {
                    AdapterKind::from_id(id).ok_or(BridgeError::InvalidConfig {
                        what: "backend",
                        value: id.to_string(),
                    })
                })
                .transpose()?;
            let response = registry
                .create(
                    kind,
                    Path::new(&cwd),
                    NewSessionOptions {
                        session_id: None,
                        mcp_servers,
                        disable_builtin_mcp: false,
                        system_prompt_append,
                        task_run_id,
                    },
                )
                .await?;
            Ok(serde_json::to_value(response)?)
        }

        ClientRequest::Prompt { session_id, prompt } => {
            let response = registry.prompt(&session_id, prompt).await?;
            Ok(serde_json::to_value(response)?)
        }

        ClientRequest::Cancel { session_id } => {
            registry.cancel(&session_id).await?;
            Ok(serde_json::json!({}))
        }

        ClientRequest::SetSessionModel {
            session_id,
            model_id,
        } => {
            registry.set_session_model(&session_id, &model_id).await?;
            Ok(serde_json::json!({}))
        }

        ClientRequest::SetSessionMode {
            session_id,
            mode_id,
        } => {
            registry.set_session_mode(&session_id, &mode_id).await?;
            Ok(serde_json::json!({}))
        }

        ClientRequest::SetSessionConfigOption {
            session_id,
            option_id,
            value,
        } => {
            match option_id.as_str() {
                "mode" => registry.set_session_mode(&session_id, &value).await?,
                "model" => registry.set_session_model(&session_id, &value).await?,
                _ => {
                    return Err(BridgeError::InvalidConfig {
                        what: "config option",
                        value: option_id,
                    })
                }
            }
            Ok(serde_json::json!({}))
        }

        ClientRequest::LoadSession { session_id } => {
            registry.load_session(&session_id).await?;
            Ok(serde_json::json!({}))
        }

        ClientRequest::ResumeSession {
            session_id,
            native_resume_token,
            cwd,
        } => {
            let cwd = cwd.map(PathBuf::from);
            let response = registry
                .resume(&session_id, cwd.as_deref(), native_resume_token.as_deref())
                .await?;
            Ok(serde_json::to_value(response)?)
        }

        ClientRequest::ExtMethod { name, params } => registry.ext_method(&name, params).await,
    }
}
