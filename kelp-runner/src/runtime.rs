use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch, RwLock};

use kelp_core::RunOptions;

use crate::changeset::ChangeSet;
use crate::dev::{
    dev_loop, docker_kubectl, ComponentFactory, LoopChannels, LoopStatus, Runner, SharedStatus,
};
use crate::error::{io_err, RunnerError};
use crate::intents::Intents;
use crate::monitor::watcher_task;
use crate::paths::{socket_path, state_dir, workspace_of, DEBOUNCE_WINDOW};
use crate::protocol::{ControlRequest, ControlResponse};

/// Shared handles the control socket acts on.
#[derive(Clone)]
pub struct ControlState {
    pub intents: Arc<Intents>,
    pub changes: Arc<ChangeSet>,
    pub status: SharedStatus,
    pub socket: PathBuf,
}

/// Run `kelp dev` with docker + kubectl and block the current thread until it exits.
pub fn start_blocking(options: RunOptions) -> Result<(), RunnerError> {
    init_tracing();
    block_on(run_dev(options, Arc::new(docker_kubectl)))?
}

/// Drive `future` to completion on a fresh multi-threaded runtime.
pub fn block_on<F: Future>(future: F) -> Result<F::Output, RunnerError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    Ok(runtime.block_on(future))
}

/// Dev loop + watcher + control socket + ctrl-c, until any of them stops.
pub async fn run_dev(options: RunOptions, factory: ComponentFactory) -> Result<(), RunnerError> {
    let runner = Runner::load(options, factory)?;
    let workspace = workspace_of(&runner.options().config_file);
    ensure_state_dir(&workspace)?;

    let status: SharedStatus = Arc::new(RwLock::new(LoopStatus::new(Utc::now())));
    let control = ControlState {
        intents: Arc::clone(runner.intents()),
        changes: Arc::clone(runner.changes()),
        status: Arc::clone(&status),
        socket: socket_path(&workspace),
    };

    let (batch_tx, batch_rx) = mpsc::channel::<Vec<PathBuf>>(64);
    let (roots_tx, roots_rx) = watch::channel(runner.targets().roots());
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = watcher_task(roots_rx, batch_tx, DEBOUNCE_WINDOW, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let loop_handle = {
        let shutdown = shutdown_tx.clone();
        let channels = LoopChannels {
            batch_rx,
            roots_tx,
            status,
            shutdown_rx: shutdown.subscribe(),
        };
        tokio::spawn(async move {
            let result = dev_loop(runner, Box::new(std::io::stdout()), channels).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(control, shutdown.clone(), shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(RunnerError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (watcher_result, loop_result, socket_result, signal_result) =
        tokio::join!(watcher_handle, loop_handle, socket_handle, signal_handle);

    handle_join("watcher", watcher_result)?;
    handle_join("dev_loop", loop_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

pub async fn socket_server_task(
    state: ControlState,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), RunnerError> {
    let socket = state.socket.clone();
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::debug!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: ControlState,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), RunnerError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("control socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: ControlRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &ControlResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = handle_request(&state, &request, &shutdown_tx).await;
        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

pub(crate) async fn handle_request(
    state: &ControlState,
    request: &ControlRequest,
    shutdown_tx: &broadcast::Sender<()>,
) -> ControlResponse {
    match request.cmd.as_str() {
        "status" => ControlResponse::ok(build_status_payload(state).await),
        "trigger" => {
            let Some(category) = request.category else {
                return ControlResponse::error("trigger requires a category");
            };
            state.intents.set(category, true);
            tracing::info!(%category, "trigger received");
            ControlResponse::ok(json!({ "triggered": category }))
        }
        "auto" => {
            let (Some(category), Some(enabled)) = (request.category, request.enabled) else {
                return ControlResponse::error("auto requires a category and enabled flag");
            };
            state.intents.set_auto(category, enabled);
            tracing::info!(%category, enabled, "auto trigger changed");
            if !state.intents.is_any_auto_enabled() {
                tracing::info!("every category is manual; use `kelp trigger` to run stages");
            }
            ControlResponse::ok(json!({ "category": category, "auto": enabled }))
        }
        "stop" => {
            let _ = shutdown_tx.send(());
            ControlResponse::ok(json!({ "stopping": true }))
        }
        other => ControlResponse::error(format!("unknown command '{other}'")),
    }
}

async fn build_status_payload(state: &ControlState) -> Value {
    let status = state.status.read().await.clone();
    let pending_rebuild: Vec<String> = state
        .changes
        .needs_rebuild()
        .iter()
        .map(|a| a.image.to_string())
        .collect();
    let pending_resync: Vec<String> = state
        .changes
        .needs_resync()
        .iter()
        .map(|item| item.image.to_string())
        .collect();

    json!({
        "running": true,
        "socket": state.socket.display().to_string(),
        "started_at": status.started_at,
        "cycles": status.cycles,
        "intents": state.intents.get_intents(),
        "auto": state.intents.get_auto(),
        "any_auto": state.intents.is_any_auto_enabled(),
        "pending": {
            "rebuild": pending_rebuild,
            "resync": pending_resync,
            "retest": state.changes.needs_retest(),
            "redeploy": state.changes.needs_redeploy(),
            "reload": state.changes.needs_reload(),
        },
        "builds": status.builds,
        "last_cycle": status.last_cycle,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), RunnerError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(RunnerError::Protocol(format!(
                "a dev loop is already listening on {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale control socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_state_dir(workspace: &Path) -> Result<(), RunnerError> {
    let dir = state_dir(workspace);
    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &ControlResponse,
) -> Result<(), RunnerError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("control socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("control socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("control socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), RunnerError>, tokio::task::JoinError>,
) -> Result<(), RunnerError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(RunnerError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Install the global subscriber: `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn set_socket_permissions(path: &Path) -> Result<(), RunnerError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
