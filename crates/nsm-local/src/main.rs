mod backend;

use anyhow::{Context, Result, anyhow};
use libnsm::{
    CreateOutcome, DefaultPolicy, FirewallBackend, MatchOrder, NsmError, PolicyEntry,
    PolicyProvider, RoutingBackend, SessionRegistry, SessionRequest, StaticPolicy,
};
use nix::unistd::Uid;
use nsm_protocol::{
    ErrorCode, Event, MAX_JSON_LINE_BYTES, PROTOCOL_VERSION, Request, Response,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{error, info, warn};

use backend::{CommandFirewall, CommandRouting, NullFirewall, NullRouting};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendKind {
    /// Log-only backends; the daemon runs unprivileged.
    Null,
    /// Drive the system iptables/ip tools.
    Command,
}

fn parse_backend(raw: &str) -> Result<BackendKind> {
    match raw {
        "null" => Ok(BackendKind::Null),
        "command" => Ok(BackendKind::Command),
        _ => Err(anyhow!("invalid --backend '{raw}' (expected null|command)")),
    }
}

#[derive(Debug, Clone)]
struct RuntimeConfig {
    socket_path: PathBuf,
    runtime_dir: PathBuf,
    pid_file: PathBuf,
    allowed_uid: u32,
    outbound_queue: usize,
    backend: BackendKind,
    policy_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    socket_path: Option<PathBuf>,
    runtime_dir: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    outbound_queue: Option<usize>,
    backend: Option<String>,
    policy_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    session: Vec<PolicyEntry>,
}

/// Identity of one client connection; sessions it creates carry this owner.
#[derive(Debug, Clone)]
struct ConnectionOwner {
    id: String,
    uid: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nsm_local=info".into()),
        )
        .init();

    let args = Args::parse()?;
    let cfg = load_runtime_config(&args)?;
    ensure_runtime_dir(&cfg.runtime_dir)?;
    if let Some(parent) = cfg.socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_stale_socket(&cfg.socket_path)?;

    let listener = UnixListener::bind(&cfg.socket_path)
        .with_context(|| format!("failed to bind {}", cfg.socket_path.display()))?;
    fs::set_permissions(&cfg.socket_path, fs::Permissions::from_mode(0o600))?;
    fs::write(&cfg.pid_file, std::process::id().to_string())?;

    info!(
        "nsm-local started pid={} socket={} protocol_version={}",
        std::process::id(),
        cfg.socket_path.display(),
        PROTOCOL_VERSION
    );

    let registry = Arc::new(Mutex::new(build_registry(&cfg)?));
    let active_connections: Arc<RwLock<Vec<JoinHandle<()>>>> = Arc::new(RwLock::new(Vec::new()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let accept_result = accept_loop(
        listener,
        Arc::clone(&registry),
        cfg.clone(),
        shutdown_rx,
        shutdown_tx.clone(),
        Arc::clone(&active_connections),
    )
    .await;

    shutdown_tx.send_replace(true);
    for handle in active_connections.write().await.drain(..) {
        handle.abort();
    }

    // Release every session and the shared firewall context before exit.
    registry.lock().await.shutdown();

    let _ = fs::remove_file(&cfg.socket_path);
    let _ = fs::remove_file(&cfg.pid_file);

    accept_result
}

fn build_registry(cfg: &RuntimeConfig) -> Result<SessionRegistry> {
    let policy: Box<dyn PolicyProvider> = match &cfg.policy_path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read policy file {}", path.display()))?;
            let file: PolicyFile = toml::from_str(&raw)
                .with_context(|| format!("failed to parse policy file {}", path.display()))?;
            info!(entries = file.session.len(), "loaded session policy table");
            Box::new(StaticPolicy::new(file.session))
        }
        None => Box::new(DefaultPolicy),
    };
    let (firewall, routing): (Box<dyn FirewallBackend>, Box<dyn RoutingBackend>) =
        match cfg.backend {
            BackendKind::Command => (
                Box::new(CommandFirewall::new()),
                Box::new(CommandRouting::new()),
            ),
            BackendKind::Null => (Box::new(NullFirewall::new()), Box::new(NullRouting::new())),
        };
    Ok(SessionRegistry::new(policy, firewall, routing))
}

async fn accept_loop(
    listener: UnixListener,
    registry: Arc<Mutex<SessionRegistry>>,
    cfg: RuntimeConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    active_connections: Arc<RwLock<Vec<JoinHandle<()>>>>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("shutdown requested, stopping accept loop");
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };

                let uid = match verify_peer_uid(&stream, cfg.allowed_uid) {
                    Ok(uid) => uid,
                    Err(err) => {
                        warn!("rejected peer: {err}");
                        continue;
                    }
                };

                let owner = ConnectionOwner {
                    id: format!("client-{}", uuid::Uuid::new_v4()),
                    uid,
                };
                let handle = tokio::spawn(handle_connection(
                    stream,
                    Arc::clone(&registry),
                    cfg.clone(),
                    owner,
                    shutdown_tx.clone(),
                ));
                active_connections.write().await.push(handle);
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    registry: Arc<Mutex<SessionRegistry>>,
    cfg: RuntimeConfig,
    owner: ConnectionOwner,
    shutdown_tx: watch::Sender<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let (out_tx, mut out_rx) = mpsc::channel::<Response>(cfg.outbound_queue);
    let mut writer = FramedWrite::new(
        write_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let writer_task = tokio::spawn(async move {
        while let Some(resp) = out_rx.recv().await {
            let line = match serde_json::to_string(&resp) {
                Ok(line) => line,
                Err(err) => {
                    error!("failed to encode response: {err}");
                    continue;
                }
            };

            if let Err(err) = futures_util::SinkExt::send(&mut writer, line).await {
                warn!("socket write failed: {err}");
                break;
            }
        }
    });

    if enqueue_response(
        &out_tx,
        Response::hello(vec![
            "coalesced_updates".to_string(),
            "service_feed".to_string(),
        ]),
    )
    .is_err()
    {
        writer_task.abort();
        return;
    }

    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        let line = match futures_util::StreamExt::next(&mut reader).await {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                warn!("socket read failed: {err}");
                break;
            }
            None => break,
        };

        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(err) => {
                if enqueue_response(
                    &out_tx,
                    Response::error(ErrorCode::InvalidRequest, format!("invalid request: {err}")),
                )
                .is_err()
                {
                    break;
                }
                continue;
            }
        };

        match handle_request(
            req,
            Arc::clone(&registry),
            &owner,
            out_tx.clone(),
            &mut subscriptions,
            shutdown_tx.clone(),
        )
        .await
        {
            Ok(continue_loop) => {
                if !continue_loop {
                    break;
                }
            }
            Err(err) => {
                let code = map_err_code(&err);
                if enqueue_response(&out_tx, Response::error(code, err.to_string())).is_err() {
                    break;
                }
            }
        }
    }

    for (_, handle) in subscriptions.drain() {
        handle.abort();
    }

    // Owner disappearance is an implicit, successful destroy.
    let released = registry.lock().await.release_owner(&owner.id);
    if released > 0 {
        info!(owner = %owner.id, released, "released sessions of disconnected owner");
    }

    drop(out_tx);
    let _ = writer_task.await;
}

async fn handle_request(
    req: Request,
    registry: Arc<Mutex<SessionRegistry>>,
    owner: &ConnectionOwner,
    out_tx: mpsc::Sender<Response>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<bool> {
    match req {
        Request::SessionCreate {
            allowed_bearers,
            connection_type,
            notify_tag,
        } => {
            let outcome = registry.lock().await.create_session(SessionRequest {
                owner: owner.id.clone(),
                peer_uid: Some(owner.uid),
                notify_tag,
                allowed_bearers,
                connection_type,
            })?;
            match outcome {
                CreateOutcome::Created(handle) => {
                    // The owning connection is auto-subscribed to updates.
                    let task = spawn_forwarder(handle.updates, out_tx.clone());
                    if let Some(old) = subscriptions.insert(handle.path.clone(), task) {
                        old.abort();
                    }
                    enqueue_response(
                        &out_tx,
                        Response::ok(Some(json!({"path": handle.path, "mark": handle.mark}))),
                    )?;
                }
                CreateOutcome::Pending(_) => {
                    enqueue_response(
                        &out_tx,
                        Response::error(
                            ErrorCode::ServerError,
                            "configured policy provider deferred the decision",
                        ),
                    )?;
                }
            }
        }
        Request::SessionConnect { path } => {
            registry.lock().await.connect(&path, &owner.id)?;
            enqueue_response(&out_tx, Response::ok(Some(json!({"path": path}))))?;
        }
        Request::SessionDisconnect { path } => {
            registry.lock().await.disconnect(&path, &owner.id)?;
            enqueue_response(&out_tx, Response::ok(Some(json!({"path": path}))))?;
        }
        Request::SessionChange { path, name, value } => {
            registry.lock().await.change(&path, &owner.id, &name, &value)?;
            enqueue_response(
                &out_tx,
                Response::ok(Some(json!({"path": path, "changed": name}))),
            )?;
        }
        Request::SessionDestroy { path } => {
            registry.lock().await.destroy_session(&path, &owner.id)?;
            if let Some(task) = subscriptions.remove(&path) {
                task.abort();
            }
            enqueue_response(&out_tx, Response::ok(Some(json!({"path": path}))))?;
        }
        Request::SessionList => {
            let list = registry.lock().await.list_sessions();
            enqueue_response(&out_tx, Response::ok(Some(serde_json::to_value(list)?)))?;
        }
        Request::SessionInfo { path } => {
            let summary = registry.lock().await.session_summary(&path)?;
            enqueue_response(&out_tx, Response::ok(Some(serde_json::to_value(summary)?)))?;
        }
        Request::Subscribe { path } => {
            let rx = registry.lock().await.subscribe(&path)?;
            let task = spawn_forwarder(rx, out_tx.clone());
            if let Some(old) = subscriptions.insert(path.clone(), task) {
                old.abort();
            }
            enqueue_response(
                &out_tx,
                Response::ok(Some(json!({"path": path, "subscribed": true}))),
            )?;
        }
        Request::Unsubscribe { path } => {
            if let Some(task) = subscriptions.remove(&path) {
                task.abort();
            }
            enqueue_response(
                &out_tx,
                Response::ok(Some(json!({"path": path, "subscribed": false}))),
            )?;
        }
        Request::ServiceAdd { service } => {
            let id = service.id.clone();
            registry.lock().await.add_service(service)?;
            enqueue_response(&out_tx, Response::ok(Some(json!({"id": id}))))?;
        }
        Request::ServiceUpdate {
            id,
            state,
            ipv4,
            ipv6,
        } => {
            let mut registry = registry.lock().await;
            if let Some(state) = state {
                registry.set_service_state(&id, state)?;
            }
            if ipv4.is_some() || ipv6.is_some() {
                registry.set_service_config(&id, ipv4, ipv6)?;
            }
            enqueue_response(&out_tx, Response::ok(Some(json!({"id": id}))))?;
        }
        Request::ServiceRemove { id } => {
            registry.lock().await.remove_service(&id)?;
            enqueue_response(&out_tx, Response::ok(Some(json!({"id": id}))))?;
        }
        Request::ServiceList => {
            let registry = registry.lock().await;
            let services: Vec<serde_json::Value> = registry
                .catalog()
                .iter_ordered(MatchOrder::default())
                .map(|service| {
                    json!({
                        "id": service.id,
                        "bearer": service.bearer,
                        "state": service.state,
                        "ifname": service.ifname,
                    })
                })
                .collect();
            enqueue_response(&out_tx, Response::ok(Some(json!({"services": services}))))?;
        }
        Request::Health => {
            let registry = registry.lock().await;
            enqueue_response(
                &out_tx,
                Response::ok(Some(json!({
                    "healthy": true,
                    "protocol_version": PROTOCOL_VERSION,
                    "session_count": registry.session_count(),
                }))),
            )?;
        }
        Request::ServerShutdown => {
            let _ = enqueue_response(&out_tx, Response::ok(Some(json!({"shutdown": true}))));
            shutdown_tx.send_replace(true);
            return Ok(false);
        }
    }

    Ok(true)
}

fn spawn_forwarder(
    mut rx: broadcast::Receiver<Event>,
    out: mpsc::Sender<Response>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if enqueue_response(
                        &out,
                        Response::Event {
                            event: Box::new(event),
                        },
                    )
                    .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn enqueue_response(tx: &mpsc::Sender<Response>, resp: Response) -> Result<()> {
    tx.try_send(resp)
        .map_err(|_| anyhow!("outbound queue full or closed"))
}

fn map_err_code(err: &anyhow::Error) -> ErrorCode {
    err.downcast_ref::<NsmError>()
        .map(|err| err.to_error_code().0)
        .unwrap_or(ErrorCode::ServerError)
}

#[derive(Debug)]
struct Args {
    socket_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    backend: Option<String>,
    policy_path: Option<PathBuf>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut socket_path = None;
        let mut config_path = None;
        let mut backend = None;
        let mut policy_path = None;
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--socket" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--socket requires a value"))?;
                    socket_path = Some(PathBuf::from(value));
                }
                "--config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--config requires a value"))?;
                    config_path = Some(PathBuf::from(value));
                }
                "--backend" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--backend requires a value"))?;
                    backend = Some(value);
                }
                "--policy" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--policy requires a value"))?;
                    policy_path = Some(PathBuf::from(value));
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    return Err(anyhow!("unknown argument: {other}"));
                }
            }
        }

        Ok(Self {
            socket_path,
            config_path,
            backend,
            policy_path,
        })
    }
}

fn print_help() {
    println!("nsm-local [--socket PATH] [--config PATH] [--backend null|command] [--policy PATH]");
}

fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let file_cfg = if let Some(path) = &args.config_path {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str::<FileConfig>(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?
    } else {
        FileConfig::default()
    };

    let uid = Uid::effective().as_raw();
    let runtime_dir = file_cfg.runtime_dir.unwrap_or_else(default_runtime_dir);

    let socket_path = args
        .socket_path
        .clone()
        .or(file_cfg.socket_path)
        .unwrap_or_else(|| runtime_dir.join("nsm.sock"));

    let pid_file = file_cfg
        .pid_file
        .unwrap_or_else(|| runtime_dir.join("nsm.pid"));
    let backend_raw = args
        .backend
        .clone()
        .or(file_cfg.backend)
        .unwrap_or_else(|| "null".to_string());
    let backend = parse_backend(&backend_raw)?;
    let policy_path = args.policy_path.clone().or(file_cfg.policy_path);

    Ok(RuntimeConfig {
        socket_path,
        runtime_dir,
        pid_file,
        allowed_uid: uid,
        outbound_queue: file_cfg.outbound_queue.unwrap_or(1024),
        backend,
        policy_path,
    })
}

fn default_runtime_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_RUNTIME_DIR") {
        let path = PathBuf::from(xdg);
        return path.join("nsm");
    }

    let uid = Uid::effective().as_raw();
    PathBuf::from(format!("/tmp/nsm-{uid}"))
}

fn ensure_runtime_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    Ok(())
}

fn verify_peer_uid(stream: &UnixStream, expected_uid: u32) -> Result<u32> {
    let creds = stream
        .peer_cred()
        .context("failed to query peer credentials")?;
    let uid = creds.uid();
    if uid != expected_uid {
        return Err(anyhow!(
            "peer uid {uid} is not allowed (expected {expected_uid})"
        ));
    }
    Ok(uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;

    #[test]
    fn default_runtime_dir_resolves() {
        let dir = default_runtime_dir();
        assert!(!dir.as_os_str().is_empty());
    }

    #[test]
    fn enqueue_response_fails_when_queue_full() {
        let (tx, _rx) = mpsc::channel(1);
        enqueue_response(&tx, Response::ok(None)).expect("first send should fit");
        let err = enqueue_response(&tx, Response::ok(None)).expect_err("second send should fail");
        assert!(err.to_string().contains("queue full"));
    }

    #[test]
    fn parse_backend_accepts_expected_values() {
        assert_eq!(parse_backend("null").expect("null"), BackendKind::Null);
        assert_eq!(
            parse_backend("command").expect("command"),
            BackendKind::Command
        );
        let err = parse_backend("netlink").expect_err("invalid backend should fail");
        assert!(err.to_string().contains("invalid --backend"));
    }

    #[test]
    fn nsm_errors_map_to_protocol_codes() {
        let err = anyhow::Error::from(NsmError::Busy("ecall".to_string()));
        assert_eq!(map_err_code(&err), ErrorCode::Busy);
        let err = anyhow!("something else");
        assert_eq!(map_err_code(&err), ErrorCode::ServerError);
    }

    #[tokio::test]
    async fn verify_peer_uid_accepts_matching_uid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("uid-ok.sock");
        let listener = UnixListener::bind(&socket).expect("bind listener");

        let client_task = tokio::spawn(async move {
            tokio::net::UnixStream::connect(&socket)
                .await
                .expect("client connect")
        });

        let (server_stream, _) = listener.accept().await.expect("accept");
        let _client = client_task.await.expect("join client task");

        let uid = Uid::effective().as_raw();
        let peer = verify_peer_uid(&server_stream, uid).expect("expected matching uid to pass");
        assert_eq!(peer, uid);
    }

    #[tokio::test]
    async fn verify_peer_uid_rejects_mismatched_uid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("uid-bad.sock");
        let listener = UnixListener::bind(&socket).expect("bind listener");

        let client_task = tokio::spawn(async move {
            tokio::net::UnixStream::connect(&socket)
                .await
                .expect("client connect")
        });

        let (server_stream, _) = listener.accept().await.expect("accept");
        let _client = client_task.await.expect("join client task");

        let wrong_uid = Uid::effective().as_raw().saturating_add(1);
        let err =
            verify_peer_uid(&server_stream, wrong_uid).expect_err("expected mismatched uid fail");
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn ensure_runtime_dir_sets_strict_permissions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("runtime");
        ensure_runtime_dir(&target).expect("create runtime dir");
        let mode = fs::metadata(&target)
            .expect("metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn policy_file_parses_session_entries() {
        let raw = r#"
            [[session]]
            uid = 1000
            allowed_bearers = ["wifi", "ethernet"]
            connection_type = "local"
            priority = true

            [[session]]
            uid = 1001
            ecall = true
        "#;
        let file: PolicyFile = toml::from_str(raw).expect("parse policy");
        assert_eq!(file.session.len(), 2);
        assert_eq!(file.session[0].uid, 1000);
        assert!(file.session[0].priority);
        assert!(file.session[1].ecall);
    }
}
