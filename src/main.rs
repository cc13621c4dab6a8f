// tagauthd: local RFID/NFC UID authentication daemon.

use std::path::{Path, PathBuf};
use tagauthd::config::{self, Config};
use tagauthd::coordinator::{Coordinator, CoordinatorMsg, CoordinatorSettings};
use tagauthd::listeners::hid::{HidListener, NoHardware as NoHid};
use tagauthd::listeners::pcsc::{NoHardware as NoPcsc, PcscListener};
use tagauthd::listeners::proxmark::{NoHardware as NoProxmark, ProxmarkListener};
use tagauthd::listeners::serial::{NoHardware as NoSerial, SerialListener};
use tagauthd::listeners::{Listener, ListenerEvent};
use tagauthd::acceptor;
use tokio::sync::{mpsc, watch};
use tracing::info;
use uid_core::TranslationTable;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "tagauthd starting");

    let cfg = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let socket_path = PathBuf::from(&cfg.socket_path);
    let listener = match acceptor::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind socket: {e}");
            std::process::exit(1);
        }
    };

    let credential_file_path = PathBuf::from(&cfg.encrypted_uids_file);
    let translation_table = TranslationTable::from_raw_pairs(cfg.uids_translation_table.clone());

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<CoordinatorMsg>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let settings = CoordinatorSettings {
        max_auth_request_wait: cfg.max_auth_request_wait,
        client_force_close_socket_timeout: cfg.client_force_close_socket_timeout,
        translation_table,
        credential_file_path: credential_file_path.clone(),
    };
    let coordinator = Coordinator::new(settings);
    tokio::spawn(coordinator.run(inbox_rx));

    spawn_listeners(&cfg, inbox_tx.clone(), shutdown_rx.clone());

    let acceptor_task = tokio::spawn(acceptor::run(
        listener,
        inbox_tx,
        cfg.remote_user_parent_process_names.clone(),
        credential_file_path,
        shutdown_rx,
    ));

    shutdown_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = acceptor_task.await;
    let _ = socket_path_cleanup(&socket_path);
}

fn socket_path_cleanup(path: &Path) -> std::io::Result<()> {
    std::fs::remove_file(path)
}

fn spawn_listeners(cfg: &Config, out: mpsc::UnboundedSender<CoordinatorMsg>, shutdown: watch::Receiver<bool>) {
    let r = &cfg.readers;
    if r.pcsc.enabled {
        spawn_listener(
            PcscListener::new(NoPcsc, r.pcsc.read_every),
            forward_uids(out.clone(), "pcsc"),
            shutdown.clone(),
        );
    }
    if r.serial.enabled {
        spawn_listener(
            SerialListener::new(NoSerial, r.serial.read_every, r.serial.inactive_timeout),
            forward_uids(out.clone(), "serial"),
            shutdown.clone(),
        );
    }
    if r.hid.enabled {
        spawn_listener(
            HidListener::new(NoHid, r.hid.read_every, r.hid.inactive_timeout),
            forward_uids(out.clone(), "hid"),
            shutdown.clone(),
        );
    }
    if r.proxmark.enabled {
        spawn_listener(
            ProxmarkListener::new(NoProxmark, r.proxmark.read_every, r.proxmark.inactive_timeout),
            forward_uids(out, "proxmark"),
            shutdown,
        );
    }
}

fn spawn_listener<L: Listener>(listener: L, out: mpsc::UnboundedSender<ListenerEvent>, shutdown: watch::Receiver<bool>) {
    let id = listener.id();
    tokio::spawn(async move {
        tracing::info!(backend = id, "reader backend started");
        listener.run(out, shutdown).await;
        tracing::info!(backend = id, "reader backend stopped");
    });
}

/// Adapt a backend's `ListenerEvent` stream into `CoordinatorMsg::ListenerUpdate`s
/// tagged with the backend's id, over a freshly spawned relay task.
fn forward_uids(coordinator: mpsc::UnboundedSender<CoordinatorMsg>, id: &'static str) -> mpsc::UnboundedSender<ListenerEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let msg = match event {
                ListenerEvent::UidsUpdate(uids) => CoordinatorMsg::ListenerUpdate { listener_id: id, uids },
                ListenerEvent::KeepAlive => CoordinatorMsg::ListenerKeepAlive,
            };
            if coordinator.send(msg).is_err() {
                break;
            }
        }
    });
    tx
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C"); },
        _ = terminate => { info!("received SIGTERM"); },
    }
}
