//! Entry point: dispatches to the controller or node service per the
//! subcommand, wires every component together, and serves gRPC over a unix
//! domain socket with a bounded-timeout graceful shutdown.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use csi::attachment::{AttachmentManager, KubeBackend};
use csi::breaker::CircuitBreaker;
use csi::config::{Cli, ControllerArgs, Mode, NodeArgs};
use csi::connector::{ConnectConfig, NvmeConnector};
use csi::controller_svc::ControllerService;
use csi::csi::controller_server::ControllerServer;
use csi::csi::identity_server::IdentityServer;
use csi::csi::node_server::NodeServer;
use csi::identity::{IdentityService, ReadinessFlag};
use csi::mount::SystemMountTable;
use csi::node_svc::NodeService;
use csi::reconciler::{KubeNodeBackend, NodeWatchReconciler};
use csi::resolver::Resolver;
use csi::stale_mount::{NullEventRecorder, StaleMountChecker};

use appliance::{ApplianceClient, SshConfig, SshTransport};
use sysfs::Nvme;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();
}

async fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if path.exists() {
        tokio::fs::remove_file(path).await?;
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
    Ok(listener)
}

async fn shutdown_signal(timeout: Duration) {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    info!(timeout_seconds = timeout.as_secs(), "draining in-flight RPCs before exit");
    tokio::time::sleep(timeout).await;
}

async fn run_controller(args: ControllerArgs, nqn_filter: csi::filter::NqnFilter) -> anyhow::Result<()> {
    let ssh_config = SshConfig {
        endpoint: args.rds_endpoint.clone(),
        user: args.rds_user.clone(),
        key_path: args.rds_ssh_key_path.clone(),
        connect_timeout: Duration::from_secs(args.rds_connect_timeout_seconds),
        command_timeout: Duration::from_secs(args.rds_command_timeout_seconds),
    };
    let transport = SshTransport::new(ssh_config);
    let _monitor = transport.spawn_monitor();
    let appliance = Arc::new(ApplianceClient::new(Arc::new(transport.clone())));

    let kube_client = kube::Client::try_default().await?;
    let backend = Arc::new(KubeBackend::new(kube_client.clone()));
    let attachments = Arc::new(AttachmentManager::new(backend, csi::identity::DRIVER_NAME, args.migration_grace()));
    attachments.rebuild().await?;

    let node_backend = KubeNodeBackend::new(kube_client.clone());
    let (reconciler, trigger, work_rx) =
        NodeWatchReconciler::new(attachments.clone(), node_backend.clone(), args.stale_node_threshold());
    let _node_watch = node_backend.spawn_watch(trigger.clone());
    transport.set_reconnect_callback(Arc::new(move || trigger.fire_rebuild()));

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    let reconciler_handle = tokio::spawn(reconciler.run(work_rx, stop_rx, Duration::from_secs(30)));

    let readiness = ReadinessFlag::new();
    readiness.mark_ready();

    let controller_svc = ControllerService::new(
        appliance,
        attachments,
        kube_client,
        nqn_filter,
        args.rds_nvme_addr.clone(),
        args.rds_nvme_port,
    );
    let identity_svc = IdentityService::new(true, readiness);

    let listener = bind_socket(&args.csi_socket).await?;
    info!(socket = %args.csi_socket.display(), "controller service listening");

    Server::builder()
        .add_service(IdentityServer::new(identity_svc))
        .add_service(ControllerServer::new(controller_svc))
        .serve_with_incoming_shutdown(
            UnixListenerStream::new(listener),
            shutdown_signal(args.shutdown_timeout()),
        )
        .await?;

    let _ = stop_tx.send(());
    reconciler_handle.await.ok();
    Ok(())
}

async fn run_node(args: NodeArgs, nqn_filter: csi::filter::NqnFilter) -> anyhow::Result<()> {
    let sysfs = Nvme::default();
    let connector = Arc::new(NvmeConnector::new(sysfs.clone()));
    let resolver = Arc::new(Resolver::new(sysfs, args.resolver_cache_ttl()));
    let mounts: Arc<dyn csi::mount::MountTable> = Arc::new(SystemMountTable::new(
        args.mount_parse_timeout(),
        args.duplicate_mount_threshold,
    ));
    let stale_checker = Arc::new(StaleMountChecker::new(
        mounts.clone(),
        Some(resolver.clone()),
        Arc::new(NullEventRecorder),
    ));
    let breaker = Arc::new(CircuitBreaker::new(
        args.circuit_breaker_failures,
        args.circuit_breaker_cooling(),
    ));

    let connect_config = ConnectConfig {
        ctrl_loss_tmo: args.ctrl_loss_tmo,
        reconnect_delay: args.reconnect_delay(),
        connect_timeout: args.nvme_connect_timeout(),
    };

    let _orphan_sweep = args.enable_orphan_cleanup.then(|| {
        let connector = connector.clone();
        let nqn_filter = nqn_filter.clone();
        let interval = args.orphan_sweep_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match connector.sweep_orphans(&nqn_filter).await {
                    Ok(cleaned) if !cleaned.is_empty() => {
                        info!(count = cleaned.len(), "orphan sweep: disconnected orphaned subsystems")
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "orphan sweep failed"),
                }
            }
        })
    });

    let readiness = ReadinessFlag::new();
    readiness.mark_ready();

    let node_svc = NodeService::new(
        connector.clone(),
        resolver,
        mounts,
        stale_checker,
        breaker,
        nqn_filter,
        args.node_id.clone(),
        connect_config,
    );
    let identity_svc = IdentityService::new(false, readiness);

    let listener = bind_socket(&args.csi_socket).await?;
    info!(socket = %args.csi_socket.display(), node_id = %args.node_id, "node service listening");

    Server::builder()
        .add_service(IdentityServer::new(identity_svc))
        .add_service(NodeServer::new(node_svc))
        .serve_with_incoming_shutdown(
            UnixListenerStream::new(listener),
            shutdown_signal(args.shutdown_timeout()),
        )
        .await?;

    connector.close();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let prefix = match &cli.mode {
        Mode::Controller(args) => &args.managed_nqn_prefix,
        Mode::Node(args) => &args.managed_nqn_prefix,
    };
    let nqn_filter = match csi::config::validated_nqn_filter(prefix) {
        Ok(filter) => filter,
        Err(err) => {
            warn!(error = %err, "startup validation failed, exiting");
            std::process::exit(1);
        }
    };

    let result = match cli.mode {
        Mode::Controller(args) => run_controller(args, nqn_filter).await,
        Mode::Node(args) => run_node(args, nqn_filter).await,
    };

    if let Err(err) = &result {
        warn!(error = %err, "fatal error, exiting");
        std::process::exit(2);
    }
    Ok(())
}
