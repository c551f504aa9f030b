//! Control-plane server wiring: storage, hub, reconciler, the two HTTP
//! listeners, and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use kecs_storage::Database;
use tokio_util::sync::CancellationToken;

use crate::args::ServerArgs;
use crate::hub::Hub;
use crate::kube_runtime::{KubePodSource, WorkloadApplier};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::state::AppState;
use crate::{admin, api};

fn database_path(args: &ServerArgs) -> Result<std::path::PathBuf> {
    let dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => kecs_common::instance_data_dir(&args.instance)?,
    };
    Ok(dir.join("kecs.db"))
}

pub async fn run_server(args: ServerArgs) -> Result<()> {
    let db_path = database_path(&args)?;
    let db = Database::open(&db_path).await?;
    let hub = Hub::new(args.allowed_origin.clone());
    let mut state = AppState::new(db, hub, args.region.clone(), args.account_id.clone());
    if let Some(endpoint) = &args.localstack_endpoint {
        state = state.with_localstack(endpoint);
        tracing::info!(%endpoint, "localstack adapters configured");
    }

    let mut reconciler = Reconciler::new(
        state.db.clone(),
        state.hub.clone(),
        ReconcilerConfig {
            test_mode: args.test_mode,
        },
    );
    if !args.no_kubernetes {
        match WorkloadApplier::from_env().await {
            Ok(applier) => {
                // Reuse one client per instance for both applying and
                // observing.
                match kube::Client::try_default().await {
                    Ok(client) => {
                        reconciler =
                            reconciler.with_pod_source(Arc::new(KubePodSource::new(client)));
                    }
                    Err(e) => tracing::warn!(error = %e, "pod observation disabled"),
                }
                state.workloads = Some(Arc::new(applier));
                tracing::info!("kubernetes cluster attached");
            }
            Err(e) => {
                tracing::warn!(error = %e, "no kubernetes cluster attached, storage-only mode");
            }
        }
    }

    let shutdown = CancellationToken::new();
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown.clone()));

    let api_addr: SocketAddr = format!("0.0.0.0:{}", args.api_port).parse()?;
    let admin_addr: SocketAddr = format!("0.0.0.0:{}", args.admin_port).parse()?;
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind API port {api_addr}"))?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("failed to bind admin port {admin_addr}"))?;
    tracing::info!(%api_addr, %admin_addr, db = %db_path.display(), "control plane listening");

    let signal_cancel = shutdown.clone();
    tokio::spawn(async move {
        kecs_common::shutdown::shutdown_signal().await;
        signal_cancel.cancel();
    });

    let api_app = api::router(state.clone());
    let admin_app = admin::router(state.clone());
    let api_shutdown = shutdown.clone();
    let admin_shutdown = shutdown.clone();
    let api_server = axum::serve(api_listener, api_app)
        .with_graceful_shutdown(async move { api_shutdown.cancelled().await });
    let admin_server = axum::serve(admin_listener, admin_app)
        .with_graceful_shutdown(async move { admin_shutdown.cancelled().await });

    let (api_result, admin_result) = tokio::join!(api_server, admin_server);
    api_result.context("API server failed")?;
    admin_result.context("admin server failed")?;

    shutdown.cancel();
    let _ = reconciler_handle.await;
    tracing::info!("control plane stopped gracefully");
    Ok(())
}
