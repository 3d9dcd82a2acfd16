//! Lecture Vault server binary.
//!
//! Accepts resumable chunked uploads of lecture videos, reassembles them
//! into the media root, and streams finished assets to entitled viewers
//! behind short-lived signed capabilities with HTTP Range support.

mod atomic;
mod auth;
mod background;
mod capability;
mod catalog;
mod chunk_store;
mod config;
mod entitlement;
mod error;
mod http;
mod logging;
mod range;
mod reaper;
mod reassembler;
mod registry;
mod router;
mod storage;
mod stream;
mod tls;
mod upload;
mod version;
mod video;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::background::spawn_background_tasks;
use crate::capability::{AccessTokenIssuer, CapabilitySigner};
use crate::catalog::{Catalog, CatalogData};
use crate::chunk_store::ChunkStore;
use crate::config::{ASSEMBLY_QUEUE_DEPTH, Args, UploadConfig};
use crate::entitlement::SharedEntitlements;
use crate::reaper::StaleUploadReaper;
use crate::reassembler::{AssemblyQueue, Reassembler};
use crate::registry::UploadRegistry;
use crate::router::{AppServices, build_router};
use crate::storage::Storage;
use crate::stream::RangeStreamServer;
use crate::upload::UploadCoordinator;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let upload_config = UploadConfig::from_args(&args);
    let store = ChunkStore::new(upload_config.scratch_root.clone());
    let media = Storage::new(upload_config.media_root.clone());
    store.ensure_root().await?;
    media.ensure_root().await?;

    let catalog = Arc::new(match args.catalog.as_deref() {
        Some(path) => Catalog::load(PathBuf::from(path)).await?,
        None => {
            warn!("no catalog configured, every viewer will be rejected");
            Catalog::in_memory(CatalogData::default())
        }
    });
    let entitlements: SharedEntitlements = catalog.clone();

    let secret = match args.token_secret.as_deref().filter(|value| !value.is_empty()) {
        Some(value) => value.as_bytes().to_vec(),
        None => {
            warn!("VV_TOKEN_SECRET not set, stream tokens will not survive a restart");
            random_secret()
        }
    };
    let signer = Arc::new(CapabilitySigner::new(
        &secret,
        Duration::from_secs(args.token_ttl_secs),
    ));

    let registry = Arc::new(UploadRegistry::new());
    let queue = AssemblyQueue::spawn(Reassembler::new(store.clone()), ASSEMBLY_QUEUE_DEPTH);
    let reaper = Arc::new(StaleUploadReaper::new(
        store.clone(),
        registry.clone(),
        upload_config.retention,
        upload_config.chunk_timeout,
    ));
    let coordinator = Arc::new(UploadCoordinator::new(
        upload_config,
        store,
        media.clone(),
        registry,
        queue,
        entitlements.clone(),
    ));
    let services = AppServices {
        coordinator,
        reaper: reaper.clone(),
        issuer: Arc::new(AccessTokenIssuer::new(signer.clone(), entitlements.clone())),
        streamer: Arc::new(RangeStreamServer::new(signer, entitlements.clone(), media)),
        entitlements,
    };
    let app = build_router(services, args.cors_origins.as_deref());

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let https = match args.https_port {
        Some(port) => {
            let tls_config =
                tls::build_rustls_config(args.tls_cert.as_deref(), args.tls_key.as_deref(), host)
                    .await?;
            Some((SocketAddr::new(host, port), tls_config))
        }
        None => None,
    };
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());
    let https_server = {
        let handle = handle.clone();
        async move {
            match https {
                Some((addr, tls_config)) => {
                    info!("Starting HTTPS server at {}", addr);
                    axum_server::bind_rustls(addr, tls_config)
                        .handle(handle)
                        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                        .await
                }
                None => std::future::pending().await,
            }
        }
    };

    spawn_background_tasks(
        reaper,
        Duration::from_secs(args.reaper_interval_secs),
        catalog,
        Duration::from_secs(args.catalog_refresh_secs),
    );
    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

/// 未配置密钥时生成仅本进程有效的随机密钥。
fn random_secret() -> Vec<u8> {
    let mut secret = Vec::with_capacity(32);
    secret.extend_from_slice(Uuid::new_v4().as_bytes());
    secret.extend_from_slice(Uuid::new_v4().as_bytes());
    secret
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
