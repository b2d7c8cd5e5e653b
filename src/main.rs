//! Tether webhook - admission-time pod adaptation for virtual-node scheduling

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tether_webhook::volume::ClaimStore;
use tether_webhook::webhook::{webhook_router, WebhookState};
use tether_webhook::DEFAULT_WEBHOOK_PORT;

/// Tether - pod mutation webhook for virtual-node multi-cluster scheduling
#[derive(Parser, Debug)]
#[command(name = "tether-webhook", version, about, long_about = None)]
struct Cli {
    /// Address the HTTPS listener binds to
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_WEBHOOK_PORT)))]
    addr: SocketAddr,

    /// Path to the TLS certificate PEM file
    #[arg(long)]
    tls_cert_file: PathBuf,

    /// Path to the TLS private key PEM file
    #[arg(long)]
    tls_private_key_file: PathBuf,

    /// Node-selector/affinity label keys the rewriter leaves on the live pod
    /// (comma-separated)
    #[arg(long, value_delimiter = ',')]
    ignore_selector_keys: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the aws-lc-rs crypto provider before any TLS use; without a
    // working provider the webhook cannot serve at all.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        anyhow::bail!("failed to install rustls crypto provider: {:?}", e);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    // Keep a local cache of claims current in the background; the volume
    // resolver only ever reads this store, never the API server.
    let claims: Api<PersistentVolumeClaim> = Api::all(client);
    let (store, writer) = reflector::store();
    let claim_watch = reflector(
        writer,
        watcher(claims, watcher::Config::default()).default_backoff(),
    )
    .applied_objects();
    tokio::spawn(async move {
        futures::pin_mut!(claim_watch);
        while let Some(event) = claim_watch.next().await {
            if let Err(error) = event {
                tracing::warn!(%error, "persistent-volume-claim watch error");
            }
        }
    });

    tracing::info!(
        addr = %cli.addr,
        ignore_keys = ?cli.ignore_selector_keys,
        "starting tether webhook"
    );

    let state = Arc::new(WebhookState::new(
        Arc::new(ClaimStore::new(store)),
        cli.ignore_selector_keys,
    ));
    let app = webhook_router(state);

    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
        &cli.tls_cert_file,
        &cli.tls_private_key_file,
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to load TLS certificate: {}", e))?;

    axum_server::bind_rustls(cli.addr, tls_config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("webhook server error: {}", e))?;

    Ok(())
}
