// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! ngrok-tunnel-controller - exposes labeled Services through ngrok tunnels.

#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ngrok_tunnel_controller::config::{AuthToken, ControllerConfig, NGROK_TOKEN_ENV};
use ngrok_tunnel_controller::{ControllerContext, ControllerManager, TunnelController};

/// ngrok tunnel controller
///
/// Watches Services labeled `ngrok=true` and runs an ngrok tunnel pod for
/// each of them, removing it before the Service is deleted.
#[derive(Parser, Debug)]
#[command(name = "ngrok-tunnel-controller")]
#[command(version)]
#[command(about = "Expose Kubernetes Services through ngrok", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long)]
    master: Option<String>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// ngrok auth token, see https://dashboard.ngrok.com/get-started/your-authtoken
    #[arg(long, env = NGROK_TOKEN_ENV, hide_env_values = true)]
    ngrok_token: Option<String>,

    /// Namespace the tunnel pods are created in
    #[arg(long)]
    tunnel_namespace: Option<String>,

    /// Image running the ngrok client
    #[arg(long)]
    tunnel_image: Option<String>,

    /// Number of services reconciled in parallel
    #[arg(long)]
    concurrent_syncs: Option<u16>,

    /// Address for the health check server
    #[arg(long)]
    healthz_bind_address: Option<String>,

    /// Port for the health check server; disabled when unset
    #[arg(long)]
    healthz_bind_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json)?;

    info!(version = ngrok_tunnel_controller::VERSION, "starting ngrok-tunnel-controller");

    let manager = match init(args).await {
        Ok(manager) => manager,
        Err(e) => {
            error!("initialization failed: {:#}", e);
            return Err(e);
        }
    };

    let shutdown_token = manager.shutdown_token();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        shutdown_token.cancel();
    });

    if let Err(e) = manager.run().await {
        error!("controller manager failed: {:#}", e);
        return Err(e.into());
    }

    info!("ngrok-tunnel-controller exited successfully");
    Ok(())
}

/// Builds everything the controller needs; any failure here is fatal.
async fn init(args: Args) -> anyhow::Result<ControllerManager> {
    let token = AuthToken::new(args.ngrok_token.clone())?;

    let config = load_config(args).await?;
    config.validate()?;

    info!(
        tunnel_namespace = %config.tunnel.namespace,
        image = %config.tunnel.image,
        concurrent_syncs = config.generic.concurrent_syncs,
        "configuration loaded"
    );

    let client = create_client(&config).await?;
    let ctx = ControllerContext::new(client, Arc::new(config), token);

    let mut manager = ControllerManager::new(ctx);
    manager.register_controller(Arc::new(TunnelController::new()));
    Ok(manager)
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid log level: {}", level))?,
        )
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
    Ok(())
}

/// Loads the configuration from file, then applies command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<ControllerConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<ControllerConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        ControllerConfig::default()
    };

    if let Some(kubeconfig) = args.kubeconfig {
        config.generic.kubeconfig = Some(kubeconfig);
    }
    if let Some(master) = args.master {
        config.generic.master = Some(master);
    }
    if let Some(namespace) = args.tunnel_namespace {
        config.tunnel.namespace = namespace;
    }
    if let Some(image) = args.tunnel_image {
        config.tunnel.image = image;
    }
    if let Some(concurrent_syncs) = args.concurrent_syncs {
        config.generic.concurrent_syncs = concurrent_syncs;
    }
    if let Some(address) = args.healthz_bind_address {
        config.generic.healthz_bind_address = address;
    }
    if let Some(port) = args.healthz_bind_port {
        config.generic.healthz_bind_port = Some(port);
    }

    Ok(config)
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &ControllerConfig) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};
    use kube::Config;

    let kube_config = if let Some(kubeconfig_path) = &config.generic.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
            .with_context(|| format!("failed to read kubeconfig from: {:?}", kubeconfig_path))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("failed to load kubeconfig from: {:?}", kubeconfig_path))?
    } else if let Some(master_url) = &config.generic.master {
        let uri = master_url
            .parse::<http::Uri>()
            .with_context(|| format!("invalid master URL: {}", master_url))?;
        Config::new(uri)
    } else {
        Config::infer().await.context("failed to load kubeconfig")?
    };

    kube::Client::try_from(kube_config).context("failed to create kubernetes client")
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "failed to install signal handlers, falling back to ctrl-c");
                    wait_for_ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
}

/// Waits for Ctrl+C. If it cannot be watched, only an external kill stops the process.
async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}
