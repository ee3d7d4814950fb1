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

//! scalepod-controller - level-triggered controllers for ScalePods and
//! Deployment routes.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scalepod_controller::config::ControllerManagerConfig;
use scalepod_controller::controller_manager::ControllerManager;
use scalepod_controller::crd::ScalePod;
use scalepod_controller::health::HealthServer;

/// ScalePod controller manager
///
/// Keeps the pods of every ScalePod at the requested count, and exposes
/// every Deployment through a Service of the same name.
#[derive(Parser, Debug)]
#[command(name = "scalepod-controller")]
#[command(version)]
#[command(about = "Level-triggered controllers for ScalePods and Deployment routes", long_about = None)]
struct Args {
    /// Path to the kubeconfig file
    #[arg(long)]
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

    /// Comma-separated list of controllers to enable
    ///
    /// '*' enables all controllers, 'foo' enables the controller named 'foo',
    /// '-foo' disables the controller named 'foo'
    #[arg(long)]
    controllers: Option<String>,

    /// Namespace to watch, empty for all namespaces
    #[arg(long)]
    namespace: Option<String>,

    /// Number of workers per controller
    #[arg(long)]
    concurrent_syncs: Option<usize>,

    /// Address for the health check server
    #[arg(long)]
    healthz_bind_address: Option<String>,

    /// Port for the health check server
    #[arg(long)]
    healthz_bind_port: Option<u16>,

    /// Minimum resync period for informers
    #[arg(long, value_parser = parse_duration)]
    min_resync_period: Option<Duration>,

    /// Deadline of a single reconciliation pass
    #[arg(long, value_parser = parse_duration)]
    reconcile_timeout: Option<Duration>,

    /// Print the ScalePod CustomResourceDefinition as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&ScalePod::crd())?);
        return Ok(());
    }

    init_logging(&args.log_level, args.log_json)?;

    let config = load_config(args).await?;
    info!(
        controllers = %config.generic.controllers,
        namespace = %config.generic.namespace,
        "loaded configuration"
    );

    let client = create_client(&config).await?;
    let healthz_address = config.generic.healthz_bind_address.clone();
    let healthz_port = config.generic.healthz_bind_port;
    let manager = ControllerManager::new(config, client)?;
    let health = HealthServer::new(manager.health_registry(), healthz_address, healthz_port);

    let shutdown_token = manager.shutdown_token();
    tokio::spawn({
        let shutdown_token = shutdown_token.clone();
        async move {
            wait_for_shutdown().await;
            shutdown_token.cancel();
        }
    });

    let health_token = CancellationToken::new();
    let health_task = health.spawn(health_token.clone());

    let result = manager.run().await;
    health_token.cancel();
    match health_task.await {
        Ok(Err(e)) => error!("health server failed: {:#}", e),
        Err(e) => error!("health server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    if let Err(e) = result {
        error!("controller manager failed: {:#}", e);
        return Err(e.into());
    }

    info!("scalepod-controller exited successfully");
    Ok(())
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let directive: Directive = level
        .parse()
        .with_context(|| format!("invalid log level: {level}"))?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
    Ok(())
}

/// Loads the configuration from file, then applies command-line overrides.
async fn load_config(mut args: Args) -> anyhow::Result<ControllerManagerConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {:?}", config_path))?;

        serde_yaml::from_str::<ControllerManagerConfig>(&content)
            .with_context(|| format!("failed to parse config file: {:?}", config_path))?
    } else {
        ControllerManagerConfig::default()
    };

    let generic = &mut config.generic;
    if let Some(kubeconfig) = args.kubeconfig {
        generic.kubeconfig = Some(kubeconfig);
    }
    if let Some(master) = args.master {
        generic.master = Some(master);
    }
    if let Some(controllers) = args.controllers {
        generic.controllers = controllers;
    }
    if let Some(namespace) = args.namespace {
        generic.namespace = namespace;
    }
    if let Some(address) = args.healthz_bind_address {
        generic.healthz_bind_address = address;
    }
    if let Some(port) = args.healthz_bind_port {
        generic.healthz_bind_port = port;
    }
    if let Some(duration) = args.min_resync_period {
        generic.min_resync_period = duration;
    }
    if let Some(duration) = args.reconcile_timeout {
        generic.reconcile_timeout = duration;
    }
    generic.parse_controllers();

    if let Some(workers) = args.concurrent_syncs {
        config.scale_pod.concurrent_scale_pod_syncs = workers;
        config.routes.concurrent_route_syncs = workers;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Creates a Kubernetes client from the configuration.
async fn create_client(config: &ControllerManagerConfig) -> anyhow::Result<kube::Client> {
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

    Ok(kube::Client::try_from(kube_config)?)
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down");
        }
    }
}
