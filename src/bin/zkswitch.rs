//! zkswitch daemon and admin commands

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zkswitch::common::{shutdown, Config};
use zkswitch::coord::{init_layout, CoordinationPaths, ZkCoordination};
use zkswitch::{Coordination, Mirror, ProxyServer, Watcher};

#[derive(Parser)]
#[command(name = "zkswitch")]
#[command(about = "ZooKeeper-coordinated master failover with a TCP relay")]
#[command(version)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// ZooKeeper hosts (comma-separated)
    #[arg(long, global = true, value_delimiter = ',')]
    zk: Vec<String>,

    /// Root path of the watcher group
    #[arg(long, global = true)]
    root: Option<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the watcher and the relay
    Serve {
        /// Relay bind address
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Print the mirrored state and exit
    Status,
    /// Create the coordination layout
    Init {
        /// Candidate server address (repeatable)
        #[arg(long = "server")]
        servers: Vec<String>,

        /// Fail markers needed before an election
        #[arg(long, default_value = "2")]
        min_fail: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // File and environment first, then CLI overrides
    let mut config = Config::load(cli.config.as_deref())?;
    if !cli.zk.is_empty() {
        config.zk.hosts = cli.zk.clone();
    }
    if let Some(root) = cli.root.clone() {
        config.paths.root = root;
    }
    if let Some(level) = cli.log_level.clone() {
        config.log_level = level;
    }
    if let Commands::Serve { bind: Some(bind) } = &cli.command {
        config.server.bind_addr = *bind;
    }
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve { .. } => serve(config).await?,
        Commands::Status => status(config).await?,
        Commands::Init { servers, min_fail } => {
            let client = ZkCoordination::connect(
                &config.zk.connect_string(),
                config.zk.session_timeout(),
            )
            .await?;
            let paths = CoordinationPaths::from_config(&config.paths);
            init_layout(&client, &paths, &servers, min_fail).await?;
            client.close().await?;
            println!("Initialized {}", paths.root);
        }
    }

    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("zkswitch {} starting", zkswitch::VERSION);
    tracing::info!("Relay bind addr {}", config.server.bind_addr);

    let watcher = Watcher::connect(&config).await?;
    let relay = ProxyServer::bind(config.server.bind_addr, watcher.mirror()).await?;
    let (trigger, listener) = shutdown::channel();
    let relay = tokio::spawn(relay.run(listener));
    watcher.start();

    wait_for_signal().await;
    tracing::info!("Received shutdown signal");

    trigger.trigger();
    match relay.await {
        Ok(Err(e)) => tracing::warn!("Relay stopped with error: {}", e),
        Err(e) => tracing::warn!("Relay task failed: {}", e),
        Ok(Ok(())) => {}
    }
    watcher.shutdown().await?;
    Ok(())
}

async fn status(config: Config) -> anyhow::Result<()> {
    let client: Arc<dyn Coordination> = Arc::new(
        ZkCoordination::connect(&config.zk.connect_string(), config.zk.session_timeout()).await?,
    );
    let paths = CoordinationPaths::from_config(&config.paths);
    let mirror = Mirror::bind(client.clone(), &paths, config.watcher.mirror_retry());

    if !mirror.wait_loaded(config.zk.session_timeout()).await {
        tracing::warn!("Some keys were not read in time, showing partial state");
    }
    let snap = mirror.snapshot();
    mirror.shutdown().await;
    client.close().await?;

    println!("Root:        {}", paths.root);
    println!("Master:      {}", display_or(&snap.master, "(none)"));
    println!("Min fail:    {}", display_or(&snap.min_fail, "(unset)"));
    println!("Judge:       {}", display_or(&snap.judge, "(idle)"));
    println!("Servers:     {}", snap.servers.len());
    for srv in &snap.servers {
        println!("  - {}", srv);
    }
    println!("Fail marks:  {}", snap.fail_markers.len());
    for marker in &snap.fail_markers {
        println!("  - {}", marker);
    }
    Ok(())
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
