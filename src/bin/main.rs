use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use openraft::Raft;
use tracing::{error, info, info_span};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use ferrokv::{
    api::{self, KvService},
    cluster::ClusterManager,
    config::{create_raft_config, ConfigError, KvConfig, LogFormat, NodeId},
    network::{self, HttpNetworkFactory},
    router::LeaderRouter,
    storage::new_storage,
    ClusterMember, Consensus, DataFile, RaftConsensus, StateMachine,
};

/// Timeout for node-to-node raft RPCs, snapshot transfer included
const RAFT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "ferrokv-server")]
#[command(about = "A replicated key-value store using Raft consensus")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Node ID (overrides config file)
    #[arg(long, env = "NODE_ID")]
    pub id: Option<NodeId>,

    /// HTTP bind address (overrides config file)
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// HTTP port, keeping the configured bind host
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Host or host:port announced to the cluster
    #[arg(long, env = "RAFT_ADDRESS")]
    pub raft_address: Option<String>,

    /// Data directory (overrides config file)
    #[arg(long, env = "STORAGE_PATH")]
    pub data_dir: Option<PathBuf>,

    /// Address of a cluster member to join through
    #[arg(long, env = "RAFT_LEADER")]
    pub leader: Option<String>,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Generate default configuration file and exit
    #[arg(long)]
    pub generate_config: Option<PathBuf>,

    /// Validate configuration file and exit
    #[arg(long)]
    pub validate_config: bool,

    /// List default configuration file locations
    #[arg(long)]
    pub list_config_paths: bool,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Handle utility commands first
    if let Some(config_path) = args.generate_config {
        return generate_default_config(config_path);
    }

    if args.list_config_paths {
        list_config_paths();
        return Ok(());
    }

    let config = load_configuration(&args).context("Configuration error")?;

    if args.validate_config {
        println!("✅ Configuration is valid");
        match config.node.id {
            Some(id) => println!("📍 Node ID: {}", id),
            None => println!("📍 Node ID: generated on first start"),
        }
        println!("🌐 Listen Address: {}", config.node.listen_addr);
        println!("📣 Advertise Address: {}", config.node.advertise());
        println!("💾 Data Directory: {}", config.node.data_dir.display());
        println!("📊 Log Level: {}", config.logging.level);
        return Ok(());
    }

    setup_logging(&config)?;

    std::fs::create_dir_all(&config.node.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {}",
            config.node.data_dir.display()
        )
    })?;
    let node_id = config.node.resolve_id()?;
    let advertise = config.node.advertise();
    let span = info_span!("node", id = node_id);

    info!(parent: &span, "🚀 Starting ferrokv node {}", node_id);
    info!(
        parent: &span,
        "📁 Configuration loaded from: {}",
        args.config
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "defaults".to_string())
    );
    info!(parent: &span, "🌐 HTTP API: http://{}", config.node.listen_addr);
    info!(parent: &span, "📣 Advertised as: {}", advertise);
    info!(parent: &span, "💾 Data directory: {}", config.node.data_dir.display());

    // State machine over the data file
    let data = DataFile::new(config.node.data_file(), &config.storage);
    let fsm = Arc::new(StateMachine::new(data, info_span!(parent: &span, "fsm")));

    // Raft log and state machine stores
    let (log_store, state_machine_store) = new_storage(config.node.raft_dir(), fsm.clone())
        .await
        .context("Storage error")?;

    let network_factory = HttpNetworkFactory::new(RAFT_RPC_TIMEOUT)?;

    let raft_config = Arc::new(
        create_raft_config(&config.raft)
            .validate()
            .context("Invalid raft configuration")?,
    );
    let raft = Raft::new(
        node_id,
        raft_config,
        network_factory,
        log_store,
        state_machine_store,
    )
    .await
    .context("Raft error")?;

    let consensus: Arc<dyn Consensus> = Arc::new(RaftConsensus::new(
        raft.clone(),
        node_id,
        config.cluster.apply_timeout,
        config.cluster.join_timeout,
        info_span!(parent: &span, "consensus"),
    ));

    let cluster = Arc::new(ClusterManager::new(
        consensus.clone(),
        config.cluster.clone(),
        ClusterMember::new(node_id, advertise),
        info_span!(parent: &span, "cluster"),
    )?);

    let router = LeaderRouter::new(
        consensus.clone(),
        config.cluster.forward_timeout,
        info_span!(parent: &span, "router"),
    )?;

    let service = web::Data::new(KvService::new(
        consensus,
        fsm,
        cluster.clone(),
        router,
        info_span!(parent: &span, "api"),
    ));
    let raft_data = web::Data::new(raft.clone());

    // The join endpoint must be up before this node announces itself
    let listen_addr = config.node.listen_addr;
    info!(parent: &span, "🌐 Starting HTTP server on {}", listen_addr);
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(raft_data.clone())
            .app_data(service.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .configure(network::api::configure)
            .configure(api::configure)
    })
    .bind(listen_addr)
    .with_context(|| format!("Failed to bind {}", listen_addr))?
    .run();

    let handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    let _watcher = match cluster.start(config.node.leader.clone()).await {
        Ok(watcher) => watcher,
        Err(e) => {
            error!(parent: &span, "❌ Cluster startup failed: {}", e);
            handle.stop(true).await;
            raft.shutdown().await.context("Raft shutdown failed")?;
            return Err(e.into());
        }
    };

    let served = server_task.await.context("HTTP server task failed")?;
    info!(parent: &span, "HTTP server stopped, shutting down raft");
    raft.shutdown().await.context("Raft shutdown failed")?;

    served.context("HTTP server error")
}

/// Load configuration with CLI and environment overrides
fn load_configuration(args: &Args) -> Result<KvConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => KvConfig::from_file(path)?,
        None => KvConfig::load_default()?,
    };

    if let Some(id) = args.id {
        config.node.id = Some(id);
    }

    if let Some(ref listen_addr) = args.listen_addr {
        config.node.listen_addr = listen_addr
            .parse()
            .map_err(|e| ConfigError::Validation(format!("Invalid listen address: {}", e)))?;
    }

    if let Some(port) = args.port {
        config.node.listen_addr.set_port(port);
    }

    if let Some(ref raft_address) = args.raft_address {
        config.node.advertise_addr = Some(if raft_address.contains(':') {
            raft_address.clone()
        } else {
            format!("{}:{}", raft_address, config.node.listen_addr.port())
        });
    }

    if let Some(ref data_dir) = args.data_dir {
        config.node.data_dir = data_dir.clone();
    }

    if let Some(ref leader) = args.leader {
        config.node.leader = Some(leader.clone()).filter(|l| !l.is_empty());
    }

    if let Some(ref log_level) = args.log_level {
        config.logging.level = log_level.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Setup logging based on configuration
fn setup_logging(config: &KvConfig) -> anyhow::Result<()> {
    use tracing_subscriber::fmt::time::ChronoUtc;

    let level = config
        .logging
        .level
        .parse::<tracing::Level>()
        .map_err(|e| anyhow::anyhow!("Invalid log level: {}", e))?;

    let raft_level = if level <= tracing::Level::DEBUG {
        "debug"
    } else {
        "info"
    };
    let env_filter = EnvFilter::from_default_env()
        .add_directive(format!("ferrokv={}", level).parse()?)
        .add_directive(format!("openraft={}", raft_level).parse()?)
        .add_directive(format!("actix_web={}", level).parse()?);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(ChronoUtc::rfc_3339())
        .with_span_events(FmtSpan::CLOSE)
        .with_target(config.logging.structured);

    match (&config.logging.format, config.logging.enable_colors) {
        (LogFormat::Json, _) => subscriber.json().init(),
        (LogFormat::Compact, colors) => subscriber.compact().with_ansi(colors).init(),
        (LogFormat::Pretty, colors) => subscriber.pretty().with_ansi(colors).init(),
    }

    Ok(())
}

/// Generate a default configuration file
fn generate_default_config(path: PathBuf) -> anyhow::Result<()> {
    KvConfig::default()
        .to_file(&path)
        .context("Failed to write config")?;

    println!(
        "✅ Generated default configuration file: {}",
        path.display()
    );
    println!("📝 Edit the file to customize your ferrokv node settings");
    println!("🚀 Start with: ferrokv-server --config {}", path.display());

    Ok(())
}

/// List default configuration file locations
fn list_config_paths() {
    println!("📍 Default configuration file locations (in order of precedence):");
    println!();

    for (i, path) in KvConfig::default_config_paths().iter().enumerate() {
        let exists = if path.exists() { "✅" } else { "❌" };
        println!("  {}. {} {}", i + 1, exists, path.display());
    }

    println!();
    println!("💡 Tips:");
    println!("   • Create a config file in any of these locations");
    println!("   • Use --config <path> to specify a custom location");
    println!("   • Use --generate-config <path> to create a default config");
}
