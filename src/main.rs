use anyhow::Context;
use clap::{Parser, Subcommand};
use portero::config::Config;
use portero::Portero;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portero")]
#[command(about = "A lightweight PostgreSQL connection pooler and request router")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Portero Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the portero pooler
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/portero.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_portero(config),
        Commands::Config { output } => generate_config(output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn run_portero(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config)?;

    info!("Starting portero v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Routes configured: {}", config.routes.len());
    info!("Listening on: {}", config.server.listen_addr);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.server.worker_threads {
        builder.worker_threads(workers);
    }
    let runtime = builder.build().context("Failed to build tokio runtime")?;

    let portero = Arc::new(Portero::new(config).context("Failed to initialize portero")?);
    runtime
        .block_on(portero.run())
        .context("Failed to run portero")?;

    Ok(())
}

fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    println!("Generating example configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  portero run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    let config = Config::load_from_file(&config_path).map_err(|e| {
        eprintln!("✗ Configuration file validation failed:");
        eprintln!("  {}", e);
        anyhow::anyhow!(e)
    })?;

    println!("✓ Configuration file is valid");
    println!("  Listen address: {}", config.server.listen_addr);
    println!("  Max connections: {}", config.server.max_connections);
    println!("  Routes: {} configured", config.routes.len());
    for (i, route) in config.routes.iter().enumerate() {
        println!(
            "    {}: {} -> {} ({} pooling, pool size {}{})",
            i + 1,
            route.database,
            route.server_addr,
            route.pooling_mode,
            route.pool_size,
            if route.default { ", default" } else { "" }
        );
    }

    Ok(())
}

fn show_version() {
    println!("portero v{}", env!("CARGO_PKG_VERSION"));
    println!("A lightweight PostgreSQL connection pooler and request router");
    println!();
    println!("Features:");
    println!("  • Session-granularity server connection pooling");
    println!("  • Static route schemes with forced-identity overrides");
    println!("  • Lazily created per-identity routes and server pools");
    println!("  • High-performance async I/O with Tokio");
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    match config.logging.file.as_deref() {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            if config.logging.format == "json" {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(Arc::new(file))
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(Arc::new(file))
                    .init();
            }
        }
        None => {
            if config.logging.format == "json" {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .json()
                    .init();
            } else {
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        }
    }

    Ok(())
}
