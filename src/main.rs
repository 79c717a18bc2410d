//! ShellCache Daemon - offline-capable cache for installable web app shells
//!
//! This daemon installs an application shell from an origin and answers
//! requests from local request sources through the cache.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use shellcache::ipc::IpcServer;
use shellcache::{
    CacheGateway, CacheStore, DaemonConfig, DiskStore, HttpNetwork, MemoryStore, Network,
    Registration, Request,
};

/// How long shutdown waits for background cache writes
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run IPC server mode (default)
    Server,
    /// Install the shell into the configured version and exit
    Install,
    /// Fetch one URL through the cache layer (CLI mode)
    Fetch { url: String },
    /// List cache namespaces (CLI mode)
    Namespaces,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"ShellCache Daemon - Offline-capable cache for web app shells

USAGE:
    shellcache-daemon                    # Run IPC server (default)
    shellcache-daemon install
    shellcache-daemon fetch <url|path>
    shellcache-daemon namespaces
    shellcache-daemon help

COMMANDS:
    (none)      Install the shell, activate it, and serve request sources
    install     Install the shell into the configured version (CLI mode)
    fetch       Fetch a URL, or a path on the origin, through the cache layer (CLI mode)
    namespaces  List cache namespaces in the store (CLI mode)
    help        Show this help message

EXAMPLES:
    # Run IPC server against a local origin
    SHELLCACHE_ORIGIN=http://127.0.0.1:8080 shellcache-daemon

    # Fetch a page through the cache (origin taken from the URL)
    shellcache-daemon fetch http://127.0.0.1:8080/index.html

    # Fetch a path on the configured origin
    SHELLCACHE_ORIGIN=http://127.0.0.1:8080 shellcache-daemon fetch /styles.css

ENVIRONMENT:
    SHELLCACHE_ORIGIN         Origin serving the application (required)
    SHELLCACHE_VERSION        Cache version / namespace (default: shell-v1)
    SHELLCACHE_SHELL          Comma-separated shell paths
    SHELLCACHE_OFFLINE_PATH   Offline document (default: /offline.html)
    SHELLCACHE_CACHE_DIR      On-disk cache root
    SHELLCACHE_MEMORY         Keep the cache in memory only (true/false)
    SHELLCACHE_SOCKET         Socket path (default: /tmp/shellcache.sock)
    SHELLCACHE_TIMEOUT_SECS   Network timeout in seconds (default: 30)
    SHELLCACHE_INSTALL_ATTEMPTS  Install attempts (default: 3)
    SHELLCACHE_RETIRE_GRACE_MS   Cutover wait for old cache writes (default: 5000)
    SHELLCACHE_MAX_COMMAND_BYTES Longest socket command line (default: 8 MiB)
    RUST_LOG                  Log filter (trace, debug, info, warn, error)

NOTE:
    IPC server mode is the normal operation. CLI commands are for testing.
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Server);
    }

    match args[1].as_str() {
        "install" => Ok(Command::Install),
        "fetch" => {
            if args.len() < 3 {
                return Err(anyhow!("Usage: shellcache-daemon fetch <url|path>"));
            }
            Ok(Command::Fetch {
                url: args[2].clone(),
            })
        }
        "namespaces" => Ok(Command::Namespaces),
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

fn load_config(command: &Command) -> Result<DaemonConfig> {
    // A fetched URL stands in for the origin when none is configured
    let origin_hint = match command {
        Command::Fetch { url } => Url::parse(url)
            .ok()
            .map(|u| u.origin().ascii_serialization()),
        _ => None,
    };
    let origin = env::var("SHELLCACHE_ORIGIN").ok().or(origin_hint);

    DaemonConfig::from_env(origin.as_deref()).context("Invalid configuration")
}

fn open_store(config: &DaemonConfig) -> Result<Arc<dyn CacheStore>> {
    if config.memory_only {
        info!("Using in-memory cache store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = DiskStore::with_root(config.cache_dir.clone())
        .with_context(|| format!("Failed to open cache at {}", config.cache_dir.display()))?;
    info!(root = %store.root().display(), "Using disk cache store");
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if matches!(command, Command::Help) {
        print_help();
        return Ok(());
    }

    let config = load_config(&command)?;
    let store = open_store(&config)?;
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::with_timeout(config.request_timeout)?);

    match command {
        Command::Server => {
            info!(
                origin = %config.gateway.origin,
                version = %config.gateway.version,
                "Starting ShellCache daemon in IPC server mode"
            );

            let registration = Arc::new(
                Registration::new(Arc::clone(&store), Arc::clone(&network))
                    .with_install_attempts(config.install_attempts)
                    .with_retire_grace(config.retire_grace),
            );

            // Without an installed shell the daemon still serves, passing
            // everything through, and can be redeployed over the socket.
            if let Err(e) = registration.deploy(config.gateway.clone()).await {
                error!(error = %e, "Initial deploy failed; requests pass through");
            }

            let mut ipc_server = IpcServer::new(
                Arc::clone(&registration),
                config.gateway.clone(),
                config.socket_path.clone(),
            )
            .with_max_command_bytes(config.max_command_bytes);
            if let Err(e) = ipc_server.start().await {
                error!(error = %e, "Failed to start IPC server");
                return Err(e);
            }
            let ipc_server = Arc::new(ipc_server);

            info!(
                socket = %ipc_server.socket_path().display(),
                "Daemon ready. Waiting for request sources..."
            );

            // Run IPC server in a separate task
            let server = Arc::clone(&ipc_server);
            let ipc_handle = tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "IPC server error");
                }
            });

            // Wait for Ctrl+C
            tokio::signal::ctrl_c().await?;

            info!("Received shutdown signal, flushing background writes...");
            ipc_handle.abort();
            if tokio::time::timeout(SHUTDOWN_GRACE, registration.settle())
                .await
                .is_err()
            {
                warn!("Background writes still pending at shutdown");
            }
            ipc_server.stop().await?;

            info!("Shutdown complete.");
        }
        Command::Install => {
            let gateway = CacheGateway::new(config.gateway.clone(), Arc::clone(&store), network);
            if let Err(e) = gateway.install().await {
                error!(error = %e, "Install failed");
                return Err(e.into());
            }
            let entries = store.keys(gateway.version()).await?.len();
            println!(
                "Installed {} shell entries into {}",
                entries,
                gateway.version()
            );
        }
        Command::Fetch { url } => {
            let url = config
                .gateway
                .resolve(&url)
                .with_context(|| format!("Invalid URL {}", url))?;
            let registration = Registration::new(Arc::clone(&store), network)
                .with_install_attempts(config.install_attempts);

            if let Err(e) = registration.deploy(config.gateway.clone()).await {
                warn!(error = %e, "Install failed; fetching without the cache");
            }

            let client = registration.connect().await;
            let response = registration
                .respond(client, Request::get(url.clone()))
                .await
                .with_context(|| format!("Failed to fetch {}", url))?;
            registration.settle().await;

            println!(
                "{} {} ({:?}, {} bytes)",
                response.status,
                url,
                response.source,
                response.body.len()
            );
        }
        Command::Namespaces => {
            let mut namespaces = store.namespaces().await?;
            namespaces.sort();
            if namespaces.is_empty() {
                println!("No cache namespaces.");
            } else {
                println!("Cache namespaces:");
                for namespace in namespaces {
                    let entries = store.keys(&namespace).await?.len();
                    let marker = if namespace == config.gateway.version {
                        " (configured)"
                    } else {
                        ""
                    };
                    println!("  {} - {} entries{}", namespace, entries, marker);
                }
            }
        }
        Command::Help => {
            print_help();
        }
    }

    Ok(())
}
