//! JACS File Cache Daemon - local disk cache for WebDAV files
//!
//! Mirrors remote files into a bounded local tree and hands their paths to
//! clients over a Unix socket.

mod cache;
mod config;
mod ipc;
mod webdav;
mod worker;

use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cache::{LocalFileCache, MetadataCache};
use config::Settings;
use ipc::{IpcServer, ServerContext};
use webdav::{RemoteStore, WebDavClient};
use worker::{run_blocking, ErrorHandler};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run IPC server mode (default)
    Server,
    /// Fetch one file into the cache and print its local path
    Fetch { url: String },
    /// List a remote collection
    List { url: String, recursive: bool },
    /// Upload a local file
    Put { file: PathBuf, url: String },
    /// Create a remote collection
    Mkdir { url: String },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"JACS File Cache - Local disk cache for WebDAV files

USAGE:
    jacs-file-cache                  # Run IPC server (default)
    jacs-file-cache fetch <url>
    jacs-file-cache list [-r] <url>
    jacs-file-cache put <file> <url>
    jacs-file-cache mkdir <url>
    jacs-file-cache help

COMMANDS:
    (none)  Run IPC server mode (waits for commands from clients)
    fetch   Cache a remote file and print its local path
    list    List the direct children of a remote collection (-r: every file below it)
    put     Upload a local file
    mkdir   Create a remote collection
    help    Show this help message

    <url> is an absolute URL or a path relative to JACS_WEBDAV_URL.

ENVIRONMENT:
    JACS_CACHE_DIR           Cache root (default: user cache dir/jacs-file-cache)
    JACS_CACHE_CAPACITY_KB   Cache capacity in kilobytes (default: 1048576)
    JACS_WEBDAV_URL          Base URL of the WebDAV server
    JACS_AUTH_TOKEN          Bearer token for the WebDAV server
    JACS_WEBDAV_USER         Basic auth user (with JACS_WEBDAV_PASSWORD)
    JACS_WEBDAV_PASSWORD     Basic auth password
    JACS_SOCKET              IPC socket path (default: /tmp/jacs-file-cache.sock)
    JACS_METADATA_TTL_SECS   Lifetime of cached listings (default: 30)
    RUST_LOG                 Log filter (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Server);
    }

    match args[1].as_str() {
        "fetch" | "mkdir" => {
            let url = args
                .get(2)
                .cloned()
                .ok_or_else(|| anyhow!("Usage: jacs-file-cache {} <url>", args[1]))?;
            if args[1] == "fetch" {
                Ok(Command::Fetch { url })
            } else {
                Ok(Command::Mkdir { url })
            }
        }
        "list" => {
            let recursive = args.get(2).map(|a| a == "-r").unwrap_or(false);
            let position = if recursive { 3 } else { 2 };
            let url = args
                .get(position)
                .cloned()
                .ok_or_else(|| anyhow!("Usage: jacs-file-cache list [-r] <url>"))?;
            Ok(Command::List { url, recursive })
        }
        "put" => {
            if args.len() < 4 {
                return Err(anyhow!("Usage: jacs-file-cache put <file> <url>"));
            }
            Ok(Command::Put {
                file: PathBuf::from(&args[2]),
                url: args[3].clone(),
            })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };
    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let settings = Arc::new(Settings::from_env().context("Invalid configuration")?);
    let metadata = Arc::new(MetadataCache::with_ttl(settings.metadata_ttl));
    let client = WebDavClient::new(settings.credentials.clone(), Arc::clone(&metadata))?;
    let store: Arc<dyn RemoteStore> = Arc::new(client);

    let errors = ErrorHandler::new();

    match command {
        Command::Server => {
            info!("Starting JACS file cache daemon in IPC server mode");

            let cache_dir = settings.cache_dir.clone();
            let capacity_kb = settings.capacity_kb;
            let cache = run_blocking(move || LocalFileCache::open(&cache_dir, capacity_kb, store))
                .await
                .context("Failed to open file cache")?;

            let mut ipc_server = IpcServer::new(ServerContext {
                cache: Arc::new(cache),
                metadata,
                settings: Arc::clone(&settings),
                errors: errors.clone(),
            });
            if let Err(e) = ipc_server.start().await {
                error!(error = %e, "Failed to start IPC server");
                return Err(e);
            }

            info!("Daemon ready. Waiting for commands...");

            let ipc_server = Arc::new(ipc_server);
            let running = Arc::clone(&ipc_server);
            let ipc_handle = tokio::spawn(async move {
                if let Err(e) = running.run().await {
                    error!(error = %e, "IPC server error");
                }
            });

            let mut shutdown = errors.subscribe();
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Received shutdown signal");
                }
                _ = shutdown.wait_for(|fatal| *fatal) => {
                    error!("Shutting down after a fatal error");
                }
            }

            ipc_handle.abort();
            ipc_server.stop().await?;
            info!("Shutdown complete.");

            if errors.is_shutting_down() {
                std::process::exit(1);
            }
        }
        Command::Fetch { url } => {
            let url = settings.resolve_url(&url)?;
            let cache_dir = settings.cache_dir.clone();
            let capacity_kb = settings.capacity_kb;

            let result = run_blocking(move || {
                let cache = LocalFileCache::open(&cache_dir, capacity_kb, store)?;
                let entry = cache.get(&url).map_err(anyhow::Error::new)?;
                cache.run_pending_tasks();
                Ok(entry)
            })
            .await;

            match result {
                Ok(entry) => println!("{}", entry.local_path().display()),
                Err(e) => {
                    errors.handle("fetch", &e);
                    return Err(e);
                }
            }
        }
        Command::List { url, recursive } => {
            let url = settings.resolve_url(&url)?;

            let result = run_blocking(move || {
                let files = if recursive {
                    store.find_all_internal_files(&url)
                } else {
                    store.find_immediate_internal_files(&url)
                };
                files.map_err(anyhow::Error::new)
            })
            .await;

            match result {
                Ok(files) if files.is_empty() => println!("Collection is empty."),
                Ok(files) => {
                    for file in files {
                        if file.is_directory {
                            println!("  {}/", file.base_name());
                        } else {
                            println!("  {} ({} KB)", file.base_name(), file.kilobytes());
                        }
                    }
                }
                Err(e) => {
                    errors.handle("list", &e);
                    return Err(e);
                }
            }
        }
        Command::Put { file, url } => {
            let url = settings.resolve_url(&url)?;
            if !file.is_file() {
                return Err(anyhow!("{} is not a file", file.display()));
            }

            let target = url.clone();
            let result = run_blocking(move || {
                store
                    .save_file(&target, &file)
                    .map_err(anyhow::Error::new)
            })
            .await;

            match result {
                Ok(()) => println!("Uploaded {}", url),
                Err(e) => {
                    errors.handle("put", &e);
                    return Err(e);
                }
            }
        }
        Command::Mkdir { url } => {
            let url = settings.resolve_url(&url)?;

            let target = url.clone();
            let result = run_blocking(move || {
                if store.is_available(&target)? {
                    return Ok(false);
                }
                store.create_directory(&target)?;
                Ok(true)
            })
            .await;

            match result {
                Ok(true) => println!("Created {}", url),
                Ok(false) => println!("{} already exists", url),
                Err(e) => {
                    errors.handle("mkdir", &e);
                    return Err(e);
                }
            }
        }
        Command::Help => {}
    }

    Ok(())
}
