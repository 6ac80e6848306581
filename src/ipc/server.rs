//! IPC Server - Unix socket server for cache clients
//!
//! Handles incoming connections and dispatches commands to the file cache.
//! Cache and WebDAV work is blocking, so every command that touches them
//! runs on the blocking pool.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::cache::{LocalFileCache, MetadataCache};
use crate::config::Settings;
use crate::ipc::protocol::{
    parse_command, serialize_response, Command, RemoteEntry, Response, PROTOCOL_VERSION,
};
use crate::worker::{run_blocking, spawn_with_callback, ErrorHandler, TaskOutcome};

/// Everything a command handler needs
pub struct ServerContext {
    pub cache: Arc<LocalFileCache>,
    /// Remote PROPFIND cache, dropped together with the file cache
    pub metadata: Arc<MetadataCache>,
    pub settings: Arc<Settings>,
    pub errors: ErrorHandler,
}

/// IPC Server that listens for commands from cache clients
pub struct IpcServer {
    context: Arc<ServerContext>,
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
    /// Active connections counter
    connection_count: Arc<RwLock<u32>>,
}

impl IpcServer {
    /// Create a new IPC server bound to the configured socket path
    pub fn new(context: ServerContext) -> Self {
        let socket_path = context.settings.socket_path.clone();
        Self {
            context: Arc::new(context),
            socket_path,
            listener: None,
            connection_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Start the IPC server
    pub async fn start(&mut self) -> Result<()> {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind Unix socket: {:?}", self.socket_path))?;

        info!(socket_path = %self.socket_path.display(), "IPC server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let context = Arc::clone(&self.context);
                    let connection_count = Arc::clone(&self.connection_count);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, context, connection_count).await {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Stop the IPC server and clean up
    pub async fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!("IPC server stopped");
        Ok(())
    }

    /// Get the number of active connections
    pub async fn connection_count(&self) -> u32 {
        *self.connection_count.read().await
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    context: Arc<ServerContext>,
    connection_count: Arc<RwLock<u32>>,
) -> Result<()> {
    {
        let mut count = connection_count.write().await;
        *count += 1;
        debug!(count = *count, "New connection");
    }

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    // Newline-delimited JSON, one response per command
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Connection closed by client");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                debug!(command = %trimmed, "Received command");

                let response = match parse_command(trimmed.as_bytes()) {
                    Ok(command) => process_command(command, &context).await,
                    Err(e) => {
                        error!(error = %e, command = %trimmed, "Failed to parse command");
                        Response::Error {
                            error: format!("Invalid command: {}", e),
                        }
                    }
                };

                match serialize_response(&response) {
                    Ok(json) => {
                        if let Err(e) = writer.write_all(&json).await {
                            error!(error = %e, "Failed to write response");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    {
        let mut count = connection_count.write().await;
        *count = count.saturating_sub(1);
        debug!(count = *count, "Connection ended");
    }

    Ok(())
}

/// Report a failed request and turn it into an error response
fn failure(context: &ServerContext, operation: &str, err: anyhow::Error) -> Response {
    context.errors.handle(operation, &err);
    Response::Error {
        error: format!("{} failed: {:#}", operation, err),
    }
}

/// Process a command and return a response
async fn process_command(command: Command, context: &ServerContext) -> Response {
    match command {
        Command::Fetch { url } => {
            info!(url = %url, "Processing fetch command");

            let url = match context.settings.resolve_url(&url) {
                Ok(url) => url,
                Err(e) => return failure(context, "Fetch", e),
            };
            let cache = Arc::clone(&context.cache);
            let result = run_blocking(move || cache.get(&url).map_err(anyhow::Error::new)).await;

            match result {
                Ok(entry) => Response::File {
                    url: entry.url().to_string(),
                    local_path: entry.local_path().to_string_lossy().to_string(),
                    size_bytes: entry.remote().size_bytes,
                },
                Err(e) => failure(context, "Fetch", e),
            }
        }

        Command::Evict { url } => {
            info!(url = %url, "Processing evict command");

            let url = match context.settings.resolve_url(&url) {
                Ok(url) => url,
                Err(e) => return failure(context, "Evict", e),
            };
            let cache = Arc::clone(&context.cache);
            let target = url.clone();
            let result = run_blocking(move || {
                let present = cache.evict(&target);
                cache.run_pending_tasks();
                Ok(present)
            })
            .await;

            match result {
                Ok(true) => Response::Success {
                    message: Some(format!("Evicted {}", url)),
                },
                Ok(false) => Response::Error {
                    error: format!("Not cached: {}", url),
                },
                Err(e) => failure(context, "Evict", e),
            }
        }

        Command::List { url } => {
            info!(url = %url, "Processing list command");

            let url = match context.settings.resolve_url(&url) {
                Ok(url) => url,
                Err(e) => return failure(context, "List", e),
            };
            let cache = Arc::clone(&context.cache);
            let result = run_blocking(move || {
                cache
                    .store()
                    .find_immediate_internal_files(&url)
                    .map_err(anyhow::Error::new)
            })
            .await;

            match result {
                Ok(files) => Response::Listing {
                    files: files.iter().map(RemoteEntry::from).collect(),
                },
                Err(e) => failure(context, "List", e),
            }
        }

        Command::Clear => {
            info!("Processing clear command");

            let cache = Arc::clone(&context.cache);
            let metadata = Arc::clone(&context.metadata);
            let errors = context.errors.clone();
            spawn_with_callback(
                move || {
                    metadata.clear();
                    cache.clear();
                    Ok(cache.stats())
                },
                move |outcome| match outcome {
                    TaskOutcome::Succeeded(stats) => {
                        info!(entries = stats.entries, used_kb = stats.used_kb, "Cache clear finished")
                    }
                    TaskOutcome::Failed(e) => {
                        errors.handle("Clear", &e);
                    }
                },
            );

            Response::Success {
                message: Some("Cache clear started".to_string()),
            }
        }

        Command::GetStatus => {
            debug!("Processing getStatus command");

            let cache = Arc::clone(&context.cache);
            let result = run_blocking(move || {
                let health = cache.store().health();
                Ok((cache.stats(), health))
            })
            .await;

            let (metadata_hits, metadata_misses, _) = context.metadata.stats();

            match result {
                Ok((stats, remote_health)) => Response::Status {
                    version: PROTOCOL_VERSION,
                    healthy: !context.errors.is_shutting_down(),
                    remote_health: remote_health.to_string(),
                    entries: stats.entries,
                    used_kb: stats.used_kb,
                    capacity_kb: stats.capacity_kb,
                    hits: stats.hits,
                    misses: stats.misses,
                    metadata_hits,
                    metadata_misses,
                },
                Err(e) => failure(context, "Status", e),
            }
        }
    }
}
