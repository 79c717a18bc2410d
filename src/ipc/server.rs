//! IPC Server - Unix socket server for request sources
//!
//! Each connection is one request source. Commands are dispatched to the
//! registration, which routes them to the active cache version.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{GatewayConfig, MAX_COMMAND_BYTES};
use crate::gateway::{ClientId, Registration};
use crate::ipc::protocol::{parse_command, serialize_reply, Command, Reply};

/// IPC Server that listens for request sources
pub struct IpcServer {
    /// Owner of the active cache version
    registration: Arc<Registration>,
    /// Shell settings new versions are deployed with
    base_config: GatewayConfig,
    /// Where the socket lives
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
    /// Active connections counter
    connection_count: Arc<RwLock<u32>>,
    /// Longest accepted command line
    max_command_bytes: usize,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(
        registration: Arc<Registration>,
        base_config: GatewayConfig,
        socket_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registration,
            base_config,
            socket_path: socket_path.into(),
            listener: None,
            connection_count: Arc::new(RwLock::new(0)),
            max_command_bytes: MAX_COMMAND_BYTES,
        }
    }

    /// Cap the size of a single command line
    pub fn with_max_command_bytes(mut self, limit: usize) -> Self {
        self.max_command_bytes = limit;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Start the IPC server
    pub async fn start(&mut self) -> Result<()> {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind Unix socket {}", self.socket_path.display()))?;

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
                    let registration = Arc::clone(&self.registration);
                    let base_config = self.base_config.clone();
                    let connection_count = Arc::clone(&self.connection_count);
                    let limit = self.max_command_bytes;

                    // Spawn a new task to handle this connection
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(
                            stream,
                            registration,
                            base_config,
                            connection_count,
                            limit,
                        )
                        .await
                        {
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

/// Handle a single request source
async fn handle_connection(
    stream: UnixStream,
    registration: Arc<Registration>,
    base_config: GatewayConfig,
    connection_count: Arc<RwLock<u32>>,
    limit: usize,
) -> Result<()> {
    {
        let mut count = connection_count.write().await;
        *count += 1;
        debug!(count = *count, "New connection");
    }

    let client = registration.connect().await;
    let result = serve_client(stream, client, &registration, &base_config, limit).await;
    registration.disconnect(client);

    {
        let mut count = connection_count.write().await;
        *count = count.saturating_sub(1);
        debug!(count = *count, client = client, "Connection ended");
    }

    result
}

async fn serve_client(
    stream: UnixStream,
    client: ClientId,
    registration: &Registration,
    base_config: &GatewayConfig,
    limit: usize,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = Vec::new();

    // Read commands line by line (newline-delimited JSON)
    loop {
        line.clear();
        let read = (&mut buf_reader)
            .take(limit as u64 + 1)
            .read_until(b'\n', &mut line)
            .await
            .context("Failed to read from socket")?;
        if read == 0 {
            debug!(client = client, "Connection closed by client");
            return Ok(());
        }

        if line.len() > limit && line.last() != Some(&b'\n') {
            // No way to find the next command boundary; drop the source
            warn!(client = client, limit = limit, "Command too large, closing connection");
            let reply = Reply::Error {
                error: format!("Command exceeds {} bytes", limit),
            };
            let json = serialize_reply(&reply).context("Failed to serialize reply")?;
            writer
                .write_all(&json)
                .await
                .context("Failed to write reply")?;
            return Ok(());
        }

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        let reply = match parse_command(trimmed) {
            Ok(command) => process_command(command, client, registration, base_config).await,
            Err(e) => {
                warn!(error = %e, "Failed to parse command");
                Reply::Error {
                    error: format!("Invalid command: {}", e),
                }
            }
        };

        let json = serialize_reply(&reply).context("Failed to serialize reply")?;
        writer
            .write_all(&json)
            .await
            .context("Failed to write reply")?;
    }
}

/// Process a command and return a reply
pub async fn process_command(
    command: Command,
    client: ClientId,
    registration: &Registration,
    base_config: &GatewayConfig,
) -> Reply {
    match command {
        Command::Fetch(fetch) => {
            let request = match fetch.into_request() {
                Ok(request) => request,
                Err(error) => return Reply::Error { error },
            };
            debug!(client = client, method = %request.method, url = %request.url, "Processing fetch command");

            match registration.respond(client, request).await {
                Ok(response) => Reply::from(response),
                Err(e) => Reply::Error {
                    error: format!("Request failed: {}", e),
                },
            }
        }

        Command::GetStatus => {
            debug!("Processing getStatus command");
            Reply::from(registration.status().await)
        }

        Command::Deploy { version } => {
            info!(version = %version, "Processing deploy command");

            let config = match base_config.with_version(&version) {
                Ok(config) => config,
                Err(e) => {
                    return Reply::Error {
                        error: format!("Invalid version: {}", e),
                    }
                }
            };

            match registration.deploy(config).await {
                Ok(_) => Reply::Success {
                    message: Some(format!("Version {} is active", version)),
                },
                Err(e) => Reply::Error {
                    error: format!("Deploy failed: {}", e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ResponseSource;
    use crate::store::MemoryStore;
    use crate::test_support::{serve_shell, test_config, ScriptedNetwork};

    async fn exchange(stream: &mut BufReader<UnixStream>, command: &str) -> serde_json::Value {
        stream.get_mut().write_all(command.as_bytes()).await.unwrap();
        stream.get_mut().write_all(b"\n").await.unwrap();
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("shellcache.sock");

        let network = Arc::new(ScriptedNetwork::new());
        serve_shell(&network);
        let registration = Arc::new(Registration::new(
            Arc::new(MemoryStore::new()),
            network.clone(),
        ));

        let mut server = IpcServer::new(Arc::clone(&registration), test_config("v1"), &socket);
        server.start().await.unwrap();
        let server = Arc::new(server);
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });

        let mut stream = BufReader::new(UnixStream::connect(&socket).await.unwrap());

        let reply = exchange(&mut stream, r#"{"type":"deploy","version":"v1"}"#).await;
        assert_eq!(reply["type"], "success");

        let reply = exchange(
            &mut stream,
            r#"{"type":"fetch","url":"https://app.test/index.html"}"#,
        )
        .await;
        assert_eq!(reply["type"], "fetched");
        assert_eq!(reply["status"], 200);

        network.set_offline(true);
        let reply = exchange(
            &mut stream,
            r#"{"type":"fetch","url":"https://app.test/scores","mode":"navigate"}"#,
        )
        .await;
        assert_eq!(reply["source"], "fallback");

        let reply = exchange(&mut stream, r#"{"type":"getStatus"}"#).await;
        assert_eq!(reply["activeVersion"], "v1");
        assert_eq!(reply["clients"], 1);

        let reply = exchange(&mut stream, "not json").await;
        assert_eq!(reply["type"], "error");

        server.stop().await.unwrap();
    }

    async fn start_server(
        dir: &tempfile::TempDir,
        limit: usize,
    ) -> (Arc<IpcServer>, BufReader<UnixStream>) {
        let socket = dir.path().join("shellcache.sock");
        let registration = Arc::new(Registration::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedNetwork::new()),
        ));

        let mut server = IpcServer::new(registration, test_config("v1"), &socket)
            .with_max_command_bytes(limit);
        server.start().await.unwrap();
        let server = Arc::new(server);
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });

        let stream = BufReader::new(UnixStream::connect(&socket).await.unwrap());
        (server, stream)
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_reported_and_connection_kept() {
        let dir = tempfile::tempdir().unwrap();
        let (server, mut stream) = start_server(&dir, MAX_COMMAND_BYTES).await;

        stream.get_mut().write_all(b"\xff\xfe{\n").await.unwrap();
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        let reply: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["type"], "error");

        let reply = exchange(&mut stream, r#"{"type":"getStatus"}"#).await;
        assert_eq!(reply["type"], "status");

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_command_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (server, mut stream) = start_server(&dir, 64).await;

        let padding = "x".repeat(200);
        let command = format!("{{\"type\":\"deploy\",\"version\":\"{}\"}}\n", padding);
        stream.get_mut().write_all(command.as_bytes()).await.unwrap();

        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        let reply: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(reply["type"], "error");

        let mut rest = String::new();
        let read = stream.read_line(&mut rest).await.unwrap_or(0);
        assert_eq!(read, 0, "server must hang up after an oversized command");

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pass_through_error_is_reported() {
        let network = Arc::new(ScriptedNetwork::new());
        network.set_offline(true);
        let registration = Registration::new(Arc::new(MemoryStore::new()), network);
        let client = registration.connect().await;

        let command =
            parse_command(br#"{"type":"fetch","url":"https://app.test/api/live"}"#).unwrap();
        let reply = process_command(command, client, &registration, &test_config("v1")).await;

        assert!(matches!(reply, Reply::Error { .. }));
    }

    #[tokio::test]
    async fn test_failed_deploy_is_reported() {
        let network = Arc::new(ScriptedNetwork::new());
        let registration = Registration::new(Arc::new(MemoryStore::new()), network)
            .with_install_attempts(1);

        let reply = process_command(
            Command::Deploy {
                version: "v1".to_string(),
            },
            0,
            &registration,
            &test_config("v1"),
        )
        .await;

        assert!(matches!(reply, Reply::Error { .. }));
        assert!(registration.active().await.is_none());
    }

    #[test]
    fn test_fetched_reply_keeps_source() {
        let mut response = crate::http::Response::new(200, "x");
        response.source = ResponseSource::Fallback;
        match Reply::from(response) {
            Reply::Fetched { source, .. } => assert_eq!(source, ResponseSource::Fallback),
            _ => panic!("Expected Fetched reply"),
        }
    }
}
