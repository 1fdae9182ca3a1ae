//! Guest-side protocol implementation.
//!
//! Lives in the library (rather than only the guest binary) so the host
//! test-suite can run the real agent against a loopback listener.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::{
    read_message, write_message, AgentRequest, AgentResponse, Encoding, ErrorKind, OutputStream,
    ProtocolError, TIMEOUT_EXIT_CODE,
};

const OUTPUT_CHUNK_SIZE: usize = 8 * 1024;

pub struct AgentServer {
    workspace: PathBuf,
    started: Instant,
    shutdown_tx: watch::Sender<bool>,
}

impl AgentServer {
    pub fn new(workspace: impl Into<PathBuf>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            workspace: workspace.into(),
            started: Instant::now(),
            shutdown_tx,
        })
    }

    /// Resolves once a `shutdown` request has been acknowledged.
    pub fn shutdown_requested(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Accept loop. Returns when shutdown is requested.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "agent connection accepted");
                    let server = self.clone();
                    tokio::spawn(async move {
                        let (reader, writer) = stream.into_split();
                        if let Err(e) = server.handle_connection(reader, writer).await {
                            debug!(error = %e, "agent connection ended");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("agent shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Serve one connection: requests are processed strictly in order.
    pub async fn handle_connection<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            let request: AgentRequest = match read_message(&mut reader).await {
                Ok(r) => r,
                Err(ProtocolError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };

            match request {
                AgentRequest::Execute {
                    id,
                    command,
                    args,
                    cwd,
                    env,
                    timeout_secs,
                    stream,
                } => {
                    self.handle_execute(
                        &mut writer,
                        id,
                        command,
                        args,
                        cwd,
                        env,
                        timeout_secs,
                        stream,
                    )
                    .await?;
                }
                AgentRequest::FileWrite {
                    id,
                    path,
                    content,
                    encoding,
                    mode,
                } => {
                    let response = self.handle_file_write(id, path, content, encoding, mode).await;
                    write_message(&mut writer, &response).await?;
                }
                AgentRequest::FileRead { id, path, encoding } => {
                    let response = self.handle_file_read(id, path, encoding).await;
                    write_message(&mut writer, &response).await?;
                }
                AgentRequest::Ping { id } => {
                    let response = AgentResponse::Pong {
                        id,
                        timestamp: chrono::Utc::now(),
                        uptime_secs: self.started.elapsed().as_secs(),
                    };
                    write_message(&mut writer, &response).await?;
                }
                AgentRequest::Shutdown { id, .. } => {
                    let response = AgentResponse::ShutdownResult { id, success: true };
                    write_message(&mut writer, &response).await?;
                    let _ = self.shutdown_tx.send(true);
                    return Ok(());
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_execute<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        id: String,
        command: String,
        args: Vec<String>,
        cwd: Option<String>,
        env: HashMap<String, String>,
        timeout_secs: Option<u64>,
        stream: bool,
    ) -> Result<(), ProtocolError> {
        let cwd = cwd.map(PathBuf::from).unwrap_or_else(|| self.workspace.clone());
        if tokio::fs::create_dir_all(&cwd).await.is_err() {
            warn!(cwd = %cwd.display(), "cannot create working directory");
        }

        // A bare command string goes through the shell; an argv vector is
        // spawned directly.
        let mut cmd = if args.is_empty() {
            let mut sh = Command::new("sh");
            sh.arg("-c").arg(&command);
            sh
        } else {
            let mut direct = Command::new(&command);
            direct.args(&args);
            direct
        };
        cmd.current_dir(&cwd)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let response = AgentResponse::Error {
                    id,
                    kind: ErrorKind::SpawnError,
                    message: format!("{command}: {e}"),
                };
                return write_message(writer, &response).await;
            }
        };

        let (tx, mut rx) = mpsc::channel::<(OutputStream, Vec<u8>)>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, OutputStream::Stderr, tx));
        }

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();

        let collect = async {
            while let Some((out_stream, data)) = rx.recv().await {
                let text = String::from_utf8_lossy(&data).into_owned();
                match out_stream {
                    OutputStream::Stdout => stdout_buf.push_str(&text),
                    OutputStream::Stderr => stderr_buf.push_str(&text),
                }
                if stream {
                    let chunk = AgentResponse::Output {
                        id: id.clone(),
                        stream: out_stream,
                        data: text,
                    };
                    write_message(writer, &chunk).await?;
                }
            }
            // Pumps closed: the process has exited.
            let status = child.wait().await?;
            Ok::<_, ProtocolError>(status.code().unwrap_or(-1))
        };

        let exit_code = match timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), collect).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(command = %command, secs, "execute timed out");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    TIMEOUT_EXIT_CODE
                }
            },
            None => collect.await?,
        };

        let response = AgentResponse::ExecuteResult {
            id,
            exit_code,
            stdout: stdout_buf,
            stderr: stderr_buf,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        write_message(writer, &response).await
    }

    async fn handle_file_write(
        &self,
        id: String,
        path: String,
        content: String,
        encoding: Encoding,
        mode: Option<u32>,
    ) -> AgentResponse {
        let bytes = match encoding {
            Encoding::Utf8 => content.into_bytes(),
            Encoding::Base64 => {
                match base64::engine::general_purpose::STANDARD.decode(content.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        return AgentResponse::Error {
                            id,
                            kind: ErrorKind::FileWriteError,
                            message: format!("bad base64 payload: {e}"),
                        }
                    }
                }
            }
        };

        let target = PathBuf::from(&path);
        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return AgentResponse::Error {
                    id,
                    kind: ErrorKind::FileWriteError,
                    message: format!("{path}: {e}"),
                };
            }
        }

        if let Err(e) = tokio::fs::write(&target, &bytes).await {
            return AgentResponse::Error {
                id,
                kind: ErrorKind::FileWriteError,
                message: format!("{path}: {e}"),
            };
        }

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode)).await;
        }
        #[cfg(not(unix))]
        let _ = mode;

        AgentResponse::FileWriteResult { id, success: true }
    }

    async fn handle_file_read(&self, id: String, path: String, encoding: Encoding) -> AgentResponse {
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let content = match encoding {
                    Encoding::Utf8 => String::from_utf8_lossy(&bytes).into_owned(),
                    Encoding::Base64 => base64::engine::general_purpose::STANDARD.encode(&bytes),
                };
                AgentResponse::FileReadResult {
                    id,
                    content,
                    encoding,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentResponse::Error {
                id,
                kind: ErrorKind::FileNotFound,
                message: path,
            },
            Err(e) => AgentResponse::Error {
                id,
                kind: ErrorKind::FileReadError,
                message: format!("{path}: {e}"),
            },
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(
    mut source: R,
    stream: OutputStream,
    tx: mpsc::Sender<(OutputStream, Vec<u8>)>,
) {
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}
