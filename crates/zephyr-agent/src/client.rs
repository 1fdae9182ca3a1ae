//! Host-side agent client.
//!
//! Connects either through the Firecracker hybrid-vsock Unix socket (the
//! hypervisor forwards a `CONNECT <port>` preamble to the guest CID) or
//! over TCP to the guest's host-visible address.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::{sleep, timeout};
use tracing::debug;
use zephyr_core::{Error, Result};

use crate::protocol::{
    read_message, write_message, AgentRequest, AgentResponse, Encoding, ExecuteOutcome,
    OutputStream, ProtocolError,
};

/// Boxed duplex stream so vsock and TCP transports share one client.
trait AgentStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AgentStream for T {}

pub struct AgentClient {
    stream: Box<dyn AgentStream>,
    next_id: u64,
}

impl AgentClient {
    /// Connect over TCP to the guest's host-visible address.
    pub async fn connect_tcp(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::AgentUnreachable(format!("{addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            stream: Box::new(stream),
            next_id: 0,
        })
    }

    /// Connect through the hypervisor's hybrid-vsock Unix socket.
    ///
    /// The handshake is one `CONNECT <port>\n` line; the hypervisor answers
    /// `OK <assigned-port>\n` once the guest accepts the stream.
    pub async fn connect_vsock(uds_path: &Path, port: u32) -> Result<Self> {
        let stream = UnixStream::connect(uds_path)
            .await
            .map_err(|e| Error::AgentUnreachable(format!("{}: {e}", uds_path.display())))?;
        let mut stream = BufReader::new(stream);

        use tokio::io::AsyncWriteExt;
        stream
            .get_mut()
            .write_all(format!("CONNECT {port}\n").as_bytes())
            .await
            .map_err(|e| Error::AgentUnreachable(e.to_string()))?;

        let mut ack = String::new();
        stream
            .read_line(&mut ack)
            .await
            .map_err(|e| Error::AgentUnreachable(e.to_string()))?;
        if !ack.starts_with("OK") {
            return Err(Error::AgentUnreachable(format!(
                "vsock handshake rejected: {}",
                ack.trim()
            )));
        }

        Ok(Self {
            stream: Box::new(stream),
            next_id: 0,
        })
    }

    /// Connect and ping, retrying until `deadline` elapses. Returns the
    /// first client whose ping is answered.
    pub async fn wait_ready<F, Fut>(mut connect: F, deadline: Duration) -> Result<Self>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Self>>,
    {
        let started = tokio::time::Instant::now();
        let mut last_err = Error::AgentUnreachable("never attempted".to_string());
        while started.elapsed() < deadline {
            match connect().await {
                Ok(mut client) => match client.ping().await {
                    Ok(_) => return Ok(client),
                    Err(e) => last_err = e,
                },
                Err(e) => last_err = e,
            }
            sleep(Duration::from_millis(500)).await;
        }
        Err(Error::AgentUnreachable(format!(
            "agent not ready after {deadline:?}: {last_err}"
        )))
    }

    pub async fn ping(&mut self) -> Result<u64> {
        let id = self.request_id();
        let response = self
            .round_trip(&AgentRequest::Ping { id: id.clone() }, Duration::from_secs(5))
            .await?;
        match response {
            AgentResponse::Pong { uptime_secs, .. } => Ok(uptime_secs),
            other => Err(unexpected(&id, other)),
        }
    }

    /// Run a command. Streaming chunks are delivered to `on_output` as they
    /// arrive; the returned outcome carries the full captured output either
    /// way. A `None` timeout waits indefinitely for the terminal response.
    pub async fn execute(
        &mut self,
        command: &str,
        args: &[String],
        cwd: Option<&str>,
        env: &std::collections::HashMap<String, String>,
        step_timeout: Option<Duration>,
        mut on_output: impl FnMut(OutputStream, &str),
    ) -> Result<ExecuteOutcome> {
        let id = self.request_id();
        let request = AgentRequest::Execute {
            id: id.clone(),
            command: command.to_string(),
            args: args.to_vec(),
            cwd: cwd.map(str::to_string),
            env: env.clone(),
            timeout_secs: step_timeout.map(|d| d.as_secs()),
            stream: true,
        };
        write_message(&mut self.stream, &request)
            .await
            .map_err(proto_err)?;

        // The guest enforces the step timeout itself; the host allows a
        // grace margin on top before declaring the agent gone.
        let wire_deadline = step_timeout.map(|d| d + Duration::from_secs(30));

        loop {
            let response = self.read_response(wire_deadline).await?;
            match response {
                AgentResponse::Output { id: out_id, stream, data } if out_id == id => {
                    on_output(stream, &data);
                }
                AgentResponse::ExecuteResult {
                    id: res_id,
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                } if res_id == id => {
                    return Ok(ExecuteOutcome {
                        exit_code,
                        stdout,
                        stderr,
                        duration_ms,
                    });
                }
                AgentResponse::Error { kind, message, .. } => {
                    return Err(Error::AgentProtocol(format!("{kind:?}: {message}")));
                }
                other => {
                    debug!(?other, "ignoring out-of-band agent message");
                }
            }
        }
    }

    pub async fn file_write(
        &mut self,
        path: &str,
        content: &[u8],
        mode: Option<u32>,
    ) -> Result<()> {
        use base64::Engine;
        let id = self.request_id();
        let request = AgentRequest::FileWrite {
            id: id.clone(),
            path: path.to_string(),
            content: base64::engine::general_purpose::STANDARD.encode(content),
            encoding: Encoding::Base64,
            mode,
        };
        let response = self.round_trip(&request, Duration::from_secs(60)).await?;
        match response {
            AgentResponse::FileWriteResult { success: true, .. } => Ok(()),
            AgentResponse::FileWriteResult { success: false, .. } => {
                Err(Error::AgentProtocol(format!("file_write {path} failed")))
            }
            AgentResponse::Error { kind, message, .. } => {
                Err(Error::AgentProtocol(format!("{kind:?}: {message}")))
            }
            other => Err(unexpected(&id, other)),
        }
    }

    pub async fn file_read(&mut self, path: &str) -> Result<Vec<u8>> {
        use base64::Engine;
        let id = self.request_id();
        let request = AgentRequest::FileRead {
            id: id.clone(),
            path: path.to_string(),
            encoding: Encoding::Base64,
        };
        let response = self.round_trip(&request, Duration::from_secs(60)).await?;
        match response {
            AgentResponse::FileReadResult {
                content, encoding, ..
            } => match encoding {
                Encoding::Base64 => base64::engine::general_purpose::STANDARD
                    .decode(content.as_bytes())
                    .map_err(|e| Error::AgentProtocol(format!("bad base64 payload: {e}"))),
                Encoding::Utf8 => Ok(content.into_bytes()),
            },
            AgentResponse::Error { kind, message, .. } => {
                Err(Error::AgentProtocol(format!("{kind:?}: {message}")))
            }
            other => Err(unexpected(&id, other)),
        }
    }

    /// Ask the guest to shut itself down. The transport may drop before the
    /// response arrives; that counts as success.
    pub async fn shutdown(&mut self, timeout_secs: Option<u64>) -> Result<()> {
        let id = self.request_id();
        let request = AgentRequest::Shutdown {
            id,
            timeout_secs,
        };
        if write_message(&mut self.stream, &request).await.is_err() {
            return Ok(());
        }
        match self.read_response(Some(Duration::from_secs(10))).await {
            Ok(AgentResponse::ShutdownResult { .. }) => Ok(()),
            Ok(_) => Ok(()),
            Err(_) => Ok(()),
        }
    }

    async fn round_trip(
        &mut self,
        request: &AgentRequest,
        deadline: Duration,
    ) -> Result<AgentResponse> {
        write_message(&mut self.stream, request)
            .await
            .map_err(proto_err)?;
        self.read_response(Some(deadline)).await
    }

    async fn read_response(&mut self, deadline: Option<Duration>) -> Result<AgentResponse> {
        let read = read_message::<_, AgentResponse>(&mut self.stream);
        match deadline {
            Some(d) => timeout(d, read)
                .await
                .map_err(|_| Error::AgentUnreachable(format!("no response within {d:?}")))?
                .map_err(proto_err),
            None => read.await.map_err(proto_err),
        }
    }

    fn request_id(&mut self) -> String {
        self.next_id += 1;
        format!("req-{}", self.next_id)
    }
}

fn proto_err(e: ProtocolError) -> Error {
    Error::AgentProtocol(e.to_string())
}

fn unexpected(id: &str, response: AgentResponse) -> Error {
    Error::AgentProtocol(format!("unexpected response to {id}: {response:?}"))
}
