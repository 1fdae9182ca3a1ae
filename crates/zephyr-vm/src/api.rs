//! Typed Firecracker API client.
//!
//! The hypervisor exposes its configuration API as HTTP/1.1 JSON over a
//! per-VM Unix socket. The API subset used here is small and fixed, so the
//! client speaks the protocol directly over a `UnixStream`: one
//! request/response exchange per connection, `Content-Length` framing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;
use zephyr_core::{Error, Result};

use crate::config::{
    BalloonDevice, BootSource, Drive, LoggerConfig, MachineConfig, MetricsConfig,
    NetworkInterface, SnapshotCreateParams, SnapshotLoadParams, VsockDevice,
};

/// Client bound to one VM's API socket.
#[derive(Debug, Clone)]
pub struct HypervisorClient {
    socket_path: PathBuf,
}

impl HypervisorClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// `GET /`, the instance description; used as the readiness probe.
    pub async fn describe_instance(&self) -> Result<serde_json::Value> {
        self.request("GET", "/", None).await
    }

    pub async fn put_boot_source(&self, boot: &BootSource) -> Result<()> {
        self.put("/boot-source", boot).await
    }

    pub async fn put_machine_config(&self, machine: &MachineConfig) -> Result<()> {
        self.put("/machine-config", machine).await
    }

    pub async fn put_drive(&self, drive: &Drive) -> Result<()> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    pub async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        self.put(&format!("/network-interfaces/{}", iface.iface_id), iface)
            .await
    }

    pub async fn put_vsock(&self, vsock: &VsockDevice) -> Result<()> {
        self.put("/vsock", vsock).await
    }

    pub async fn put_logger(&self, logger: &LoggerConfig) -> Result<()> {
        self.put("/logger", logger).await
    }

    pub async fn put_metrics(&self, metrics: &MetricsConfig) -> Result<()> {
        self.put("/metrics", metrics).await
    }

    pub async fn put_mmds(&self, data: &serde_json::Value) -> Result<()> {
        self.put("/mmds", data).await
    }

    pub async fn put_balloon(&self, balloon: &BalloonDevice) -> Result<()> {
        self.put("/balloon", balloon).await
    }

    pub async fn instance_start(&self) -> Result<()> {
        self.action("InstanceStart").await
    }

    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.action("SendCtrlAltDel").await
    }

    pub async fn flush_metrics(&self) -> Result<()> {
        self.action("FlushMetrics").await
    }

    pub async fn create_snapshot(&self, params: &SnapshotCreateParams) -> Result<()> {
        self.put("/snapshot/create", params).await
    }

    pub async fn load_snapshot(&self, params: &SnapshotLoadParams) -> Result<()> {
        self.put("/snapshot/load", params).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.patch_state("Paused").await
    }

    pub async fn resume(&self) -> Result<()> {
        self.patch_state("Resumed").await
    }

    async fn action(&self, action_type: &str) -> Result<()> {
        self.put("/actions", &serde_json::json!({ "action_type": action_type }))
            .await
    }

    async fn patch_state(&self, state: &str) -> Result<()> {
        let body = serde_json::to_vec(&serde_json::json!({ "state": state }))?;
        let _: serde_json::Value = self.exchange("PATCH", "/vm", Some(&body)).await?;
        Ok(())
    }

    async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let body = serde_json::to_vec(body)?;
        let _: serde_json::Value = self.exchange("PUT", path, Some(&body)).await?;
        Ok(())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<T> {
        self.exchange(method, path, body).await
    }

    async fn exchange<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<T> {
        debug!(method, path, socket = %self.socket_path.display(), "hypervisor API call");

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::HypervisorApi {
                status: 0,
                fault_message: format!("cannot connect to API socket: {e}"),
            }
        })?;
        let mut stream = BufReader::new(stream);

        let body = body.unwrap_or(b"");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.get_mut().write_all(request.as_bytes()).await?;
        stream.get_mut().write_all(body).await?;
        stream.get_mut().flush().await?;

        let (status, response_body) = read_response(&mut stream).await?;

        if !(200..300).contains(&status) {
            // Surface the hypervisor's fault message verbatim.
            let fault_message = serde_json::from_slice::<serde_json::Value>(&response_body)
                .ok()
                .and_then(|v| {
                    v.get("fault_message")
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| String::from_utf8_lossy(&response_body).into_owned());
            return Err(Error::HypervisorApi {
                status,
                fault_message,
            });
        }

        if response_body.is_empty() {
            // 204-style responses deserialize as null.
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        Ok(serde_json::from_slice(&response_body)?)
    }
}

/// Read a `Connection: close` HTTP/1.1 response: status line, headers,
/// then a `Content-Length`-framed (or to-EOF) body.
async fn read_response(stream: &mut BufReader<UnixStream>) -> Result<(u16, Vec<u8>)> {
    use tokio::io::AsyncBufReadExt;

    let mut status_line = String::new();
    stream.read_line(&mut status_line).await?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::HypervisorApi {
            status: 0,
            fault_message: format!("malformed status line: {}", status_line.trim()),
        })?;

    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let n = stream.read_line(&mut line).await?;
        let line = line.trim_end();
        if n == 0 || line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
        }
    }

    let body = match content_length {
        Some(len) => {
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            buf
        }
        None => {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await?;
            buf
        }
    };

    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    async fn serve_once(listener: UnixListener, response: &'static str) {
        let (mut socket, _) = listener.accept().await.unwrap();
        // Drain the request before answering.
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await.unwrap();
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ok_response() {
        let dir = std::env::temp_dir().join(format!("zeph-api-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("api.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 200 OK\r\nContent-Length: 19\r\n\r\n{\"state\":\"Running\"}",
        ));

        let client = HypervisorClient::new(&path);
        let value = client.describe_instance().await.unwrap();
        assert_eq!(value["state"], "Running");
        server.await.unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_fault_message_surfaced() {
        let dir = std::env::temp_dir().join(format!("zeph-api-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("api.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let body = r#"{"fault_message":"The kernel file cannot be opened"}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 400 Bad Request\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let server = tokio::spawn(serve_once(listener, response));

        let client = HypervisorClient::new(&path);
        let err = client
            .put_boot_source(&BootSource {
                kernel_image_path: "/missing/vmlinux".to_string(),
                boot_args: None,
                initrd_path: None,
            })
            .await
            .unwrap_err();

        match err {
            Error::HypervisorApi {
                status,
                fault_message,
            } => {
                assert_eq!(status, 400);
                assert_eq!(fault_message, "The kernel file cannot be opened");
            }
            other => panic!("unexpected error: {other}"),
        }
        server.await.unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }
}
