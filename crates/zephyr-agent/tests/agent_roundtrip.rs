//! End-to-end protocol tests: the real agent served over loopback TCP.

use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpListener;
use zephyr_agent::server::AgentServer;
use zephyr_agent::{AgentClient, OutputStream};

async fn start_agent() -> (std::net::SocketAddr, tempdir::TempWorkspace) {
    let workspace = tempdir::TempWorkspace::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = AgentServer::new(workspace.path().to_path_buf());
    tokio::spawn(server.serve(listener));
    (addr, workspace)
}

/// Minimal scratch-dir helper so these tests leave nothing behind.
mod tempdir {
    use std::path::{Path, PathBuf};

    pub struct TempWorkspace(PathBuf);

    impl TempWorkspace {
        pub fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("zeph-agent-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }

        pub fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
}

#[tokio::test]
async fn test_ping() {
    let (addr, _ws) = start_agent().await;
    let mut client = AgentClient::connect_tcp(addr).await.unwrap();
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_execute_shell_command() {
    let (addr, _ws) = start_agent().await;
    let mut client = AgentClient::connect_tcp(addr).await.unwrap();

    let mut streamed = String::new();
    let outcome = client
        .execute(
            "echo hi",
            &[],
            None,
            &HashMap::new(),
            Some(Duration::from_secs(10)),
            |stream, data| {
                if stream == OutputStream::Stdout {
                    streamed.push_str(data);
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdout, "hi\n");
    assert_eq!(streamed, "hi\n");
}

#[tokio::test]
async fn test_execute_argv_and_env_merge() {
    let (addr, _ws) = start_agent().await;
    let mut client = AgentClient::connect_tcp(addr).await.unwrap();

    let mut env = HashMap::new();
    env.insert("GREETING".to_string(), "hello".to_string());

    let outcome = client
        .execute(
            "sh",
            &["-c".to_string(), "printf %s \"$GREETING\"".to_string()],
            None,
            &env,
            Some(Duration::from_secs(10)),
            |_, _| {},
        )
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdout, "hello");
}

#[tokio::test]
async fn test_execute_nonzero_exit() {
    let (addr, _ws) = start_agent().await;
    let mut client = AgentClient::connect_tcp(addr).await.unwrap();

    let outcome = client
        .execute(
            "exit 3",
            &[],
            None,
            &HashMap::new(),
            Some(Duration::from_secs(10)),
            |_, _| {},
        )
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, 3);
}

#[tokio::test]
async fn test_execute_timeout_exits_124() {
    let (addr, _ws) = start_agent().await;
    let mut client = AgentClient::connect_tcp(addr).await.unwrap();

    let outcome = client
        .execute(
            "sleep 30",
            &[],
            None,
            &HashMap::new(),
            Some(Duration::from_secs(1)),
            |_, _| {},
        )
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, 124);
}

#[tokio::test]
async fn test_file_write_then_read() {
    let (addr, ws) = start_agent().await;
    let mut client = AgentClient::connect_tcp(addr).await.unwrap();

    let path = ws.path().join("inputs/data.bin");
    let payload = b"\x00\x01binary payload\xff";
    client
        .file_write(path.to_str().unwrap(), payload, Some(0o644))
        .await
        .unwrap();

    let read_back = client.file_read(path.to_str().unwrap()).await.unwrap();
    assert_eq!(read_back, payload);
}

#[tokio::test]
async fn test_file_read_missing_is_not_found() {
    let (addr, ws) = start_agent().await;
    let mut client = AgentClient::connect_tcp(addr).await.unwrap();

    let missing = ws.path().join("nope.txt");
    let err = client
        .file_read(missing.to_str().unwrap())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("FileNotFound"));
}

#[tokio::test]
async fn test_shutdown_acknowledged() {
    let (addr, _ws) = start_agent().await;
    let mut client = AgentClient::connect_tcp(addr).await.unwrap();
    client.shutdown(Some(5)).await.unwrap();
}
