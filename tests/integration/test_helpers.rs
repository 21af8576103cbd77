//! Shared helpers for daemon integration tests.
//!
//! Provides a server bound to an ephemeral loopback port with a scripted
//! test executor, and a raw async TCP peer for byte-exact protocol checks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use exec_daemon::archive::{Archive, ZipImporter};
use exec_daemon::execution::{TestExecutor, TestResult, TestStatus};
use exec_daemon::protocol::codec::DEFAULT_MAX_FRAME_BYTES;
use exec_daemon::server::{Server, ServerOptions, ServerState};
use exec_daemon::Result;

/// Upper bound for any single network wait in tests.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Executor whose outcome is chosen by the method name:
/// `skips` → skipped, `fails` → failed, anything else → passed.
pub struct ScriptedExecutor;

impl TestExecutor for ScriptedExecutor {
    fn execute(&self, _archive: &Archive, class_name: &str, method_name: &str) -> Result<TestResult> {
        let started_at = Utc::now();
        let (status, message) = match method_name {
            "skips" => (TestStatus::Skipped, None),
            "fails" => (
                TestStatus::Failed,
                Some(format!("{class_name}#{method_name} failed")),
            ),
            _ => (TestStatus::Passed, None),
        };
        Ok(TestResult {
            status,
            message,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Loopback server (not yet started) using [`ScriptedExecutor`].
pub fn test_server() -> Server {
    test_server_with_limit(DEFAULT_MAX_FRAME_BYTES)
}

/// Loopback server (not yet started) with a custom frame limit.
pub fn test_server_with_limit(max_frame_bytes: usize) -> Server {
    let options = ServerOptions {
        max_frame_bytes,
        importer: Arc::new(ZipImporter),
        executor: Arc::new(ScriptedExecutor),
    };
    Server::with_options(SocketAddr::from(([127, 0, 0, 1], 0)), options)
}

/// Loopback server (not yet started) running tests on `executor`.
pub fn test_server_with_executor(executor: Arc<dyn TestExecutor>) -> Server {
    let options = ServerOptions {
        max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        importer: Arc::new(ZipImporter),
        executor,
    };
    Server::with_options(SocketAddr::from(([127, 0, 0, 1], 0)), options)
}

/// Start a loopback test server and return it with its bound address.
pub async fn start_test_server() -> (Server, SocketAddr) {
    let server = test_server();
    let addr = server.start().await.expect("server starts");
    (server, addr)
}

/// Wait until `server` publishes [`ServerState::Stopped`].
pub async fn wait_until_stopped(server: &Server) {
    let mut state = server.subscribe();
    tokio::time::timeout(IO_TIMEOUT, state.wait_for(|s| *s == ServerState::Stopped))
        .await
        .expect("server stops in time")
        .expect("state channel open");
}

/// Small named ZIP archive as raw bytes.
pub fn archive_bytes(name: &str) -> Vec<u8> {
    Archive::new(name)
        .with_file("META-INF/MANIFEST.MF", "Manifest-Version: 1.0\n")
        .to_zip_bytes()
        .expect("zip export")
}

/// Raw protocol peer speaking bytes over TCP.
pub struct RawPeer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawPeer {
    /// Connect to `addr`.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(addr))
            .await
            .expect("connect in time")
            .expect("connect");
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    /// Write `bytes` and flush.
    pub async fn send(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    /// Read one response line including its `\r\n`.
    pub async fn read_raw_line(&mut self) -> String {
        let mut line = String::new();
        let read = tokio::time::timeout(IO_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("response in time")
            .expect("read line");
        assert!(read > 0, "connection closed before a response line");
        line
    }

    /// Read one response line without its delimiter.
    pub async fn read_line(&mut self) -> String {
        let line = self.read_raw_line().await;
        line.trim_end_matches(['\r', '\n']).to_owned()
    }

    /// Read everything until the daemon closes the connection.
    pub async fn read_until_closed(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        tokio::time::timeout(IO_TIMEOUT, self.reader.read_to_end(&mut rest))
            .await
            .expect("connection closes in time")
            .expect("read until close");
        rest
    }

    /// Assert the daemon closes the connection without sending anything.
    pub async fn expect_closed(&mut self) {
        let mut rest = Vec::new();
        let outcome = tokio::time::timeout(IO_TIMEOUT, self.reader.read_to_end(&mut rest))
            .await
            .expect("connection closes in time");
        if let Err(err) = outcome {
            assert_eq!(
                err.kind(),
                std::io::ErrorKind::ConnectionReset,
                "unexpected read error: {err}"
            );
        }
        assert!(
            rest.is_empty(),
            "unexpected bytes before close: {:?}",
            String::from_utf8_lossy(&rest)
        );
    }
}
