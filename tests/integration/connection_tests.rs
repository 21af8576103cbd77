//! Per-connection behavior over an in-memory duplex transport.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use exec_daemon::archive::ZipImporter;
use exec_daemon::server::connection::{Connection, FrameOutcome};
use exec_daemon::server::dispatch::ConnectionPhase;
use exec_daemon::server::ServerContext;
use exec_daemon::store::DeploymentStore;
use exec_daemon::AppError;

use super::test_helpers::{archive_bytes, ScriptedExecutor, IO_TIMEOUT};

fn context() -> (Arc<ServerContext>, mpsc::Receiver<()>) {
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let ctx = ServerContext::new(
        Arc::new(DeploymentStore::new()),
        Arc::new(ZipImporter),
        Arc::new(ScriptedExecutor),
        stop_tx,
    );
    (Arc::new(ctx), stop_rx)
}

fn deploy_payload(name: &str) -> BytesMut {
    let mut frame = BytesMut::from(&b"DPL "[..]);
    frame.extend_from_slice(&archive_bytes(name));
    frame
}

async fn read_available(peer: &mut DuplexStream, expected: usize) -> String {
    let mut buf = vec![0_u8; expected];
    tokio::time::timeout(IO_TIMEOUT, peer.read_exact(&mut buf))
        .await
        .expect("response in time")
        .expect("read response");
    String::from_utf8(buf).expect("utf8 response")
}

#[tokio::test]
async fn phase_resets_between_consecutive_deploys() {
    let (ctx, _stop_rx) = context();
    let (server_io, mut peer) = tokio::io::duplex(64 * 1024);
    let mut connection = Connection::new(server_io, Arc::clone(&ctx), 1024 * 1024);
    assert_eq!(connection.phase(), ConnectionPhase::AwaitingFrame);

    let first = connection
        .handle_frame(deploy_payload("one.jar"))
        .await
        .expect("first deploy");
    assert_eq!(first, FrameOutcome::Continue);
    assert_eq!(connection.phase(), ConnectionPhase::AwaitingFrame);

    let second = connection
        .handle_frame(deploy_payload("two.jar"))
        .await
        .expect("second deploy");
    assert_eq!(second, FrameOutcome::Continue);
    assert_eq!(connection.phase(), ConnectionPhase::AwaitingFrame);

    let expected = "OK DPL one.jar\r\nOK DPL two.jar\r\n";
    assert_eq!(read_available(&mut peer, expected.len()).await, expected);
    assert_eq!(ctx.store.len(), 2);
}

#[tokio::test]
async fn failed_deploy_is_an_error_without_response() {
    let (ctx, _stop_rx) = context();
    let (server_io, _peer) = tokio::io::duplex(1024);
    let mut connection = Connection::new(server_io, ctx, 1024);

    let err = connection
        .handle_frame(BytesMut::from(&b"DPL garbage"[..]))
        .await
        .expect_err("invalid archive");

    assert!(matches!(err, AppError::Deploy(_)), "got {err:?}");
    assert_eq!(connection.phase(), ConnectionPhase::AwaitingFrame);
}

#[tokio::test]
async fn unknown_marker_closes() {
    let (ctx, _stop_rx) = context();
    let (server_io, mut peer) = tokio::io::duplex(1024);
    let mut connection = Connection::new(server_io, ctx, 1024);

    let outcome = connection
        .handle_frame(BytesMut::from(&b"PUT x"[..]))
        .await
        .expect("handled");

    assert_eq!(outcome, FrameOutcome::Close);
    let expected = "ERR Unsupported Command\r\n";
    assert_eq!(read_available(&mut peer, expected.len()).await, expected);
}

#[tokio::test]
async fn stop_command_replies_then_signals_stop() {
    let (ctx, mut stop_rx) = context();
    let (server_io, mut peer) = tokio::io::duplex(1024);
    let mut connection = Connection::new(server_io, ctx, 1024);

    connection
        .handle_frame(BytesMut::from(&b"CMD stop"[..]))
        .await
        .expect("handled");

    let expected = "OK CMD stop\r\n";
    assert_eq!(read_available(&mut peer, expected.len()).await, expected);
    assert!(stop_rx.try_recv().is_ok(), "stop must be requested");
}

#[tokio::test]
async fn run_serves_until_peer_closes() {
    let (ctx, _stop_rx) = context();
    let (server_io, mut peer) = tokio::io::duplex(1024);
    let connection = Connection::new(server_io, ctx, 1024);
    let task = tokio::spawn(connection.run(CancellationToken::new()));

    peer.write_all(b"CMD undeploy nothing<<EOF").await.expect("write");
    let expected = "ERR Deployment nothing could not be found in current deployments.\r\n";
    assert_eq!(read_available(&mut peer, expected.len()).await, expected);

    drop(peer);
    let result = tokio::time::timeout(IO_TIMEOUT, task)
        .await
        .expect("connection ends")
        .expect("task joins");
    assert!(result.is_ok());
}

#[tokio::test]
async fn run_stops_on_cancellation() {
    let (ctx, _stop_rx) = context();
    let (server_io, _peer) = tokio::io::duplex(1024);
    let connection = Connection::new(server_io, ctx, 1024);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(connection.run(cancel.clone()));

    cancel.cancel();
    let result = tokio::time::timeout(IO_TIMEOUT, task)
        .await
        .expect("connection ends")
        .expect("task joins");
    assert!(result.is_ok());
}

#[tokio::test]
async fn oversized_frame_reports_protocol_error_and_closes() {
    let (ctx, _stop_rx) = context();
    let (server_io, mut peer) = tokio::io::duplex(1024);
    let connection = Connection::new(server_io, ctx, 16);
    let task = tokio::spawn(connection.run(CancellationToken::new()));

    peer.write_all(b"CMD undeploy this-id-is-far-too-long<<EOF")
        .await
        .expect("write");

    let mut response = Vec::new();
    tokio::time::timeout(IO_TIMEOUT, peer.read_to_end(&mut response))
        .await
        .expect("closed in time")
        .expect("read");
    let response = String::from_utf8(response).expect("utf8");
    assert!(response.starts_with("ERR protocol: frame too long"), "got {response}");

    let result = task.await.expect("task joins");
    assert!(matches!(result, Err(AppError::Protocol(_))));
}

#[tokio::test]
async fn short_frame_is_completed_by_the_next_frame() {
    let (ctx, _stop_rx) = context();
    let (server_io, mut peer) = tokio::io::duplex(1024);
    let connection = Connection::new(server_io, ctx, 1024);
    let _task = tokio::spawn(connection.run(CancellationToken::new()));

    peer.write_all(b"CM<<EOFD undeploy x<<EOF").await.expect("write");
    let expected = "ERR Deployment x could not be found in current deployments.\r\n";
    assert_eq!(read_available(&mut peer, expected.len()).await, expected);
}
