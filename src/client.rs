//! Blocking client driver for the daemon wire protocol.
//!
//! One [`DaemonClient`] holds one TCP connection and at most one current
//! deployment. Every exchange writes a single frame and reads a single
//! response. A transport failure in any exchange closes the connection
//! before the error is returned; `ERR` responses leave it open.

use std::io::{self, BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::config::ClientConfig;
use crate::execution::TestResult;
use crate::protocol::wire::{self, COMMAND_STOP, RESPONSE_ERROR_PREFIX, RESPONSE_OK_PREFIX};
use crate::{AppError, Result};

/// Connection to a running daemon.
#[derive(Debug)]
pub struct DaemonClient {
    address: String,
    transport: Option<Transport>,
    current_deployment: Option<String>,
}

#[derive(Debug)]
struct Transport {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Transport {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_all(frame)?;
        self.writer.flush()
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed by daemon",
            ));
        }
        let len = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(len);
        Ok(line)
    }

    fn peek_byte(&mut self) -> io::Result<u8> {
        self.reader.fill_buf()?.first().copied().ok_or_else(|| {
            io::Error::new(ErrorKind::UnexpectedEof, "connection closed by daemon")
        })
    }
}

impl DaemonClient {
    /// Connect to the daemon described by `config`.
    ///
    /// Refused connections are retried every `retry_interval_ms` until
    /// `connect_timeout_seconds` have passed since the first attempt; any
    /// other connect failure is returned immediately.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no port is configured,
    /// `AppError::ConnectTimeout` once the deadline passes, and `AppError::Io`
    /// for other connect failures.
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        let port = config.require_port()?;
        let address = format!("{}:{port}", config.host);
        let deadline = Instant::now() + config.connect_timeout();

        let stream = loop {
            match TcpStream::connect((config.host.as_str(), port)) {
                Ok(stream) => break stream,
                Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                    if Instant::now() >= deadline {
                        return Err(AppError::ConnectTimeout(format!(
                            "could not connect to {address} within {}s: {err}",
                            config.connect_timeout_seconds
                        )));
                    }
                    debug!(%address, %err, "daemon not reachable yet, retrying");
                    thread::sleep(config.retry_interval());
                }
                Err(err) => {
                    return Err(AppError::Io(format!(
                        "could not connect to {address}: {err}"
                    )));
                }
            }
        };

        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);
        info!(%address, "connected to daemon");

        Ok(Self {
            address,
            transport: Some(Transport { reader, writer }),
            current_deployment: None,
        })
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// ID of the archive deployed through this client, if any.
    #[must_use]
    pub fn current_deployment(&self) -> Option<&str> {
        self.current_deployment.as_deref()
    }

    /// Export `archive` as ZIP bytes and deploy it.
    ///
    /// # Errors
    ///
    /// See [`DaemonClient::deploy_bytes`].
    pub fn deploy(&mut self, archive: &Archive) -> Result<String> {
        let bytes = archive.to_zip_bytes()?;
        self.deploy_bytes(&bytes)
    }

    /// Deploy raw archive bytes and remember the returned deployment ID.
    ///
    /// The daemon answers a rejected payload by closing the connection, so
    /// a failed deploy surfaces as `AppError::Io`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on transport failure and `AppError::Deploy` on
    /// an unexpected response.
    pub fn deploy_bytes(&mut self, archive: &[u8]) -> Result<String> {
        let frame = wire::deploy_frame(archive);
        let line = self.exchange(|transport| {
            transport.send(&frame)?;
            Ok(transport.read_line()?)
        })?;

        let id = wire::parse_deploy_response(&line)
            .ok_or_else(|| AppError::Deploy(format!("unexpected deploy response: {line}")))?
            .to_owned();
        info!(deployment_id = %id, bytes = archive.len(), "archive deployed");
        self.current_deployment = Some(id.clone());
        Ok(id)
    }

    /// Undeploy the current deployment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lifecycle` if nothing was deployed through this
    /// client, otherwise see [`DaemonClient::undeploy_id`].
    pub fn undeploy(&mut self) -> Result<()> {
        let id = self
            .current_deployment
            .clone()
            .ok_or_else(|| AppError::Lifecycle("no archive deployed by this client".into()))?;
        self.undeploy_id(&id)
    }

    /// Undeploy `deployment_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on transport failure and `AppError::Command`
    /// if the daemon answers with anything but `OK`.
    pub fn undeploy_id(&mut self, deployment_id: &str) -> Result<()> {
        let frame = wire::command_frame(&wire::undeploy_command(deployment_id));
        let line = self.exchange(|transport| {
            transport.send(&frame)?;
            Ok(transport.read_line()?)
        })?;

        if !line.starts_with(RESPONSE_OK_PREFIX) {
            return Err(remote_error(&line));
        }
        if self.current_deployment.as_deref() == Some(deployment_id) {
            self.current_deployment = None;
        }
        info!(deployment_id, "archive undeployed");
        Ok(())
    }

    /// Run `class_name::method_name` in the current deployment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lifecycle` if nothing was deployed through this
    /// client, otherwise see [`DaemonClient::invoke_test_on`].
    pub fn invoke_test(&mut self, class_name: &str, method_name: &str) -> Result<TestResult> {
        let id = self
            .current_deployment
            .clone()
            .ok_or_else(|| AppError::Lifecycle("no archive deployed by this client".into()))?;
        self.invoke_test_on(&id, class_name, method_name)
    }

    /// Run `class_name::method_name` in `deployment_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Command` carrying the daemon's `ERR` text,
    /// `AppError::Protocol` if the result cannot be decoded, and
    /// `AppError::Io` on transport failure.
    pub fn invoke_test_on(
        &mut self,
        deployment_id: &str,
        class_name: &str,
        method_name: &str,
    ) -> Result<TestResult> {
        let frame = wire::command_frame(&wire::test_command(
            deployment_id,
            class_name,
            method_name,
        ));
        let error_marker = RESPONSE_ERROR_PREFIX.as_bytes()[0];

        let outcome = self.exchange(|transport| {
            transport.send(&frame)?;
            if transport.peek_byte()? == error_marker {
                return Ok(Err(transport.read_line()?));
            }
            let mut deserializer = serde_json::Deserializer::from_reader(&mut transport.reader);
            let result = TestResult::deserialize(&mut deserializer).map_err(|err| {
                if err.is_io() {
                    AppError::Io(err.to_string())
                } else {
                    AppError::Protocol(format!("malformed test result: {err}"))
                }
            })?;
            Ok(Ok(result))
        })?;

        match outcome {
            Ok(result) => {
                debug!(deployment_id, status = ?result.status, "test result received");
                Ok(result)
            }
            Err(line) => Err(remote_error(&line)),
        }
    }

    /// Deploy `archive`, run one test method in it, then undeploy it.
    ///
    /// The test outcome takes precedence: an undeploy failure is only
    /// returned when the test itself produced a result, and no undeploy is
    /// attempted once the connection is gone.
    ///
    /// # Errors
    ///
    /// Returns the first of the deploy, test, or undeploy failures.
    pub fn run_test(
        &mut self,
        archive: &[u8],
        class_name: &str,
        method_name: &str,
    ) -> Result<TestResult> {
        self.deploy_bytes(archive)?;
        let outcome = self.invoke_test(class_name, method_name);
        let undeployed = if self.is_connected() {
            self.undeploy()
        } else {
            Ok(())
        };
        let result = outcome?;
        undeployed?;
        Ok(result)
    }

    /// Ask the daemon to stop, then close this client.
    ///
    /// The acknowledgement is read best-effort: the daemon may already be
    /// gone by the time it would arrive.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the stop command cannot be written.
    pub fn stop(&mut self) -> Result<()> {
        let frame = wire::command_frame(COMMAND_STOP);
        self.exchange(|transport| Ok(transport.send(&frame)?))?;

        match self.exchange(|transport| Ok(transport.read_line()?)) {
            Ok(line) => debug!(response = %line, "stop acknowledged"),
            Err(err) => warn!(%err, "no stop acknowledgement"),
        }
        self.close();
        Ok(())
    }

    /// Close the connection. Safe to call repeatedly.
    pub fn close(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        if let Err(err) = transport.writer.get_ref().shutdown(Shutdown::Both) {
            debug!(%err, "socket already shut down");
        }
        drop(transport);
        debug!(address = %self.address, "connection closed");
    }

    /// Run one exchange, closing the connection if the transport fails.
    fn exchange<T>(&mut self, op: impl FnOnce(&mut Transport) -> Result<T>) -> Result<T> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| AppError::Lifecycle("client connection is closed".into()))?;

        let outcome = op(transport);
        if let Err(err @ (AppError::Io(_) | AppError::Protocol(_))) = &outcome {
            warn!(%err, address = %self.address, "transport failure, closing connection");
            self.close();
        }
        outcome
    }
}

impl Drop for DaemonClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn remote_error(line: &str) -> AppError {
    match line.strip_prefix(RESPONSE_ERROR_PREFIX) {
        Some(message) => AppError::Command(message.to_owned()),
        None => AppError::Command(format!("unexpected response: {line}")),
    }
}
