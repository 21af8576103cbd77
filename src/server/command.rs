//! Textual command parsing and execution.
//!
//! Every failure raised here is soft: the connection turns it into an
//! `ERR` line and keeps serving frames. Undeploy of an unknown ID answers
//! with its own `ERR` line; all other failures go through the catch-all
//! [`error_response`].

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info_span, Instrument};

use crate::protocol::codec::Response;
use crate::protocol::wire::{
    COMMAND_STOP, COMMAND_TEST_PREFIX, COMMAND_UNDEPLOY_PREFIX, RESPONSE_ERROR_PREFIX,
    RESPONSE_OK_PREFIX,
};
use crate::server::ServerContext;
use crate::{AppError, Result};

/// A parsed textual command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stop the server.
    Stop,
    /// Remove a deployment.
    Undeploy {
        /// Deployment to remove.
        deployment_id: String,
    },
    /// Run one test method against a deployment.
    InvokeTest {
        /// Deployment holding the test.
        deployment_id: String,
        /// Test class to load.
        class_name: String,
        /// Method to run.
        method_name: String,
    },
}

impl Command {
    /// Parse a full command line (marker included).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Command` for unsupported or malformed commands.
    pub fn parse(line: &str) -> Result<Self> {
        if line == COMMAND_STOP {
            return Ok(Self::Stop);
        }

        if let Some(rest) = line.strip_prefix(COMMAND_UNDEPLOY_PREFIX) {
            return Ok(Self::Undeploy {
                deployment_id: rest.trim().to_owned(),
            });
        }

        if line.starts_with(COMMAND_TEST_PREFIX) {
            // `CMD test <id> <class> <method>`
            let mut tokens = line.split_whitespace().skip(2);
            let mut next = |what: &str| {
                tokens.next().map(str::to_owned).ok_or_else(|| {
                    AppError::Command(format!("missing {what} in test command: {line}"))
                })
            };
            let deployment_id = next("deployment id")?;
            let class_name = next("test class name")?;
            let method_name = next("method name")?;
            return Ok(Self::InvokeTest {
                deployment_id,
                class_name,
                method_name,
            });
        }

        Err(AppError::Command(format!(
            "This server does not support command: {line}"
        )))
    }
}

/// Result of executing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// Write this response and carry on.
    Respond(Response),
    /// Write this response, flush, then request a server stop.
    RespondThenStop(Response),
}

/// Parse and execute `line`.
///
/// # Errors
///
/// Returns any parse, lookup or execution failure; the caller converts it
/// with [`error_response`].
pub async fn execute(context: &ServerContext, line: &str) -> Result<CommandReply> {
    match Command::parse(line)? {
        Command::Stop => Ok(CommandReply::RespondThenStop(Response::Line(format!(
            "{RESPONSE_OK_PREFIX}{line}"
        )))),
        Command::Undeploy { deployment_id } => Ok(CommandReply::Respond(undeploy(
            context,
            &deployment_id,
        ))),
        Command::InvokeTest {
            deployment_id,
            class_name,
            method_name,
        } => {
            let span = info_span!("invoke_test", %deployment_id, %class_name, %method_name);
            let bytes = invoke_test(context, &deployment_id, class_name, method_name)
                .instrument(span)
                .await?;
            Ok(CommandReply::Respond(Response::Raw(bytes)))
        }
    }
}

/// Remove `deployment_id` from the store and describe the outcome.
#[must_use]
pub fn undeploy(context: &ServerContext, deployment_id: &str) -> Response {
    debug!(deployment_id, "requesting undeployment");
    if context.store.remove(deployment_id).is_none() {
        debug!(deployment_id, "not a current deployment");
        return Response::Line(format!(
            "{RESPONSE_ERROR_PREFIX}Deployment {deployment_id} could not be found in current deployments."
        ));
    }
    debug!(deployment_id, "undeployed");
    Response::Line(format!("{RESPONSE_OK_PREFIX}{deployment_id}"))
}

/// Run a test on the blocking pool and return its encoded result.
async fn invoke_test(
    context: &ServerContext,
    deployment_id: &str,
    class_name: String,
    method_name: String,
) -> Result<Bytes> {
    let archive = context.store.get(deployment_id).ok_or_else(|| {
        AppError::NotFound(format!("Archive with ID {deployment_id} is not deployed"))
    })?;
    let executor = Arc::clone(&context.executor);

    let result = tokio::task::spawn_blocking(move || {
        executor.execute(&archive, &class_name, &method_name)
    })
    .await
    .map_err(|err| AppError::Execution(format!("test task failed: {err}")))??;

    debug!(status = ?result.status, "test finished");
    Ok(Bytes::from(result.to_wire_bytes()?))
}

/// Catch-all `ERR` line for a failed command.
#[must_use]
pub fn error_response(err: &AppError) -> Response {
    Response::Line(format!(
        "{RESPONSE_ERROR_PREFIX}Caught unexpected error servicing request: {err}"
    ))
}
