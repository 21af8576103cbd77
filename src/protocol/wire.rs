//! Byte-level grammar of the daemon wire protocol.
//!
//! | Exchange    | Request                                   | Success response |
//! |-------------|-------------------------------------------|------------------|
//! | Deploy      | `DPL ` + archive bytes + `<<EOF`          | `OK DPL <id>`    |
//! | Undeploy    | `CMD undeploy <id><<EOF`                  | `OK <id>`        |
//! | Stop        | `CMD stop<<EOF`                           | `OK CMD stop`    |
//! | Invoke test | `CMD test <id> <class> <method><<EOF`     | raw result bytes |
//!
//! Every textual response is one line terminated by [`RESPONSE_LINE_DELIMITER`].
//! Failures on the command path start with [`RESPONSE_ERROR_PREFIX`].

/// Prefix shared by every textual command.
pub const PREFIX_STRING_COMMAND: &str = "CMD ";

/// Prepended to the byte contents of an archive, followed by [`COMMAND_EOF_DELIMITER`].
pub const COMMAND_DEPLOY_PREFIX: &str = "DPL ";

/// Marks the end of every client-to-server frame.
pub const COMMAND_EOF_DELIMITER: &str = "<<EOF";

/// Stops the server.
pub const COMMAND_STOP: &str = "CMD stop";

/// Followed by a current deployment ID.
pub const COMMAND_UNDEPLOY_PREFIX: &str = "CMD undeploy ";

/// Followed by `<deployment id> <test class> <method name>`.
pub const COMMAND_TEST_PREFIX: &str = "CMD test ";

/// Leading text of a successful textual response.
pub const RESPONSE_OK_PREFIX: &str = "OK ";

/// Leading text of a failed textual response.
pub const RESPONSE_ERROR_PREFIX: &str = "ERR ";

/// Terminates every textual response line.
pub const RESPONSE_LINE_DELIMITER: &str = "\r\n";

/// Number of leading bytes inspected to classify a frame.
pub const MARKER_WINDOW: usize = 3;

/// Response body sent before closing a connection with an unrecognized marker.
pub const UNSUPPORTED_COMMAND: &str = "Unsupported Command";

/// Kind of a frame as determined by its leading marker bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Textual command (`CMD ...`).
    Command,
    /// Binary deployment payload (`DPL ...`).
    Deploy,
    /// Marker matches neither command nor deploy.
    Unknown,
    /// Fewer than [`MARKER_WINDOW`] bytes available; wait for more.
    Incomplete,
}

/// Classify a frame by its first [`MARKER_WINDOW`] bytes.
#[must_use]
pub fn classify(frame: &[u8]) -> FrameKind {
    let Some(window) = frame.get(..MARKER_WINDOW) else {
        return FrameKind::Incomplete;
    };

    if window == &PREFIX_STRING_COMMAND.as_bytes()[..MARKER_WINDOW] {
        FrameKind::Command
    } else if window == &COMMAND_DEPLOY_PREFIX.as_bytes()[..MARKER_WINDOW] {
        FrameKind::Deploy
    } else {
        FrameKind::Unknown
    }
}

/// Build a complete textual command frame, e.g. `CMD stop<<EOF`.
#[must_use]
pub fn command_frame(command: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(command.len() + COMMAND_EOF_DELIMITER.len());
    frame.extend_from_slice(command.as_bytes());
    frame.extend_from_slice(COMMAND_EOF_DELIMITER.as_bytes());
    frame
}

/// Build a complete deploy frame around raw archive bytes.
#[must_use]
pub fn deploy_frame(archive: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(
        COMMAND_DEPLOY_PREFIX.len() + archive.len() + COMMAND_EOF_DELIMITER.len(),
    );
    frame.extend_from_slice(COMMAND_DEPLOY_PREFIX.as_bytes());
    frame.extend_from_slice(archive);
    frame.extend_from_slice(COMMAND_EOF_DELIMITER.as_bytes());
    frame
}

/// Undeploy command text for `deployment_id`.
#[must_use]
pub fn undeploy_command(deployment_id: &str) -> String {
    format!("{COMMAND_UNDEPLOY_PREFIX}{deployment_id}")
}

/// Test invocation command text.
#[must_use]
pub fn test_command(deployment_id: &str, class_name: &str, method_name: &str) -> String {
    format!("{COMMAND_TEST_PREFIX}{deployment_id} {class_name} {method_name}")
}

/// Extract the deployment ID from an `OK DPL <id>` response line.
///
/// Returns `None` when the line does not carry the OK prefix followed by the
/// echoed deploy marker.
#[must_use]
pub fn parse_deploy_response(line: &str) -> Option<&str> {
    line.strip_prefix(RESPONSE_OK_PREFIX)?
        .strip_prefix(COMMAND_DEPLOY_PREFIX)
}
