//! Test execution boundary.
//!
//! The command processor only needs "given an archive, a test class and a
//! method name, produce a serializable result". [`TestExecutor`] is that
//! capability. [`ProcessExecutor`] is the default implementation: it extracts
//! the archive into a private temporary directory and runs the entry named by
//! the test class as a child process with a cleared environment.
//!
//! | Exit status | Result                |
//! |-------------|-----------------------|
//! | `0`         | [`TestStatus::Passed`]  |
//! | `77`        | [`TestStatus::Skipped`] |
//! | other       | [`TestStatus::Failed`]  |

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::archive::Archive;
use crate::{AppError, Result};

/// Exit code reported by a test that chose to skip itself.
pub const EXIT_CODE_SKIPPED: i32 = 77;

/// `PATH` handed to test processes.
const ISOLATED_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Launch attempts retried while the extracted entry is still busy.
const LAUNCH_RETRIES: u32 = 5;

/// Outcome of a single test method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// The method completed successfully.
    Passed,
    /// The method failed or errored.
    Failed,
    /// The method was not run to completion by its own choice.
    Skipped,
}

/// Serializable result of a test invocation, written raw to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// Outcome.
    pub status: TestStatus,
    /// Failure detail, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When execution began.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
}

impl TestResult {
    /// Exact bytes written to the wire for this result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Execution` if serialization fails.
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Capability to run one test method against a deployed archive.
pub trait TestExecutor: Send + Sync {
    /// Execute `method_name` of `class_name` inside `archive`.
    ///
    /// Called on a blocking thread; implementations may block for the
    /// duration of the test.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Execution` if the test cannot be located or run.
    fn execute(&self, archive: &Archive, class_name: &str, method_name: &str)
        -> Result<TestResult>;
}

/// Runs test entries as child processes inside an extracted copy of the archive.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    /// Map a test class name to the archive entry implementing it.
    ///
    /// The exact name is tried first, then the dotted name as a path
    /// (`com.example.Foo` → `com/example/Foo`).
    #[must_use]
    pub fn resolve_entry(archive: &Archive, class_name: &str) -> Option<String> {
        if archive.contains(class_name) {
            return Some(class_name.to_owned());
        }
        let dotted = class_name.replace('.', "/");
        archive.contains(&dotted).then_some(dotted)
    }
}

impl TestExecutor for ProcessExecutor {
    fn execute(
        &self,
        archive: &Archive,
        class_name: &str,
        method_name: &str,
    ) -> Result<TestResult> {
        let entry = Self::resolve_entry(archive, class_name).ok_or_else(|| {
            AppError::Execution(format!(
                "Could not load class {class_name} from deployed archive: {}",
                archive.id()
            ))
        })?;

        let workdir = tempfile::tempdir()
            .map_err(|err| AppError::Execution(format!("failed to create work dir: {err}")))?;
        archive.extract_to(workdir.path())?;

        let program: PathBuf = workdir.path().join(&entry);
        debug!(
            deployment_id = archive.id(),
            class_name,
            method_name,
            program = %program.display(),
            "running test process"
        );

        let started_at = Utc::now();
        let mut attempt = 0;
        let output = loop {
            let result = Command::new(&program)
                .arg(method_name)
                .current_dir(workdir.path())
                .env_clear()
                .env("PATH", ISOLATED_PATH)
                .stdin(Stdio::null())
                .output();
            match result {
                // ETXTBSY: a concurrently forked child may still hold the
                // freshly written file open.
                Err(err) if err.raw_os_error() == Some(26) && attempt < LAUNCH_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(20));
                }
                other => {
                    break other.map_err(|err| {
                        AppError::Execution(format!("failed to launch test {class_name}: {err}"))
                    })?;
                }
            }
        };
        let finished_at = Utc::now();

        let (status, message) = match output.status.code() {
            Some(0) => (TestStatus::Passed, None),
            Some(EXIT_CODE_SKIPPED) => (TestStatus::Skipped, None),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
                let message = if stderr.is_empty() {
                    code.map_or_else(
                        || format!("{class_name}#{method_name} terminated by signal"),
                        |code| format!("{class_name}#{method_name} exited with status {code}"),
                    )
                } else {
                    stderr
                };
                (TestStatus::Failed, Some(message))
            }
        };

        Ok(TestResult {
            status,
            message,
            started_at,
            finished_at,
        })
    }
}
