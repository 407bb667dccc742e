//! Command-line backends
//!
//! Each backend maps to a command line. The payload is written to the
//! child's stdin and its stdout is the result. Exit code 2 means the child
//! rejected the input (fatal); any other non-zero exit is a hard failure.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{bail, Result};
use async_trait::async_trait;
use dispatch_coordination::{BackendId, BackendInvoker, InvocationError, TaskProfile};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Exit code a backend command uses to reject its input
const USAGE_EXIT_CODE: i32 = 2;

/// Runs a configured command per backend
#[derive(Debug, Default, Clone)]
pub struct CommandInvoker {
    commands: HashMap<BackendId, Vec<String>>,
}

impl CommandInvoker {
    /// Build from `backend → command line` templates.
    ///
    /// Templates are split with shell quoting rules; `{backend}` in any
    /// argument is replaced by the backend id.
    pub fn from_templates(templates: &HashMap<String, String>) -> Result<Self> {
        let mut commands = HashMap::new();
        for (backend, template) in templates {
            let Some(argv) = shlex::split(template) else {
                bail!("Invalid command for backend '{backend}': unbalanced quotes");
            };
            if argv.is_empty() {
                bail!("Empty command for backend '{backend}'");
            }
            let argv = argv
                .into_iter()
                .map(|arg| arg.replace("{backend}", backend))
                .collect();
            commands.insert(BackendId::new(backend.clone()), argv);
        }
        Ok(Self { commands })
    }

    pub fn has_command(&self, backend: &BackendId) -> bool {
        self.commands.contains_key(backend)
    }
}

#[async_trait]
impl BackendInvoker for CommandInvoker {
    async fn invoke(
        &self,
        backend: &BackendId,
        _task: &TaskProfile,
        payload: &str,
    ) -> Result<String, InvocationError> {
        let Some(argv) = self.commands.get(backend) else {
            return Err(InvocationError::Hard(format!(
                "no command configured for {backend}"
            )));
        };

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| InvocationError::Hard(format!("failed to start {}: {e}", argv[0])))?;

        // Feed stdin while draining stdout/stderr; a child that streams its
        // output would otherwise block on a full pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A child that exits without reading its input reports
                // through its exit status.
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!(backend = %backend, error = %e, "Backend closed stdin early");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output
            .map_err(|e| InvocationError::Transient(format!("failed to wait for child: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().next().unwrap_or("").trim().to_string();

        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Some(USAGE_EXIT_CODE) => Err(InvocationError::Fatal(if detail.is_empty() {
                "input rejected".to_string()
            } else {
                detail
            })),
            Some(code) => Err(InvocationError::Hard(format!("exit status {code}: {detail}"))),
            None => Err(InvocationError::Transient(
                "terminated by signal".to_string(),
            )),
        }
    }
}
