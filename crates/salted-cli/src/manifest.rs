//! Manifest - JSON task definitions backed by shell commands
//!
//! ```json
//! { "tasks": [
//!     { "id": "stream", "version": "1.0", "command": "cat data.tsv" },
//!     { "id": "aggregate", "version": "1.2", "deps": ["stream"],
//!       "params": {"window": 7}, "command": "./aggregate.sh" }
//! ] }
//! ```
//!
//! A command receives its inputs as a JSON array on stdin, each payload
//! base64-encoded in `data`; its stdout is the artifact payload.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose;
use base64::Engine;
use salted_core::descriptor::deserialize_params;
use salted_core::{Param, Task, TaskContext, TaskDescriptor, TaskLogic};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub tasks: Vec<ManifestTask>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestTask {
    #[serde(alias = "task_id")]
    pub id: String,
    #[serde(alias = "logic_version")]
    pub version: String,
    #[serde(default, alias = "dependencies")]
    pub deps: Vec<String>,
    #[serde(default, alias = "parameters", deserialize_with = "deserialize_params")]
    pub params: Vec<Param>,
    pub command: String,
}

impl ManifestTask {
    pub fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor {
            task_id: self.id.clone(),
            logic_version: self.version.clone(),
            dependencies: self.deps.clone(),
            parameters: self.params.clone(),
        }
    }
}

impl Manifest {
    /// Parse straight from text so parameter order survives
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("parsing manifest {}", path.display()))?;
        Ok(manifest)
    }

    pub fn descriptors(&self) -> Vec<TaskDescriptor> {
        self.tasks.iter().map(ManifestTask::descriptor).collect()
    }

    /// Tasks whose commands run from `workdir`
    pub fn into_tasks(self, workdir: &Path) -> Vec<Task> {
        self.tasks
            .into_iter()
            .map(|t| {
                Task::new(
                    t.descriptor(),
                    ShellLogic {
                        command: t.command,
                        workdir: workdir.to_path_buf(),
                    },
                )
            })
            .collect()
    }
}

/// Input record written to a command's stdin
#[derive(Debug, Serialize)]
struct InputRecord<'a> {
    task_id: &'a str,
    content_hash: String,
    data: String,
}

/// Runs a shell command as task logic
pub struct ShellLogic {
    command: String,
    workdir: PathBuf,
}

impl TaskLogic for ShellLogic {
    fn execute(&self, ctx: &TaskContext) -> Result<Vec<u8>> {
        let records: Vec<InputRecord> = ctx
            .inputs
            .iter()
            .map(|input| InputRecord {
                task_id: &input.task_id,
                content_hash: input.content_hash.to_hex(),
                data: general_purpose::STANDARD.encode(input.payload.as_slice()),
            })
            .collect();
        let stdin_data = serde_json::to_vec(&records)?;

        // Use sh on Unix, cmd on Windows
        let (shell, shell_arg) = if cfg!(target_os = "windows") {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };

        let mut command = Command::new(shell);
        command
            .arg(shell_arg)
            .arg(&self.command)
            .current_dir(&self.workdir)
            .env("SALTED_TASK_ID", ctx.task_id())
            .env("SALTED_CONTENT_HASH", ctx.content_hash.to_hex())
            .env("SALTED_SALT", ctx.content_hash.short(6))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for param in &ctx.descriptor.parameters {
            command.env(param_env_name(&param.name), param.value.to_string());
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("spawning `{}`", self.command))?;

        // Feed stdin from another thread so a chatty child cannot deadlock us
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || {
                // A command that ignores stdin may close it early
                let _ = stdin.write_all(&stdin_data);
            })
        });

        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            let _ = writer.join();
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("`{}` exited with {}: {}", self.command, output.status, stderr.trim());
        }

        Ok(output.stdout)
    }
}

/// `window-size` -> `SALTED_PARAM_WINDOW_SIZE`
fn param_env_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("SALTED_PARAM_{}", cleaned)
}
