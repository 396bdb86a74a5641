use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{process::Command, time::timeout};
use tracing::{info, warn};

use crate::boards;

pub const SKETCH_EXTENSION: &str = "ino";
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ToolchainConfig {
    pub program: PathBuf,
    pub build_root: PathBuf,
    pub invoke_timeout: Duration,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("arduino-cli"),
            build_root: PathBuf::from(".sketchbench/build"),
            invoke_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolRunReport {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub struct CompileOutcome {
    pub report: ToolRunReport,
    pub build_dir: PathBuf,
}

#[derive(Debug)]
pub enum ToolchainError {
    UnsupportedBoard(String),
    Stage { path: PathBuf, source: io::Error },
    Launch { program: PathBuf, source: io::Error },
    TimedOut { after: Duration },
}

impl std::fmt::Display for ToolchainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolchainError::UnsupportedBoard(fqbn) => {
                write!(f, "unsupported board: {fqbn}")
            }
            ToolchainError::Stage { path, source } => {
                write!(f, "failed to stage sketch at {}: {source}", path.display())
            }
            ToolchainError::Launch { program, source } => {
                write!(
                    f,
                    "failed to launch toolchain {}: {source}",
                    program.display()
                )
            }
            ToolchainError::TimedOut { after } => {
                write!(f, "toolchain did not finish within {}s", after.as_secs())
            }
        }
    }
}

impl std::error::Error for ToolchainError {}

#[derive(Clone)]
pub struct ToolchainInvoker {
    config: ToolchainConfig,
}

impl ToolchainInvoker {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    // The CLI insists that the sketch directory and its primary .ino share
    // a name, so each compile gets a dedicated directory under build_root.
    pub async fn compile(
        &self,
        sketch_name: &str,
        source: &str,
        fqbn: &str,
    ) -> Result<CompileOutcome, ToolchainError> {
        if boards::display_name(fqbn).is_none() {
            return Err(ToolchainError::UnsupportedBoard(fqbn.to_string()));
        }

        let build_dir = self.stage(sketch_name, source)?;
        let report = self
            .run(&[
                "compile",
                "--fqbn",
                fqbn,
                "--output-dir",
                &build_dir.to_string_lossy(),
                &build_dir.to_string_lossy(),
            ])
            .await?;
        if report.success {
            info!(sketch = sketch_name, fqbn, "compile succeeded");
        } else {
            warn!(
                sketch = sketch_name,
                fqbn,
                exit_code = report.exit_code,
                "compile failed"
            );
        }
        Ok(CompileOutcome { report, build_dir })
    }

    pub async fn upload(
        &self,
        build_dir: &Path,
        fqbn: &str,
        port: &str,
    ) -> Result<ToolRunReport, ToolchainError> {
        if boards::display_name(fqbn).is_none() {
            return Err(ToolchainError::UnsupportedBoard(fqbn.to_string()));
        }

        let report = self
            .run(&[
                "upload",
                "--fqbn",
                fqbn,
                "--port",
                port,
                &build_dir.to_string_lossy(),
            ])
            .await?;
        if report.success {
            info!(fqbn, port, "upload succeeded");
        } else {
            warn!(fqbn, port, exit_code = report.exit_code, "upload failed");
        }
        Ok(report)
    }

    pub async fn probe_version(&self) -> Option<String> {
        let probe = Self {
            config: ToolchainConfig {
                invoke_timeout: VERSION_PROBE_TIMEOUT,
                ..self.config.clone()
            },
        };
        match probe.run(&["version"]).await {
            Ok(report) if report.success => {
                Some(report.stdout.lines().next().unwrap_or_default().to_string())
            }
            Ok(_) | Err(_) => None,
        }
    }

    fn stage(&self, sketch_name: &str, source: &str) -> Result<PathBuf, ToolchainError> {
        let stem = sketch_name
            .strip_suffix(&format!(".{SKETCH_EXTENSION}"))
            .unwrap_or(sketch_name);
        let build_dir = self.config.build_root.join(stem);
        fs::create_dir_all(&build_dir).map_err(|source| ToolchainError::Stage {
            path: build_dir.clone(),
            source,
        })?;
        let primary = build_dir.join(format!("{stem}.{SKETCH_EXTENSION}"));
        fs::write(&primary, source).map_err(|source| ToolchainError::Stage {
            path: primary.clone(),
            source,
        })?;
        Ok(build_dir)
    }

    async fn run(&self, args: &[&str]) -> Result<ToolRunReport, ToolchainError> {
        let mut command = Command::new(&self.config.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| ToolchainError::Launch {
            program: self.config.program.clone(),
            source,
        })?;

        // kill_on_drop reaps the child when the timeout drops the wait
        // future, which is the cancellation path for a wedged toolchain.
        let output = match timeout(self.config.invoke_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ToolchainError::Launch {
                    program: self.config.program.clone(),
                    source,
                });
            }
            Err(_) => {
                warn!(
                    program = %self.config.program.display(),
                    timeout_s = self.config.invoke_timeout.as_secs(),
                    "toolchain invocation timed out, killing child"
                );
                return Err(ToolchainError::TimedOut {
                    after: self.config.invoke_timeout,
                });
            }
        };

        Ok(ToolRunReport {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
