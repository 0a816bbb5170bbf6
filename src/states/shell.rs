//! Shell Script
//!
//! Runs a bash script synchronously inside `execute`. The script is
//! rendered against the context first, and the top element of each type
//! is exported as `STATEFLOW_<TYPE>` (its name) and `STATEFLOW_<TYPE>_JSON`
//! (its payload).
//!
//! A script that outlives its timeout is killed along with its process
//! group and the state fails.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use serde_json::json;

use crate::context::ContextStack;
use crate::execution::{ExecutionContext, ExecutionResponse, State, StateError, StateResponse};

/// Upper bound on a script run unless configured otherwise.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Interval for checking whether the script exited.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct ShellState {
    script: String,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ShellState {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            working_dir: None,
            timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Result of one script run.
struct ScriptOutput {
    status: Option<ExitStatus>,
    stdout: String,
    stderr: String,
    timed_out: bool,
}

/// Environment variables exposing the context to the script.
fn context_env(elements: &ContextStack) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    // Later elements shadow earlier ones of the same type.
    for element in elements.iter() {
        let key = format!(
            "STATEFLOW_{}",
            element
                .element_type()
                .as_str()
                .to_ascii_uppercase()
                .replace(|c: char| !c.is_ascii_alphanumeric(), "_")
        );
        env.insert(format!("{}_JSON", key), element.payload().to_string());
        env.insert(key, element.name().to_string());
    }
    env
}

/// Writes the script to a temporary file.
fn create_execution_script(instance_id: &str, script: &str) -> Result<PathBuf, StateError> {
    let script_dir = std::env::temp_dir().join("stateflow_scripts");
    fs::create_dir_all(&script_dir)?;

    let script_path = script_dir.join(format!("state_{}.sh", instance_id));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -e")?;
    writeln!(file, "{}", script)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

fn execute_with_bash(
    script_path: &Path,
    env: &BTreeMap<String, String>,
    working_dir: &Option<PathBuf>,
    timeout: Duration,
) -> Result<ScriptOutput, StateError> {
    let mut cmd = Command::new("bash");
    cmd.arg(script_path)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
        debug!("Executing in directory: {}", dir.display());
    }

    let mut child = cmd.spawn()?;
    let stdout = read_in_background(child.stdout.take());
    let stderr = read_in_background(child.stderr.take());

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ScriptOutput {
                status: Some(status),
                stdout: collect(stdout),
                stderr: collect(stderr),
                timed_out: false,
            });
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }

    warn!("Script {} exceeded {:?}; killing it", script_path.display(), timeout);
    kill_script(&mut child);
    child.wait()?;

    // Readers are left to finish on their own; a surviving grandchild may
    // still hold the pipes open.
    Ok(ScriptOutput {
        status: None,
        stdout: String::new(),
        stderr: String::new(),
        timed_out: true,
    })
}

/// Kills the script's whole process group, falling back to the shell alone.
fn kill_script(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        if let Ok(status) = Command::new("kill").args(["-KILL", "--", group.as_str()]).status() {
            if status.success() {
                return;
            }
        }
    }

    if let Err(e) = child.kill() {
        warn!("Failed to kill script process {}: {}", child.id(), e);
    }
}

fn read_in_background<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buffer) {
                debug!("Stopped reading script output: {}", e);
            }
            buffer
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

impl State for ShellState {
    fn kind(&self) -> &'static str {
        "shell"
    }

    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<StateResponse, StateError> {
        let instance = ctx.instance();
        let script = ctx.evaluator().render(&self.script, ctx.elements())?;
        let script_path = create_execution_script(&instance.id, &script)?;

        let output = execute_with_bash(
            &script_path,
            &context_env(ctx.elements()),
            &self.working_dir,
            self.timeout,
        );

        if let Err(e) = fs::remove_file(&script_path) {
            warn!("Failed to clean up script {}: {}", script_path.display(), e);
        }
        let output = output?;

        let exit_code = output.status.and_then(|status| status.code());
        let result = json!({
            "exit_code": exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
            "timed_out": output.timed_out,
        });

        if output.timed_out {
            error!(
                "State '{}' script timed out after {:?}",
                instance.state_name, self.timeout
            );
            return Ok(ExecutionResponse::failed(format!("script timed out after {:?}", self.timeout))
                .with_output(result)
                .into());
        }

        if output.status.map_or(false, |status| status.success()) {
            debug!("State '{}' script completed", instance.state_name);
            return Ok(ExecutionResponse::success().with_output(result).into());
        }

        error!(
            "State '{}' script failed with exit code: {:?}",
            instance.state_name, exit_code
        );
        if !output.stderr.trim().is_empty() {
            error!("stderr:\n{}", output.stderr);
        }

        Ok(ExecutionResponse::failed(format!("script exited with code {:?}", exit_code))
            .with_output(result)
            .into())
    }
}
