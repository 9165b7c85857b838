use crate::config::{AppDescriptor, Paths};
use crate::error::{Result, WardenError};
use crate::process::output::LogSink;
use crate::registry::PidRegistry;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{error, info};

/// A freshly spawned child with its output streams and log files
#[derive(Debug)]
pub struct ProcessHandle {
    /// Application name from the descriptor
    pub app: String,

    /// Process ID assigned by the OS
    pub pid: u32,

    /// The child process handle
    pub child: Child,

    pub stdout: ChildStdout,
    pub stderr: ChildStderr,

    /// `<name>-out.log`
    pub out_log: LogSink,

    /// `<name>-err.log`
    pub err_log: LogSink,
}

/// Spawns application children and records them in the PID registry
#[derive(Debug, Clone)]
pub struct Launcher {
    registry: PidRegistry,
    app_dir: PathBuf,
    log_dir: PathBuf,
    supervisor_pid: u32,
}

impl Launcher {
    pub fn new(registry: PidRegistry, paths: &Paths) -> Self {
        Self {
            registry,
            app_dir: paths.app_dir.clone(),
            log_dir: paths.log_dir.clone(),
            supervisor_pid: std::process::id(),
        }
    }

    pub fn registry(&self) -> &PidRegistry {
        &self.registry
    }

    /// Launch one child for `descriptor`
    ///
    /// Fails with `AlreadyRunning` (and touches nothing) if the application
    /// has a live PID record. Stale records are cleaned up on the way. The
    /// PID record is only written once the child has been spawned.
    ///
    /// # Returns
    /// * `Ok(ProcessHandle)` - Spawned and recorded child, output not yet consumed
    /// * `Err(WardenError)` - `AlreadyRunning`, `LogFileError`, `SpawnError` or `RegistryError`
    pub async fn launch(&self, descriptor: &AppDescriptor) -> Result<ProcessHandle> {
        let name = descriptor.name.as_str();
        info!(app = %name, "Start attempted");

        if self.registry.is_running(name)? {
            return Err(WardenError::AlreadyRunning(name.to_string()));
        }

        let cwd = descriptor.working_dir(&self.app_dir);

        tokio::fs::create_dir_all(&self.log_dir).await.map_err(|e| {
            WardenError::LogError(format!(
                "Failed to create log directory {}: {}",
                self.log_dir.display(),
                e
            ))
        })?;
        let out_log = LogSink::open(descriptor.output_log(&self.log_dir)).await?;
        let err_log = LogSink::open(descriptor.error_log(&self.log_dir)).await?;

        let mut command = build_command(descriptor, &cwd)?;
        let mut child = command.spawn().map_err(|e| {
            WardenError::SpawnError(format!("Failed to spawn '{}' in {}: {}", name, cwd.display(), e))
        })?;

        let pid = child.id().ok_or_else(|| {
            WardenError::SpawnError(format!("Failed to get PID for '{}'", name))
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            discard(&mut child).await;
            return Err(WardenError::SpawnError(format!(
                "No output pipes available for '{}'",
                name
            )));
        };

        if let Err(e) = self.registry.record_start(name, pid, self.supervisor_pid) {
            error!(
                app = %name,
                pid,
                "Could not record the new child, killing it: {}",
                e
            );
            discard(&mut child).await;
            return Err(e);
        }

        info!(app = %name, pid, cwd = %cwd.display(), "Spawned");

        Ok(ProcessHandle {
            app: name.to_string(),
            pid,
            child,
            stdout,
            stderr,
            out_log,
            err_log,
        })
    }
}

/// Build the command for a descriptor
///
/// With an interpreter the entry point is passed as its first argument and
/// resolved by the interpreter against the working directory. Without one,
/// a relative entry point is resolved against the working directory here.
fn build_command(descriptor: &AppDescriptor, cwd: &Path) -> Result<Command> {
    let (program, entry_arg) = match descriptor.interpreter {
        Some(ref interpreter) => (interpreter.clone(), Some(descriptor.entry_point.clone())),
        None if descriptor.entry_point.is_absolute() => (descriptor.entry_point.clone(), None),
        None => (cwd.join(&descriptor.entry_point), None),
    };

    if program.is_absolute() && !program.exists() {
        return Err(WardenError::SpawnError(format!(
            "Program does not exist: {}",
            program.display()
        )));
    }

    let mut command = Command::new(&program);

    if let Some(entry) = entry_arg {
        command.arg(entry);
    }
    command.args(&descriptor.args);

    command.current_dir(cwd);
    command.env_clear();
    command.envs(descriptor.child_env());

    #[cfg(unix)]
    if let Some(user) = descriptor.user {
        command.uid(user.uid);
        command.gid(user.gid);
    }

    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    Ok(command)
}

async fn discard(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}
