//! Process handles - spawn one shell per task and control its lifetime
//!
//! Each task runs as `$SHELL -c '<cmd>; RC=$?; env >&3; exit $RC'` inside a
//! fresh process group. File descriptor 3 is a side channel that carries the
//! shell's final environment back to us, separate from stdout and stderr.
//! Termination signals the whole group so helpers spawned by the shell go
//! down with it. The process-group and fd-3 plumbing is Unix specific.

use crate::error::ProcessError;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Descriptor the child shell writes its environment to
pub const ENV_FD: i32 = 3;

/// Shell variable holding the user command's exit status
const RC_VAR: &str = "TASKLINE_RC";

/// Everything needed to launch one task command
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub command: String,
    pub shell: String,
    /// Prefix the command with `sudo -S`
    pub sudo: bool,
    /// Extra variables layered on top of our own environment
    pub env: Option<HashMap<String, String>>,
    /// Written to stdin followed by a newline (the sudo password)
    pub stdin: Option<String>,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>, shell: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            shell: shell.into(),
            sudo: false,
            env: None,
            stdin: None,
        }
    }

    pub fn with_env(mut self, env: Option<HashMap<String, String>>) -> Self {
        self.env = env;
        self
    }

    pub fn with_sudo(mut self, sudo: bool, password: Option<String>) -> Self {
        self.sudo = sudo;
        self.stdin = if sudo { password } else { None };
        self
    }

    /// Script handed to `shell -c`
    pub fn script(&self) -> String {
        let sudo = if self.sudo { "sudo -S " } else { "" };
        format!(
            "{sudo}{cmd}; {rc}=$?; env >&{fd}; exit ${rc}",
            sudo = sudo,
            cmd = self.command,
            rc = RC_VAR,
            fd = ENV_FD
        )
    }
}

/// Exit code recorded for a task killed by [`Terminator::terminate`]
#[cfg(unix)]
pub const KILLED_EXIT_CODE: i32 = 128 + libc::SIGKILL;
#[cfg(not(unix))]
pub const KILLED_EXIT_CODE: i32 = 128 + 9;

/// Handle that can kill a task's process group from anywhere
#[derive(Debug, Clone, Copy, Default)]
pub struct Terminator {
    pgid: Option<i32>,
}

impl Terminator {
    /// A terminator for a process that never started
    pub fn none() -> Self {
        Self { pgid: None }
    }

    pub fn pgid(&self) -> Option<i32> {
        self.pgid
    }

    /// SIGKILL the whole process group; a group that is already gone is fine
    #[cfg(unix)]
    pub fn terminate(&self) -> Result<(), ProcessError> {
        let Some(pgid) = self.pgid else {
            return Ok(());
        };
        let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if result == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(ProcessError::Signal { pgid, source: err });
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn terminate(&self) -> Result<(), ProcessError> {
        Ok(())
    }
}

/// A running task shell
pub struct ShellProcess {
    command: String,
    child: Child,
    env_reader: Option<File>,
    terminator: Terminator,
}

impl ShellProcess {
    /// Spawn the shell in its own process group with stdout/stderr piped
    pub fn spawn(spec: &ShellCommand) -> Result<Self, ProcessError> {
        let (env_reader, env_writer) = env_pipe().map_err(ProcessError::EnvPipe)?;

        let mut cmd = Command::new(&spec.shell);
        cmd.arg("-c")
            .arg(spec.script())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(env) = &spec.env {
            cmd.envs(env);
        }
        configure_child(&mut cmd, env_writer.as_ref());

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            command: spec.command.clone(),
            source,
        })?;
        // only the child may hold the write end, or the reader never sees EOF
        drop(env_writer);

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                let payload = format!("{}\n", input);
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    log::debug!("Failed to write stdin: {}", e);
                }
            });
        }

        let terminator = Terminator {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        };
        log::debug!(
            "Spawned `{}` (pgid {:?})",
            spec.command,
            terminator.pgid()
        );

        Ok(Self {
            command: spec.command.clone(),
            child,
            env_reader,
            terminator,
        })
    }

    pub fn terminator(&self) -> Terminator {
        self.terminator
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Start draining the environment side channel.
    ///
    /// Reading begins right away so a large environment cannot fill the
    /// pipe and stall the shell on exit.
    pub fn harvest_env(&mut self) -> JoinHandle<Result<String, ProcessError>> {
        let reader = self.env_reader.take();
        tokio::task::spawn_blocking(move || {
            let Some(mut file) = reader else {
                return Ok(String::new());
            };
            let mut data = Vec::new();
            file.read_to_end(&mut data).map_err(ProcessError::EnvPipe)?;
            Ok(String::from_utf8_lossy(&data).into_owned())
        })
    }

    /// Wait for exit and translate the status into an exit code
    pub async fn wait(&mut self) -> Result<i32, ProcessError> {
        let status = self.child.wait().await.map_err(|source| ProcessError::Wait {
            command: self.command.clone(),
            source,
        })?;
        Ok(exit_code(status))
    }
}

/// Exit code, or `128 + signal` for a signal-terminated process
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
type PipeWriter = std::os::fd::OwnedFd;

#[cfg(not(unix))]
type PipeWriter = ();

#[cfg(unix)]
fn env_pipe() -> io::Result<(Option<File>, Option<PipeWriter>)> {
    use std::os::fd::{FromRawFd, OwnedFd};

    let mut fds = [0 as libc::c_int; 2];
    #[cfg(target_os = "linux")]
    let created = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(target_os = "linux"))]
    let created = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if created == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe() just handed us two fresh descriptors we now own
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    #[cfg(not(target_os = "linux"))]
    {
        set_cloexec(&read, true)?;
        set_cloexec(&write, true)?;
    }
    Ok((Some(File::from(read)), Some(write)))
}

#[cfg(not(unix))]
fn env_pipe() -> io::Result<(Option<File>, Option<PipeWriter>)> {
    Ok((None, None))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_cloexec(fd: &impl std::os::fd::AsRawFd, on: bool) -> io::Result<()> {
    set_cloexec_raw(fd.as_raw_fd(), on)
}

#[cfg(unix)]
fn set_cloexec_raw(fd: libc::c_int, on: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    let flags = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// New process group, plus the env pipe's write end moved onto fd 3
#[cfg(unix)]
fn configure_child(cmd: &mut Command, env_writer: Option<&PipeWriter>) {
    use std::os::fd::AsRawFd;

    let writer_fd = env_writer.map(|fd| fd.as_raw_fd());
    // SAFETY: only async-signal-safe libc calls run between fork and exec
    unsafe {
        cmd.pre_exec(move || {
            if libc::setpgid(0, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            if let Some(fd) = writer_fd {
                if fd == ENV_FD {
                    set_cloexec_raw(fd, false)?;
                } else if libc::dup2(fd, ENV_FD) == -1 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn configure_child(_cmd: &mut Command, _env_writer: Option<&PipeWriter>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::lines::parse_env;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_script_wraps_command() {
        let cmd = ShellCommand::new("make test", "sh");
        assert_eq!(
            cmd.script(),
            "make test; TASKLINE_RC=$?; env >&3; exit $TASKLINE_RC"
        );
        let cmd = cmd.with_sudo(true, Some("secret".into()));
        assert!(cmd.script().starts_with("sudo -S make test;"));
        assert_eq!(cmd.stdin.as_deref(), Some("secret"));
    }

    #[test]
    fn test_env_pipe_is_close_on_exec() {
        use std::os::fd::AsRawFd;

        let (read, write) = env_pipe().unwrap();
        let (read, write) = (read.unwrap(), write.unwrap());
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert!(flags != -1);
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
    }

    #[tokio::test]
    async fn test_exit_code_and_env_harvest() {
        let mut env = HashMap::new();
        env.insert("INHERITED".to_string(), "yes".to_string());
        let spec = ShellCommand::new("export FOO=42; exit 3", "sh").with_env(Some(env));

        let mut process = ShellProcess::spawn(&spec).expect("spawn");
        let harvest = process.harvest_env();
        assert_eq!(process.wait().await.expect("wait"), 3);

        // `exit 3` leaves before the env dump runs
        let dumped = harvest.await.expect("join").expect("read");
        assert!(dumped.is_empty());
    }

    #[tokio::test]
    async fn test_env_side_channel_is_separate_from_stdout() {
        let spec = ShellCommand::new("echo hi; export FOO=42", "sh");
        let mut process = ShellProcess::spawn(&spec).expect("spawn");
        let mut stdout = process.take_stdout().expect("stdout");
        let harvest = process.harvest_env();

        let mut out = String::new();
        stdout.read_to_string(&mut out).await.expect("read stdout");
        assert_eq!(process.wait().await.expect("wait"), 0);
        assert_eq!(out, "hi\n");

        let env = parse_env(&harvest.await.expect("join").expect("read"));
        assert_eq!(env.get("FOO").map(String::as_str), Some("42"));
    }

    #[tokio::test]
    async fn test_terminate_kills_group() {
        let spec = ShellCommand::new("sleep 30 & sleep 30", "sh");
        let mut process = ShellProcess::spawn(&spec).expect("spawn");
        let terminator = process.terminator();
        assert!(terminator.pgid().is_some());

        terminator.terminate().expect("terminate");
        let code = process.wait().await.expect("wait");
        assert_eq!(code, 128 + libc::SIGKILL);

        // group already gone: still fine
        terminator.terminate().expect("second terminate");
        Terminator::none().terminate().expect("noop");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let spec = ShellCommand::new("true", "/nonexistent/shell");
        match ShellProcess::spawn(&spec) {
            Err(ProcessError::Spawn { command, .. }) => assert_eq!(command, "true"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }
}
