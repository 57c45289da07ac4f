use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::FutureError;
use crate::future::OpFuture;

/// How long output pipes may stay open after the process is gone. A
/// descendant that escaped the kill or was put in the background can hold
/// them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, `128 + n` when the process was ended by signal `n`.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
    /// The process ran past its timeout and was killed.
    pub timed_out: bool,
}

/// A subprocess invocation, configured but not started yet.
///
/// ```rust,no_run
/// # use std::time::Duration;
/// # use hardpoint::future::ExecFuture;
/// # async fn run() -> Result<(), hardpoint::FutureError> {
/// let output = ExecFuture::new("git")
///     .args(["cat-file", "--batch-check", "--"])
///     .write(b"HEAD\n")
///     .set_timeout(Duration::from_secs(15))
///     .resolvex()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ExecFuture {
    program: String,
    args: Vec<String>,
    cwd: Option<Utf8PathBuf>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl ExecFuture {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    /// Runs `command` through `sh -c`.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(command)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Queues bytes for the process's stdin. Stdin is closed once everything
    /// queued has been written.
    pub fn write(mut self, bytes: impl AsRef<[u8]>) -> Self {
        self.stdin
            .get_or_insert_with(Vec::new)
            .extend_from_slice(bytes.as_ref());
        self
    }

    /// Kills the process if it is still running after `timeout`.
    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Spawns the process. Must be called from within a tokio runtime.
    pub fn start(self) -> Result<RunningExec, FutureError> {
        let command = self.command_line();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Its own group, so a kill reaches everything the command started.
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| FutureError::Spawn {
            command: command.clone(),
            source,
        })?;

        let stdout = Buffer::default();
        let stderr = Buffer::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(stdout.drain_from(pipe));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(stderr.drain_from(pipe));
        }

        let writer = match (child.stdin.take(), self.stdin) {
            (Some(mut pipe), Some(bytes)) => Some(tokio::spawn(async move {
                // A process that exits without reading its input closes the
                // pipe early, which is not an error for us.
                let _ = pipe.write_all(&bytes).await;
                let _ = pipe.shutdown().await;
            })),
            _ => None,
        };

        tracing::trace!(command = %command, "spawned");

        Ok(RunningExec {
            command,
            child,
            stdout,
            stderr,
            readers,
            writer,
            timeout: self.timeout,
            deadline: self.timeout.map(|timeout| Instant::now() + timeout),
        })
    }

    /// Waits for the process and returns its output, whatever the exit code.
    pub async fn resolve(self) -> Result<ExecOutput, FutureError> {
        self.start()?.resolve().await
    }

    /// Like [`ExecFuture::resolve`], but a non-zero exit or a timeout is an
    /// error.
    pub async fn resolvex(self) -> Result<ExecOutput, FutureError> {
        self.start()?.resolvex().await
    }

    /// [`ExecFuture::resolvex`] as an operation for the engine's pool.
    pub fn boxed(self) -> OpFuture<ExecOutput> {
        Box::pin(self.resolvex())
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[derive(Clone, Default)]
struct Buffer(Arc<Mutex<Vec<u8>>>);

impl Buffer {
    fn drain_from<R>(&self, mut pipe: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            while let Ok(n) = pipe.read(&mut chunk).await {
                if n == 0 {
                    break;
                }
                sink.0
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]);
            }
        })
    }

    fn take(&self) -> String {
        let bytes = std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner));
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// A process that has been started.
pub struct RunningExec {
    command: String,
    child: Child,
    stdout: Buffer,
    stderr: Buffer,
    readers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl std::fmt::Debug for RunningExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningExec")
            .field("command", &self.command)
            .field("pid", &self.child.id())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RunningExec {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether the process has exited or overrun its timeout.
    pub fn is_ready(&mut self) -> bool {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return true;
        }
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Output produced since the previous call, as `(stdout, stderr)`.
    pub fn read(&mut self) -> (String, String) {
        (self.stdout.take(), self.stderr.take())
    }

    /// Waits for the process to exit. When the timeout passes first the
    /// process is killed and the output is flagged as timed out.
    pub async fn resolve(mut self) -> Result<ExecOutput, FutureError> {
        let (status, timed_out) = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.child.wait()).await {
                Ok(status) => (status, false),
                Err(_) => {
                    self.kill();
                    (self.child.wait().await, true)
                }
            },
            None => (self.child.wait().await, false),
        };

        self.finish(status, timed_out).await
    }

    /// Like [`RunningExec::resolve`], but a non-zero exit or a timeout is an
    /// error.
    pub async fn resolvex(self) -> Result<ExecOutput, FutureError> {
        let command = self.command.clone();
        let timeout = self.timeout;
        let output = self.resolve().await?;

        if output.timed_out {
            return Err(FutureError::Killed {
                command,
                timeout: timeout.unwrap_or_default(),
            });
        }
        if output.status != 0 {
            return Err(FutureError::CommandFailed {
                command,
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        Ok(output)
    }

    /// Kills the process and returns whatever output it produced.
    pub async fn resolve_kill(mut self) -> Result<ExecOutput, FutureError> {
        self.kill();
        let status = self.child.wait().await;
        self.finish(status, false).await
    }

    /// Sends SIGKILL to the whole process group, then to the child itself.
    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id().and_then(|pid| i32::try_from(pid).ok()) {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                tracing::trace!(command = %self.command, "killpg failed: {err}");
            }
        }
        let _ = self.child.start_kill();
    }

    async fn finish(
        mut self,
        status: std::io::Result<std::process::ExitStatus>,
        timed_out: bool,
    ) -> Result<ExecOutput, FutureError> {
        let status = status.map_err(|source| FutureError::Io {
            command: self.command.clone(),
            source,
        })?;

        let deadline = Instant::now() + DRAIN_GRACE;
        for mut task in self.writer.take().into_iter().chain(self.readers.drain(..)) {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                tracing::debug!(command = %self.command, "output still open after exit, dropped");
            }
        }

        tracing::trace!(command = %self.command, ?status, timed_out, "exited");

        Ok(ExecOutput {
            status: exit_code(status),
            stdout: self.stdout.take(),
            stderr: self.stderr.take(),
            timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stdin_reaches_process() {
        let output = ExecFuture::new("cat").write(b"hello ").write(b"world").resolvex().await.unwrap();

        assert_eq!(output.stdout, "hello world");
        assert_eq!(output.status, 0);
    }

    #[tokio::test]
    async fn test_failure_is_distinct_from_timeout() {
        let failed = ExecFuture::shell("echo out; echo err >&2; exit 3").resolvex().await;
        match failed {
            Err(FutureError::CommandFailed { status, stdout, stderr, .. }) => {
                assert_eq!(status, 3);
                assert_eq!(stdout, "out\n");
                assert_eq!(stderr, "err\n");
            }
            other => panic!("expected a command failure, got {other:?}"),
        }

        let killed = ExecFuture::shell("sleep 5")
            .set_timeout(Duration::from_millis(100))
            .resolvex()
            .await;
        assert!(matches!(killed, Err(FutureError::Killed { .. })));
    }

    #[tokio::test]
    async fn test_resolve_does_not_fail_on_exit_code() {
        let output = ExecFuture::shell("exit 4").resolve().await.unwrap();

        assert_eq!(output.status, 4);
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_partial_reads() {
        let mut running = ExecFuture::shell("echo first; sleep 0.4; echo second")
            .start()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (early, _) = running.read();
        assert_eq!(early, "first\n");
        assert!(!running.is_ready());

        let output = running.resolve().await.unwrap();
        assert_eq!(output.stdout, "second\n");
    }

    #[tokio::test]
    async fn test_resolve_kill() {
        let running = ExecFuture::shell("sleep 5").start().unwrap();
        let output = running.resolve_kill().await.unwrap();

        assert_eq!(output.status, 128 + 9);
    }

    #[tokio::test]
    async fn test_kill_reaches_the_whole_command() {
        let s = std::time::Instant::now();
        let running = ExecFuture::shell("echo a; sleep 3; echo b").start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let output = running.resolve_kill().await.unwrap();

        assert!(s.elapsed() < Duration::from_millis(1500), "took {:?}", s.elapsed());
        assert_eq!(output.stdout, "a\n");
        assert_eq!(output.status, 128 + 9);
    }

    #[tokio::test]
    async fn test_timeout_bounds_compound_commands() {
        let s = std::time::Instant::now();
        let output = ExecFuture::shell("echo a; sleep 3; echo b")
            .set_timeout(Duration::from_millis(100))
            .resolve()
            .await
            .unwrap();

        assert!(s.elapsed() < Duration::from_millis(1500), "took {:?}", s.elapsed());
        assert!(output.timed_out);
        assert_eq!(output.stdout, "a\n");

        let killed = ExecFuture::shell("echo a; sleep 3; echo b")
            .set_timeout(Duration::from_millis(100))
            .resolvex()
            .await;
        assert!(matches!(killed, Err(FutureError::Killed { .. })));
        assert!(s.elapsed() < Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_resolve() {
        let s = std::time::Instant::now();
        let output = ExecFuture::shell("sleep 3 & echo started").resolve().await.unwrap();

        assert!(s.elapsed() < Duration::from_millis(1500), "took {:?}", s.elapsed());
        assert_eq!(output.stdout, "started\n");
        assert_eq!(output.status, 0);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let result = ExecFuture::new("definitely-not-a-real-program-7c1f").resolve().await;

        assert!(matches!(result, Err(FutureError::Spawn { .. })));
    }
}
