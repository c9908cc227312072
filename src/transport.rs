//! Remote command execution.
//!
//! The scheduler only ever talks to a [`Transport`]: run a command in the
//! foreground and get its status and output back, or spawn it and receive a
//! [`ProcessHandle`] that can be polled without blocking. [`SshTransport`]
//! implements this over multiplexed SSH sessions, one per host, and runs
//! commands for hosts listed as local directly through `sh -c`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Output};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join, BoxFuture};
use futures::FutureExt;
use openssh::{KnownHosts, Session as SshSession, SessionBuilder, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{MarionetteError, Result};

/// Status and combined stdout/stderr of a foreground command.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub status: ExitStatus,
    pub output: String,
}

impl RemoteOutput {
    fn from_output(output: &Output) -> Self {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Self {
            status: output.status,
            output: combined,
        }
    }
}

/// Output captured from a spawned process once it has terminated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

impl From<&Output> for CapturedOutput {
    fn from(output: &Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// A process started with [`Transport::spawn`].
#[async_trait]
pub trait ProcessHandle: Send {
    /// Returns the exit status if the process has terminated. Never blocks.
    fn poll(&mut self) -> Result<Option<ExitStatus>>;

    /// Waits for termination if needed and returns what the process printed.
    async fn collect_output(&mut self) -> Result<CapturedOutput>;

    /// Tears the process down and returns what it printed so far.
    async fn kill(&mut self) -> CapturedOutput;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs `command` on `host` in the foreground.
    async fn run(&self, host: &str, command: &str) -> Result<RemoteOutput>;

    /// Starts `command` on `host` and returns immediately.
    async fn spawn(&self, host: &str, command: &str) -> Result<Box<dyn ProcessHandle>>;
}

/// Stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipe {
    Stdout,
    Stderr,
}

/// Output of a running process, readable before it terminates.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    captured: Arc<Mutex<(Vec<u8>, Vec<u8>)>>,
}

impl OutputBuffer {
    pub async fn append(&self, pipe: Pipe, bytes: &[u8]) {
        let mut captured = self.captured.lock().await;
        match pipe {
            Pipe::Stdout => captured.0.extend_from_slice(bytes),
            Pipe::Stderr => captured.1.extend_from_slice(bytes),
        }
    }

    /// What the process printed so far.
    pub async fn snapshot(&self) -> CapturedOutput {
        let captured = self.captured.lock().await;
        CapturedOutput {
            stdout: String::from_utf8_lossy(&captured.0).into_owned(),
            stderr: String::from_utf8_lossy(&captured.1).into_owned(),
        }
    }

    async fn to_output(&self, status: ExitStatus) -> Output {
        let captured = self.captured.lock().await;
        Output {
            status,
            stdout: captured.0.clone(),
            stderr: captured.1.clone(),
        }
    }
}

/// Copies `reader` into `buffer` until EOF.
async fn capture<R: AsyncRead + Unpin>(
    reader: Option<R>,
    buffer: &OutputBuffer,
    pipe: Pipe,
) -> std::io::Result<()> {
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut chunk = [0u8; 4096];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buffer.append(pipe, &chunk[..read]).await;
    }
}

/// Tears down a process that outlives its task, e.g. a remote one.
pub type Killer = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A process driven by its own tokio task.
///
/// The task reports the final [`Output`] over a one-element channel, so the
/// scheduler can check for completion with `try_recv` and only awaits once it
/// knows the result is there.
pub struct TaskHandle {
    task: JoinHandle<()>,
    done_rx: flume::Receiver<Result<Output>>,
    finished: Option<Output>,
    partial: OutputBuffer,
    killer: Option<Killer>,
}

impl TaskHandle {
    pub fn spawn<F>(process: F) -> Self
    where
        F: Future<Output = Result<Output>> + Send + 'static,
    {
        Self::streaming(OutputBuffer::default(), process)
    }

    /// Like [`Self::spawn`], for a process that fills `partial` in as its
    /// output arrives. Killing the handle returns what `partial` holds.
    pub fn streaming<F>(partial: OutputBuffer, process: F) -> Self
    where
        F: Future<Output = Result<Output>> + Send + 'static,
    {
        let (done_tx, done_rx) = flume::bounded(1);
        let task = tokio::spawn(async move {
            // The receiver may be gone if the handle was dropped early.
            let _ = done_tx.send_async(process.await).await;
        });
        Self {
            task,
            done_rx,
            finished: None,
            partial,
            killer: None,
        }
    }

    /// Runs `killer` before aborting the task on [`ProcessHandle::kill`].
    pub fn with_killer(mut self, killer: Killer) -> Self {
        self.killer = Some(killer);
        self
    }

    fn settle(&mut self, result: Result<Output>) -> Result<ExitStatus> {
        let output = result?;
        let status = output.status;
        self.finished = Some(output);
        Ok(status)
    }
}

#[async_trait]
impl ProcessHandle for TaskHandle {
    fn poll(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(output) = &self.finished {
            return Ok(Some(output.status));
        }
        match self.done_rx.try_recv() {
            Ok(result) => self.settle(result).map(Some),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(MarionetteError::ProcessLost(
                "the process task ended without reporting a status".into(),
            )),
        }
    }

    async fn collect_output(&mut self) -> Result<CapturedOutput> {
        if self.finished.is_none() {
            let result = self.done_rx.recv_async().await.map_err(|_| {
                MarionetteError::ProcessLost("the process task ended without output".into())
            })?;
            self.settle(result)?;
        }
        Ok(self
            .finished
            .as_ref()
            .map(CapturedOutput::from)
            .unwrap_or_default())
    }

    async fn kill(&mut self) -> CapturedOutput {
        if let Some(killer) = self.killer.take() {
            killer().await;
        }
        self.task.abort();
        match &self.finished {
            Some(output) => CapturedOutput::from(output),
            None => self.partial.snapshot().await,
        }
    }
}

fn local_shell(command: &str) -> tokio::process::Command {
    let mut shell = tokio::process::Command::new("sh");
    shell
        .arg("-c")
        .arg(command)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    shell
}

/// Runs commands on this machine. The `host` argument is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    async fn run(&self, _host: &str, command: &str) -> Result<RemoteOutput> {
        let output = local_shell(command).output().await?;
        Ok(RemoteOutput::from_output(&output))
    }

    async fn spawn(&self, _host: &str, command: &str) -> Result<Box<dyn ProcessHandle>> {
        let child = local_shell(command).spawn()?;
        let buffer = OutputBuffer::default();
        Ok(Box::new(TaskHandle::streaming(
            buffer.clone(),
            wait_local(child, buffer),
        )))
    }
}

// Dropping the child kills it, so aborting the task is enough to kill it.
async fn wait_local(mut child: tokio::process::Child, buffer: OutputBuffer) -> Result<Output> {
    let (stdout, stderr) = join(
        capture(child.stdout.take(), &buffer, Pipe::Stdout),
        capture(child.stderr.take(), &buffer, Pipe::Stderr),
    )
    .await;
    stdout?;
    stderr?;
    let status = child.wait().await?;
    Ok(buffer.to_output(status).await)
}

/// How long a kill waits for the remote shell to report its pid.
const PID_WAIT: Duration = Duration::from_secs(5);

/// Single-quotes `text` for a POSIX shell.
fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Makes the remote shell print its pid on the first line, then become `command`.
fn with_pid_line(command: &str) -> String {
    format!("echo $$; exec sh -c {}", shell_quote(command))
}

/// Kills the remote shell `pid` and its direct children.
fn kill_command(pid: u32) -> String {
    format!("pkill -9 -P {0}; kill -9 {0}", pid)
}

async fn wait_remote(
    session: Arc<SshSession>,
    command: String,
    buffer: OutputBuffer,
    pid_tx: flume::Sender<u32>,
) -> Result<Output> {
    let mut remote = session.command("sh");
    let mut child = remote
        .arg("-c")
        .arg(with_pid_line(&command))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .await?;

    let mut stdout = child.stdout().take().map(BufReader::new);
    if let Some(reader) = stdout.as_mut() {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        match line.trim().parse::<u32>() {
            // Bounded(1) and sent once, so this never blocks.
            Ok(pid) => {
                let _ = pid_tx.send(pid);
            }
            Err(_) => buffer.append(Pipe::Stdout, line.as_bytes()).await,
        }
    }
    let stderr = child.stderr().take();
    let (stdout, stderr) = join(
        capture(stdout, &buffer, Pipe::Stdout),
        capture(stderr, &buffer, Pipe::Stderr),
    )
    .await;
    stdout?;
    stderr?;
    let status = child.wait().await?;
    Ok(buffer.to_output(status).await)
}

async fn kill_remote(session: Arc<SshSession>, host: String, pid_rx: flume::Receiver<u32>) {
    let pid = match tokio::time::timeout(PID_WAIT, pid_rx.recv_async()).await {
        Ok(Ok(pid)) => pid,
        _ => {
            tracing::warn!(host = %host, "remote pid unknown, the process may keep running");
            return;
        }
    };
    let result = session
        .command("sh")
        .arg("-c")
        .arg(kill_command(pid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(_) => tracing::debug!(host = %host, pid, "killed remote process"),
        Err(error) => tracing::warn!(host = %host, pid, %error, "failed to kill remote process"),
    }
}

/// How SSH connections are established.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Alternative ssh configuration file, passed as `ssh -F`.
    pub ssh_config: Option<PathBuf>,
    /// Host key checking policy.
    pub known_hosts: KnownHosts,
    pub connect_timeout: Option<Duration>,
    /// Host names that are executed on this machine without SSH.
    pub local_hosts: HashSet<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ssh_config: None,
            known_hosts: KnownHosts::Add,
            connect_timeout: Some(Duration::from_secs(10)),
            local_hosts: HashSet::from(["localhost".to_string()]),
        }
    }
}

/// [`Transport`] over multiplexed SSH sessions.
///
/// Sessions are opened lazily and cached per host. A session that fails a
/// command is dropped from the cache so the next call reconnects.
pub struct SshTransport {
    config: TransportConfig,
    sessions: Mutex<HashMap<String, Arc<SshSession>>>,
}

impl SshTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn is_local(&self, host: &str) -> bool {
        self.config.local_hosts.contains(host)
    }

    async fn session(&self, host: &str) -> Result<Arc<SshSession>> {
        if let Some(session) = self.sessions.lock().await.get(host) {
            return Ok(Arc::clone(session));
        }
        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(self.config.known_hosts.clone());
        if let Some(path) = &self.config.ssh_config {
            builder.config_file(path);
        }
        if let Some(timeout) = self.config.connect_timeout {
            builder.connect_timeout(timeout);
        }
        let session = match builder.connect_mux(host).await {
            Ok(session) => Arc::new(session),
            Err(error) => {
                tracing::debug!(host, %error, "failed to connect");
                return Err(error.into());
            }
        };
        tracing::debug!(host, "connected");
        // Another task may have connected in the meantime; keep the first one.
        let mut sessions = self.sessions.lock().await;
        Ok(Arc::clone(
            sessions.entry(host.to_string()).or_insert(session),
        ))
    }

    async fn forget(&self, host: &str) {
        self.sessions.lock().await.remove(host);
    }

    /// Terminates every cached session that is no longer in use.
    pub async fn close(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (host, session) in sessions {
            if let Ok(session) = Arc::try_unwrap(session) {
                if let Err(error) = session.close().await {
                    tracing::warn!(host = %host, %error, "error while terminating session");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn run(&self, host: &str, command: &str) -> Result<RemoteOutput> {
        if self.is_local(host) {
            return LocalTransport.run(host, command).await;
        }
        let session = self.session(host).await?;
        let result = session
            .command("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        match result {
            Ok(output) => Ok(RemoteOutput::from_output(&output)),
            Err(error) => {
                self.forget(host).await;
                Err(error.into())
            }
        }
    }

    async fn spawn(&self, host: &str, command: &str) -> Result<Box<dyn ProcessHandle>> {
        if self.is_local(host) {
            return LocalTransport.spawn(host, command).await;
        }
        let session = self.session(host).await?;
        let buffer = OutputBuffer::default();
        let (pid_tx, pid_rx) = flume::bounded(1);
        let killer_session = Arc::clone(&session);
        let host = host.to_string();
        let killer: Killer = Box::new(move || kill_remote(killer_session, host, pid_rx).boxed());
        let process = wait_remote(session, command.to_string(), buffer.clone(), pid_tx);
        Ok(Box::new(
            TaskHandle::streaming(buffer, process).with_killer(killer),
        ))
    }
}

/// Launches `command` and waits at most `limit` for it.
///
/// Returns `None` as the status when the process was killed because it ran
/// past the deadline, along with what it printed until then.
pub async fn launch_wait(
    transport: &dyn Transport,
    host: &str,
    command: &str,
    limit: Duration,
    poll_interval: Duration,
) -> Result<(Option<ExitStatus>, CapturedOutput)> {
    let mut handle = transport.spawn(host, command).await?;
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = handle.poll()? {
            let output = handle.collect_output().await?;
            return Ok((Some(status), output));
        }
        if Instant::now() >= deadline {
            let output = handle.kill().await;
            tracing::warn!(host, command, ?limit, "killed after running past its time limit");
            return Ok((None, output));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
