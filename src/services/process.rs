use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Prefix applied to every chunk read from standard error
pub const STDERR_PREFIX: &str = "[ERROR] ";

/// How long output may stay open after the process itself has exited
pub const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(3);

/// A fully described process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: Utf8PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<Utf8PathBuf>,
    /// Added on top of the inherited environment
    pub env: IndexMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: IndexMap::new(),
        }
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

    pub fn current_dir(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &IndexMap<String, String>) -> Self {
        self.env.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Human readable command line, used for logging only
    pub fn display_line(&self) -> String {
        let mut line = quote_if_needed(self.program.as_str());
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote_if_needed(arg));
        }
        line
    }
}

fn quote_if_needed(s: &str) -> String {
    if s.contains(' ') {
        format!("\"{}\"", s)
    } else {
        s.to_string()
    }
}

/// How a process invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process ran and exited; `-1` when killed by a signal
    Exited { code: i32 },

    /// The process could not be started at all
    LaunchFailed { message: String },

    /// The cancel token fired; the process was sent a kill request
    Cancelled,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ProcessOutcome::Exited { code: 0 })
    }
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessOutcome::Exited { code } => write!(f, "exit code {}", code),
            ProcessOutcome::LaunchFailed { message } => write!(f, "launch failed: {}", message),
            ProcessOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Receives incremental log text
#[derive(Clone)]
pub struct LogSink(Arc<dyn Fn(&str) + Send + Sync>);

impl LogSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// A sink that drops everything
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn emit(&self, text: &str) {
        (self.0)(text)
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogSink")
    }
}

/// Create a linked cancel handle and token
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Owning side of a cancellation signal
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observing side of a cancellation signal, cheap to clone
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that never fires
    pub fn never() -> Self {
        let (handle, token) = cancel_pair();
        // With the sender gone, `cancelled()` pends forever
        drop(handle);
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested; pend forever if it never is
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub type RunFuture = Pin<Box<dyn Future<Output = ProcessOutcome> + Send>>;

/// Spawns exactly one external process per call.
///
/// Implementations push every output chunk and a final status line
/// through `sink` before the returned future resolves, and resolve
/// immediately with [`ProcessOutcome::Cancelled`] once `cancel` fires.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessRunner: Send + Sync {
    fn run(&self, command: CommandSpec, sink: LogSink, cancel: CancelToken) -> RunFuture;
}

/// [`ProcessRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessRunner for TokioProcessRunner {
    fn run(&self, command: CommandSpec, sink: LogSink, cancel: CancelToken) -> RunFuture {
        Box::pin(run_process(command, sink, cancel))
    }
}

async fn run_process(
    command: CommandSpec,
    sink: LogSink,
    mut cancel: CancelToken,
) -> ProcessOutcome {
    tracing::info!("Executing: {}", command.display_line());

    if cancel.is_cancelled() {
        sink.emit("Process not started: cancelled\n");
        return ProcessOutcome::Cancelled;
    }

    let mut cmd = Command::new(command.program.as_std_path());
    cmd.args(&command.args)
        .envs(&command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir.as_std_path());
    }

    let start = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let message = format!("Failed to launch {}: {}", command.program, e);
            tracing::error!("{}", message);
            sink.emit(&format!("[FATAL ERROR] {}\n", message));
            return ProcessOutcome::LaunchFailed { message };
        }
    };

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(stdout, sink.clone(), "")));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(stderr, sink.clone(), STDERR_PREFIX)));
    }

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    let status = match waited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                tracing::warn!("Failed to kill {}: {}", command.program, e);
            }
            return cancelled(&command, &sink, &pumps, start);
        }
    };

    // Drain whatever the pipes still hold. Helpers spawned by the child can
    // keep them open long after it exits, so the drain stays cancellable and
    // is cut off after a grace period.
    let drained = tokio::select! {
        _ = drain(&mut pumps) => Drain::Finished,
        _ = tokio::time::sleep(OUTPUT_DRAIN_GRACE) => Drain::TimedOut,
        _ = cancel.cancelled() => Drain::Cancelled,
    };
    match drained {
        Drain::Finished => {}
        Drain::TimedOut => {
            for handle in &pumps {
                handle.abort();
            }
            tracing::warn!(
                "Output of {} still open {:?} after exit; leftover child processes are detached",
                command.program,
                OUTPUT_DRAIN_GRACE
            );
        }
        Drain::Cancelled => return cancelled(&command, &sink, &pumps, start),
    }

    match status {
        Ok(status) => {
            let code = status.code().unwrap_or(-1);
            tracing::info!(
                "Process {} completed in {:.2}s with exit code {}",
                command.program,
                start.elapsed().as_secs_f64(),
                code
            );
            sink.emit(&format!("Process exited with code {}\n", code));
            ProcessOutcome::Exited { code }
        }
        Err(e) => {
            let message = format!("Failed to wait for {}: {}", command.program, e);
            tracing::error!("{}", message);
            sink.emit(&format!("[FATAL ERROR] {}\n", message));
            ProcessOutcome::LaunchFailed { message }
        }
    }
}

fn cancelled(
    command: &CommandSpec,
    sink: &LogSink,
    pumps: &[JoinHandle<()>],
    start: Instant,
) -> ProcessOutcome {
    for handle in pumps {
        handle.abort();
    }
    tracing::warn!(
        "Process {} cancelled after {:.1}s",
        command.program,
        start.elapsed().as_secs_f64()
    );
    sink.emit("Process terminated: cancelled\n");
    ProcessOutcome::Cancelled
}

enum Drain {
    Finished,
    TimedOut,
    Cancelled,
}

async fn drain(pumps: &mut [JoinHandle<()>]) {
    for handle in pumps.iter_mut() {
        if let Err(e) = handle.await {
            tracing::warn!("Output reader task failed: {}", e);
        }
    }
}

/// Forward a pipe to the sink one line at a time.
///
/// Invalid UTF-8 is replaced rather than treated as an error, since build
/// tools happily print whatever the console code page gives them.
async fn pump<R>(reader: R, sink: LogSink, prefix: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                if prefix.is_empty() {
                    sink.emit(&text);
                } else {
                    sink.emit(&format!("{}{}", prefix, text));
                }
            }
            Err(e) => {
                tracing::warn!("Output read error: {}", e);
                break;
            }
        }
    }
}
