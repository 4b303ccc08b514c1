//! Supervised child processes
//!
//! Spawns a task's process, reads both pipes incrementally, enforces the
//! deadline and the capture cap, and reports how the process ended.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agent_core::client::{OutputChunk, OutputStream};

use crate::error::{ExecutorError, Result};
use crate::streaming::ChunkSender;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How long to wait for the pipe readers after the process was killed
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(2);

/// How long to wait for the pipe readers once the process exited on its own
const DRAIN_AFTER_EXIT: Duration = Duration::from_secs(5);

/// What happens to a process that outlives its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// SIGTERM, then SIGKILL if still alive after `grace`
    Terminate { grace: Duration },
    /// SIGKILL straight away
    Kill,
}

/// Description of a process to run
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub on_timeout: TimeoutAction,
    /// Per-stream cap on captured bytes
    pub output_limit: Option<usize>,
}

impl ProcessSpec {
    pub fn new(program: impl AsRef<OsStr>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            timeout: None,
            on_timeout: TimeoutAction::Kill,
            output_limit: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn envs(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>, on_timeout: TimeoutAction) -> Self {
        self.timeout = timeout;
        self.on_timeout = on_timeout;
        self
    }

    pub fn output_limit(mut self, limit: usize) -> Self {
        self.output_limit = Some(limit);
        self
    }

    fn display_program(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    overflowed: bool,
}

enum Event {
    Exited(std::io::Result<std::process::ExitStatus>),
    Overflow(OutputStream),
    TimedOut,
}

/// Run a process to completion
///
/// Every chunk read from either pipe is forwarded to `chunks` when given.
pub async fn run(spec: ProcessSpec, chunks: Option<ChunkSender>) -> Result<ProcessOutcome> {
    let mut child = spawn(&spec)?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecutorError::spawn_failed("Failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecutorError::spawn_failed("Failed to capture stderr"))?;

    let (overflow_tx, mut overflow_rx) = mpsc::unbounded_channel();
    let mut stdout_handle = tokio::spawn(pump(
        stdout,
        OutputStream::Stdout,
        chunks.clone(),
        spec.output_limit,
        overflow_tx.clone(),
    ));
    let mut stderr_handle = tokio::spawn(pump(
        stderr,
        OutputStream::Stderr,
        chunks,
        spec.output_limit,
        overflow_tx,
    ));

    let deadline = async {
        match spec.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };

    let event = tokio::select! {
        status = child.wait() => Event::Exited(status),
        Some(stream) = overflow_rx.recv() => Event::Overflow(stream),
        _ = deadline => Event::TimedOut,
    };

    match event {
        Event::Exited(status) => {
            let status = status?;
            debug!("{} exited with {:?}", spec.display_program(), status.code());
            // Background children left behind would hold the pipes open
            signal_group(pid, GroupSignal::Kill);
            let out = collect(&mut stdout_handle, Some(DRAIN_AFTER_EXIT)).await;
            let err = collect(&mut stderr_handle, Some(DRAIN_AFTER_EXIT)).await;
            check_overflow(&spec, &out, &err)?;
            Ok(ProcessOutcome {
                code: status.code(),
                stdout: String::from_utf8_lossy(&out.bytes).into_owned(),
                stderr: String::from_utf8_lossy(&err.bytes).into_owned(),
            })
        }
        Event::Overflow(stream) => {
            warn!(
                "{} exceeded the {} output limit, killing",
                spec.display_program(),
                stream.as_str()
            );
            kill_tree(&mut child, pid).await;
            collect(&mut stdout_handle, Some(DRAIN_AFTER_KILL)).await;
            collect(&mut stderr_handle, Some(DRAIN_AFTER_KILL)).await;
            Err(ExecutorError::OutputOverflow {
                stream,
                limit: spec.output_limit.unwrap_or_default(),
            })
        }
        Event::TimedOut => {
            let timeout = spec.timeout.unwrap_or_default();
            warn!("{} timed out after {:?}", spec.display_program(), timeout);
            terminate(&mut child, pid, spec.on_timeout).await;
            collect(&mut stdout_handle, Some(DRAIN_AFTER_KILL)).await;
            collect(&mut stderr_handle, Some(DRAIN_AFTER_KILL)).await;
            Err(ExecutorError::Timeout {
                seconds: timeout.as_secs(),
            })
        }
    }
}

fn spawn(spec: &ProcessSpec) -> Result<Child> {
    info!(
        "Spawning {} {:?} in {:?}",
        spec.display_program(),
        spec.args,
        spec.working_dir
    );

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group so a timeout reaches grandchildren too
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn().map_err(|e| {
        ExecutorError::spawn_failed_with_source(
            format!("{}: {}", spec.display_program(), e),
            e,
        )
    })
}

async fn pump<R>(
    mut reader: R,
    stream: OutputStream,
    chunks: Option<ChunkSender>,
    limit: Option<usize>,
    overflow: mpsc::UnboundedSender<OutputStream>,
) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    // Bytes of a multibyte character cut off by the previous read
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("{} read failed: {}", stream.as_str(), e);
                break;
            }
        };
        let data = &buf[..n];

        if let Some(tx) = &chunks {
            pending.extend_from_slice(data);
            let tail = pending.split_off(complete_prefix_len(&pending));
            if !pending.is_empty() {
                // Receiver gone means nobody is streaming any more; keep capturing
                let _ = tx.send(OutputChunk::new(stream, String::from_utf8_lossy(&pending)));
            }
            pending = tail;
        }

        if captured.overflowed {
            continue;
        }
        if limit.is_some_and(|limit| captured.bytes.len() + n > limit) {
            captured.overflowed = true;
            let _ = overflow.send(stream);
            continue;
        }
        captured.bytes.extend_from_slice(data);
    }

    if let (Some(tx), false) = (&chunks, pending.is_empty()) {
        let _ = tx.send(OutputChunk::new(stream, String::from_utf8_lossy(&pending)));
    }
    captured
}

/// Length of the prefix of `bytes` that does not end inside a UTF-8
/// multibyte sequence
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

async fn collect(handle: &mut JoinHandle<Captured>, bound: Option<Duration>) -> Captured {
    let joined = match bound {
        None => handle.await,
        Some(bound) => match tokio::time::timeout(bound, &mut *handle).await {
            Ok(joined) => joined,
            Err(_) => {
                debug!("Output reader still busy after {:?}, abandoning it", bound);
                handle.abort();
                return Captured::default();
            }
        },
    };
    joined.unwrap_or_default()
}

fn check_overflow(spec: &ProcessSpec, out: &Captured, err: &Captured) -> Result<()> {
    let stream = if out.overflowed {
        OutputStream::Stdout
    } else if err.overflowed {
        OutputStream::Stderr
    } else {
        return Ok(());
    };
    Err(ExecutorError::OutputOverflow {
        stream,
        limit: spec.output_limit.unwrap_or_default(),
    })
}

async fn terminate(child: &mut Child, pid: Option<u32>, action: TimeoutAction) {
    if let TimeoutAction::Terminate { grace } = action {
        if signal_group(pid, GroupSignal::Terminate) {
            if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                debug!("Process stopped after SIGTERM with {:?}", status.code());
                // Stragglers in the group do not get a second chance
                signal_group(pid, GroupSignal::Kill);
                return;
            }
            warn!("Process still alive {:?} after SIGTERM, killing", grace);
        }
    }
    kill_tree(child, pid).await;
}

async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    signal_group(pid, GroupSignal::Kill);
    if let Err(e) = child.kill().await {
        debug!("Kill after group SIGKILL: {}", e);
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return false;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(e) => {
            debug!("killpg({}, {:?}) failed: {}", pid, signal, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) -> bool {
    false
}
