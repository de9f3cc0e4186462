//! Subprocess execution with fixed timeouts.
//!
//! Every transport command goes through [`run_tracked`]: stdout and stderr
//! are read on helper threads and forwarded line by line, while the calling
//! thread polls the child for exit and enforces the timeout. The child lives
//! in a [`ChildSlot`] so another thread can kill it.

use std::ffi::OsStr;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{FlashError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command: String,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout followed by stderr. Bootloader tools print most things on stderr.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !text.is_empty() && !self.stderr.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&self.stderr);
        text
    }

    /// Turn a non-zero exit into [`FlashError::CommandFailed`].
    pub fn ensure_success(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(FlashError::CommandFailed {
                command: self.command.clone(),
                code: self.code,
                output: self.combined().trim().to_string(),
            })
        }
    }
}

/// Holder for the single live child of a subsystem.
#[derive(Debug, Default)]
pub struct ChildSlot {
    child: Mutex<Option<Child>>,
    stopped: AtomicBool,
}

impl ChildSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Kill the live child, if any. Best effort.
    pub fn stop(&self) -> bool {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(child) => {
                self.stopped.store(true, Ordering::SeqCst);
                if let Err(e) = child.kill() {
                    debug!(error = %e, "Kill failed, process probably already exited");
                }
                true
            }
            None => false,
        }
    }
}

/// Run a command to completion and capture its output.
pub fn run<S: AsRef<OsStr>>(
    program: &Path,
    args: &[S],
    timeout: Duration,
) -> Result<CommandOutput> {
    run_tracked(program, args, timeout, &ChildSlot::new(), |_, _| {})
}

/// Run a command inside `slot`, forwarding each output line to `on_line`.
///
/// Returns [`FlashError::Timeout`] when `timeout` elapses (the child is
/// killed) and [`FlashError::Cancelled`] when [`ChildSlot::stop`] was called.
/// A missing executable maps to [`FlashError::ToolNotFound`].
pub fn run_tracked<S, F>(
    program: &Path,
    args: &[S],
    timeout: Duration,
    slot: &ChildSlot,
    mut on_line: F,
) -> Result<CommandOutput>
where
    S: AsRef<OsStr>,
    F: FnMut(Stream, &str),
{
    let command = describe(program, args);
    debug!(command = %command, timeout_secs = timeout.as_secs(), "Spawning");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FlashError::ToolNotFound {
                tool: program.display().to_string(),
                tried: vec![program.to_path_buf()],
            },
            _ => FlashError::Io(e),
        })?;

    let (tx, rx) = mpsc::channel::<(Stream, String)>();
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Stream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Stream::Stderr, tx.clone()));
    }
    drop(tx);

    slot.stopped.store(false, Ordering::SeqCst);
    *slot.lock() = Some(child);

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut take_line = |stream: Stream, line: String| {
        on_line(stream, &line);
        let buf = match stream {
            Stream::Stdout => &mut stdout,
            Stream::Stderr => &mut stderr,
        };
        buf.push_str(&line);
        buf.push('\n');
    };

    let start = Instant::now();
    let code = loop {
        while let Ok((stream, line)) = rx.try_recv() {
            take_line(stream, line);
        }

        let polled = {
            let mut guard = slot.lock();
            let status = guard.as_mut().map(|c| c.try_wait());
            match status {
                Some(Ok(Some(status))) => {
                    guard.take();
                    Some(Ok(status.code()))
                }
                Some(Ok(None)) => None,
                Some(Err(e)) => {
                    if let Some(mut c) = guard.take() {
                        let _ = c.kill();
                        let _ = c.wait();
                    }
                    Some(Err(e))
                }
                None => Some(Ok(None)),
            }
        };
        match polled {
            Some(Ok(code)) => break code,
            Some(Err(e)) => {
                join_readers(readers);
                return Err(FlashError::Io(e));
            }
            None => {}
        }

        if start.elapsed() > timeout {
            if let Some(mut c) = slot.lock().take() {
                let _ = c.kill();
                let _ = c.wait();
            }
            // Readers finish on their own once the pipes close.
            drop(readers);
            warn!(command = %command, "Command timed out");
            return Err(FlashError::Timeout {
                command,
                secs: timeout.as_secs(),
            });
        }

        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((stream, line)) => take_line(stream, line),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(POLL_INTERVAL),
        }
    };

    if slot.stopped.swap(false, Ordering::SeqCst) {
        return Err(FlashError::Cancelled);
    }

    join_readers(readers);
    for (stream, line) in rx.try_iter() {
        take_line(stream, line);
    }

    debug!(command = %command, code = ?code, "Command finished");
    Ok(CommandOutput {
        command,
        code,
        stdout,
        stderr,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    pipe: R,
    stream: Stream,
    tx: mpsc::Sender<(Stream, String)>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send((stream, line)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn join_readers(readers: Vec<JoinHandle<()>>) {
    for handle in readers {
        let _ = handle.join();
    }
}

fn describe<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> String {
    let name = program
        .file_name()
        .unwrap_or(program.as_os_str())
        .to_string_lossy()
        .into_owned();
    let mut parts = vec![name];
    parts.extend(args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
    parts.join(" ")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    #[test]
    fn test_captures_both_streams() {
        let out = run(&sh(), &["-c", "echo out; echo err >&2; exit 3"], Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert!(!out.success());
        assert!(matches!(
            out.ensure_success(),
            Err(FlashError::CommandFailed { code: Some(3), .. })
        ));
    }

    #[test]
    fn test_missing_program_is_tool_not_found() {
        let err = run(
            Path::new("/nonexistent/flashkit-test-tool"),
            &["devices"],
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, FlashError::ToolNotFound { .. }));
    }

    #[test]
    fn test_timeout_kills_child() {
        let start = Instant::now();
        let err = run(&sh(), &["-c", "sleep 10"], Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, FlashError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_lines_are_streamed() {
        let mut seen = Vec::new();
        run_tracked(
            &sh(),
            &["-c", "printf 'a\\nb\\r\\n'"],
            Duration::from_secs(5),
            &ChildSlot::new(),
            |stream, line| seen.push((stream, line.to_string())),
        )
        .unwrap();
        assert_eq!(
            seen,
            vec![
                (Stream::Stdout, "a".to_string()),
                (Stream::Stdout, "b".to_string())
            ]
        );
    }

    #[test]
    fn test_stop_cancels_running_child() {
        let slot = Arc::new(ChildSlot::new());
        let worker = {
            let slot = slot.clone();
            thread::spawn(move || {
                run_tracked(
                    &sh(),
                    &["-c", "sleep 10"],
                    Duration::from_secs(30),
                    &slot,
                    |_, _| {},
                )
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while !slot.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(slot.stop());

        let result = worker.join().unwrap();
        assert!(matches!(result, Err(FlashError::Cancelled)));
        assert!(!slot.is_running());
        assert!(!slot.stop());
    }
}
