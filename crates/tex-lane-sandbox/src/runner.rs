//! Child process supervision: output capture, wall-clock limit, cancellation.

use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::run::Completion;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// What happened to a child that was successfully spawned.
#[derive(Debug)]
pub(crate) struct Finished {
    pub exit_code: Option<i32>,
    pub term_signal: Option<String>,
    pub completion: Completion,
    pub stdout: String,
    pub stderr: String,
}

/// Limits for one supervised child.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Supervision<'a> {
    pub timeout: Duration,
    pub grace: Duration,
    pub cancel: &'a AtomicBool,
    pub max_output_bytes: usize,
}

struct Captured {
    bytes: Vec<u8>,
    dropped: u64,
}

impl Captured {
    fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n[truncated {} bytes]", self.dropped));
        }
        text
    }
}

/// Reads a pipe to EOF, keeping at most `limit` bytes.
fn drain<R: Read + Send + 'static>(pipe: Option<R>, limit: usize) -> JoinHandle<Captured> {
    thread::spawn(move || {
        let mut captured = Captured {
            bytes: Vec::new(),
            dropped: 0,
        };
        let Some(mut pipe) = pipe else {
            return captured;
        };
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let room = limit.saturating_sub(captured.bytes.len());
                    let keep = n.min(room);
                    captured.bytes.extend_from_slice(&buf[..keep]);
                    captured.dropped += (n - keep) as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        captured
    })
}

/// Spawns `command` and supervises it until it exits, times out, or is cancelled.
///
/// Only spawn failures are returned as errors; everything after a successful
/// spawn is reported through [`Finished`].
pub(crate) fn supervise(
    command: &mut Command,
    stdin: Option<&[u8]>,
    limits: Supervision<'_>,
) -> io::Result<Finished> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so termination reaches grandchildren holding our pipes.
        command.process_group(0);
    }

    let mut child = command.spawn()?;

    let stdout = drain(child.stdout.take(), limits.max_output_bytes);
    let stderr = drain(child.stderr.take(), limits.max_output_bytes);

    let writer = match (child.stdin.take(), stdin) {
        (Some(mut pipe), Some(bytes)) => {
            let bytes = bytes.to_vec();
            Some(thread::spawn(move || {
                // A child may exit without reading all of its input.
                let _ = pipe.write_all(&bytes);
            }))
        }
        _ => None,
    };

    let deadline = Instant::now() + limits.timeout;
    let (status, completion) = loop {
        if limits.cancel.load(Ordering::SeqCst) {
            let status = terminate(&mut child, limits.grace)?;
            break (status, Completion::Cancelled);
        }
        if Instant::now() >= deadline {
            let status = terminate(&mut child, limits.grace)?;
            break (status, Completion::TimedOut);
        }
        match child.try_wait()? {
            Some(status) => {
                #[cfg(unix)]
                signal_group(&child, nix::sys::signal::Signal::SIGKILL);
                break (status, Completion::Exited);
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    if let Some(handle) = writer {
        let _ = handle.join();
    }
    let stdout = stdout.join().map(Captured::into_text).unwrap_or_default();
    let stderr = stderr.join().map(Captured::into_text).unwrap_or_default();

    Ok(Finished {
        exit_code: status.code(),
        term_signal: signal_name(&status),
        completion,
        stdout,
        stderr,
    })
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;
    let _ = nix::sys::signal::killpg(Pid::from_raw(child.id() as i32), signal);
}

/// Sends SIGTERM to the child's process group, waits up to `grace`, then kills.
fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    signal_group(child, nix::sys::signal::Signal::SIGTERM);
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }

    let start = Instant::now();
    let mut exited = None;
    while start.elapsed() < grace {
        if let Some(status) = child.try_wait()? {
            exited = Some(status);
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    // Stragglers in the group would keep the output pipes open.
    #[cfg(unix)]
    signal_group(child, nix::sys::signal::Signal::SIGKILL);

    match exited {
        Some(status) => Ok(status),
        None => {
            let _ = child.kill();
            child.wait()
        }
    }
}

fn signal_name(status: &ExitStatus) -> Option<String> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|s| {
            nix::sys::signal::Signal::try_from(s)
                .map(|sig| sig.as_str().to_string())
                .unwrap_or_else(|_| format!("SIG{}", s))
        })
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}
