//! Thin ownership wrapper around a spawned child: who holds the `Child`,
//! how its pid is tracked for signal delivery, and the SIGSTOP/SIGCONT/
//! SIGTERM/SIGKILL vocabulary every adapter's pause/resume/stop needs.
//! Adapted from the daemon's `Arc<Mutex<Option<Child>>>` + `AtomicU32` pid
//! pattern used by its Claude and Codex runners.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Stop,
    Continue,
    Terminate,
    Kill,
}

#[cfg(unix)]
impl Signal {
    fn as_libc(self) -> libc::c_int {
        match self {
            Signal::Stop => libc::SIGSTOP,
            Signal::Continue => libc::SIGCONT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// A supervised child process. `stdin`/`stdout` are handed to the caller at
/// spawn time (adapters read/write them directly); this struct owns the
/// `Child` handle itself plus the bookkeeping needed to signal and reap it.
pub struct ManagedProcess {
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
    /// Set by `stop()` before any signal is sent, so a concurrently-running
    /// output-reader task can tell a child exit was requested rather than a
    /// crash, and avoid racing its own EOF handling against the kill.
    stopping: Arc<AtomicBool>,
}

impl ManagedProcess {
    /// Spawn `command` with piped stdin/stdout and inherited-to-null
    /// stderr capture, returning the process handle plus the two piped
    /// halves the caller needs.
    pub fn spawn(mut command: Command) -> std::io::Result<(Self, ChildStdin, ChildStdout)> {
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let mut child = command.spawn()?;
        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        Ok((
            Self {
                child: Mutex::new(Some(child)),
                pid: AtomicU32::new(pid),
                stopping: Arc::new(AtomicBool::new(false)),
            },
            stdin,
            stdout,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Take the piped stderr out of the child, if the caller wants to drain
    /// it (e.g. for rate-limit detection). Must be called before any other
    /// accessor if needed, and only once.
    pub async fn take_stderr(&self) -> Option<tokio::process::ChildStderr> {
        self.child.lock().await.as_mut().and_then(|c| c.stderr.take())
    }

    #[cfg(unix)]
    pub fn signal(&self, sig: Signal) -> std::io::Result<()> {
        let pid = self.pid() as libc::pid_t;
        if pid == 0 {
            return Ok(());
        }
        let rc = unsafe { libc::kill(pid, sig.as_libc()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn signal(&self, _sig: Signal) -> std::io::Result<()> {
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        #[cfg(unix)]
        {
            let pid = self.pid() as libc::pid_t;
            pid != 0 && unsafe { libc::kill(pid, 0) } == 0
        }
        #[cfg(not(unix))]
        {
            true
        }
    }

    /// Mark the process as being intentionally stopped, signal it, then
    /// wait for exit. Setting the flag before signalling mirrors the
    /// daemon's cancellation order: the reader task must see "we asked for
    /// this" before it observes end-of-stream.
    pub async fn stop(&self) -> std::io::Result<Option<i32>> {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.signal(Signal::Continue); // in case it was paused
        let _ = self.signal(Signal::Terminate);
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => Ok(status.code()),
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    let _ = self.signal(Signal::Kill);
                    let status = child.wait().await?;
                    Ok(status.code())
                }
            }
        } else {
            Ok(None)
        }
    }

    pub async fn wait(&self) -> std::io::Result<Option<std::process::ExitStatus>> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => child.wait().await.map(Some),
            None => Ok(None),
        }
    }
}
