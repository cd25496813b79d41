use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::app::LaunchCommand;

/// Lines of child output retained for diagnostics.
const OUTPUT_TAIL_LINES: usize = 50;

/// An owned service child process.
///
/// The child is spawned with `kill_on_drop`, so dropping the handle (on
/// `stop`, on manager teardown, or when a failed deployment unwinds) always
/// terminates the process. Stdout and stderr are forwarded line by line over
/// a flume channel into a bounded tail.
pub struct ServiceProcess {
    child: Child,
    pid: Option<u32>,
    output: flume::Receiver<String>,
    tail: Mutex<VecDeque<String>>,
}

impl ServiceProcess {
    pub fn spawn(launch: &LaunchCommand, dir: &Path, pythonpath: &Path) -> std::io::Result<Self> {
        let mut cmd = launch.to_command(dir);
        cmd.env("PYTHONPATH", pythonpath)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let (tx, rx) = flume::bounded(256);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        info!(program = %launch.program, ?pid, dir = %dir.display(), "service process spawned");
        Ok(Self {
            child,
            pid,
            output: rx,
            tail: Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// `false` once the child has exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Most recent output lines, oldest first.
    pub fn output_tail(&self) -> Vec<String> {
        let mut tail = self.tail.lock().unwrap_or_else(|e| {
            warn!("output tail lock was poisoned, recovering");
            e.into_inner()
        });
        while let Ok(line) = self.output.try_recv() {
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.iter().cloned().collect()
    }

    /// Ask the process to exit, then kill it if it outlives `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status() {
            return Some(status);
        }
        self.send_terminate();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = ?self.pid, %status, "service exited after terminate");
                Some(status)
            }
            Ok(Err(e)) => {
                warn!(pid = ?self.pid, error = %e, "failed waiting for service exit");
                None
            }
            Err(_) => {
                warn!(pid = ?self.pid, grace_secs = grace.as_secs(), "service ignored terminate, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(pid = ?self.pid, error = %e, "failed to kill service");
                }
                self.child.try_wait().ok().flatten()
            }
        }
    }

    #[cfg(unix)]
    fn send_terminate(&mut self) {
        match self.pid {
            // SAFETY: SIGTERM to a pid we spawned and have not yet reaped.
            Some(pid) => unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            },
            None => {
                let _ = self.child.start_kill();
            }
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl std::fmt::Debug for ServiceProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProcess").field("pid", &self.pid).finish()
    }
}

async fn forward_lines<R>(stream: R, tx: flume::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        // A full channel drops lines rather than stalling the child's pipe.
        if let Err(flume::TrySendError::Disconnected(_)) = tx.try_send(line) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_a_sleeping_child() {
        let dir = tempfile::tempdir().unwrap();
        let launch = LaunchCommand {
            program: "sleep".into(),
            args: vec!["30".into()],
        };
        let mut proc = ServiceProcess::spawn(&launch, dir.path(), dir.path()).unwrap();
        assert!(proc.is_alive());
        assert!(proc.pid().is_some());

        proc.terminate(Duration::from_secs(2)).await;
        assert!(!proc.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let launch = LaunchCommand {
            program: "sh".into(),
            args: vec!["-c".into(), "echo ready; echo oops >&2".into()],
        };
        let mut proc = ServiceProcess::spawn(&launch, dir.path(), dir.path()).unwrap();
        proc.terminate(Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tail = proc.output_tail();
        assert!(tail.contains(&"ready".to_string()));
        assert!(tail.contains(&"oops".to_string()));
    }
}
