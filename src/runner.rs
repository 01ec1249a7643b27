//! Process execution for test runs.
//!
//! `ProcessManager` spawns one child per [`Launch`] and bridges its pipes to
//! the event channel. Each run gets a waiter task that owns the child: it
//! forwards decoded output chunks, waits for both pipes to close and only
//! then reports the exit, so `RunExited` always follows the run's last
//! `RunOutput`.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::adapter::RunArtifacts;
use crate::events::Event;
use crate::scheduler::Launch;

const READ_BUFFER: usize = 4096;

/// A run that could not be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnFailure {
    pub id: usize,
    pub error: String,
}

/// Tracks live runs by package id.
pub struct ProcessManager {
    event_tx: mpsc::Sender<Event>,
    pids: HashMap<usize, u32>,
}

impl ProcessManager {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            event_tx,
            pids: HashMap::new(),
        }
    }

    /// Starts `launches`, handing each spawn failure to `on_failed` and
    /// starting whatever it returns until nothing is left.
    ///
    /// Failures never go through the event channel: the caller is that
    /// channel's only receiver.
    pub fn launch<F>(&mut self, mut launches: Vec<Launch>, mut on_failed: F)
    where
        F: FnMut(usize, String) -> Vec<Launch>,
    {
        while !launches.is_empty() {
            launches = self
                .spawn_all(launches)
                .into_iter()
                .flat_map(|failure| on_failed(failure.id, failure.error))
                .collect();
        }
    }

    /// Spawns every launch in order and returns the ones that failed to start.
    pub fn spawn_all(&mut self, launches: Vec<Launch>) -> Vec<SpawnFailure> {
        launches
            .into_iter()
            .filter_map(|launch| self.spawn(launch).err())
            .collect()
    }

    pub fn spawn(&mut self, launch: Launch) -> Result<(), SpawnFailure> {
        let id = launch.id;
        match self.start(&launch) {
            Ok(pid) => {
                if let Some(pid) = pid {
                    self.pids.insert(id, pid);
                }
                Ok(())
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(id, %error, "spawn failed");
                Err(SpawnFailure { id, error })
            }
        }
    }

    /// Forgets a finished run.
    pub fn forget(&mut self, id: usize) {
        self.pids.remove(&id);
    }

    pub fn running(&self) -> usize {
        self.pids.len()
    }

    /// Sends SIGTERM to every live run's process group without waiting.
    pub fn terminate_all(&mut self) {
        for (id, pid) in self.pids.drain() {
            debug!(id, pid, "terminating run");
            send_sigterm(pid);
        }
    }

    fn start(&self, launch: &Launch) -> Result<Option<u32>> {
        prepare_artifacts(&launch.artifacts, launch.coverage)?;

        let spec = &launch.command;
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", spec.display()))?;
        let pid = child.id();
        debug!(id = launch.id, ?pid, cwd = %spec.cwd.display(), "spawned run");

        let id = launch.id;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let out = stdout.map(|pipe| tokio::spawn(read_stream(id, pipe, tx.clone())));
            let err = stderr.map(|pipe| tokio::spawn(read_stream(id, pipe, tx.clone())));
            for reader in [out, err].into_iter().flatten() {
                let _ = reader.await;
            }
            match child.wait().await {
                Ok(status) => {
                    let _ = tx
                        .send(Event::RunExited {
                            id,
                            code: status.code(),
                        })
                        .await;
                }
                Err(err) => {
                    let _ = tx
                        .send(Event::RunFailed {
                            id,
                            error: err.to_string(),
                        })
                        .await;
                }
            }
        });
        Ok(pid)
    }
}

/// Removes stale report files so a crashed run never shows old results.
fn prepare_artifacts(artifacts: &RunArtifacts, coverage: bool) -> Result<()> {
    remove_if_exists(&artifacts.junit)?;
    if coverage && artifacts.coverage_dir.exists() {
        std::fs::remove_dir_all(&artifacts.coverage_dir)
            .with_context(|| format!("failed to clear {}", artifacts.coverage_dir.display()))?;
    }
    std::fs::create_dir_all(&artifacts.dir)
        .with_context(|| format!("failed to create {}", artifacts.dir.display()))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

async fn read_stream<R>(id: usize, mut reader: R, tx: mpsc::Sender<Event>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUFFER];
    let mut decoder = Utf8Decoder::default();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(id, %err, "read error on run output");
                break;
            }
        };
        let chunk = decoder.push(&buf[..n]);
        if !chunk.is_empty() && tx.send(Event::RunOutput { id, chunk }).await.is_err() {
            return;
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = tx.send(Event::RunOutput { id, chunk: rest }).await;
    }
}

/// Decodes a byte stream whose reads may split multi-byte characters.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let cut = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Incomplete trailing sequence: hold it for the next read.
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let decoded = String::from_utf8_lossy(&self.pending[..cut]).into_owned();
        self.pending.drain(..cut);
        decoded
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        let pid = pid as i32;
        let _ = libc::kill(-pid, libc::SIGTERM);
        let _ = libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_holds_split_characters() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "a·b".as_bytes();
        assert_eq!(decoder.push(&bytes[..2]), "a");
        assert_eq!(decoder.push(&bytes[2..]), "·b");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.push(&[b'x', 0xff, b'y']), "x\u{fffd}y");
        assert_eq!(decoder.push(&[0xe2]), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[test]
    fn prepare_clears_stale_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = RunArtifacts::new(dir.path(), "pkg");
        std::fs::create_dir_all(&artifacts.coverage_dir).unwrap();
        std::fs::write(&artifacts.junit, "<testsuites/>").unwrap();
        std::fs::write(artifacts.lcov(), "SF:a.ts\n").unwrap();

        prepare_artifacts(&artifacts, true).unwrap();
        assert!(!artifacts.junit.exists());
        assert!(!artifacts.coverage_dir.exists());
        assert!(artifacts.dir.is_dir());
    }

    #[tokio::test]
    async fn output_precedes_exit() {
        let (tx, mut rx) = mpsc::channel(16);
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ProcessManager::new(tx);
        let launch = Launch {
            id: 3,
            command: crate::adapter::CommandSpec {
                program: "sh".into(),
                args: vec!["-c".into(), "printf '..x'; exit 2".into()],
                cwd: dir.path().to_path_buf(),
            },
            artifacts: RunArtifacts::new(dir.path(), "pkg"),
            coverage: false,
        };
        manager.spawn(launch).unwrap();

        let mut output = String::new();
        loop {
            match rx.recv().await.unwrap() {
                Event::RunOutput { id, chunk } => {
                    assert_eq!(id, 3);
                    output.push_str(&chunk);
                }
                Event::RunExited { id, code } => {
                    assert_eq!((id, code), (3, Some(2)));
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(output, "..x");
    }

    fn missing_launch(dir: &Path, id: usize) -> Launch {
        Launch {
            id,
            command: crate::adapter::CommandSpec {
                program: "testrack-definitely-missing-binary".into(),
                args: Vec::new(),
                cwd: dir.to_path_buf(),
            },
            artifacts: RunArtifacts::new(dir, "pkg"),
            coverage: false,
        }
    }

    #[tokio::test]
    async fn missing_program_reports_failure_to_caller() {
        let (tx, _rx) = mpsc::channel(4);
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ProcessManager::new(tx);
        let failure = manager.spawn(missing_launch(dir.path(), 0)).unwrap_err();
        assert_eq!(failure.id, 0);
        assert!(failure.error.contains("testrack-definitely-missing-binary"));
        assert_eq!(manager.running(), 0);
    }

    #[tokio::test]
    async fn spawn_failures_do_not_need_channel_capacity() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(Event::Resize).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ProcessManager::new(tx);

        let mut failed = Vec::new();
        let retry = missing_launch(dir.path(), 1);
        let mut pending = Some(retry);
        manager.launch(vec![missing_launch(dir.path(), 0)], |id, _| {
            failed.push(id);
            pending.take().into_iter().collect()
        });

        assert_eq!(failed, vec![0, 1]);
        assert!(matches!(rx.try_recv(), Ok(Event::Resize)));
        assert!(rx.try_recv().is_err());
    }
}
