//! Subprocess worker runtime.
//!
//! Spawns one worker subprocess per session, splits its stdout on
//! newlines into stream-JSON events, captures stderr, and emits a
//! synthetic terminal close event when the process exits.
//!
//! Each spawn records a per-session generation. Resuming bumps the
//! generation before killing the predecessor, so stdout still in flight
//! from a superseded process is dropped the moment its reader observes
//! the stale generation. An operator-initiated kill does not bump the
//! generation, so the killed process's close event is still delivered.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use super::command::build_worker_command;
use crate::domain::ports::worker::{
    WorkerError, WorkerEvent, WorkerLaunch, WorkerRuntime, WorkerStreamEvent,
};
use crate::infrastructure::config::WorkerConfig;

struct ProcEntry {
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
}

type ProcMap = Arc<Mutex<HashMap<Uuid, ProcEntry>>>;

async fn is_current(procs: &ProcMap, session_id: Uuid, generation: u64) -> bool {
    procs
        .lock()
        .await
        .get(&session_id)
        .is_some_and(|e| e.generation == generation)
}

/// Worker runtime backed by real subprocesses.
pub struct ProcessWorkerRuntime {
    config: WorkerConfig,
    events: mpsc::UnboundedSender<WorkerStreamEvent>,
    procs: ProcMap,
}

impl ProcessWorkerRuntime {
    pub fn new(config: WorkerConfig, events: mpsc::UnboundedSender<WorkerStreamEvent>) -> Self {
        Self {
            config,
            events,
            procs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn launch(&self, launch: WorkerLaunch, resume: bool) -> Result<(), WorkerError> {
        let session_id = launch.session_id;
        let (generation, kill_rx) = {
            let mut procs = self.procs.lock().await;
            let entry = procs.entry(session_id).or_insert(ProcEntry {
                generation: 0,
                kill_tx: None,
            });
            // Bump first: in-flight stdout from the superseded process is
            // stale before the kill signal even lands.
            entry.generation += 1;
            if let Some(tx) = entry.kill_tx.take() {
                let _ = tx.send(());
            }
            let (tx, rx) = oneshot::channel();
            entry.kill_tx = Some(tx);
            (entry.generation, rx)
        };

        let mut cmd = build_worker_command(&self.config.binary, &launch, resume);
        tracing::debug!(
            session_id = %session_id,
            generation,
            resume,
            working_dir = %launch.working_dir.display(),
            "spawning worker subprocess"
        );

        let mut child = cmd.spawn().map_err(|e| {
            tracing::error!(session_id = %session_id, error = %e, "worker spawn failed");
            WorkerError::Spawn(e.to_string())
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        if let Some(stderr) = stderr {
            let events = self.events.clone();
            let procs = self.procs.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = vec![0u8; 4096];
                loop {
                    match reader.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if !is_current(&procs, session_id, generation).await {
                                break;
                            }
                            let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                            let _ = events.send(WorkerStreamEvent {
                                session_id,
                                event: WorkerEvent::stderr(&chunk),
                            });
                        }
                    }
                }
            });
        }

        let events = self.events.clone();
        let procs = self.procs.clone();
        tokio::spawn(async move {
            let mut kill_rx = kill_rx;
            let mut killed = false;
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        _ = &mut kill_rx, if !killed => {
                            killed = true;
                            let _ = child.kill().await;
                        }
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => {
                                let trimmed = line.trim();
                                if trimmed.is_empty() {
                                    continue;
                                }
                                if !is_current(&procs, session_id, generation).await {
                                    break;
                                }
                                let event = WorkerEvent::parse(trimmed)
                                    .unwrap_or_else(|| WorkerEvent::system_raw(trimmed));
                                let _ = events.send(WorkerStreamEvent { session_id, event });
                            }
                            Ok(None) | Err(_) => break,
                        }
                    }
                }
            }

            let exit_code = child.wait().await.ok().and_then(|status| status.code());

            {
                let mut procs = procs.lock().await;
                if let Some(entry) = procs.get_mut(&session_id) {
                    if entry.generation == generation {
                        entry.kill_tx = None;
                    }
                }
            }

            if is_current(&procs, session_id, generation).await {
                tracing::debug!(session_id = %session_id, generation, ?exit_code, "worker closed");
                let _ = events.send(WorkerStreamEvent {
                    session_id,
                    event: WorkerEvent::close(exit_code),
                });
            } else {
                tracing::debug!(
                    session_id = %session_id,
                    generation,
                    "suppressing close from superseded worker"
                );
            }
        });

        Ok(())
    }
}

#[async_trait]
impl WorkerRuntime for ProcessWorkerRuntime {
    async fn spawn(&self, launch: WorkerLaunch) -> Result<(), WorkerError> {
        self.launch(launch, false).await
    }

    async fn resume(&self, launch: WorkerLaunch) -> Result<(), WorkerError> {
        self.launch(launch, true).await
    }

    async fn kill(&self, session_id: Uuid) -> Result<bool, WorkerError> {
        let mut procs = self.procs.lock().await;
        if let Some(entry) = procs.get_mut(&session_id) {
            if let Some(tx) = entry.kill_tx.take() {
                let _ = tx.send(());
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Test double for the worker binary: sleeps for the number of
    /// seconds given as the prompt, then prints one result event.
    fn write_script(dir: &std::path::Path) -> PathBuf {
        let script = dir.join("worker.sh");
        let body = concat!(
            "#!/bin/sh\n",
            "for last; do :; done\n",
            "sleep \"$last\"\n",
            "echo \"{\\\"type\\\":\\\"result\\\",\\\"subtype\\\":\\\"success\\\",",
            "\\\"result\\\":\\\"done-$last\\\"}\"\n",
        );
        std::fs::write(&script, body).expect("write script");
        let mut perms = std::fs::metadata(&script).expect("stat").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).expect("chmod");
        script
    }

    fn launch_with_prompt(dir: &std::path::Path, session_id: Uuid, prompt: &str) -> WorkerLaunch {
        WorkerLaunch {
            session_id,
            prompt: prompt.to_string(),
            working_dir: dir.to_path_buf(),
            system_prompt: None,
            allowed_tools: Vec::new(),
            max_turns: None,
            additional_dirs: Vec::new(),
        }
    }

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<WorkerStreamEvent>,
    ) -> Option<WorkerStreamEvent> {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_spawn_streams_events_then_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runtime = ProcessWorkerRuntime::new(
            WorkerConfig {
                binary: script.display().to_string(),
            },
            tx,
        );

        let session_id = Uuid::new_v4();
        runtime
            .spawn(launch_with_prompt(dir.path(), session_id, "0"))
            .await
            .expect("spawn");

        let first = next_event(&mut rx).await.expect("result event");
        assert_eq!(first.session_id, session_id);
        assert_eq!(first.event.event_type, "result");
        assert_eq!(first.event.data["result"], "done-0");

        let close = next_event(&mut rx).await.expect("close event");
        assert_eq!(close.event.event_type, "result");
        assert_eq!(close.event.subtype(), Some("close"));
    }

    #[tokio::test]
    async fn test_resume_drops_superseded_process_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runtime = ProcessWorkerRuntime::new(
            WorkerConfig {
                binary: script.display().to_string(),
            },
            tx,
        );

        let session_id = Uuid::new_v4();
        // First process would report after 5s; it is superseded well
        // before that.
        runtime
            .spawn(launch_with_prompt(dir.path(), session_id, "5"))
            .await
            .expect("spawn");
        runtime
            .resume(launch_with_prompt(dir.path(), session_id, "0"))
            .await
            .expect("resume");

        let mut results = Vec::new();
        let mut closes = 0;
        while let Some(ev) = next_event(&mut rx).await {
            match ev.event.subtype() {
                Some("close") | Some("error") if ev.event.data.get("result").is_none() => {
                    closes += 1;
                    if closes == 1 {
                        break;
                    }
                }
                _ => {
                    if let Some(result) = ev.event.data.get("result") {
                        results.push(result.as_str().unwrap_or_default().to_string());
                    }
                }
            }
        }

        // Only the second generation's output arrives.
        assert_eq!(results, vec!["done-0".to_string()]);
        assert_eq!(closes, 1);
        // Nothing trailing from the superseded process.
        assert!(
            tokio::time::timeout(Duration::from_millis(300), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_kill_reports_running_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runtime = ProcessWorkerRuntime::new(
            WorkerConfig {
                binary: script.display().to_string(),
            },
            tx,
        );

        let session_id = Uuid::new_v4();
        assert!(!runtime.kill(session_id).await.expect("kill"));

        runtime
            .spawn(launch_with_prompt(dir.path(), session_id, "5"))
            .await
            .expect("spawn");
        assert!(runtime.kill(session_id).await.expect("kill"));

        // An operator kill still surfaces the terminal close.
        let close = next_event(&mut rx).await.expect("close event");
        assert_eq!(close.event.event_type, "result");
        assert_eq!(close.event.subtype(), Some("error"));
    }
}
