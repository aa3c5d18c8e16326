use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::process::{ChildHandle, Pipes, ResizeOutcome};
use crate::models::{ControlMessage, TerminalMode};

pub type ConnectionId = Uuid;

const MAX_DIMENSION: u16 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Opening,
    Spawning,
    Streaming,
    Closing,
    /// Only reported in logs; closed connections leave the registry.
    Closed,
}

/// Inbound frame after inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    Input(Vec<u8>),
}

/// Well-formed `resize`/`ping` JSON is control; everything else, including
/// a resize with a zero dimension, is terminal input.
pub fn classify_frame(payload: &[u8]) -> Frame {
    let trimmed = payload.trim_ascii();
    if trimmed.first() == Some(&b'{') {
        match serde_json::from_slice::<ControlMessage>(trimmed) {
            Ok(ControlMessage::Resize { cols, rows }) if cols == 0 || rows == 0 => {}
            Ok(message) => return Frame::Control(message),
            Err(_) => {}
        }
    }
    Frame::Input(payload.to_vec())
}

struct ProcessHandles {
    child: ChildHandle,
    pipes: Pipes,
    /// Set once `try_wait` has reaped the child; its pid may be reused.
    exited: bool,
}

/// Everything one terminal connection owns.
pub struct ConnectionState {
    pub mode: TerminalMode,
    pub container: Option<String>,
    pub phase: Phase,
    pub opened_at: DateTime<Utc>,
    process: Mutex<Option<ProcessHandles>>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub mode: TerminalMode,
    pub container: Option<String>,
    pub pid: Option<u32>,
    pub phase: Phase,
    pub opened_at: DateTime<Utc>,
}

/// Outcome of each independent teardown step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub timer_cancelled: bool,
    pub pipes_closed: bool,
    pub signal_sent: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeResult {
    Applied,
    Unsupported,
    OutOfRange,
    Failed,
    NoProcess,
}

/// Live connections keyed by id. Nothing here is shared between
/// connections except the map itself.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, mode: TerminalMode, container: Option<String>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            ConnectionState {
                mode,
                container,
                phase: Phase::Opening,
                opened_at: Utc::now(),
                process: Mutex::new(None),
                timer: None,
            },
        );
        id
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn phase(&self, id: &ConnectionId) -> Option<Phase> {
        self.connections.get(id).map(|state| state.phase)
    }

    pub fn set_phase(&self, id: &ConnectionId, phase: Phase) {
        if let Some(mut state) = self.connections.get_mut(id) {
            state.phase = phase;
        }
    }

    pub fn attach_process(&self, id: &ConnectionId, child: ChildHandle, pipes: Pipes, grace: Duration) {
        match self.connections.get(id) {
            Some(state) => {
                *lock(&state.process) = Some(ProcessHandles {
                    child,
                    pipes,
                    exited: false,
                });
            }
            None => {
                let mut pipes = pipes;
                pipes.close();
                terminate(child, grace, false);
            }
        }
    }

    pub fn attach_timer(&self, id: &ConnectionId, timer: JoinHandle<()>) {
        match self.connections.get_mut(id) {
            Some(mut state) => state.timer = Some(timer),
            None => timer.abort(),
        }
    }

    pub fn input(&self, id: &ConnectionId) -> Option<mpsc::Sender<Vec<u8>>> {
        let state = self.connections.get(id)?;
        let process = lock(&state.process);
        process.as_ref()?.pipes.input()
    }

    pub fn resize(&self, id: &ConnectionId, cols: u32, rows: u32) -> ResizeResult {
        let (Some(cols), Some(rows)) = (checked_dimension(cols), checked_dimension(rows)) else {
            return ResizeResult::OutOfRange;
        };
        let Some(state) = self.connections.get(id) else {
            return ResizeResult::NoProcess;
        };
        let process = lock(&state.process);
        match process.as_ref().map(|handles| handles.pipes.resize(cols, rows)) {
            Some(ResizeOutcome::Applied) => ResizeResult::Applied,
            Some(ResizeOutcome::Unsupported) => ResizeResult::Unsupported,
            Some(ResizeOutcome::Failed) => ResizeResult::Failed,
            None => ResizeResult::NoProcess,
        }
    }

    /// `true` when the child has exited or the connection has no process.
    pub fn process_exited(&self, id: &ConnectionId) -> bool {
        let Some(state) = self.connections.get(id) else {
            return true;
        };
        let mut process = lock(&state.process);
        match process.as_mut() {
            Some(handles) if handles.exited => true,
            Some(handles) => {
                handles.exited = handles.child.try_wait().unwrap_or(true);
                handles.exited
            }
            None => true,
        }
    }

    pub fn summaries(&self) -> Vec<ConnectionSummary> {
        self.connections
            .iter()
            .map(|entry| {
                let state = entry.value();
                let pid = lock(&state.process)
                    .as_ref()
                    .filter(|handles| !handles.exited)
                    .and_then(|handles| handles.child.pid());
                ConnectionSummary {
                    id: *entry.key(),
                    mode: state.mode,
                    container: state.container.clone(),
                    pid,
                    phase: state.phase,
                    opened_at: state.opened_at,
                }
            })
            .collect()
    }

    /// Removes the connection and tears it down. The timer, the pipes and
    /// the process are handled separately so one failing step does not stop
    /// the others. `None` if the connection was already closed.
    pub fn close(&self, id: &ConnectionId, grace: Duration) -> Option<CleanupReport> {
        let (_, mut state) = self.connections.remove(id)?;

        let timer_cancelled = match state.timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        };

        let handles = state
            .process
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (pipes_closed, signal_sent) = match handles {
            Some(ProcessHandles {
                child,
                mut pipes,
                exited,
            }) => {
                let closed = pipes.close();
                (closed, terminate(child, grace, exited))
            }
            None => (false, false),
        };

        let report = CleanupReport {
            timer_cancelled,
            pipes_closed,
            signal_sent,
        };
        debug!(connection = %id, ?report, "connection closed");
        Some(report)
    }
}

fn checked_dimension(value: u32) -> Option<u16> {
    u16::try_from(value)
        .ok()
        .filter(|value| (1..=MAX_DIMENSION).contains(value))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sends SIGTERM and reaps the child in the background, killing it if it is
/// still around after `grace`. Returns whether the signal was delivered.
/// An already reaped child is left alone since its pid is no longer ours.
fn terminate(child: ChildHandle, grace: Duration, reaped: bool) -> bool {
    if reaped {
        return false;
    }
    let signal_sent = match child.pid() {
        Some(pid) => match i32::try_from(pid) {
            Ok(raw) => match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) => true,
                Err(Errno::ESRCH) => false,
                Err(err) => {
                    warn!(pid, %err, "failed to signal child");
                    false
                }
            },
            Err(_) => false,
        },
        None => false,
    };

    match child {
        ChildHandle::Pipe(mut child) => {
            tokio::spawn(async move {
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    let _ = child.kill().await;
                }
            });
        }
        ChildHandle::Pty(mut child) => {
            tokio::task::spawn_blocking(move || {
                let deadline = Instant::now() + grace;
                loop {
                    match child.try_wait() {
                        Ok(Some(_)) => break,
                        Ok(None) if Instant::now() < deadline => {
                            std::thread::sleep(Duration::from_millis(50))
                        }
                        _ => {
                            let _ = child.kill();
                            let _ = child.wait();
                            break;
                        }
                    }
                }
            });
        }
    }
    signal_sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::platform::ShellCommand;
    use crate::pty::process::{spawn, SpawnRequest};

    #[test]
    fn control_frames_are_recognised() {
        assert_eq!(
            classify_frame(br#"{"type":"ping"}"#),
            Frame::Control(ControlMessage::Ping)
        );
        assert_eq!(
            classify_frame(br#" {"type":"resize","cols":120,"rows":40} "#),
            Frame::Control(ControlMessage::Resize { cols: 120, rows: 40 })
        );
    }

    #[test]
    fn oversized_resize_is_still_control() {
        assert_eq!(
            classify_frame(br#"{"type":"resize","cols":70000,"rows":40}"#),
            Frame::Control(ControlMessage::Resize { cols: 70_000, rows: 40 })
        );
    }

    #[test]
    fn everything_else_is_input() {
        assert_eq!(classify_frame(b"ls\n"), Frame::Input(b"ls\n".to_vec()));
        assert_eq!(
            classify_frame(br#"{"type":"resize","cols":0,"rows":40}"#),
            Frame::Input(br#"{"type":"resize","cols":0,"rows":40}"#.to_vec())
        );
        assert_eq!(
            classify_frame(br#"{"type":"unknown"}"#),
            Frame::Input(br#"{"type":"unknown"}"#.to_vec())
        );
        assert_eq!(classify_frame(b"{not json"), Frame::Input(b"{not json".to_vec()));
    }

    #[tokio::test]
    async fn close_tears_down_everything_and_forgets_the_connection() {
        let registry = ConnectionRegistry::new();
        let id = registry.open(TerminalMode::Host, None);
        let spawned = spawn(
            BackendKind::Pipe,
            &SpawnRequest {
                command: ShellCommand::new("cat"),
                cwd: None,
                cols: 80,
                rows: 24,
            },
        )
        .unwrap();
        registry.attach_process(&id, spawned.child, spawned.pipes, Duration::from_millis(200));
        registry.attach_timer(&id, tokio::spawn(std::future::pending::<()>()));
        assert!(!registry.process_exited(&id));

        let report = registry.close(&id, Duration::from_millis(200)).unwrap();
        assert_eq!(
            report,
            CleanupReport {
                timer_cancelled: true,
                pipes_closed: true,
                signal_sent: true,
            }
        );
        assert!(registry.is_empty());
        assert!(registry.close(&id, Duration::from_millis(200)).is_none());
    }

    fn spawn_attached(registry: &ConnectionRegistry, backend: BackendKind, program: &str) -> ConnectionId {
        let id = registry.open(TerminalMode::Host, None);
        let spawned = spawn(
            backend,
            &SpawnRequest {
                command: ShellCommand::new(program),
                cwd: None,
                cols: 80,
                rows: 24,
            },
        )
        .unwrap();
        registry.attach_process(&id, spawned.child, spawned.pipes, Duration::from_millis(200));
        id
    }

    #[tokio::test]
    async fn reaped_pty_child_is_not_signalled() {
        let registry = ConnectionRegistry::new();
        let id = spawn_attached(&registry, BackendKind::Pty, "true");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !registry.process_exited(&id) {
            assert!(Instant::now() < deadline, "child never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(registry.summaries()[0].pid, None);

        let report = registry.close(&id, Duration::from_millis(200)).unwrap();
        assert!(report.pipes_closed);
        assert!(!report.signal_sent);
    }

    #[tokio::test]
    async fn pty_backend_applies_resize() {
        let registry = ConnectionRegistry::new();
        let id = spawn_attached(&registry, BackendKind::Pty, "cat");
        assert_eq!(registry.resize(&id, 132, 43), ResizeResult::Applied);

        let report = registry.close(&id, Duration::from_millis(200)).unwrap();
        assert!(report.signal_sent);
    }

    #[tokio::test]
    async fn closing_one_connection_leaves_others_alone() {
        let registry = ConnectionRegistry::new();
        let first = registry.open(TerminalMode::Host, None);
        let second = registry.open(TerminalMode::Sandbox, Some("alice".into()));
        registry.close(&first, Duration::from_millis(10));
        assert!(registry.contains(&second));
        assert_eq!(registry.phase(&second), Some(Phase::Opening));
        assert_eq!(registry.summaries().len(), 1);
    }

    #[test]
    fn resize_rejects_out_of_range_sizes() {
        let registry = ConnectionRegistry::new();
        let id = registry.open(TerminalMode::Host, None);
        assert_eq!(registry.resize(&id, 0, 10), ResizeResult::OutOfRange);
        assert_eq!(registry.resize(&id, 5000, 10), ResizeResult::OutOfRange);
        assert_eq!(registry.resize(&id, 70_000, 40), ResizeResult::OutOfRange);
        assert_eq!(registry.resize(&id, 80, 24), ResizeResult::NoProcess);
    }
}
