//! Shell processes behind a terminal connection, on either a native PTY or
//! plain stdio pipes.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::BackendKind;
use crate::errors::{GatewayError, GatewayResult};
use crate::platform::ShellCommand;

const CHANNEL_DEPTH: usize = 256;
const READ_CHUNK: usize = 8192;

pub struct SpawnRequest {
    pub command: ShellCommand,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
}

pub enum ChildHandle {
    Pty(Box<dyn portable_pty::Child + Send + Sync>),
    Pipe(tokio::process::Child),
}

impl ChildHandle {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ChildHandle::Pty(child) => child.process_id(),
            ChildHandle::Pipe(child) => child.id(),
        }
    }

    /// `true` once the process has exited.
    pub fn try_wait(&mut self) -> io::Result<bool> {
        match self {
            ChildHandle::Pty(child) => child.try_wait().map(|status| status.is_some()),
            ChildHandle::Pipe(child) => child.try_wait().map(|status| status.is_some()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeOutcome {
    Applied,
    /// The pipe transport has no window size.
    Unsupported,
    Failed,
}

/// Input side, reader tasks and PTY master of one process.
pub struct Pipes {
    input: Option<mpsc::Sender<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
    master: Option<Mutex<Box<dyn MasterPty + Send>>>,
}

impl Pipes {
    pub fn input(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.input.clone()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> ResizeOutcome {
        let Some(master) = self.master.as_ref() else {
            return ResizeOutcome::Unsupported;
        };
        let master = master.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            Ok(()) => ResizeOutcome::Applied,
            Err(err) => {
                debug!(%err, "pty resize failed");
                ResizeOutcome::Failed
            }
        }
    }

    /// Drops the input sender (ending the writer), aborts pipe tasks and
    /// releases the PTY master. Returns whether anything was still open.
    pub fn close(&mut self) -> bool {
        let mut closed = self.input.take().is_some();
        for task in self.tasks.drain(..) {
            task.abort();
            closed = true;
        }
        closed |= self.master.take().is_some();
        closed
    }
}

pub struct Spawned {
    pub child: ChildHandle,
    pub pipes: Pipes,
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// Either everything is returned or the half-started child is killed and
/// an error comes back.
pub fn spawn(backend: BackendKind, request: &SpawnRequest) -> GatewayResult<Spawned> {
    match backend {
        BackendKind::Pty => spawn_pty(request),
        BackendKind::Pipe => spawn_pipe(request),
    }
}

fn spawn_error(request: &SpawnRequest, err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Spawn(format!("{}: {}", request.command.program, err))
}

fn spawn_pty(request: &SpawnRequest) -> GatewayResult<Spawned> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| spawn_error(request, e))?;

    let mut cmd = CommandBuilder::new(&request.command.program);
    cmd.args(&request.command.args);
    if let Some(cwd) = &request.cwd {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", "xterm-256color");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| spawn_error(request, e))?;
    drop(pair.slave);

    let handles = pair
        .master
        .try_clone_reader()
        .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
    let (reader, writer) = match handles {
        Ok(handles) => handles,
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_error(request, err));
        }
    };

    let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
    std::thread::spawn(move || read_blocking(reader, out_tx));

    let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);
    std::thread::spawn(move || write_blocking(writer, in_rx));

    Ok(Spawned {
        child: ChildHandle::Pty(child),
        pipes: Pipes {
            input: Some(in_tx),
            tasks: Vec::new(),
            master: Some(Mutex::new(pair.master)),
        },
        output: out_rx,
    })
}

fn read_blocking(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO once the slave side is gone
            Err(_) => break,
        }
    }
}

fn write_blocking(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = rx.blocking_recv() {
        if writer.write_all(&bytes).and_then(|_| writer.flush()).is_err() {
            break;
        }
    }
}

fn spawn_pipe(request: &SpawnRequest) -> GatewayResult<Spawned> {
    let mut command = tokio::process::Command::new(&request.command.program);
    command
        .args(&request.command.args)
        .env("TERM", "xterm-256color")
        .env("COLUMNS", request.cols.to_string())
        .env("LINES", request.rows.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn().map_err(|e| spawn_error(request, e))?;
    let (Some(mut stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        let _ = child.start_kill();
        return Err(spawn_error(request, "stdio pipes unavailable"));
    };

    let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
    let writer = tokio::spawn(async move {
        while let Some(bytes) = in_rx.recv().await {
            if stdin.write_all(&bytes).await.is_err() || stdin.flush().await.is_err() {
                break;
            }
        }
    });
    let tasks = vec![
        tokio::spawn(read_async(stdout, out_tx.clone())),
        tokio::spawn(read_async(stderr, out_tx)),
        writer,
    ];

    Ok(Spawned {
        child: ChildHandle::Pipe(child),
        pipes: Pipes {
            input: Some(in_tx),
            tasks,
            master: None,
        },
        output: out_rx,
    })
}

async fn read_async<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}
