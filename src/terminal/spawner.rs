//! Sandboxed PTY spawner seam.
//!
//! The concrete sandbox wiring (namespace unshare, cgroup scopes, images) is
//! outside this crate; what the session manager needs is an opaque process
//! handle plus a data sink and an exit sink, both installed exactly once at
//! spawn time.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;

use anyhow::{Context, Result};
use log::{debug, warn};
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};

/// Default shell when the caller supplies none.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// What to spawn, for whom.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub tenant_id: String,
    /// Working directory for the shell, the tenant's workspace.
    pub cwd: PathBuf,
    pub shell: String,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// Output/exit sinks, installed once per session.
pub struct PtySinks {
    pub on_data: Box<dyn Fn(&[u8]) + Send + Sync>,
    pub on_exit: Box<dyn FnOnce(Option<i32>) + Send>,
}

/// Opaque handle to a running sandboxed PTY process.
pub trait PtyProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;
    fn write(&self, data: &[u8]) -> Result<()>;
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;
    fn kill(&self) -> Result<()>;
}

/// Spawner seam; the production implementation wraps the host PTY system,
/// tests substitute a stub.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, request: SpawnRequest, sinks: PtySinks) -> Result<Box<dyn PtyProcess>>;
}

/// Host-backed spawner using the native PTY system. The shell runs inside the
/// tenant's workspace with only the requested environment.
#[derive(Debug, Default)]
pub struct HostPtySpawner;

struct HostPtyProcess {
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyProcess for HostPtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = match self.master.lock() {
            Ok(master) => master,
            Err(poisoned) => poisoned.into_inner(),
        };
        master.resize(size).context("pty resize failed")
    }

    fn kill(&self) -> Result<()> {
        let mut killer = match self.killer.lock() {
            Ok(killer) => killer,
            Err(poisoned) => poisoned.into_inner(),
        };
        killer.kill().context("pty kill failed")
    }
}

impl PtySpawner for HostPtySpawner {
    fn spawn(&self, request: SpawnRequest, sinks: PtySinks) -> Result<Box<dyn PtyProcess>> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&request.shell);
        cmd.cwd(&request.cwd);
        cmd.env("CLAWGATE_TENANT", &request.tenant_id);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn shell in PTY")?;
        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone PTY reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to acquire PTY writer")?;

        spawn_io_thread(&request.tenant_id, reader, child, sinks);

        Ok(Box::new(HostPtyProcess {
            pid,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
        }))
    }
}

/// Reader thread: pump PTY output into the data sink until EOF, then reap the
/// child and fire the exit sink.
fn spawn_io_thread(
    tenant_id: &str,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    sinks: PtySinks,
) {
    let thread_name = format!("pty-io-{tenant_id}");
    let spawned = thread::Builder::new().name(thread_name).spawn(move || {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => (sinks.on_data)(&buf[..n]),
                Err(err) => {
                    debug!("pty reader ended: {err}");
                    break;
                }
            }
        }
        let exit_code = match child.wait() {
            Ok(status) => i32::try_from(status.exit_code()).ok(),
            Err(err) => {
                warn!("pty child wait failed: {err}");
                None
            }
        };
        (sinks.on_exit)(exit_code);
    });
    if let Err(err) = spawned {
        warn!("failed to spawn pty io thread: {err}");
    }
}
