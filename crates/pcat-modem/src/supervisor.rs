//! Dial helper supervision.
//!
//! The helper (e.g. `quectel-CM`) is spawned with its stdout and stderr
//! merged into one pipe. A task on the event loop waits for the pipe to
//! become readable, then reads it in 4 KiB chunks until it would block,
//! handing every chunk to a [`StatusParser`]. When the helper exits the
//! task drops the pipe and clears the handle so the next USB scan can
//! start a new helper.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use pcat_common::config::DialConfig;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::error::{ModemError, Result};
use crate::protocol::StatusParser;
use crate::status::StatusHandle;
use crate::usb::{HelperLauncher, UsbDeviceEntry};

/// Raw helper output is appended here when debug logging is enabled.
pub const DEBUG_LOG_PATH: &str = "/tmp/pcat-modem-helper.log";

const READ_CHUNK: usize = 4096;

/// Helper command line for the configured dial settings.
///
/// IPv4+IPv6 (`-4 -6`) unless IPv6 is disabled, then `-s APN` and, when
/// user, password and auth are all configured, the three credentials.
pub fn helper_args(dial: &DialConfig) -> Vec<String> {
    let mut args = Vec::new();
    if !dial.disable_ipv6 {
        args.extend(["-4".to_string(), "-6".to_string()]);
    }
    if let Some(apn) = &dial.apn {
        args.extend(["-s".to_string(), apn.clone()]);
        if let Some(creds) = &dial.credentials {
            args.extend([creds.user.clone(), creds.password.clone(), creds.auth.clone()]);
        }
    }
    args
}

#[derive(Debug)]
struct HelperHandle {
    id: u64,
    pid: Option<u32>,
    program: String,
    /// Taken by [`ProcessSupervisor::terminate`]; the supervising task owns
    /// the child and performs the kill.
    kill: Option<oneshot::Sender<()>>,
}

struct SupervisorInner {
    runtime: Handle,
    dial: DialConfig,
    status: StatusHandle,
    debug_log: Option<PathBuf>,
    current: Mutex<Option<HelperHandle>>,
    next_id: AtomicU64,
}

/// Runs at most one dial helper at a time. Clones share the same helper slot.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    /// `runtime` is the event loop that watches the helper's output and exit.
    pub fn new(
        runtime: Handle,
        dial: DialConfig,
        status: StatusHandle,
        debug_log: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                runtime,
                dial,
                status,
                debug_log,
                current: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Whether a helper process is currently live.
    pub fn is_running(&self) -> bool {
        self.inner.lock_current().is_some()
    }

    /// Ask the supervising task to force-kill the live helper, if any. The
    /// handle is cleared once the task has reaped it.
    pub fn terminate(&self) {
        let mut current = self.inner.lock_current();
        let Some(handle) = current.as_mut() else {
            return;
        };
        if let Some(kill) = handle.kill.take() {
            tracing::info!(pid = ?handle.pid, program = %handle.program, "terminating modem dial helper");
            let _ = kill.send(());
        }
    }

    fn spawn_helper(&self, entry: &UsbDeviceEntry, program: &str) -> Result<()> {
        let args = helper_args(&self.inner.dial);
        let (reader, writer) = io::pipe()?;

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer.try_clone()?))
            .stderr(Stdio::from(writer))
            .kill_on_drop(true);

        let _guard = self.inner.runtime.enter();
        let child = cmd.spawn().map_err(|source| ModemError::Spawn {
            program: program.to_string(),
            source,
        })?;
        // Close our copies of the write end so EOF is seen when the helper exits.
        drop(cmd);
        let stream = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;

        let pid = child.id();
        tracing::info!(?pid, program, ?args, daemon = entry.daemon, "modem dial helper started");

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (kill_tx, kill_rx) = oneshot::channel();
        *self.inner.lock_current() = Some(HelperHandle {
            id,
            pid,
            program: program.to_string(),
            kill: Some(kill_tx),
        });

        let inner = Arc::clone(&self.inner);
        let daemon = entry.daemon;
        self.inner
            .runtime
            .spawn(async move { supervise(inner, child, stream, kill_rx, id, daemon).await });
        Ok(())
    }
}

impl HelperLauncher for ProcessSupervisor {
    /// Spawn the entry's helper unless one is already live.
    fn run(&self, entry: &UsbDeviceEntry) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let Some(program) = entry.external_exec.as_deref() else {
            return Ok(());
        };
        self.spawn_helper(entry, program)
    }
}

impl SupervisorInner {
    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<HelperHandle>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_debug_log(&self) -> Option<File> {
        let path = self.debug_log.as_ref()?;
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to open helper debug log");
                None
            }
        }
    }
}

async fn readable(stream: &Option<pipe::Receiver>) -> io::Result<()> {
    match stream {
        Some(rx) => rx.readable().await,
        None => std::future::pending().await,
    }
}

/// Read until the pipe would block. Returns `false` once the pipe is closed.
fn drain(
    stream: &pipe::Receiver,
    parser: &mut StatusParser,
    status: &StatusHandle,
    log: &mut Option<File>,
) -> bool {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stream.try_read(&mut buf) {
            Ok(0) => return false,
            Ok(n) => {
                if let Some(Err(e)) = log.as_mut().map(|f| f.write_all(&buf[..n])) {
                    tracing::warn!(error = %e, "helper debug log write failed, disabling");
                    *log = None;
                }
                tracing::trace!(bytes = n, "helper output");
                parser.feed(&buf[..n], status);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "helper output read failed");
                return false;
            }
        }
    }
}

fn log_exit(result: &io::Result<ExitStatus>, daemon: bool) {
    match result {
        Ok(status) if status.success() => {
            if daemon {
                tracing::warn!("modem dial helper exited");
            } else {
                tracing::info!("modem dial helper exited cleanly");
            }
        }
        Ok(status) => tracing::warn!(
            code = ?status.code(),
            signal = ?status.signal(),
            "modem dial helper exited with error"
        ),
        Err(e) => tracing::warn!(error = %e, "failed to wait for modem dial helper"),
    }
}

async fn supervise(
    inner: Arc<SupervisorInner>,
    mut child: Child,
    stream: pipe::Receiver,
    mut kill: oneshot::Receiver<()>,
    id: u64,
    daemon: bool,
) {
    let mut parser = StatusParser::new();
    let mut log = inner.open_debug_log();
    let mut stream = Some(stream);
    let mut kill_pending = true;

    let exit = loop {
        tokio::select! {
            ready = readable(&stream) => {
                let open = match (&stream, ready) {
                    (Some(rx), Ok(())) => drain(rx, &mut parser, &inner.status, &mut log),
                    (_, Err(e)) => {
                        tracing::warn!(error = %e, "helper output watch failed");
                        false
                    }
                    (None, Ok(())) => false,
                };
                if !open {
                    tracing::debug!("helper output closed");
                    stream = None;
                }
            }
            request = &mut kill, if kill_pending => {
                kill_pending = false;
                if request.is_ok() {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(error = %e, "failed to kill modem dial helper");
                    }
                }
            }
            result = child.wait() => break result,
        }
    };

    // Pick up whatever the helper wrote just before exiting.
    if let Some(rx) = &stream {
        drain(rx, &mut parser, &inner.status, &mut log);
    }
    drop(stream);

    log_exit(&exit, daemon);

    let mut current = inner.lock_current();
    if current.as_ref().is_some_and(|h| h.id == id) {
        *current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcat_common::config::DialCredentials;

    fn dial(apn: Option<&str>, creds: bool, disable_ipv6: bool) -> DialConfig {
        DialConfig {
            apn: apn.map(str::to_string),
            credentials: creds.then(|| DialCredentials {
                user: "user".into(),
                password: "pass".into(),
                auth: "2".into(),
            }),
            disable_ipv6,
        }
    }

    #[test]
    fn argument_table() {
        let cases: [(DialConfig, &[&str]); 8] = [
            (dial(None, false, false), &["-4", "-6"]),
            (dial(None, false, true), &[]),
            (dial(None, true, false), &["-4", "-6"]),
            (dial(None, true, true), &[]),
            (dial(Some("internet"), false, false), &["-4", "-6", "-s", "internet"]),
            (dial(Some("internet"), false, true), &["-s", "internet"]),
            (
                dial(Some("internet"), true, false),
                &["-4", "-6", "-s", "internet", "user", "pass", "2"],
            ),
            (
                dial(Some("internet"), true, true),
                &["-s", "internet", "user", "pass", "2"],
            ),
        ];
        for (cfg, expected) in cases {
            assert_eq!(helper_args(&cfg), expected, "{cfg:?}");
        }
    }

    #[tokio::test]
    async fn run_without_executable_is_noop() {
        let sup = ProcessSupervisor::new(
            Handle::current(),
            DialConfig::default(),
            StatusHandle::new(),
            None,
        );
        let entry = UsbDeviceEntry {
            device_type: pcat_common::models::DeviceType::General,
            vendor_id: 0x2C7C,
            product_id: 0,
            external_exec: None,
            daemon: false,
        };
        sup.run(&entry).unwrap();
        assert!(!sup.is_running());
        sup.terminate();
    }
}
