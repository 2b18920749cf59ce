use parking_lot::Mutex;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("pty is closed")]
    Closed,

    #[error("pseudo-terminals are not supported on this platform")]
    Unsupported,
}

/// Terminal window dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

impl From<WindowSize> for PtySize {
    fn from(size: WindowSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Program and arguments to run inside a new pseudo-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SpawnCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn to_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        cmd.env("TERM", "xterm-256color");
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd
    }
}

impl std::fmt::Display for SpawnCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

struct Terminal {
    master: Option<Box<dyn MasterPty + Send>>,
    size: WindowSize,
}

/// One process attached to one pseudo-terminal.
///
/// The process and the terminal share a lifecycle: [`close`](Self::close)
/// kills the whole process group and releases the terminal handles. A
/// background exit monitor reaps the child and fires [`done`](Self::done)
/// exactly once, whether the process was killed or exited on its own.
///
/// Reads, writes, resizes and closes may race freely. Writes and resizes are
/// serialized on their own locks; `close` signals the process group before
/// taking any lock so an in-flight write is released by the dying slave side.
pub struct PtyProcess {
    pid: Option<u32>,
    command: SpawnCommand,
    terminal: Mutex<Terminal>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    #[cfg(unix)]
    read_wake: Option<ReadWake>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    closed: AtomicBool,
    child_exited: std::sync::Arc<AtomicBool>,
    done: CancellationToken,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("closed", &self.is_closed())
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

impl PtyProcess {
    /// Spawn `command` on a fresh pseudo-terminal at the default 24x80 size.
    pub fn spawn(command: &SpawnCommand) -> Result<Self, PtyError> {
        Self::spawn_with_size(command, WindowSize::default())
    }

    /// Spawn `command` on a fresh pseudo-terminal of the given size.
    ///
    /// Must be called from within a tokio runtime: the exit monitor runs on the
    /// blocking pool.
    #[cfg(any(unix, windows))]
    pub fn spawn_with_size(command: &SpawnCommand, size: WindowSize) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(size.into()).map_err(PtyError::OpenPty)?;

        let mut child = pair
            .slave
            .spawn_command(command.to_builder())
            .map_err(PtyError::SpawnCommand)?;
        // Our copy of the slave must go, otherwise the master never sees EOF
        // after the child exits.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(PtyError::CloneReader)?;
        #[cfg(unix)]
        let read_wake = match ReadWake::new(&*pair.master) {
            Ok(wake) => Some(wake),
            Err(e) => {
                tracing::warn!(error = %e, "pty reads will not be interruptible by close");
                None
            }
        };
        let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;
        let pid = child.process_id();
        let killer = child.clone_killer();

        let child_exited = std::sync::Arc::new(AtomicBool::new(false));
        let done = CancellationToken::new();
        {
            let child_exited = child_exited.clone();
            let done = done.clone();
            let command_text = command.to_string();
            tokio::task::spawn_blocking(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    match child.wait() {
                        Ok(status) => tracing::debug!(command = %command_text, ?status, "pty child exited"),
                        Err(e) => tracing::error!(command = %command_text, ?e, "error waiting for pty child"),
                    }
                }));
                if let Err(e) = result {
                    tracing::error!("pty exit monitor panicked: {:?}", e);
                }
                // Mark the pid dead before announcing it so close() never
                // signals a recycled process group.
                child_exited.store(true, Ordering::Release);
                done.cancel();
            });
        }

        tracing::debug!(command = %command, ?pid, rows = size.rows, cols = size.cols, "pty spawned");

        Ok(Self {
            pid,
            command: command.clone(),
            terminal: Mutex::new(Terminal {
                master: Some(pair.master),
                size,
            }),
            reader: Mutex::new(Some(reader)),
            #[cfg(unix)]
            read_wake,
            writer: Mutex::new(Some(writer)),
            killer: Mutex::new(killer),
            closed: AtomicBool::new(false),
            child_exited,
            done,
        })
    }

    #[cfg(not(any(unix, windows)))]
    pub fn spawn_with_size(_command: &SpawnCommand, _size: WindowSize) -> Result<Self, PtyError> {
        Err(PtyError::Unsupported)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The size most recently applied to the terminal.
    pub fn size(&self) -> WindowSize {
        self.terminal.lock().size
    }

    /// Change the terminal window size. Values are applied as given.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let mut terminal = self.terminal.lock();
        let size = WindowSize::new(rows, cols);
        let master = terminal.master.as_ref().ok_or(PtyError::Closed)?;
        master.resize(size.into()).map_err(PtyError::Resize)?;
        terminal.size = size;
        Ok(())
    }

    /// Blocking read of terminal output.
    ///
    /// Returns `Ok(0)` (or an `EIO` error on Linux) once the process has
    /// exited and buffered output has drained, and `Ok(0)` as soon as
    /// [`close`](Self::close) runs, even if a process outside the group still
    /// holds the terminal open. There is a single reader per process;
    /// concurrent callers queue on the reader lock.
    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut reader = self.reader.lock();
        #[cfg(unix)]
        if let Some(wake) = &self.read_wake {
            if !wake.wait_readable()? {
                return Ok(0);
            }
        }
        match reader.as_mut() {
            Some(r) => r.read(buf),
            None => Ok(0),
        }
    }

    /// Blocking write of terminal input. The whole buffer is written and
    /// flushed before the writer lock is released.
    pub fn write(&self, data: &[u8]) -> std::io::Result<usize> {
        let mut writer = self.writer.lock();
        let w = writer.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pty is closed")
        })?;
        w.write_all(data)?;
        w.flush()?;
        Ok(data.len())
    }

    /// Kill the process group and release the terminal. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.kill_process_group();
        #[cfg(unix)]
        if let Some(wake) = &self.read_wake {
            wake.wake();
        }
        drop(self.writer.lock().take());
        drop(self.terminal.lock().master.take());
        // A blocked reader holds this lock; the wake above releases it and
        // its handle goes away with the process.
        if let Some(mut reader) = self.reader.try_lock() {
            drop(reader.take());
        }
        tracing::debug!(command = %self.command, pid = ?self.pid, "pty closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the child has terminated and been reaped.
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.done.cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// SIGKILL the child's process group.
    ///
    /// portable_pty calls setsid() when spawning, so the child leads its own
    /// process group and shell children started in the foreground die with it.
    #[cfg(unix)]
    fn kill_process_group(&self) {
        if self.child_exited.load(Ordering::Acquire) {
            return;
        }
        match self.pid {
            Some(pid) if pid != 0 && pid <= i32::MAX as u32 => unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            },
            Some(pid) => {
                tracing::warn!(pid, "pid out of range for a process group, killing child only");
                let _ = self.killer.lock().kill();
            }
            None => {
                let _ = self.killer.lock().kill();
            }
        }
    }

    /// Without process groups only the direct child can be terminated;
    /// grandchildren that detached from the console may outlive it.
    #[cfg(not(unix))]
    fn kill_process_group(&self) {
        if self.child_exited.load(Ordering::Acquire) {
            return;
        }
        tracing::debug!(pid = ?self.pid, "process-group kill unavailable, killing direct child");
        let _ = self.killer.lock().kill();
    }
}

/// Lets `close` interrupt a read blocked on the master.
///
/// Readers poll a private dup of the master fd together with one end of a
/// socket pair; shutting the other end down makes every later poll return.
#[cfg(unix)]
struct ReadWake {
    master_fd: std::os::fd::OwnedFd,
    wake_rx: std::os::unix::net::UnixStream,
    wake_tx: std::os::unix::net::UnixStream,
}

#[cfg(unix)]
impl ReadWake {
    fn new(master: &dyn MasterPty) -> std::io::Result<Self> {
        use std::os::fd::FromRawFd;

        let raw = master.as_raw_fd().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Unsupported, "pty master has no fd")
        })?;
        let dup = unsafe { libc::fcntl(raw, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let master_fd = unsafe { std::os::fd::OwnedFd::from_raw_fd(dup) };
        let (wake_tx, wake_rx) = std::os::unix::net::UnixStream::pair()?;
        Ok(Self {
            master_fd,
            wake_rx,
            wake_tx,
        })
    }

    /// Block until the master has data (or hung up). `Ok(false)` means
    /// [`wake`](Self::wake) was called.
    fn wait_readable(&self) -> std::io::Result<bool> {
        use std::os::fd::AsRawFd;

        let mut fds = [
            libc::pollfd {
                fd: self.master_fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake_rx.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if fds[1].revents != 0 {
                return Ok(false);
            }
            if fds[0].revents != 0 {
                return Ok(true);
            }
        }
    }

    fn wake(&self) {
        let _ = self.wake_tx.shutdown(std::net::Shutdown::Both);
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.close();
    }
}
