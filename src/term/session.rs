//! One pty + child process pairing.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use super::env::{self, resolve_shell, TermConfig, FAILSAFE_SHELL};
use super::SessionError;

/// Lifecycle of a session. `finish` is legal from `Running` or
/// `Exited`; everything else is a straight line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Pty and child allocated, emulator size not yet negotiated.
    Created,
    /// Emulator size being applied, watcher task starting.
    Initializing,
    /// Child alive, byte stream open.
    Running,
    /// Child terminated; exit message recorded, callback fired.
    Exited,
    /// Resources released.
    Finished,
}

/// Invoked once, on the session's own message task, when the child
/// exits.
pub type FinishCallback = Box<dyn Fn(&TerminalSession) + Send + Sync>;

enum SessionMsg {
    ChildExited(String),
}

/// Owns exactly one pty master and one child process, allocated
/// together and torn down together. All writes to the descriptor go
/// through this type; state transitions happen on one logical task fed
/// by the session's message queue.
pub struct TerminalSession {
    handle: String,
    shell_display: String,
    pid: Option<u32>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    state: Mutex<SessionState>,
    /// Guards the process-group signal so it is sent at most once.
    signaled: AtomicBool,
    child_exited: Arc<AtomicBool>,
    exit_message: Mutex<Option<String>>,
    finish_cb: Mutex<Option<FinishCallback>>,
    initial_command: Mutex<Option<String>>,
    msg_tx: mpsc::UnboundedSender<SessionMsg>,
    msg_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionMsg>>>,
}

impl TerminalSession {
    /// Open a pty, compute the child environment, and spawn the
    /// configured shell. Falls back once to [`FAILSAFE_SHELL`] if the
    /// configured shell is missing, non-executable, or fails to spawn;
    /// a failsafe failure is a creation error.
    pub fn spawn(config: &TermConfig) -> Result<Arc<Self>, SessionError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Open(e.to_string()))?;

        let shell = resolve_shell(&config.shell_command)?;
        let environment = env::build_environment(config);
        let cwd = config
            .cwd
            .clone()
            .or_else(dirs_next::home_dir)
            .unwrap_or_else(|| std::path::PathBuf::from("/"));

        let build_cmd = |program: &std::path::Path, args: &[String]| {
            let mut cmd = CommandBuilder::new(program);
            cmd.args(args);
            cmd.cwd(&cwd);
            for (key, value) in &environment {
                cmd.env(key, value);
            }
            cmd
        };

        let mut shell_display = shell.program.display().to_string();
        let child = match pair
            .slave
            .spawn_command(build_cmd(&shell.program, &shell.args))
        {
            Ok(child) => child,
            Err(e) if !shell.fell_back => {
                tracing::warn!(
                    "failed to spawn {}: {}, retrying with {}",
                    shell.program.display(),
                    e,
                    FAILSAFE_SHELL
                );
                shell_display = FAILSAFE_SHELL.to_string();
                pair.slave
                    .spawn_command(build_cmd(std::path::Path::new(FAILSAFE_SHELL), &[]))
                    .map_err(|e| SessionError::Spawn(e.to_string()))?
            }
            Err(e) => return Err(SessionError::Spawn(e.to_string())),
        };

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Open(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Open(e.to_string()))?;
        let pid = child.process_id();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();

        tracing::info!("spawned {} (pid {:?})", shell_display, pid);
        Ok(Arc::new(Self {
            handle: uuid::Uuid::new_v4().to_string(),
            shell_display,
            pid,
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            child: Mutex::new(Some(child)),
            state: Mutex::new(SessionState::Created),
            signaled: AtomicBool::new(false),
            child_exited: Arc::new(AtomicBool::new(false)),
            exit_message: Mutex::new(None),
            finish_cb: Mutex::new(None),
            initial_command: Mutex::new(config.initial_command.clone()),
            msg_tx,
            msg_rx: Mutex::new(Some(msg_rx)),
        }))
    }

    /// Negotiate the emulator size. Must be called exactly once per
    /// session: applies the pty size, starts the exit watcher and the
    /// message task, and delivers the queued initial command.
    pub fn initialize_emulator(self: &Arc<Self>, cols: u16, rows: u16) -> Result<(), SessionError> {
        {
            let mut state = lock_or_recover(&self.state);
            if *state != SessionState::Created {
                return Err(SessionError::AlreadyInitialized);
            }
            *state = SessionState::Initializing;
        }

        self.resize(cols, rows)?;

        // Exit watcher: sole owner of the blocking wait. Posts the
        // result onto the session's message queue rather than mutating
        // state from the blocking thread.
        let child = lock_or_recover(&self.child).take();
        if let Some(mut child) = child {
            let exited = Arc::clone(&self.child_exited);
            let msg_tx = self.msg_tx.clone();
            tokio::task::spawn_blocking(move || {
                let message = match child.wait() {
                    Ok(status) if status.success() => "process exited normally".to_string(),
                    Ok(status) => format!("process exited with code {}", status.exit_code()),
                    Err(e) => format!("wait for process failed: {}", e),
                };
                exited.store(true, Ordering::SeqCst);
                let _ = msg_tx.send(SessionMsg::ChildExited(message));
            });
        }

        // Message task: the one logical thread where state transitions
        // happen.
        if let Some(mut rx) = lock_or_recover(&self.msg_rx).take() {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    match msg {
                        SessionMsg::ChildExited(message) => {
                            session.on_child_exited(message);
                            break;
                        }
                    }
                }
            });
        }

        if let Some(command) = lock_or_recover(&self.initial_command).take() {
            let mut line = command.into_bytes();
            line.push(b'\r');
            self.write(&line)?;
        }

        *lock_or_recover(&self.state) = SessionState::Running;
        Ok(())
    }

    fn on_child_exited(&self, message: String) {
        tracing::info!("session {}: {}", self.handle, message);
        *lock_or_recover(&self.exit_message) = Some(message);
        {
            let mut state = lock_or_recover(&self.state);
            if *state != SessionState::Finished {
                *state = SessionState::Exited;
            }
        }
        let callback = lock_or_recover(&self.finish_cb).take();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    /// Write bytes from the UI/keyboard layer to the child.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut guard = lock_or_recover(&self.writer);
        let writer = guard
            .as_mut()
            .ok_or_else(|| SessionError::Write("session is finished".to_string()))?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| SessionError::Write(e.to_string()))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let guard = lock_or_recover(&self.master);
        let master = guard
            .as_ref()
            .ok_or_else(|| SessionError::Resize("session is finished".to_string()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Resize(e.to_string()))
    }

    /// Take the output side of the byte stream. The emulator owns it
    /// from then on.
    pub fn take_reader(&self) -> Option<Box<dyn Read + Send>> {
        lock_or_recover(&self.reader).take()
    }

    /// Signal the child's process group and release the pty. The signal
    /// is sent exactly once; repeated calls only repeat the (idempotent)
    /// resource release.
    pub fn finish(&self) {
        if !self.signaled.swap(true, Ordering::SeqCst)
            && !self.child_exited.load(Ordering::SeqCst)
        {
            if let Some(pid) = self.pid {
                signal_process_group(pid);
            }
        }
        lock_or_recover(&self.writer).take();
        lock_or_recover(&self.reader).take();
        lock_or_recover(&self.child).take();
        lock_or_recover(&self.master).take();
        *lock_or_recover(&self.state) = SessionState::Finished;
    }

    pub fn set_finish_callback(&self, callback: Option<FinishCallback>) {
        *lock_or_recover(&self.finish_cb) = callback;
    }

    /// Opaque handle addressing this session from outside.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn shell(&self) -> &str {
        &self.shell_display
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        *lock_or_recover(&self.state)
    }

    /// Termination message recorded when the child exited.
    pub fn exit_description(&self) -> Option<String> {
        lock_or_recover(&self.exit_message).clone()
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("handle", &self.handle)
            .field("shell", &self.shell_display)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Deliver SIGHUP to an entire process group. The child is spawned as a
/// session leader, so its pid doubles as the process-group id; the
/// whole shell job tree goes down together.
#[cfg(unix)]
fn signal_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!("pid {} out of range for process-group signal", pid);
        return;
    }
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGHUP) {
        tracing::debug!("process-group signal for {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn signal_process_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh_config() -> TermConfig {
        TermConfig {
            shell_command: "/bin/sh".to_string(),
            ..Default::default()
        }
    }

    async fn wait_for_state(
        session: &TerminalSession,
        wanted: SessionState,
        deadline: Duration,
    ) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if session.state() == wanted {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        session.state() == wanted
    }

    #[tokio::test]
    async fn exit_is_detected_and_message_recorded() {
        let session = TerminalSession::spawn(&sh_config()).unwrap();
        assert_eq!(session.state(), SessionState::Created);

        session.initialize_emulator(80, 24).unwrap();
        assert_eq!(session.state(), SessionState::Running);

        session.write(b"exit\n").unwrap();
        assert!(
            wait_for_state(&session, SessionState::Exited, Duration::from_secs(5)).await,
            "child did not exit"
        );
        assert!(session.exit_description().is_some());
        session.finish();
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let session = TerminalSession::spawn(&sh_config()).unwrap();
        session.initialize_emulator(80, 24).unwrap();

        session.finish();
        assert_eq!(session.state(), SessionState::Finished);

        session.finish();
        assert_eq!(session.state(), SessionState::Finished);

        // The late child-exit message must not resurrect the session.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(session.state(), SessionState::Finished);
    }

    #[tokio::test]
    async fn emulator_initializes_only_once() {
        let session = TerminalSession::spawn(&sh_config()).unwrap();
        session.initialize_emulator(80, 24).unwrap();
        let err = session.initialize_emulator(80, 24).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyInitialized));
        session.finish();
    }

    #[tokio::test]
    async fn missing_shell_falls_back_to_failsafe() {
        let config = TermConfig {
            shell_command: "/nonexistent/shell-xyz --login".to_string(),
            ..Default::default()
        };
        let session = TerminalSession::spawn(&config).unwrap();
        assert_eq!(session.shell(), FAILSAFE_SHELL);
        session.finish();
    }

    #[tokio::test]
    async fn finish_callback_fires_on_exit() {
        let session = TerminalSession::spawn(&sh_config()).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        session.set_finish_callback(Some(Box::new(move |_| {
            flag.store(true, Ordering::SeqCst);
        })));

        session.initialize_emulator(80, 24).unwrap();
        session.write(b"exit\n").unwrap();
        assert!(wait_for_state(&session, SessionState::Exited, Duration::from_secs(5)).await);

        let start = Instant::now();
        while !fired.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(fired.load(Ordering::SeqCst), "finish callback never fired");
        session.finish();
    }

    #[tokio::test]
    async fn initial_command_is_delivered_after_size_negotiation() {
        let config = TermConfig {
            shell_command: "/bin/sh".to_string(),
            initial_command: Some("echo boot-marker-$((40 + 2))".to_string()),
            ..Default::default()
        };
        let session = TerminalSession::spawn(&config).unwrap();
        let mut reader = session.take_reader().unwrap();
        session.initialize_emulator(80, 24).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let mut collected = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        collected.extend_from_slice(&buf[..n]);
                        if String::from_utf8_lossy(&collected).contains("boot-marker-42") {
                            let _ = tx.send(true);
                            break;
                        }
                    }
                }
            }
        });

        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap_or(false);
        assert!(seen, "initial command output not observed");
        session.finish();
    }
}
