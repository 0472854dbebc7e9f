//! Replay session: one live debugger process and its record stream
//!
//! A background thread reads the child's stdout line by line, parses each
//! line and hands the records to the session's [`RecordSink`]. It keeps
//! draining whether or not anyone is waiting, so the child never stalls on a
//! full pipe.
//!
//! Every command goes out prefixed with its sequence number as an MI token,
//! which the debugger echoes on the matching result record.

use crate::replay::correlator::{self, Correlator, RecordSink};
use crate::replay::error::ControllerError;
use crate::replay::parser::MiParser;
use crate::replay::types::{SessionState, SessionStatus};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ExitStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const STDERR_SETTLE: Duration = Duration::from_millis(500);

/// Shutdown behaviour handed over by the launcher
#[derive(Debug, Clone)]
pub struct TeardownPolicy {
    pub exit_command: String,
    pub exit_grace: Duration,
    pub stderr_tail_lines: usize,
}

/// Live binding between a trace directory and a debugger process
pub struct Session {
    id: Uuid,
    trace_dir: PathBuf,
    pid: u32,
    state: Arc<Mutex<SessionState>>,
    child: Mutex<Option<Child>>,
    exit_status: Mutex<Option<ExitStatus>>,
    stdin: Mutex<Option<ChildStdin>>,
    sequence: AtomicU64,
    correlator: Correlator,
    sink: RecordSink,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    stderr_handle: Mutex<Option<JoinHandle<()>>>,
    policy: TeardownPolicy,
}

impl Session {
    /// Wrap a freshly spawned child and start draining its output.
    /// The session starts in [`SessionState::Starting`].
    pub fn attach(
        mut child: Child,
        trace_dir: &Path,
        policy: TeardownPolicy,
    ) -> Result<Self, ControllerError> {
        let id = Uuid::new_v4();
        let pid = child.id();

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ControllerError::LaunchFailure(
                    "debugger process has no piped stdio".to_string(),
                ));
            }
        };

        let state = Arc::new(Mutex::new(SessionState::Starting));
        let (sink, correlator) = correlator::channel();

        let reader_handle = {
            let sink = sink.clone();
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name(format!("rr-stdout-{}", pid))
                .spawn(move || Self::read_output_loop(stdout, sink, state, id))
        };
        let reader_handle = match reader_handle {
            Ok(handle) => handle,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ControllerError::LaunchFailure(format!(
                    "failed to start output reader: {}",
                    e
                )));
            }
        };

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_handle = {
            let tail = Arc::clone(&stderr_tail);
            let limit = policy.stderr_tail_lines;
            thread::Builder::new()
                .name(format!("rr-stderr-{}", pid))
                .spawn(move || Self::read_stderr_loop(stderr, tail, limit))
                .map_err(|e| warn!("Failed to start stderr reader for rr {}: {}", pid, e))
                .ok()
        };

        info!(session = %id, pid, "Replay process started for {}", trace_dir.display());

        Ok(Self {
            id,
            trace_dir: trace_dir.to_path_buf(),
            pid,
            state,
            child: Mutex::new(Some(child)),
            exit_status: Mutex::new(None),
            stdin: Mutex::new(Some(stdin)),
            sequence: AtomicU64::new(0),
            correlator,
            sink,
            stderr_tail,
            reader_handle: Mutex::new(Some(reader_handle)),
            stderr_handle: Mutex::new(stderr_handle),
            policy,
        })
    }

    /// Parse stdout until it closes, then announce the end of the stream
    fn read_output_loop(
        stdout: impl Read,
        sink: RecordSink,
        state: Arc<Mutex<SessionState>>,
        id: Uuid,
    ) {
        let parser = MiParser::new();
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    debug!(session = %id, "rr output: {}", line.trim_end());
                    if let Some(record) = parser.feed(&line) {
                        if !sink.deliver(record) {
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(session = %id, "Error reading rr output: {}", e);
                    break;
                }
            }
        }

        *state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Exited;
        sink.end();
        info!(session = %id, "rr output reader stopped");
    }

    fn read_stderr_loop(stderr: impl Read, tail: Arc<Mutex<VecDeque<String>>>, limit: usize) {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    debug!("rr stderr: {}", line);
                    let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() == limit {
                        tail.pop_front();
                    }
                    if limit > 0 {
                        tail.push_back(line);
                    }
                }
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn trace_dir(&self) -> &Path {
        &self.trace_dir
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) -> SessionState {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, state)
    }

    /// Promote a session that passed its handshake
    pub fn mark_active(&self) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *guard == SessionState::Starting {
            *guard = SessionState::Active;
            true
        } else {
            false
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn commands_sent(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            id: self.id.to_string(),
            trace_dir: self.trace_dir.clone(),
            state: self.state(),
            pid: self.pid,
            commands_sent: self.commands_sent(),
        }
    }

    /// Exit status and recent stderr, for launch diagnostics
    pub fn diagnostics(&self) -> String {
        // ExitStatus renders as "exit status: N" or "signal: N"
        let status = self
            .exit_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "process still running".to_string());
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.is_empty() {
            status
        } else {
            let lines: Vec<&str> = tail.iter().map(String::as_str).collect();
            format!("{}; stderr: {}", status, lines.join(" | "))
        }
    }

    /// Write one command line to the debugger. Returns the command's
    /// sequence number, which is also its MI token; does not wait for any
    /// output.
    pub fn send(&self, command: &str) -> Result<u64, ControllerError> {
        if !self.is_active() {
            return Err(ControllerError::NoActiveSession);
        }

        let mut stdin = self.stdin.lock().unwrap_or_else(PoisonError::into_inner);
        let pipe = stdin.as_mut().ok_or(ControllerError::NoActiveSession)?;

        // One command per line on the wire, carrying our token only
        let line: String = command
            .trim()
            .trim_start_matches(|c: char| c.is_ascii_digit())
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        let seq = self.sequence.load(Ordering::SeqCst) + 1;
        let written = pipe
            .write_all(format!("{}{}\n", seq, line).as_bytes())
            .and_then(|_| pipe.flush());
        if let Err(e) = written {
            warn!(session = %self.id, "Write to rr failed: {}", e);
            self.set_state(SessionState::Exited);
            return Err(ControllerError::WriteFailure(e));
        }

        self.sequence.store(seq, Ordering::SeqCst);
        debug!(session = %self.id, seq, "Sent command: {}", line);
        Ok(seq)
    }

    /// Stop the debugger: polite exit first, then the whole process group if
    /// it does not leave in time. Always reaps the child and unblocks any
    /// pending wait. Idempotent.
    pub fn terminate(&self) {
        let previous = self.set_state(SessionState::Exited);
        let mut child_guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut child) = child_guard.take() else {
            return;
        };

        info!(session = %self.id, pid = self.pid, "Terminating replay session");

        {
            let mut stdin = self.stdin.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(pipe) = stdin.as_mut() {
                if previous != SessionState::Exited {
                    let line = format!("{}\n", self.policy.exit_command);
                    let _ = pipe.write_all(line.as_bytes()).and_then(|_| pipe.flush());
                }
            }
            // Closing stdin is a second hint for the debugger to quit
            *stdin = None;
        }

        // The group is only killed while its leader is unreaped, so the pgid
        // cannot have been handed to another process
        let status = wait_with_grace(&mut child, self.policy.exit_grace).or_else(|| {
            warn!(session = %self.id, "rr did not exit in {:?}, killing", self.policy.exit_grace);
            kill_process_group(self.pid);
            let _ = child.kill();
            child.wait().ok()
        });
        debug!(session = %self.id, "rr exited with {:?}", status);
        *self.exit_status.lock().unwrap_or_else(PoisonError::into_inner) = status;

        self.sink.end();

        // Let the stderr reader catch the last lines for diagnostics
        join_if_finished(&self.stderr_handle, STDERR_SETTLE);
        join_if_finished(&self.reader_handle, Duration::ZERO);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Join a reader thread once it has stopped, giving it up to `settle`.
/// A reader stuck on a pipe held open elsewhere is left detached.
fn join_if_finished(slot: &Mutex<Option<JoinHandle<()>>>, settle: Duration) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    let deadline = Instant::now() + settle;
    while slot.as_ref().is_some_and(|h| !h.is_finished()) && Instant::now() < deadline {
        thread::sleep(EXIT_POLL_INTERVAL);
    }
    if slot.as_ref().is_some_and(|h| h.is_finished()) {
        if let Some(handle) = slot.take() {
            let _ = handle.join();
        }
    }
}

/// Poll for exit until `grace` runs out
fn wait_with_grace(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to poll rr process: {}", e);
                return None;
            }
        }
    }
}

/// rr runs the debugger as its own child; both share our pipes, so the
/// whole group has to go.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: the child was spawned as leader of its own process group.
    let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("Failed to kill process group {}: {}", pid, err);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::replay::correlator::CompletionPredicate;
    use crate::replay::launcher::{Launcher, RrLauncher};
    use crate::replay::testing::{fake_rr_config, pid_alive, process_running, script_config};
    use crate::replay::types::class;

    fn started(trace: &tempfile::TempDir) -> Session {
        let session = RrLauncher::new(fake_rr_config()).launch(trace.path()).unwrap();
        session
            .correlator()
            .await_records(&CompletionPredicate::prompt(), Duration::from_secs(10))
            .unwrap();
        assert!(session.mark_active());
        session
    }

    #[test]
    fn test_send_requires_active_session() {
        let trace = tempfile::tempdir().unwrap();
        let session = RrLauncher::new(fake_rr_config()).launch(trace.path()).unwrap();
        assert_eq!(session.state(), SessionState::Starting);
        assert!(matches!(
            session.send("bt"),
            Err(ControllerError::NoActiveSession)
        ));
        assert_eq!(session.commands_sent(), 0);
    }

    #[test]
    fn test_send_and_correlate() {
        let trace = tempfile::tempdir().unwrap();
        let session = started(&trace);

        let wait = session.correlator().begin();
        let token = session.send("bt").unwrap();
        assert_eq!(token, 1);
        let records = wait
            .wait_for_reply(token, &CompletionPredicate::for_command("bt"), Duration::from_secs(10))
            .unwrap();
        assert_eq!(records.last().unwrap().class(), Some(class::DONE));
        assert_eq!(records.last().unwrap().token(), Some(1));
        assert!(records[0].text().unwrap().contains("main"));
        assert_eq!(session.commands_sent(), 1);
    }

    #[test]
    fn test_caller_token_is_replaced() {
        let trace = tempfile::tempdir().unwrap();
        let session = started(&trace);
        session.send("info").unwrap();

        let wait = session.correlator().begin();
        let token = session.send("77-stack-list-frames").unwrap();
        assert_eq!(token, 2);
        let records = wait
            .wait_for_reply(token, &CompletionPredicate::introspection(), Duration::from_secs(10))
            .unwrap();
        let last = records.last().unwrap();
        assert_eq!(last.token(), Some(2));
        assert_eq!(
            last.payload().unwrap().get_str("who"),
            Some("-stack-list-frames")
        );
    }

    #[test]
    fn test_write_failure_ends_session() {
        let trace = tempfile::tempdir().unwrap();
        let session = started(&trace);

        // The debugger stays alive but stops reading its input
        let wait = session.correlator().begin();
        let token = session.send("closein").unwrap();
        wait.wait_for_reply(token, &CompletionPredicate::result(), Duration::from_secs(10))
            .unwrap();
        assert!(session.is_active());

        assert!(matches!(
            session.send("bt"),
            Err(ControllerError::WriteFailure(_))
        ));
        assert_eq!(session.state(), SessionState::Exited);
        assert_eq!(session.commands_sent(), 1);
        assert!(matches!(
            session.send("bt"),
            Err(ControllerError::NoActiveSession)
        ));
    }

    #[test]
    fn test_stubborn_debugger_group_is_killed() {
        // Ignores -gdb-exit and closed stdin, and has a helper in its group
        let config = script_config(
            r#"sleep 30 & printf '~"%s"\n(rr)\n' "$!"; exec sleep 30"#,
        );
        let trace = tempfile::tempdir().unwrap();
        let session = RrLauncher::new(config).launch(trace.path()).unwrap();
        let records = session
            .correlator()
            .await_records(&CompletionPredicate::prompt(), Duration::from_secs(10))
            .unwrap();
        let helper: u32 = records[0].text().unwrap().trim().parse().unwrap();
        assert!(process_running(helper));

        session.terminate();
        assert!(!pid_alive(session.pid()));
        let deadline = Instant::now() + Duration::from_secs(5);
        while process_running(helper) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!process_running(helper));
        assert!(session.diagnostics().starts_with("signal:"));
    }

    #[test]
    fn test_terminate_reaps_and_is_idempotent() {
        let trace = tempfile::tempdir().unwrap();
        let session = started(&trace);
        let pid = session.pid();
        assert!(pid_alive(pid));

        session.terminate();
        assert_eq!(session.state(), SessionState::Exited);
        assert!(!pid_alive(pid));
        assert!(session.diagnostics().starts_with("exit status:"));

        session.terminate();
        assert!(matches!(
            session.send("bt"),
            Err(ControllerError::NoActiveSession)
        ));
    }

    #[test]
    fn test_terminate_unblocks_pending_wait() {
        let trace = tempfile::tempdir().unwrap();
        let session = Arc::new(started(&trace));

        let waiter = {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                let wait = session.correlator().begin();
                session.send("hang").unwrap();
                wait.wait(&CompletionPredicate::stopped(), Duration::from_secs(60))
            })
        };
        thread::sleep(Duration::from_millis(200));
        session.terminate();

        assert!(matches!(
            waiter.join().unwrap(),
            Err(ControllerError::SessionEnded { .. })
        ));
    }

    #[test]
    fn test_process_exit_ends_stream() {
        let trace = tempfile::tempdir().unwrap();
        let session = started(&trace);
        let wait = session.correlator().begin();
        session.send("crash").unwrap();
        assert!(matches!(
            wait.wait(&CompletionPredicate::result(), Duration::from_secs(10)),
            Err(ControllerError::SessionEnded { .. })
        ));
        assert_eq!(session.state(), SessionState::Exited);
    }
}
