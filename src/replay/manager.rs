//! Owns the single current replay session

use crate::replay::correlator::CompletionPredicate;
use crate::replay::error::ControllerError;
use crate::replay::launcher::{Launcher, RrLauncher};
use crate::replay::session::Session;
use crate::replay::types::{default_trace_dir, ResponseRecord, RrConfig, SessionStatus};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Start-or-replace and run-and-wait over at most one live session.
///
/// `current` is the identity lock: replacing, exiting and dispatching all
/// happen under it, waiting never does.
pub struct SessionManager {
    launcher: Box<dyn Launcher>,
    config: RrConfig,
    current: Mutex<Option<Arc<Session>>>,
}

impl SessionManager {
    pub fn new(config: RrConfig) -> Self {
        let launcher = RrLauncher::new(config.clone());
        Self::with_launcher(launcher, config)
    }

    pub fn with_launcher(launcher: impl Launcher + 'static, config: RrConfig) -> Self {
        Self {
            launcher: Box::new(launcher),
            config,
            current: Mutex::new(None),
        }
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tear down the current session (if any) and start one on `trace_dir`,
    /// or on rr's latest trace when none is given.
    pub fn replace(&self, trace_dir: Option<&Path>) -> Result<SessionStatus, ControllerError> {
        let trace_dir: PathBuf = match trace_dir {
            Some(dir) => dir.to_path_buf(),
            None => default_trace_dir().ok_or_else(|| {
                ControllerError::LaunchFailure(
                    "no trace directory given and HOME is not set".to_string(),
                )
            })?,
        };

        let mut current = self.lock_current();
        if let Some(previous) = current.take() {
            info!(
                "Replacing session {} ({})",
                previous.id(),
                previous.trace_dir().display()
            );
            previous.terminate();
        }

        let session = self.launcher.launch(&trace_dir)?;

        let handshake = session
            .correlator()
            .await_records(&CompletionPredicate::prompt(), self.config.handshake_timeout);
        match handshake {
            Ok(records) => debug!("Handshake completed after {} record(s)", records.len()),
            Err(e) => {
                session.terminate();
                let diagnostics = session.diagnostics();
                warn!("rr failed to start: {}; {}", e, diagnostics);
                return Err(ControllerError::LaunchFailure(format!(
                    "rr did not become ready ({}); {}",
                    e, diagnostics
                )));
            }
        }

        if !session.mark_active() {
            session.terminate();
            return Err(ControllerError::LaunchFailure(format!(
                "rr exited right after starting; {}",
                session.diagnostics()
            )));
        }

        let status = session.status();
        info!(
            "Replay session {} active on {}",
            status.id,
            status.trace_dir.display()
        );
        *current = Some(Arc::new(session));
        Ok(status)
    }

    /// Default completion predicate and deadline for `command`
    pub fn completion_for(&self, command: &str) -> (CompletionPredicate, Duration) {
        let predicate = CompletionPredicate::for_command(command);
        let timeout = if crate::replay::correlator::is_execution_command(command) {
            self.config.execution_timeout
        } else {
            self.config.command_timeout
        };
        (predicate, timeout)
    }

    /// Send `command` and collect records until `predicate` matches
    pub fn run(
        &self,
        command: &str,
        predicate: &CompletionPredicate,
        timeout: Duration,
    ) -> Result<Vec<ResponseRecord>, ControllerError> {
        let session = self.active_session()?;

        let mut wait = session.correlator().begin();
        let stale = wait.drain_unsolicited();
        if stale > 0 {
            debug!("Drained {} unsolicited record(s) before {:?}", stale, command);
        }

        let token = {
            let current = self.lock_current();
            match current.as_ref() {
                Some(c) if Arc::ptr_eq(c, &session) => {}
                _ => return Err(ControllerError::NoActiveSession),
            }
            session.send(command)?
        };

        let records = wait.wait_for_reply(token, predicate, timeout)?;
        if let Some(stop) = records.iter().rev().find(|r| r.is_stopped()) {
            match (stop.stop_reason(), stop.frame()) {
                (Some(reason), Some(frame)) => info!("Stopped: {} at {}", reason, frame),
                (Some(reason), None) => info!("Stopped: {}", reason),
                _ => {}
            }
        }
        Ok(records)
    }

    /// Terminate the current session; a no-op without one
    pub fn exit(&self) {
        let mut current = self.lock_current();
        if let Some(session) = current.take() {
            info!("Exiting session {}", session.id());
            session.terminate();
        }
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.lock_current().as_ref().map(|s| s.status())
    }

    fn active_session(&self) -> Result<Arc<Session>, ControllerError> {
        match self.lock_current().as_ref() {
            Some(session) if session.is_active() => Ok(Arc::clone(session)),
            _ => Err(ControllerError::NoActiveSession),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.exit();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::replay::testing::{fake_rr_config, pid_alive, script_config};
    use crate::replay::types::{class, RecordKind, SessionState, StopReason};
    use std::thread;
    use std::time::Instant;

    fn run_default(manager: &SessionManager, command: &str) -> Result<Vec<ResponseRecord>, ControllerError> {
        let (predicate, timeout) = manager.completion_for(command);
        manager.run(command, &predicate, timeout)
    }

    #[test]
    fn test_run_without_session() {
        let manager = SessionManager::new(fake_rr_config());
        let start = Instant::now();
        assert!(matches!(
            run_default(&manager, "continue"),
            Err(ControllerError::NoActiveSession)
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(manager.status().is_none());
    }

    #[test]
    fn test_continue_to_breakpoint() {
        let trace = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(fake_rr_config());
        let status = manager.replace(Some(trace.path())).unwrap();
        assert_eq!(status.state, SessionState::Active);

        let records = run_default(&manager, "continue").unwrap();
        let last = records.last().unwrap();
        assert!(last.is_stopped());
        assert_eq!(last.stop_reason(), Some(StopReason::BreakpointHit));
        assert_eq!(last.frame().unwrap().line, Some(5));
        assert!(records
            .iter()
            .any(|r| r.text() == Some("Continuing.\n")));
        assert_eq!(manager.status().unwrap().commands_sent, 1);
    }

    #[test]
    fn test_wait_for_specific_stop_reason() {
        let trace = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(fake_rr_config());
        manager.replace(Some(trace.path())).unwrap();

        let records = manager
            .run(
                "reverse-continue",
                &CompletionPredicate::stopped_because("no-history"),
                Duration::from_secs(10),
            )
            .unwrap();
        assert_eq!(
            records.last().unwrap().stop_reason(),
            Some(StopReason::NoHistory)
        );
    }

    #[test]
    fn test_replace_keeps_one_process() {
        let trace_a = tempfile::tempdir().unwrap();
        let trace_b = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(fake_rr_config());

        let first = manager.replace(Some(trace_a.path())).unwrap();
        let second = manager.replace(Some(trace_b.path())).unwrap();
        assert_ne!(first.id, second.id);
        assert!(!pid_alive(first.pid));
        assert!(pid_alive(second.pid));

        let status = manager.status().unwrap();
        assert_eq!(status.trace_dir, trace_b.path());
        let records = run_default(&manager, "where-trace").unwrap();
        let text = records[0].text().unwrap();
        assert_eq!(text, trace_b.path().to_str().unwrap());
    }

    #[test]
    fn test_error_result_is_success() {
        let trace = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(fake_rr_config());
        manager.replace(Some(trace.path())).unwrap();

        let records = run_default(&manager, "badcmd").unwrap();
        let last = records.last().unwrap();
        assert_eq!(last.class(), Some(class::ERROR));
        assert!(last
            .payload()
            .and_then(|p| p.get_str("msg"))
            .unwrap()
            .starts_with("Undefined command"));
        assert_eq!(manager.status().unwrap().state, SessionState::Active);
    }

    #[test]
    fn test_unsolicited_records_do_not_leak() {
        let trace = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(fake_rr_config());
        manager.replace(Some(trace.path())).unwrap();

        // Leaves a trailing prompt behind the *stopped record
        run_default(&manager, "continue").unwrap();
        thread::sleep(Duration::from_millis(100));

        let records = run_default(&manager, "bt").unwrap();
        let kinds: Vec<RecordKind> = records.iter().map(|r| r.kind()).collect();
        assert_eq!(kinds, vec![RecordKind::Console, RecordKind::Result]);
    }

    #[test]
    fn test_timeout_keeps_session() {
        let trace = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(fake_rr_config());
        manager.replace(Some(trace.path())).unwrap();

        let err = manager
            .run("noise", &CompletionPredicate::result(), Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(err, ControllerError::Timeout { .. }));
        // The non-MI line produced nothing
        let kinds: Vec<RecordKind> = err.records().iter().map(|r| r.kind()).collect();
        assert_eq!(kinds, vec![RecordKind::NotifyAsync]);

        let records = run_default(&manager, "bt").unwrap();
        assert_eq!(records.last().unwrap().class(), Some(class::DONE));
    }

    #[test]
    fn test_late_reply_is_not_credited_to_next_run() {
        let trace = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(fake_rr_config());
        manager.replace(Some(trace.path())).unwrap();

        let err = manager
            .run("slow", &CompletionPredicate::introspection(), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, ControllerError::Timeout { .. }));

        // Sent while the reply to "slow" is still on its way
        let records = run_default(&manager, "info").unwrap();
        let last = records.last().unwrap();
        assert_eq!(last.token(), Some(2));
        assert_eq!(last.payload().unwrap().get_str("who"), Some("info"));
        assert!(records
            .iter()
            .all(|r| r.payload().and_then(|p| p.get_str("who")) != Some("slow")));
    }

    #[test]
    fn test_write_failure_ends_session() {
        let trace = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(fake_rr_config());
        manager.replace(Some(trace.path())).unwrap();

        run_default(&manager, "closein").unwrap();
        assert!(matches!(
            run_default(&manager, "bt"),
            Err(ControllerError::WriteFailure(_))
        ));
        let status = manager.status().unwrap();
        assert_eq!(status.state, SessionState::Exited);
        assert_eq!(status.commands_sent, 1);
        assert!(matches!(
            run_default(&manager, "bt"),
            Err(ControllerError::NoActiveSession)
        ));
    }

    #[test]
    fn test_replace_interrupts_pending_run() {
        let trace_a = tempfile::tempdir().unwrap();
        let trace_b = tempfile::tempdir().unwrap();
        let manager = Arc::new(SessionManager::new(fake_rr_config()));
        manager.replace(Some(trace_a.path())).unwrap();

        let runner = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager.run("hang", &CompletionPredicate::stopped(), Duration::from_secs(60))
            })
        };
        thread::sleep(Duration::from_millis(200));
        manager.replace(Some(trace_b.path())).unwrap();

        assert!(matches!(
            runner.join().unwrap(),
            Err(ControllerError::SessionEnded { .. })
        ));
        assert_eq!(manager.status().unwrap().trace_dir, trace_b.path());
    }

    #[test]
    fn test_crashed_session_reports_no_session() {
        let trace = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(fake_rr_config());
        manager.replace(Some(trace.path())).unwrap();

        assert!(matches!(
            run_default(&manager, "crash"),
            Err(ControllerError::SessionEnded { .. })
        ));
        assert_eq!(manager.status().unwrap().state, SessionState::Exited);
        assert!(matches!(
            run_default(&manager, "bt"),
            Err(ControllerError::NoActiveSession)
        ));
    }

    #[test]
    fn test_missing_trace_dir() {
        let manager = SessionManager::new(fake_rr_config());
        let err = manager
            .replace(Some(Path::new("/nonexistent/rr-trace-0")))
            .unwrap_err();
        assert!(matches!(err, ControllerError::LaunchFailure(_)));
        assert!(manager.status().is_none());
    }

    #[test]
    fn test_failed_handshake_reports_diagnostics() {
        let trace = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(script_config("echo 'trace is corrupt' >&2; exit 4"));
        match manager.replace(Some(trace.path())) {
            Err(ControllerError::LaunchFailure(msg)) => {
                assert!(msg.contains("trace is corrupt"), "{msg}");
                assert!(msg.contains("exit status"), "{msg}");
            }
            other => panic!("unexpected result: {:?}", other.map(|s| s.id)),
        }
        assert!(manager.status().is_none());
    }

    #[test]
    fn test_exit() {
        let trace = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(fake_rr_config());
        manager.exit();

        let status = manager.replace(Some(trace.path())).unwrap();
        manager.exit();
        assert!(!pid_alive(status.pid));
        assert!(manager.status().is_none());
        assert!(matches!(
            run_default(&manager, "bt"),
            Err(ControllerError::NoActiveSession)
        ));
        manager.exit();
    }
}
