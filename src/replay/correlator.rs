//! Command/response correlation
//!
//! The session's reader thread hands every parsed record to a [`RecordSink`].
//! While a [`PendingWait`] is registered the records go through a channel to
//! that wait; otherwise they are logged and dropped, so an idle session never
//! builds a backlog. Waits on the same session are served one at a time.
//!
//! Commands are sent with a numeric token and a wait only accepts result
//! records carrying its own token, so a reply that shows up after its
//! command gave up is never taken for the next command's.

use crate::replay::error::ControllerError;
use crate::replay::types::{class, RecordKind, ResponseRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// What the reader thread delivers
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Record(ResponseRecord),
    /// stdout closed or the session was torn down
    Ended,
}

/// One acceptable shape of a completion record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMatcher {
    pub kind: RecordKind,
    pub class: Option<String>,
    pub except_class: Option<String>,
    /// Payload field that must hold this exact string
    pub field: Option<(String, String)>,
}

impl RecordMatcher {
    pub fn kind(kind: RecordKind) -> Self {
        Self {
            kind,
            class: None,
            except_class: None,
            field: None,
        }
    }

    pub fn class(kind: RecordKind, class: impl Into<String>) -> Self {
        Self {
            class: Some(class.into()),
            ..Self::kind(kind)
        }
    }

    pub fn except_class(mut self, class: impl Into<String>) -> Self {
        self.except_class = Some(class.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.field = Some((key.into(), value.into()));
        self
    }

    pub fn matches(&self, record: &ResponseRecord) -> bool {
        if record.kind() != self.kind {
            return false;
        }
        if let Some(expected) = &self.class {
            if record.class() != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(excluded) = &self.except_class {
            if record.class() == Some(excluded.as_str()) {
                return false;
            }
        }
        if let Some((key, value)) = &self.field {
            let actual = record.payload().and_then(|p| p.get_str(key));
            if actual != Some(value.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Condition over incoming records that marks a command as finished.
/// Satisfied when any of its matchers matches.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionPredicate {
    matchers: Vec<RecordMatcher>,
}

/// CLI commands that resume the replay and only settle on `*stopped`
const EXECUTION_COMMANDS: &[&str] = &[
    "c", "cont", "continue", "fg", "s", "step", "n", "next", "si", "stepi", "ni", "nexti",
    "fin", "finish", "u", "until", "advance", "r", "run", "start", "starti", "jump",
    "reverse-continue", "rc", "reverse-step", "rs", "reverse-next", "rn", "reverse-stepi", "rsi",
    "reverse-nexti", "rni", "reverse-finish", "rf",
];

/// `-exec-*` commands that answer immediately
const IMMEDIATE_EXEC_COMMANDS: &[&str] = &["-exec-interrupt", "-exec-arguments"];

impl CompletionPredicate {
    pub fn any(matchers: Vec<RecordMatcher>) -> Self {
        Self { matchers }
    }

    /// Ready prompt printed once the debugger is attached
    pub fn prompt() -> Self {
        Self::any(vec![RecordMatcher::kind(RecordKind::Prompt)])
    }

    /// Any result record, including `^running`
    pub fn result() -> Self {
        Self::any(vec![RecordMatcher::kind(RecordKind::Result)])
    }

    /// `*stopped`, or a result that means the command will never stop
    pub fn stopped() -> Self {
        Self::any(vec![
            RecordMatcher::class(RecordKind::ExecAsync, class::STOPPED),
            RecordMatcher::class(RecordKind::Result, class::ERROR),
            RecordMatcher::class(RecordKind::Result, class::EXIT),
        ])
    }

    /// `*stopped,reason=<reason>` only
    pub fn stopped_because(reason: &str) -> Self {
        Self::any(vec![
            RecordMatcher::class(RecordKind::ExecAsync, class::STOPPED).with_field("reason", reason)
        ])
    }

    /// First settled result, or a stop for commands that turned out to resume
    pub fn introspection() -> Self {
        Self::any(vec![
            RecordMatcher::kind(RecordKind::Result).except_class(class::RUNNING),
            RecordMatcher::class(RecordKind::ExecAsync, class::STOPPED),
        ])
    }

    /// Default policy for a command line
    pub fn for_command(command: &str) -> Self {
        if is_execution_command(command) {
            Self::stopped()
        } else {
            Self::introspection()
        }
    }

    pub fn matches(&self, record: &ResponseRecord) -> bool {
        self.matchers.iter().any(|m| m.matches(record))
    }
}

/// Whether `command` resumes the replay
pub fn is_execution_command(command: &str) -> bool {
    let head = command.split_whitespace().next().unwrap_or_default();
    // Strip an MI token such as `12-exec-continue`
    let head = head.trim_start_matches(|c: char| c.is_ascii_digit());
    if head.starts_with("-exec-") {
        return !IMMEDIATE_EXEC_COMMANDS.contains(&head);
    }
    EXECUTION_COMMANDS.contains(&head)
}

/// Create the two ends of a session's record stream.
///
/// The correlator starts out listening so that nothing printed before the
/// first wait (the ready prompt in particular) is lost.
pub fn channel() -> (RecordSink, Correlator) {
    let (tx, rx) = mpsc::channel();
    let listening = Arc::new(AtomicBool::new(true));
    let sink = RecordSink {
        tx,
        listening: Arc::clone(&listening),
    };
    let correlator = Correlator {
        rx: Mutex::new(rx),
        ended: AtomicBool::new(false),
        listening,
    };
    (sink, correlator)
}

/// Producing side of a session's record stream
#[derive(Debug, Clone)]
pub struct RecordSink {
    tx: Sender<StreamEvent>,
    listening: Arc<AtomicBool>,
}

impl RecordSink {
    /// Hand a record to the waiting command, or log it when nobody waits.
    /// Returns false once the receiving side is gone.
    pub fn deliver(&self, record: ResponseRecord) -> bool {
        if self.listening.load(Ordering::SeqCst) {
            self.tx.send(StreamEvent::Record(record)).is_ok()
        } else {
            debug!("Unsolicited record: {}", record);
            true
        }
    }

    /// Mark the end of the stream; always delivered
    pub fn end(&self) {
        let _ = self.tx.send(StreamEvent::Ended);
    }
}

/// Receiving side of a session's record stream
pub struct Correlator {
    rx: Mutex<Receiver<StreamEvent>>,
    ended: AtomicBool,
    listening: Arc<AtomicBool>,
}

impl Correlator {
    /// Claim the stream for one command, queueing behind any wait in flight
    pub fn begin(&self) -> PendingWait<'_> {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        self.listening.store(true, Ordering::SeqCst);
        PendingWait {
            rx,
            ended: &self.ended,
            listening: &self.listening,
        }
    }

    /// Block until `predicate` matches, the session ends, or `timeout` passes
    pub fn await_records(
        &self,
        predicate: &CompletionPredicate,
        timeout: Duration,
    ) -> Result<Vec<ResponseRecord>, ControllerError> {
        self.begin().wait(predicate, timeout)
    }
}

/// Exclusive claim on a session's record stream
pub struct PendingWait<'a> {
    rx: MutexGuard<'a, Receiver<StreamEvent>>,
    ended: &'a AtomicBool,
    listening: &'a AtomicBool,
}

impl PendingWait<'_> {
    /// Log and discard records that arrived before this command was sent.
    /// Returns how many were drained.
    pub fn drain_unsolicited(&mut self) -> usize {
        let mut drained = 0;
        loop {
            match self.rx.try_recv() {
                Ok(StreamEvent::Record(record)) => {
                    drained += 1;
                    debug!("Unsolicited record: {}", record);
                }
                Ok(StreamEvent::Ended) | Err(TryRecvError::Disconnected) => {
                    self.ended.store(true, Ordering::SeqCst);
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        drained
    }

    /// Consume records until one satisfies `predicate`
    pub fn wait(
        self,
        predicate: &CompletionPredicate,
        timeout: Duration,
    ) -> Result<Vec<ResponseRecord>, ControllerError> {
        self.collect(None, predicate, timeout)
    }

    /// Like [`wait`](Self::wait), for the command sent with `token`.
    ///
    /// Result records with any other token are replies to earlier commands
    /// and are skipped. So is a `*stopped` that comes before this command's
    /// own `^running`.
    pub fn wait_for_reply(
        self,
        token: u64,
        predicate: &CompletionPredicate,
        timeout: Duration,
    ) -> Result<Vec<ResponseRecord>, ControllerError> {
        self.collect(Some(token), predicate, timeout)
    }

    fn collect(
        self,
        token: Option<u64>,
        predicate: &CompletionPredicate,
        timeout: Duration,
    ) -> Result<Vec<ResponseRecord>, ControllerError> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();
        let mut resumed = token.is_none();

        if self.ended.load(Ordering::SeqCst) {
            return Err(ControllerError::SessionEnded { records });
        }

        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!(
                    "Wait timed out after {:?} with {} record(s)",
                    timeout,
                    records.len()
                );
                return Err(ControllerError::Timeout { timeout, records });
            }

            match self.rx.recv_timeout(deadline - now) {
                Ok(StreamEvent::Record(record)) => {
                    if let Some(expected) = token {
                        if record.kind() == RecordKind::Result {
                            if record.token() != Some(expected) {
                                debug!("Reply to an earlier command: {}", record);
                                continue;
                            }
                            if record.class() == Some(class::RUNNING) {
                                resumed = true;
                            }
                        } else if record.is_stopped() && !resumed {
                            debug!("Stop left over from an earlier command: {}", record);
                            continue;
                        }
                    }

                    let done = predicate.matches(&record);
                    records.push(record);
                    if done {
                        debug!("Completion record received after {} record(s)", records.len());
                        return Ok(records);
                    }
                }
                Ok(StreamEvent::Ended) | Err(RecvTimeoutError::Disconnected) => {
                    self.ended.store(true, Ordering::SeqCst);
                    return Err(ControllerError::SessionEnded { records });
                }
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        self.listening.store(false, Ordering::SeqCst);
    }
}
