//! Replay session and GDB/MI record type definitions

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Well-known record class names
pub mod class {
    pub const DONE: &str = "done";
    pub const RUNNING: &str = "running";
    pub const ERROR: &str = "error";
    pub const EXIT: &str = "exit";
    pub const STOPPED: &str = "stopped";
}

/// Kind of a parsed output record, decided by its leading marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    /// `^`
    Result,
    /// `*`
    ExecAsync,
    /// `+`
    StatusAsync,
    /// `=`
    NotifyAsync,
    /// `~`
    Console,
    /// `@`
    Target,
    /// `&`
    Log,
    /// `(gdb)`
    Prompt,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Result => "result",
            RecordKind::ExecAsync => "exec-async",
            RecordKind::StatusAsync => "status-async",
            RecordKind::NotifyAsync => "notify-async",
            RecordKind::Console => "console",
            RecordKind::Target => "target",
            RecordKind::Log => "log",
            RecordKind::Prompt => "prompt",
        }
    }

    fn marker(&self) -> char {
        match self {
            RecordKind::Result => '^',
            RecordKind::ExecAsync => '*',
            RecordKind::StatusAsync => '+',
            RecordKind::NotifyAsync => '=',
            RecordKind::Console => '~',
            RecordKind::Target => '@',
            RecordKind::Log => '&',
            RecordKind::Prompt => '(',
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GDB/MI value
#[derive(Debug, Clone, PartialEq)]
pub enum MiValue {
    /// C-string constant, already unescaped
    Const(String),
    /// `{variable=value,...}`
    Tuple(MiTuple),
    /// `[value,...]`
    List(Vec<MiValue>),
    /// `[variable=value,...]`
    ResultList(Vec<MiResult>),
}

impl MiValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::Const(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&MiTuple> {
        match self {
            MiValue::Tuple(t) => Some(t),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn as_list(&self) -> Option<&[MiValue]> {
        match self {
            MiValue::List(l) => Some(l),
            _ => None,
        }
    }
}

impl Serialize for MiValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MiValue::Const(s) => serializer.serialize_str(s),
            MiValue::Tuple(t) => t.serialize(serializer),
            MiValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            MiValue::ResultList(results) => {
                let mut seq = serializer.serialize_seq(Some(results.len()))?;
                for result in results {
                    seq.serialize_element(&SingleEntry(result))?;
                }
                seq.end()
            }
        }
    }
}

struct SingleEntry<'a>(&'a MiResult);

impl Serialize for SingleEntry<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.0.variable, &self.0.value)?;
        map.end()
    }
}

impl fmt::Display for MiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiValue::Const(s) => write_c_string(f, s),
            MiValue::Tuple(t) => write!(f, "{{{}}}", t),
            MiValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            MiValue::ResultList(results) => {
                f.write_str("[")?;
                for (i, result) in results.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", result)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Write `s` as a GDB/MI C-string, escaping what the parser unescapes
fn write_c_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            '\x1b' => f.write_str("\\e")?,
            c if (c as u32) < 0x20 || c as u32 == 0x7f => write!(f, "\\{:03o}", c as u32)?,
            c => write!(f, "{}", c)?,
        }
    }
    f.write_str("\"")
}

/// GDB/MI result (variable=value pair)
#[derive(Debug, Clone, PartialEq)]
pub struct MiResult {
    pub variable: String,
    pub value: MiValue,
}

impl MiResult {
    pub fn new(variable: impl Into<String>, value: MiValue) -> Self {
        Self {
            variable: variable.into(),
            value,
        }
    }
}

impl fmt::Display for MiResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.variable, self.value)
    }
}

/// Ordered variable=value pairs. Keys may repeat, GDB does emit that.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MiTuple(pub Vec<MiResult>);

impl MiTuple {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// First value bound to `key`
    pub fn get(&self, key: &str) -> Option<&MiValue> {
        self.0.iter().find(|r| r.variable == key).map(|r| &r.value)
    }

    /// First value bound to `key`, if it is a string constant
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MiValue::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, result: MiResult) {
        self.0.push(result);
    }
}

impl Serialize for MiTuple {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for result in &self.0 {
            map.serialize_entry(&result.variable, &result.value)?;
        }
        map.end()
    }
}

impl fmt::Display for MiTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, result) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", result)?;
        }
        Ok(())
    }
}

/// One parsed line of debugger output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResponseRecord {
    Result {
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<u64>,
        class: String,
        payload: MiTuple,
    },
    ExecAsync {
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<u64>,
        class: String,
        payload: MiTuple,
    },
    StatusAsync {
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<u64>,
        class: String,
        payload: MiTuple,
    },
    NotifyAsync {
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<u64>,
        class: String,
        payload: MiTuple,
    },
    Console { text: String },
    Target { text: String },
    Log { text: String },
    Prompt,
}

impl ResponseRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            ResponseRecord::Result { .. } => RecordKind::Result,
            ResponseRecord::ExecAsync { .. } => RecordKind::ExecAsync,
            ResponseRecord::StatusAsync { .. } => RecordKind::StatusAsync,
            ResponseRecord::NotifyAsync { .. } => RecordKind::NotifyAsync,
            ResponseRecord::Console { .. } => RecordKind::Console,
            ResponseRecord::Target { .. } => RecordKind::Target,
            ResponseRecord::Log { .. } => RecordKind::Log,
            ResponseRecord::Prompt => RecordKind::Prompt,
        }
    }

    /// Class (`done`, `stopped`, `library-loaded`, ...) of result and async records
    pub fn class(&self) -> Option<&str> {
        match self {
            ResponseRecord::Result { class, .. }
            | ResponseRecord::ExecAsync { class, .. }
            | ResponseRecord::StatusAsync { class, .. }
            | ResponseRecord::NotifyAsync { class, .. } => Some(class),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&MiTuple> {
        match self {
            ResponseRecord::Result { payload, .. }
            | ResponseRecord::ExecAsync { payload, .. }
            | ResponseRecord::StatusAsync { payload, .. }
            | ResponseRecord::NotifyAsync { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn token(&self) -> Option<u64> {
        match self {
            ResponseRecord::Result { token, .. }
            | ResponseRecord::ExecAsync { token, .. }
            | ResponseRecord::StatusAsync { token, .. }
            | ResponseRecord::NotifyAsync { token, .. } => *token,
            _ => None,
        }
    }

    /// Text of stream records
    pub fn text(&self) -> Option<&str> {
        match self {
            ResponseRecord::Console { text }
            | ResponseRecord::Target { text }
            | ResponseRecord::Log { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.kind() == RecordKind::ExecAsync && self.class() == Some(class::STOPPED)
    }

    /// Stop reason carried by a `*stopped` record
    pub fn stop_reason(&self) -> Option<StopReason> {
        if !self.is_stopped() {
            return None;
        }
        let reason = self
            .payload()
            .and_then(|p| p.get_str("reason"))
            .unwrap_or("unknown");
        Some(StopReason::from(reason))
    }

    /// Frame carried by a `*stopped` record
    pub fn frame(&self) -> Option<Frame> {
        self.payload()
            .and_then(|p| p.get("frame"))
            .and_then(MiValue::as_tuple)
            .map(Frame::from_tuple)
    }
}

impl fmt::Display for ResponseRecord {
    /// Wire form of the record
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseRecord::Result { token, class, payload }
            | ResponseRecord::ExecAsync { token, class, payload }
            | ResponseRecord::StatusAsync { token, class, payload }
            | ResponseRecord::NotifyAsync { token, class, payload } => {
                if let Some(token) = token {
                    write!(f, "{}", token)?;
                }
                write!(f, "{}{}", self.kind().marker(), class)?;
                if !payload.is_empty() {
                    write!(f, ",{}", payload)?;
                }
                Ok(())
            }
            ResponseRecord::Console { text }
            | ResponseRecord::Target { text }
            | ResponseRecord::Log { text } => {
                write!(f, "{}", self.kind().marker())?;
                write_c_string(f, text)
            }
            ResponseRecord::Prompt => f.write_str("(gdb)"),
        }
    }
}

/// Stop reason types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    BreakpointHit,
    WatchpointTrigger,
    ReadWatchpointTrigger,
    AccessWatchpointTrigger,
    FunctionFinished,
    LocationReached,
    WatchpointScope,
    EndSteppingRange,
    ExitedSignalled,
    Exited,
    ExitedNormally,
    SignalReceived,
    SolibEvent,
    Fork,
    Vfork,
    SyscallEntry,
    SyscallReturn,
    /// Replay hit the start or end of the recorded history
    NoHistory,
    Unknown(String),
}

impl From<&str> for StopReason {
    fn from(s: &str) -> Self {
        match s {
            "breakpoint-hit" => StopReason::BreakpointHit,
            "watchpoint-trigger" => StopReason::WatchpointTrigger,
            "read-watchpoint-trigger" => StopReason::ReadWatchpointTrigger,
            "access-watchpoint-trigger" => StopReason::AccessWatchpointTrigger,
            "function-finished" => StopReason::FunctionFinished,
            "location-reached" => StopReason::LocationReached,
            "watchpoint-scope" => StopReason::WatchpointScope,
            "end-stepping-range" => StopReason::EndSteppingRange,
            "exited-signalled" => StopReason::ExitedSignalled,
            "exited" => StopReason::Exited,
            "exited-normally" => StopReason::ExitedNormally,
            "signal-received" => StopReason::SignalReceived,
            "solib-event" => StopReason::SolibEvent,
            "fork" => StopReason::Fork,
            "vfork" => StopReason::Vfork,
            "syscall-entry" => StopReason::SyscallEntry,
            "syscall-return" => StopReason::SyscallReturn,
            "no-history" => StopReason::NoHistory,
            other => StopReason::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Unknown(s) => f.write_str(s),
            other => {
                let name = serde_json::to_value(other)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                f.write_str(&name)
            }
        }
    }
}

/// Frame information
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u64>,
    pub addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub func: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fullname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

impl Frame {
    pub fn from_tuple(tuple: &MiTuple) -> Self {
        Frame {
            level: tuple.get_str("level").and_then(|s| s.parse().ok()),
            addr: tuple.get_str("addr").unwrap_or_default().to_string(),
            func: tuple.get_str("func").map(str::to_string),
            file: tuple.get_str("file").map(str::to_string),
            fullname: tuple.get_str("fullname").map(str::to_string),
            line: tuple.get_str("line").and_then(|s| s.parse().ok()),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.func.as_deref().unwrap_or("??"))?;
        if let (Some(file), Some(line)) = (&self.file, self.line) {
            write!(f, " at {}:{}", file, line)?;
        }
        if !self.addr.is_empty() {
            write!(f, " ({})", self.addr)?;
        }
        Ok(())
    }
}

/// Replay session liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Active,
    Exited,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: String,
    pub trace_dir: PathBuf,
    pub state: SessionState,
    pub pid: u32,
    pub commands_sent: u64,
}

/// rr launch configuration
#[derive(Debug, Clone)]
pub struct RrConfig {
    pub rr_path: String,
    /// Arguments placed before the trace directory
    pub rr_args: Vec<String>,
    /// Command sent to ask the debugger to quit
    pub exit_command: String,
    pub handshake_timeout: Duration,
    /// Default deadline for introspection commands
    pub command_timeout: Duration,
    /// Default deadline for execution-control commands
    pub execution_timeout: Duration,
    /// How long a polite exit may take before the process group is killed
    pub exit_grace: Duration,
    pub stderr_tail_lines: usize,
}

impl Default for RrConfig {
    fn default() -> Self {
        Self {
            rr_path: "rr".to_string(),
            rr_args: vec!["replay".to_string(), "-i=mi".to_string()],
            exit_command: "-gdb-exit".to_string(),
            handshake_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(600),
            exit_grace: Duration::from_secs(5),
            stderr_tail_lines: 50,
        }
    }
}

impl RrConfig {
    /// Defaults overridden by `RR_MCP_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("RR_MCP_RR_PATH") {
            if !path.is_empty() {
                config.rr_path = path;
            }
        }
        if let Some(d) = duration_from_env("RR_MCP_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout = d;
        }
        if let Some(d) = duration_from_env("RR_MCP_COMMAND_TIMEOUT_MS") {
            config.command_timeout = d;
        }
        if let Some(d) = duration_from_env("RR_MCP_EXEC_TIMEOUT_MS") {
            config.execution_timeout = d;
        }
        config
    }
}

fn duration_from_env(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}

/// rr's own default trace location, `$HOME/.local/share/rr/latest-trace`
pub fn default_trace_dir() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("rr")
            .join("latest-trace"),
    )
}
