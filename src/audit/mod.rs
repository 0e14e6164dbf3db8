//! Security audit trail.
//!
//! Tracks security-relevant behavior — prompts, responses, and guardrail
//! decisions — for forensic analysis and compliance. This is not developer
//! debug logging; records are newline-delimited JSON, one [`AuditEvent`]
//! per line.
//!
//! # Writing model
//!
//! Events go through a bounded queue drained by a single background writer
//! thread that batches up to 50 records or `flush_interval`, whichever
//! comes first. The hot path never blocks on I/O; when the queue is
//! saturated the record is written synchronously instead of being dropped,
//! and `stats.dropped` is incremented.
//!
//! # Example
//!
//! ```rust,ignore
//! use palisade::audit::{AuditTrail, AuditConfig, AuditContext, Decision};
//!
//! let audit = AuditTrail::new();
//! audit.enable(AuditConfig::default())?;
//! audit.log_prompt("hello", &AuditContext::default());
//! audit.log_decision("pii_check", Decision::Block, "PII detected", &AuditContext::default(), Some(0.9), None);
//! audit.shutdown();
//! ```

pub mod query;
pub mod redact;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use query::{QueryFilter, export_csv, export_json, query};
pub use redact::{hash_content, redact_pii};

use crate::sanitize;

/// Default queue capacity.
const DEFAULT_BUFFER_SIZE: usize = 1000;
/// Default flush interval.
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// Records per batch before an early flush.
const BATCH_SIZE: usize = 50;
/// Poll interval for the writer thread.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);
/// Bounded grace period for the writer to drain before a sync fallback.
const SEND_GRACE: Duration = Duration::from_millis(10);

/// Audit trail errors.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Cannot disable audit trail in production environment")]
    DisableInProduction,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A guardrail decision as recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Block,
    Warn,
    Allow,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Block => write!(f, "block"),
            Decision::Warn => write!(f, "warn"),
            Decision::Allow => write!(f, "allow"),
        }
    }
}

/// Correlation fields shared by audit events.
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
}

impl AuditContext {
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }
}

/// One audit record. Serialized as a single JSON object per line, tagged by
/// `event_type`. Timestamps are RFC3339 UTC with a trailing `Z`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    UserPrompt {
        timestamp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        prompt: String,
        /// SHA-256 of the original content, present when redaction changed it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_sha256: Option<String>,
    },
    LlmResponse {
        timestamp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        response: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_used: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        processing_time_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_sha256: Option<String>,
    },
    GuardrailDecision {
        timestamp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        guardrail_name: String,
        decision: Decision,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_triggered: Option<String>,
    },
    AuditTrailEnabled {
        timestamp: String,
        destination: String,
        redact_pii: bool,
        buffer_size: usize,
        flush_interval_secs: f64,
    },
}

impl AuditEvent {
    /// Stable event type name, matching the serialized `event_type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::UserPrompt { .. } => "user_prompt",
            AuditEvent::LlmResponse { .. } => "llm_response",
            AuditEvent::GuardrailDecision { .. } => "guardrail_decision",
            AuditEvent::AuditTrailEnabled { .. } => "audit_trail_enabled",
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            AuditEvent::UserPrompt { timestamp, .. }
            | AuditEvent::LlmResponse { timestamp, .. }
            | AuditEvent::GuardrailDecision { timestamp, .. }
            | AuditEvent::AuditTrailEnabled { timestamp, .. } => timestamp,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            AuditEvent::UserPrompt { user_id, .. }
            | AuditEvent::LlmResponse { user_id, .. }
            | AuditEvent::GuardrailDecision { user_id, .. } => user_id.as_deref(),
            AuditEvent::AuditTrailEnabled { .. } => None,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            AuditEvent::UserPrompt {
                conversation_id, ..
            }
            | AuditEvent::LlmResponse {
                conversation_id, ..
            }
            | AuditEvent::GuardrailDecision {
                conversation_id, ..
            } => conversation_id.as_deref(),
            AuditEvent::AuditTrailEnabled { .. } => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            AuditEvent::UserPrompt { request_id, .. }
            | AuditEvent::LlmResponse { request_id, .. }
            | AuditEvent::GuardrailDecision { request_id, .. } => request_id.as_deref(),
            AuditEvent::AuditTrailEnabled { .. } => None,
        }
    }
}

/// Where audit records are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
}

impl Destination {
    /// `"stdout"` maps to console output; anything else is a file path.
    pub fn parse(s: &str) -> Self {
        if s == "stdout" {
            Destination::Stdout
        } else {
            Destination::File(PathBuf::from(s))
        }
    }

    fn describe(&self) -> String {
        match self {
            Destination::Stdout => "stdout".to_string(),
            Destination::File(path) => path.display().to_string(),
        }
    }
}

/// Audit trail configuration. Unset fields take smart defaults from the
/// environment: stdout + no redaction in development, `./audit.log` +
/// redaction in production.
#[derive(Debug, Clone, Default)]
pub struct AuditConfig {
    pub destinations: Option<Vec<Destination>>,
    pub redact_pii: Option<bool>,
    pub buffer_size: Option<usize>,
    pub flush_interval: Option<Duration>,
}

impl AuditConfig {
    /// Configuration writing to a single destination string (`"stdout"` or
    /// a file path).
    pub fn destination(dest: &str) -> Self {
        Self {
            destinations: Some(vec![Destination::parse(dest)]),
            ..Default::default()
        }
    }

    pub fn with_redact_pii(mut self, redact: bool) -> Self {
        self.redact_pii = Some(redact);
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditStats {
    pub queued: u64,
    pub written: u64,
    pub dropped: u64,
    pub queue_size: usize,
}

enum Sink {
    Stdout,
    File(std::fs::File),
}

impl Sink {
    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        match self {
            Sink::Stdout => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                writeln!(lock, "{line}")?;
                lock.flush()
            }
            Sink::File(file) => {
                writeln!(file, "{line}")?;
                file.flush()
            }
        }
    }
}

struct Active {
    sender: Sender<AuditEvent>,
    sinks: Arc<Mutex<Vec<Sink>>>,
    writer: Option<JoinHandle<()>>,
    redact: bool,
    destinations: Vec<Destination>,
}

#[derive(Default)]
struct Stats {
    queued: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
}

struct Inner {
    active: RwLock<Option<Active>>,
    stats: Stats,
}

/// Handle to an audit trail. Cloning shares the underlying state.
#[derive(Clone)]
pub struct AuditTrail {
    inner: Arc<Inner>,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrail {
    /// Creates a disabled audit trail.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                active: RwLock::new(None),
                stats: Stats::default(),
            }),
        }
    }

    /// Enables the audit trail. Enabling an already-enabled trail is a
    /// no-op.
    pub fn enable(&self, config: AuditConfig) -> Result<(), AuditError> {
        let mut active = self.inner.active.write();
        if active.is_some() {
            return Ok(());
        }

        let destinations = config
            .destinations
            .unwrap_or_else(smart_default_destinations);
        let redact = config.redact_pii.unwrap_or_else(smart_default_redaction);
        let buffer_size = config.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let flush_interval = config.flush_interval.unwrap_or(DEFAULT_FLUSH_INTERVAL);

        let sinks = Arc::new(Mutex::new(open_sinks(&destinations)));
        let (sender, receiver) = crossbeam_channel::bounded(buffer_size);

        let writer_sinks = sinks.clone();
        let writer_inner = self.inner.clone();
        let writer = std::thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || background_writer(receiver, writer_sinks, writer_inner, flush_interval))?;

        *active = Some(Active {
            sender,
            sinks,
            writer: Some(writer),
            redact,
            destinations: destinations.clone(),
        });
        drop(active);

        let destination_desc = destinations
            .iter()
            .map(Destination::describe)
            .collect::<Vec<_>>()
            .join(",");
        self.submit(AuditEvent::AuditTrailEnabled {
            timestamp: now_rfc3339(),
            destination: destination_desc,
            redact_pii: redact,
            buffer_size,
            flush_interval_secs: flush_interval.as_secs_f64(),
        });

        Ok(())
    }

    /// True when enabled.
    pub fn is_enabled(&self) -> bool {
        self.inner.active.read().is_some()
    }

    /// Disables the audit trail. Only allowed in development.
    pub fn disable(&self) -> Result<(), AuditError> {
        if sanitize::is_production() {
            return Err(AuditError::DisableInProduction);
        }
        self.shutdown();
        Ok(())
    }

    /// Drains the queue, flushes every sink, and stops the writer thread.
    /// Safe to call at process shutdown in any environment.
    pub fn shutdown(&self) {
        let taken = self.inner.active.write().take();
        if let Some(mut active) = taken {
            // Dropping the sender disconnects the channel; the writer
            // flushes its final batch and exits.
            drop(active.sender);
            if let Some(handle) = active.writer.take()
                && handle.join().is_err()
            {
                tracing::warn!("audit writer thread panicked during shutdown");
            }
        }
    }

    /// Records a user prompt.
    pub fn log_prompt(&self, prompt: &str, ctx: &AuditContext) {
        let Some(redact) = self.redaction_enabled() else {
            return;
        };
        let (text, hash) = maybe_redact(prompt, redact);
        self.submit(AuditEvent::UserPrompt {
            timestamp: now_rfc3339(),
            request_id: ctx.request_id.clone(),
            user_id: ctx.user_id.clone(),
            session_id: ctx.session_id.clone(),
            conversation_id: ctx.conversation_id.clone(),
            prompt: text,
            content_sha256: hash,
        });
    }

    /// Records a model response.
    pub fn log_response(
        &self,
        response: &str,
        ctx: &AuditContext,
        model_used: Option<&str>,
        processing_time_ms: Option<u64>,
    ) {
        let Some(redact) = self.redaction_enabled() else {
            return;
        };
        let (text, hash) = maybe_redact(response, redact);
        self.submit(AuditEvent::LlmResponse {
            timestamp: now_rfc3339(),
            request_id: ctx.request_id.clone(),
            user_id: ctx.user_id.clone(),
            conversation_id: ctx.conversation_id.clone(),
            response: text,
            model_used: model_used.map(str::to_string),
            processing_time_ms,
            content_sha256: hash,
        });
    }

    /// Records a guardrail security decision.
    pub fn log_decision(
        &self,
        guardrail_name: &str,
        decision: Decision,
        reason: &str,
        ctx: &AuditContext,
        confidence: Option<f64>,
        rule_triggered: Option<&str>,
    ) {
        if !self.is_enabled() {
            return;
        }
        self.submit(AuditEvent::GuardrailDecision {
            timestamp: now_rfc3339(),
            request_id: ctx.request_id.clone(),
            user_id: ctx.user_id.clone(),
            conversation_id: ctx.conversation_id.clone(),
            guardrail_name: guardrail_name.to_string(),
            decision,
            reason: reason.to_string(),
            confidence,
            rule_triggered: rule_triggered.map(str::to_string),
        });
    }

    /// Current queue statistics.
    pub fn stats(&self) -> AuditStats {
        let queue_size = self
            .inner
            .active
            .read()
            .as_ref()
            .map(|a| a.sender.len())
            .unwrap_or(0);
        AuditStats {
            queued: self.inner.stats.queued.load(Ordering::Relaxed),
            written: self.inner.stats.written.load(Ordering::Relaxed),
            dropped: self.inner.stats.dropped.load(Ordering::Relaxed),
            queue_size,
        }
    }

    /// The destinations currently in use, if enabled.
    pub fn destinations(&self) -> Vec<Destination> {
        self.inner
            .active
            .read()
            .as_ref()
            .map(|a| a.destinations.clone())
            .unwrap_or_default()
    }

    fn redaction_enabled(&self) -> Option<bool> {
        self.inner.active.read().as_ref().map(|a| a.redact)
    }

    fn submit(&self, event: AuditEvent) {
        let active = self.inner.active.read();
        let Some(active) = active.as_ref() else {
            return;
        };

        match active.sender.try_send(event) {
            Ok(()) => {
                self.inner.stats.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(event)) => {
                // Give the writer a bounded chance to drain before falling
                // back to a synchronous write, preserving submission order
                // in the common case.
                match active.sender.send_timeout(event, SEND_GRACE) {
                    Ok(()) => {
                        self.inner.stats.queued.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        let event = err.into_inner();
                        write_event_sync(&active.sinks, &event, &self.inner.stats);
                        self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn maybe_redact(text: &str, redact: bool) -> (String, Option<String>) {
    if !redact {
        return (text.to_string(), None);
    }
    let redacted = redact_pii(text);
    if redacted == text {
        (redacted, None)
    } else {
        let hash = hash_content(text);
        (redacted, Some(hash))
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn smart_default_destinations() -> Vec<Destination> {
    if sanitize::is_production() {
        vec![Destination::File(PathBuf::from("./audit.log"))]
    } else {
        vec![Destination::Stdout]
    }
}

fn smart_default_redaction() -> bool {
    sanitize::is_production()
}

fn open_sinks(destinations: &[Destination]) -> Vec<Sink> {
    let mut sinks = Vec::new();
    for destination in destinations {
        match destination {
            Destination::Stdout => sinks.push(Sink::Stdout),
            Destination::File(path) => match open_file_sink(path) {
                Ok(sink) => sinks.push(sink),
                Err(e) => {
                    let safe_path = sanitize::sanitize_path(&path.display().to_string());
                    tracing::warn!(
                        path = %safe_path,
                        error = %e,
                        "failed to open audit log file; falling back to stdout"
                    );
                    sinks.push(Sink::Stdout);
                }
            },
        }
    }
    sinks
}

fn open_file_sink(path: &Path) -> std::io::Result<Sink> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Sink::File(file))
}

fn write_event_sync(sinks: &Arc<Mutex<Vec<Sink>>>, event: &AuditEvent, stats: &Stats) {
    let Ok(line) = serde_json::to_string(event) else {
        return;
    };
    let mut sinks = sinks.lock();
    let mut wrote = false;
    for sink in sinks.iter_mut() {
        if sink.write_line(&line).is_ok() {
            wrote = true;
        }
    }
    if wrote {
        stats.written.fetch_add(1, Ordering::Relaxed);
    }
}

fn background_writer(
    receiver: Receiver<AuditEvent>,
    sinks: Arc<Mutex<Vec<Sink>>>,
    inner: Arc<Inner>,
    flush_interval: Duration,
) {
    let mut batch: Vec<AuditEvent> = Vec::new();
    let mut last_flush = Instant::now();

    loop {
        let disconnected = match receiver.recv_timeout(RECV_TIMEOUT) {
            Ok(event) => {
                batch.push(event);
                false
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => false,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => true,
        };

        let should_flush = batch.len() >= BATCH_SIZE
            || (!batch.is_empty() && last_flush.elapsed() >= flush_interval)
            || disconnected;

        if should_flush && !batch.is_empty() {
            flush_batch(&sinks, &batch, &inner.stats);
            batch.clear();
            last_flush = Instant::now();
        }

        if disconnected {
            break;
        }
    }
}

fn flush_batch(sinks: &Arc<Mutex<Vec<Sink>>>, batch: &[AuditEvent], stats: &Stats) {
    let mut sinks = sinks.lock();
    for event in batch {
        let Ok(line) = serde_json::to_string(event) else {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        let mut wrote = false;
        for sink in sinks.iter_mut() {
            if sink.write_line(&line).is_ok() {
                wrote = true;
            }
        }
        if wrote {
            stats.written.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

static GLOBAL_AUDIT: once_cell::sync::Lazy<RwLock<AuditTrail>> =
    once_cell::sync::Lazy::new(|| RwLock::new(AuditTrail::new()));

/// Process-wide audit trail handle.
pub fn global_audit() -> AuditTrail {
    GLOBAL_AUDIT.read().clone()
}

/// Replaces the process-wide audit trail; returns the previous instance.
/// Tests use this to substitute a fresh trail.
pub fn set_global_audit(trail: AuditTrail) -> AuditTrail {
    std::mem::replace(&mut *GLOBAL_AUDIT.write(), trail)
}
