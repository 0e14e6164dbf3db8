//! Audit log querying and compliance exports.
//!
//! Loads newline-delimited JSON audit logs, filters by correlation fields
//! and time windows, and emits CSV or JSON compliance reports from the same
//! filter set. Invalid lines are skipped, never fatal.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use super::AuditEvent;

/// Summary column truncation length for CSV exports.
const SUMMARY_LENGTH: usize = 100;

/// Filters applied by [`query`] and both exporters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Matches the serialized `event_type` tag, e.g. `"guardrail_decision"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Keep only events from the last hour. Overrides start/end times.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub last_hour: bool,
}

impl QueryFilter {
    pub fn conversation(id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn event_type(kind: impl Into<String>) -> Self {
        Self {
            event_type: Some(kind.into()),
            ..Default::default()
        }
    }

    fn matches(&self, event: &AuditEvent, now: DateTime<Utc>) -> bool {
        if let Some(id) = &self.conversation_id
            && event.conversation_id() != Some(id.as_str())
        {
            return false;
        }
        if let Some(id) = &self.user_id
            && event.user_id() != Some(id.as_str())
        {
            return false;
        }
        if let Some(kind) = &self.event_type
            && event.kind() != kind
        {
            return false;
        }

        let timestamp = DateTime::parse_from_rfc3339(event.timestamp())
            .map(|t| t.with_timezone(&Utc))
            .ok();

        if self.last_hour {
            let Some(timestamp) = timestamp else {
                return false;
            };
            return timestamp >= now - chrono::Duration::hours(1);
        }

        if let Some(start) = self.start_time {
            match timestamp {
                Some(t) if t >= start => {}
                _ => return false,
            }
        }
        if let Some(end) = self.end_time {
            match timestamp {
                Some(t) if t <= end => {}
                _ => return false,
            }
        }
        true
    }
}

/// Loads an audit log file and returns the records matching the filter, in
/// file order. Unparseable lines are skipped.
pub fn query(destination: &Path, filter: &QueryFilter) -> std::io::Result<Vec<AuditEvent>> {
    let raw = std::fs::read_to_string(destination)?;
    let now = Utc::now();

    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<AuditEvent>(line.trim()).ok())
        .filter(|event| filter.matches(event, now))
        .collect())
}

/// Exports matching records to CSV for compliance reporting. Returns the
/// number of records exported.
pub fn export_csv(
    destination: &Path,
    output: &Path,
    filter: &QueryFilter,
) -> std::io::Result<usize> {
    let records = query(destination, filter)?;

    let mut writer = csv::Writer::from_path(output).map_err(std::io::Error::other)?;
    writer
        .write_record([
            "timestamp",
            "event_type",
            "user_id",
            "conversation_id",
            "request_id",
            "guardrail_name",
            "decision",
            "reason",
            "confidence",
            "summary",
        ])
        .map_err(std::io::Error::other)?;

    for event in &records {
        let (guardrail_name, decision, reason, confidence) = match event {
            AuditEvent::GuardrailDecision {
                guardrail_name,
                decision,
                reason,
                confidence,
                ..
            } => (
                guardrail_name.clone(),
                decision.to_string(),
                reason.clone(),
                confidence.map(|c| c.to_string()).unwrap_or_default(),
            ),
            _ => (String::new(), String::new(), String::new(), String::new()),
        };

        writer
            .write_record([
                event.timestamp().to_string(),
                event.kind().to_string(),
                event.user_id().unwrap_or_default().to_string(),
                event.conversation_id().unwrap_or_default().to_string(),
                event.request_id().unwrap_or_default().to_string(),
                guardrail_name,
                decision,
                reason,
                confidence,
                summarize(event),
            ])
            .map_err(std::io::Error::other)?;
    }
    writer.flush()?;
    Ok(records.len())
}

#[derive(Serialize)]
struct JsonExport<'a> {
    export_timestamp: String,
    filter: &'a QueryFilter,
    source_file: String,
    total_records: usize,
    records: Vec<AuditEvent>,
}

/// Exports matching records to a JSON envelope with export metadata.
/// Returns the number of records exported.
pub fn export_json(
    destination: &Path,
    output: &Path,
    filter: &QueryFilter,
    pretty: bool,
) -> std::io::Result<usize> {
    let records = query(destination, filter)?;
    let total = records.len();

    let export = JsonExport {
        export_timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        filter,
        source_file: destination.display().to_string(),
        total_records: total,
        records,
    };

    let body = if pretty {
        serde_json::to_string_pretty(&export)
    } else {
        serde_json::to_string(&export)
    }
    .map_err(std::io::Error::other)?;

    std::fs::write(output, body)?;
    Ok(total)
}

fn summarize(event: &AuditEvent) -> String {
    match event {
        AuditEvent::UserPrompt { prompt, .. } => truncate(prompt),
        AuditEvent::LlmResponse { response, .. } => truncate(response),
        AuditEvent::GuardrailDecision {
            guardrail_name,
            decision,
            ..
        } => format!("{guardrail_name}: {decision}"),
        AuditEvent::AuditTrailEnabled { destination, .. } => {
            format!("audit enabled -> {destination}")
        }
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() > SUMMARY_LENGTH {
        let prefix: String = text.chars().take(SUMMARY_LENGTH).collect();
        format!("{prefix}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audit::{AuditConfig, AuditContext, AuditTrail, Decision, Destination};

    fn populated_log(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("audit.log");
        let trail = AuditTrail::new();
        trail
            .enable(AuditConfig {
                destinations: Some(vec![Destination::File(path.clone())]),
                redact_pii: Some(false),
                buffer_size: Some(64),
                flush_interval: Some(Duration::from_millis(20)),
            })
            .unwrap();

        let ctx_a = AuditContext::default()
            .with_user_id("alice")
            .with_conversation_id("conv-a");
        let ctx_b = AuditContext::default()
            .with_user_id("bob")
            .with_conversation_id("conv-b");

        trail.log_prompt("hello from alice", &ctx_a);
        trail.log_response("hi alice", &ctx_a, Some("gpt-4o-mini"), Some(120));
        trail.log_decision("kw", Decision::Block, "keyword matched", &ctx_a, Some(1.0), None);
        trail.log_prompt("hello from bob", &ctx_b);
        trail.shutdown();
        path
    }

    #[test]
    fn test_query_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = populated_log(&dir);
        let records = query(&path, &QueryFilter::default()).unwrap();
        // enable + 4 logged events
        assert_eq!(records.len(), 5);
    }

    #[test]
    fn test_query_by_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let path = populated_log(&dir);
        let records = query(&path, &QueryFilter::conversation("conv-a")).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.conversation_id() == Some("conv-a")));
    }

    #[test]
    fn test_query_by_user_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = populated_log(&dir);

        let records = query(&path, &QueryFilter::user("bob")).unwrap();
        assert_eq!(records.len(), 1);

        let records = query(&path, &QueryFilter::event_type("guardrail_decision")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind(), "guardrail_decision");
    }

    #[test]
    fn test_query_last_hour_includes_fresh_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = populated_log(&dir);
        let filter = QueryFilter {
            last_hour: true,
            ..Default::default()
        };
        let records = query(&path, &filter).unwrap();
        assert_eq!(records.len(), 5);
    }

    #[test]
    fn test_query_time_window_excludes_everything_in_past_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = populated_log(&dir);
        let filter = QueryFilter {
            end_time: Some(Utc::now() - chrono::Duration::hours(2)),
            ..Default::default()
        };
        let records = query(&path, &filter).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_invalid_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        std::fs::write(
            &path,
            "not json\n{\"event_type\":\"user_prompt\",\"timestamp\":\"2026-01-01T00:00:00Z\",\"prompt\":\"ok\"}\n{broken\n",
        )
        .unwrap();
        let records = query(&path, &QueryFilter::default()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_export_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = populated_log(&dir);
        let out = dir.path().join("export.csv");

        let count = export_csv(&path, &out, &QueryFilter::default()).unwrap();
        assert_eq!(count, 5);

        let body = std::fs::read_to_string(&out).unwrap();
        let mut lines = body.lines();
        assert!(lines.next().unwrap().starts_with("timestamp,event_type"));
        assert_eq!(lines.count(), 5);
        assert!(body.contains("kw: block"));
    }

    #[test]
    fn test_export_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = populated_log(&dir);
        let out = dir.path().join("export.json");

        let count = export_json(&path, &out, &QueryFilter::default(), true).unwrap();
        let body: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(body["total_records"].as_u64().unwrap() as usize, count);
        assert_eq!(body["records"].as_array().unwrap().len(), count);
        assert!(body["export_timestamp"].as_str().unwrap().ends_with('Z'));
    }
}
