//! JSONL audit logging for remote tool calls.
//!
//! Every `call-tool` a protocol peer makes is logged as a single line in
//! `{config_dir}/audit-logs/YYYY-MM-DD.jsonl`. Best-effort: never panics or
//! fails the caller.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

#[derive(Serialize)]
struct ToolAuditEntry<'a> {
    ts: u64,
    session_id: &'a str,
    sequence: Option<u64>,
    tool: &'a str,
    input: &'a Value,
    ok: bool,
    message: &'a str,
    duration_ms: u64,
}

/// One finished tool call, as handed to [`log_tool_call`].
pub struct ToolCallRecord<'a> {
    pub session_id: &'a str,
    pub sequence: Option<u64>,
    pub tool: &'a str,
    pub input: &'a Value,
    pub result: Result<&'a str, &'a str>,
    pub duration: Duration,
}

/// Append a tool call to today's JSONL audit file under `config_dir`.
pub fn log_tool_call(config_dir: &Path, record: &ToolCallRecord<'_>) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let (ok, message) = match record.result {
        Ok(msg) => (true, msg),
        Err(e) => (false, e),
    };

    let entry = ToolAuditEntry {
        ts: now,
        session_id: record.session_id,
        sequence: record.sequence,
        tool: record.tool,
        input: record.input,
        ok,
        message,
        duration_ms: u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX),
    };

    let dir = crate::paths::audit_logs_dir(config_dir);
    if let Err(e) = fs::create_dir_all(&dir) {
        tracing::debug!(error = %e, dir = %dir.display(), "audit log directory unavailable");
        return;
    }

    let path = dir.join(format!("{}.jsonl", date_from_epoch(now)));
    if let Ok(json) = serde_json::to_string(&entry) {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
            let _ = writeln!(file, "{json}");
        }
    }
}

/// Format epoch seconds as `YYYY-MM-DD` without external deps.
#[allow(clippy::unreadable_literal, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn date_from_epoch(epoch_secs: u64) -> String {
    // Civil date from day count (Howard Hinnant)
    let days = (epoch_secs / 86400) as i64;
    let z = days + 719468;
    let era = (if z >= 0 { z } else { z - 146096 }) / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = (yoe as i64) + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn dates_from_epoch() {
        assert_eq!(date_from_epoch(1_740_355_200), "2025-02-24");
        assert_eq!(date_from_epoch(0), "1970-01-01");
        assert_eq!(date_from_epoch(946_684_800), "2000-01-01");
        assert_eq!(date_from_epoch(1_740_355_200 + 86399), "2025-02-24");
    }

    #[test]
    fn tool_call_is_appended_as_one_line() {
        let dir = std::env::temp_dir().join("edit_bridge_test_audit");
        let _ = fs::remove_dir_all(&dir);
        let input = serde_json::json!({ "position": 5 });
        for sequence in [1, 2] {
            log_tool_call(
                &dir,
                &ToolCallRecord {
                    session_id: "s-1",
                    sequence: Some(sequence),
                    tool: "cut-clip",
                    input: &input,
                    result: Ok("Cut Interview A"),
                    duration: Duration::from_millis(3),
                },
            );
        }

        let logs = crate::paths::audit_logs_dir(&dir);
        let file = fs::read_dir(&logs).unwrap().next().unwrap().unwrap().path();
        let text = fs::read_to_string(file).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["sequence"], 2);
        assert_eq!(lines[0]["tool"], "cut-clip");
        assert_eq!(lines[0]["ok"], true);

        let _ = fs::remove_dir_all(&dir);
    }
}
