//! Remote payload → transient projection conversion.
//!
//! Conversion failures are reported as strings; callers wrap them in the
//! collected error taxonomy so one bad payload never sinks a listing.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use prm_schemas::{CheckConclusion, CheckStatus, DiscoveredCheckRun, DiscoveredPr, PrState};

fn required_str(item: &Value, key: &str) -> Result<String, String> {
    item.get(key)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| format!("missing field '{key}'"))
}

fn required_timestamp(item: &Value, key: &str) -> Result<DateTime<Utc>, String> {
    let raw = item
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing field '{key}'"))?;
    parse_timestamp(raw).ok_or_else(|| format!("invalid timestamp in '{key}': {raw}"))
}

fn optional_timestamp(item: &Value, key: &str) -> Option<DateTime<Utc>> {
    item.get(key).and_then(|v| v.as_str()).and_then(parse_timestamp)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn login_list(item: &Value, key: &str) -> Vec<String> {
    item.get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|entry| entry.get("login").and_then(|l| l.as_str()))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Project one PR payload. The remote reports `open`/`closed` plus a
/// `merged_at` stamp; a closed PR with a merge timestamp is `merged`.
pub(crate) fn convert_pr(item: &Value) -> Result<DiscoveredPr, String> {
    let pr_number = item
        .get("number")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| "missing field 'number'".to_string())? as i32;

    let merged_at = optional_timestamp(item, "merged_at");
    let state = match item.get("state").and_then(|v| v.as_str()) {
        Some("open") => PrState::Opened,
        Some("closed") if merged_at.is_some() => PrState::Merged,
        Some("closed") => PrState::Closed,
        other => return Err(format!("unrecognised pr state {other:?}")),
    };

    let base = item.get("base").ok_or("missing field 'base'")?;
    let head = item.get("head").ok_or("missing field 'head'")?;

    let metadata = json!({
        "github_id": item.get("id"),
        "node_id": item.get("node_id"),
        "assignees": login_list(item, "assignees"),
        "reviewers": login_list(item, "requested_reviewers"),
        "labels": item
            .get("labels")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|l| l.get("name").and_then(|n| n.as_str()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default(),
        "milestone": item.pointer("/milestone/title"),
        "commits": item.get("commits").and_then(|v| v.as_i64()).unwrap_or(0),
        "additions": item.get("additions").and_then(|v| v.as_i64()).unwrap_or(0),
        "deletions": item.get("deletions").and_then(|v| v.as_i64()).unwrap_or(0),
        "changed_files": item.get("changed_files").and_then(|v| v.as_i64()).unwrap_or(0),
    });

    Ok(DiscoveredPr {
        pr_number,
        title: required_str(item, "title")?,
        author: item
            .pointer("/user/login")
            .and_then(|v| v.as_str())
            .ok_or("missing field 'user.login'")?
            .to_string(),
        state,
        draft: item.get("draft").and_then(|v| v.as_bool()).unwrap_or(false),
        base_branch: base
            .get("ref")
            .and_then(|v| v.as_str())
            .ok_or("missing field 'base.ref'")?
            .to_string(),
        head_branch: head
            .get("ref")
            .and_then(|v| v.as_str())
            .ok_or("missing field 'head.ref'")?
            .to_string(),
        base_sha: base
            .get("sha")
            .and_then(|v| v.as_str())
            .ok_or("missing field 'base.sha'")?
            .to_string(),
        head_sha: head
            .get("sha")
            .and_then(|v| v.as_str())
            .ok_or("missing field 'head.sha'")?
            .to_string(),
        url: required_str(item, "html_url")?,
        body: item.get("body").and_then(|v| v.as_str()).map(String::from),
        created_at: required_timestamp(item, "created_at")?,
        updated_at: required_timestamp(item, "updated_at")?,
        merged_at,
        metadata,
        check_runs: Vec::new(),
    })
}

/// Project one check-run payload.
pub(crate) fn convert_check(item: &Value) -> Result<DiscoveredCheckRun, String> {
    let external_id = match item.get("id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => return Err("missing field 'id'".to_string()),
    };

    let status_raw = item
        .get("status")
        .and_then(|v| v.as_str())
        .ok_or("missing field 'status'")?;
    let status = CheckStatus::parse(status_raw).map_err(|e| e.to_string())?;

    let conclusion = match item.get("conclusion").and_then(|v| v.as_str()) {
        Some(raw) => Some(CheckConclusion::parse(raw).map_err(|e| e.to_string())?),
        None => None,
    };

    let output = json!({
        "title": item.pointer("/output/title"),
        "summary": item.pointer("/output/summary"),
        "text": item.pointer("/output/text"),
        "check_suite_id": item.pointer("/check_suite/id"),
        "app": item.pointer("/app/slug"),
    });

    Ok(DiscoveredCheckRun {
        external_id,
        name: required_str(item, "name")?,
        status,
        conclusion,
        started_at: optional_timestamp(item, "started_at"),
        completed_at: optional_timestamp(item, "completed_at"),
        logs_url: item.get("html_url").and_then(|v| v.as_str()).map(String::from),
        details_url: item
            .get("details_url")
            .and_then(|v| v.as_str())
            .map(String::from),
        output,
    })
}
