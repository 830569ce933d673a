use anyhow::{Result, anyhow};
use serde_json::{Map, Value, json};

use super::client::{ApiClient, text};
use super::{GlobalFlags, flag_value, positionals};
use crate::core::terminal::{print_error, print_info, print_status, print_success, print_table, status_word};

fn print_usage() {
    println!("Usage:");
    println!("  rpa-orchestrator jobs list [--status <status>] [--limit <n>]");
    println!("  rpa-orchestrator jobs get <job_id>");
    println!(
        "  rpa-orchestrator jobs submit <workflow_id> [--priority low|normal|high|urgent] [--input <json>]"
    );
    println!(
        "       [--metadata <json>] [--tags a,b] [--env <name>] [--timeout <secs>] [--retries <n>] [--workflow-file <path>]"
    );
    println!("  rpa-orchestrator jobs cancel <job_id> [--reason <text>]");
}

pub async fn run_jobs_command(flags: &GlobalFlags, args: &[String]) -> Result<()> {
    let rest = positionals(args, 2);
    let sub_cmd = rest.first().map(String::as_str).unwrap_or("");
    let target = rest.get(1).cloned();

    match (sub_cmd, target) {
        ("list" | "ls", _) => {
            let client = ApiClient::from_flags(flags).await?;
            list(&client, args).await
        }
        ("get" | "show", Some(job_id)) => {
            let client = ApiClient::from_flags(flags).await?;
            let body = client.get(&format!("/api/jobs/{}", job_id)).await?;
            print_job(&body["job"]);
            Ok(())
        }
        ("submit", Some(workflow_id)) => {
            let request = build_submit_request(&workflow_id, args)?;
            let client = ApiClient::from_flags(flags).await?;
            let body = client.post("/api/jobs", Some(request)).await?;
            print_success(&format!("Job {} queued.", text(&body["job"], "job_id")));
            print_status("Explanation", &text(&body["job"], "explanation"));
            Ok(())
        }
        ("cancel", Some(job_id)) => {
            let reason = flag_value(args, 2, &["--reason"]);
            let client = ApiClient::from_flags(flags).await?;
            let body = client
                .post(
                    &format!("/api/jobs/{}/cancel", job_id),
                    reason.map(|r| json!({ "reason": r })),
                )
                .await?;
            print_success(&format!(
                "Job {} is {}.",
                job_id,
                text(&body["job"], "status")
            ));
            Ok(())
        }
        ("", _) => {
            print_usage();
            Ok(())
        }
        (other, _) => {
            print_error(&format!("Unknown or incomplete jobs command: {}", other));
            print_usage();
            Ok(())
        }
    }
}

async fn list(client: &ApiClient, args: &[String]) -> Result<()> {
    let mut query = Vec::new();
    if let Some(status) = flag_value(args, 2, &["--status"]) {
        query.push(format!("status={}", status));
    }
    if let Some(limit) = flag_value(args, 2, &["--limit"]) {
        query.push(format!("limit={}", limit));
    }
    let path = if query.is_empty() {
        "/api/jobs".to_string()
    } else {
        format!("/api/jobs?{}", query.join("&"))
    };
    let body = client.get(&path).await?;
    let jobs = body["jobs"].as_array().cloned().unwrap_or_default();
    if jobs.is_empty() {
        print_info("No jobs.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = jobs
        .iter()
        .map(|job| {
            vec![
                text(job, "job_id"),
                text(job, "workflow_id"),
                text(job, "priority"),
                status_word(&text(job, "status")).to_string(),
                text(job, "assigned_robot_id"),
                text(job, "explanation"),
            ]
        })
        .collect();
    print_table(
        &["JOB", "WORKFLOW", "PRIORITY", "STATUS", "ROBOT", "DETAIL"],
        &rows,
    );
    Ok(())
}

fn print_job(job: &Value) {
    print_status("Job", &text(job, "job_id"));
    print_status(
        "Workflow",
        &format!("{} ({})", text(job, "workflow_name"), text(job, "workflow_id")),
    );
    print_status("Status", &status_word(&text(job, "status")).to_string());
    print_status("Priority", &text(job, "priority"));
    print_status("Explanation", &text(job, "explanation"));
    for field in [
        "assigned_robot_id",
        "created_at",
        "started_at",
        "completed_at",
        "progress",
        "current_node",
        "retry_count",
        "error_type",
        "error_message",
    ] {
        if !job.get(field).is_none_or(Value::is_null) {
            print_status(field, &text(job, field));
        }
    }
    if let Some(result) = job.get("result").filter(|r| !r.is_null()) {
        print_status("result", &result.to_string());
    }
}

fn json_object_flag(args: &[String], name: &str) -> Result<Option<Map<String, Value>>> {
    let Some(raw) = flag_value(args, 2, &[name]) else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        _ => Err(anyhow!("{} must be a JSON object", name)),
    }
}

/// Body for `POST /api/jobs` built from command-line flags.
fn build_submit_request(workflow_id: &str, args: &[String]) -> Result<Value> {
    let mut request = Map::new();
    request.insert("workflow_id".to_string(), json!(workflow_id));
    if let Some(priority) = flag_value(args, 2, &["--priority"]) {
        request.insert("priority".to_string(), json!(priority.to_lowercase()));
    }
    if let Some(input) = json_object_flag(args, "--input")? {
        request.insert("input".to_string(), Value::Object(input));
    }
    if let Some(metadata) = json_object_flag(args, "--metadata")? {
        request.insert("metadata".to_string(), Value::Object(metadata));
    }
    if let Some(tags) = flag_value(args, 2, &["--tags"]) {
        let tags: Vec<&str> = tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        request.insert("required_tags".to_string(), json!(tags));
    }
    if let Some(env) = flag_value(args, 2, &["--env"]) {
        request.insert("environment".to_string(), json!(env));
    }
    if let Some(timeout) = flag_value(args, 2, &["--timeout"]) {
        let secs: u64 = timeout
            .parse()
            .map_err(|_| anyhow!("--timeout must be a number of seconds"))?;
        request.insert("timeout_seconds".to_string(), json!(secs));
    }
    if let Some(retries) = flag_value(args, 2, &["--retries"]) {
        let n: u32 = retries
            .parse()
            .map_err(|_| anyhow!("--retries must be a non-negative number"))?;
        request.insert("max_retries".to_string(), json!(n));
    }
    if let Some(path) = flag_value(args, 2, &["--workflow-file"]) {
        let workflow = std::fs::read_to_string(&path)
            .map_err(|e| anyhow!("cannot read workflow file {}: {}", path, e))?;
        request.insert("workflow_json".to_string(), json!(workflow));
    }
    Ok(Value::Object(request))
}
