use anyhow::{Result, anyhow};
use serde_json::{Map, Value, json};

use super::client::{ApiClient, text};
use super::{GlobalFlags, flag_value, flag_values, has_flag, positionals};
use crate::core::terminal::{
    print_error, print_info, print_status, print_success, print_table, print_warn, status_word,
};

fn print_usage() {
    println!("Usage:");
    println!("  rpa-orchestrator triggers list");
    println!("  rpa-orchestrator triggers get <trigger_id>");
    println!(
        "  rpa-orchestrator triggers add --name <name> --type <webhook|file_watch|app_event|schedule|manual> --workflow <workflow_id>"
    );
    println!(
        "       [--id <id>] [--priority <p>] [--cooldown <secs>] [--set key=value]... [--disabled]"
    );
    println!("  rpa-orchestrator triggers remove|enable|disable <trigger_id>");
    println!("  rpa-orchestrator triggers fire <trigger_id> [--payload <json>]");
    println!();
    println!("Examples:");
    println!("  triggers add --name nightly --type schedule --workflow reports --set \"cron=0 0 2 * * *\"");
    println!("  triggers add --name inbox --type file_watch --workflow ingest --set path=/srv/inbox --set patterns=[\"*.pdf\"]");
    println!("  triggers add --name shop --type webhook --workflow orders --set auth_type=hmac_sha256 --set secret=s3cret");
}

pub async fn run_triggers_command(flags: &GlobalFlags, args: &[String]) -> Result<()> {
    let rest = positionals(args, 2);
    let sub_cmd = rest.first().map(String::as_str).unwrap_or("");
    let target = rest.get(1).cloned();

    match (sub_cmd, target) {
        ("list" | "ls", _) => {
            let client = ApiClient::from_flags(flags).await?;
            let body = client.get("/api/triggers").await?;
            let triggers = body["triggers"].as_array().cloned().unwrap_or_default();
            if triggers.is_empty() {
                print_info("No triggers configured.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = triggers
                .iter()
                .map(|t| {
                    vec![
                        text(t, "id"),
                        text(t, "name"),
                        text(t, "trigger_type"),
                        text(t, "workflow_id"),
                        status_word(&text(t, "state")).to_string(),
                        format!("{}/{}", text(t, "success_count"), text(t, "trigger_count")),
                        text(t, "last_triggered"),
                    ]
                })
                .collect();
            print_table(
                &["ID", "NAME", "TYPE", "WORKFLOW", "STATE", "OK/FIRED", "LAST FIRED"],
                &rows,
            );
        }
        ("get" | "show", Some(id)) => {
            let client = ApiClient::from_flags(flags).await?;
            let body = client.get(&format!("/api/triggers/{}", id)).await?;
            print_trigger(&body["trigger"]);
        }
        ("add" | "create", _) => {
            let config = build_trigger_config(args)?;
            let client = ApiClient::from_flags(flags).await?;
            let body = client.post("/api/triggers", Some(config)).await?;
            let trigger = &body["trigger"];
            print_success(&format!("Trigger {} added.", text(trigger, "id")));
            print_trigger(trigger);
            if trigger["trigger_type"] == "webhook" {
                print_status(
                    "Webhook URL",
                    &format!("{}/hooks/{}", client.base_url(), text(trigger, "id")),
                );
            }
        }
        ("remove" | "rm" | "delete", Some(id)) => {
            let client = ApiClient::from_flags(flags).await?;
            client.delete(&format!("/api/triggers/{}", id)).await?;
            print_success(&format!("Trigger {} removed.", id));
        }
        (action @ ("enable" | "disable"), Some(id)) => {
            let client = ApiClient::from_flags(flags).await?;
            let body = client
                .post(&format!("/api/triggers/{}/{}", id, action), None)
                .await?;
            print_success(&format!(
                "Trigger {} is {}.",
                id,
                text(&body["trigger"], "state")
            ));
        }
        ("fire", Some(id)) => {
            let payload = match flag_value(args, 2, &["--payload"]) {
                Some(raw) => Some(parse_object(&raw, "--payload")?),
                None => None,
            };
            let client = ApiClient::from_flags(flags).await?;
            let body = client
                .post(
                    &format!("/api/triggers/{}/fire", id),
                    payload.map(Value::Object),
                )
                .await?;
            match body["outcome"].as_str() {
                Some("submitted") => {
                    print_success(&format!("Job {} submitted.", text(&body, "job_id")))
                }
                Some("suppressed") => print_warn(&format!(
                    "Suppressed by cooldown; retry in {} ms.",
                    text(&body, "retry_after_ms")
                )),
                _ => print_error(&format!("Submission failed: {}", text(&body, "reason"))),
            }
        }
        ("", _) => print_usage(),
        (other, _) => {
            print_error(&format!("Unknown or incomplete triggers command: {}", other));
            print_usage();
        }
    }
    Ok(())
}

fn print_trigger(trigger: &Value) {
    print_status("Trigger", &format!("{} ({})", text(trigger, "name"), text(trigger, "id")));
    print_status("Type", &text(trigger, "trigger_type"));
    print_status("Workflow", &text(trigger, "workflow_id"));
    print_status("State", &status_word(&text(trigger, "state")).to_string());
    if let Some(settings) = trigger["config"].as_object().filter(|m| !m.is_empty()) {
        print_status("Settings", &Value::Object(redact(settings)).to_string());
    }
    if !trigger["error_message"].is_null() {
        print_status("Error", &text(trigger, "error_message"));
    }
}

const SECRET_KEYS: &[&str] = &["secret", "token", "api_key"];

fn redact(settings: &Map<String, Value>) -> Map<String, Value> {
    settings
        .iter()
        .map(|(k, v)| {
            let v = if SECRET_KEYS.contains(&k.as_str()) {
                json!("***")
            } else {
                v.clone()
            };
            (k.clone(), v)
        })
        .collect()
}

fn parse_object(raw: &str, flag: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(anyhow!("{} must be a JSON object", flag)),
    }
}

/// `key=value`; the value is read as JSON when it parses, otherwise as a string.
fn parse_setting(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("--set expects key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("--set expects key=value, got '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| json!(value));
    Ok((key.to_string(), value))
}

fn build_trigger_config(args: &[String]) -> Result<Value> {
    let required = |name: &str| {
        flag_value(args, 2, &[name]).ok_or_else(|| anyhow!("{} is required", name))
    };
    let mut config = Map::new();
    config.insert("name".to_string(), json!(required("--name")?));
    config.insert(
        "trigger_type".to_string(),
        json!(required("--type")?.replace('-', "_")),
    );
    config.insert("workflow_id".to_string(), json!(required("--workflow")?));
    if let Some(id) = flag_value(args, 2, &["--id"]) {
        config.insert("id".to_string(), json!(id));
    }
    if let Some(priority) = flag_value(args, 2, &["--priority"]) {
        config.insert("priority".to_string(), json!(priority.to_lowercase()));
    }
    if let Some(cooldown) = flag_value(args, 2, &["--cooldown"]) {
        let secs: u64 = cooldown
            .parse()
            .map_err(|_| anyhow!("--cooldown must be a number of seconds"))?;
        config.insert("cooldown_seconds".to_string(), json!(secs));
    }
    if has_flag(args, 2, "--disabled") {
        config.insert("enabled".to_string(), json!(false));
    }
    let mut settings = Map::new();
    for raw in flag_values(args, 2, &["--set"]) {
        let (key, value) = parse_setting(&raw)?;
        settings.insert(key, value);
    }
    config.insert("config".to_string(), Value::Object(settings));
    Ok(Value::Object(config))
}
