use anyhow::Result;
use serde_json::Value;

use super::client::{ApiClient, text};
use super::{GlobalFlags, positionals};
use crate::core::terminal::{print_error, print_info, print_success, print_table, status_word};

pub async fn run_robots_command(flags: &GlobalFlags, args: &[String]) -> Result<()> {
    let rest = positionals(args, 2);
    let sub_cmd = rest.first().map(String::as_str).unwrap_or("list");

    match (sub_cmd, rest.get(1)) {
        ("list" | "ls", _) => {
            let client = ApiClient::from_flags(flags).await?;
            let body = client.get("/api/robots").await?;
            let robots = body["robots"].as_array().cloned().unwrap_or_default();
            if robots.is_empty() {
                print_info("No robots registered.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = robots.iter().map(robot_row).collect();
            print_table(
                &["ROBOT", "STATUS", "JOBS", "TAGS", "ENV", "LINK", "LAST HEARTBEAT"],
                &rows,
            );
        }
        (action @ ("pause" | "resume"), Some(robot_id)) => {
            let client = ApiClient::from_flags(flags).await?;
            client
                .post(&format!("/api/robots/{}/{}", robot_id, action), None)
                .await?;
            let verb = if action == "pause" { "paused" } else { "resumed" };
            print_success(&format!("Robot {} {}.", robot_id, verb));
        }
        (other, _) => {
            print_error(&format!("Unknown or incomplete robots command: {}", other));
            println!("Usage: rpa-orchestrator robots list | pause <robot_id> | resume <robot_id>");
        }
    }
    Ok(())
}

fn robot_row(robot: &Value) -> Vec<String> {
    let status = text(robot, "status");
    let status = if robot["paused"].as_bool() == Some(true) {
        format!("{} (paused)", status_word(&status))
    } else {
        status_word(&status).to_string()
    };
    let tags = robot["tags"]
        .as_array()
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();
    let link = if robot["connected"].as_bool() == Some(true) {
        "connected"
    } else {
        "-"
    };
    vec![
        text(robot, "robot_id"),
        status,
        format!(
            "{}/{}",
            robot["current_job_ids"].as_array().map_or(0, Vec::len),
            text(robot, "max_concurrent_jobs")
        ),
        if tags.is_empty() { "-".to_string() } else { tags },
        text(robot, "environment"),
        link.to_string(),
        text(robot, "last_heartbeat"),
    ]
}
