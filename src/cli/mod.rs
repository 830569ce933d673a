mod client;
mod config_cmd;
mod jobs;
mod logs;
mod robots;
mod serve;
mod status;
mod triggers;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::core::terminal::{self, print_error};

fn print_help() {
    terminal::print_banner();

    println!("{}", style("Server").bold().underlined());
    print_command("serve", "Run the orchestrator (API, robot socket, dispatch, triggers)");
    print_command("status", "Show queue, robot and trigger counts");
    print_command("logs", "Follow live orchestrator logs");
    println!();

    println!("{}", style("Work").bold().underlined());
    print_command("jobs", "list | get <id> | submit <workflow_id> | cancel <id>");
    print_command("robots", "list | pause <id> | resume <id>");
    print_command("triggers", "list | get | add | remove | enable | disable | fire");
    println!();

    println!("{}", style("Setup").bold().underlined());
    print_command("config", "init | show | path");
    println!();

    println!(
        " {} {} <command> [subcommand] [--config <file>] [--api-url <url>] [--token <token>]\n",
        style("Usage:").bold(),
        style("rpa-orchestrator").green()
    );
}

fn print_command(name: &str, about: &str) {
    println!("  {:<10} {}", style(name).cyan().bold(), about);
}

/// Flags every subcommand understands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct GlobalFlags {
    pub config: Option<PathBuf>,
    pub api_url: Option<String>,
    pub token: Option<String>,
}

impl GlobalFlags {
    fn parse(args: &[String]) -> Self {
        Self {
            config: flag_value(args, 1, &["--config", "-c"]).map(PathBuf::from),
            api_url: flag_value(args, 1, &["--api-url"]),
            token: flag_value(args, 1, &["--token"]),
        }
    }
}

/// Flags that consume the following argument.
const VALUE_FLAGS: &[&str] = &[
    "--config",
    "-c",
    "--api-url",
    "--token",
    "--host",
    "--port",
    "--status",
    "--limit",
    "--priority",
    "--input",
    "--metadata",
    "--tags",
    "--env",
    "--timeout",
    "--retries",
    "--workflow-file",
    "--reason",
    "--id",
    "--name",
    "--type",
    "--workflow",
    "--cooldown",
    "--set",
    "--payload",
];

/// Last value given for any of `names`, scanning from `start`.
pub(crate) fn flag_value(args: &[String], start: usize, names: &[&str]) -> Option<String> {
    flag_values(args, start, names).pop()
}

/// Every value given for any of `names`, in order.
pub(crate) fn flag_values(args: &[String], start: usize, names: &[&str]) -> Vec<String> {
    let mut values = Vec::new();
    let mut i = start;
    while i < args.len() {
        if names.contains(&args[i].as_str()) {
            if i + 1 < args.len() {
                values.push(args[i + 1].clone());
                i += 2;
            } else {
                i += 1;
            }
        } else {
            i += 1;
        }
    }
    values
}

pub(crate) fn has_flag(args: &[String], start: usize, name: &str) -> bool {
    args.iter().skip(start).any(|a| a == name)
}

/// Arguments from `start` that are neither flags nor flag values.
pub(crate) fn positionals(args: &[String], start: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut i = start;
    while i < args.len() {
        let arg = args[i].as_str();
        if VALUE_FLAGS.contains(&arg) {
            i += 2;
        } else if arg.starts_with("--") {
            i += 1;
        } else {
            out.push(args[i].clone());
            i += 1;
        }
    }
    out
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let flags = GlobalFlags::parse(&args);

    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };
    match cmd {
        "serve" | "start" => serve::run_serve(&flags, &args).await?,
        "status" => status::run_status(&flags).await?,
        "logs" => logs::follow_logs(&flags).await?,
        "jobs" | "job" => jobs::run_jobs_command(&flags, &args).await?,
        "robots" | "robot" => robots::run_robots_command(&flags, &args).await?,
        "triggers" | "trigger" => triggers::run_triggers_command(&flags, &args).await?,
        "config" => config_cmd::run_config_command(&flags, &args).await?,
        "help" | "--help" | "-h" => print_help(),
        "--version" | "-V" => println!("rpa-orchestrator {}", env!("CARGO_PKG_VERSION")),
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn global_flags_are_found_anywhere() {
        let args = argv(&[
            "rpa-orchestrator",
            "jobs",
            "list",
            "--api-url",
            "http://10.0.0.5:17900",
            "--config",
            "/etc/orch.toml",
        ]);
        let flags = GlobalFlags::parse(&args);
        assert_eq!(flags.api_url.as_deref(), Some("http://10.0.0.5:17900"));
        assert_eq!(flags.config, Some(PathBuf::from("/etc/orch.toml")));
        assert_eq!(flags.token, None);
    }

    #[test]
    fn positionals_skip_flags_and_their_values() {
        let args = argv(&[
            "rpa-orchestrator",
            "jobs",
            "submit",
            "--priority",
            "high",
            "invoices",
            "--force",
            "--tags",
            "sap,excel",
        ]);
        assert_eq!(positionals(&args, 2), vec!["submit", "invoices"]);
        assert!(has_flag(&args, 2, "--force"));
    }

    #[test]
    fn repeated_flags_are_all_collected() {
        let args = argv(&["x", "triggers", "add", "--set", "cron=0 * * * * *", "--set", "a=1"]);
        assert_eq!(
            flag_values(&args, 2, &["--set"]),
            vec!["cron=0 * * * * *", "a=1"]
        );
        assert_eq!(flag_value(&args, 2, &["--set"]).as_deref(), Some("a=1"));
        assert_eq!(flag_value(&args, 2, &["--missing"]), None);
    }

    #[test]
    fn dangling_flag_has_no_value() {
        let args = argv(&["x", "jobs", "list", "--status"]);
        assert_eq!(flag_value(&args, 2, &["--status"]), None);
    }
}
