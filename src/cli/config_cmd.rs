use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};

use super::{GlobalFlags, has_flag, positionals};
use crate::core::config::OrchestratorConfig;
use crate::core::terminal::{print_error, print_info, print_status, print_success, print_warn};
use crate::platform::{NativePlatform, Platform};

fn generate_token(prefix: &str) -> String {
    let bytes: [u8; 24] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}_{}", prefix, hex)
}

fn target_path(flags: &GlobalFlags) -> PathBuf {
    flags
        .config
        .clone()
        .unwrap_or_else(OrchestratorConfig::default_path)
}

/// Writes a default config to `path`. Refuses to overwrite unless `force`.
async fn write_default_config(path: &Path, force: bool, with_tokens: bool) -> Result<OrchestratorConfig> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    let mut config = OrchestratorConfig::default();
    if with_tokens {
        config.server.api_token = Some(generate_token("orch"));
        config.server.robot_token = Some(generate_token("robot"));
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    tokio::fs::write(path, config.to_toml()?)
        .await
        .with_context(|| format!("cannot write {}", path.display()))?;
    NativePlatform::restrict_file_permissions(path);
    Ok(config)
}

pub async fn run_config_command(flags: &GlobalFlags, args: &[String]) -> Result<()> {
    let rest = positionals(args, 2);
    let path = target_path(flags);
    match rest.first().map(String::as_str).unwrap_or("") {
        "init" => {
            let config = write_default_config(
                &path,
                has_flag(args, 2, "--force"),
                has_flag(args, 2, "--with-tokens"),
            )
            .await?;
            print_success(&format!("Wrote {}", path.display()));
            if let Some(token) = &config.server.api_token {
                print_status("API token", token);
            }
            if let Some(token) = &config.server.robot_token {
                print_status("Robot token", token);
            }
            if config.server.api_token.is_none() {
                print_info("The API is open to loopback callers until [server] api_token is set.");
            }
        }
        "show" => {
            if !path.exists() {
                print_warn(&format!("{} does not exist; showing defaults.", path.display()));
            }
            let config = OrchestratorConfig::load(Some(&path)).await?;
            println!("{}", config.to_toml()?);
        }
        "path" => println!("{}", path.display()),
        other => {
            if !other.is_empty() {
                print_error(&format!("Unknown config command: {}", other));
            }
            println!("Usage: rpa-orchestrator config init [--force] [--with-tokens] | show | path");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_writes_a_loadable_file_and_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("orchestrator.toml");

        let written = write_default_config(&path, false, true).await.unwrap();
        let token = written.server.api_token.clone().unwrap();
        assert!(token.starts_with("orch_"));
        assert_eq!(token.len(), "orch_".len() + 48);

        let loaded = OrchestratorConfig::load(Some(&path)).await.unwrap();
        assert_eq!(loaded.server.api_token, written.server.api_token);
        assert_eq!(loaded.server.robot_token, written.server.robot_token);
        assert_eq!(loaded.dispatch.interval_ms, 500);

        assert!(write_default_config(&path, false, false).await.is_err());
        let replaced = write_default_config(&path, true, false).await.unwrap();
        assert!(replaced.server.api_token.is_none());
    }

    #[test]
    fn generated_tokens_differ() {
        assert_ne!(generate_token("robot"), generate_token("robot"));
    }
}
