use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{GlobalFlags, flag_value};
use crate::core::config::OrchestratorConfig;
use crate::core::context::OrchestratorContext;
use crate::core::lifecycle::{DispatchLoop, LifecycleManager, TriggerService};
use crate::core::terminal::{self, print_info, print_link, print_status};
use crate::interfaces::web::ApiServer;
use crate::logging;

/// Applies `--host`/`--port` on top of the loaded config.
fn apply_overrides(config: &mut OrchestratorConfig, args: &[String]) -> Result<()> {
    if let Some(host) = flag_value(args, 2, &["--host"]) {
        config.server.host = host;
    }
    if let Some(port) = flag_value(args, 2, &["--port"]) {
        config.server.port = port
            .parse()
            .map_err(|_| anyhow!("invalid --port '{}'", port))?;
    }
    Ok(())
}

pub async fn run_serve(flags: &GlobalFlags, args: &[String]) -> Result<()> {
    let mut config = OrchestratorConfig::load(flags.config.as_deref()).await?;
    apply_overrides(&mut config, args)?;

    terminal::print_banner();
    let log_tx = logging::init(&config.logging.level, false);

    let ctx = OrchestratorContext::build(config).await?;
    let cancel = CancellationToken::new();
    let mut manager = LifecycleManager::new(ctx.scheduler.clone(), cancel.clone());

    manager.attach(Arc::new(Mutex::new(DispatchLoop::new(
        ctx.engine.clone(),
        Duration::from_millis(ctx.config.dispatch.interval_ms),
        Duration::from_millis(ctx.config.robots.sweep_interval_ms),
        cancel.clone(),
    ))));
    manager.attach(Arc::new(Mutex::new(TriggerService::new(
        ctx.triggers.clone(),
    ))));
    manager.attach(Arc::new(Mutex::new(ApiServer::new(
        ctx.clone(),
        log_tx,
        cancel.clone(),
    ))));

    manager.start().await?;

    let base_url = ctx.config.api_base_url();
    print_link("Operator API", &format!("{}/api/status", base_url));
    print_link(
        "Robot socket",
        &format!("{}/ws/robot", base_url.replacen("http", "ws", 1)),
    );
    print_status("Queue", &format!("{:?}", ctx.config.queue.backend).to_lowercase());
    print_info("Press Ctrl+C to stop.");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupt received, shutting down"),
        _ = manager.wait_for_shutdown() => {}
    }
    manager.shutdown().await?;
    terminal::print_goodbye();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_port_flags_override_config() {
        let mut config = OrchestratorConfig::default();
        let args: Vec<String> = ["x", "serve", "--host", "0.0.0.0", "--port", "18080"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        apply_overrides(&mut config, &args).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 18080);
        assert_eq!(config.api_base_url(), "http://127.0.0.1:18080");
    }

    #[test]
    fn bad_port_is_rejected() {
        let mut config = OrchestratorConfig::default();
        let args: Vec<String> = ["x", "serve", "--port", "http"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(apply_overrides(&mut config, &args).is_err());
    }
}
