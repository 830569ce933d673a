use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{TriggerConfig, TriggerEmitter};
use crate::core::bus::{BusEvent, EventBus, JOB_QUEUED, SubscriptionToken, WILDCARD};
use crate::core::errors::{OrchestratorError, Result};
use crate::platform::{NativePlatform, Platform};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const PROCESS_STARTED: &str = "process_started";
pub const PROCESS_STOPPED: &str = "process_stopped";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEventSource {
    /// The orchestrator's own event bus.
    Bus,
    /// OS process list.
    Process,
}

impl AppEventSource {
    fn of(config: &TriggerConfig) -> Result<Self> {
        match config.config_str("source").unwrap_or("bus") {
            "bus" | "internal" => Ok(AppEventSource::Bus),
            "process" => Ok(AppEventSource::Process),
            other => Err(OrchestratorError::Configuration(format!(
                "unknown app event source '{}'",
                other
            ))),
        }
    }
}

fn compile(config: &TriggerConfig, key: &str) -> Result<Option<Regex>> {
    config
        .config_str(key)
        .map(|raw| {
            Regex::new(raw).map_err(|e| {
                OrchestratorError::Configuration(format!("invalid {} '{}': {}", key, raw, e))
            })
        })
        .transpose()
}

fn poll_interval(config: &TriggerConfig) -> Duration {
    if let Some(ms) = config.config_u64("poll_interval_ms") {
        return Duration::from_millis(ms.max(10));
    }
    match config.config_u64("poll_interval") {
        Some(secs) => Duration::from_secs(secs.max(1)),
        None => Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
    }
}

pub fn validate_config(config: &TriggerConfig) -> Result<()> {
    match AppEventSource::of(config)? {
        AppEventSource::Bus => {
            compile(config, "pattern")?;
        }
        AppEventSource::Process => {
            if compile(config, "process_pattern")?.is_none() {
                return Err(OrchestratorError::Configuration(
                    "process app event trigger requires 'process_pattern'".to_string(),
                ));
            }
            for t in config.config_list("event_types") {
                if t != PROCESS_STARTED && t != PROCESS_STOPPED {
                    return Err(OrchestratorError::Configuration(format!(
                        "unknown process event type '{}'",
                        t
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Text the optional `pattern` is matched against: window title, process or
/// name fields when present, else the node id.
fn match_subject(event: &BusEvent) -> Option<String> {
    ["title", "window_title", "process", "name"]
        .iter()
        .find_map(|k| event.data.get(*k).and_then(|v| v.as_str()))
        .map(|s| s.to_string())
        .or_else(|| event.node_id.clone())
}

/// Common payload shape for bus-sourced events.
pub fn bus_event_payload(event: &BusEvent) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("event_type".to_string(), json!(event.event_type));
    payload.insert("node_id".to_string(), json!(event.node_id));
    payload.insert("timestamp".to_string(), json!(event.timestamp.to_rfc3339()));
    payload.insert("data".to_string(), Value::Object(event.data.clone()));
    payload
}

pub fn accepts_bus_event(trigger_id: &str, pattern: Option<&Regex>, event: &BusEvent) -> bool {
    let origin = event.data.get("trigger_id").and_then(|v| v.as_str());
    // Never react to own jobs. Submissions made by any trigger are ignored too,
    // otherwise two triggers listening for `job.queued` would feed each other.
    if origin == Some(trigger_id) || (origin.is_some() && event.event_type == JOB_QUEUED) {
        return false;
    }
    match pattern {
        Some(re) => match_subject(event).is_some_and(|s| re.is_match(&s)),
        None => true,
    }
}

/// Started and stopped process names matching `pattern` between two snapshots.
pub fn process_changes(
    previous: &BTreeSet<String>,
    current: &BTreeSet<String>,
    pattern: &Regex,
) -> Vec<(String, &'static str)> {
    let started = current
        .difference(previous)
        .filter(|n| pattern.is_match(n))
        .map(|n| (n.clone(), PROCESS_STARTED));
    let stopped = previous
        .difference(current)
        .filter(|n| pattern.is_match(n))
        .map(|n| (n.clone(), PROCESS_STOPPED));
    started.chain(stopped).collect()
}

pub struct AppEventTrigger {
    bus: Arc<EventBus>,
    tokens: Vec<SubscriptionToken>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    error: Option<String>,
}

impl AppEventTrigger {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            tokens: Vec::new(),
            cancel: None,
            task: None,
            error: None,
        }
    }

    pub(super) fn start(&mut self, emitter: TriggerEmitter) -> bool {
        self.stop();
        let config = emitter.trigger().clone();
        let started = validate_config(&config).and_then(|_| match AppEventSource::of(&config)? {
            AppEventSource::Bus => self.start_bus(&config, emitter),
            AppEventSource::Process => self.start_process(&config, emitter),
        });
        match started {
            Ok(()) => {
                self.error = None;
                true
            }
            Err(e) => {
                error!(trigger_id = %config.id, error = %e, "App event trigger failed to start");
                self.error = Some(e.to_string());
                self.stop();
                false
            }
        }
    }

    fn start_bus(&mut self, config: &TriggerConfig, emitter: TriggerEmitter) -> Result<()> {
        let pattern = compile(config, "pattern")?;
        let mut types = config.config_list("event_types");
        if types.is_empty() {
            types.push(WILDCARD.to_string());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<BusEvent>();
        for t in &types {
            self.tokens.push(self.bus.subscribe(t.clone(), tx.clone()));
        }
        drop(tx);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let interval = poll_interval(config);
        let trigger_id = config.id.clone();
        info!(trigger_id = %trigger_id, event_types = ?types, "App event trigger subscribed");

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        while let Ok(event) = rx.try_recv() {
                            if !accepts_bus_event(&trigger_id, pattern.as_ref(), &event) {
                                continue;
                            }
                            let mut metadata = Map::new();
                            metadata.insert("source".to_string(), json!("app_event"));
                            metadata.insert("event_source".to_string(), json!("bus"));
                            emitter.emit(bus_event_payload(&event), metadata).await;
                        }
                    }
                }
            }
        }));
        self.cancel = Some(cancel);
        Ok(())
    }

    fn start_process(&mut self, config: &TriggerConfig, emitter: TriggerEmitter) -> Result<()> {
        let pattern = compile(config, "process_pattern")?.ok_or_else(|| {
            OrchestratorError::Configuration("missing 'process_pattern'".to_string())
        })?;
        let wanted: Vec<String> = config.config_list("event_types");
        let interval = poll_interval(config);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let trigger_id = config.id.clone();
        info!(trigger_id = %trigger_id, pattern = %pattern, "Process watch started");

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut previous: Option<BTreeSet<String>> = None;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let listed = tokio::task::spawn_blocking(NativePlatform::list_process_names).await;
                        let current: BTreeSet<String> = match listed {
                            Ok(Ok(names)) => names.into_iter().collect(),
                            Ok(Err(e)) => {
                                warn!(trigger_id = %trigger_id, error = %e, "Process listing failed");
                                continue;
                            }
                            Err(e) => {
                                warn!(trigger_id = %trigger_id, error = %e, "Process listing task failed");
                                continue;
                            }
                        };
                        // The first snapshot is the baseline.
                        if let Some(prev) = previous.as_ref() {
                            for (name, event_type) in process_changes(prev, &current, &pattern) {
                                if !wanted.is_empty() && !wanted.iter().any(|w| w == event_type) {
                                    continue;
                                }
                                let mut payload = Map::new();
                                payload.insert("event_type".to_string(), json!(event_type));
                                payload.insert("process_name".to_string(), json!(name));
                                payload.insert("node_id".to_string(), Value::Null);
                                payload.insert("timestamp".to_string(), json!(chrono::Utc::now().to_rfc3339()));
                                let mut metadata = Map::new();
                                metadata.insert("source".to_string(), json!("app_event"));
                                metadata.insert("event_source".to_string(), json!("process"));
                                emitter.emit(payload, metadata).await;
                            }
                        }
                        previous = Some(current);
                    }
                }
            }
        }));
        self.cancel = Some(cancel);
        Ok(())
    }

    pub(super) fn stop(&mut self) {
        for token in self.tokens.drain(..) {
            self.bus.unsubscribe(token);
        }
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub(super) fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
