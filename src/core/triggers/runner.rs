//! Owns every configured trigger: persistence, start/stop and external firing.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::schedule::SharedScheduler;
use super::webhook::{event_from_request, verify_webhook_auth};
use super::{
    EmitOutcome, TriggerConfig, TriggerEmitter, TriggerEvent, TriggerInstance, TriggerSink,
    TriggerState, TriggerType,
};
use crate::core::bus::EventBus;
use crate::core::errors::{OrchestratorError, Result};
use crate::core::storage::Storage;

/// Shared services handed to trigger instances.
#[derive(Clone)]
pub struct TriggerDeps {
    pub bus: Arc<EventBus>,
    pub scheduler: SharedScheduler,
}

/// Persists fire counters after the wrapped sink has run.
struct RecordingSink {
    inner: Arc<dyn TriggerSink>,
    storage: Storage,
}

#[async_trait]
impl TriggerSink for RecordingSink {
    async fn deliver(&self, trigger: &TriggerConfig, event: TriggerEvent) -> Result<String> {
        let at = event.timestamp;
        let delivered = self.inner.deliver(trigger, event).await;
        if let Err(e) = self
            .storage
            .record_trigger_fire(&trigger.id, delivered.is_ok(), at)
            .await
        {
            warn!(trigger_id = %trigger.id, error = %e, "Failed to record trigger fire");
        }
        delivered
    }
}

struct TriggerEntry {
    config: TriggerConfig,
    instance: TriggerInstance,
    emitter: Option<TriggerEmitter>,
    state: TriggerState,
    /// Set when the stored config failed validation and was never started.
    invalid: Option<String>,
}

impl TriggerEntry {
    fn error_message(&self) -> Option<String> {
        match self.state {
            TriggerState::Error => self
                .invalid
                .clone()
                .or_else(|| self.instance.last_error().map(|s| s.to_string())),
            _ => None,
        }
    }
}

/// What the API reports for one trigger.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TriggerView {
    #[serde(flatten)]
    pub config: TriggerConfig,
    pub state: TriggerState,
    pub error_message: Option<String>,
}

pub struct TriggerRunner {
    storage: Storage,
    sink: Arc<dyn TriggerSink>,
    deps: TriggerDeps,
    entries: Mutex<HashMap<String, TriggerEntry>>,
}

impl TriggerRunner {
    pub fn new(storage: Storage, sink: Arc<dyn TriggerSink>, deps: TriggerDeps) -> Self {
        let sink: Arc<dyn TriggerSink> = Arc::new(RecordingSink {
            inner: sink,
            storage: storage.clone(),
        });
        Self {
            storage,
            sink,
            deps,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Loads persisted triggers and starts the enabled ones. Returns how many are running.
    ///
    /// A stored trigger that no longer validates is kept in the `Error` state so
    /// operators can see and fix it.
    pub async fn load_and_start_all(&self) -> Result<usize> {
        let configs = self.storage.list_triggers().await?;
        let mut running = 0;
        for config in configs {
            let entry = self.start_entry(config).await;
            if entry.state == TriggerState::Running {
                running += 1;
            }
            self.entries.lock().await.insert(entry.config.id.clone(), entry);
        }
        info!(running, "Triggers loaded");
        Ok(running)
    }

    async fn start_entry(&self, config: TriggerConfig) -> TriggerEntry {
        let mut instance = TriggerInstance::for_config(&config, &self.deps);
        if let Err(e) = config.validate() {
            warn!(trigger_id = %config.id, error = %e, "Stored trigger is invalid");
            return TriggerEntry {
                config,
                instance,
                emitter: None,
                state: TriggerState::Error,
                invalid: Some(e.to_string()),
            };
        }
        if !config.enabled {
            return TriggerEntry {
                config,
                instance,
                emitter: None,
                state: TriggerState::Stopped,
                invalid: None,
            };
        }
        let emitter = TriggerEmitter::new(config.clone(), self.sink.clone());
        let started = instance.start(emitter.clone()).await;
        TriggerEntry {
            config,
            instance,
            emitter: started.then_some(emitter),
            state: if started {
                TriggerState::Running
            } else {
                TriggerState::Error
            },
            invalid: None,
        }
    }

    /// Validates, persists and (when enabled) starts a new trigger.
    pub async fn add(&self, mut config: TriggerConfig) -> Result<TriggerView> {
        config.validate()?;
        if self.entries.lock().await.contains_key(&config.id) {
            return Err(OrchestratorError::Validation(format!(
                "trigger '{}' already exists",
                config.id
            )));
        }
        config.trigger_count = 0;
        config.success_count = 0;
        config.last_triggered = None;
        self.storage.save_trigger(&config).await?;

        let entry = self.start_entry(config).await;
        info!(
            trigger_id = %entry.config.id,
            trigger_type = %entry.config.trigger_type,
            state = ?entry.state,
            "Trigger added"
        );
        let view = self.view_of(&entry).await;
        self.entries.lock().await.insert(entry.config.id.clone(), entry);
        Ok(view)
    }

    /// Stops and deletes a trigger. Returns false when it did not exist.
    pub async fn remove(&self, trigger_id: &str) -> Result<bool> {
        let entry = self.entries.lock().await.remove(trigger_id);
        let existed = match entry {
            Some(mut entry) => {
                entry.instance.stop().await;
                true
            }
            None => false,
        };
        let deleted = self.storage.delete_trigger(trigger_id).await?;
        if existed || deleted {
            info!(trigger_id = %trigger_id, "Trigger removed");
        }
        Ok(existed || deleted)
    }

    pub async fn set_enabled(&self, trigger_id: &str, enabled: bool) -> Result<TriggerView> {
        let mut entry = self
            .entries
            .lock()
            .await
            .remove(trigger_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("trigger {}", trigger_id)))?;
        entry.instance.stop().await;
        let mut config = entry.config;
        config.enabled = enabled;
        let saved = self.storage.save_trigger(&config).await;

        let entry = self.start_entry(config).await;
        let view = self.view_of(&entry).await;
        self.entries.lock().await.insert(trigger_id.to_string(), entry);
        saved?;
        Ok(view)
    }

    async fn running_emitter(&self, trigger_id: &str) -> Result<TriggerEmitter> {
        let entries = self.entries.lock().await;
        let entry = entries
            .get(trigger_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("trigger {}", trigger_id)))?;
        entry.emitter.clone().ok_or_else(|| {
            OrchestratorError::Validation(format!("trigger '{}' is not running", trigger_id))
        })
    }

    /// Fires a running trigger by hand. Any variant may be fired this way.
    pub async fn fire(&self, trigger_id: &str, payload: Map<String, Value>) -> Result<EmitOutcome> {
        let emitter = self.running_emitter(trigger_id).await?;
        let mut metadata = Map::new();
        metadata.insert("source".to_string(), json!("manual"));
        Ok(emitter.emit(payload, metadata).await)
    }

    /// Authenticates an inbound request for a webhook trigger and emits it.
    pub async fn handle_webhook(
        &self,
        trigger_id: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<EmitOutcome> {
        let emitter = self.running_emitter(trigger_id).await?;
        let config = emitter.trigger();
        if config.trigger_type != TriggerType::Webhook {
            return Err(OrchestratorError::NotFound(format!(
                "webhook trigger {}",
                trigger_id
            )));
        }
        verify_webhook_auth(config, headers, body)?;
        let (payload, metadata) = event_from_request(headers, body);
        Ok(emitter.emit(payload, metadata).await)
    }

    async fn view_of(&self, entry: &TriggerEntry) -> TriggerView {
        let mut config = entry.config.clone();
        // Counters live in storage; the in-memory config only carries settings.
        if let Ok(Some(stored)) = self.storage.get_trigger(&config.id).await {
            config.trigger_count = stored.trigger_count;
            config.success_count = stored.success_count;
            config.last_triggered = stored.last_triggered;
        }
        TriggerView {
            config,
            state: entry.state,
            error_message: entry.error_message(),
        }
    }

    pub async fn get(&self, trigger_id: &str) -> Option<TriggerView> {
        let entries = self.entries.lock().await;
        let entry = entries.get(trigger_id)?;
        Some(self.view_of(entry).await)
    }

    pub async fn list(&self) -> Vec<TriggerView> {
        let entries = self.entries.lock().await;
        let mut views = Vec::with_capacity(entries.len());
        for entry in entries.values() {
            views.push(self.view_of(entry).await);
        }
        views.sort_by(|a, b| a.config.name.cmp(&b.config.name).then(a.config.id.cmp(&b.config.id)));
        views
    }

    /// Last time any trigger fired, for status reporting.
    pub async fn last_fired(&self) -> Option<DateTime<Utc>> {
        self.list()
            .await
            .into_iter()
            .filter_map(|v| v.config.last_triggered)
            .max()
    }

    /// Idempotent. Every entry ends `Stopped`, including ones that failed to start.
    pub async fn stop_all(&self) {
        let mut entries = self.entries.lock().await;
        for entry in entries.values_mut() {
            entry.instance.stop().await;
            entry.emitter = None;
            entry.state = TriggerState::Stopped;
        }
        info!(count = entries.len(), "Triggers stopped");
    }
}
