use super::*;
use crate::core::job::JobPriority;
use crate::core::triggers::{TriggerConfig, TriggerType};
use chrono::Utc;
use serde_json::json;

fn webhook() -> TriggerConfig {
    let mut config = TriggerConfig::new("Orders", TriggerType::Webhook, "orders")
        .setting("auth_type", json!("bearer"))
        .setting("token", json!("t"));
    config.priority = JobPriority::High;
    config
}

#[tokio::test]
async fn trigger_configs_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("queue.db");
    let config = webhook();
    {
        let storage = Storage::open(&path).await.unwrap();
        storage.save_trigger(&config).await.unwrap();
    }
    let storage = Storage::open(&path).await.unwrap();
    let loaded = storage.get_trigger(&config.id).await.unwrap().unwrap();
    assert_eq!(loaded, config);
    assert_eq!(storage.list_triggers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn fire_counters_are_kept_across_config_updates() {
    let storage = Storage::open_in_memory().unwrap();
    let mut config = webhook();
    storage.save_trigger(&config).await.unwrap();

    let at = Utc::now();
    storage.record_trigger_fire(&config.id, true, at).await.unwrap();
    storage.record_trigger_fire(&config.id, false, at).await.unwrap();

    config.enabled = false;
    storage.save_trigger(&config).await.unwrap();

    let loaded = storage.get_trigger(&config.id).await.unwrap().unwrap();
    assert!(!loaded.enabled);
    assert_eq!(loaded.trigger_count, 2);
    assert_eq!(loaded.success_count, 1);
    assert_eq!(
        loaded.last_triggered.map(|t| t.timestamp_millis()),
        Some(at.timestamp_millis())
    );
}

#[tokio::test]
async fn delete_reports_whether_a_row_existed() {
    let storage = Storage::open_in_memory().unwrap();
    let config = webhook();
    storage.save_trigger(&config).await.unwrap();
    assert!(storage.delete_trigger(&config.id).await.unwrap());
    assert!(!storage.delete_trigger(&config.id).await.unwrap());
    assert!(storage.get_trigger(&config.id).await.unwrap().is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn database_directory_is_private() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    Storage::open(data.join("queue.db")).await.unwrap();
    let mode = std::fs::metadata(&data).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o700);
}
