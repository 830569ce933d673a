use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{TriggerConfig, TriggerEmitter};
use crate::core::errors::{OrchestratorError, Result};
use crate::platform::{NativePlatform, Platform};

pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Moved => "moved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" | "create" => Some(ChangeKind::Created),
            "modified" | "modify" => Some(ChangeKind::Modified),
            "deleted" | "delete" | "removed" => Some(ChangeKind::Deleted),
            "moved" | "renamed" => Some(ChangeKind::Moved),
            _ => None,
        }
    }

    /// Maps a notify event; access and unknown events are ignored.
    pub fn classify(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(ChangeKind::Created),
            EventKind::Remove(_) => Some(ChangeKind::Deleted),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(ChangeKind::Deleted),
            EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Moved),
            EventKind::Modify(_) => Some(ChangeKind::Modified),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
        }
    }
}

/// Rejects `..` traversal, filesystem roots and system directories.
pub fn validate_watch_path(raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(OrchestratorError::Configuration(
            "file watch path is required".to_string(),
        ));
    }
    let path = PathBuf::from(raw);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(OrchestratorError::Configuration(format!(
            "file watch path '{}' must not contain '..'",
            raw
        )));
    }
    if path.parent().is_none() {
        return Err(OrchestratorError::Configuration(format!(
            "refusing to watch filesystem root '{}'",
            raw
        )));
    }
    for dir in NativePlatform::system_dirs() {
        let system = Path::new(dir);
        if path.starts_with(system) {
            return Err(OrchestratorError::Configuration(format!(
                "refusing to watch system directory '{}'",
                raw
            )));
        }
    }
    Ok(path)
}

/// Which changes under the watched root are interesting.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    patterns: Vec<glob::Pattern>,
    kinds: HashSet<ChangeKind>,
}

impl WatchFilter {
    pub fn from_config(config: &TriggerConfig) -> Result<Self> {
        let mut patterns = Vec::new();
        for raw in config.config_list("patterns") {
            let pattern = glob::Pattern::new(&raw).map_err(|e| {
                OrchestratorError::Configuration(format!("invalid glob '{}': {}", raw, e))
            })?;
            patterns.push(pattern);
        }

        let mut kinds = HashSet::new();
        for raw in config.config_list("events") {
            let kind = ChangeKind::parse(&raw).ok_or_else(|| {
                OrchestratorError::Configuration(format!("unknown file event type '{}'", raw))
            })?;
            kinds.insert(kind);
        }
        if kinds.is_empty() {
            kinds.extend([
                ChangeKind::Created,
                ChangeKind::Modified,
                ChangeKind::Deleted,
                ChangeKind::Moved,
            ]);
        }
        Ok(Self { patterns, kinds })
    }

    pub fn accepts(&self, path: &Path, kind: ChangeKind) -> bool {
        if !self.kinds.contains(&kind) {
            return false;
        }
        if self.patterns.is_empty() {
            return true;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.patterns
            .iter()
            .any(|p| p.matches(&name) || p.matches_path(path))
    }
}

/// Per-path debounce: every event pushes that path's deadline out by the window.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, (ChangeKind, Instant)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, path: PathBuf, kind: ChangeKind, now: Instant) {
        self.pending.insert(path, (kind, now + self.window));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(_, due)| *due).min()
    }

    /// Removes and returns every path that has been quiet for the full window.
    pub fn take_due(&mut self, now: Instant) -> Vec<(PathBuf, ChangeKind)> {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        let mut out = Vec::with_capacity(due.len());
        for path in due {
            if let Some((kind, _)) = self.pending.remove(&path) {
                out.push((path, kind));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

pub fn validate_config(config: &TriggerConfig) -> Result<()> {
    let path = config.config_str("path").ok_or_else(|| {
        OrchestratorError::Configuration("file watch trigger requires 'path'".to_string())
    })?;
    validate_watch_path(path)?;
    WatchFilter::from_config(config)?;
    Ok(())
}

fn event_payload(root: &Path, path: &Path, kind: ChangeKind) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("file_path".to_string(), json!(path.to_string_lossy()));
    payload.insert(
        "file_name".to_string(),
        json!(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ),
    );
    payload.insert(
        "directory".to_string(),
        json!(
            path.parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        ),
    );
    payload.insert("event_type".to_string(), json!(kind.as_str()));
    payload.insert("watch_path".to_string(), json!(root.to_string_lossy()));
    payload
}

/// Consumes raw notify events on the engine side of the channel, debounces them
/// per path and emits once each path goes quiet.
pub fn spawn_debounce_loop(
    root: PathBuf,
    mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    filter: WatchFilter,
    window: Duration,
    emitter: TriggerEmitter,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut debouncer = Debouncer::new(window);
        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(Ok(event)) => {
                        let Some(kind) = ChangeKind::classify(&event.kind) else {
                            continue;
                        };
                        for path in event.paths {
                            if filter.accepts(&path, kind) {
                                debouncer.push(path, kind, Instant::now());
                            }
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "File watcher reported an error"),
                    None => {
                        debug!("File watcher channel closed");
                        break;
                    }
                },
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    for (path, kind) in debouncer.take_due(Instant::now()) {
                        let mut metadata = Map::new();
                        metadata.insert("source".to_string(), json!("file_watch"));
                        emitter.emit(event_payload(&root, &path, kind), metadata).await;
                    }
                }
            }
        }
    })
}

/// Watches a directory through the OS notifier.
#[derive(Default)]
pub struct FileWatchTrigger {
    watcher: Option<RecommendedWatcher>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    error: Option<String>,
}

impl FileWatchTrigger {
    pub(super) fn start(&mut self, emitter: TriggerEmitter) -> bool {
        self.stop();
        match self.try_start(emitter) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "File watch trigger failed to start");
                self.error = Some(e.to_string());
                self.stop_resources();
                false
            }
        }
    }

    fn try_start(&mut self, emitter: TriggerEmitter) -> Result<()> {
        let config = emitter.trigger().clone();
        validate_config(&config)?;
        let raw_path = config.config_str("path").unwrap_or_default();
        let root = validate_watch_path(raw_path)?;
        if !root.exists() {
            return Err(OrchestratorError::Configuration(format!(
                "watch path '{}' does not exist",
                root.display()
            )));
        }
        let filter = WatchFilter::from_config(&config)?;
        let window = Duration::from_millis(config.config_u64("debounce_ms").unwrap_or(DEFAULT_DEBOUNCE_MS));
        let mode = match config.config.get("recursive").and_then(|v| v.as_bool()) {
            Some(true) => RecursiveMode::Recursive,
            _ => RecursiveMode::NonRecursive,
        };

        // The notifier calls back on its own thread; only the channel crosses over.
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| OrchestratorError::Configuration(format!("cannot create watcher: {}", e)))?;
        watcher.watch(&root, mode).map_err(|e| {
            OrchestratorError::Configuration(format!("cannot watch '{}': {}", root.display(), e))
        })?;

        let cancel = CancellationToken::new();
        info!(
            trigger_id = %config.id,
            path = %root.display(),
            debounce_ms = window.as_millis() as u64,
            "File watch started"
        );
        self.task = Some(spawn_debounce_loop(
            root,
            rx,
            filter,
            window,
            emitter,
            cancel.clone(),
        ));
        self.watcher = Some(watcher);
        self.cancel = Some(cancel);
        self.error = None;
        Ok(())
    }

    fn stop_resources(&mut self) {
        self.watcher = None;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub(super) fn stop(&mut self) {
        self.stop_resources();
    }

    pub(super) fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_and_system_paths_are_rejected() {
        assert!(validate_watch_path("").is_err());
        assert!(validate_watch_path("/home/bot/../../etc").is_err());
        assert!(validate_watch_path("/").is_err());
        #[cfg(unix)]
        {
            assert!(validate_watch_path("/etc").is_err());
            assert!(validate_watch_path("/proc/self").is_err());
            assert!(validate_watch_path("/home/bot/inbox").is_ok());
        }
    }

    #[test]
    fn classify_maps_notify_kinds() {
        use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind};
        assert_eq!(
            ChangeKind::classify(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            ChangeKind::classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            ChangeKind::classify(&EventKind::Remove(RemoveKind::File)),
            Some(ChangeKind::Deleted)
        );
        assert_eq!(
            ChangeKind::classify(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            Some(ChangeKind::Moved)
        );
        assert_eq!(ChangeKind::classify(&EventKind::Access(AccessKind::Any)), None);
    }

    #[test]
    fn filter_applies_globs_and_event_types() {
        let config = TriggerConfig::new("csv", super::super::TriggerType::FileWatch, "wf")
            .setting("path", json!("/data/in"))
            .setting("patterns", json!(["*.csv", "*.xlsx"]))
            .setting("events", json!(["created", "modified"]));
        let filter = WatchFilter::from_config(&config).unwrap();
        assert!(filter.accepts(Path::new("/data/in/a.csv"), ChangeKind::Created));
        assert!(filter.accepts(Path::new("/data/in/b.xlsx"), ChangeKind::Modified));
        assert!(!filter.accepts(Path::new("/data/in/c.txt"), ChangeKind::Created));
        assert!(!filter.accepts(Path::new("/data/in/a.csv"), ChangeKind::Deleted));
    }

    #[test]
    fn unknown_event_type_is_a_configuration_error() {
        let config = TriggerConfig::new("x", super::super::TriggerType::FileWatch, "wf")
            .setting("path", json!("/data/in"))
            .setting("events", json!(["exploded"]));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn debouncer_resets_deadline_on_each_event() {
        let start = Instant::now();
        let mut d = Debouncer::new(Duration::from_millis(200));
        let path = PathBuf::from("/data/in/a.csv");
        d.push(path.clone(), ChangeKind::Created, start);
        d.push(
            path.clone(),
            ChangeKind::Modified,
            start + Duration::from_millis(150),
        );
        assert!(d.take_due(start + Duration::from_millis(250)).is_empty());
        assert_eq!(
            d.next_deadline(),
            Some(start + Duration::from_millis(350))
        );
        assert_eq!(
            d.take_due(start + Duration::from_millis(350)),
            vec![(path, ChangeKind::Modified)]
        );
        assert!(d.next_deadline().is_none());
    }

    #[test]
    fn distinct_paths_debounce_independently() {
        let start = Instant::now();
        let mut d = Debouncer::new(Duration::from_millis(100));
        d.push(PathBuf::from("/a"), ChangeKind::Created, start);
        d.push(
            PathBuf::from("/b"),
            ChangeKind::Created,
            start + Duration::from_millis(80),
        );
        let first = d.take_due(start + Duration::from_millis(100));
        assert_eq!(first, vec![(PathBuf::from("/a"), ChangeKind::Created)]);
        let second = d.take_due(start + Duration::from_millis(180));
        assert_eq!(second, vec![(PathBuf::from("/b"), ChangeKind::Created)]);
    }
}
