use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::dispatch::DispatchEngine;
use crate::core::triggers::TriggerRunner;
use crate::core::triggers::schedule::SharedScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Starting,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send + Sync>>>,
    scheduler: SharedScheduler,
    cancel: CancellationToken,
}

impl LifecycleManager {
    pub fn new(scheduler: SharedScheduler, cancel: CancellationToken) -> Self {
        Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            scheduler,
            cancel,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send + Sync>>) {
        self.components.push(component);
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Starting components");
        self.state = LifecycleState::Starting;
        for comp in &self.components {
            comp.lock().await.on_start().await?;
        }

        info!("Lifecycle Phase: Ready (Starting Scheduler)");
        self.scheduler.lock().await.start().await?;
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        self.cancel.cancelled().await;
    }

    /// Stops components in reverse start order. Individual failures are logged.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;
        self.cancel.cancel();

        for comp in self.components.iter().rev() {
            if let Err(e) = comp.lock().await.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }
        if let Err(e) = self.scheduler.lock().await.shutdown().await {
            warn!("Scheduler shutdown error: {}", e);
        }
        Ok(())
    }
}

/// Runs dispatch cycles and the robot/timeout sweep in the background.
pub struct DispatchLoop {
    engine: Arc<DispatchEngine>,
    cycle_every: Duration,
    sweep_every: Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DispatchLoop {
    pub fn new(
        engine: Arc<DispatchEngine>,
        cycle_every: Duration,
        sweep_every: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            cycle_every,
            sweep_every,
            cancel: cancel.child_token(),
            handle: None,
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for DispatchLoop {
    async fn on_start(&mut self) -> Result<()> {
        let engine = self.engine.clone();
        self.handle = Some(tokio::spawn(engine.run(
            self.cycle_every,
            self.sweep_every,
            self.cancel.clone(),
        )));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }
}

/// Brings persisted triggers up on start and stops every listener on shutdown.
pub struct TriggerService {
    runner: Arc<TriggerRunner>,
}

impl TriggerService {
    pub fn new(runner: Arc<TriggerRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for TriggerService {
    async fn on_start(&mut self) -> Result<()> {
        self.runner.load_and_start_all().await?;
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.runner.stop_all().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_cron_scheduler::JobScheduler;

    struct Recorder {
        name: &'static str,
        log: Arc<std::sync::Mutex<Vec<String>>>,
        fail_shutdown: bool,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Recorder {
        async fn on_start(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        async fn on_shutdown(&mut self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            if self.fail_shutdown {
                anyhow::bail!("{} refused to stop", self.name);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn components_stop_in_reverse_order_despite_failures() {
        let scheduler = Arc::new(Mutex::new(JobScheduler::new().await.unwrap()));
        let cancel = CancellationToken::new();
        let mut manager = LifecycleManager::new(scheduler, cancel.clone());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        for (name, fail_shutdown) in [("a", false), ("b", true)] {
            manager.attach(Arc::new(Mutex::new(Recorder {
                name,
                log: log.clone(),
                fail_shutdown,
            })));
        }

        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Ready);
        manager.shutdown().await.unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(manager.state(), LifecycleState::Shutdown);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start a", "start b", "stop b", "stop a"]
        );
    }

    #[tokio::test]
    async fn failing_start_aborts_startup() {
        struct Broken(Arc<AtomicUsize>);

        #[async_trait::async_trait]
        impl LifecycleComponent for Broken {
            async fn on_start(&mut self) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("port in use")
            }
        }

        let scheduler = Arc::new(Mutex::new(JobScheduler::new().await.unwrap()));
        let mut manager = LifecycleManager::new(scheduler, CancellationToken::new());
        let starts = Arc::new(AtomicUsize::new(0));
        manager.attach(Arc::new(Mutex::new(Broken(starts.clone()))));
        assert!(manager.start().await.is_err());
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_ne!(manager.state(), LifecycleState::Ready);
    }
}
