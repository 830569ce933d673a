use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotStatus {
    Idle,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResourceGauges {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub disk_percent: f64,
}

/// What a robot announces about itself in `REGISTER`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RobotRegistration {
    pub robot_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default)]
    pub hostname: Option<String>,
}

fn default_max_concurrent_jobs() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RobotDescriptor {
    pub robot_id: String,
    pub name: String,
    pub environment: Option<String>,
    pub tags: Vec<String>,
    pub hostname: Option<String>,
    pub max_concurrent_jobs: usize,
    pub current_job_ids: BTreeSet<String>,
    pub status: RobotStatus,
    pub paused: bool,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub gauges: ResourceGauges,
}

impl RobotDescriptor {
    fn from_registration(reg: RobotRegistration, now: DateTime<Utc>) -> Self {
        let name = if reg.name.trim().is_empty() {
            reg.robot_id.clone()
        } else {
            reg.name
        };
        Self {
            robot_id: reg.robot_id,
            name,
            environment: reg.environment,
            tags: reg.tags,
            hostname: reg.hostname,
            max_concurrent_jobs: reg.max_concurrent_jobs.max(1),
            current_job_ids: BTreeSet::new(),
            status: RobotStatus::Idle,
            paused: false,
            registered_at: now,
            last_heartbeat: now,
            gauges: ResourceGauges::default(),
        }
    }

    pub fn free_slots(&self) -> usize {
        self.max_concurrent_jobs
            .saturating_sub(self.current_job_ids.len())
    }

    /// Fraction of capacity in use, the key for least-loaded placement.
    pub fn load(&self) -> f64 {
        self.current_job_ids.len() as f64 / self.max_concurrent_jobs.max(1) as f64
    }

    pub fn accepts_work(&self) -> bool {
        self.status != RobotStatus::Offline && !self.paused && self.free_slots() > 0
    }

    /// Whether this robot satisfies a job's affinity constraints.
    pub fn matches(&self, required_tags: &[String], environment: Option<&str>) -> bool {
        if let Some(env) = environment
            && self.environment.as_deref() != Some(env)
        {
            return false;
        }
        required_tags.iter().all(|t| self.tags.contains(t))
    }

    fn refresh_status(&mut self) {
        if self.status == RobotStatus::Offline {
            return;
        }
        self.status = if self.free_slots() == 0 {
            RobotStatus::Busy
        } else {
            RobotStatus::Idle
        };
    }
}

/// Robots that went stale during a sweep, with the jobs they were holding.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub went_offline: Vec<(String, Vec<String>)>,
    pub removed: Vec<String>,
}

#[derive(Default)]
pub struct RobotRegistry {
    robots: RwLock<HashMap<String, RobotDescriptor>>,
}

impl RobotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert on `REGISTER`. A re-registering robot keeps the jobs it still holds.
    pub async fn register(&self, reg: RobotRegistration, now: DateTime<Utc>) -> RobotDescriptor {
        let mut robots = self.robots.write().await;
        let mut descriptor = RobotDescriptor::from_registration(reg, now);
        if let Some(existing) = robots.get(&descriptor.robot_id) {
            descriptor.current_job_ids = existing.current_job_ids.clone();
            descriptor.registered_at = existing.registered_at;
            descriptor.paused = existing.paused;
        }
        descriptor.refresh_status();
        info!(
            robot_id = %descriptor.robot_id,
            max_concurrent_jobs = descriptor.max_concurrent_jobs,
            "Robot registered"
        );
        robots.insert(descriptor.robot_id.clone(), descriptor.clone());
        descriptor
    }

    /// Returns false for an unknown robot so the caller can ask it to register.
    pub async fn heartbeat(
        &self,
        robot_id: &str,
        gauges: Option<ResourceGauges>,
        now: DateTime<Utc>,
    ) -> bool {
        let mut robots = self.robots.write().await;
        let Some(robot) = robots.get_mut(robot_id) else {
            return false;
        };
        robot.last_heartbeat = now;
        if let Some(g) = gauges {
            robot.gauges = g;
        }
        if robot.status == RobotStatus::Offline {
            info!(robot_id = %robot_id, "Robot back online");
            robot.status = RobotStatus::Idle;
        }
        robot.refresh_status();
        true
    }

    pub async fn assign(&self, robot_id: &str, job_id: &str) -> bool {
        let mut robots = self.robots.write().await;
        let Some(robot) = robots.get_mut(robot_id) else {
            return false;
        };
        if !robot.accepts_work() && !robot.current_job_ids.contains(job_id) {
            return false;
        }
        robot.current_job_ids.insert(job_id.to_string());
        robot.refresh_status();
        true
    }

    pub async fn release(&self, robot_id: &str, job_id: &str) {
        let mut robots = self.robots.write().await;
        if let Some(robot) = robots.get_mut(robot_id) {
            robot.current_job_ids.remove(job_id);
            robot.refresh_status();
        }
    }

    pub async fn set_paused(&self, robot_id: &str, paused: bool) -> bool {
        let mut robots = self.robots.write().await;
        match robots.get_mut(robot_id) {
            Some(robot) => {
                robot.paused = paused;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, robot_id: &str) -> Option<RobotDescriptor> {
        let removed = self.robots.write().await.remove(robot_id);
        if removed.is_some() {
            info!(robot_id = %robot_id, "Robot removed");
        }
        removed
    }

    pub async fn get(&self, robot_id: &str) -> Option<RobotDescriptor> {
        self.robots.read().await.get(robot_id).cloned()
    }

    pub async fn list(&self) -> Vec<RobotDescriptor> {
        let mut all: Vec<_> = self.robots.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.robot_id.cmp(&b.robot_id));
        all
    }

    /// Robots currently able to take another job, sorted by id.
    pub async fn eligible(&self) -> Vec<RobotDescriptor> {
        let mut out: Vec<_> = self
            .robots
            .read()
            .await
            .values()
            .filter(|r| r.accepts_work())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.robot_id.cmp(&b.robot_id));
        out
    }

    pub async fn online_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .robots
            .read()
            .await
            .values()
            .filter(|r| r.status != RobotStatus::Offline)
            .map(|r| r.robot_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Marks robots whose heartbeat is older than `heartbeat_timeout` offline and
    /// hands back the jobs they held; drops robots absent longer than `removal_after`.
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        heartbeat_timeout: Duration,
        removal_after: Duration,
    ) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut robots = self.robots.write().await;

        for robot in robots.values_mut() {
            let age = now - robot.last_heartbeat;
            if robot.status != RobotStatus::Offline && age > heartbeat_timeout {
                warn!(
                    robot_id = %robot.robot_id,
                    age_secs = age.num_seconds(),
                    "Robot heartbeat stale, marking offline"
                );
                robot.status = RobotStatus::Offline;
                let held: Vec<String> = std::mem::take(&mut robot.current_job_ids)
                    .into_iter()
                    .collect();
                outcome.went_offline.push((robot.robot_id.clone(), held));
            }
        }

        robots.retain(|id, robot| {
            let expired = robot.status == RobotStatus::Offline
                && now - robot.last_heartbeat > removal_after;
            if expired {
                outcome.removed.push(id.clone());
            }
            !expired
        });

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(id: &str, max: usize) -> RobotRegistration {
        RobotRegistration {
            robot_id: id.to_string(),
            name: String::new(),
            environment: Some("prod".to_string()),
            tags: vec!["excel".to_string()],
            max_concurrent_jobs: max,
            hostname: None,
        }
    }

    #[tokio::test]
    async fn register_then_fill_capacity_marks_busy() {
        let registry = RobotRegistry::new();
        let now = Utc::now();
        let robot = registry.register(reg("r1", 1), now).await;
        assert_eq!(robot.status, RobotStatus::Idle);
        assert_eq!(robot.name, "r1");

        assert!(registry.assign("r1", "job-1").await);
        let robot = registry.get("r1").await.unwrap();
        assert_eq!(robot.status, RobotStatus::Busy);
        assert!(!registry.assign("r1", "job-2").await);
        assert!(registry.eligible().await.is_empty());

        registry.release("r1", "job-1").await;
        assert_eq!(registry.get("r1").await.unwrap().status, RobotStatus::Idle);
    }

    #[tokio::test]
    async fn reregister_keeps_held_jobs() {
        let registry = RobotRegistry::new();
        let now = Utc::now();
        registry.register(reg("r1", 2), now).await;
        registry.assign("r1", "job-1").await;
        let robot = registry.register(reg("r1", 2), now).await;
        assert!(robot.current_job_ids.contains("job-1"));
    }

    #[tokio::test]
    async fn stale_robot_goes_offline_and_returns_jobs() {
        let registry = RobotRegistry::new();
        let start = Utc::now();
        registry.register(reg("r1", 2), start).await;
        registry.register(reg("r2", 2), start).await;
        registry.assign("r1", "job-1").await;
        registry.heartbeat("r2", None, start + Duration::seconds(40)).await;

        let outcome = registry
            .sweep(
                start + Duration::seconds(45),
                Duration::seconds(30),
                Duration::seconds(300),
            )
            .await;
        assert_eq!(
            outcome.went_offline,
            vec![("r1".to_string(), vec!["job-1".to_string()])]
        );
        assert!(outcome.removed.is_empty());
        let r1 = registry.get("r1").await.unwrap();
        assert_eq!(r1.status, RobotStatus::Offline);
        assert!(r1.current_job_ids.is_empty());

        assert!(registry.heartbeat("r1", None, start + Duration::seconds(50)).await);
        assert_eq!(registry.get("r1").await.unwrap().status, RobotStatus::Idle);
    }

    #[tokio::test]
    async fn prolonged_absence_removes_robot() {
        let registry = RobotRegistry::new();
        let start = Utc::now();
        registry.register(reg("r1", 1), start).await;
        registry
            .sweep(
                start + Duration::seconds(31),
                Duration::seconds(30),
                Duration::seconds(300),
            )
            .await;
        let outcome = registry
            .sweep(
                start + Duration::seconds(301),
                Duration::seconds(30),
                Duration::seconds(300),
            )
            .await;
        assert_eq!(outcome.removed, vec!["r1".to_string()]);
        assert!(registry.get("r1").await.is_none());
    }

    #[test]
    fn affinity_requires_all_tags_and_environment() {
        let robot = RobotDescriptor::from_registration(reg("r1", 1), Utc::now());
        assert!(robot.matches(&["excel".to_string()], Some("prod")));
        assert!(robot.matches(&[], None));
        assert!(!robot.matches(&["sap".to_string()], None));
        assert!(!robot.matches(&[], Some("staging")));
    }

    #[tokio::test]
    async fn paused_robot_is_not_eligible() {
        let registry = RobotRegistry::new();
        registry.register(reg("r1", 1), Utc::now()).await;
        assert!(registry.set_paused("r1", true).await);
        assert!(registry.eligible().await.is_empty());
        assert!(!registry.assign("r1", "job-1").await);
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_robot_is_refused() {
        let registry = RobotRegistry::new();
        assert!(!registry.heartbeat("ghost", None, Utc::now()).await);
    }
}
