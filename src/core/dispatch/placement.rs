use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::config::PlacementPolicyKind;
use crate::core::robot::RobotDescriptor;

/// Chooses one robot among already-filtered candidates.
pub struct Placement {
    kind: PlacementPolicyKind,
    cursor: AtomicUsize,
}

impl Placement {
    pub fn new(kind: PlacementPolicyKind) -> Self {
        Self {
            kind,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> PlacementPolicyKind {
        self.kind
    }

    /// `candidates` must be sorted by robot id so round-robin is stable.
    pub fn select<'a>(&self, candidates: &[&'a RobotDescriptor]) -> Option<&'a RobotDescriptor> {
        if candidates.is_empty() {
            return None;
        }
        match self.kind {
            PlacementPolicyKind::LeastLoaded => candidates.iter().copied().min_by(|a, b| {
                a.load()
                    .total_cmp(&b.load())
                    .then(b.free_slots().cmp(&a.free_slots()))
                    .then(a.robot_id.cmp(&b.robot_id))
            }),
            PlacementPolicyKind::RoundRobin => {
                let turn = self.cursor.fetch_add(1, Ordering::Relaxed);
                Some(candidates[turn % candidates.len()])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::robot::{RobotRegistry, RobotRegistration};
    use chrono::Utc;

    async fn fleet() -> Vec<RobotDescriptor> {
        let registry = RobotRegistry::new();
        for (id, max) in [("r1", 2), ("r2", 4), ("r3", 1)] {
            registry
                .register(
                    RobotRegistration {
                        robot_id: id.to_string(),
                        name: String::new(),
                        environment: None,
                        tags: Vec::new(),
                        max_concurrent_jobs: max,
                        hostname: None,
                    },
                    Utc::now(),
                )
                .await;
        }
        registry.assign("r1", "j1").await;
        registry.assign("r2", "j2").await;
        registry.list().await
    }

    #[tokio::test]
    async fn least_loaded_prefers_lowest_utilisation() {
        let robots = fleet().await;
        let refs: Vec<&RobotDescriptor> = robots.iter().collect();
        let placement = Placement::new(PlacementPolicyKind::LeastLoaded);
        // r3 is idle with one slot, r2 is 25% used, r1 is 50% used.
        assert_eq!(placement.select(&refs).unwrap().robot_id, "r3");
        assert_eq!(placement.select(&refs[..2]).unwrap().robot_id, "r2");
    }

    #[tokio::test]
    async fn round_robin_rotates_over_candidates() {
        let robots = fleet().await;
        let refs: Vec<&RobotDescriptor> = robots.iter().collect();
        let placement = Placement::new(PlacementPolicyKind::RoundRobin);
        let picks: Vec<_> = (0..4)
            .map(|_| placement.select(&refs).unwrap().robot_id.clone())
            .collect();
        assert_eq!(picks, ["r1", "r2", "r3", "r1"]);
        assert!(placement.select(&[]).is_none());
    }
}
