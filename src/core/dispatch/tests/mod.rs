
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{ConnectionHub, DispatchEngine, DispatchSettings, Placement, RobotSession};
use crate::core::bus::EventBus;
use crate::core::config::{OrchestratorConfig, PlacementPolicyKind};
use crate::core::job::{Job, JobPriority};
use crate::core::protocol::{Message, MessageBuilder, MessageType};
use crate::core::queue::QueueBackend;
use crate::core::queue::memory::MemoryQueue;
use crate::core::robot::{RobotRegistration, RobotRegistry};

struct Harness {
    engine: Arc<DispatchEngine>,
    queue: Arc<dyn QueueBackend>,
    bus: Arc<EventBus>,
}

fn harness(policy: PlacementPolicyKind) -> Harness {
    let queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(100));
    let bus = Arc::new(EventBus::new());
    let engine = Arc::new(DispatchEngine::new(
        queue.clone(),
        Arc::new(RobotRegistry::new()),
        Arc::new(ConnectionHub::new()),
        bus.clone(),
        Placement::new(policy),
        DispatchSettings::from_config(&OrchestratorConfig::default()),
    ));
    Harness { engine, queue, bus }
}

impl Harness {
    async fn submit(&self, job: Job) -> String {
        let id = job.job_id.clone();
        assert!(self.queue.enqueue(job).await.unwrap().accepted);
        id
    }

    async fn job(&self, job_id: &str) -> Job {
        self.queue.get(job_id).await.unwrap().unwrap()
    }

    async fn connect(&self, robot_id: &str, max: usize, tags: &[&str]) -> FakeRobot {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = RobotSession::new(self.engine.hub().next_connection_id(), tx);
        let registration = RobotRegistration {
            robot_id: robot_id.to_string(),
            name: String::new(),
            environment: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            max_concurrent_jobs: max,
            hostname: None,
        };
        let frame = MessageBuilder::register(&registration).unwrap().to_wire().unwrap();
        let ack = self.engine.handle_frame(&mut session, &frame).await.unwrap();
        assert_eq!(ack.msg_type, MessageType::RegisterAck);
        assert_eq!(ack.payload["success"], true);
        FakeRobot {
            id: robot_id.to_string(),
            session,
            rx,
        }
    }
}

/// A robot driven directly through the engine's frame handler.
struct FakeRobot {
    id: String,
    session: RobotSession,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl FakeRobot {
    async fn send(&mut self, h: &Harness, message: Message) -> Option<Message> {
        let frame = message.to_wire().unwrap();
        h.engine.handle_frame(&mut self.session, &frame).await
    }

    /// Next outbound message of `kind`, skipping anything else.
    fn next(&mut self, kind: MessageType) -> Option<Message> {
        while let Ok(message) = self.rx.try_recv() {
            if message.msg_type == kind {
                return Some(message);
            }
        }
        None
    }

    async fn accept(&mut self, h: &Harness, job_id: &str) {
        let accept = MessageBuilder::job_accept(job_id, &self.id, None).unwrap();
        let reply = self.send(h, accept).await;
        assert!(reply.is_none(), "unexpected reply {:?}", reply);
    }
}

fn job(id: &str, priority: JobPriority) -> Job {
    Job::with_id(id, "wf-invoices", "Invoices", "{\"nodes\":[]}", priority)
}
