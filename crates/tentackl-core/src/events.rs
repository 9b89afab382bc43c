//! Event bus and per-task event streams.
//!
//! The bus is append-only with one writer per event. Every event lands on
//! the global channel (`tentackl:eventbus:events:all`) and on a per-task
//! channel (`task:events:<task_id>`) with a bounded replay buffer so
//! late-joining observers can catch up.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

/// Name of the global event channel.
pub const GLOBAL_CHANNEL: &str = "tentackl:eventbus:events:all";

/// Name of a per-task event channel.
pub fn task_channel(task_id: Uuid) -> String {
    format!("task:events:{task_id}")
}

/// Number of events retained per task for replay.
const REPLAY_BUFFER: usize = 100;

/// Broadcast channel capacity; slow subscribers drop the oldest events.
const CHANNEL_CAPACITY: usize = 256;

/// One event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub task_id: Uuid,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(event_type: &str, task_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_owned(),
            task_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Terminal events end observe subscriptions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            "task.task_completed" | "task.task_failed" | "task.task_cancelled"
        )
    }
}

/// In-process event bus with per-task replay.
pub struct EventBus {
    global: broadcast::Sender<TaskEvent>,
    per_task: RwLock<HashMap<Uuid, TaskChannel>>,
}

struct TaskChannel {
    sender: broadcast::Sender<TaskEvent>,
    replay: VecDeque<TaskEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (global, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            global,
            per_task: RwLock::new(HashMap::new()),
        }
    }

    /// Publish an event to the global and per-task channels.
    pub async fn publish(&self, event: TaskEvent) {
        let _ = self.global.send(event.clone());

        let mut per_task = self.per_task.write().await;
        let channel = per_task.entry(event.task_id).or_insert_with(|| {
            let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
            TaskChannel {
                sender,
                replay: VecDeque::with_capacity(REPLAY_BUFFER),
            }
        });
        if channel.replay.len() == REPLAY_BUFFER {
            channel.replay.pop_front();
        }
        channel.replay.push_back(event.clone());
        let _ = channel.sender.send(event);
    }

    /// Subscribe to one task's events.
    pub async fn subscribe(&self, task_id: Uuid) -> broadcast::Receiver<TaskEvent> {
        let mut per_task = self.per_task.write().await;
        let channel = per_task.entry(task_id).or_insert_with(|| {
            let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
            TaskChannel {
                sender,
                replay: VecDeque::with_capacity(REPLAY_BUFFER),
            }
        });
        channel.sender.subscribe()
    }

    /// Subscribe to every event on the bus.
    pub fn subscribe_all(&self) -> broadcast::Receiver<TaskEvent> {
        self.global.subscribe()
    }

    /// Replay up to `count` recent events for a task, oldest first.
    pub async fn get_recent(&self, task_id: Uuid, count: usize) -> Vec<TaskEvent> {
        let per_task = self.per_task.read().await;
        match per_task.get(&task_id) {
            Some(channel) => {
                let skip = channel.replay.len().saturating_sub(count);
                channel.replay.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop a task's channel and replay buffer.
    pub async fn close(&self, task_id: Uuid) {
        self.per_task.write().await.remove(&task_id);
    }

    // -- planning events ----------------------------------------------------

    pub async fn planning_started(&self, task_id: Uuid, goal: &str) {
        self.publish(TaskEvent::new(
            "planning.started",
            task_id,
            serde_json::json!({"goal": goal}),
        ))
        .await;
    }

    pub async fn planning_intent_detected(&self, task_id: Uuid, intent: &str, detail: &str) {
        self.publish(TaskEvent::new(
            "planning.intent_detected",
            task_id,
            serde_json::json!({"intent": intent, "detail": detail}),
        ))
        .await;
    }

    pub async fn planning_fast_path(&self, task_id: Uuid, reason: &str) {
        self.publish(TaskEvent::new(
            "planning.fast_path",
            task_id,
            serde_json::json!({"reason": reason}),
        ))
        .await;
    }

    pub async fn planning_llm_started(&self, task_id: Uuid) {
        self.publish(TaskEvent::new(
            "planning.llm_started",
            task_id,
            serde_json::json!({}),
        ))
        .await;
    }

    pub async fn planning_llm_retry(&self, task_id: Uuid, attempt: u32, max: u32, error: &str) {
        self.publish(TaskEvent::new(
            "planning.llm_retry",
            task_id,
            serde_json::json!({"attempt": attempt, "max_retries": max, "error": error}),
        ))
        .await;
    }

    pub async fn planning_steps_generated(&self, task_id: Uuid, count: usize, names: &[String]) {
        self.publish(TaskEvent::new(
            "planning.steps_generated",
            task_id,
            serde_json::json!({"step_count": count, "step_names": names}),
        ))
        .await;
    }

    pub async fn planning_risk_detection(&self, task_id: Uuid, checkpoints_added: usize) {
        self.publish(TaskEvent::new(
            "planning.risk_detection",
            task_id,
            serde_json::json!({"checkpoints_added": checkpoints_added}),
        ))
        .await;
    }

    pub async fn planning_completed(&self, task_id: Uuid, step_count: usize, method: &str) {
        self.publish(TaskEvent::new(
            "planning.completed",
            task_id,
            serde_json::json!({"step_count": step_count, "method": method}),
        ))
        .await;
    }

    pub async fn planning_failed(&self, task_id: Uuid, error: &str) {
        self.publish(TaskEvent::new(
            "planning.failed",
            task_id,
            serde_json::json!({"error": error}),
        ))
        .await;
    }

    // -- execution events ---------------------------------------------------

    pub async fn task_started(&self, task_id: Uuid, goal: &str, step_count: usize) {
        self.publish(TaskEvent::new(
            "task.started",
            task_id,
            serde_json::json!({"goal": goal, "step_count": step_count}),
        ))
        .await;
    }

    pub async fn step_started(&self, task_id: Uuid, step_id: &str, step_name: &str) {
        self.publish(TaskEvent::new(
            "task.step_started",
            task_id,
            serde_json::json!({"step_id": step_id, "step_name": step_name}),
        ))
        .await;
    }

    pub async fn step_completed(
        &self,
        task_id: Uuid,
        step_id: &str,
        step_name: &str,
        output: &serde_json::Value,
    ) {
        self.publish(TaskEvent::new(
            "task.step_completed",
            task_id,
            serde_json::json!({"step_id": step_id, "step_name": step_name, "output": output}),
        ))
        .await;
    }

    pub async fn step_failed(&self, task_id: Uuid, step_id: &str, step_name: &str, error: &str) {
        self.publish(TaskEvent::new(
            "task.step_failed",
            task_id,
            serde_json::json!({"step_id": step_id, "step_name": step_name, "error": error}),
        ))
        .await;
    }

    pub async fn checkpoint_created(
        &self,
        task_id: Uuid,
        step_id: &str,
        checkpoint_name: &str,
        preview: &serde_json::Value,
    ) {
        self.publish(TaskEvent::new(
            "task.checkpoint_created",
            task_id,
            serde_json::json!({
                "step_id": step_id,
                "checkpoint_name": checkpoint_name,
                "preview": preview,
            }),
        ))
        .await;
    }

    pub async fn task_completed(&self, task_id: Uuid, steps_completed: usize) {
        self.publish(TaskEvent::new(
            "task.task_completed",
            task_id,
            serde_json::json!({"steps_completed": steps_completed}),
        ))
        .await;
    }

    pub async fn task_failed(&self, task_id: Uuid, error: &str) {
        self.publish(TaskEvent::new(
            "task.task_failed",
            task_id,
            serde_json::json!({"error": error}),
        ))
        .await;
    }

    pub async fn task_cancelled(&self, task_id: Uuid) {
        self.publish(TaskEvent::new(
            "task.task_cancelled",
            task_id,
            serde_json::json!({}),
        ))
        .await;
    }

    pub async fn heartbeat(&self, task_id: Uuid) {
        self.publish(TaskEvent::new(
            "task.heartbeat",
            task_id,
            serde_json::json!({}),
        ))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_task_subscribers() {
        let bus = EventBus::new();
        let task_id = Uuid::new_v4();
        let mut rx = bus.subscribe(task_id).await;

        bus.step_started(task_id, "step_1", "fetch").await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "task.step_started");
        assert_eq!(event.payload["step_id"], "step_1");
    }

    #[tokio::test]
    async fn replay_returns_recent_events_in_order() {
        let bus = EventBus::new();
        let task_id = Uuid::new_v4();

        bus.planning_started(task_id, "goal").await;
        bus.planning_llm_started(task_id).await;
        bus.planning_completed(task_id, 3, "llm").await;

        let recent = bus.get_recent(task_id, 2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, "planning.llm_started");
        assert_eq!(recent[1].event_type, "planning.completed");
    }

    #[tokio::test]
    async fn other_tasks_do_not_cross_channels() {
        let bus = EventBus::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_b = bus.subscribe(b).await;

        bus.task_started(a, "goal", 1).await;
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn terminal_event_detection() {
        let id = Uuid::new_v4();
        assert!(TaskEvent::new("task.task_completed", id, serde_json::json!({})).is_terminal());
        assert!(TaskEvent::new("task.task_failed", id, serde_json::json!({})).is_terminal());
        assert!(!TaskEvent::new("task.step_completed", id, serde_json::json!({})).is_terminal());
    }

    #[test]
    fn channel_names() {
        assert_eq!(GLOBAL_CHANNEL, "tentackl:eventbus:events:all");
        let id = Uuid::nil();
        assert_eq!(task_channel(id), format!("task:events:{id}"));
    }
}
