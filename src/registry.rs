//! Bounded task registry
//!
//! Holds every task record together with its runtime handles (execution
//! context, cancellation token, completion signal) and keeps the session
//! hierarchy index in step with the records. The registry is a plain
//! structure; the orchestrator guards it with a single lock so that each
//! operation here is atomic to observers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::SessionBackend;
use crate::config::OrchestratorConfig;
use crate::error::TaskError;
use crate::hierarchy::SessionHierarchy;
use crate::ids::{SessionId, TaskId};
use crate::signal::CompletionSignal;
use crate::task::{Task, TaskStatus};

/// Registry record for one task
struct TaskEntry {
    task: Task,
    /// Insertion order; breaks created_at ties
    seq: u64,
    /// Backend handle used for aborts and notifications, released at terminal state
    context: Option<Arc<dyn SessionBackend>>,
    cancel: Option<CancellationToken>,
    done: Option<Arc<CompletionSignal>>,
}

impl TaskEntry {
    fn release(&mut self) -> Option<Arc<dyn SessionBackend>> {
        self.cancel = None;
        if let Some(done) = self.done.take() {
            done.fire();
        }
        self.context.take()
    }
}

/// Outcome of a terminal transition that actually happened
pub struct Released {
    /// Task state right after the transition
    pub task: Task,
    /// Execution context handed back for notification delivery
    pub context: Option<Arc<dyn SessionBackend>>,
}

/// Bounded store of task records with staleness and capacity eviction
pub struct TaskRegistry {
    entries: HashMap<TaskId, TaskEntry>,
    hierarchy: SessionHierarchy,
    /// Tasks whose upcoming interruption event is self-inflicted
    programmatic: HashSet<TaskId>,
    next_seq: u64,
    max_tasks: usize,
    ttl: Duration,
    max_result_chars: usize,
}

impl TaskRegistry {
    /// Create an empty registry with the configured limits
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            entries: HashMap::new(),
            hierarchy: SessionHierarchy::new(),
            programmatic: HashSet::new(),
            next_seq: 0,
            max_tasks: config.max_tasks.max(1),
            ttl: config.task_ttl(),
            max_result_chars: config.max_result_chars.max(1),
        }
    }

    /// Register a new task and its runtime handles
    ///
    /// Returns the task's completion signal. Fails if every slot is held by an
    /// in-flight task.
    pub fn register(
        &mut self,
        task: Task,
        context: Option<Arc<dyn SessionBackend>>,
        cancel: CancellationToken,
    ) -> Result<Arc<CompletionSignal>, TaskError> {
        self.evict_stale(Utc::now());
        self.evict_for_capacity(self.max_tasks.saturating_sub(1));

        if self.entries.len() >= self.max_tasks {
            warn!(
                capacity = self.max_tasks,
                task_id = %task.id,
                "Task registry full of in-flight tasks; rejecting registration"
            );
            return Err(TaskError::CapacityExhausted {
                capacity: self.max_tasks,
            });
        }

        let done = Arc::new(CompletionSignal::new());
        self.hierarchy.add_task(
            task.id.clone(),
            task.parent_session_id.clone(),
            task.child_session_id.clone(),
        );
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            task.id.clone(),
            TaskEntry {
                task,
                seq,
                context,
                cancel: Some(cancel),
                done: Some(Arc::clone(&done)),
            },
        );

        Ok(done)
    }

    /// Get a snapshot of a task
    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.entries.get(id).map(|e| e.task.clone())
    }

    /// Current status of a task
    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.entries.get(id).map(|e| e.task.status)
    }

    /// Snapshot of all tasks, oldest first
    pub fn list(&self) -> Vec<Task> {
        let mut entries: Vec<&TaskEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.task.clone()).collect()
    }

    /// Record the session a task runs in
    pub fn set_child_session(&mut self, id: &TaskId, session_id: SessionId) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if !entry.task.set_child_session(session_id.clone()) {
            return false;
        }
        self.hierarchy.set_child(id, session_id)
    }

    /// Running -> Completed
    pub fn complete(&mut self, id: &TaskId, result: &str) -> Option<Released> {
        let max = self.max_result_chars;
        self.finish(id, |task| task.complete(result, max))
    }

    /// Running -> Failed
    pub fn fail(&mut self, id: &TaskId, error: &str) -> Option<Released> {
        let max = self.max_result_chars;
        self.finish(id, |task| task.fail(error, max))
    }

    /// Running | Cancelling -> Cancelled
    pub fn cancel(&mut self, id: &TaskId, reason: Option<&str>) -> Option<Released> {
        let max = self.max_result_chars;
        self.finish(id, |task| task.cancel(reason, max))
    }

    /// Running -> Cancelling
    pub fn mark_cancelling(&mut self, id: &TaskId) -> bool {
        self.entries
            .get_mut(id)
            .is_some_and(|e| e.task.mark_cancelling())
    }

    fn finish(&mut self, id: &TaskId, transition: impl FnOnce(&mut Task) -> bool) -> Option<Released> {
        let entry = self.entries.get_mut(id)?;
        if !transition(&mut entry.task) {
            return None;
        }
        let context = entry.release();
        let task = entry.task.clone();
        self.evict_stale(Utc::now());
        Some(Released { task, context })
    }

    /// Cancellation token of an in-flight task
    pub fn cancel_token(&self, id: &TaskId) -> Option<CancellationToken> {
        self.entries.get(id).and_then(|e| e.cancel.clone())
    }

    /// Execution context of an in-flight task
    pub fn context(&self, id: &TaskId) -> Option<Arc<dyn SessionBackend>> {
        self.entries.get(id).and_then(|e| e.context.clone())
    }

    /// Completion signal of an in-flight task
    pub fn signal(&self, id: &TaskId) -> Option<Arc<CompletionSignal>> {
        self.entries.get(id).and_then(|e| e.done.clone())
    }

    // === Programmatic cancel flags ===

    /// Flag the next interruption of this task as self-inflicted
    pub fn mark_programmatic(&mut self, id: &TaskId) {
        self.programmatic.insert(id.clone());
    }

    /// Whether the task carries the self-inflicted interruption flag
    pub fn is_programmatic(&self, id: &TaskId) -> bool {
        self.programmatic.contains(id)
    }

    /// Clear the flag, returning whether it was set
    pub fn take_programmatic(&mut self, id: &TaskId) -> bool {
        self.programmatic.remove(id)
    }

    // === Hierarchy queries ===

    /// Session hierarchy index
    pub fn hierarchy(&self) -> &SessionHierarchy {
        &self.hierarchy
    }

    /// True if no task runs in the session
    pub fn is_top_level(&self, session_id: &SessionId) -> bool {
        self.hierarchy.is_top_level(session_id)
    }

    /// Task running in the given session
    pub fn find_by_child_session(&self, session_id: &SessionId) -> Option<Task> {
        self.hierarchy
            .task_for_child_session(session_id)
            .and_then(|id| self.get(&id))
    }

    /// Tasks dispatched directly from a session
    pub fn children_tasks(&self, session_id: &SessionId) -> Vec<Task> {
        self.snapshots(self.hierarchy.children_of(session_id))
    }

    /// Tasks dispatched from a session or anywhere below it
    pub fn descendant_tasks(&self, session_id: &SessionId) -> Vec<Task> {
        self.snapshots(self.hierarchy.descendants_of(session_id))
    }

    /// Root of the session tree containing the session
    pub fn top_level_ancestor(&self, session_id: &SessionId) -> SessionId {
        self.hierarchy.top_level_ancestor(session_id)
    }

    fn snapshots(&self, ids: Vec<TaskId>) -> Vec<Task> {
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    // === Eviction ===

    /// Drop finished tasks whose retention window has passed
    pub fn evict_stale(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.ttl;
        let stale: Vec<TaskId> = self
            .entries
            .values()
            .filter(|e| e.task.status.is_terminal())
            .filter(|e| {
                e.task
                    .completed_at
                    .and_then(|at| now.signed_duration_since(at).to_std().ok())
                    .is_some_and(|age| age > ttl)
            })
            .map(|e| e.task.id.clone())
            .collect();

        for id in &stale {
            self.remove(id);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "Evicted stale tasks");
        }
        stale.len()
    }

    /// Drop the oldest finished tasks until at most `target` remain
    ///
    /// In-flight tasks are never evicted, so the registry may stay above
    /// `target` when it is full of running work.
    fn evict_for_capacity(&mut self, target: usize) -> usize {
        if self.entries.len() <= target {
            return 0;
        }
        let mut finished: Vec<(DateTime<Utc>, u64, TaskId)> = self
            .entries
            .values()
            .filter(|e| !e.task.status.is_active())
            .map(|e| (e.task.created_at, e.seq, e.task.id.clone()))
            .collect();
        finished.sort();

        let mut evicted = 0;
        for (_, _, id) in finished {
            if self.entries.len() <= target {
                break;
            }
            self.remove(&id);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(count = evicted, "Evicted oldest finished tasks for capacity");
        }
        evicted
    }

    fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let mut entry = self.entries.remove(id)?;
        let _ = entry.release();
        self.hierarchy.remove_task(id);
        self.programmatic.remove(id);
        Some(entry.task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_tasks
    }

    pub fn max_result_chars(&self) -> usize {
        self.max_result_chars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;

    fn registry(max_tasks: usize) -> TaskRegistry {
        TaskRegistry::new(&OrchestratorConfig::default().with_max_tasks(max_tasks))
    }

    fn task(parent: &str) -> Task {
        Task::new("explore", "look", SessionId::from(parent), "coder", None)
    }

    fn add(reg: &mut TaskRegistry, parent: &str) -> TaskId {
        let t = task(parent);
        let id = t.id.clone();
        reg.register(t, None, CancellationToken::new()).unwrap();
        id
    }

    // === Registration Tests ===

    #[test]
    fn test_registry_creation() {
        let reg = registry(5);
        assert!(reg.is_empty());
        assert_eq!(reg.capacity(), 5);
    }

    #[test]
    fn test_register_and_get() {
        let mut reg = registry(5);
        let id = add(&mut reg, "root");

        let task = reg.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(reg.cancel_token(&id).is_some());
        assert!(reg.signal(&id).is_some());
        assert_eq!(reg.hierarchy().children_of(&SessionId::from("root")), vec![id]);
    }

    #[test]
    fn test_list_oldest_first() {
        let mut reg = registry(5);
        let a = add(&mut reg, "root");
        let b = add(&mut reg, "root");
        let ids: Vec<TaskId> = reg.list().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    // === Transition Tests ===

    #[test]
    fn test_complete_releases_handles() {
        let mut reg = registry(5);
        let t = task("root");
        let id = t.id.clone();
        let backend: Arc<dyn SessionBackend> = Arc::new(MockBackend::new());
        let signal = reg.register(t, Some(backend), CancellationToken::new()).unwrap();

        let released = reg.complete(&id, "ok").unwrap();
        assert!(released.context.is_some());
        assert_eq!(released.task.status, TaskStatus::Completed);
        assert!(signal.is_fired());
        assert!(reg.context(&id).is_none());
        assert!(reg.cancel_token(&id).is_none());
        assert!(reg.signal(&id).is_none());
    }

    #[test]
    fn test_second_transition_releases_nothing() {
        let mut reg = registry(5);
        let id = add(&mut reg, "root");

        assert!(reg.fail(&id, "boom").is_some());
        assert!(reg.complete(&id, "late").is_none());
        assert!(reg.cancel(&id, Some("late")).is_none());

        let task = reg.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(task.result.is_none());
    }

    #[test]
    fn test_cancelling_keeps_handles_until_cancelled() {
        let mut reg = registry(5);
        let id = add(&mut reg, "root");

        assert!(reg.mark_cancelling(&id));
        assert!(reg.cancel_token(&id).is_some());
        assert!(reg.complete(&id, "late").is_none());

        assert!(reg.cancel(&id, None).is_some());
        assert_eq!(reg.status(&id), Some(TaskStatus::Cancelled));
        assert!(reg.cancel_token(&id).is_none());
    }

    #[test]
    fn test_result_truncated_to_cap() {
        let config = OrchestratorConfig::default().with_max_result_chars(10);
        let mut reg = TaskRegistry::new(&config);
        let id = add(&mut reg, "root");

        reg.complete(&id, "0123456789abcdef");
        assert_eq!(reg.get(&id).unwrap().result.as_deref(), Some("6789abcdef"));
    }

    #[test]
    fn test_set_child_session_updates_index() {
        let mut reg = registry(5);
        let id = add(&mut reg, "root");

        assert!(reg.set_child_session(&id, SessionId::from("child")));
        assert!(!reg.set_child_session(&id, SessionId::from("other")));
        assert!(!reg.is_top_level(&SessionId::from("child")));
        assert_eq!(reg.find_by_child_session(&SessionId::from("child")).unwrap().id, id);
    }

    // === Capacity Tests ===

    #[test]
    fn test_capacity_evicts_oldest_finished() {
        let mut reg = registry(3);
        let a = add(&mut reg, "root");
        let b = add(&mut reg, "root");
        let c = add(&mut reg, "root");
        reg.complete(&a, "done");
        reg.complete(&b, "done");

        let d = add(&mut reg, "root");
        assert_eq!(reg.len(), 3);
        assert!(reg.get(&a).is_none());
        assert!(reg.get(&b).is_some());
        assert!(reg.get(&c).is_some());
        assert!(reg.get(&d).is_some());
    }

    #[test]
    fn test_capacity_never_evicts_in_flight() {
        let mut reg = registry(2);
        let a = add(&mut reg, "root");
        let b = add(&mut reg, "root");
        reg.mark_cancelling(&b);

        let err = reg
            .register(task("root"), None, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, TaskError::CapacityExhausted { capacity: 2 }));
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.status(&a), Some(TaskStatus::Running));
        assert_eq!(reg.status(&b), Some(TaskStatus::Cancelling));
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let mut reg = registry(4);
        for i in 0..20 {
            let id = add(&mut reg, "root");
            if i % 2 == 0 {
                reg.complete(&id, "done");
            } else {
                reg.fail(&id, "boom");
            }
            assert!(reg.len() <= 4);
        }
    }

    #[test]
    fn test_eviction_clears_index_and_flags() {
        let mut reg = registry(1);
        let a = add(&mut reg, "root");
        reg.set_child_session(&a, SessionId::from("child_a"));
        reg.mark_programmatic(&a);
        reg.cancel(&a, None);

        let _b = add(&mut reg, "root");
        assert!(reg.get(&a).is_none());
        assert!(!reg.is_programmatic(&a));
        assert!(reg.is_top_level(&SessionId::from("child_a")));
    }

    // === Staleness Tests ===

    #[test]
    fn test_stale_eviction_spares_active_tasks() {
        let mut reg = registry(10);
        let running = add(&mut reg, "root");
        let cancelling = add(&mut reg, "root");
        let done = add(&mut reg, "root");
        reg.mark_cancelling(&cancelling);
        reg.complete(&done, "ok");

        let later = Utc::now() + chrono::Duration::days(8);
        assert_eq!(reg.evict_stale(later), 1);
        assert!(reg.get(&done).is_none());
        assert!(reg.get(&running).is_some());
        assert!(reg.get(&cancelling).is_some());
    }

    #[test]
    fn test_fresh_finished_task_not_stale() {
        let mut reg = registry(10);
        let done = add(&mut reg, "root");
        reg.complete(&done, "ok");

        let soon = Utc::now() + chrono::Duration::days(6);
        assert_eq!(reg.evict_stale(soon), 0);
        assert!(reg.get(&done).is_some());
    }

    /// Push a finished task's completion time past the retention window
    fn backdate(reg: &mut TaskRegistry, id: &TaskId) {
        let entry = reg.entries.get_mut(id).unwrap();
        entry.task.completed_at = Some(Utc::now() - chrono::Duration::hours(2));
    }

    fn short_ttl_registry() -> TaskRegistry {
        TaskRegistry::new(&OrchestratorConfig::default().with_task_ttl(Duration::from_secs(3600)))
    }

    #[test]
    fn test_registration_evicts_stale_tasks() {
        let mut reg = short_ttl_registry();
        let old = add(&mut reg, "root");
        let running = add(&mut reg, "root");
        let cancelling = add(&mut reg, "root");
        reg.mark_cancelling(&cancelling);
        reg.complete(&old, "ok");
        backdate(&mut reg, &old);
        assert!(reg.get(&old).is_some());

        let fresh = add(&mut reg, "root");
        assert!(reg.get(&old).is_none());
        assert!(reg.get(&running).is_some());
        assert!(reg.get(&cancelling).is_some());
        assert!(reg.get(&fresh).is_some());
    }

    #[test]
    fn test_terminal_transitions_evict_stale_tasks() {
        let mut reg = short_ttl_registry();
        let cancelling = add(&mut reg, "root");
        reg.mark_cancelling(&cancelling);

        let finishers: [fn(&mut TaskRegistry, &TaskId) -> bool; 3] = [
            |reg: &mut TaskRegistry, id: &TaskId| reg.complete(id, "ok").is_some(),
            |reg: &mut TaskRegistry, id: &TaskId| reg.fail(id, "boom").is_some(),
            |reg: &mut TaskRegistry, id: &TaskId| reg.cancel(id, None).is_some(),
        ];
        for finish in finishers {
            let old = add(&mut reg, "root");
            let other = add(&mut reg, "root");
            reg.complete(&old, "ok");
            backdate(&mut reg, &old);

            assert!(finish(&mut reg, &other));
            assert!(reg.get(&old).is_none());
            assert!(reg.get(&other).is_some());
            assert_eq!(reg.status(&cancelling), Some(TaskStatus::Cancelling));
        }
    }

    // === Hierarchy Query Tests ===

    #[test]
    fn test_descendant_tasks() {
        let mut reg = registry(10);
        let t1 = add(&mut reg, "root");
        reg.set_child_session(&t1, SessionId::from("s1"));
        let t2 = add(&mut reg, "s1");
        reg.set_child_session(&t2, SessionId::from("s2"));
        let t3 = add(&mut reg, "s2");

        let ids: Vec<TaskId> = reg
            .descendant_tasks(&SessionId::from("s1"))
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![t2.clone(), t3]);
        assert_eq!(reg.children_tasks(&SessionId::from("root")).len(), 1);
        assert_eq!(reg.top_level_ancestor(&SessionId::from("s2")), SessionId::from("root"));
    }
}
