//! Session hierarchy index
//!
//! Every task is an edge `parent session -> child session`. The index keeps
//! both directions so that subtree walks and ancestor lookups do not scan the
//! whole task set.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::ids::{SessionId, TaskId};

/// Edge recorded for one task
#[derive(Debug, Clone)]
struct TaskEdge {
    parent: SessionId,
    child: Option<SessionId>,
}

/// Parent/child session graph built from the registered tasks
#[derive(Debug, Default)]
pub struct SessionHierarchy {
    /// Edge per task
    edges: HashMap<TaskId, TaskEdge>,
    /// Tasks dispatched from a session, in registration order
    by_parent: HashMap<SessionId, Vec<TaskId>>,
    /// Tasks running in a session; the last one is the most recent
    by_child: HashMap<SessionId, Vec<TaskId>>,
}

impl SessionHierarchy {
    /// Create a new empty hierarchy
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task edge
    pub fn add_task(&mut self, task_id: TaskId, parent: SessionId, child: Option<SessionId>) {
        self.by_parent
            .entry(parent.clone())
            .or_default()
            .push(task_id.clone());
        if let Some(child) = &child {
            self.by_child
                .entry(child.clone())
                .or_default()
                .push(task_id.clone());
        }
        self.edges.insert(task_id, TaskEdge { parent, child });
    }

    /// Attach the child session of a task; only the first attachment counts
    pub fn set_child(&mut self, task_id: &TaskId, child: SessionId) -> bool {
        let Some(edge) = self.edges.get_mut(task_id) else {
            return false;
        };
        if edge.child.is_some() {
            return false;
        }
        edge.child = Some(child.clone());
        self.by_child.entry(child).or_default().push(task_id.clone());
        true
    }

    /// Remove a task edge
    pub fn remove_task(&mut self, task_id: &TaskId) -> bool {
        let Some(edge) = self.edges.remove(task_id) else {
            return false;
        };
        detach(&mut self.by_parent, &edge.parent, task_id);
        if let Some(child) = &edge.child {
            detach(&mut self.by_child, child, task_id);
        }
        true
    }

    /// A session is top-level iff no task runs in it
    pub fn is_top_level(&self, session_id: &SessionId) -> bool {
        !self.by_child.contains_key(session_id)
    }

    /// Most recent task running in the given session
    pub fn task_for_child_session(&self, session_id: &SessionId) -> Option<TaskId> {
        self.by_child
            .get(session_id)
            .and_then(|ids| ids.last())
            .cloned()
    }

    /// Tasks dispatched directly from a session
    pub fn children_of(&self, session_id: &SessionId) -> Vec<TaskId> {
        self.by_parent.get(session_id).cloned().unwrap_or_default()
    }

    /// Session that dispatched the task running in `session_id`
    pub fn parent_of(&self, session_id: &SessionId) -> Option<SessionId> {
        self.task_for_child_session(session_id)
            .and_then(|id| self.edges.get(&id))
            .map(|edge| edge.parent.clone())
    }

    /// All tasks reachable from a session through child-session edges, breadth-first
    pub fn descendants_of(&self, session_id: &SessionId) -> Vec<TaskId> {
        let mut result = Vec::new();
        let mut seen_tasks = HashSet::new();
        let mut seen_sessions = HashSet::from([session_id.clone()]);
        let mut queue = VecDeque::from([session_id.clone()]);

        while let Some(current) = queue.pop_front() {
            let Some(children) = self.by_parent.get(&current) else {
                continue;
            };
            for task_id in children {
                if !seen_tasks.insert(task_id.clone()) {
                    continue;
                }
                result.push(task_id.clone());
                if let Some(child) = self.edges.get(task_id).and_then(|e| e.child.as_ref()) {
                    if seen_sessions.insert(child.clone()) {
                        queue.push_back(child.clone());
                    }
                }
            }
        }

        result
    }

    /// Walk parent edges until reaching a session no task runs in
    pub fn top_level_ancestor(&self, session_id: &SessionId) -> SessionId {
        let mut current = session_id.clone();
        let mut visited = HashSet::new();

        while visited.insert(current.clone()) {
            match self.parent_of(&current) {
                Some(parent) => current = parent,
                None => break,
            }
        }

        current
    }

    /// Get total edge count
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Check if hierarchy is empty
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

fn detach(index: &mut HashMap<SessionId, Vec<TaskId>>, key: &SessionId, task_id: &TaskId) {
    if let Some(ids) = index.get_mut(key) {
        ids.retain(|id| id != task_id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}
