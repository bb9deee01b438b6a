//! [`InMemoryTaskStore`] – a [`TaskStore`] kept entirely in process memory.
//! Used by tests and by embedders that do not need durability.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;
use warden_types::{Step, Task, WardenError};

use crate::capabilities::TaskStore;

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
    steps: Mutex<HashMap<Uuid, Vec<Step>>>,
}

fn poisoned() -> WardenError {
    WardenError::Store("in-memory store lock poisoned".into())
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn load_task(&self, id: Uuid) -> Result<Task, WardenError> {
        self.tasks
            .lock()
            .map_err(|_| poisoned())?
            .get(&id)
            .cloned()
            .ok_or(WardenError::TaskNotFound(id))
    }

    fn save_task(&self, task: &Task) -> Result<(), WardenError> {
        self.tasks
            .lock()
            .map_err(|_| poisoned())?
            .insert(task.id, task.clone());
        Ok(())
    }

    fn save_step(&self, step: &Step) -> Result<(), WardenError> {
        let mut steps = self.steps.lock().map_err(|_| poisoned())?;
        let list = steps.entry(step.task_id).or_default();
        match list.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => *existing = step.clone(),
            None => list.push(step.clone()),
        }
        Ok(())
    }

    fn steps(&self, task_id: Uuid) -> Result<Vec<Step>, WardenError> {
        let mut list = self
            .steps
            .lock()
            .map_err(|_| poisoned())?
            .get(&task_id)
            .cloned()
            .unwrap_or_default();
        list.sort_by_key(|s| s.sequence);
        Ok(list)
    }

    fn list_tasks(&self) -> Result<Vec<Task>, WardenError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::StepStatus;

    #[test]
    fn missing_task_is_not_found() {
        let store = InMemoryTaskStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.load_task(id), Err(WardenError::TaskNotFound(id)));
    }

    #[test]
    fn save_task_replaces() {
        let store = InMemoryTaskStore::new();
        let mut task = Task::new("g", "");
        store.save_task(&task).unwrap();
        task.state.step_count = 4;
        store.save_task(&task).unwrap();
        assert_eq!(store.load_task(task.id).unwrap().state.step_count, 4);
        assert_eq!(store.list_tasks().unwrap().len(), 1);
    }

    #[test]
    fn steps_upsert_and_sort() {
        let store = InMemoryTaskStore::new();
        let task_id = Uuid::new_v4();
        let second = Step::new(task_id, 2);
        let mut first = Step::new(task_id, 1);
        store.save_step(&second).unwrap();
        store.save_step(&first).unwrap();
        first.set_status(StepStatus::Completed);
        store.save_step(&first).unwrap();

        let steps = store.steps(task_id).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].sequence, 1);
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert!(store.steps(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn list_is_most_recent_first() {
        let store = InMemoryTaskStore::new();
        let mut older = Task::new("older", "");
        older.updated_at -= chrono::Duration::seconds(5);
        let newer = Task::new("newer", "");
        store.save_task(&older).unwrap();
        store.save_task(&newer).unwrap();
        let goals: Vec<String> = store.list_tasks().unwrap().into_iter().map(|t| t.goal).collect();
        assert_eq!(goals, vec!["newer".to_string(), "older".to_string()]);
    }
}
