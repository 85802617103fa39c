use std::collections::{HashMap, HashSet, VecDeque};
use taskflow_core::{Task, TaskResult, TaskState, TaskflowError, TaskflowResult};

/// The runtime task set of one workflow, with dependency resolution.
///
/// State changes go through the queue so that the completed set always
/// matches the tasks in `Completed`.
pub struct TaskQueue {
    tasks: HashMap<String, Task>,
    order: Vec<String>,
    completed: HashSet<String>,
    /// Tasks waiting on ids that have not been added yet, by missing id.
    waiting: HashMap<String, Vec<String>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            order: Vec::new(),
            completed: HashSet::new(),
            waiting: HashMap::new(),
        }
    }

    /// Add a task and link it with the tasks already queued in both
    /// directions. Fails if the id is taken.
    pub fn add(&mut self, mut task: Task) -> TaskflowResult<String> {
        let id = task.task_id.clone();
        if self.tasks.contains_key(&id) {
            return Err(TaskflowError::Task(format!("duplicate task id: {id}")));
        }
        for dep in task.gating_dependencies() {
            match self.tasks.get_mut(dep) {
                Some(upstream) => upstream.add_dependent(id.clone()),
                None => self
                    .waiting
                    .entry(dep.to_string())
                    .or_default()
                    .push(id.clone()),
            }
        }
        for dependent in self.waiting.remove(&id).unwrap_or_default() {
            task.add_dependent(dependent);
        }
        self.order.push(id.clone());
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Pending tasks whose required dependencies have completed, in
    /// insertion order.
    #[cfg(test)]
    pub fn all_ready(&self) -> Vec<&Task> {
        self.iter()
            .filter(|t| t.can_start(&self.completed))
            .collect()
    }

    /// Pending tasks in insertion order.
    pub fn pending(&self) -> Vec<&Task> {
        self.iter()
            .filter(|t| t.state() == TaskState::Pending)
            .collect()
    }

    /// Pending tasks that can never start: a required dependency failed,
    /// was cancelled, or is not in the queue.
    pub fn unreachable(&self) -> Vec<String> {
        self.iter()
            .filter(|t| t.state() == TaskState::Pending)
            .filter(|t| {
                t.gating_dependencies().any(|dep| match self.tasks.get(dep) {
                    Some(upstream) => matches!(
                        upstream.state(),
                        TaskState::Failed | TaskState::Cancelled
                    ),
                    None => true,
                })
            })
            .map(|t| t.task_id.clone())
            .collect()
    }

    pub fn start(&mut self, id: &str, executor_id: &str) -> TaskflowResult<()> {
        let completed = &self.completed;
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| unknown(id))?;
        task.start(executor_id, completed)
    }

    pub fn complete(&mut self, id: &str, result: TaskResult) -> TaskflowResult<()> {
        self.task_mut(id)?.complete(result)?;
        self.completed.insert(id.to_string());
        Ok(())
    }

    /// Record a failure; returns the state the task ended up in
    /// (`Pending` when it will be retried).
    pub fn fail(&mut self, id: &str, error: &str, retry: bool) -> TaskflowResult<TaskState> {
        let task = self.task_mut(id)?;
        task.fail(error, retry)?;
        Ok(task.state())
    }

    pub fn cancel(&mut self, id: &str, reason: &str) -> TaskflowResult<()> {
        self.task_mut(id)?.cancel(reason)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    fn task_mut(&mut self, id: &str) -> TaskflowResult<&mut Task> {
        self.tasks.get_mut(id).ok_or_else(|| unknown(id))
    }

    fn iter(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.iter().collect()
    }

    pub fn completed_ids(&self) -> &HashSet<String> {
        &self.completed
    }

    pub fn count_in(&self, state: TaskState) -> usize {
        self.tasks.values().filter(|t| t.state() == state).count()
    }

    pub fn pending_count(&self) -> usize {
        self.count_in(TaskState::Pending)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    /// Whether every task is in a terminal state.
    pub fn is_done(&self) -> bool {
        self.tasks.values().all(Task::is_terminal)
    }

    /// Check for cycles among required sequential dependencies.
    ///
    /// Peels off tasks with no unfinished upstream until none are left;
    /// anything that remains waits on itself through some chain.
    pub fn has_cycle(&self) -> bool {
        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(self.tasks.len());
        let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in self.tasks.values() {
            let mut degree = 0;
            for dep in task.gating_dependencies() {
                if self.tasks.contains_key(dep) {
                    degree += 1;
                    downstream.entry(dep).or_default().push(task.task_id.as_str());
                }
            }
            in_degree.insert(task.task_id.as_str(), degree);
        }

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut peeled = 0;
        while let Some(id) = ready.pop_front() {
            peeled += 1;
            for next in downstream.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(*next);
                    }
                }
            }
        }
        peeled < self.tasks.len()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown(id: &str) -> TaskflowError {
    TaskflowError::Task(format!("unknown task: {id}"))
}
