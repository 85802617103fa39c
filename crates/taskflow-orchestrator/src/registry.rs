use crate::executor::Executor;
use crate::types::{ExecutorInfo, ExecutorStatus};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use taskflow_core::{Task, TaskflowError, TaskflowResult};
use taskflow_events::{Event, EventBus, EventType};
use tracing::{debug, info, warn};

struct ExecutorEntry {
    info: ExecutorInfo,
    handle: Option<Arc<dyn Executor>>,
}

#[derive(Default)]
struct RegistryState {
    executors: BTreeMap<String, ExecutorEntry>,
    by_capability: HashMap<String, BTreeSet<String>>,
    by_task_type: HashMap<String, BTreeSet<String>>,
}

impl RegistryState {
    fn index(&mut self, info: &ExecutorInfo) {
        for cap in &info.capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .insert(info.executor_id.clone());
        }
        for task_type in &info.preferred_task_types {
            self.by_task_type
                .entry(task_type.clone())
                .or_default()
                .insert(info.executor_id.clone());
        }
    }

    fn unindex(&mut self, info: &ExecutorInfo) {
        for cap in &info.capabilities {
            if let Some(ids) = self.by_capability.get_mut(cap) {
                ids.remove(&info.executor_id);
                if ids.is_empty() {
                    self.by_capability.remove(cap);
                }
            }
        }
        for task_type in &info.preferred_task_types {
            if let Some(ids) = self.by_task_type.get_mut(task_type) {
                ids.remove(&info.executor_id);
                if ids.is_empty() {
                    self.by_task_type.remove(task_type);
                }
            }
        }
    }

    fn entry_mut(&mut self, executor_id: &str) -> TaskflowResult<&mut ExecutorEntry> {
        self.executors
            .get_mut(executor_id)
            .ok_or_else(|| TaskflowError::Executor(format!("Unknown executor: {executor_id}")))
    }

    fn infos_for(&self, ids: Option<&BTreeSet<String>>) -> Vec<ExecutorInfo> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.executors.get(id).map(|e| e.info.clone()))
                .collect()
        })
        .unwrap_or_default()
    }
}

/// Aggregate view of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatistics {
    pub total_executors: usize,
    pub by_status: BTreeMap<String, usize>,
    pub total_load: u32,
    pub total_capacity: u32,
    pub utilization: f64,
    pub capabilities: usize,
    pub task_types: usize,
}

/// Catalog of executors with capability and task-type indices.
///
/// The registry is the single source of truth for executor load. Load and
/// status only change through [`acquire`](Self::acquire),
/// [`release`](Self::release), [`update_status`](Self::update_status) and
/// [`update_capacity`](Self::update_capacity), all of which serialize on one
/// lock. Every method returns snapshots, so a caller's view of load may be
/// stale by the time it acts on it.
pub struct ExecutorRegistry {
    state: RwLock<RegistryState>,
    events: Option<EventBus>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            events: None,
        }
    }

    /// Publish `executor.registered` / `executor.unregistered` on this bus.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Register a catalog-only entry (no live executor behind it).
    pub fn register(&self, info: ExecutorInfo) -> TaskflowResult<()> {
        self.insert(info, None)
    }

    /// Register a live executor; its catalog entry is derived from its
    /// descriptor.
    pub fn register_executor(&self, executor: Arc<dyn Executor>) -> TaskflowResult<()> {
        let info = executor.descriptor().to_info();
        self.insert(info, Some(executor))
    }

    fn insert(&self, info: ExecutorInfo, handle: Option<Arc<dyn Executor>>) -> TaskflowResult<()> {
        if info.executor_id.is_empty() {
            return Err(TaskflowError::Executor("executor_id must not be empty".into()));
        }
        if info.max_capacity == 0 {
            return Err(TaskflowError::Executor(format!(
                "executor {} must have a max_capacity above zero",
                info.executor_id
            )));
        }
        let executor_id = info.executor_id.clone();
        {
            let mut state = self.state.write();
            if let Some(previous) = state.executors.remove(&executor_id) {
                warn!(executor_id = %executor_id, "Replacing already registered executor");
                state.unindex(&previous.info);
            }
            state.index(&info);
            state.executors.insert(executor_id.clone(), ExecutorEntry { info, handle });
        }
        info!(executor_id = %executor_id, "Registered executor");
        if let Some(bus) = &self.events {
            bus.publish(Event::executor(EventType::EXECUTOR_REGISTERED, &executor_id));
        }
        Ok(())
    }

    /// Remove an executor and every index entry that points at it.
    pub fn unregister(&self, executor_id: &str) -> Option<ExecutorInfo> {
        let removed = {
            let mut state = self.state.write();
            let entry = state.executors.remove(executor_id)?;
            state.unindex(&entry.info);
            entry.info
        };
        info!(executor_id = %executor_id, "Unregistered executor");
        if let Some(bus) = &self.events {
            bus.publish(Event::executor(EventType::EXECUTOR_UNREGISTERED, executor_id));
        }
        Some(removed)
    }

    pub fn info(&self, executor_id: &str) -> Option<ExecutorInfo> {
        self.state
            .read()
            .executors
            .get(executor_id)
            .map(|e| e.info.clone())
    }

    /// The live executor behind an entry, if one was registered.
    pub fn executor(&self, executor_id: &str) -> Option<Arc<dyn Executor>> {
        self.state
            .read()
            .executors
            .get(executor_id)
            .and_then(|e| e.handle.clone())
    }

    /// All entries, ordered by id.
    pub fn all(&self) -> Vec<ExecutorInfo> {
        self.state
            .read()
            .executors
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().executors.is_empty()
    }

    /// Executors whose status is `Available` and, when `required` is not
    /// empty, whose capabilities are a superset of it.
    pub fn get_available(&self, required: &[String]) -> Vec<ExecutorInfo> {
        let state = self.state.read();
        state
            .executors
            .values()
            .filter(|e| e.info.status == ExecutorStatus::Available)
            .filter(|e| e.handle.as_ref().map_or(true, |h| h.is_available()))
            .filter(|e| required.iter().all(|c| e.info.capabilities.contains(c)))
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn executors_by_capability(&self, capability: &str) -> Vec<ExecutorInfo> {
        let state = self.state.read();
        state.infos_for(state.by_capability.get(capability))
    }

    pub fn executors_for_task_type(&self, task_type: &str) -> Vec<ExecutorInfo> {
        let state = self.state.read();
        state.infos_for(state.by_task_type.get(task_type))
    }

    /// Best executor for `task` among those that can handle it and have
    /// spare capacity, scored by
    /// `0.3·available + 0.3·headroom + 0.2·success_rate + 0.2·supports_type`.
    /// Ties go to the first executor in id order.
    pub fn find_best_executor_for_task(&self, task: &Task) -> Option<ExecutorInfo> {
        let state = self.state.read();
        let mut best: Option<(&ExecutorInfo, f64)> = None;
        for entry in state.executors.values() {
            let info = &entry.info;
            if matches!(
                info.status,
                ExecutorStatus::Offline | ExecutorStatus::Maintenance
            ) || !info.has_capacity()
            {
                continue;
            }
            let can_handle = match &entry.handle {
                Some(handle) => handle.can_handle_task(task),
                None => info.prefers(&task.task_type) || info.is_generalist(),
            };
            if !can_handle {
                continue;
            }
            let available = info.status == ExecutorStatus::Available
                && entry.handle.as_ref().map_or(true, |h| h.is_available());
            let score = 0.3 * if available { 1.0 } else { 0.0 }
                + 0.3 * info.load_headroom()
                + 0.2 * info.performance_score
                + 0.2 * if info.prefers(&task.task_type) { 1.0 } else { 0.0 };
            debug!(executor_id = %info.executor_id, task_id = %task.task_id, score, "Scored executor");
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((info, score));
            }
        }
        best.map(|(info, _)| info.clone())
    }

    /// Manually set an executor's status.
    pub fn update_status(&self, executor_id: &str, status: ExecutorStatus) -> TaskflowResult<()> {
        let mut state = self.state.write();
        let entry = state.entry_mut(executor_id)?;
        debug!(executor_id, from = %entry.info.status, to = %status, "Executor status change");
        entry.info.status = status;
        entry.info.last_active = Utc::now();
        Ok(())
    }

    /// Change capacity; a load above the new capacity marks the executor
    /// `Overloaded` until enough work is released.
    pub fn update_capacity(&self, executor_id: &str, max_capacity: u32) -> TaskflowResult<()> {
        if max_capacity == 0 {
            return Err(TaskflowError::Executor(
                "max_capacity must be above zero".into(),
            ));
        }
        let mut state = self.state.write();
        let info = &mut state.entry_mut(executor_id)?.info;
        info.max_capacity = max_capacity;
        Self::refresh_load_status(info);
        Ok(())
    }

    /// Take one unit of load. Fails when the executor is offline, in
    /// maintenance, or already at capacity. Returns the new load.
    pub fn acquire(&self, executor_id: &str) -> TaskflowResult<u32> {
        let mut state = self.state.write();
        let info = &mut state.entry_mut(executor_id)?.info;
        if matches!(
            info.status,
            ExecutorStatus::Offline | ExecutorStatus::Maintenance
        ) {
            return Err(TaskflowError::Executor(format!(
                "executor {executor_id} is {}",
                info.status
            )));
        }
        if !info.has_capacity() {
            return Err(TaskflowError::Executor(format!(
                "executor {executor_id} is at capacity ({}/{})",
                info.current_load, info.max_capacity
            )));
        }
        info.current_load += 1;
        info.last_active = Utc::now();
        Self::refresh_load_status(info);
        Ok(info.current_load)
    }

    /// Give back one unit of load. Returns the new load.
    pub fn release(&self, executor_id: &str) -> TaskflowResult<u32> {
        let mut state = self.state.write();
        let info = &mut state.entry_mut(executor_id)?.info;
        if info.current_load == 0 {
            warn!(executor_id, "Release without matching acquire");
        }
        info.current_load = info.current_load.saturating_sub(1);
        info.last_active = Utc::now();
        Self::refresh_load_status(info);
        Ok(info.current_load)
    }

    fn refresh_load_status(info: &mut ExecutorInfo) {
        if matches!(
            info.status,
            ExecutorStatus::Offline | ExecutorStatus::Maintenance
        ) {
            return;
        }
        info.status = if info.current_load > info.max_capacity {
            ExecutorStatus::Overloaded
        } else if info.current_load == info.max_capacity {
            ExecutorStatus::Busy
        } else {
            ExecutorStatus::Available
        };
    }

    /// Record a task outcome and refresh the success-rate score.
    pub fn record_outcome(&self, executor_id: &str, success: bool) -> TaskflowResult<f64> {
        let mut state = self.state.write();
        let info = &mut state.entry_mut(executor_id)?.info;
        info.total_tasks += 1;
        if success {
            info.successful_tasks += 1;
        }
        info.performance_score = info.successful_tasks as f64 / info.total_tasks as f64;
        Ok(info.performance_score)
    }

    /// Drop every executor marked `Offline`. Returns the removed ids.
    pub fn cleanup_offline(&self) -> Vec<String> {
        let offline: Vec<String> = self
            .state
            .read()
            .executors
            .values()
            .filter(|e| e.info.status == ExecutorStatus::Offline)
            .map(|e| e.info.executor_id.clone())
            .collect();
        for id in &offline {
            self.unregister(id);
        }
        offline
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let state = self.state.read();
        let mut by_status = BTreeMap::new();
        let mut total_load = 0;
        let mut total_capacity = 0;
        for entry in state.executors.values() {
            *by_status.entry(entry.info.status.to_string()).or_insert(0) += 1;
            total_load += entry.info.current_load;
            total_capacity += entry.info.max_capacity;
        }
        RegistryStatistics {
            total_executors: state.executors.len(),
            by_status,
            total_load,
            total_capacity,
            utilization: if total_capacity == 0 {
                0.0
            } else {
                f64::from(total_load) / f64::from(total_capacity)
            },
            capabilities: state.by_capability.len(),
            task_types: state.by_task_type.len(),
        }
    }

    /// Rebuild both indices from the catalog and report any difference from
    /// the maintained ones. Empty means consistent.
    pub fn check_index_consistency(&self) -> Vec<String> {
        let state = self.state.read();
        let mut expected = RegistryState::default();
        for entry in state.executors.values() {
            expected.index(&entry.info);
        }
        let mut drift = Vec::new();
        diff_index("capability", &expected.by_capability, &state.by_capability, &mut drift);
        diff_index("task type", &expected.by_task_type, &state.by_task_type, &mut drift);
        drift
    }
}

fn diff_index(
    label: &str,
    expected: &HashMap<String, BTreeSet<String>>,
    actual: &HashMap<String, BTreeSet<String>>,
    drift: &mut Vec<String>,
) {
    let keys: BTreeSet<&String> = expected.keys().chain(actual.keys()).collect();
    for key in keys {
        let want = expected.get(key);
        let have = actual.get(key);
        if want != have {
            drift.push(format!(
                "{label} index for {key:?}: expected {want:?}, found {have:?}"
            ));
        }
    }
}
