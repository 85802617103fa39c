//! Dependency-graph analysis over task plans.
//!
//! Edges point from a task to the tasks it depends on. References to ids not
//! in the slice are ignored here; [`dangling_dependencies`] reports them.

use crate::types::TaskPlan;
use std::collections::{HashMap, HashSet};

struct Graph<'a> {
    ids: Vec<&'a str>,
    edges: Vec<Vec<usize>>,
    durations: Vec<f64>,
}

impl<'a> Graph<'a> {
    fn new(tasks: &'a [TaskPlan]) -> Self {
        let ids: Vec<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let edges = tasks
            .iter()
            .map(|t| {
                t.dependencies
                    .iter()
                    .filter_map(|d| index.get(d.as_str()).copied())
                    .collect()
            })
            .collect();
        let durations = tasks.iter().map(|t| t.estimated_duration).collect();
        Self {
            ids,
            edges,
            durations,
        }
    }
}

/// Tarjan bookkeeping for one search.
struct SccSearch<'g> {
    edges: &'g [Vec<usize>],
    counter: usize,
    order: Vec<Option<usize>>,
    low: Vec<usize>,
    stack: Vec<usize>,
    on_stack: Vec<bool>,
    cyclic: Vec<bool>,
}

impl SccSearch<'_> {
    fn enter(&mut self, v: usize) {
        self.order[v] = Some(self.counter);
        self.low[v] = self.counter;
        self.counter += 1;
        self.stack.push(v);
        self.on_stack[v] = true;
    }

    /// Pop `v`'s component if `v` is its root.
    fn close(&mut self, v: usize) {
        if Some(self.low[v]) != self.order[v] {
            return;
        }
        let mut component = Vec::new();
        while let Some(w) = self.stack.pop() {
            self.on_stack[w] = false;
            component.push(w);
            if w == v {
                break;
            }
        }
        let self_loop = self.edges[v].contains(&v);
        if component.len() > 1 || self_loop {
            for w in component {
                self.cyclic[w] = true;
            }
        }
    }

    /// Depth-first search from `root` on an explicit stack of
    /// `(node, next edge)` frames, so chain length is bounded by the heap.
    fn visit(&mut self, root: usize) {
        self.enter(root);
        let mut frames = vec![(root, 0usize)];
        while let Some(frame) = frames.last_mut() {
            let v = frame.0;
            if let Some(&w) = self.edges[v].get(frame.1) {
                frame.1 += 1;
                match self.order[w] {
                    None => {
                        self.enter(w);
                        frames.push((w, 0));
                    }
                    Some(order_w) if self.on_stack[w] => {
                        self.low[v] = self.low[v].min(order_w);
                    }
                    Some(_) => {}
                }
            } else {
                frames.pop();
                if let Some(&(parent, _)) = frames.last() {
                    self.low[parent] = self.low[parent].min(self.low[v]);
                }
                self.close(v);
            }
        }
    }
}

/// Ids of every task that lies on a dependency cycle, in input order.
/// Empty if and only if the graph is acyclic.
pub fn detect_circular_dependencies(tasks: &[TaskPlan]) -> Vec<String> {
    let graph = Graph::new(tasks);
    let n = graph.ids.len();
    let mut search = SccSearch {
        edges: &graph.edges,
        counter: 0,
        order: vec![None; n],
        low: vec![0; n],
        stack: Vec::new(),
        on_stack: vec![false; n],
        cyclic: vec![false; n],
    };
    for v in 0..n {
        if search.order[v].is_none() {
            search.visit(v);
        }
    }
    graph
        .ids
        .iter()
        .zip(search.cyclic)
        .filter(|(_, cyclic)| *cyclic)
        .map(|(id, _)| id.to_string())
        .collect()
}

/// Dependencies pointing at ids that are not in the plan, as
/// `(task_id, missing_dependency)` pairs.
pub fn dangling_dependencies(tasks: &[TaskPlan]) -> Vec<(String, String)> {
    let known: HashSet<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
    tasks
        .iter()
        .flat_map(|t| {
            t.dependencies
                .iter()
                .filter(|d| !known.contains(d.as_str()))
                .map(|d| (t.task_id.clone(), d.clone()))
        })
        .collect()
}

struct Schedule {
    starts: Vec<f64>,
    via: Vec<Option<usize>>,
}

/// Earliest starts by depth-first walk over dependencies with an explicit
/// stack. A dependency still on the walk closes a cycle and contributes
/// nothing.
fn schedule(graph: &Graph<'_>) -> Schedule {
    let n = graph.ids.len();
    let mut starts: Vec<Option<f64>> = vec![None; n];
    let mut partial = vec![0.0; n];
    let mut visiting = vec![false; n];
    let mut via = vec![None; n];

    let mut relax = |partial: &mut [f64], v: usize, dep: usize, dep_start: f64| {
        let finish = dep_start + graph.durations[dep];
        if finish > partial[v] {
            partial[v] = finish;
            via[v] = Some(dep);
        }
    };

    for root in 0..n {
        if starts[root].is_some() {
            continue;
        }
        visiting[root] = true;
        let mut frames = vec![(root, 0usize)];
        while let Some(frame) = frames.last_mut() {
            let v = frame.0;
            if let Some(&dep) = graph.edges[v].get(frame.1) {
                frame.1 += 1;
                if visiting[dep] {
                    continue;
                }
                match starts[dep] {
                    Some(es) => relax(&mut partial, v, dep, es),
                    None => {
                        visiting[dep] = true;
                        frames.push((dep, 0));
                    }
                }
            } else {
                frames.pop();
                let start = partial[v];
                visiting[v] = false;
                starts[v] = Some(start);
                if let Some(&(parent, _)) = frames.last() {
                    relax(&mut partial, parent, v, start);
                }
            }
        }
    }

    Schedule {
        starts: starts.into_iter().map(|es| es.unwrap_or(0.0)).collect(),
        via,
    }
}

/// Earliest start (seconds) of each task, assuming unlimited executors.
pub fn earliest_start_times(tasks: &[TaskPlan]) -> HashMap<String, f64> {
    let graph = Graph::new(tasks);
    let schedule = schedule(&graph);
    graph
        .ids
        .iter()
        .zip(schedule.starts)
        .map(|(id, es)| (id.to_string(), es))
        .collect()
}

/// The single longest dependency chain, the one that determines the plan's
/// finish time, ordered from its first task to its last. Tasks off that
/// chain are not included.
pub fn critical_path(tasks: &[TaskPlan]) -> Vec<String> {
    let graph = Graph::new(tasks);
    if graph.ids.is_empty() {
        return Vec::new();
    }
    let schedule = schedule(&graph);
    let mut last = 0;
    let mut best_finish = f64::MIN;
    for v in 0..graph.ids.len() {
        let finish = schedule.starts[v] + graph.durations[v];
        if finish > best_finish {
            best_finish = finish;
            last = v;
        }
    }
    let mut path = vec![last];
    let mut seen: HashSet<usize> = HashSet::from([last]);
    let mut current = last;
    while let Some(prev) = schedule.via[current] {
        if !seen.insert(prev) {
            break;
        }
        path.push(prev);
        current = prev;
    }
    path.reverse();
    path.into_iter().map(|v| graph.ids[v].to_string()).collect()
}

/// Finish time of the last task, assuming unlimited executors.
pub fn makespan(tasks: &[TaskPlan]) -> f64 {
    let graph = Graph::new(tasks);
    let schedule = schedule(&graph);
    (0..graph.ids.len())
        .map(|v| schedule.starts[v] + graph.durations[v])
        .fold(0.0, f64::max)
}
