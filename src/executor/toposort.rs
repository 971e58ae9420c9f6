use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, trace, warn};

use crate::error::{ExecutorError, TaskError};
use crate::executor::{
    DepsAwareExecutor, DepsAwareTask, ResultHandle, TaskStatus, WorkerPool, first_pending,
};

/// Plans the reachable task graph before running anything.
///
/// On submission the executor walks every task reachable from the submitted
/// one, builds the dependency graph, and sorts it topologically. A task is
/// released to the pool only once all of its predecessors are done, so no
/// worker ever picks up a task that is not ready. Tasks with prerequisites
/// are planned in two rounds: their dependencies are discovered, and planned,
/// once the prerequisites are done.
///
/// Planning happens on the thread calling [`DepsAwareExecutor::submit`], and
/// on a worker for the second round of a task with prerequisites. Every
/// dependency supplier reached by a plan runs there, one after another,
/// before any task of the plan is handed to the pool.
///
/// Cycles within a plan are reported as [`TaskError::Cycle`] on the tasks
/// forming them.
pub struct ToposortExecutor {
    pool: Arc<WorkerPool>,
}

impl ToposortExecutor {
    pub fn new(threads: usize) -> Result<Self, ExecutorError> {
        Self::with_stack_size(threads, None)
    }

    pub fn with_stack_size(
        threads: usize,
        stack_size: Option<usize>,
    ) -> Result<Self, ExecutorError> {
        Ok(Self {
            pool: WorkerPool::new("graft-toposort", threads, stack_size)?,
        })
    }
}

/// What happens to a node of the plan once its predecessors are done.
#[derive(Clone, Copy)]
enum Release {
    /// The predecessors were prerequisites, dependencies are still unknown.
    Replan,
    /// The predecessors were the dependencies, the body can run.
    Run,
}

/// Edges of a claimed task for the current round.
fn edges<T>(task: &DepsAwareTask<T>) -> Result<(Arc<[DepsAwareTask<T>]>, Release), TaskError>
where
    T: Clone + Send + Sync + 'static,
{
    let prereqs = task.prerequisites()?;
    if first_pending(&prereqs).is_some() {
        return Ok((prereqs, Release::Replan));
    }

    Ok((task.dependencies()?, Release::Run))
}

/// Builds and arms the plan rooted at `root`, which the caller has already
/// moved to [`TaskStatus::Scheduled`].
fn plan<T>(pool: &Arc<WorkerPool>, root: DepsAwareTask<T>)
where
    T: Clone + Send + Sync + 'static,
{
    if root.is_done() {
        // Cancelled between rounds.
        return;
    }

    let mut graph: DiGraph<DepsAwareTask<T>, ()> = DiGraph::new();
    let mut index: HashMap<DepsAwareTask<T>, NodeIndex> = HashMap::new();
    let mut owned: HashMap<NodeIndex, Release> = HashMap::new();

    let node = graph.add_node(root.clone());
    index.insert(root, node);
    let mut stack = vec![node];

    while let Some(node) = stack.pop() {
        let task = graph[node].clone();

        let (deps, release) = match edges(&task) {
            Ok(found) => found,
            Err(err) => {
                task.resolve(Err(err));
                continue;
            }
        };
        owned.insert(node, release);

        for dep in deps.iter().filter(|dep| !dep.is_done()) {
            let dep_node = match index.get(dep) {
                Some(&dep_node) => dep_node,
                None => {
                    let dep_node = graph.add_node(dep.clone());
                    index.insert(dep.clone(), dep_node);

                    // Tasks claimed by another plan are only waited on.
                    if dep.compare_and_set_status(TaskStatus::NotScheduled, TaskStatus::Scheduled) {
                        stack.push(dep_node);
                    }
                    dep_node
                }
            };

            graph.add_edge(dep_node, node, ());
        }
    }

    debug!(
        tasks = graph.node_count(),
        claimed = owned.len(),
        "planned task graph"
    );

    let order = match toposort(&graph, None) {
        Ok(order) => order,
        Err(_) => {
            fail_cycles(&graph, &mut owned);
            graph.node_indices().collect()
        }
    };

    for node in order {
        if let Some(&release) = owned.get(&node) {
            arm(pool, &graph, node, release);
        }
    }
}

/// Fails every claimed task that is part of a cycle and removes it from the
/// plan. Tasks depending on a cycle still run and observe the failures.
fn fail_cycles<T>(graph: &DiGraph<DepsAwareTask<T>, ()>, owned: &mut HashMap<NodeIndex, Release>)
where
    T: Clone + Send + Sync + 'static,
{
    for component in tarjan_scc(graph) {
        let cyclic = component.len() > 1
            || component
                .first()
                .is_some_and(|&node| graph.contains_edge(node, node));

        if !cyclic {
            continue;
        }

        warn!(tasks = component.len(), "dependency cycle detected");
        for node in component {
            if owned.remove(&node).is_some() {
                graph[node].resolve(Err(TaskError::Cycle));
            }
        }
    }
}

/// Releases `node` once each of its predecessors in `graph` is done.
fn arm<T>(
    pool: &Arc<WorkerPool>,
    graph: &DiGraph<DepsAwareTask<T>, ()>,
    node: NodeIndex,
    release: Release,
) where
    T: Clone + Send + Sync + 'static,
{
    let preds: Vec<_> = graph
        .neighbors_directed(node, Direction::Incoming)
        .map(|pred| graph[pred].clone())
        .collect();

    // One extra count so the gate cannot open while listeners are still
    // being registered.
    let gate = Arc::new(Gate {
        remaining: AtomicUsize::new(preds.len() + 1),
        pool: Arc::clone(pool),
        task: graph[node].clone(),
        release,
    });

    for pred in preds {
        let gate = Arc::clone(&gate);
        pred.on_done(move || gate.count_down());
    }

    gate.count_down();
}

struct Gate<T> {
    remaining: AtomicUsize,
    pool: Arc<WorkerPool>,
    task: DepsAwareTask<T>,
    release: Release,
}

impl<T> Gate<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn count_down(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let pool = Arc::clone(&self.pool);
        match self.release {
            Release::Replan => self
                .pool
                .spawn_task(self.task.clone(), move |task| plan(&pool, task)),
            Release::Run => self.pool.spawn_task(self.task.clone(), start),
        }
    }
}

fn start<T>(task: DepsAwareTask<T>)
where
    T: Clone + Send + Sync + 'static,
{
    if task.compare_and_set_status(TaskStatus::Scheduled, TaskStatus::Started) {
        trace!(task = task.id(), "running task");
        task.call();
    }
}

impl<T> DepsAwareExecutor<T> for ToposortExecutor
where
    T: Clone + Send + Sync + 'static,
{
    fn submit(&self, task: &DepsAwareTask<T>) -> Result<ResultHandle<T>, ExecutorError> {
        self.pool.admit()?;

        if task.compare_and_set_status(TaskStatus::NotScheduled, TaskStatus::Scheduled) {
            plan(&self.pool, task.clone());
        }

        Ok(task.handle())
    }

    fn close(&self) {
        self.pool.close();
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        self.pool.shutdown(timeout)
    }

    fn is_shutdown(&self) -> bool {
        self.pool.is_shutdown()
    }
}

impl Drop for ToposortExecutor {
    fn drop(&mut self) {
        self.pool.close();
    }
}
