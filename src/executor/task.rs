use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::error::TaskError;
use crate::executor::{DepsSupplier, ResultHandle, TaskBody, lock};

/// Lifecycle of a [`DepsAwareTask`].
///
/// ```text
/// NotScheduled -> Scheduled -> Started -> Done
///       ^                        |
///       +------------------------+
/// ```
///
/// The back-edge is taken when a started task finds that some of its
/// prerequisites or dependencies are still unfinished. `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskStatus {
    NotScheduled = 0,
    Scheduled = 1,
    Started = 2,
    Done = 3,
}

impl TaskStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskStatus::NotScheduled,
            1 => TaskStatus::Scheduled,
            2 => TaskStatus::Started,
            _ => TaskStatus::Done,
        }
    }
}

pub(crate) type Listener = Box<dyn FnOnce() + Send>;

struct Slot<T> {
    result: Option<Result<T, TaskError>>,
    listeners: Vec<Listener>,
}

/// Write-once result cell with blocking readers and completion callbacks.
struct Completion<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T: Clone> Completion<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                result: None,
                listeners: Vec::new(),
            }),
            ready: Condvar::new(),
        }
    }

    /// Stores the result unless one is already present. `on_set` runs while
    /// the slot is still locked, so listeners registered concurrently observe
    /// its effects.
    fn resolve(&self, result: Result<T, TaskError>, on_set: impl FnOnce()) -> bool {
        let listeners = {
            let mut slot = lock(&self.slot);
            if slot.result.is_some() {
                return false;
            }
            slot.result = Some(result);
            on_set();
            std::mem::take(&mut slot.listeners)
        };

        self.ready.notify_all();

        for listener in listeners {
            listener();
        }

        true
    }

    fn subscribe(&self, listener: Listener) {
        let mut slot = lock(&self.slot);

        if slot.result.is_none() {
            slot.listeners.push(listener);
            return;
        }

        drop(slot);
        listener();
    }

    fn get(&self) -> Option<Result<T, TaskError>> {
        lock(&self.slot).result.clone()
    }

    fn wait(&self) -> Result<T, TaskError> {
        let mut slot = lock(&self.slot);

        loop {
            if let Some(result) = &slot.result {
                return result.clone();
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        // Too far out to represent, same as no deadline at all.
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut slot = lock(&self.slot);

        loop {
            if let Some(result) = &slot.result {
                return Some(result.clone());
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            slot = self
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }
}

/// A lazily evaluated set of tasks. The supplier runs at most once, its
/// outcome (including a failure) is remembered.
struct Edges<T> {
    supplier: Mutex<Option<DepsSupplier<T>>>,
    resolved: OnceLock<Result<Arc<[DepsAwareTask<T>]>, TaskError>>,
}

impl<T> Edges<T> {
    fn new(supplier: Option<DepsSupplier<T>>) -> Self {
        Self {
            supplier: Mutex::new(supplier),
            resolved: OnceLock::new(),
        }
    }

    fn get(&self) -> Result<Arc<[DepsAwareTask<T>]>, TaskError> {
        self.resolved
            .get_or_init(|| {
                let supplier = lock(&self.supplier).take();

                match supplier {
                    None => Ok(Arc::from(Vec::new())),
                    Some(supplier) => match panic::catch_unwind(AssertUnwindSafe(supplier)) {
                        Ok(Ok(tasks)) => Ok(Arc::from(tasks)),
                        Ok(Err(err)) => Err(TaskError::new(err)),
                        Err(payload) => Err(TaskError::from_panic(payload)),
                    },
                }
            })
            .clone()
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

struct TaskInner<T> {
    id: u64,
    status: AtomicU8,
    body: Mutex<Option<TaskBody<T>>>,
    prereqs: Edges<T>,
    deps: Edges<T>,
    completion: Completion<T>,
}

/// A schedulable unit of work.
///
/// A task wraps a computation body together with two dependency suppliers.
/// The *prerequisites* are resolved first; only once they are all done is the
/// *dependencies* supplier evaluated, which lets a task discover what it
/// depends on from the results of its prerequisites. The body runs at most
/// once, after every dependency is done.
///
/// Cloning a task is cheap and yields another reference to the same task.
/// Equality is identity.
pub struct DepsAwareTask<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T> Clone for DepsAwareTask<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PartialEq for DepsAwareTask<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for DepsAwareTask<T> {}

impl<T> Hash for DepsAwareTask<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl<T> Debug for DepsAwareTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepsAwareTask")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl<T> DepsAwareTask<T> {
    /// Process-unique, monotonically assigned id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    pub fn is_done(&self) -> bool {
        self.status() == TaskStatus::Done
    }
}

impl<T> DepsAwareTask<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(
        body: TaskBody<T>,
        prereqs: Option<DepsSupplier<T>>,
        deps: Option<DepsSupplier<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                status: AtomicU8::new(TaskStatus::NotScheduled as u8),
                body: Mutex::new(Some(body)),
                prereqs: Edges::new(prereqs),
                deps: Edges::new(deps),
                completion: Completion::new(),
            }),
        }
    }

    pub fn handle(&self) -> ResultHandle<T> {
        ResultHandle::new(self.clone())
    }

    /// The result, if the task is done.
    pub fn result(&self) -> Option<Result<T, TaskError>> {
        self.inner.completion.get()
    }

    pub(crate) fn compare_and_set_status(&self, current: TaskStatus, new: TaskStatus) -> bool {
        self.inner
            .status
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Tasks that must be done before the dependencies can be discovered.
    pub(crate) fn prerequisites(&self) -> Result<Arc<[DepsAwareTask<T>]>, TaskError> {
        self.inner.prereqs.get()
    }

    /// Tasks whose results the body needs. Only meaningful once every
    /// prerequisite is done.
    pub(crate) fn dependencies(&self) -> Result<Arc<[DepsAwareTask<T>]>, TaskError> {
        self.inner.deps.get()
    }

    /// Runs the body and records its outcome. Does nothing if the body has
    /// already been taken, either by an earlier call or by cancellation.
    pub(crate) fn call(&self) {
        let body = lock(&self.inner.body).take();
        let Some(body) = body else {
            return;
        };

        let result = match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(TaskError::new(err)),
            Err(payload) => Err(TaskError::from_panic(payload)),
        };

        self.resolve(result);
    }

    /// Moves the task to `Done` with the given outcome. The first resolution
    /// wins, later ones are ignored.
    pub(crate) fn resolve(&self, result: Result<T, TaskError>) -> bool {
        let status = &self.inner.status;
        let resolved = self.inner.completion.resolve(result, || {
            status.store(TaskStatus::Done as u8, Ordering::Release);
        });

        if resolved {
            // The body is never going to run now.
            lock(&self.inner.body).take();
        }

        resolved
    }

    pub(crate) fn reject(&self) {
        self.resolve(Err(TaskError::Rejected));
    }

    /// Registers a callback to run once the task is done. Runs immediately
    /// on the calling thread if the task is already done.
    pub(crate) fn on_done(&self, listener: impl FnOnce() + Send + 'static) {
        self.inner.completion.subscribe(Box::new(listener));
    }

    pub(crate) fn cancel(&self) -> bool {
        let body = lock(&self.inner.body).take();

        match body {
            Some(body) => {
                drop(body);
                self.resolve(Err(TaskError::Cancelled))
            }
            None => false,
        }
    }

    pub(crate) fn wait(&self) -> Result<T, TaskError> {
        self.inner.completion.wait()
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        self.inner.completion.wait_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn task(value: usize) -> DepsAwareTask<usize> {
        DepsAwareTask::new(Box::new(move || Ok(value)), None, None)
    }

    #[test]
    fn test_status_transitions() {
        let task = task(1);
        assert_eq!(task.status(), TaskStatus::NotScheduled);

        assert!(task.compare_and_set_status(TaskStatus::NotScheduled, TaskStatus::Scheduled));
        assert!(!task.compare_and_set_status(TaskStatus::NotScheduled, TaskStatus::Scheduled));
        assert!(task.compare_and_set_status(TaskStatus::Scheduled, TaskStatus::Started));
        assert!(task.compare_and_set_status(TaskStatus::Started, TaskStatus::NotScheduled));
        assert!(task.compare_and_set_status(TaskStatus::NotScheduled, TaskStatus::Scheduled));
        assert!(task.compare_and_set_status(TaskStatus::Scheduled, TaskStatus::Started));

        task.call();
        assert_eq!(task.status(), TaskStatus::Done);
        assert_eq!(task.result().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_body_runs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let task: DepsAwareTask<usize> = DepsAwareTask::new(
            Box::new(move || Ok(c.fetch_add(1, Ordering::SeqCst))),
            None,
            None,
        );

        task.call();
        task.call();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(task.wait().unwrap(), 0);
    }

    #[test]
    fn test_panic_becomes_failure() {
        let task: DepsAwareTask<usize> = DepsAwareTask::new(
            Box::new(|| -> anyhow::Result<usize> { panic!("exploded") }),
            None,
            None,
        );

        task.call();

        let err = task.wait().unwrap_err();
        assert!(err.to_string().contains("exploded"));
        assert!(task.is_done());
    }

    #[test]
    fn test_supplier_evaluated_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let dep = task(2);
        let d = dep.clone();
        let task: DepsAwareTask<usize> = DepsAwareTask::new(
            Box::new(|| Ok(0)),
            None,
            Some(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(vec![d])
            })),
        );

        assert_eq!(task.dependencies().unwrap().len(), 1);
        assert_eq!(task.dependencies().unwrap()[0], dep);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(task.prerequisites().unwrap().is_empty());
    }

    #[test]
    fn test_supplier_failure_is_remembered() {
        let task: DepsAwareTask<usize> = DepsAwareTask::new(
            Box::new(|| Ok(0)),
            Some(Box::new(|| Err(anyhow::anyhow!("no such directory")))),
            None,
        );

        let first = task.prerequisites().unwrap_err();
        let second = task.prerequisites().unwrap_err();
        assert_eq!(first.to_string(), "no such directory");
        assert_eq!(second.to_string(), "no such directory");
    }

    #[test]
    fn test_listener_after_completion_runs_immediately() {
        let task = task(5);
        task.call();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        task.on_done(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_sees_done_status() {
        let task = task(5);
        let observed = Arc::new(Mutex::new(None));

        let t = task.clone();
        let o = observed.clone();
        task.on_done(move || {
            *o.lock().unwrap() = Some(t.status());
        });

        task.call();
        assert_eq!(*observed.lock().unwrap(), Some(TaskStatus::Done));
    }

    #[test]
    fn test_cancel_before_start() {
        let task = task(5);
        assert!(task.cancel());
        assert!(matches!(task.wait(), Err(TaskError::Cancelled)));

        // Nothing left to run.
        task.call();
        assert!(matches!(task.result(), Some(Err(TaskError::Cancelled))));
        assert!(!task.cancel());
    }

    #[test]
    fn test_first_resolution_wins() {
        let task = task(5);
        task.call();
        assert!(!task.resolve(Err(TaskError::Rejected)));
        assert_eq!(task.wait().unwrap(), 5);
    }

    #[test]
    fn test_wait_timeout() {
        let task = task(5);
        assert!(task.wait_timeout(Duration::from_millis(10)).is_none());

        let t = task.clone();
        let thread = std::thread::spawn(move || t.call());
        let result = task.wait_timeout(Duration::from_secs(10));
        thread.join().unwrap();

        assert_eq!(result.unwrap().unwrap(), 5);
    }

    #[test]
    fn test_wait_timeout_without_deadline() {
        let task = task(5);

        let t = task.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            t.call();
        });
        let result = task.wait_timeout(Duration::MAX);
        thread.join().unwrap();

        assert_eq!(result.unwrap().unwrap(), 5);
        assert_eq!(task.handle().wait_timeout(Duration::MAX).unwrap().unwrap(), 5);
    }
}
