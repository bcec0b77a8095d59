use std::{
    cmp::{Ordering as CmpOrdering, Reverse},
    collections::{BinaryHeap, HashMap, VecDeque},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

enum Job {
    Once(Box<dyn FnOnce() + Send>),
    Every {
        task: Arc<dyn Fn() + Send + Sync>,
        interval: Duration,
        cancelled: Arc<AtomicBool>,
    },
}

struct WorkItem {
    id: TaskId,
    job: Job,
}

struct Timed {
    due: Instant,
    item: WorkItem,
}

impl PartialEq for Timed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.item.id == other.item.id
    }
}

impl Eq for Timed {}

impl PartialOrd for Timed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.due, self.item.id).cmp(&(other.due, other.item.id))
    }
}

#[derive(Default)]
struct Queues {
    ready: VecDeque<WorkItem>,
    timed: BinaryHeap<Reverse<Timed>>,
    intervals: HashMap<TaskId, Arc<AtomicBool>>,
}

impl Queues {
    /// Moves every timed item that is due onto the ready queue.
    fn promote_due(&mut self, now: Instant) {
        while self.timed.peek().is_some_and(|Reverse(t)| t.due <= now) {
            if let Some(Reverse(timed)) = self.timed.pop() {
                self.ready.push_back(timed.item);
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.timed.peek().map(|Reverse(t)| t.due)
    }
}

struct SchedulerShared {
    queues: Mutex<Queues>,
    has_work: Condvar,
    should_stop: AtomicBool,
    id_gen: AtomicU64,
}

struct Worker {
    id: WorkerId,
    handle: Option<JoinHandle<()>>,
}

/// Low-priority task queue drained by a fixed pool of native threads.
///
/// Tasks run once, once after a delay, or repeatedly on an interval until
/// cancelled. A panicking task is logged and does not take its worker down.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<Worker>>,
}

impl Scheduler {
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(SchedulerShared {
            queues: Mutex::new(Queues::default()),
            has_work: Condvar::new(),
            should_stop: AtomicBool::new(false),
            id_gen: AtomicU64::new(0),
        });
        let pool = (1..=workers as u64)
            .filter_map(|id| {
                let me = shared.clone();
                match thread::Builder::new()
                    .name(format!("sched-worker-{id}"))
                    .spawn(move || worker_loop(me))
                {
                    Ok(handle) => {
                        log::debug!("spawned scheduler worker {id}");
                        Some(Worker {
                            id: WorkerId(id),
                            handle: Some(handle),
                        })
                    }
                    Err(err) => {
                        log::error!("failed to spawn scheduler worker {id}: {err}");
                        None
                    }
                }
            })
            .collect();
        Self {
            shared,
            workers: Mutex::new(pool),
        }
    }

    fn next_id(&self) -> TaskId {
        TaskId(self.shared.id_gen.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Runs `task` once, as soon as a worker is free.
    pub fn schedule<F>(&self, task: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id();
        self.shared.queues.lock().ready.push_back(WorkItem {
            id,
            job: Job::Once(Box::new(task)),
        });
        self.shared.has_work.notify_one();
        id
    }

    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id();
        self.push_timed(Instant::now() + delay, WorkItem {
            id,
            job: Job::Once(Box::new(task)),
        });
        id
    }

    /// Runs `task` every `interval`, first after one interval.
    pub fn schedule_every<F>(&self, interval: Duration, task: F) -> TaskId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.shared
            .queues
            .lock()
            .intervals
            .insert(id, cancelled.clone());
        self.push_timed(Instant::now() + interval, WorkItem {
            id,
            job: Job::Every {
                task: Arc::new(task),
                interval,
                cancelled,
            },
        });
        id
    }

    fn push_timed(&self, due: Instant, item: WorkItem) {
        self.shared.queues.lock().timed.push(Reverse(Timed { due, item }));
        // a sleeping worker may need to wake earlier than planned
        self.shared.has_work.notify_one();
    }

    /// Stops a task that has not run yet, or any further runs of an interval
    /// task. Returns false if there was nothing left to cancel.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut queues = self.shared.queues.lock();
        let mut found = false;
        if let Some(flag) = queues.intervals.remove(&id) {
            flag.store(true, Ordering::Release);
            found = true;
        }
        let before = queues.ready.len();
        queues.ready.retain(|item| item.id != id);
        found |= queues.ready.len() != before;

        let before = queues.timed.len();
        queues.timed.retain(|Reverse(t)| t.item.id != id);
        found |= queues.timed.len() != before;
        found
    }

    /// Runs everything that is due on the calling thread. Returns the number
    /// of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let item = {
                let mut queues = self.shared.queues.lock();
                queues.promote_due(Instant::now());
                queues.ready.pop_front()
            };
            match item {
                Some(item) => {
                    run_item(&self.shared, item);
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Drives `run_pending` until nothing ran for `idle_for`.
    pub fn run_until_idle(&self, idle_for: Duration) {
        let mut deadline = Instant::now() + idle_for;
        loop {
            if self.run_pending() > 0 {
                deadline = Instant::now() + idle_for;
                continue;
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn pending(&self) -> usize {
        let queues = self.shared.queues.lock();
        queues.ready.len() + queues.timed.len()
    }

    /// Stops and joins the pool. Tasks still queued are dropped.
    pub fn shutdown(&self) {
        self.shared.should_stop.store(true, Ordering::Release);
        self.shared.has_work.notify_all();
        let current = thread::current().id();
        for mut worker in self.workers.lock().drain(..) {
            let Some(handle) = worker.handle.take() else {
                continue;
            };
            // the last engine reference may be dropped by a task
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
            log::debug!("scheduler worker {} retired", worker.id.0);
        }
        let mut queues = self.shared.queues.lock();
        let dropped = queues.ready.len() + queues.timed.len();
        if dropped > 0 {
            log::debug!("scheduler shut down with {dropped} pending tasks");
        }
        queues.ready.clear();
        queues.timed.clear();
        queues.intervals.clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<SchedulerShared>) {
    loop {
        let item = {
            let mut queues = shared.queues.lock();
            loop {
                if shared.should_stop.load(Ordering::Acquire) {
                    return;
                }
                queues.promote_due(Instant::now());
                if let Some(item) = queues.ready.pop_front() {
                    break item;
                }
                match queues.next_due() {
                    Some(due) => {
                        let _ = shared.has_work.wait_until(&mut queues, due);
                    }
                    None => shared.has_work.wait(&mut queues),
                }
            }
        };
        run_item(&shared, item);
    }
}

fn run_item(shared: &SchedulerShared, item: WorkItem) {
    let id = item.id;
    match item.job {
        Job::Once(task) => {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                log::error!("scheduled task {} panicked", id.0);
            }
        }
        Job::Every {
            task,
            interval,
            cancelled,
        } => {
            if cancelled.load(Ordering::Acquire) {
                return;
            }
            if catch_unwind(AssertUnwindSafe(|| task())).is_err() {
                log::error!("interval task {} panicked", id.0);
            }
            if cancelled.load(Ordering::Acquire) {
                return;
            }
            let mut queues = shared.queues.lock();
            queues.timed.push(Reverse(Timed {
                due: Instant::now() + interval,
                item: WorkItem {
                    id,
                    job: Job::Every {
                        task,
                        interval,
                        cancelled,
                    },
                },
            }));
            drop(queues);
            shared.has_work.notify_one();
        }
    }
}
