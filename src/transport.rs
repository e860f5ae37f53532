use crate::error::{ErrorCode, Result, ScataError};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub group: String,
    pub id: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task: usize,
    pub message: String,
}

/// Runs tasks in named groups and reports how many of each group resolved.
pub trait TaskTransport: Send + Sync {
    fn submit(&self, group: &str, task: Task) -> TaskHandle;
    fn count_succeeded(&self, group: &str) -> usize;
    fn count_failed(&self, group: &str) -> usize;
    fn failures(&self, group: &str) -> Vec<TaskFailure>;
    /// Forgets the group's counters. Running tasks still finish.
    fn delete_group(&self, group: &str);
}

#[derive(Default)]
struct GroupCounters {
    submitted: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    failures: Mutex<Vec<TaskFailure>>,
}

impl GroupCounters {
    fn fail(&self, task: usize, message: String) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(TaskFailure { task, message });
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

/// In-process transport on a bounded rayon pool.
pub struct LocalTransport {
    pool: rayon::ThreadPool,
    groups: Mutex<HashMap<String, Arc<GroupCounters>>>,
}

impl LocalTransport {
    /// `threads == 0` uses one thread per core.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("scata-task-{i}"))
            .build()
            .map_err(|e| ScataError::new(ErrorCode::Internal, format!("Could not start task pool: {e}")))?;
        Ok(Self {
            pool,
            groups: Mutex::new(HashMap::new()),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn counters(&self, group: &str) -> Option<Arc<GroupCounters>> {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group)
            .cloned()
    }
}

impl TaskTransport for LocalTransport {
    fn submit(&self, group: &str, task: Task) -> TaskHandle {
        let counters = self
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(group.to_string())
            .or_default()
            .clone();
        let id = counters.submitted.fetch_add(1, Ordering::SeqCst);
        let group_name = group.to_string();
        // Panics become failures only with unwinding; the release profile
        // sets `panic = 'abort'`, where a panicking task ends the process.
        self.pool.spawn(move || match catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => {
                counters.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Err(e)) => {
                tracing::warn!(group = group_name.as_str(), task = id, error = %e, "task failed");
                counters.fail(id, e.to_string());
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(group = group_name.as_str(), task = id, message = message.as_str(), "task panicked");
                counters.fail(id, format!("panic: {message}"));
            }
        });
        TaskHandle {
            group: group.to_string(),
            id,
        }
    }

    fn count_succeeded(&self, group: &str) -> usize {
        self.counters(group)
            .map_or(0, |c| c.succeeded.load(Ordering::SeqCst))
    }

    fn count_failed(&self, group: &str) -> usize {
        self.counters(group).map_or(0, |c| c.failed.load(Ordering::SeqCst))
    }

    fn failures(&self, group: &str) -> Vec<TaskFailure> {
        self.counters(group)
            .map(|c| c.failures.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    fn delete_group(&self, group: &str) {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_resolved(transport: &LocalTransport, group: &str, n: usize) {
        let start = Instant::now();
        while transport.count_succeeded(group) + transport.count_failed(group) < n {
            assert!(start.elapsed() < Duration::from_secs(10), "tasks did not resolve");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_counts_successes_errors_and_panics() {
        let transport = LocalTransport::new(2).unwrap();
        assert_eq!(transport.threads(), 2);
        for i in 0..4 {
            let handle = transport.submit("g", Box::new(move || {
                if i == 3 {
                    Err(ScataError::new(ErrorCode::Aligner, "boom"))
                } else {
                    Ok(())
                }
            }));
            assert_eq!(handle.id, i);
        }
        transport.submit("g", Box::new(|| panic!("worker exploded")));
        wait_resolved(&transport, "g", 5);

        assert_eq!(transport.count_succeeded("g"), 3);
        assert_eq!(transport.count_failed("g"), 2);
        let mut failures = transport.failures("g");
        failures.sort_by_key(|f| f.task);
        assert_eq!(failures[0].task, 3);
        assert_eq!(failures[0].message, "aligner: boom");
        assert_eq!(failures[1].message, "panic: worker exploded");
    }

    #[test]
    fn test_groups_are_independent() {
        let transport = LocalTransport::new(1).unwrap();
        transport.submit("a", Box::new(|| Ok(())));
        transport.submit("b", Box::new(|| Ok(())));
        wait_resolved(&transport, "a", 1);
        wait_resolved(&transport, "b", 1);
        transport.delete_group("a");
        assert_eq!(transport.count_succeeded("a"), 0);
        assert_eq!(transport.count_succeeded("b"), 1);
        assert!(transport.failures("missing").is_empty());
    }
}
