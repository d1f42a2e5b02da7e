//! Per-cycle task queue.

use std::collections::VecDeque;
use std::sync::Mutex;

/// One fuzz job: a package path and the target name to drive inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Task {
    pub package: String,
    pub target: String,
}

impl Task {
    pub fn new<P: Into<String>, T: Into<String>>(package: P, target: T) -> Self {
        Self {
            package: package.into(),
            target: target.into(),
        }
    }
}

/// Thread-safe FIFO of tasks. Lives for one cycle.
///
/// `dequeue` never blocks: an empty queue returns `None` immediately so that
/// workers terminate naturally once the cycle's work is drained.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, task: Task) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push_back(task);
    }

    pub fn dequeue(&self) -> Option<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        let tasks = self.tasks.lock().unwrap();
        tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = TaskQueue::new();
        for i in 0..8 {
            q.enqueue(Task::new(format!("pkg{}", i), format!("FuzzT{}", i)));
        }
        for i in 0..8 {
            let t = q.dequeue().unwrap();
            assert_eq!(t.package, format!("pkg{}", i));
            assert_eq!(t.target, format!("FuzzT{}", i));
        }
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn len_tracks_enqueued_minus_dequeued() {
        let q = TaskQueue::new();
        assert!(q.is_empty());
        q.enqueue(Task::new("a", "FuzzA"));
        q.enqueue(Task::new("b", "FuzzB"));
        assert_eq!(q.len(), 2);
        q.dequeue();
        assert_eq!(q.len(), 1);
        q.dequeue();
        assert_eq!(q.len(), 0);
        assert!(q.dequeue().is_none());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn empty_dequeue_does_not_block() {
        let q = TaskQueue::new();
        assert!(q.dequeue().is_none());
    }
}
