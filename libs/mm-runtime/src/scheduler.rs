//! The per-core run queue: one FIFO per priority band.

use crate::task::{Priority, TaskRef};
use std::collections::VecDeque;

/// Runnable tasks, organized by priority band. Picking the next task is O(1)
/// in the number of bands: the highest-priority non-empty band is served
/// round-robin.
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    bands: [VecDeque<TaskRef>; Priority::COUNT],
}

/// Outcome of one dispatch batch.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Tick {
    /// Tasks polled in this batch.
    pub polled: usize,
    /// Tasks that completed in this batch.
    pub completed: usize,
    /// Whether runnable tasks remain after the batch (the budget ran out).
    pub has_remaining: bool,
}

// === impl RunQueue ===

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            bands: [const { VecDeque::new() }; Priority::COUNT],
        }
    }

    /// Enqueues at the tail of the task's priority band.
    pub(crate) fn push(&mut self, task: TaskRef) {
        self.bands[task.priority().index()].push_back(task);
    }

    /// Dequeues the next runnable task: head of the most urgent non-empty
    /// band.
    pub(crate) fn pick(&mut self) -> Option<TaskRef> {
        self.bands.iter_mut().find_map(VecDeque::pop_front)
    }

    pub(crate) fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bands.iter().all(VecDeque::is_empty)
    }

    /// Removes every queued task, for shutdown teardown.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = TaskRef> {
        let mut all = VecDeque::new();
        for band in &mut self.bands {
            all.append(band);
        }
        all.into_iter()
    }
}
