//! Static-priority FIFO queue.

use crate::error::{LockError, LockResult};
use std::collections::VecDeque;
use std::fmt::Debug;

/// Scheduling priority used by the transaction coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Replication catch-up and live apply.
    High,
    /// Ordinary caller-issued work.
    Normal,
    /// Background maintenance.
    Low,
}

impl Priority {
    /// Every level, highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Lowercase name, used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queue with one FIFO bucket per declared priority.
///
/// Priority strictly dominates arrival order: `dequeue` always drains the
/// highest non-empty bucket first, oldest item first.
#[derive(Debug)]
pub struct PriorityQueue<T, P = Priority> {
    priorities: Vec<P>,
    buckets: Vec<VecDeque<T>>,
    len: usize,
}

impl<T> PriorityQueue<T, Priority> {
    /// Creates a queue over [`Priority::ALL`].
    pub fn standard() -> Self {
        Self {
            priorities: Priority::ALL.to_vec(),
            buckets: Priority::ALL.iter().map(|_| VecDeque::new()).collect(),
            len: 0,
        }
    }
}

impl<T, P: PartialEq + Debug> PriorityQueue<T, P> {
    /// Creates a queue over `priorities`, ordered highest to lowest.
    pub fn new(priorities: impl IntoIterator<Item = P>) -> LockResult<Self> {
        let priorities: Vec<P> = priorities.into_iter().collect();
        if priorities.is_empty() {
            return Err(LockError::NoPriorities);
        }
        let buckets = priorities.iter().map(|_| VecDeque::new()).collect();
        Ok(Self {
            priorities,
            buckets,
            len: 0,
        })
    }

    /// Declared priorities, highest first.
    pub fn priorities(&self) -> &[P] {
        &self.priorities
    }

    /// The lowest declared priority.
    pub fn lowest(&self) -> &P {
        // `new` rejects an empty priority list.
        &self.priorities[self.priorities.len() - 1]
    }

    /// Appends `item` to the bucket for `priority`.
    pub fn enqueue(&mut self, item: T, priority: &P) -> LockResult<()> {
        let index = self
            .priorities
            .iter()
            .position(|p| p == priority)
            .ok_or_else(|| LockError::UnknownPriority(format!("{:?}", priority)))?;
        self.buckets[index].push_back(item);
        self.len += 1;
        Ok(())
    }

    /// Removes the oldest item of the highest non-empty bucket.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.buckets.iter_mut().find_map(VecDeque::pop_front)?;
        self.len -= 1;
        Some(item)
    }

    /// Removes the first item, in dequeue order, matching `pred`.
    pub fn remove_first(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        for bucket in &mut self.buckets {
            if let Some(pos) = bucket.iter().position(&mut pred) {
                self.len -= 1;
                return bucket.remove(pos);
            }
        }
        None
    }

    /// Returns true if `priority` was declared.
    pub fn accepts(&self, priority: &P) -> bool {
        self.priorities.contains(priority)
    }

    /// Total number of queued items.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if every bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of items queued at `priority`.
    pub fn len_at(&self, priority: &P) -> usize {
        self.priorities
            .iter()
            .position(|p| p == priority)
            .map(|i| self.buckets[i].len())
            .unwrap_or(0)
    }
}
