use std::collections::VecDeque;

use super::BacklogStore;
use crate::Result;

/// Unbounded in-memory FIFO backlog. The default store.
pub struct MemoryStore<T> {
    items: VecDeque<T>,
}

impl<T> MemoryStore<T> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> BacklogStore<T> for MemoryStore<T> {
    fn push(&mut self, item: T) -> Result<()> {
        self.items.push_back(item);
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<T>> {
        Ok(self.items.pop_front())
    }

    fn size(&self) -> usize {
        self.items.len()
    }
}
