use crate::Result;

/// Trait for the backlog that holds work no worker could take yet.
///
/// The supervisor is the only caller, from a single thread, so
/// implementors need no internal synchronization. Stores must not
/// reject items under normal operation; an `Err` from `push` or `pop`
/// is reported as a failure and the item involved is lost.
pub trait BacklogStore<T>: Send + 'static {
    /// Adds an item to the backlog.
    fn push(&mut self, item: T) -> Result<()>;

    /// Removes the next item in the store's declared order.
    ///
    /// Returns `None` if the backlog is empty. Never blocks.
    fn pop(&mut self) -> Result<Option<T>>;

    /// Returns the number of queued items.
    fn size(&self) -> usize;
}

mod memory;
mod sled_store;

pub use self::memory::MemoryStore;
pub use self::sled_store::SledStore;
