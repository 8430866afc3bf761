//! Depth counters that keep the scheduler from reacting to its own output.
use std::cell::Cell;

/// Held for the duration of a dispatch. Released on drop, so an early
/// return or panic can't leave a guard stuck.
pub struct DepthGuard<'a> {
    depth: &'a Cell<u32>,
}

impl<'a> DepthGuard<'a> {
    fn acquire(depth: &'a Cell<u32>) -> Self {
        depth.set(depth.get() + 1);
        Self { depth }
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

#[derive(Debug, Default)]
pub struct ReentrancyGuards {
    generation: Cell<u32>,
    message: Cell<u32>,
}

impl ReentrancyGuards {
    /// Generations started while held are ours and are not intercepted.
    pub fn hold_generation(&self) -> DepthGuard<'_> {
        DepthGuard::acquire(&self.generation)
    }

    /// Messages received while held are ours and are not queued.
    pub fn hold_message(&self) -> DepthGuard<'_> {
        DepthGuard::acquire(&self.message)
    }

    pub fn generation_held(&self) -> bool {
        self.generation.get() > 0
    }

    pub fn message_held(&self) -> bool {
        self.message.get() > 0
    }
}
