//! Single-value replacement buffer.

/// Holds at most one value; setting overwrites, it never queues.
#[derive(Debug, Clone)]
pub struct ReplacementSlot<T> {
    value: Option<T>,
}

impl<T> ReplacementSlot<T> {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self { value: None }
    }

    /// Stores `value`, returning whatever it replaced.
    pub fn set(&mut self, value: T) -> Option<T> {
        self.value.replace(value)
    }

    /// Removes the value and hands it to `f`.
    pub fn process<R>(&mut self, f: impl FnOnce(T) -> R) -> Option<R> {
        self.value.take().map(f)
    }

    /// Removes and returns the value.
    pub fn take(&mut self) -> Option<T> {
        self.value.take()
    }

    /// Empties the slot.
    pub fn clear(&mut self) {
        self.value = None;
    }

    /// Returns true if a value is held.
    pub fn has(&self) -> bool {
        self.value.is_some()
    }

    /// Borrows the held value.
    pub fn peek(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

impl<T> Default for ReplacementSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
