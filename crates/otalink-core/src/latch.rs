//! # One-Shot Latch
//!
//! A slot that accepts exactly one value. The first writer wins; every later
//! write is reported as rejected and leaves the stored value untouched.
//!
//! Both the upload resolver and the reboot watcher put their terminal
//! decision behind one of these, so duplicate or racing signals can never
//! produce a second terminal event.

/// Write-once container for a terminal decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneShot<T> {
    value: Option<T>,
}

impl<T> Default for OneShot<T> {
    fn default() -> Self {
        OneShot { value: None }
    }
}

impl<T> OneShot<T> {
    /// Creates an open (unfired) latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` if the latch is still open.
    ///
    /// Returns `true` when this call fired the latch.
    pub fn fire(&mut self, value: T) -> bool {
        if self.value.is_some() {
            return false;
        }
        self.value = Some(value);
        true
    }

    /// Returns true once a value has been stored.
    pub fn is_fired(&self) -> bool {
        self.value.is_some()
    }

    /// Returns the stored value, if any.
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_writer_wins() {
        let mut latch = OneShot::new();
        assert!(!latch.is_fired());
        assert!(latch.fire("first"));
        assert!(!latch.fire("second"));
        assert!(!latch.fire("third"));
        assert_eq!(latch.get(), Some(&"first"));
    }
}
