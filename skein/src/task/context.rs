use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::any::Any;
use std::fmt;

/// A single user value attached to a series or a parallel.
///
/// Last writer wins. Reads are typed: asking for a type other than the one
/// stored behaves as if the slot were empty. The value is dropped with its
/// owner, the engine never copies it.
#[derive(Default)]
pub struct ContextSlot(Mutex<Option<Box<dyn Any + Send>>>);

impl ContextSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored value.
    pub fn set<T: Any + Send>(&self, value: T) {
        let prev = self.0.lock().replace(Box::new(value));
        drop(prev);
    }

    /// Locks the slot and returns a guard to the value if it holds a `T`.
    pub fn lock<T: Any>(&self) -> Option<MappedMutexGuard<'_, T>> {
        MutexGuard::try_map(self.0.lock(), |slot| slot.as_mut()?.downcast_mut::<T>()).ok()
    }

    pub fn with<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.lock::<T>().map(|mut value| f(&mut value))
    }

    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.lock::<T>().map(|value| value.clone())
    }

    /// Moves the value out if it is a `T`, leaving the slot empty.
    pub fn take<T: Any>(&self) -> Option<T> {
        let mut slot = self.0.lock();
        if !slot.as_ref().is_some_and(|value| value.is::<T>()) {
            return None;
        }

        slot.take()?.downcast::<T>().ok().map(|value| *value)
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().is_some()
    }

    pub fn clear(&self) {
        let prev = self.0.lock().take();
        drop(prev);
    }
}

impl fmt::Debug for ContextSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSlot")
            .field("is_set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(ContextSlot: Send, Sync);

    #[test]
    fn test_last_writer_wins() {
        let slot = ContextSlot::new();
        slot.set(1_u32);
        slot.set(2_u32);
        assert_eq!(slot.get::<u32>(), Some(2));
    }

    #[test]
    fn test_wrong_type_reads_as_empty() {
        let slot = ContextSlot::new();
        slot.set(String::from("ctx"));

        assert_eq!(slot.get::<u32>(), None);
        assert_eq!(slot.take::<u32>(), None);
        assert!(slot.is_set());
        assert_eq!(slot.take::<String>().as_deref(), Some("ctx"));
        assert!(!slot.is_set());
    }

    #[test]
    fn test_with_mutates_in_place() {
        let slot = ContextSlot::new();
        slot.set(vec![1, 2]);

        assert_eq!(slot.with(|v: &mut Vec<i32>| v.push(3)), Some(()));
        assert_eq!(*slot.lock::<Vec<i32>>().unwrap(), vec![1, 2, 3]);

        slot.clear();
        assert!(slot.lock::<Vec<i32>>().is_none());
    }
}
