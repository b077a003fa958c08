//! Mutex-guarded value with closure-scoped access

use parking_lot::Mutex;

/// A value that is only reachable while holding its lock.
///
/// Access is scoped to a closure so a guard can never escape into a call
/// to another component.
#[derive(Debug, Default)]
pub struct Guarded<T> {
    inner: Mutex<T>,
}

impl<T> Guarded<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Replace the value, returning the previous one
    pub fn write(&self, value: T) -> T {
        std::mem::replace(&mut *self.inner.lock(), value)
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<T: Clone> Guarded<T> {
    pub fn get(&self) -> T {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_read_write_update() {
        let value = Guarded::new(vec![1, 2]);

        assert_eq!(value.read(|v| v.len()), 2);
        value.update(|v| v.push(3));
        assert_eq!(value.get(), vec![1, 2, 3]);

        let previous = value.write(vec![]);
        assert_eq!(previous, vec![1, 2, 3]);
        assert!(value.read(|v| v.is_empty()));
    }

    #[test]
    fn test_concurrent_updates() {
        let counter = Arc::new(Guarded::new(0u32));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.update(|c| *c += 1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 8000);
    }
}
