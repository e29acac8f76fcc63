//! Fixed-role pools for message buffers
//!
//! One pool serves outgoing messages and one serves incoming messages, so a
//! steady-state tick allocates nothing. Ownership moves to the caller on
//! `acquire` and back on `release`. Releasing twice or holding on to a value
//! after release is a caller bug the pool does not detect.

/// Values that can be cleared for reuse
pub trait Recycle: Default {
    /// Clear contents while keeping allocations
    fn reset(&mut self);
}

/// Free list of recyclable values
#[derive(Debug)]
pub struct Pool<T: Recycle> {
    free: Vec<T>,
    created: usize,
}

impl<T: Recycle> Pool<T> {
    pub fn new() -> Self {
        Pool {
            free: Vec::new(),
            created: 0,
        }
    }

    /// Take a value from the pool, creating one if it is empty
    pub fn acquire(&mut self) -> T {
        match self.free.pop() {
            Some(value) => value,
            None => {
                self.created += 1;
                T::default()
            }
        }
    }

    /// Return a value after its single logical use
    pub fn release(&mut self, mut value: T) {
        value.reset();
        self.free.push(value);
    }

    /// Values currently idle in the pool
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Values ever allocated by this pool
    pub fn created(&self) -> usize {
        self.created
    }
}

impl<T: Recycle> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Scratch(Vec<u8>);

    impl Recycle for Scratch {
        fn reset(&mut self) {
            self.0.clear();
        }
    }

    #[test]
    fn test_release_then_acquire_reuses() {
        let mut pool: Pool<Scratch> = Pool::new();

        let mut a = pool.acquire();
        a.0.extend_from_slice(&[1, 2, 3]);
        let capacity = a.0.capacity();
        pool.release(a);
        assert_eq!(pool.available(), 1);

        let b = pool.acquire();
        assert!(b.0.is_empty());
        assert_eq!(b.0.capacity(), capacity);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn test_acquire_grows_when_empty() {
        let mut pool: Pool<Scratch> = Pool::new();
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.created(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
    }
}
