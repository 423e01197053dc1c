use core::{
    mem::MaybeUninit,
    ops::{Deref, DerefMut},
    slice,
};

/// A vector with inline storage for at most `CAPACITY` elements.
pub struct FixedVec<T, const CAPACITY: usize> {
    buf: [MaybeUninit<T>; CAPACITY],
    len: usize,
}

impl<T, const CAPACITY: usize> FixedVec<T, CAPACITY> {
    pub const fn new() -> Self {
        Self {
            // an array of `MaybeUninit` needs no initialization
            buf: unsafe { MaybeUninit::uninit().assume_init() },
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        CAPACITY
    }

    pub fn is_full(&self) -> bool {
        self.len == CAPACITY
    }

    /// Appends `val` and returns its index, or hands it back when full.
    pub fn push(&mut self, val: T) -> core::result::Result<usize, T> {
        if self.is_full() {
            return Err(val);
        }
        let idx = self.len;
        self.buf[idx].write(val);
        self.len += 1;
        Ok(idx)
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(unsafe { self.buf[self.len].assume_init_read() })
    }

    /// Removes the element at `idx`, moving the last element into its place.
    pub fn swap_remove(&mut self, idx: usize) -> Option<T> {
        if idx >= self.len {
            return None;
        }
        let last = self.len - 1;
        self.as_mut_slice().swap(idx, last);
        self.pop()
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.buf.as_ptr() as *const T, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.buf.as_mut_ptr() as *mut T, self.len) }
    }
}

impl<T, const CAPACITY: usize> Default for FixedVec<T, CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const CAPACITY: usize> Deref for FixedVec<T, CAPACITY> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T, const CAPACITY: usize> DerefMut for FixedVec<T, CAPACITY> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T, const CAPACITY: usize> Drop for FixedVec<T, CAPACITY> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn push_stops_at_capacity() {
        let mut v: FixedVec<u8, 2> = FixedVec::new();
        assert_eq!(v.push(1), Ok(0));
        assert_eq!(v.push(2), Ok(1));
        assert_eq!(v.push(3), Err(3));
        assert_eq!(v.as_slice(), &[1, 2]);
        assert_eq!(v.pop(), Some(2));
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn swap_remove_keeps_the_rest() {
        let mut v: FixedVec<u32, 4> = FixedVec::new();
        for i in 0..4 {
            v.push(i * 10).unwrap();
        }
        assert_eq!(v.swap_remove(1), Some(10));
        assert_eq!(v.as_slice(), &[0, 30, 20]);
        assert_eq!(v.swap_remove(7), None);
    }

    #[test]
    fn elements_are_dropped_with_the_vec() {
        let tracker = Rc::new(());
        {
            let mut v: FixedVec<Rc<()>, 3> = FixedVec::new();
            v.push(tracker.clone()).unwrap();
            v.push(tracker.clone()).unwrap();
            assert_eq!(Rc::strong_count(&tracker), 3);
        }
        assert_eq!(Rc::strong_count(&tracker), 1);
    }
}
