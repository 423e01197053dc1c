use core::{marker::PhantomData, mem::MaybeUninit};
use spin::Mutex;
use crate::{
    make_error,
    status::{Result, StatusCode},
};

/// A bounded FIFO with inline storage.
pub struct ArrayQueue<T, const N: usize> {
    data: [MaybeUninit<T>; N],
    read_pos: usize,
    write_pos: usize,
    count: usize,
}

impl<T, const N: usize> ArrayQueue<T, N> {
    pub const fn new() -> Self {
        Self {
            data: unsafe { MaybeUninit::uninit().assume_init() },
            read_pos: 0,
            write_pos: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        if self.count == N {
            return Err(make_error!(StatusCode::Full));
        }
        self.data[self.write_pos].write(value);
        self.write_pos = (self.write_pos + 1) % N;
        self.count += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let value = unsafe { self.data[self.read_pos].assume_init_read() };
        self.read_pos = (self.read_pos + 1) % N;
        self.count -= 1;
        Some(value)
    }
}

impl<T, const N: usize> Drop for ArrayQueue<T, N> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

/// Masks interrupts on the current core while `f` runs.
pub trait CriticalSection {
    fn with<R>(f: impl FnOnce() -> R) -> R;
}

/// Single-producer single-consumer channel between an interrupt handler and
/// the main loop.
///
/// The handler side only ever takes the lock for one push. The main loop side
/// pops inside a `C` critical section so the handler can never interrupt it
/// while the lock is held.
pub struct InterruptQueue<T, const N: usize, C> {
    inner: Mutex<ArrayQueue<T, N>>,
    _section: PhantomData<fn() -> C>,
}

impl<T, const N: usize, C: CriticalSection> InterruptQueue<T, N, C> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(ArrayQueue::new()),
            _section: PhantomData,
        }
    }

    /// Producer side, called from interrupt context.
    pub fn push(&self, value: T) -> Result<()> {
        self.inner.lock().push(value)
    }

    /// Consumer side, called from the main loop.
    pub fn pop(&self) -> Option<T> {
        C::with(|| self.inner.lock().pop())
    }

    pub fn is_empty(&self) -> bool {
        C::with(|| self.inner.lock().is_empty())
    }
}
