use core::mem::{size_of, ManuallyDrop, MaybeUninit};

/// A memory-mapped register accessed only through volatile loads and stores.
///
/// Values whose size is a multiple of four bytes move one dword at a time, so a
/// 64-bit register inside a `packed(4)` register block never needs an unaligned
/// or 64-bit wide access.
#[repr(transparent)]
pub struct Volatile<T>(T);

impl<T> Volatile<T> {
    pub fn read(&self) -> T {
        let src = self as *const Self as *const T;
        unsafe {
            if size_of::<T>() % 4 == 0 {
                let mut val = MaybeUninit::<T>::uninit();
                let src = src as *const u32;
                let dst = val.as_mut_ptr() as *mut u32;
                for i in 0..size_of::<T>() / 4 {
                    dst.add(i).write_unaligned(src.add(i).read_volatile());
                }
                val.assume_init()
            } else {
                src.read_volatile()
            }
        }
    }

    pub fn write(&mut self, val: T) {
        let dst = self as *mut Self as *mut T;
        let val = ManuallyDrop::new(val);
        unsafe {
            if size_of::<T>() % 4 == 0 {
                let src = &*val as *const T as *const u32;
                let dst = dst as *mut u32;
                for i in 0..size_of::<T>() / 4 {
                    dst.add(i).write_volatile(src.add(i).read_unaligned());
                }
            } else {
                dst.write_volatile(ManuallyDrop::into_inner(val));
            }
        }
    }

    pub fn modify<F: FnOnce(&mut T)>(&mut self, f: F) {
        let mut val = self.read();
        f(&mut val);
        self.write(val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, packed(4))]
    struct Block {
        status: Volatile<u32>,
        wide: Volatile<[u32; 2]>,
        byte: Volatile<u8>,
    }

    #[test]
    fn wide_values_move_as_dwords() {
        let mut block = Block {
            status: Volatile(0),
            wide: Volatile([0, 0]),
            byte: Volatile(0),
        };
        block.wide.write([0xDEAD_BEEF, 0x0000_0001]);
        block.wide.modify(|v| v[1] |= 0x10);
        assert_eq!(block.wide.read(), [0xDEAD_BEEF, 0x11]);
        assert_eq!(block.status.read(), 0);

        block.byte.write(0x7F);
        assert_eq!(block.byte.read(), 0x7F);
    }
}
