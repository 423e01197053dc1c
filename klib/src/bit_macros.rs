/// Defines a getter for the bits of `$base` selected by `$mask`, shifted down to bit 0.
///
/// `$base` may be an array element (`data[3]`), so multi-dword hardware
/// structures can be described one word at a time.
#[macro_export]
macro_rules! bit_getter {
    ($base:tt $([$idx:literal])? : $base_ty:ty ; $mask:expr ; $ty:ty, $vis:vis $getter_name:ident) => {
        #[allow(dead_code)]
        $vis fn $getter_name(&self) -> $ty {
            (((self.$base $([$idx])?) & $mask) >> <$base_ty>::trailing_zeros($mask)) as $ty
        }
    };
}

/// Defines a setter writing `val` into the bits of `$base` selected by `$mask`.
/// Bits of `val` that do not fit the mask are dropped.
#[macro_export]
macro_rules! bit_setter {
    ($base:tt $([$idx:literal])? : $base_ty:ty ; $mask:expr ; $ty:ty, $vis:vis $setter_name:ident) => {
        #[allow(dead_code)]
        $vis fn $setter_name(&mut self, val: $ty) {
            let shifted = ((val as $base_ty) << <$base_ty>::trailing_zeros($mask)) & $mask;
            self.$base $([$idx])? = (self.$base $([$idx])? & !$mask) | shifted;
        }
    };
}
