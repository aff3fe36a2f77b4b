//! Memory abstraction.
//!
//! The hypervisor runs inside a host kernel whose virtual-to-physical mapping
//! it does not control, so conversion between [`Va`] and [`Pa`] is always done
//! by the embedding platform. These types only keep the two address spaces
//! from being mixed up.

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;

/// Physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// PA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new physical address with a check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Whether the address is aligned to a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

/// Virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Create a new virtual address with a check.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Address of the given pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Whether the address lies in the upper (kernel) canonical half.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= 0xffff_8000_0000_0000
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::fmt::Debug for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($t), self.0)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_checks() {
        assert!(Va::new(0x0000_7fff_ffff_f000).is_some());
        assert!(Va::new(0xffff_8000_0000_0000).unwrap().is_kernel());
        assert!(Va::new(0x0000_8000_0000_0000).is_none());
        assert!(Pa::new(0x1000).unwrap().is_page_aligned());
        assert!(!(Pa::ZERO + 8).is_page_aligned());
        assert_eq!(format!("{}", Pa::ZERO + 0x2000), "Pa(0x2000)");
    }
}
