//! Global and Interrupt Descriptor Table registers.

use core::arch::asm;

/// X86_64's system table register, as stored by `sgdt`/`sidt`.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct DescriptorTableRegister {
    /// Size of the table in bytes minus one.
    pub limit: u16,
    /// Linear address of the table.
    pub base: u64,
}

impl DescriptorTableRegister {
    /// Capture the current global descriptor table register.
    #[inline]
    pub fn gdtr() -> Self {
        let mut r = Self::default();
        unsafe {
            asm!("sgdt [{0}]", in(reg) &mut r, options(nostack));
        }
        r
    }

    /// Capture the current interrupt descriptor table register.
    #[inline]
    pub fn idtr() -> Self {
        let mut r = Self::default();
        unsafe {
            asm!("sidt [{0}]", in(reg) &mut r, options(nostack));
        }
        r
    }

    /// Table base.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Table limit.
    #[inline]
    pub fn limit(&self) -> u16 {
        self.limit
    }

    /// View the table as 8-byte descriptor slots.
    ///
    /// # Safety
    /// `base` must point to a live table of at least `limit + 1` bytes.
    pub unsafe fn entries<'a>(&self) -> &'a [u64] {
        let base = self.base;
        let len = (self.limit as usize + 1) / 8;
        core::slice::from_raw_parts(base as *const u64, len)
    }
}

impl core::fmt::Debug for DescriptorTableRegister {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (base, limit) = (self.base, self.limit);
        write!(f, "DescriptorTableRegister({:#x}, {:#x})", base, limit)
    }
}
