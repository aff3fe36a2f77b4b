//! x86_64 specific

pub mod intrinsics;
pub mod msr;
pub mod segmentation;
pub mod table;

use core::arch::asm;

/// Privilege Levels.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PrivilegeLevel {
    Ring0 = 0,
    Ring1 = 1,
    Ring2 = 2,
    Ring3 = 3,
}

bitflags::bitflags! {
    /// rflags.
    #[repr(transparent)]
    pub struct Rflags: u64 {
        /// Carry Flag
        const CF = 1 << 0;
        /// Must be 1.
        const _1 = 1 << 1;
        /// Parity Flag
        const PF = 1 << 2;
        /// Adjust Flag
        const AF = 1 << 4;
        /// Zero Flag
        const ZF = 1 << 6;
        /// Sign Flag
        const SF = 1 << 7;
        /// Trap Flag
        const TF = 1 << 8;
        /// Interrupt enable.
        const IF = 1 << 9;
        /// Direction Flag
        const DF = 1 << 10;
        /// Overflow Flag
        const OF = 1 << 11;
        /// I/O privilege level field - bit 0
        const IOPL0 = 1 << 12;
        /// I/O privilege level field - bit 1
        const IOPL1 = 1 << 13;
        /// Nested task
        const NT = 1 << 14;
        /// Resume
        const RF = 1 << 16;
        /// Virtual-8086 mode
        const VM = 1 << 17;
        /// Alignment check or access control
        const AC = 1 << 18;
        /// Virtual Interrupt
        const VIF = 1 << 19;
        /// Virtual interrupt pending
        const VIP = 1 << 20;
        /// Identification.
        ///
        /// The ability of a program or procedure to set or clear this flag
        /// indicates support for the CPUID instruction.
        const ID = 1 << 21;
    }
}

impl Rflags {
    /// Read the current value.
    #[inline(always)]
    pub fn read() -> Self {
        let ret: u64;
        unsafe {
            asm!(
                "pushf",
                "pop {0}",
                lateout(reg) ret,
            );
            Self::from_bits_truncate(ret)
        }
    }
}

bitflags::bitflags! {
    /// Cr0 Register.
    #[repr(transparent)]
    pub struct Cr0: u64 {
        /// Protected mode enable.
        const PE = 1 << 0;
        /// Monitor co-processor.
        const MP = 1 << 1;
        /// Emulation.
        const EM = 1 << 2;
        /// Task switched.
        const TS = 1 << 3;
        /// Extension type.
        const ET = 1 << 4;
        /// Numeric error.
        const NE = 1 << 5;
        /// Write protect.
        const WP = 1 << 16;
        /// Alignment mask.
        const AM = 1 << 18;
        /// Not-write through.
        const NW = 1 << 29;
        /// Cache disable.
        const CD = 1 << 30;
        /// Paging.
        const PG = 1 << 31;
    }
}

impl Cr0 {
    /// Read the current value.
    #[inline(always)]
    pub fn current() -> Self {
        let ret: u64;
        unsafe {
            asm!("mov {}, cr0", lateout(reg) ret, options(nomem, nostack));
            Self::from_bits_unchecked(ret)
        }
    }

    /// Write the value into cr0.
    ///
    /// # Safety
    /// Write to system register is unsafe.
    #[inline(always)]
    pub unsafe fn apply(self) {
        asm!("mov cr0, {}", in(reg) self.bits(), options(nomem, nostack));
    }
}

bitflags::bitflags! {
    /// Cr4 Register.
    #[repr(transparent)]
    pub struct Cr4: u64 {
        /// Virtual 8086 mode extensions.
        const VME = 1 << 0;
        /// Protected mode virtual interrupts.
        const PVI = 1 << 1;
        /// Time stamp disable.
        const TSD = 1 << 2;
        /// Debugging extensions.
        const DE = 1 << 3;
        /// Page size extension.
        const PSE = 1 << 4;
        /// Physical address extension.
        const PAE = 1 << 5;
        /// Machine check exception.
        const MCE = 1 << 6;
        /// Page global enable.
        const PGE = 1 << 7;
        /// Performance monitoring counter enable.
        const PCE = 1 << 8;
        /// Os support for fxsave and fxrstor instructions.
        const OSFXSR = 1 << 9;
        /// Os support for unmasked simd floating point exceptions.
        const OSXMMEXCPT = 1 << 10;
        /// User mode instruction prevention.
        const UMIP = 1 << 11;
        /// Virtual machine extensions enable.
        const VMXE = 1 << 13;
        /// Safer mode extensions enable.
        const SMXE = 1 << 14;
        /// Fsgsbase instructions enable.
        const FSGSBASE = 1 << 16;
        /// Pcid enable.
        const PCIDE = 1 << 17;
        /// Xsave and processor extended states enable.
        const OSXSAVE = 1 << 18;
        /// Supervisor mode executions protection enable.
        const SMEP = 1 << 20;
        /// Supervisor mode access protection enable.
        const SMAP = 1 << 21;
        /// Protection keys for user-mode pages enable.
        const PKE = 1 << 22;
        /// Control-flow-enforcement enable.
        const CET = 1 << 23;
        /// Protection keys for supervisor-mode pages enable.
        const PKS = 1 << 24;
    }
}

impl Cr4 {
    /// Read the current value.
    #[inline(always)]
    pub fn current() -> Self {
        let ret: u64;
        unsafe {
            asm!("mov {}, cr4", lateout(reg) ret, options(nomem, nostack));
            Self::from_bits_unchecked(ret)
        }
    }

    /// Write the value into cr4.
    ///
    /// # Safety
    /// Write to system register is unsafe.
    #[inline(always)]
    pub unsafe fn apply(self) {
        asm!("mov cr4, {}", in(reg) self.bits(), options(nomem, nostack));
    }
}
