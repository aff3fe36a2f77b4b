//! intrinsics of x86_64 not included in [`core::arch::x86_64`].
//!
//! [`core::arch::x86_64`]: https://doc.rust-lang.org/beta/core/arch/x86_64/index.html
use core::arch::asm;

/// Output registers of the cpuid instruction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Execute cpuid with the given leaf and sub-leaf.
#[inline]
#[allow(unused_unsafe)]
pub fn cpuid(leaf: u32, sub_leaf: u32) -> CpuidResult {
    // Older toolchains declare the intrinsic unsafe.
    let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, sub_leaf) };
    CpuidResult {
        eax: r.eax,
        ebx: r.ebx,
        ecx: r.ecx,
        edx: r.edx,
    }
}

/// Get the local apic id of this core.
pub fn apic_id() -> usize {
    (cpuid(1, 0).ebx >> 24) as usize
}

/// read current cr3.
pub fn read_cr3() -> u64 {
    let r: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) r, options(nomem, nostack));
    }
    r
}

/// Segment limit of the selector, or `None` if the descriptor is not visible.
#[inline]
pub fn lsl(selector: u16) -> Option<u32> {
    let limit: u32;
    let valid: u8;
    unsafe {
        asm!(
            "lsl {0:e}, {1:e}",
            "setz {2}",
            inout(reg) 0u32 => limit,
            in(reg) selector as u32,
            out(reg_byte) valid,
            options(nostack),
        );
    }
    (valid != 0).then_some(limit)
}

/// Access rights of the selector as laid out in the descriptor (bits 8..24),
/// or `None` if the descriptor is not visible.
#[inline]
pub fn lar(selector: u16) -> Option<u32> {
    let rights: u32;
    let valid: u8;
    unsafe {
        asm!(
            "lar {0:e}, {1:e}",
            "setz {2}",
            inout(reg) 0u32 => rights,
            in(reg) selector as u32,
            out(reg_byte) valid,
            options(nostack),
        );
    }
    (valid != 0).then_some(rights)
}

/// Raise a breakpoint exception.
#[inline(always)]
pub fn int3() {
    unsafe { asm!("int3", options(nomem, nostack)) }
}

/// Park the core forever with interrupts disabled.
pub fn halt() -> ! {
    loop {
        unsafe { asm!("cli", "hlt", options(nomem, nostack)) }
    }
}
