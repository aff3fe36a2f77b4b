//! Model-specific register (MSR).

use core::arch::asm;

/// Feature control. Gates VMXON in and outside of SMX operation.
pub const IA32_FEATURE_CONTROL: usize = 0x3a;
/// Ring 0 code segment used by sysenter.
pub const IA32_SYSENTER_CS: usize = 0x174;
/// Stack pointer loaded by sysenter.
pub const IA32_SYSENTER_ESP: usize = 0x175;
/// Instruction pointer loaded by sysenter.
pub const IA32_SYSENTER_EIP: usize = 0x176;
/// Debug control.
pub const IA32_DEBUGCTL: usize = 0x1d9;
/// Extended feature enables.
pub const IA32_EFER: usize = 0xc000_0080;
/// Base address of fs.
pub const IA32_FS_BASE: usize = 0xc000_0100;
/// Base address of gs.
pub const IA32_GS_BASE: usize = 0xc000_0101;

bitflags::bitflags! {
    /// Layout of [`IA32_FEATURE_CONTROL`].
    pub struct FeatureControl: u64 {
        /// Once set, the msr can not be written until reset.
        const LOCK = 1 << 0;
        /// VMXON is allowed inside SMX operation.
        const VMX_INSIDE_SMX = 1 << 1;
        /// VMXON is allowed outside SMX operation.
        const VMX_OUTSIDE_SMX = 1 << 2;
    }
}

/// Read the msr `index`.
#[inline(always)]
pub fn rdmsr(index: u32) -> u64 {
    let hi: u32;
    let lo: u32;
    unsafe {
        asm!("rdmsr", out("edx") hi, out("eax") lo, in("ecx") index, options(nomem, nostack));
    }
    ((hi as u64) << 32) | (lo as u64)
}

/// Write the msr `index`.
///
/// # Safety
/// Writing a model specific register can change the behavior of the processor.
#[inline(always)]
pub unsafe fn wrmsr(index: u32, v: u64) {
    asm!(
        "wrmsr",
        in("edx") (v >> 32) as u32,
        in("eax") v as u32,
        in("ecx") index,
        options(nomem, nostack)
    );
}
