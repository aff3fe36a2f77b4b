//! Privileged processor primitives.
//!
//! Every instruction that needs ring 0 or VMX root operation is reached
//! through [`Cpu`], so that the hypervisor logic above it can run against a
//! simulated processor in tests. [`NativeCpu`] is the real thing.
use crate::{vmcs::Field, InstructionError, VmError};
use abyss::{
    addressing::{Pa, Va, PAGE_SIZE},
    x86_64::{
        intrinsics::CpuidResult,
        segmentation::{SegmentRegister, SegmentSelector},
        table::DescriptorTableRegister,
        Rflags,
    },
};

/// Privileged operations of one logical processor.
///
/// Operations act on the processor the caller is currently running on.
/// VMX instructions report failure with [`VmError::VmxOperationError`]
/// carrying the VM-instruction error number when one is available.
pub trait Cpu {
    /// Execute cpuid.
    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuidResult;
    /// Read a model specific register.
    fn read_msr(&self, index: u32) -> Result<u64, VmError>;
    /// Write a model specific register.
    fn write_msr(&self, index: u32, value: u64) -> Result<(), VmError>;

    /// Current cr0.
    fn read_cr0(&self) -> u64;
    /// Current cr3.
    fn read_cr3(&self) -> u64;
    /// Current cr4.
    fn read_cr4(&self) -> u64;
    /// Overwrite cr0.
    ///
    /// # Safety
    /// The value must keep the running system consistent.
    unsafe fn write_cr0(&self, value: u64);
    /// Overwrite cr4.
    ///
    /// # Safety
    /// The value must keep the running system consistent.
    unsafe fn write_cr4(&self, value: u64);
    /// Current rflags.
    fn read_rflags(&self) -> Rflags;

    /// Current global descriptor table register.
    fn read_gdtr(&self) -> DescriptorTableRegister;
    /// Current interrupt descriptor table register.
    fn read_idtr(&self) -> DescriptorTableRegister;
    /// Selector currently loaded in `reg`.
    fn read_selector(&self, reg: SegmentRegister) -> SegmentSelector;
    /// Segment limit of `selector`, 0 if it is not accessible.
    fn segment_limit(&self, selector: SegmentSelector) -> u32;
    /// Native access rights of `selector` (the `lar` layout).
    fn access_rights(&self, selector: SegmentSelector) -> Option<u32>;

    /// Enter VMX operation.
    ///
    /// # Safety
    /// `region` must be a stamped VMXON region that stays alive while in VMX operation.
    unsafe fn vmxon(&self, region: Pa) -> Result<(), VmError>;
    /// Leave VMX operation.
    ///
    /// # Safety
    /// No guest may be running on this core.
    unsafe fn vmxoff(&self) -> Result<(), VmError>;
    /// Clear the VMCS at `vmcs`.
    ///
    /// # Safety
    /// `vmcs` must be a stamped VMCS region.
    unsafe fn vmclear(&self, vmcs: Pa) -> Result<(), VmError>;
    /// Make the VMCS at `vmcs` current on this core.
    ///
    /// # Safety
    /// `vmcs` must be a stamped VMCS region.
    unsafe fn vmptrld(&self, vmcs: Pa) -> Result<(), VmError>;
    /// Read a field of the current VMCS.
    fn vmread(&self, field: Field) -> Result<u64, VmError>;
    /// Write a field of the current VMCS.
    fn vmwrite(&self, field: Field, value: u64) -> Result<(), VmError>;
    /// Launch the current VMCS, resuming guest execution right after this call.
    ///
    /// On success the call returns in guest mode.
    ///
    /// # Safety
    /// The current VMCS must be fully configured.
    unsafe fn launch(&self) -> Result<(), VmError>;

    /// Copy guest code at `rip` into `buf`, returning the number of bytes read.
    fn fetch_guest_code(&self, rip: u64, buf: &mut [u8]) -> usize;
    /// Break into the debugger.
    fn debug_break(&self);
}

/// Runs a closure and reports a processor exception raised inside it as
/// `Err` instead of delivering it to the interrupted code.
///
/// Provided by the embedding driver through [`Platform::guarded`].
///
/// [`Platform::guarded`]: crate::Platform::guarded
pub type ExceptionGuard = fn(&mut dyn FnMut()) -> Result<(), ()>;

/// The processor the code is running on.
///
/// Model specific register accesses run under the exception guard, so an
/// access the processor rejects becomes [`VmError::HardwareException`].
#[derive(Clone, Copy, Debug)]
pub struct NativeCpu {
    guard: ExceptionGuard,
}

impl NativeCpu {
    /// The current processor, with faulting accesses caught by `guard`.
    pub const fn new(guard: ExceptionGuard) -> Self {
        Self { guard }
    }
}

#[cfg(target_arch = "x86_64")]
mod native {
    use super::*;
    use abyss::x86_64::{intrinsics, msr, Cr0, Cr4};
    use core::arch::asm;

    impl NativeCpu {
        fn status(&self, insn: &'static str, failed: u8) -> Result<(), VmError> {
            if failed != 0 {
                Err(VmError::VmxOperationError(insn, self.instruction_error()))
            } else {
                Ok(())
            }
        }

        fn instruction_error(&self) -> InstructionError {
            let failed: u8;
            let v: u64;
            unsafe {
                asm!(
                    "clc",
                    "vmread {}, {}",
                    "setna {}",
                    out(reg) v,
                    in(reg) Field::InstructionError as u64,
                    out(reg_byte) failed,
                    options(nostack)
                );
            }
            if failed != 0 {
                InstructionError::Unknown(0)
            } else {
                InstructionError::from(v)
            }
        }
    }

    impl Cpu for NativeCpu {
        fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuidResult {
            intrinsics::cpuid(leaf, sub_leaf)
        }

        fn read_msr(&self, index: u32) -> Result<u64, VmError> {
            let mut value = 0;
            let result = (self.guard)(&mut || value = msr::rdmsr(index));
            result
                .map(|()| value)
                .map_err(|()| VmError::HardwareException("rdmsr"))
        }

        fn write_msr(&self, index: u32, value: u64) -> Result<(), VmError> {
            // SAFETY: the caller owns the semantics of the written value, and
            // a rejected write is caught by the guard.
            (self.guard)(&mut || unsafe { msr::wrmsr(index, value) })
                .map_err(|()| VmError::HardwareException("wrmsr"))
        }

        fn read_cr0(&self) -> u64 {
            Cr0::current().bits()
        }

        fn read_cr3(&self) -> u64 {
            intrinsics::read_cr3()
        }

        fn read_cr4(&self) -> u64 {
            Cr4::current().bits()
        }

        unsafe fn write_cr0(&self, value: u64) {
            Cr0::from_bits_unchecked(value).apply()
        }

        unsafe fn write_cr4(&self, value: u64) {
            Cr4::from_bits_unchecked(value).apply()
        }

        fn read_rflags(&self) -> Rflags {
            Rflags::read()
        }

        fn read_gdtr(&self) -> DescriptorTableRegister {
            DescriptorTableRegister::gdtr()
        }

        fn read_idtr(&self) -> DescriptorTableRegister {
            DescriptorTableRegister::idtr()
        }

        fn read_selector(&self, reg: SegmentRegister) -> SegmentSelector {
            reg.current()
        }

        fn segment_limit(&self, selector: SegmentSelector) -> u32 {
            intrinsics::lsl(selector.pack()).unwrap_or(0)
        }

        fn access_rights(&self, selector: SegmentSelector) -> Option<u32> {
            intrinsics::lar(selector.pack())
        }

        unsafe fn vmxon(&self, region: Pa) -> Result<(), VmError> {
            let failed: u8;
            let pa = region.into_usize() as u64;
            asm!(
                "clc",
                "vmxon [{}]",
                "setna {}",
                in(reg) &pa,
                out(reg_byte) failed,
                options(nostack)
            );
            self.status("vmxon", failed)
        }

        unsafe fn vmxoff(&self) -> Result<(), VmError> {
            let failed: u8;
            asm!("clc", "vmxoff", "setna {}", out(reg_byte) failed, options(nostack));
            self.status("vmxoff", failed)
        }

        unsafe fn vmclear(&self, vmcs: Pa) -> Result<(), VmError> {
            let failed: u8;
            let pa = vmcs.into_usize() as u64;
            asm!(
                "clc",
                "vmclear [{}]",
                "setna {}",
                in(reg) &pa,
                out(reg_byte) failed,
                options(nostack)
            );
            self.status("vmclear", failed)
        }

        unsafe fn vmptrld(&self, vmcs: Pa) -> Result<(), VmError> {
            let failed: u8;
            let pa = vmcs.into_usize() as u64;
            asm!(
                "clc",
                "vmptrld [{}]",
                "setna {}",
                in(reg) &pa,
                out(reg_byte) failed,
                options(nostack)
            );
            self.status("vmptrld", failed)
        }

        fn vmread(&self, field: Field) -> Result<u64, VmError> {
            let failed: u8;
            let v: u64;
            unsafe {
                asm!(
                    "clc",
                    "vmread {}, {}",
                    "setna {}",
                    out(reg) v,
                    in(reg) field as u64,
                    out(reg_byte) failed,
                    options(nostack)
                );
            }
            self.status("vmread", failed).map(|_| v)
        }

        fn vmwrite(&self, field: Field, value: u64) -> Result<(), VmError> {
            let failed: u8;
            unsafe {
                asm!(
                    "clc",
                    "vmwrite {}, {}",
                    "setna {}",
                    in(reg) field as u64,
                    in(reg) value,
                    out(reg_byte) failed,
                    options(nostack)
                );
            }
            self.status("vmwrite", failed)
        }

        unsafe fn launch(&self) -> Result<(), VmError> {
            match crate::vmexit::trampoline::launch() {
                0 => Ok(()),
                // VMfailInvalid leaves no error number behind.
                1 => Err(VmError::VmxOperationError("vmlaunch", InstructionError::Unknown(0))),
                _ => Err(VmError::VmxOperationError("vmlaunch", self.instruction_error())),
            }
        }

        fn fetch_guest_code(&self, rip: u64, buf: &mut [u8]) -> usize {
            // Only the kernel half is shared with the host page tables.
            match Va::new(rip as usize) {
                Some(va) if va.is_kernel() => {
                    let room = PAGE_SIZE - (rip as usize & (PAGE_SIZE - 1));
                    let len = buf.len().min(room);
                    unsafe {
                        core::ptr::copy_nonoverlapping(rip as *const u8, buf.as_mut_ptr(), len);
                    }
                    len
                }
                _ => 0,
            }
        }

        fn debug_break(&self) {
            intrinsics::int3()
        }
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::{hypervisor::Platform, mock::MockPlatform};

    #[test]
    fn rejected_msr_access_becomes_an_error() {
        let before = MockPlatform::guarded_calls();
        MockPlatform::fault_guarded_calls(true);
        let cpu = NativeCpu::new(MockPlatform::guarded);
        assert!(matches!(
            cpu.read_msr(0x4000_0000),
            Err(VmError::HardwareException("rdmsr"))
        ));
        assert!(matches!(
            cpu.write_msr(0x4000_0000, 1),
            Err(VmError::HardwareException("wrmsr"))
        ));
        assert_eq!(MockPlatform::guarded_calls() - before, 2);
        MockPlatform::fault_guarded_calls(false);
    }
}
