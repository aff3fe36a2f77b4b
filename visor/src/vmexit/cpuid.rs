//! `cpuid` emulation.
//!
//! The guest sees the host's answers, except that VMX support and the
//! hypervisor-present bit can be hidden in leaf 1, and the hypervisor
//! announces itself in the synthetic leaf `0x4000_0000`.
use super::GuestContext;
use crate::{cpu::Cpu, vmcs::ActiveVmcs, VmError};
use abyss::x86_64::intrinsics::CpuidResult;

/// Leaf of the hypervisor vendor identification.
pub const HYPERVISOR_LEAF: u32 = 0x4000_0000;
/// Highest hypervisor leaf, reported in eax of [`HYPERVISOR_LEAF`].
pub const HYPERVISOR_MAX_LEAF: u32 = 0x4000_0001;
/// Vendor signature, returned in ebx, ecx and edx of [`HYPERVISOR_LEAF`].
pub const HYPERVISOR_VENDOR: &[u8; 12] = b"VisorVMXcore";

/// CPUID.1:ECX.VMX
pub const FEATURE_VMX: u32 = 1 << 5;
/// CPUID.1:ECX[31], reserved for hypervisors to announce themselves.
pub const FEATURE_HYPERVISOR: u32 = 1 << 31;

/// Answer `cpuid(leaf, sub_leaf)` as the guest should see it.
pub fn emulate<C: Cpu + ?Sized>(cpu: &C, leaf: u32, sub_leaf: u32, hide_vmx: bool) -> CpuidResult {
    match leaf {
        HYPERVISOR_LEAF => {
            let word = |i: usize| {
                u32::from_le_bytes([
                    HYPERVISOR_VENDOR[i],
                    HYPERVISOR_VENDOR[i + 1],
                    HYPERVISOR_VENDOR[i + 2],
                    HYPERVISOR_VENDOR[i + 3],
                ])
            };
            CpuidResult {
                eax: HYPERVISOR_MAX_LEAF,
                ebx: word(0),
                ecx: word(4),
                edx: word(8),
            }
        }
        1 if hide_vmx => {
            let mut r = cpu.cpuid(leaf, sub_leaf);
            r.ecx &= !(FEATURE_VMX | FEATURE_HYPERVISOR);
            r
        }
        _ => cpu.cpuid(leaf, sub_leaf),
    }
}

/// Handle a `cpuid` exit: leaf in eax, sub-leaf in ecx.
pub fn handle<C: Cpu + ?Sized>(
    vmcs: &ActiveVmcs<'_, C>,
    ctx: &mut GuestContext<'_>,
    hide_vmx: bool,
) -> Result<(), VmError> {
    let r = emulate(vmcs.cpu(), ctx.regs.rax as u32, ctx.regs.rcx as u32, hide_vmx);
    ctx.regs.rax = r.eax as u64;
    ctx.regs.rbx = r.ebx as u64;
    ctx.regs.rcx = r.ecx as u64;
    ctx.regs.rdx = r.edx as u64;
    ctx.next_instruction(vmcs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock::MockCpu, vmcs::Field, GuestRegisters};

    #[test]
    fn vmx_hidden_in_leaf_one() {
        let cpu = MockCpu::new();
        cpu.set_cpuid(
            1,
            0,
            CpuidResult {
                eax: 0x906ea,
                ebx: 0x0010_0800,
                ecx: 0xffff_ffff,
                edx: 0xbfeb_fbff,
            },
        );
        let hidden = emulate(&cpu, 1, 0, true);
        assert_eq!(hidden.ecx & FEATURE_VMX, 0);
        assert_eq!(hidden.ecx & FEATURE_HYPERVISOR, 0);
        assert_eq!(hidden.ecx | FEATURE_VMX | FEATURE_HYPERVISOR, 0xffff_ffff);
        assert_eq!(hidden.eax, 0x906ea);
        assert_eq!(hidden.edx, 0xbfeb_fbff);

        assert_eq!(emulate(&cpu, 1, 0, false), cpu.cpuid(1, 0));
    }

    #[test]
    fn vendor_leaf() {
        let cpu = MockCpu::new();
        cpu.set_cpuid(
            HYPERVISOR_LEAF,
            0,
            CpuidResult {
                eax: 0x4000_000b,
                ebx: u32::from_le_bytes(*b"Micr"),
                ecx: u32::from_le_bytes(*b"osof"),
                edx: u32::from_le_bytes(*b"t Hv"),
            },
        );
        for hide in [true, false] {
            let r = emulate(&cpu, HYPERVISOR_LEAF, 0, hide);
            assert_eq!(r.eax, HYPERVISOR_MAX_LEAF);
            let mut vendor = [0u8; 12];
            vendor[..4].copy_from_slice(&r.ebx.to_le_bytes());
            vendor[4..8].copy_from_slice(&r.ecx.to_le_bytes());
            vendor[8..].copy_from_slice(&r.edx.to_le_bytes());
            assert_eq!(&vendor, HYPERVISOR_VENDOR);
        }
    }

    #[test]
    fn other_leaves_pass_through() {
        let cpu = MockCpu::new();
        for leaf in [0, 7, 0xd, 0x8000_0001] {
            assert_eq!(emulate(&cpu, leaf, 0, true), cpu.cpuid(leaf, 0));
        }
    }

    #[test]
    fn results_land_in_guest_registers() {
        let cpu = MockCpu::new();
        cpu.set_field(Field::GuestRip, 0x4000);
        cpu.set_field(Field::VmexitInstructionLength, 2);
        let vmcs = ActiveVmcs::new(&cpu);
        let mut regs = GuestRegisters {
            rax: 0xdead_beef_0000_0000 | HYPERVISOR_LEAF as u64,
            rbx: u64::MAX,
            rcx: u64::MAX,
            rdx: u64::MAX,
            ..Default::default()
        };
        let mut ctx = GuestContext::capture(&vmcs, &mut regs).unwrap();
        handle(&vmcs, &mut ctx, true).unwrap();
        assert_eq!(ctx.ext.rip, 0x4002);
        assert_eq!(regs.rax, HYPERVISOR_MAX_LEAF as u64);
        assert_eq!(regs.rbx >> 32, 0);
        assert_eq!(regs.rdx >> 32, 0);
    }
}
