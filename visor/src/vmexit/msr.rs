//! `rdmsr` and `wrmsr` emulation.
//!
//! Every MSR access the bitmap lets exit is passed through to the processor.
//! The value travels split across edx:eax.
use super::GuestContext;
use crate::{cpu::Cpu, vmcs::ActiveVmcs, VmError};

/// Direction of an MSR access.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MsrAccess {
    /// rdmsr
    Read,
    /// wrmsr
    Write,
}

/// Handle an MSR access exit. The MSR index is in ecx.
pub fn handle<C: Cpu + ?Sized>(
    vmcs: &ActiveVmcs<'_, C>,
    ctx: &mut GuestContext<'_>,
    access: MsrAccess,
) -> Result<(), VmError> {
    let cpu = vmcs.cpu();
    let index = ctx.regs.rcx as u32;
    match access {
        MsrAccess::Read => {
            let v = cpu.read_msr(index)?;
            ctx.regs.rdx = v >> 32;
            ctx.regs.rax = v & 0xffff_ffff;
        }
        MsrAccess::Write => {
            let v = (ctx.regs.rdx << 32) | (ctx.regs.rax & 0xffff_ffff);
            cpu.write_msr(index, v)?;
        }
    }
    ctx.next_instruction(vmcs)
}
