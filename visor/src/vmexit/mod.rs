//! VM exit handling.
//!
//! Every VM exit enters the hypervisor through the [`trampoline`], which saves
//! the guest's general purpose registers and the volatile vector registers
//! into a [`GuestRegisters`] frame on the host stack and calls [`dispatch`].
//!
//! The dispatcher routes by exit reason:
//!   - `cpuid` is emulated by [`cpuid`],
//!   - `rdmsr` and `wrmsr` are emulated by [`msr`],
//!   - everything else is a bug in the hypervisor's configuration. It is
//!     reported with the guest RIP, the processor breaks into the debugger, and
//!     the core is parked.
//!
//! Reasons enabled in the [`ExitFilter`] are first offered to the installed
//! [`VmexitController`], which may take them over.
use crate::{
    cpu::Cpu,
    hypervisor::GlobalState,
    vmcs::{ActiveVmcs, BasicExitReason, ExitReason, Field},
    VmError,
};
use abyss::x86_64::Rflags;

pub mod cpuid;
pub mod msr;
pub mod trampoline;

/// Guest registers saved by the trampoline.
///
/// The trampoline lays this frame out on the host stack positionally, so
/// the field order and offsets are fixed.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestRegisters {
    /// xmm0 to xmm5. The remaining vector registers survive the handler call.
    pub xmm: [u128; 6],
    _padding: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

const _: () = assert!(core::mem::size_of::<GuestRegisters>() == 224);
const _: () = assert!(core::mem::offset_of!(GuestRegisters, r15) == 104);
const _: () = assert!(core::mem::offset_of!(GuestRegisters, rax) == 216);

/// Guest registers that live in the VMCS rather than in the frame.
#[derive(Clone, Copy, Debug)]
pub struct ExtendedRegisters {
    /// Instruction pointer.
    pub rip: u64,
    /// Stack pointer.
    pub rsp: u64,
    /// Flags.
    pub rflags: Rflags,
}

/// The full guest register state of one VM exit.
pub struct GuestContext<'a> {
    /// Registers saved by the trampoline.
    pub regs: &'a mut GuestRegisters,
    /// Registers read from the VMCS.
    pub ext: ExtendedRegisters,
}

impl<'a> GuestContext<'a> {
    /// Combine the saved frame with rip, rsp and rflags from the VMCS.
    pub fn capture<C: Cpu + ?Sized>(
        vmcs: &ActiveVmcs<'_, C>,
        regs: &'a mut GuestRegisters,
    ) -> Result<Self, VmError> {
        Ok(Self {
            regs,
            ext: ExtendedRegisters {
                rip: vmcs.read(Field::GuestRip)?,
                rsp: vmcs.read(Field::GuestRsp)?,
                rflags: Rflags::from_bits_truncate(vmcs.read(Field::GuestRflags)?),
            },
        })
    }

    /// Move the guest past the instruction that caused the exit.
    ///
    /// Omitting this makes the guest re-execute the instruction forever.
    pub fn next_instruction<C: Cpu + ?Sized>(
        &mut self,
        vmcs: &ActiveVmcs<'_, C>,
    ) -> Result<(), VmError> {
        self.ext.rip += vmcs.read(Field::VmexitInstructionLength)?;
        vmcs.write(Field::GuestRip, self.ext.rip)
    }

    /// Write rsp and rflags back before resuming.
    pub fn commit<C: Cpu + ?Sized>(&self, vmcs: &ActiveVmcs<'_, C>) -> Result<(), VmError> {
        vmcs.write(Field::GuestRsp, self.ext.rsp)?;
        vmcs.write(Field::GuestRflags, self.ext.rflags.bits())
    }
}

/// Set of basic exit reasons offered to the [`VmexitController`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExitFilter([bool; BasicExitReason::COUNT]);

impl Default for ExitFilter {
    fn default() -> Self {
        Self::empty()
    }
}

impl ExitFilter {
    /// No reason enabled.
    pub const fn empty() -> Self {
        Self([false; BasicExitReason::COUNT])
    }

    /// Enable `reason`.
    pub fn enable(&mut self, reason: BasicExitReason) -> &mut Self {
        self.0[reason.code() as usize] = true;
        self
    }

    /// Whether `reason` is enabled.
    pub fn contains(&self, reason: BasicExitReason) -> bool {
        self.0[reason.code() as usize]
    }

    /// Number of enabled reasons.
    pub fn len(&self) -> usize {
        self.0.iter().filter(|b| **b).count()
    }

    /// Whether no reason is enabled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trait that represent handlers for vmexits.
///
/// The controller runs on the exiting core with interrupts disabled, on the
/// small host stack. It must advance the guest rip itself when it emulates an
/// instruction.
pub trait VmexitController: Sync {
    /// Handle the exit, or decline it with [`VmError::HandleVmexitFailed`].
    fn handle(
        &self,
        reason: ExitReason,
        vmcs: &ActiveVmcs<'_, dyn Cpu>,
        ctx: &mut GuestContext<'_>,
    ) -> Result<(), VmError>;
}

impl VmexitController for () {
    fn handle(
        &self,
        reason: ExitReason,
        _vmcs: &ActiveVmcs<'_, dyn Cpu>,
        _ctx: &mut GuestContext<'_>,
    ) -> Result<(), VmError> {
        Err(VmError::HandleVmexitFailed(reason))
    }
}

impl<A, B> VmexitController for (A, B)
where
    A: VmexitController,
    B: VmexitController,
{
    fn handle(
        &self,
        reason: ExitReason,
        vmcs: &ActiveVmcs<'_, dyn Cpu>,
        ctx: &mut GuestContext<'_>,
    ) -> Result<(), VmError> {
        match self.0.handle(reason, vmcs, ctx) {
            Err(VmError::HandleVmexitFailed(_)) => self.1.handle(reason, vmcs, ctx),
            r => r,
        }
    }
}

/// Handle one VM exit on the current core.
///
/// `Ok` means the guest may resume. Any error is reported, and the processor
/// breaks into the debugger once before the error is returned.
pub fn dispatch<C: Cpu + 'static>(
    cpu: &C,
    global: &GlobalState,
    regs: &mut GuestRegisters,
) -> Result<(), VmError> {
    let vmcs = ActiveVmcs::new(cpu);
    let result = handle(&vmcs, global, regs);
    if let Err(e) = &result {
        report(&vmcs, e);
        cpu.debug_break();
    }
    result
}

fn handle<C: Cpu + 'static>(
    vmcs: &ActiveVmcs<'_, C>,
    global: &GlobalState,
    regs: &mut GuestRegisters,
) -> Result<(), VmError> {
    let reason = vmcs.exit_reason()?;
    let mut ctx = GuestContext::capture(vmcs, regs)?;

    if reason
        .get_basic_reason()
        .map_or(false, |basic| global.exit_filter().contains(basic))
    {
        let dynamic = ActiveVmcs::new(vmcs.cpu() as &dyn Cpu);
        match global.controller().handle(reason, &dynamic, &mut ctx) {
            Err(VmError::HandleVmexitFailed(_)) => (),
            r => return r.and_then(|_| ctx.commit(vmcs)),
        }
    }

    match reason {
        ExitReason::BasicExitReason(BasicExitReason::Cpuid) => {
            cpuid::handle(vmcs, &mut ctx, global.hide_vmx())?
        }
        ExitReason::BasicExitReason(BasicExitReason::Rdmsr) => {
            msr::handle(vmcs, &mut ctx, msr::MsrAccess::Read)?
        }
        ExitReason::BasicExitReason(BasicExitReason::Wrmsr) => {
            msr::handle(vmcs, &mut ctx, msr::MsrAccess::Write)?
        }
        _ => {
            return Err(VmError::UnhandledExitReason {
                reason,
                rip: ctx.ext.rip,
            })
        }
    }
    ctx.commit(vmcs)
}

fn report<C: Cpu + ?Sized>(vmcs: &ActiveVmcs<'_, C>, e: &VmError) {
    match e {
        VmError::UnhandledExitReason { reason, rip } => {
            error!("VMExit unhandled: {:?} at rip {:#x}", reason, rip);
            match vmcs.disassemble(*rip) {
                Some(insn) => error!("  {:#x}: {}", rip, insn),
                None => error!("  {:#x}: <unavailable>", rip),
            }
            vmcs.dump();
        }
        e => error!("VMExit handling failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hypervisor::Platform,
        mock::{MockCpu, MockPlatform},
        vm_control::IA32_VMX_BASIC,
    };
    use abyss::x86_64::intrinsics::CpuidResult;
    use num_enum::TryFromPrimitive;
    use rand::Rng;

    fn exit(cpu: &MockCpu, reason: BasicExitReason, rip: u64, len: u64) {
        cpu.set_field(Field::VmexitReason, reason.code() as u64);
        cpu.set_field(Field::GuestRip, rip);
        cpu.set_field(Field::GuestRsp, 0xffff_f000_0000_8000);
        cpu.set_field(Field::GuestRflags, 0x246);
        cpu.set_field(Field::VmexitInstructionLength, len);
        cpu.reset_counters();
    }

    #[test]
    fn next_instruction_advances_by_reported_length() {
        let cpu = MockCpu::new();
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let rip = rng.gen_range(0..u64::MAX / 2);
            let len = rng.gen_range(1..=15);
            exit(&cpu, BasicExitReason::Cpuid, rip, len);
            let vmcs = ActiveVmcs::new(&cpu);
            let mut regs = GuestRegisters::default();
            let mut ctx = GuestContext::capture(&vmcs, &mut regs).unwrap();
            ctx.next_instruction(&vmcs).unwrap();
            assert_eq!(ctx.ext.rip, rip + len);
            assert_eq!(cpu.field(Field::GuestRip), rip + len);
            assert_eq!(cpu.rip_writes(), 1);
        }
    }

    #[test]
    fn handled_exits_advance_once() {
        let cpu = MockCpu::new();
        let global = GlobalState::default();
        for reason in [BasicExitReason::Cpuid, BasicExitReason::Rdmsr, BasicExitReason::Wrmsr] {
            exit(&cpu, reason, 0x1000, 2);
            let mut regs = GuestRegisters {
                rcx: IA32_VMX_BASIC as u64,
                ..Default::default()
            };
            assert!(dispatch(&cpu, &global, &mut regs).is_ok(), "{:?}", reason);
            assert_eq!(cpu.rip_writes(), 1, "{:?}", reason);
            assert_eq!(cpu.field(Field::GuestRip), 0x1002);
            assert_eq!(cpu.debug_breaks(), 0);
        }
    }

    #[test]
    fn other_exits_are_fatal() {
        let cpu = MockCpu::new();
        let global = GlobalState::default();
        for code in 0..BasicExitReason::COUNT as u16 {
            let reason = match BasicExitReason::try_from_primitive(code) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if matches!(
                reason,
                BasicExitReason::Cpuid | BasicExitReason::Rdmsr | BasicExitReason::Wrmsr
            ) {
                continue;
            }
            exit(&cpu, reason, 0x2000, 3);
            let mut regs = GuestRegisters::default();
            match dispatch(&cpu, &global, &mut regs) {
                Err(VmError::UnhandledExitReason { rip, .. }) => assert_eq!(rip, 0x2000),
                r => panic!("{:?} was handled: {:?}", reason, r),
            }
            assert_eq!(cpu.debug_breaks(), 1, "{:?}", reason);
            assert_eq!(cpu.rip_writes(), 0, "{:?}", reason);
        }
    }

    #[test]
    fn entry_failures_are_fatal() {
        let cpu = MockCpu::new();
        exit(&cpu, BasicExitReason::Cpuid, 0x3000, 2);
        cpu.set_field(Field::VmexitReason, (1 << 31) | BasicExitReason::Cpuid.code() as u64);
        let mut regs = GuestRegisters::default();
        assert!(dispatch(&cpu, &GlobalState::default(), &mut regs).is_err());
        assert_eq!(cpu.debug_breaks(), 1);
    }

    struct CpuidOverride;

    impl VmexitController for CpuidOverride {
        fn handle(
            &self,
            reason: ExitReason,
            vmcs: &ActiveVmcs<'_, dyn Cpu>,
            ctx: &mut GuestContext<'_>,
        ) -> Result<(), VmError> {
            match reason.get_basic_reason() {
                Some(BasicExitReason::Cpuid) if ctx.regs.rax == 0x4000_0100 => {
                    ctx.regs.rax = 0x1234;
                    ctx.next_instruction(vmcs)
                }
                _ => Err(VmError::HandleVmexitFailed(reason)),
            }
        }
    }

    static OVERRIDE: ((), CpuidOverride) = ((), CpuidOverride);

    #[test]
    fn controller_sees_filtered_reasons_first() {
        let cpu = MockCpu::new();
        cpu.set_cpuid(0x4000_0100, 0, CpuidResult::default());
        let mut global = GlobalState::new(true, &OVERRIDE, MockPlatform::guarded);
        let mut filter = ExitFilter::empty();
        filter.enable(BasicExitReason::Cpuid);
        global.set_exit_filter(filter);

        exit(&cpu, BasicExitReason::Cpuid, 0x1000, 2);
        let mut regs = GuestRegisters {
            rax: 0x4000_0100,
            ..Default::default()
        };
        dispatch(&cpu, &global, &mut regs).unwrap();
        assert_eq!(regs.rax, 0x1234);
        assert_eq!(cpu.rip_writes(), 1);

        // Declined requests fall through to the built-in emulation.
        exit(&cpu, BasicExitReason::Cpuid, 0x1000, 2);
        let mut regs = GuestRegisters {
            rax: 0,
            ..Default::default()
        };
        dispatch(&cpu, &global, &mut regs).unwrap();
        assert_eq!(regs.rax, cpu.cpuid(0, 0).eax as u64);
        assert_eq!(cpu.rip_writes(), 1);
    }

    #[test]
    fn filter_membership() {
        let mut filter = ExitFilter::empty();
        assert!(filter.is_empty());
        filter
            .enable(BasicExitReason::MovCr)
            .enable(BasicExitReason::Loadiwkey);
        assert!(filter.contains(BasicExitReason::Loadiwkey));
        assert!(!filter.contains(BasicExitReason::Cpuid));
        assert_eq!(filter.len(), 2);
    }
}
