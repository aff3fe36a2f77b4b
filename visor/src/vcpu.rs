//! Per logical processor state: entering VMX operation and filling the VMCS.
use crate::{
    cpu::Cpu,
    hypervisor::{GlobalState, Platform},
    segment::{segment_base, SegmentState},
    vm_control::*,
    vmcs::{ActiveVmcs, Field, VmxRegion},
    vmexit::trampoline,
    VmError,
};
use abyss::{
    addressing::{Pa, Va},
    x86_64::{
        msr::{
            IA32_DEBUGCTL, IA32_FS_BASE, IA32_GS_BASE, IA32_SYSENTER_CS, IA32_SYSENTER_EIP,
            IA32_SYSENTER_ESP,
        },
        segmentation::SegmentRegister,
        table::DescriptorTableRegister,
        Cr4,
    },
};
use core::ptr::NonNull;

/// Where a logical processor is in its lifecycle.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessorState {
    /// Nothing has been done on this core.
    NotVirtualized = 0,
    /// `vmxon` was attempted.
    EnteringOperation,
    /// The VMCS is loaded and fully populated.
    StructureConfigured,
    /// The core runs the guest and services its exits.
    GuestRunning,
    /// An exit could not be handled and the core is parked.
    Halted,
}

/// Stack and descriptor tables of one side of the VMX transition.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecutionState {
    /// Stack pointer loaded on the transition.
    pub rsp: u64,
    /// Instruction pointer loaded on the transition.
    pub rip: u64,
    /// Size of the stack `rsp` points into.
    pub stack_size: usize,
    /// Global descriptor table.
    pub gdtr: DescriptorTableRegister,
    /// Interrupt descriptor table.
    pub idtr: DescriptorTableRegister,
}

/// Everything the hypervisor owns for one logical processor.
///
/// Lives in physically contiguous memory handed out by the [`Platform`], and
/// is never freed once the core entered VMX operation.
#[repr(C)]
pub struct LogicalProcessor {
    vmxon: VmxRegion,
    vmcs: VmxRegion,
    index: usize,
    vmxon_pa: Pa,
    vmcs_pa: Pa,
    host_stack: *mut u8,
    global: *const GlobalState,
    guest: ExecutionState,
    host: ExecutionState,
    state: ProcessorState,
}

impl LogicalProcessor {
    /// Initialize the context in zeroed memory.
    ///
    /// # Safety
    /// `this` must point to zeroed memory sized and aligned for `Self`, and
    /// `host_stack` to `host_stack_size` bytes. Both, and `global`, must stay
    /// alive as long as the core may run the guest.
    pub unsafe fn init<'a>(
        this: NonNull<Self>,
        index: usize,
        host_stack: NonNull<u8>,
        host_stack_size: usize,
        global: NonNull<GlobalState>,
    ) -> &'a mut Self {
        let lp = &mut *this.as_ptr();
        lp.index = index;
        lp.host_stack = host_stack.as_ptr();
        lp.host.stack_size = host_stack_size;
        lp.global = global.as_ptr();
        lp.state = ProcessorState::NotVirtualized;
        lp
    }

    /// Index of this logical processor.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ProcessorState) {
        self.state = state;
    }

    /// Shared, read-only state of the hypervisor.
    pub fn global(&self) -> &GlobalState {
        // SAFETY: `init` requires the global state to outlive the context.
        unsafe { &*self.global }
    }

    /// Host-side execution state recorded by the last configuration.
    pub fn host_state(&self) -> &ExecutionState {
        &self.host
    }

    /// Guest-side execution state recorded by the last configuration.
    ///
    /// Only the descriptor tables are recorded. The guest resumes where
    /// [`Cpu::launch`] was called, and the launch stub writes that rsp and
    /// rip straight into the VMCS, so `rsp`, `rip` and `stack_size` stay 0.
    pub fn guest_state(&self) -> &ExecutionState {
        &self.guest
    }

    /// Physical address of the VMCS.
    pub fn vmcs_pa(&self) -> Pa {
        self.vmcs_pa
    }

    /// Physical address of the VMXON region.
    pub fn vmxon_pa(&self) -> Pa {
        self.vmxon_pa
    }

    /// Enter VMX operation on the current core.
    ///
    /// The caller must be pinned to the core this context belongs to, with
    /// CR0 and CR4 already adjusted for VMX.
    pub fn start_vmx<C, P>(&mut self, cpu: &C, platform: &P) -> Result<(), VmError>
    where
        C: Cpu + ?Sized,
        P: Platform + ?Sized,
    {
        self.state = ProcessorState::EnteringOperation;
        let rev_id = revision_id(cpu.read_msr(IA32_VMX_BASIC)?);
        self.vmxon.reset(rev_id);
        self.vmxon_pa = platform.virt_to_phys(Va::from_ptr(&self.vmxon));
        unsafe { self.vmxon.on(cpu, self.vmxon_pa) }?;
        debug!("vmxon on logical processor {} ({})", self.index, self.vmxon_pa);
        Ok(())
    }

    /// Clear and load this core's VMCS, then populate it.
    ///
    /// A failure leaves the VMCS partially written.
    pub fn configure_vmcs<C, P>(&mut self, cpu: &C, platform: &P) -> Result<(), VmError>
    where
        C: Cpu + ?Sized,
        P: Platform + ?Sized,
    {
        let rev_id = revision_id(cpu.read_msr(IA32_VMX_BASIC)?);
        self.vmcs.reset(rev_id);
        self.vmcs_pa = platform.virt_to_phys(Va::from_ptr(&self.vmcs));
        let vmcs = unsafe {
            self.vmcs.clear(cpu, self.vmcs_pa)?;
            self.vmcs.activate(cpu, self.vmcs_pa)?
        };
        self.configure_vmcs_fields(&vmcs, platform)?;
        self.state = ProcessorState::StructureConfigured;
        Ok(())
    }

    /// Populate the guest-state, execution-control and host-state areas.
    ///
    /// The guest becomes a snapshot of the system as it runs right now. Guest
    /// rip and rsp are left to the launch, which records its own resume point.
    pub fn configure_vmcs_fields<C, P>(
        &mut self,
        vmcs: &ActiveVmcs<'_, C>,
        platform: &P,
    ) -> Result<(), VmError>
    where
        C: Cpu + ?Sized,
        P: Platform + ?Sized,
    {
        let cpu = vmcs.cpu();
        let msr = |index: usize| cpu.read_msr(index as u32);

        let gdtr = cpu.read_gdtr();
        let idtr = cpu.read_idtr();
        self.guest.gdtr = gdtr;
        self.guest.idtr = idtr;
        self.host.gdtr = gdtr;
        self.host.idtr = idtr;
        // SAFETY: the live gdt of this core.
        let gdt = unsafe { gdtr.entries() };

        let (cr0, cr3, cr4) = (cpu.read_cr0(), cpu.read_cr3(), cpu.read_cr4());

        // Guest state.
        vmcs.write(Field::GuestCr0, cr0)?;
        vmcs.write(Field::GuestCr3, cr3)?;
        vmcs.write(Field::GuestCr4, cr4)?;
        vmcs.write(Field::GuestDr7, 0x400)?;
        vmcs.write(Field::GuestRflags, cpu.read_rflags().bits())?;
        vmcs.write(Field::GuestIa32Debugctl, msr(IA32_DEBUGCTL)?)?;
        vmcs.write(Field::GuestIa32SysenterCsMsr, msr(IA32_SYSENTER_CS)?)?;
        vmcs.write(Field::GuestIa32SysenterEspMsr, msr(IA32_SYSENTER_ESP)?)?;
        vmcs.write(Field::GuestIa32SysenterEipMsr, msr(IA32_SYSENTER_EIP)?)?;
        vmcs.write(Field::GuestLinkPointer, u64::MAX)?;
        vmcs.write(Field::GuestActivityState, 0)?;
        vmcs.write(Field::GuestInterruptibilityState, 0)?;

        for reg in SegmentRegister::ALL {
            let seg = SegmentState::capture(cpu, gdt, reg)?;
            let (sel, base, limit, rights) = guest_segment_fields(reg);
            vmcs.write(sel, seg.selector.pack() as u64)?;
            vmcs.write(base, seg.base)?;
            vmcs.write(limit, seg.limit as u64)?;
            vmcs.write(rights, seg.access_rights as u64)?;
        }
        vmcs.write(Field::GuestGdtrBase, gdtr.base())?;
        vmcs.write(Field::GuestGdtrLimit, gdtr.limit() as u64)?;
        vmcs.write(Field::GuestIdtrBase, idtr.base())?;
        vmcs.write(Field::GuestIdtrLimit, idtr.limit() as u64)?;

        // Execution controls.
        vmcs.write(
            Field::PinBasedExecControls,
            adjust_control_value(cpu, ControlCategory::PinBased, 0)? as u64,
        )?;
        vmcs.write(
            Field::ProcessorBasedVmexecControls,
            adjust_control_value(
                cpu,
                ControlCategory::ProcessorBased,
                (VmcsProcBasedVmexecCtl::USEMSRBMP | VmcsProcBasedVmexecCtl::ACTIVATE_SECONDARY_CTL)
                    .bits(),
            )? as u64,
        )?;
        vmcs.write(
            Field::SecondaryVmexecControls,
            adjust_control_value(
                cpu,
                ControlCategory::SecondaryProcessorBased,
                (VmcsProcBasedSecondaryVmexecCtl::ENABLE_RDTSCP
                    | VmcsProcBasedSecondaryVmexecCtl::ENABLE_INVPCID
                    | VmcsProcBasedSecondaryVmexecCtl::ENABLE_XSAVES_XRSTORS)
                    .bits(),
            )? as u64,
        )?;
        vmcs.write(
            Field::VmexitControls,
            adjust_control_value(
                cpu,
                ControlCategory::VmExit,
                VmcsExitCtl::HOST_ADDRESS_SPACE_SIZE.bits(),
            )? as u64,
        )?;
        vmcs.write(
            Field::VmentryControls,
            adjust_control_value(cpu, ControlCategory::VmEntry, VmcsEntryCtl::IA32E_MODE_GUEST.bits())?
                as u64,
        )?;
        vmcs.write(Field::ExceptionBitmap, 0)?;
        vmcs.write(
            Field::MsrBitmaps,
            platform
                .virt_to_phys(Va::from_ptr(self.global().msr_bitmap()))
                .into_usize() as u64,
        )?;
        // The guest owns cr0 entirely. It owns cr4 except VMXE, which it reads as 0.
        vmcs.write(Field::Cr0GuestHostMask, 0)?;
        vmcs.write(Field::Cr4GuestHostMask, Cr4::VMXE.bits())?;
        vmcs.write(Field::Cr0ReadShadow, cr0)?;
        vmcs.write(Field::Cr4ReadShadow, cr4 & !Cr4::VMXE.bits())?;

        // Host state.
        vmcs.write(Field::HostCr0, cr0)?;
        vmcs.write(Field::HostCr3, cr3)?;
        vmcs.write(Field::HostCr4, cr4)?;
        for (reg, field) in [
            (SegmentRegister::Es, Field::HostEsSelector),
            (SegmentRegister::Cs, Field::HostCsSelector),
            (SegmentRegister::Ss, Field::HostSsSelector),
            (SegmentRegister::Ds, Field::HostDsSelector),
            (SegmentRegister::Fs, Field::HostFsSelector),
            (SegmentRegister::Gs, Field::HostGsSelector),
            (SegmentRegister::Tr, Field::HostTrSelector),
        ] {
            // Host selectors must have RPL and TI clear.
            vmcs.write(field, (cpu.read_selector(reg).pack() & !7) as u64)?;
        }
        vmcs.write(Field::HostFsBase, msr(IA32_FS_BASE)?)?;
        vmcs.write(Field::HostGsBase, msr(IA32_GS_BASE)?)?;
        vmcs.write(
            Field::HostTrBase,
            segment_base(gdt, cpu.read_selector(SegmentRegister::Tr))?,
        )?;
        vmcs.write(Field::HostGdtrBase, gdtr.base())?;
        vmcs.write(Field::HostIdtrBase, idtr.base())?;
        vmcs.write(Field::HostIa32SysenterCsMsr, msr(IA32_SYSENTER_CS)?)?;
        vmcs.write(Field::HostIa32SysenterEspMsr, msr(IA32_SYSENTER_ESP)?)?;
        vmcs.write(Field::HostIa32SysenterEipMsr, msr(IA32_SYSENTER_EIP)?)?;

        // Host rsp is the middle of the stack, and the exit trampoline finds
        // this context stored there.
        let rsp = self.host_stack as u64 + (self.host.stack_size / 2) as u64;
        unsafe { (rsp as *mut *mut Self).write(self as *mut Self) };
        self.host.rsp = rsp;
        self.host.rip = trampoline::entry_point();
        vmcs.write(Field::HostRsp, self.host.rsp)?;
        vmcs.write(Field::HostRip, self.host.rip)?;
        Ok(())
    }
}

/// Selector, base, limit and access-rights fields of a guest segment register.
fn guest_segment_fields(reg: SegmentRegister) -> (Field, Field, Field, Field) {
    match reg {
        SegmentRegister::Es => (
            Field::GuestEsSelector,
            Field::GuestEsBase,
            Field::GuestEsLimit,
            Field::GuestEsAccessRights,
        ),
        SegmentRegister::Cs => (
            Field::GuestCsSelector,
            Field::GuestCsBase,
            Field::GuestCsLimit,
            Field::GuestCsAccessRights,
        ),
        SegmentRegister::Ss => (
            Field::GuestSsSelector,
            Field::GuestSsBase,
            Field::GuestSsLimit,
            Field::GuestSsAccessRights,
        ),
        SegmentRegister::Ds => (
            Field::GuestDsSelector,
            Field::GuestDsBase,
            Field::GuestDsLimit,
            Field::GuestDsAccessRights,
        ),
        SegmentRegister::Fs => (
            Field::GuestFsSelector,
            Field::GuestFsBase,
            Field::GuestFsLimit,
            Field::GuestFsAccessRights,
        ),
        SegmentRegister::Gs => (
            Field::GuestGsSelector,
            Field::GuestGsBase,
            Field::GuestGsLimit,
            Field::GuestGsAccessRights,
        ),
        SegmentRegister::Ldtr => (
            Field::GuestLdtrSelector,
            Field::GuestLdtrBase,
            Field::GuestLdtrLimit,
            Field::GuestLdtrAccessRights,
        ),
        SegmentRegister::Tr => (
            Field::GuestTrSelector,
            Field::GuestTrBase,
            Field::GuestTrLimit,
            Field::GuestTrAccessRights,
        ),
    }
}
