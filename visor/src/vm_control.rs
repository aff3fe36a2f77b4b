//! Flags and MSRs for VMX capabilities, and the adjustment of control values
//! against them.
//!
//! Every VMX control field has bits the processor requires to be 1 and bits
//! it forbids to be 1. The capability MSRs report both as a pair of masks:
//! the low half holds the *allowed 0-settings* (a 1 there means the control
//! must be 1), the high half holds the *allowed 1-settings* (a 0 there means
//! the control must be 0). A requested value is made acceptable by
//! `(requested | allowed0) & allowed1`.
use crate::{cpu::Cpu, VmError};

// VMX Capability MSRs
/// MSR - IA32_VMX_BASIC
pub const IA32_VMX_BASIC: u32 = 0x480;
/// MSR - IA32_VMX_PINBASED_CTLS.
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
/// MSR - IA32_VMX_PROCBASED_CTLS.
pub const IA32_VMX_PROCBASED_CTLS: u32 = 0x482;
/// MSR - IA32_VMX_EXIT_CTLS.
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
/// MSR - IA32_VMX_ENTRY_CTLS.
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
/// MSR - IA32_VMX_CR0_FIXED0.
pub const IA32_VMX_CR0_FIXED0: u32 = 0x486;
/// MSR - IA32_VMX_CR0_FIXED1.
pub const IA32_VMX_CR0_FIXED1: u32 = 0x487;
/// MSR - IA32_VMX_CR4_FIXED0.
pub const IA32_VMX_CR4_FIXED0: u32 = 0x488;
/// MSR - IA32_VMX_CR4_FIXED1.
pub const IA32_VMX_CR4_FIXED1: u32 = 0x489;
/// MSR - IA32_VMX_PROCBASED_CTLS2.
pub const IA32_VMX_PROCBASED_CTLS2: u32 = 0x48B;
/// MSR - IA32_VMX_TRUE_PINBASED_CTLS.
pub const IA32_VMX_TRUE_PINBASED_CTLS: u32 = 0x48D;
/// MSR - IA32_VMX_TRUE_PROCBASED_CTLS.
pub const IA32_VMX_TRUE_PROCBASED_CTLS: u32 = 0x48E;
/// MSR - IA32_VMX_TRUE_EXIT_CTLS.
pub const IA32_VMX_TRUE_EXIT_CTLS: u32 = 0x48F;
/// MSR - IA32_VMX_TRUE_ENTRY_CTLS.
pub const IA32_VMX_TRUE_ENTRY_CTLS: u32 = 0x490;

/// IA32_VMX_BASIC[55]: the TRUE capability MSRs are available.
pub const VMX_BASIC_TRUE_CONTROLS: u64 = 1 << 55;

/// Revision identifier to stamp into VMXON and VMCS regions.
#[inline]
pub const fn revision_id(vmx_basic: u64) -> u32 {
    (vmx_basic & 0x7fff_ffff) as u32
}

bitflags::bitflags! {
    /// Table 25-5. Definitions of Pin-Based VM-Execution Controls.
    pub struct VmcsPinBasedVmexecCtl: u32 {
        /// External interrupts cause VM exits.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// Non-maskable interrupts cause VM exits.
        const NMI_EXITING = 1 << 3;
        /// NMIs are never blocked.
        const VIRTUAL_NMIS = 1 << 5;
        /// The VMX-preemption timer counts down in VMX non-root operation.
        const ACTIVE_VMX_PREEMPTION_TIMER = 1 << 6;
        /// Posted-interrupt notification vectors are processed.
        const PROCESS_POSTED_INTERRUPT = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Table 25-6. Definitions of Primary Processor-Based VM-Execution Controls.
    pub struct VmcsProcBasedVmexecCtl: u32 {
        const INTRWINEXIT = 1 << 2;
        const USETSCOFF = 1 << 3;
        const HLT_EXITING = 1 << 7;
        const INVLPGEXIT = 1 << 9;
        const MWAITEXIT = 1 << 10;
        const RDPMCEXIT = 1 << 11;
        const RDTSCEXIT = 1 << 12;
        const CR3LOADEXIT = 1 << 15;
        const CR3STOREXIT = 1 << 16;
        const ACTIVETETCTL = 1 << 17;
        const CR8LOADEXIT = 1 << 19;
        const CR8STOREEXIT = 1 << 20;
        const USETPRSHADOW = 1 << 21;
        const NMIWINEXIT = 1 << 22;
        const MOVDREXIT = 1 << 23;
        const UNCONDIOEXIT = 1 << 24;
        const USEIOBMP = 1 << 25;
        const MTF = 1 << 27;
        /// MSR bitmaps decide which rdmsr and wrmsr cause VM exits.
        ///
        /// Without the bitmap every rdmsr and wrmsr exits.
        const USEMSRBMP = 1 << 28;
        const MONITOREXIT = 1 << 29;
        const PAUSEEXIT = 1 << 30;
        /// The secondary processor-based controls are used.
        const ACTIVATE_SECONDARY_CTL = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Table 25-7. Definitions of Secondary Processor-Based VM-Execution Controls.
    pub struct VmcsProcBasedSecondaryVmexecCtl: u32 {
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        const ENABLE_EPT = 1 << 1;
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        /// Without it, rdtscp raises #UD in the guest.
        const ENABLE_RDTSCP = 1 << 3;
        const VIRTUALIZED_X2APIC_MODE = 1 << 4;
        const ENABLE_VPID = 1 << 5;
        const WBINVD_EXITING = 1 << 6;
        const UNRESTRICTED_GUEST = 1 << 7;
        const APIC_REGISTER_VIRTUALIZATION = 1 << 8;
        const VIRTUAL_INTERRUPT_DELIVERY = 1 << 9;
        const PAUSE_LOOP_EXITING = 1 << 10;
        const RDRAND_EXITING = 1 << 11;
        /// Without it, invpcid raises #UD in the guest.
        const ENABLE_INVPCID = 1 << 12;
        const ENABLE_VM_FUNCTIONS = 1 << 13;
        const VMCS_SHADOWING = 1 << 14;
        const ENABLE_ENCLS_EXITING = 1 << 15;
        const RDSEED_EXITING = 1 << 16;
        const ENABLE_PML = 1 << 17;
        const EPT_VIOLATION_VE = 1 << 18;
        const CONCEAL_VMX_FROM_PT = 1 << 19;
        /// Without it, xsaves and xrstors raise #UD in the guest.
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
        const MODE_BASED_EXEC_CTL_FOR_EPT = 1 << 22;
        const SUBPAGE_WRITE_PERM_FOR_EPT = 1 << 23;
        const INTEL_PT_USES_GPA = 1 << 24;
        const USE_TSC_SCALING = 1 << 25;
        const ENABLE_UWAIT_PAUSE = 1 << 26;
        const ENABLE_PCONFIG = 1 << 27;
        const ENABLE_ENCLV_EXITING = 1 << 28;
    }
}

bitflags::bitflags! {
    /// Table 25-15. Definitions of VM-Entry Controls.
    pub struct VmcsEntryCtl: u32 {
        const LOAD_DEBUG_CTL = 1 << 2;
        /// The guest runs in IA-32e mode after VM entry.
        const IA32E_MODE_GUEST = 1 << 9;
        const ENTRY_TO_SMM = 1 << 10;
        const DEACTIVATE_DUAL_MONITOR_TREATMENT = 1 << 11;
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 13;
        const LOAD_IA32_PAT = 1 << 14;
        const LOAD_IA32_EFER = 1 << 15;
        const LOAD_IA32_BNDCFGS = 1 << 16;
        const CONCEAL_VMX_FROM_PT = 1 << 17;
        const LOAD_IA32_RTIT_CTL = 1 << 18;
        const LOAD_CET_STATE = 1 << 20;
        const LOAD_GUEST_IA32_LBR_CTL = 1 << 21;
        const LOAD_PKRS = 1 << 22;
    }
}

bitflags::bitflags! {
    /// Table 25-13. Definitions of VM-Exit Controls.
    pub struct VmcsExitCtl: u32 {
        const SAVE_DEBUG_CTLS = 1 << 2;
        /// The host runs in 64-bit mode after VM exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 12;
        const ACK_INTR_ON_EXIT = 1 << 15;
        const SAVE_IA32_PAT = 1 << 18;
        const LOAD_IA32_PAT = 1 << 19;
        const SAVE_IA32_EFER = 1 << 20;
        const LOAD_IA32_EFER = 1 << 21;
        const SAVE_VMX_PREEMPTION_TIMER_VALUE = 1 << 22;
        const CLEAR_IA32_BNDCFGS = 1 << 23;
        const CONCEAL_VMX_FROM_PT = 1 << 24;
        const CLEAR_IA32_RTIT_CTL = 1 << 25;
        const CLEAR_LBR_CTL = 1 << 26;
        const LOAD_CET_STATE = 1 << 28;
        const LOAD_PKRS = 1 << 29;
        const SAVE_IA32_PERF_GLOBAL_CTL = 1 << 30;
        const ACTIVATE_SECONDARY_CTL = 1 << 31;
    }
}

/// Kinds of VMX control fields.
///
/// The set is closed: a control value can only be adjusted for one of these.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlCategory {
    /// Pin-based VM-execution controls.
    PinBased,
    /// Primary processor-based VM-execution controls.
    ProcessorBased,
    /// Secondary processor-based VM-execution controls.
    SecondaryProcessorBased,
    /// VM-exit controls.
    VmExit,
    /// VM-entry controls.
    VmEntry,
}

impl ControlCategory {
    /// All categories.
    pub const ALL: [Self; 5] = [
        Self::PinBased,
        Self::ProcessorBased,
        Self::SecondaryProcessorBased,
        Self::VmExit,
        Self::VmEntry,
    ];

    /// Capability MSR reporting the allowed settings of this category.
    ///
    /// The secondary controls have no TRUE variant.
    pub const fn capability_msr(self, true_controls: bool) -> u32 {
        match (self, true_controls) {
            (Self::PinBased, false) => IA32_VMX_PINBASED_CTLS,
            (Self::PinBased, true) => IA32_VMX_TRUE_PINBASED_CTLS,
            (Self::ProcessorBased, false) => IA32_VMX_PROCBASED_CTLS,
            (Self::ProcessorBased, true) => IA32_VMX_TRUE_PROCBASED_CTLS,
            (Self::SecondaryProcessorBased, _) => IA32_VMX_PROCBASED_CTLS2,
            (Self::VmExit, false) => IA32_VMX_EXIT_CTLS,
            (Self::VmExit, true) => IA32_VMX_TRUE_EXIT_CTLS,
            (Self::VmEntry, false) => IA32_VMX_ENTRY_CTLS,
            (Self::VmEntry, true) => IA32_VMX_TRUE_ENTRY_CTLS,
        }
    }
}

/// Allowed settings of a control category as reported by its capability MSR.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Capability {
    /// Bits that must be 1.
    pub allowed0: u32,
    /// Bits that may be 1.
    pub allowed1: u32,
}

impl Capability {
    /// Split a capability MSR value.
    #[inline]
    pub const fn from_msr(v: u64) -> Self {
        Self {
            allowed0: v as u32,
            allowed1: (v >> 32) as u32,
        }
    }

    /// Force the mandatory bits on and the forbidden bits off.
    #[inline]
    pub const fn apply(self, requested: u32) -> u32 {
        (requested | self.allowed0) & self.allowed1
    }
}

/// Fixed bits of a control register as reported by its FIXED0/FIXED1 MSRs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FixedBits {
    /// Bits that must be 1.
    pub fixed0: u64,
    /// Bits that may be 1.
    pub fixed1: u64,
}

impl FixedBits {
    /// Force the mandatory bits on and the forbidden bits off.
    #[inline]
    pub const fn apply(self, value: u64) -> u64 {
        (value & self.fixed1) | self.fixed0
    }
}

/// Adjust `requested` so that the processor accepts it for `category`.
///
/// The TRUE capability MSR is consulted when IA32_VMX_BASIC advertises it.
pub fn adjust_control_value<C: Cpu + ?Sized>(
    cpu: &C,
    category: ControlCategory,
    requested: u32,
) -> Result<u32, VmError> {
    let basic = cpu.read_msr(IA32_VMX_BASIC)?;
    let msr = category.capability_msr(basic & VMX_BASIC_TRUE_CONTROLS != 0);
    Ok(Capability::from_msr(cpu.read_msr(msr)?).apply(requested))
}

/// Adjust a cr0 value for VMX operation.
pub fn adjust_cr0<C: Cpu + ?Sized>(cpu: &C, value: u64) -> Result<u64, VmError> {
    Ok(FixedBits {
        fixed0: cpu.read_msr(IA32_VMX_CR0_FIXED0)?,
        fixed1: cpu.read_msr(IA32_VMX_CR0_FIXED1)?,
    }
    .apply(value))
}

/// Adjust a cr4 value for VMX operation.
pub fn adjust_cr4<C: Cpu + ?Sized>(cpu: &C, value: u64) -> Result<u64, VmError> {
    Ok(FixedBits {
        fixed0: cpu.read_msr(IA32_VMX_CR4_FIXED0)?,
        fixed1: cpu.read_msr(IA32_VMX_CR4_FIXED1)?,
    }
    .apply(value))
}
