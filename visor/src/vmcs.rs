//! Virtual-Machine Control State (VMCS) related apis.
use crate::{cpu::Cpu, vm_control::*, VmError};
use abyss::{
    addressing::{Pa, PAGE_SIZE},
    x86_64::{segmentation::SegmentAccess, Cr0, Cr4},
};
use alloc::string::String;
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};
use num_enum::{FromPrimitive, TryFromPrimitive};

/// A 4KiB region handed to the processor by physical address.
///
/// The same layout serves as the VMXON region and as the VMCS.
///
/// ## Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, 25.2 FORMAT OF THE VMCS REGION.
#[repr(C, align(4096))]
pub struct VmxRegion {
    /// Bits 30:0: VMCS revision identifier
    /// Bit 31: shadow-VMCS indicator
    rev_id: u32,
    /// VMX-abort indicator
    indicator: u32,
    /// Implementation-specific data
    _data: [u8; PAGE_SIZE - 8],
}

impl VmxRegion {
    /// Zero the region and stamp it with the revision identifier.
    pub fn reset(&mut self, rev_id: u32) {
        self.rev_id = rev_id & 0x7fff_ffff;
        self.indicator = 0;
        self._data.fill(0);
    }

    /// Revision identifier written into the region.
    pub fn revision_id(&self) -> u32 {
        self.rev_id
    }

    /// Enter VMX operation with this region as the VMXON region.
    ///
    /// # Safety
    /// `pa` must be the physical address of `self` and CR4.VMXE must be set.
    pub unsafe fn on<C: Cpu + ?Sized>(&self, cpu: &C, pa: Pa) -> Result<(), VmError> {
        cpu.vmxon(pa)
    }

    /// Clear this VMCS.
    ///
    /// # Safety
    /// `pa` must be the physical address of `self`.
    pub unsafe fn clear<C: Cpu + ?Sized>(&self, cpu: &C, pa: Pa) -> Result<(), VmError> {
        cpu.vmclear(pa)
    }

    /// Make this VMCS as a working VMCS.
    ///
    /// # Safety
    /// `pa` must be the physical address of `self`, which was cleared on this core.
    pub unsafe fn activate<'a, C: Cpu + ?Sized>(
        &self,
        cpu: &'a C,
        pa: Pa,
    ) -> Result<ActiveVmcs<'a, C>, VmError> {
        cpu.vmptrld(pa)?;
        Ok(ActiveVmcs::new(cpu))
    }
}

/// Possible errors for vm-related instructions.
///
/// # Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Table 31-1. VM-Instruction Error Numbers.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, FromPrimitive)]
#[repr(u64)]
pub enum InstructionError {
    /// An error number missing from the table, or 0 when none is available.
    #[num_enum(catch_all)]
    Unknown(u64),
    /// VMCALL executed in VMX root operation
    VmcallInVmxRoot = 1,
    /// VMCLEAR with invalid physical address
    VmclearWithInvAddr = 2,
    /// VMCLEAR with VMXON pointer
    VmclearWithVmxon = 3,
    /// VMLAUNCH with non-clear VMCS
    VmlaunchWithNonclearVmcs = 4,
    /// VMRESUME with non-launched VMCS
    VmresumeWithNonlaunchedVmcs = 5,
    /// VMRESUME after VMXOFF
    VmresumeAfterVmxoff = 6,
    /// VM entry with invalid control field(s)
    InvalidControlField = 7,
    /// VM entry with invalid host-state field(s)
    InvalidHostState = 8,
    /// VMPTRLD with invalid physical address
    VmPtrLdWithInvAddr = 9,
    /// VMPTRLD with VMXON pointer
    VmPtrLdWithVmxOn = 10,
    /// VMPTRLD with incorrect VMCS revision identifier
    VmPtrLdWithIncorrectRevId = 11,
    /// VMREAD/VMWRITE from/to unsupported VMCS component
    UnsupportedVmcsField = 12,
    /// VMWRITE to read-only VMCS component
    WriteToRoField = 13,
    /// VMXON executed in VMX root operation
    VmxonInVmxRoot = 15,
    /// VM entry with invalid executive-VMCS pointer
    VmEntryWithInvalidExecVmcs = 16,
    /// VM entry with non-launched executive VMCS
    VmEntryWithNonlaunchedExecVmcs = 17,
    /// VM entry with executive-VMCS pointer not VMXON pointer
    VmEntryWithExecVmcs = 18,
    /// VMCALL with non-clear VMCS
    VmcallWithNonclearVmcs = 19,
    /// VMCALL with invalid VM-exit control fields
    VmcallWithInvVmexitCs = 20,
    /// VMCALL with incorrect MSEG revision identifier
    VmcallWithIncorrectMsegRevId = 22,
    /// VMXOFF under dual-monitor treatment of SMIs and SMM
    VmxoffUnderDualMonitorTreatment = 23,
    /// VMCALL with invalid SMM-monitor features
    VmcallWithInvSmmMonitor = 24,
    /// VM entry with invalid VM-execution control fields in executive VMCS
    VmentryWithInvVmExecCs = 25,
    /// VM entry with events blocked by MOV SS.
    VmentryWithEventBlockedByMovss = 26,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidOperandToInveptInvvpid = 28,
}

impl InstructionError {
    /// The hardware error number.
    pub fn code(self) -> u64 {
        match self {
            Self::Unknown(code) => code,
            // SAFETY: `repr(u64)` stores the discriminant in the first word.
            _ => unsafe { *(&self as *const Self).cast::<u64>() },
        }
    }
}

/// Vmcs field.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Field {
    GuestEsSelector = 0x00000800,
    GuestCsSelector = 0x00000802,
    GuestSsSelector = 0x00000804,
    GuestDsSelector = 0x00000806,
    GuestFsSelector = 0x00000808,
    GuestGsSelector = 0x0000080A,
    GuestLdtrSelector = 0x0000080C,
    GuestTrSelector = 0x0000080E,
    HostEsSelector = 0x00000C00,
    HostCsSelector = 0x00000C02,
    HostSsSelector = 0x00000C04,
    HostDsSelector = 0x00000C06,
    HostFsSelector = 0x00000C08,
    HostGsSelector = 0x00000C0A,
    HostTrSelector = 0x00000C0C,

    MsrBitmaps = 0x00002004,
    GuestLinkPointer = 0x00002800,
    GuestIa32Debugctl = 0x00002802,
    GuestIa32Efer = 0x00002806,

    PinBasedExecControls = 0x00004000,
    ProcessorBasedVmexecControls = 0x00004002,
    ExceptionBitmap = 0x00004004,
    VmexitControls = 0x0000400C,
    VmentryControls = 0x00004012,
    SecondaryVmexecControls = 0x0000401E,
    InstructionError = 0x00004400,
    VmexitReason = 0x00004402,
    VmexitInterruptionInfo = 0x00004404,
    VmexitInstructionLength = 0x0000440C,
    VmexitInstructionInfo = 0x0000440E,
    GuestEsLimit = 0x00004800,
    GuestCsLimit = 0x00004802,
    GuestSsLimit = 0x00004804,
    GuestDsLimit = 0x00004806,
    GuestFsLimit = 0x00004808,
    GuestGsLimit = 0x0000480A,
    GuestLdtrLimit = 0x0000480C,
    GuestTrLimit = 0x0000480E,
    GuestGdtrLimit = 0x00004810,
    GuestIdtrLimit = 0x00004812,
    GuestEsAccessRights = 0x00004814,
    GuestCsAccessRights = 0x00004816,
    GuestSsAccessRights = 0x00004818,
    GuestDsAccessRights = 0x0000481A,
    GuestFsAccessRights = 0x0000481C,
    GuestGsAccessRights = 0x0000481E,
    GuestLdtrAccessRights = 0x00004820,
    GuestTrAccessRights = 0x00004822,
    GuestInterruptibilityState = 0x00004824,
    GuestActivityState = 0x00004826,
    GuestIa32SysenterCsMsr = 0x0000482A,
    HostIa32SysenterCsMsr = 0x00004C00,

    Cr0GuestHostMask = 0x00006000,
    Cr4GuestHostMask = 0x00006002,
    Cr0ReadShadow = 0x00006004,
    Cr4ReadShadow = 0x00006006,
    VmexitQualification = 0x00006400,
    GuestCr0 = 0x00006800,
    GuestCr3 = 0x00006802,
    GuestCr4 = 0x00006804,
    GuestEsBase = 0x00006806,
    GuestCsBase = 0x00006808,
    GuestSsBase = 0x0000680A,
    GuestDsBase = 0x0000680C,
    GuestFsBase = 0x0000680E,
    GuestGsBase = 0x00006810,
    GuestLdtrBase = 0x00006812,
    GuestTrBase = 0x00006814,
    GuestGdtrBase = 0x00006816,
    GuestIdtrBase = 0x00006818,
    GuestDr7 = 0x0000681A,
    GuestRsp = 0x0000681C,
    GuestRip = 0x0000681E,
    GuestRflags = 0x00006820,
    GuestIa32SysenterEspMsr = 0x00006824,
    GuestIa32SysenterEipMsr = 0x00006826,
    HostCr0 = 0x00006C00,
    HostCr3 = 0x00006C02,
    HostCr4 = 0x00006C04,
    HostFsBase = 0x00006C06,
    HostGsBase = 0x00006C08,
    HostTrBase = 0x00006C0A,
    HostGdtrBase = 0x00006C0C,
    HostIdtrBase = 0x00006C0E,
    HostIa32SysenterEspMsr = 0x00006C10,
    HostIa32SysenterEipMsr = 0x00006C12,
    HostRsp = 0x00006C14,
    HostRip = 0x00006C16,
}

/// A representation of the VMCS that is current on this core.
///
/// Only obtainable by loading a region ([`VmxRegion::activate`]) or from
/// within a VM exit, where the exiting VMCS is current by construction.
pub struct ActiveVmcs<'a, C: Cpu + ?Sized> {
    cpu: &'a C,
}

impl<'a, C: Cpu + ?Sized> ActiveVmcs<'a, C> {
    pub(crate) fn new(cpu: &'a C) -> Self {
        Self { cpu }
    }

    /// The processor this VMCS is current on.
    pub fn cpu(&self) -> &'a C {
        self.cpu
    }

    /// Write to the vmcs field of the activated vmcs.
    #[inline]
    pub fn write(&self, field: Field, v: u64) -> Result<(), VmError> {
        self.cpu.vmwrite(field, v)
    }

    /// Read from the vmcs field of the activated vmcs.
    #[inline]
    pub fn read(&self, field: Field) -> Result<u64, VmError> {
        self.cpu.vmread(field)
    }

    /// Error number of the last failed VMX instruction.
    pub fn instruction_error(&self) -> InstructionError {
        self.read(Field::InstructionError)
            .map(InstructionError::from)
            .unwrap_or(InstructionError::Unknown(0))
    }

    /// Resolve the exit reason of the activated vmcs.
    pub fn exit_reason(&self) -> Result<ExitReason, VmError> {
        self.read(Field::VmexitReason)
            .map(|raw| ExitReason::from_raw(raw as u32))
    }

    /// Decode the guest instruction at `rip` into intel syntax.
    pub fn disassemble(&self, rip: u64) -> Option<String> {
        let mut bytes = [0u8; 15];
        let len = self.cpu.fetch_guest_code(rip, &mut bytes);
        disassemble(&bytes[..len], rip)
    }

    /// Dump the guest state of the activated vmcs.
    pub fn dump(&self) {
        let read = |f| self.read(f).unwrap_or(0);
        let proc_ctl1 = VmcsProcBasedVmexecCtl::from_bits_truncate(
            read(Field::ProcessorBasedVmexecControls) as u32,
        );
        let proc_ctl2 = VmcsProcBasedSecondaryVmexecCtl::from_bits_truncate(
            read(Field::SecondaryVmexecControls) as u32,
        );
        println!("Proc-based vm-exec control: {:?}", proc_ctl1);
        println!("Proc-based vm-exec control2: {:?}", proc_ctl2);
        println!(
            "RIP: {:x}, RSP: {:x}, RFLAGS: {:x}",
            read(Field::GuestRip),
            read(Field::GuestRsp),
            read(Field::GuestRflags)
        );
        println!(
            "cr0: {:?} cr3: {:x} cr4: {:?}",
            Cr0::from_bits_truncate(read(Field::GuestCr0)),
            read(Field::GuestCr3),
            Cr4::from_bits_truncate(read(Field::GuestCr4))
        );
        for (name, sel, base, limit, rights) in [
            ("CS", Field::GuestCsSelector, Field::GuestCsBase, Field::GuestCsLimit, Field::GuestCsAccessRights),
            ("SS", Field::GuestSsSelector, Field::GuestSsBase, Field::GuestSsLimit, Field::GuestSsAccessRights),
            ("DS", Field::GuestDsSelector, Field::GuestDsBase, Field::GuestDsLimit, Field::GuestDsAccessRights),
            ("ES", Field::GuestEsSelector, Field::GuestEsBase, Field::GuestEsLimit, Field::GuestEsAccessRights),
            ("FS", Field::GuestFsSelector, Field::GuestFsBase, Field::GuestFsLimit, Field::GuestFsAccessRights),
            ("GS", Field::GuestGsSelector, Field::GuestGsBase, Field::GuestGsLimit, Field::GuestGsAccessRights),
            ("TR", Field::GuestTrSelector, Field::GuestTrBase, Field::GuestTrLimit, Field::GuestTrAccessRights),
        ] {
            println!(
                "{}: sel: {:x}, base: {:x}, limit: {:x}, right: {:?}",
                name,
                read(sel),
                read(base),
                read(limit),
                SegmentAccess::from_bits_truncate(read(rights) << 40)
            );
        }
    }
}

/// Decode the first instruction of `bytes` as if it were located at `rip`.
pub fn disassemble(bytes: &[u8], rip: u64) -> Option<String> {
    let mut decoder = Decoder::with_ip(64, bytes, rip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let mut insn = Instruction::default();
    decoder.decode_out(&mut insn);
    if insn.is_invalid() {
        return None;
    }
    let mut out = String::new();
    IntelFormatter::new().format(&insn, &mut out);
    Some(out)
}

/// Basic exit reasons.
///
/// # Details
/// See Intel® 64 and IA-32 Architectures Software Developer’s Manual, Appendix C VMX BASIC EXIT REASONS.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u16)]
pub enum BasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSmi = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    MovCr = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EntfailGuestState = 33,
    EntfailMsrLoading = 34,
    Mwait = 36,
    Mtf = 37,
    Monitor = 39,
    Pause = 40,
    EntfailMachineChk = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    AccessGdtrOrIdtr = 46,
    AccessLdtrOrTr = 47,
    EptViolation = 48,
    EptMisconfig = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptTimer = 52,
    Invvpid = 53,
    Wbinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PmlFull = 62,
    Xsaves = 63,
    Xrstors = 64,
    Pconfig = 65,
    SppEvent = 66,
    Umwait = 67,
    Tpause = 68,
    Loadiwkey = 69,
}

impl BasicExitReason {
    /// One past the largest basic exit reason number.
    pub const COUNT: usize = 70;

    /// The basic exit reason number.
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Enumeration of vmexit reasons.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExitReason {
    /// Exit during the run.
    BasicExitReason(BasicExitReason),
    /// Failed on vmlaunch or vmresume.
    EntryFailure(BasicExitReason),
    /// Exit from vmx root operation.
    ExitFromVmxRootOperation(BasicExitReason),
    /// A reason number this hypervisor does not know.
    Unknown(u32),
}

impl ExitReason {
    /// Decode the exit-reason field.
    pub fn from_raw(raw: u32) -> Self {
        match BasicExitReason::try_from_primitive(raw as u16) {
            Ok(basic) if raw & (1 << 31) != 0 => Self::EntryFailure(basic),
            Ok(basic) if raw & (1 << 29) != 0 => Self::ExitFromVmxRootOperation(basic),
            Ok(basic) => Self::BasicExitReason(basic),
            Err(_) => Self::Unknown(raw),
        }
    }

    /// get basic exit reason of the exit reason.
    pub fn get_basic_reason(&self) -> Option<BasicExitReason> {
        match self {
            Self::BasicExitReason(e) | Self::EntryFailure(e) | Self::ExitFromVmxRootOperation(e) => {
                Some(*e)
            }
            Self::Unknown(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_decoding() {
        assert_eq!(
            ExitReason::from_raw(10),
            ExitReason::BasicExitReason(BasicExitReason::Cpuid)
        );
        assert_eq!(
            ExitReason::from_raw(0x8000_0021),
            ExitReason::EntryFailure(BasicExitReason::EntfailGuestState)
        );
        assert_eq!(ExitReason::from_raw(35), ExitReason::Unknown(35));
        assert_eq!(ExitReason::from_raw(35).get_basic_reason(), None);
        assert_eq!(
            ExitReason::from_raw(0x20).get_basic_reason(),
            Some(BasicExitReason::Wrmsr)
        );
    }

    #[test]
    fn instruction_error_numbers() {
        assert_eq!(InstructionError::from(7u64), InstructionError::InvalidControlField);
        assert_eq!(InstructionError::from(14u64), InstructionError::Unknown(14));
        assert_eq!(InstructionError::from(29u64).code(), 29);
        assert_eq!(InstructionError::from(0u64).code(), 0);
        assert_eq!(InstructionError::VmxonInVmxRoot.code(), 15);
        assert_eq!(InstructionError::InvalidOperandToInveptInvvpid.code(), 28);
    }

    #[test]
    fn region_layout() {
        assert_eq!(core::mem::size_of::<VmxRegion>(), PAGE_SIZE);
        assert_eq!(core::mem::align_of::<VmxRegion>(), PAGE_SIZE);
    }

    #[test]
    fn disassembles_cpuid() {
        assert_eq!(disassemble(&[0x0f, 0xa2], 0x1000).as_deref(), Some("cpuid"));
        assert_eq!(disassemble(&[], 0x1000), None);
    }
}
