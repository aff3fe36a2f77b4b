//! Simulated processor and platform for unit tests.
use crate::{
    cpu::Cpu,
    hypervisor::{GlobalState, Platform},
    vm_control::*,
    vmcs::Field,
    InstructionError, VmError,
};
use abyss::{
    addressing::{Pa, Va, PAGE_SIZE},
    x86_64::{
        intrinsics::CpuidResult,
        msr::{FeatureControl, IA32_FEATURE_CONTROL, IA32_GS_BASE},
        segmentation::{
            SegmentAccess, SegmentDescriptor, SegmentRegister, SegmentSelector, TYPE_TSS64_BUSY,
        },
        table::DescriptorTableRegister,
        PrivilegeLevel, Rflags,
    },
};
use std::{
    alloc::Layout,
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
    ptr::NonNull,
};

/// A processor that records VMX instructions instead of executing them.
pub struct MockCpu {
    msrs: RefCell<HashMap<u32, u64>>,
    failing_msrs: RefCell<HashSet<u32>>,
    cpuid: RefCell<HashMap<(u32, u32), CpuidResult>>,
    cr0: Cell<u64>,
    cr3: Cell<u64>,
    cr4: Cell<u64>,
    gdt: &'static [u64],
    access_rights: RefCell<HashMap<u16, u32>>,
    fields: RefCell<HashMap<Field, u64>>,
    failing_fields: RefCell<HashSet<Field>>,
    vmxon_calls: RefCell<Vec<Pa>>,
    vmxon_budget: Cell<Option<usize>>,
    vmcs_log: RefCell<Vec<(&'static str, Pa)>>,
    launches: Cell<usize>,
    fail_launch: Cell<bool>,
    debug_breaks: Cell<usize>,
    rip_writes: Cell<usize>,
}

impl MockCpu {
    pub const REVISION: u32 = 0x12;
    pub const TSS_BASE: u64 = 0xffff_f806_1d5a_0000;
    pub const KERNEL_CS: u16 = 0x10;
    pub const KERNEL_SS: u16 = 0x18;
    pub const USER_DS: u16 = 0x2b;
    pub const USER_FS: u16 = 0x53;
    pub const TR: u16 = 0x40;

    pub fn new() -> Self {
        let flat = |access: SegmentAccess, dpl| SegmentDescriptor::new(0, 0xfffff, access, dpl).pack();
        let data = SegmentAccess::P | SegmentAccess::S | SegmentAccess::WR | SegmentAccess::A;
        let code = data | SegmentAccess::CODE;
        let [tss_low, tss_high] =
            SegmentDescriptor::new_system(Self::TSS_BASE, 0x67, TYPE_TSS64_BUSY, PrivilegeLevel::Ring0);
        let gdt = vec![
            0,
            flat(code | SegmentAccess::D_B | SegmentAccess::G, PrivilegeLevel::Ring0),
            flat(code | SegmentAccess::L, PrivilegeLevel::Ring0),
            flat(data | SegmentAccess::D_B | SegmentAccess::G, PrivilegeLevel::Ring0),
            flat(code | SegmentAccess::D_B | SegmentAccess::G, PrivilegeLevel::Ring3),
            flat(data | SegmentAccess::D_B | SegmentAccess::G, PrivilegeLevel::Ring3),
            flat(code | SegmentAccess::L, PrivilegeLevel::Ring3),
            0,
            tss_low.pack(),
            tss_high.pack(),
            SegmentDescriptor::new(0x7ffd_e000, 0x3c00, data | SegmentAccess::D_B, PrivilegeLevel::Ring3)
                .pack(),
        ];

        let msrs = HashMap::from([
            (IA32_VMX_BASIC, Self::REVISION as u64 | VMX_BASIC_TRUE_CONTROLS),
            (IA32_VMX_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (IA32_VMX_PROCBASED_CTLS, 0xfff9_fffe_0401_e172),
            (IA32_VMX_EXIT_CTLS, 0x01ff_ffff_0003_6dff),
            (IA32_VMX_ENTRY_CTLS, 0x0003_ffff_0000_11ff),
            (IA32_VMX_PROCBASED_CTLS2, 0x0053_7fff_0000_0000),
            (IA32_VMX_TRUE_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (IA32_VMX_TRUE_PROCBASED_CTLS, 0xfff9_fffe_0400_6172),
            (IA32_VMX_TRUE_EXIT_CTLS, 0x01ff_ffff_0003_6dfb),
            (IA32_VMX_TRUE_ENTRY_CTLS, 0x0003_ffff_0000_11fb),
            (IA32_VMX_CR0_FIXED0, 0x8000_0021),
            (IA32_VMX_CR0_FIXED1, 0xffff_ffff),
            (IA32_VMX_CR4_FIXED0, 0x2000),
            (IA32_VMX_CR4_FIXED1, 0x003f_ffff),
            (
                IA32_FEATURE_CONTROL as u32,
                (FeatureControl::LOCK | FeatureControl::VMX_OUTSIDE_SMX).bits(),
            ),
            (IA32_GS_BASE as u32, 0xffff_f806_1b3e_6000),
        ]);

        let cpuid = HashMap::from([
            (
                (0, 0),
                CpuidResult {
                    eax: 0x16,
                    ebx: u32::from_le_bytes(*b"Genu"),
                    ecx: u32::from_le_bytes(*b"ntel"),
                    edx: u32::from_le_bytes(*b"ineI"),
                },
            ),
            (
                (1, 0),
                CpuidResult {
                    eax: 0x000a_0655,
                    ebx: 0x0010_0800,
                    ecx: 0x7ffa_fbff,
                    edx: 0xbfeb_fbff,
                },
            ),
        ]);

        Self {
            msrs: RefCell::new(msrs),
            failing_msrs: RefCell::default(),
            cpuid: RefCell::new(cpuid),
            cr0: Cell::new(0x8005_0033),
            cr3: Cell::new(0x001a_d000),
            cr4: Cell::new(0x0035_06f8),
            gdt: Box::leak(gdt.into_boxed_slice()),
            access_rights: RefCell::new(HashMap::from([
                (Self::KERNEL_CS, 0x0020_9b00),
                (Self::TR, 0x0000_8b00),
            ])),
            fields: RefCell::default(),
            failing_fields: RefCell::default(),
            vmxon_calls: RefCell::default(),
            vmxon_budget: Cell::new(None),
            vmcs_log: RefCell::default(),
            launches: Cell::new(0),
            fail_launch: Cell::new(false),
            debug_breaks: Cell::new(0),
            rip_writes: Cell::new(0),
        }
    }

    pub fn gdt(&self) -> &'static [u64] {
        self.gdt
    }

    pub fn set_msr(&self, index: u32, value: u64) {
        self.msrs.borrow_mut().insert(index, value);
    }

    pub fn msr(&self, index: u32) -> u64 {
        self.msrs.borrow().get(&index).copied().unwrap_or(0)
    }

    /// Accesses to `index` fault.
    pub fn fail_msr(&self, index: u32) {
        self.failing_msrs.borrow_mut().insert(index);
    }

    pub fn set_cpuid(&self, leaf: u32, sub_leaf: u32, r: CpuidResult) {
        self.cpuid.borrow_mut().insert((leaf, sub_leaf), r);
    }

    pub fn set_access_rights(&self, selector: u16, lar: u32) {
        self.access_rights.borrow_mut().insert(selector, lar);
    }

    pub fn set_field(&self, field: Field, value: u64) {
        self.fields.borrow_mut().insert(field, value);
    }

    pub fn field(&self, field: Field) -> u64 {
        self.fields.borrow().get(&field).copied().unwrap_or(0)
    }

    pub fn has_field(&self, field: Field) -> bool {
        self.fields.borrow().contains_key(&field)
    }

    pub fn fail_vmwrite(&self, field: Field) {
        self.failing_fields.borrow_mut().insert(field);
    }

    /// Every vmxon attempt, failed ones included.
    pub fn vmxon_calls(&self) -> Vec<Pa> {
        self.vmxon_calls.borrow().clone()
    }

    pub fn fail_vmxon(&self) {
        self.vmxon_budget.set(Some(0));
    }

    /// Let `n` vmxon succeed, then fail.
    pub fn fail_vmxon_after(&self, n: usize) {
        self.vmxon_budget.set(Some(n));
    }

    pub fn vmcs_log(&self) -> Vec<(&'static str, Pa)> {
        self.vmcs_log.borrow().clone()
    }

    pub fn launches(&self) -> usize {
        self.launches.get()
    }

    pub fn fail_launch(&self) {
        self.fail_launch.set(true);
    }

    pub fn debug_breaks(&self) -> usize {
        self.debug_breaks.get()
    }

    /// Number of writes to the guest rip field.
    pub fn rip_writes(&self) -> usize {
        self.rip_writes.get()
    }

    pub fn reset_counters(&self) {
        self.rip_writes.set(0);
        self.debug_breaks.set(0);
    }
}

impl Cpu for MockCpu {
    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuidResult {
        self.cpuid
            .borrow()
            .get(&(leaf, sub_leaf))
            .copied()
            .unwrap_or_default()
    }

    fn read_msr(&self, index: u32) -> Result<u64, VmError> {
        if self.failing_msrs.borrow().contains(&index) {
            return Err(VmError::HardwareException("rdmsr"));
        }
        Ok(self.msr(index))
    }

    fn write_msr(&self, index: u32, value: u64) -> Result<(), VmError> {
        if self.failing_msrs.borrow().contains(&index) {
            return Err(VmError::HardwareException("wrmsr"));
        }
        self.set_msr(index, value);
        Ok(())
    }

    fn read_cr0(&self) -> u64 {
        self.cr0.get()
    }

    fn read_cr3(&self) -> u64 {
        self.cr3.get()
    }

    fn read_cr4(&self) -> u64 {
        self.cr4.get()
    }

    unsafe fn write_cr0(&self, value: u64) {
        self.cr0.set(value)
    }

    unsafe fn write_cr4(&self, value: u64) {
        self.cr4.set(value)
    }

    fn read_rflags(&self) -> Rflags {
        Rflags::from_bits_truncate(0x246)
    }

    fn read_gdtr(&self) -> DescriptorTableRegister {
        DescriptorTableRegister {
            limit: (self.gdt.len() * 8 - 1) as u16,
            base: self.gdt.as_ptr() as u64,
        }
    }

    fn read_idtr(&self) -> DescriptorTableRegister {
        DescriptorTableRegister {
            limit: 0xfff,
            base: 0xffff_f806_1d5a_1000,
        }
    }

    fn read_selector(&self, reg: SegmentRegister) -> SegmentSelector {
        SegmentSelector::from_raw(match reg {
            SegmentRegister::Cs => Self::KERNEL_CS,
            SegmentRegister::Ss => Self::KERNEL_SS,
            SegmentRegister::Ds | SegmentRegister::Es | SegmentRegister::Gs => Self::USER_DS,
            SegmentRegister::Fs => Self::USER_FS,
            SegmentRegister::Ldtr => 0,
            SegmentRegister::Tr => Self::TR,
        })
    }

    fn segment_limit(&self, selector: SegmentSelector) -> u32 {
        match selector.pack() {
            0..=3 => 0,
            Self::TR => 0x67,
            Self::USER_FS => 0x3c00,
            _ => 0xffff_ffff,
        }
    }

    fn access_rights(&self, selector: SegmentSelector) -> Option<u32> {
        Some(
            self.access_rights
                .borrow()
                .get(&selector.pack())
                .copied()
                .unwrap_or(0x00cf_9300),
        )
    }

    unsafe fn vmxon(&self, region: Pa) -> Result<(), VmError> {
        self.vmxon_calls.borrow_mut().push(region);
        match self.vmxon_budget.get() {
            Some(0) => Err(VmError::VmxOperationError("vmxon", InstructionError::Unknown(0))),
            Some(n) => {
                self.vmxon_budget.set(Some(n - 1));
                Ok(())
            }
            None => Ok(()),
        }
    }

    unsafe fn vmxoff(&self) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn vmclear(&self, vmcs: Pa) -> Result<(), VmError> {
        self.vmcs_log.borrow_mut().push(("vmclear", vmcs));
        Ok(())
    }

    unsafe fn vmptrld(&self, vmcs: Pa) -> Result<(), VmError> {
        self.vmcs_log.borrow_mut().push(("vmptrld", vmcs));
        Ok(())
    }

    fn vmread(&self, field: Field) -> Result<u64, VmError> {
        Ok(self.field(field))
    }

    fn vmwrite(&self, field: Field, value: u64) -> Result<(), VmError> {
        if self.failing_fields.borrow().contains(&field) {
            return Err(VmError::VmxOperationError(
                "vmwrite",
                InstructionError::UnsupportedVmcsField,
            ));
        }
        if field == Field::GuestRip {
            self.rip_writes.set(self.rip_writes.get() + 1);
        }
        self.set_field(field, value);
        Ok(())
    }

    unsafe fn launch(&self) -> Result<(), VmError> {
        if self.fail_launch.get() {
            return Err(VmError::VmxOperationError(
                "vmlaunch",
                InstructionError::InvalidControlField,
            ));
        }
        self.launches.set(self.launches.get() + 1);
        Ok(())
    }

    fn fetch_guest_code(&self, _rip: u64, _buf: &mut [u8]) -> usize {
        0
    }

    fn debug_break(&self) {
        self.debug_breaks.set(self.debug_breaks.get() + 1);
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new(true, &(), MockPlatform::guarded)
    }
}

thread_local! {
    static GUARD_FAULTS: Cell<bool> = Cell::new(false);
    static GUARDED_CALLS: Cell<usize> = Cell::new(0);
}

/// A platform backed by the test process' heap, with identity translation.
pub struct MockPlatform {
    cores: usize,
    budget: Cell<Option<usize>>,
    allocations: Cell<usize>,
    frees: Cell<usize>,
    affinity_log: RefCell<Vec<usize>>,
    pinned: Cell<Option<usize>>,
}

impl MockPlatform {
    pub fn new(cores: usize) -> Self {
        Self {
            cores,
            budget: Cell::new(None),
            allocations: Cell::new(0),
            frees: Cell::new(0),
            affinity_log: RefCell::default(),
            pinned: Cell::new(None),
        }
    }

    /// Let `n` allocations succeed, then fail.
    pub fn fail_after(&self, n: usize) {
        self.budget.set(Some(n));
    }

    pub fn allocations(&self) -> usize {
        self.allocations.get()
    }

    /// Allocations not freed yet.
    pub fn outstanding(&self) -> usize {
        self.allocations.get() - self.frees.get()
    }

    pub fn affinity_log(&self) -> Vec<usize> {
        self.affinity_log.borrow().clone()
    }

    pub fn pinned(&self) -> Option<usize> {
        self.pinned.get()
    }

    /// Guarded calls on this thread report a fault without running.
    pub fn fault_guarded_calls(fault: bool) {
        GUARD_FAULTS.with(|f| f.set(fault));
    }

    /// Guarded calls made on this thread.
    pub fn guarded_calls() -> usize {
        GUARDED_CALLS.with(Cell::get)
    }

    pub fn alloc_zeroed<T>(&self) -> NonNull<T> {
        self.allocate_contiguous(Layout::new::<T>())
            .expect("out of test memory")
            .cast()
    }

    pub fn alloc_stack(&self, size: usize) -> NonNull<u8> {
        self.allocate_contiguous(Layout::from_size_align(size, PAGE_SIZE).unwrap())
            .expect("out of test memory")
    }

    pub fn alloc_global(&self, global: GlobalState) -> NonNull<GlobalState> {
        let ptr = self.alloc_zeroed::<GlobalState>();
        unsafe { ptr.as_ptr().write(global) };
        ptr
    }
}

impl Platform for MockPlatform {
    fn processor_count(&self) -> usize {
        self.cores
    }

    fn allocate_contiguous(&self, layout: Layout) -> Option<NonNull<u8>> {
        match self.budget.get() {
            Some(0) => return None,
            Some(n) => self.budget.set(Some(n - 1)),
            None => (),
        }
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
        self.allocations.set(self.allocations.get() + 1);
        Some(ptr)
    }

    unsafe fn free_contiguous(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
        self.frees.set(self.frees.get() + 1);
    }

    fn virt_to_phys(&self, va: Va) -> Pa {
        Pa::new(va.into_usize()).unwrap_or(Pa::ZERO)
    }

    fn set_affinity(&self, index: usize) {
        assert!(index < self.cores);
        self.affinity_log.borrow_mut().push(index);
        self.pinned.set(Some(index));
    }

    fn revert_affinity(&self) {
        self.pinned.set(None);
    }

    fn guarded(f: &mut dyn FnMut()) -> Result<(), ()> {
        GUARDED_CALLS.with(|c| c.set(c.get() + 1));
        if GUARD_FAULTS.with(Cell::get) {
            return Err(());
        }
        f();
        Ok(())
    }
}
