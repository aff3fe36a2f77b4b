//! Bringing every logical processor under the hypervisor.
//!
//! [`Hypervisor::virtualize`] runs in three passes over the processors:
//! allocate every context up front, enter VMX operation and configure the
//! VMCS on each core, and finally launch each core. A core is only launched
//! once every core has been configured, so a failure never leaves a partially
//! virtualized system running.
use crate::{
    cpu::{Cpu, ExceptionGuard, NativeCpu},
    vcpu::{LogicalProcessor, ProcessorState},
    vm_control::{adjust_cr0, adjust_cr4},
    vmcs::BasicExitReason,
    vmexit::{cpuid::FEATURE_VMX, ExitFilter, VmexitController},
    VmError,
};
use abyss::{
    addressing::{Pa, Va, PAGE_SIZE},
    x86_64::{
        msr::{FeatureControl, IA32_FEATURE_CONTROL},
        Cr4,
    },
};
use alloc::vec::Vec;
use core::{alloc::Layout, ptr::NonNull};

/// Host stack size per logical processor when none is configured.
pub const DEFAULT_HOST_STACK_SIZE: usize = 0x6000;

/// Services of the operating system the hypervisor is loaded into.
pub trait Platform {
    /// Number of logical processors.
    fn processor_count(&self) -> usize;
    /// Allocate zeroed, physically contiguous memory below the platform's
    /// physical address ceiling.
    fn allocate_contiguous(&self, layout: Layout) -> Option<NonNull<u8>>;
    /// Free memory returned by [`Platform::allocate_contiguous`].
    ///
    /// # Safety
    /// `ptr` must come from `allocate_contiguous` with the same `layout`.
    unsafe fn free_contiguous(&self, ptr: NonNull<u8>, layout: Layout);
    /// Physical address backing `va`.
    fn virt_to_phys(&self, va: Va) -> Pa;
    /// Move the current thread onto logical processor `index`.
    fn set_affinity(&self, index: usize);
    /// Undo [`Platform::set_affinity`].
    fn revert_affinity(&self);
    /// Run `f`, reporting a processor exception raised inside it as `Err(())`.
    ///
    /// Backed by the driver's exception fixup. Called on any core, also while
    /// handling a VM exit.
    fn guarded(f: &mut dyn FnMut()) -> Result<(), ()>
    where
        Self: Sized;
}

/// Keeps the current thread on one logical processor until dropped.
struct Pinned<'a, P: Platform + ?Sized>(&'a P);

impl<'a, P: Platform + ?Sized> Pinned<'a, P> {
    fn new(platform: &'a P, index: usize) -> Self {
        platform.set_affinity(index);
        Self(platform)
    }
}

impl<P: Platform + ?Sized> Drop for Pinned<'_, P> {
    fn drop(&mut self) {
        self.0.revert_affinity();
    }
}

/// The MSR bitmap shared by every VMCS.
///
/// All zero: no MSR access causes a VM exit.
#[repr(C, align(4096))]
pub struct MsrBitmap([u8; PAGE_SIZE]);

/// State shared by all logical processors.
///
/// Written before any core launches, read-only afterwards.
#[repr(C)]
pub struct GlobalState {
    msr_bitmap: MsrBitmap,
    exit_filter: ExitFilter,
    hide_vmx: bool,
    controller: &'static dyn VmexitController,
    guard: ExceptionGuard,
}

impl GlobalState {
    /// Create a new global state with an empty exit filter.
    pub fn new(
        hide_vmx: bool,
        controller: &'static dyn VmexitController,
        guard: ExceptionGuard,
    ) -> Self {
        Self {
            msr_bitmap: MsrBitmap([0; PAGE_SIZE]),
            exit_filter: ExitFilter::empty(),
            hide_vmx,
            controller,
            guard,
        }
    }

    /// The MSR bitmap.
    pub fn msr_bitmap(&self) -> &MsrBitmap {
        &self.msr_bitmap
    }

    /// Exit reasons offered to the controller.
    pub fn exit_filter(&self) -> &ExitFilter {
        &self.exit_filter
    }

    /// Whether `cpuid` hides VMX from the guest.
    pub fn hide_vmx(&self) -> bool {
        self.hide_vmx
    }

    /// The installed controller.
    pub fn controller(&self) -> &'static dyn VmexitController {
        self.controller
    }

    /// The platform's exception guard, for primitives run in VM-exit context.
    pub fn exception_guard(&self) -> ExceptionGuard {
        self.guard
    }

    pub(crate) fn set_exit_filter(&mut self, filter: ExitFilter) {
        self.exit_filter = filter;
    }
}

struct Config {
    hide_vmx: bool,
    host_stack_size: usize,
    intercepts: ExitFilter,
    controller: &'static dyn VmexitController,
}

/// Builder for a [`Hypervisor`].
pub struct HypervisorBuilder<P: Platform, C: Cpu = NativeCpu> {
    platform: P,
    cpu: C,
    config: Config,
}

impl<P: Platform> HypervisorBuilder<P> {
    /// Start building a hypervisor for `platform` running on the real processor.
    pub fn new(platform: P) -> Self {
        let mut intercepts = ExitFilter::empty();
        intercepts
            .enable(BasicExitReason::Cpuid)
            .enable(BasicExitReason::MovCr)
            .enable(BasicExitReason::AccessGdtrOrIdtr);
        Self {
            platform,
            cpu: NativeCpu::new(P::guarded),
            config: Config {
                hide_vmx: true,
                host_stack_size: DEFAULT_HOST_STACK_SIZE,
                intercepts,
                controller: &(),
            },
        }
    }
}

impl<P: Platform, C: Cpu> HypervisorBuilder<P, C> {
    /// Drive a different processor implementation.
    pub fn cpu<C2: Cpu>(self, cpu: C2) -> HypervisorBuilder<P, C2> {
        HypervisorBuilder {
            platform: self.platform,
            cpu,
            config: self.config,
        }
    }

    /// Whether `cpuid` hides VMX from the guest. On by default.
    pub fn hide_vmx(mut self, hide: bool) -> Self {
        self.config.hide_vmx = hide;
        self
    }

    /// Host stack size per logical processor, rounded up to whole pages.
    pub fn host_stack_size(mut self, bytes: usize) -> Self {
        // An unrepresentable size is rejected when the stacks are allocated.
        self.config.host_stack_size = bytes
            .max(1)
            .checked_add(PAGE_SIZE - 1)
            .map_or(usize::MAX, |b| b & !(PAGE_SIZE - 1));
        self
    }

    /// Offer exits of `reason` to the controller first.
    pub fn intercept(mut self, reason: BasicExitReason) -> Self {
        self.config.intercepts.enable(reason);
        self
    }

    /// Install `controller`.
    pub fn controller(mut self, controller: &'static dyn VmexitController) -> Self {
        self.config.controller = controller;
        self
    }

    /// Finish building.
    pub fn build(self) -> Hypervisor<P, C> {
        Hypervisor {
            platform: self.platform,
            cpu: self.cpu,
            config: self.config,
            global: None,
            processors: Vec::new(),
            virtualized: false,
        }
    }
}

/// The hypervisor of this system.
pub struct Hypervisor<P: Platform, C: Cpu = NativeCpu> {
    platform: P,
    cpu: C,
    config: Config,
    global: Option<NonNull<GlobalState>>,
    processors: Vec<(NonNull<LogicalProcessor>, NonNull<u8>)>,
    virtualized: bool,
}

impl<P: Platform, C: Cpu> Hypervisor<P, C> {
    /// Whether the processor reports VMX support.
    pub fn is_supported(&self) -> bool {
        self.cpu.cpuid(1, 0).ecx & FEATURE_VMX != 0
    }

    /// Whether every core runs as a guest.
    pub fn is_virtualized(&self) -> bool {
        self.virtualized
    }

    /// The platform.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Context of logical processor `index`, once allocated.
    pub fn processor(&self, index: usize) -> Option<&LogicalProcessor> {
        self.processors
            .get(index)
            // SAFETY: contexts are initialized on allocation and never freed
            // while `self.processors` holds them.
            .map(|(lp, _)| unsafe { lp.as_ref() })
    }

    /// Make VMX usable on the current core.
    ///
    /// Enables VMX in IA32_FEATURE_CONTROL unless the firmware locked it, and
    /// commits CR0 and CR4 values adjusted for VMX operation.
    pub fn enable(&self) -> Result<(), VmError> {
        let cpu = &self.cpu;
        if !self.is_supported() {
            return Err(VmError::UnsupportedExtension);
        }

        let enabled = FeatureControl::VMX_INSIDE_SMX | FeatureControl::VMX_OUTSIDE_SMX;
        let fc = FeatureControl::from_bits_truncate(cpu.read_msr(IA32_FEATURE_CONTROL as u32)?);
        if !fc.contains(FeatureControl::LOCK) {
            cpu.write_msr(
                IA32_FEATURE_CONTROL as u32,
                (fc | FeatureControl::LOCK | enabled).bits(),
            )?;
        } else if !fc.intersects(enabled) {
            return Err(VmError::FeatureLocked);
        }

        let cr0 = adjust_cr0(cpu, cpu.read_cr0())?;
        let cr4 = adjust_cr4(cpu, cpu.read_cr4() | Cr4::VMXE.bits())?;
        unsafe {
            cpu.write_cr0(cr0);
            cpu.write_cr4(cr4);
        }
        Ok(())
    }

    /// Virtualize every logical processor.
    ///
    /// Returns in guest mode on success. Once any core entered VMX operation,
    /// the contexts are never freed.
    pub fn virtualize(&mut self) -> Result<(), VmError> {
        if self.virtualized {
            warning!("The system is already virtualized");
            return Ok(());
        }
        if !self.is_supported() {
            return Err(VmError::UnsupportedExtension);
        }

        let count = self.platform.processor_count();
        if let Err(e) = self.allocate(count) {
            self.release();
            return Err(e);
        }

        let mut entered = 0;
        let result = (0..count).try_for_each(|index| {
            let _pinned = Pinned::new(&self.platform, index);
            // SAFETY: allocated and initialized above, and only touched from
            // the core it belongs to.
            let lp = unsafe { &mut *self.processors[index].0.as_ptr() };
            self.enable()
                .and_then(|_| lp.start_vmx(&self.cpu, &self.platform))
                .and_then(|_| {
                    entered += 1;
                    lp.configure_vmcs(&self.cpu, &self.platform)
                })
                .map_err(|e| {
                    error!("Failed to prepare logical processor {}: {}", index, e);
                    e
                })
        });
        if let Err(e) = result {
            if entered == 0 {
                self.release();
            } else {
                warning!("{} logical processors remain in VMX operation", entered);
            }
            return Err(e);
        }

        if let Some(mut global) = self.global {
            // SAFETY: no core runs the guest yet, so nobody reads it.
            unsafe { global.as_mut() }.set_exit_filter(self.config.intercepts);
        }

        for index in 0..count {
            let _pinned = Pinned::new(&self.platform, index);
            // SAFETY: configured above, and the VMCS is current on this core.
            let lp = unsafe { &mut *self.processors[index].0.as_ptr() };
            if let Err(e) = unsafe { self.cpu.launch() } {
                error!("Failed to launch logical processor {}: {}", index, e);
                self.cpu.debug_break();
                return Err(e);
            }
            lp.set_state(ProcessorState::GuestRunning);
            info!("Logical processor {} virtualized", index);
        }
        self.virtualized = true;
        Ok(())
    }

    fn layouts(&self) -> Result<(Layout, Layout, Layout), VmError> {
        let stack = Layout::from_size_align(self.config.host_stack_size, PAGE_SIZE)
            .map_err(|_| VmError::AllocationFailure("host stack"))?;
        Ok((Layout::new::<GlobalState>(), Layout::new::<LogicalProcessor>(), stack))
    }

    fn allocate(&mut self, count: usize) -> Result<(), VmError> {
        let (global_layout, lp_layout, stack_layout) = self.layouts()?;
        let global = self
            .platform
            .allocate_contiguous(global_layout)
            .ok_or(VmError::AllocationFailure("global state"))?
            .cast::<GlobalState>();
        // SAFETY: freshly allocated for a GlobalState.
        unsafe {
            global
                .as_ptr()
                .write(GlobalState::new(
                    self.config.hide_vmx,
                    self.config.controller,
                    P::guarded,
                ))
        };
        self.global = Some(global);

        for index in 0..count {
            let lp = self
                .platform
                .allocate_contiguous(lp_layout)
                .ok_or(VmError::AllocationFailure("processor context"))?;
            let stack = match self.platform.allocate_contiguous(stack_layout) {
                Some(stack) => stack,
                None => {
                    unsafe { self.platform.free_contiguous(lp, lp_layout) };
                    return Err(VmError::AllocationFailure("host stack"));
                }
            };
            let lp = lp.cast::<LogicalProcessor>();
            // SAFETY: zeroed memory of the right layout, kept alive until
            // `release` or forever.
            unsafe {
                LogicalProcessor::init(lp, index, stack, self.config.host_stack_size, global)
            };
            self.processors.push((lp, stack));
        }
        Ok(())
    }

    fn release(&mut self) {
        let (global_layout, lp_layout, stack_layout) = match self.layouts() {
            Ok(layouts) => layouts,
            Err(_) => return,
        };
        for (lp, stack) in self.processors.drain(..) {
            unsafe {
                self.platform.free_contiguous(stack, stack_layout);
                self.platform.free_contiguous(lp.cast(), lp_layout);
            }
        }
        if let Some(global) = self.global.take() {
            unsafe {
                core::ptr::drop_in_place(global.as_ptr());
                self.platform.free_contiguous(global.cast(), global_layout);
            }
        }
    }
}
