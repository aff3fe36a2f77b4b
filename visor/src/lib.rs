//! # Visor: a thin VMX hypervisor that virtualizes the running system.
//!
//! Visor takes the operating system that is already executing and slides it
//! into VMX non-root operation, core by core. After the transition the guest is
//! the very same system, resumed from the exact point where the host state was
//! captured. The hypervisor keeps nothing for itself except a small host stack
//! per core and the handlers that run on every VM exit.
//!
//! ## Overview
//! Bringing a core under the hypervisor takes four steps:
//!
//! 1. **Enable.** Check that the processor reports VMX through `cpuid`, that
//!    `IA32_FEATURE_CONTROL` allows `vmxon`, and commit CR0 and CR4 values that
//!    satisfy the fixed-bit capability MSRs ([`vm_control::adjust_cr0`],
//!    [`vm_control::adjust_cr4`]).
//! 2. **Bring-up.** Stamp the VMXON region with the revision identifier and
//!    execute `vmxon` ([`vcpu::LogicalProcessor::start_vmx`]).
//! 3. **Configure.** Clear and load the VMCS, then populate the guest-state
//!    area with a snapshot of the live system, the host-state area with the
//!    hypervisor's own context, and the execution controls adjusted against the
//!    capability MSRs ([`vcpu::LogicalProcessor::configure_vmcs`]).
//! 4. **Launch.** Once every core is configured, execute `vmlaunch` once per
//!    core. The calling thread simply keeps running, now as guest code.
//!
//! [`Hypervisor`] orchestrates these steps on every logical processor. The
//! embedding driver provides memory, address translation, and core pinning
//! through the [`Platform`] trait.
//!
//! ## VM exits
//! Every VM exit lands on a small assembly trampoline that saves the guest
//! registers into a [`GuestRegisters`] frame and calls the dispatcher
//! ([`vmexit::dispatch`]). `cpuid`, `rdmsr` and `wrmsr` are emulated. Every
//! other exit reason is treated as a bug: it is reported with the guest RIP,
//! the processor breaks into the debugger, and the core is parked.
//!
//! ## Privileged primitives
//! All instructions that need ring 0 or VMX root operation go through the
//! [`Cpu`] trait. [`NativeCpu`] executes them for real. VMX instructions report
//! failure through a [`Result`]. Model specific register accesses run under
//! the exception guard of the [`Platform`], so an access the processor rejects
//! becomes [`VmError::HardwareException`] instead of a fault.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate abyss;

pub mod cpu;
pub mod hypervisor;
pub mod segment;
pub mod vcpu;
pub mod vm_control;
pub mod vmcs;
pub mod vmexit;

#[cfg(test)]
mod mock;

use alloc::boxed::Box;

pub use cpu::{Cpu, NativeCpu};
pub use hypervisor::{GlobalState, Hypervisor, HypervisorBuilder, Platform};
pub use vmcs::{BasicExitReason, ExitReason, InstructionError};
pub use vmexit::{GuestContext, GuestRegisters, VmexitController};

/// Possible errors of the hypervisor.
#[derive(Debug)]
pub enum VmError {
    /// Contiguous memory for the named structure is not available.
    AllocationFailure(&'static str),
    /// The processor does not support VMX.
    UnsupportedExtension,
    /// Firmware locked `IA32_FEATURE_CONTROL` with VMX disabled.
    FeatureLocked,
    /// The named VMX instruction failed.
    VmxOperationError(&'static str, InstructionError),
    /// A privileged operation faulted.
    HardwareException(&'static str),
    /// The guest caused an exit that no handler accepts.
    UnhandledExitReason {
        /// Why the guest exited.
        reason: ExitReason,
        /// Guest instruction pointer at the exit.
        rip: u64,
    },
    /// The selector refers to a descriptor the resolver can not read.
    UnsupportedSelector(u16),
    /// A controller declined the exit.
    HandleVmexitFailed(ExitReason),
    /// A controller failed while handling the exit.
    ControllerError(Box<dyn core::fmt::Debug + Send + Sync>),
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AllocationFailure(what) => write!(f, "failed to allocate {}", what),
            Self::UnsupportedExtension => write!(f, "VMX is not supported by this processor"),
            Self::FeatureLocked => write!(f, "VMX is disabled and locked by firmware"),
            Self::VmxOperationError(insn, e) => {
                write!(f, "{} failed with instruction error {} ({:?})", insn, e.code(), e)
            }
            Self::HardwareException(op) => write!(f, "hardware exception during {}", op),
            Self::UnhandledExitReason { reason, rip } => {
                write!(f, "unhandled vmexit {:?} at rip {:#x}", reason, rip)
            }
            Self::UnsupportedSelector(sel) => write!(f, "unsupported segment selector {:#x}", sel),
            Self::HandleVmexitFailed(reason) => write!(f, "no controller handled {:?}", reason),
            Self::ControllerError(e) => write!(f, "controller error: {:?}", e),
        }
    }
}
