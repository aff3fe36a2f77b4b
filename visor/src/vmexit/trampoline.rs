//! Assembly glue between the processor and the exit dispatcher.
//!
//! On a VM exit the processor loads the host rsp recorded in the VMCS, which
//! points at the middle of the core's host stack, where a pointer to the
//! [`LogicalProcessor`] is stored. The entry stub pushes the guest registers
//! below it in the [`GuestRegisters`] layout and calls the handler. A non-zero
//! answer restores the registers and resumes the guest. Zero parks the core.
//!
//! Both stubs use the win64 calling convention, whose callee preserves xmm6
//! to xmm15. Only xmm0 to xmm5 have to be spilled into the frame.
use super::{dispatch, GuestRegisters};
use crate::{
    cpu::NativeCpu,
    vcpu::{LogicalProcessor, ProcessorState},
    vmcs::{ActiveVmcs, Field},
};
use abyss::x86_64::intrinsics;
use core::arch::global_asm;

global_asm!(
    r#"
.global visor_vmexit_entry
visor_vmexit_entry:
    push rax
    push rcx
    push rdx
    push rbx
    push rbp
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    sub rsp, 104
    movdqa [rsp], xmm0
    movdqa [rsp + 0x10], xmm1
    movdqa [rsp + 0x20], xmm2
    movdqa [rsp + 0x30], xmm3
    movdqa [rsp + 0x40], xmm4
    movdqa [rsp + 0x50], xmm5

    mov rcx, rsp
    mov rdx, [rsp + 224]
    sub rsp, 32
    call visor_vmexit_handler
    add rsp, 32
    test al, al
    jz 4f

    movdqa xmm0, [rsp]
    movdqa xmm1, [rsp + 0x10]
    movdqa xmm2, [rsp + 0x20]
    movdqa xmm3, [rsp + 0x30]
    movdqa xmm4, [rsp + 0x40]
    movdqa xmm5, [rsp + 0x50]
    add rsp, 104
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rbp
    pop rbx
    pop rdx
    pop rcx
    pop rax
    vmresume
    mov rcx, [rsp]
    sub rsp, 32
    call visor_vmresume_failed
4:
    sub rsp, 32
    call visor_vmexit_park

.global visor_launch
visor_launch:
    push rbx
    push rbp
    push rdi
    push rsi
    push r12
    push r13
    push r14
    push r15
    mov rcx, 0x681c
    vmwrite rcx, rsp
    jna 2f
    mov rcx, 0x681e
    lea rdx, [rip + 3f]
    vmwrite rcx, rdx
    jna 2f
    vmlaunch
2:
    mov al, 2
    jz 5f
    mov al, 1
    jmp 5f
3:
    xor eax, eax
5:
    pop r15
    pop r14
    pop r13
    pop r12
    pop rsi
    pop rdi
    pop rbp
    pop rbx
    ret
"#
);

extern "win64" {
    fn visor_vmexit_entry();
    fn visor_launch() -> u8;
}

const _: () = assert!(Field::GuestRsp as u32 == 0x681c);
const _: () = assert!(Field::GuestRip as u32 == 0x681e);

/// Address the processor jumps to on every VM exit.
pub fn entry_point() -> u64 {
    visor_vmexit_entry as usize as u64
}

/// Record the resume point of the caller as the guest's rip and rsp, then
/// execute `vmlaunch`.
///
/// Returns 0 when the call returns as the guest, 1 on VMfailInvalid and 2 on
/// VMfailValid.
///
/// # Safety
/// A fully configured VMCS must be current on this core.
pub unsafe fn launch() -> u8 {
    visor_launch()
}

#[no_mangle]
unsafe extern "win64" fn visor_vmexit_handler(
    regs: *mut GuestRegisters,
    lp: *mut LogicalProcessor,
) -> u8 {
    let lp = &mut *lp;
    let cpu = NativeCpu::new(lp.global().exception_guard());
    let result = dispatch(&cpu, lp.global(), &mut *regs);
    match result {
        Ok(()) => 1,
        Err(_) => {
            lp.set_state(ProcessorState::Halted);
            0
        }
    }
}

#[no_mangle]
extern "win64" fn visor_vmexit_park() -> ! {
    error!("Parking logical processor {}", intrinsics::apic_id());
    intrinsics::halt()
}

#[no_mangle]
unsafe extern "win64" fn visor_vmresume_failed(lp: *const LogicalProcessor) -> ! {
    let cpu = NativeCpu::new((*lp).global().exception_guard());
    let vmcs = ActiveVmcs::new(&cpu);
    let e = vmcs.instruction_error();
    error!("vmresume failed with instruction error {} ({:?})", e.code(), e);
    vmcs.dump();
    intrinsics::int3();
    intrinsics::halt()
}
