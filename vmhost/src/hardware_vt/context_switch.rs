//! The context switch between the host and a guest.
//!
//! This is the only place that touches guest general purpose registers in
//! assembly. Everything above it works on [`GuestRegisters`] in memory.
//!
//! # Calling convention
//!
//! Both entry functions take a pointer to the VM's [`GuestRegisters`], which
//! must live at the top of the VM's exit stack: the 16 bytes directly below it
//! are the trampoline slots, and the exit stack grows down from there.
//!
//! ```text
//!   regs + size_of::<GuestRegisters>()  +----------------------+
//!                                       | GuestRegisters       |
//!   regs ------------------------------>+----------------------+
//!                                       | saved host RSP       | regs - 8
//!                                       | regs pointer         | regs - 16  <- VMX HOST_RSP
//!                                       | exit stack ...       |
//! ```
//!
//! On VMX the processor lands on `vmhost_vmx_exit_trampoline` (HOST_RIP) with
//! RSP = regs - 16. The trampoline stores the guest registers through the
//! pointer in that slot, switches back to the saved host RSP and returns 0
//! from `vmhost_vmx_enter_guest`. A failed VMLAUNCH/VMRESUME returns directly:
//! 1 for VMfailInvalid (CF) and 2 for VMfailValid (ZF).
//!
//! On SVM, VMRUN returns in place on #VMEXIT, so `vmhost_svm_enter_guest` is
//! a plain call. It runs with GIF cleared and VMSAVE/VMLOADs the host's hidden
//! segment state through `host_save`.
//!
//! Callee-saved registers are preserved. Guest RIP, RSP and RFLAGS (and RAX on
//! SVM) live in the control block and are not touched here.

use crate::{state::GuestRegisters, x86_instructions};
use core::{arch::global_asm, mem::offset_of};

extern "sysv64" {
    fn vmhost_vmx_enter_guest(regs: *mut GuestRegisters, launched: u64) -> u64;
    fn vmhost_vmx_exit_trampoline();
    fn vmhost_svm_enter_guest(regs: *mut GuestRegisters, vmcb: u64, host_save: u64);
}

/// Bytes reserved below the register file for the trampoline slots.
pub const TRAMPOLINE_SLOTS: u64 = 16;

/// How a VMX entry failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxEntryFailure {
    /// VMfailInvalid: no current VMCS.
    Invalid,
    /// VMfailValid: the reason is in the VM-instruction error field.
    Valid,
}

/// The address the VMCS host RIP must point at.
pub fn vmx_exit_trampoline() -> u64 {
    vmhost_vmx_exit_trampoline as usize as u64
}

/// Runs the guest with VMLAUNCH (`launched == false`) or VMRESUME until the
/// next VM exit.
///
/// # Safety
///
/// The VMCS must be current with HOST_RIP set to [`vmx_exit_trampoline`] and
/// HOST_RSP to `regs - TRAMPOLINE_SLOTS`, where `regs` sits at the top of the
/// exit stack.
pub unsafe fn vmx_enter(regs: &mut GuestRegisters, launched: bool) -> Result<(), VmxEntryFailure> {
    let interrupts = x86_instructions::interrupts_enabled();
    x86_instructions::cli();
    let status = vmhost_vmx_enter_guest(regs, u64::from(launched));
    if interrupts {
        x86_instructions::sti();
    }
    match status {
        0 => Ok(()),
        1 => Err(VmxEntryFailure::Invalid),
        _ => Err(VmxEntryFailure::Valid),
    }
}

/// Runs the guest with VMRUN until the next #VMEXIT.
///
/// # Safety
///
/// EFER.SVME must be set, `vmcb` must hold a valid guest and `host_save` must
/// be a page owned by the caller. VM_HSAVE_PA must point at a separate page.
pub unsafe fn svm_enter(regs: &mut GuestRegisters, vmcb: u64, host_save: u64) {
    let interrupts = x86_instructions::interrupts_enabled();
    x86_instructions::cli();
    vmhost_svm_enter_guest(regs, vmcb, host_save);
    if interrupts {
        x86_instructions::sti();
    }
}

global_asm!(
    r#"
.global vmhost_vmx_enter_guest
vmhost_vmx_enter_guest:
    push rbx
    push rbp
    push r12
    push r13
    push r14
    push r15
    mov [rdi - 8], rsp
    mov [rdi - 16], rdi
    fxrstor64 [rdi + {fx}]

    // Flags survive the loads below and select VMLAUNCH or VMRESUME.
    test rsi, rsi

    mov rax, [rdi + {rax}]
    mov rbx, [rdi + {rbx}]
    mov rcx, [rdi + {rcx}]
    mov rdx, [rdi + {rdx}]
    mov rsi, [rdi + {rsi}]
    mov rbp, [rdi + {rbp}]
    mov r8,  [rdi + {r8}]
    mov r9,  [rdi + {r9}]
    mov r10, [rdi + {r10}]
    mov r11, [rdi + {r11}]
    mov r12, [rdi + {r12}]
    mov r13, [rdi + {r13}]
    mov r14, [rdi + {r14}]
    mov r15, [rdi + {r15}]
    mov rdi, [rdi + {rdi}]
    jnz 2f
    vmlaunch
    jmp 3f
2:
    vmresume
3:
    mov eax, 2
    jnc 4f
    mov eax, 1
4:
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbp
    pop rbx
    ret

.global vmhost_vmx_exit_trampoline
vmhost_vmx_exit_trampoline:
    push rax
    mov rax, [rsp + 8]
    mov [rax + {rbx}], rbx
    mov [rax + {rcx}], rcx
    mov [rax + {rdx}], rdx
    mov [rax + {rsi}], rsi
    mov [rax + {rdi}], rdi
    mov [rax + {rbp}], rbp
    mov [rax + {r8}],  r8
    mov [rax + {r9}],  r9
    mov [rax + {r10}], r10
    mov [rax + {r11}], r11
    mov [rax + {r12}], r12
    mov [rax + {r13}], r13
    mov [rax + {r14}], r14
    mov [rax + {r15}], r15
    pop rbx
    mov [rax + {rax}], rbx
    fxsave64 [rax + {fx}]
    mov rsp, [rax - 8]
    xor eax, eax
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbp
    pop rbx
    ret

.global vmhost_svm_enter_guest
vmhost_svm_enter_guest:
    push rbx
    push rbp
    push r12
    push r13
    push r14
    push r15
    push rdi
    push rsi
    push rdx
    clgi
    mov rax, rdx
    vmsave rax
    fxrstor64 [rdi + {fx}]

    mov rax, rsi
    mov rbx, [rdi + {rbx}]
    mov rcx, [rdi + {rcx}]
    mov rdx, [rdi + {rdx}]
    mov rsi, [rdi + {rsi}]
    mov rbp, [rdi + {rbp}]
    mov r8,  [rdi + {r8}]
    mov r9,  [rdi + {r9}]
    mov r10, [rdi + {r10}]
    mov r11, [rdi + {r11}]
    mov r12, [rdi + {r12}]
    mov r13, [rdi + {r13}]
    mov r14, [rdi + {r14}]
    mov r15, [rdi + {r15}]
    mov rdi, [rdi + {rdi}]
    vmload rax
    vmrun rax
    vmsave rax

    // [rsp] guest rdi, [rsp + 8] host save, [rsp + 16] vmcb, [rsp + 24] regs
    push rdi
    mov rdi, [rsp + 24]
    mov [rdi + {rbx}], rbx
    mov [rdi + {rcx}], rcx
    mov [rdi + {rdx}], rdx
    mov [rdi + {rsi}], rsi
    mov [rdi + {rbp}], rbp
    mov [rdi + {r8}],  r8
    mov [rdi + {r9}],  r9
    mov [rdi + {r10}], r10
    mov [rdi + {r11}], r11
    mov [rdi + {r12}], r12
    mov [rdi + {r13}], r13
    mov [rdi + {r14}], r14
    mov [rdi + {r15}], r15
    pop rcx
    mov [rdi + {rdi}], rcx
    fxsave64 [rdi + {fx}]
    pop rax
    vmload rax
    add rsp, 16
    stgi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbp
    pop rbx
    ret
"#,
    rax = const offset_of!(GuestRegisters, rax),
    rbx = const offset_of!(GuestRegisters, rbx),
    rcx = const offset_of!(GuestRegisters, rcx),
    rdx = const offset_of!(GuestRegisters, rdx),
    rdi = const offset_of!(GuestRegisters, rdi),
    rsi = const offset_of!(GuestRegisters, rsi),
    rbp = const offset_of!(GuestRegisters, rbp),
    r8 = const offset_of!(GuestRegisters, r8),
    r9 = const offset_of!(GuestRegisters, r9),
    r10 = const offset_of!(GuestRegisters, r10),
    r11 = const offset_of!(GuestRegisters, r11),
    r12 = const offset_of!(GuestRegisters, r12),
    r13 = const offset_of!(GuestRegisters, r13),
    r14 = const offset_of!(GuestRegisters, r14),
    r15 = const offset_of!(GuestRegisters, r15),
    fx = const offset_of!(GuestRegisters, fx),
);
