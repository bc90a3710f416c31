//! Wrappers for the privileged instructions the backends execute.
//!
//! The `x86` crate marks these `unsafe` because they fault outside ring 0.
//! The hypervisor layer only ever runs in the host kernel at CPL0, so the
//! wrappers are exposed as safe functions. Nothing above `hardware_vt`
//! calls them except [`rdtsc`] and [`cpuid`], which are unprivileged.

#![allow(unused_unsafe)]

use core::arch::asm;
use x86::{
    controlregs::{Cr0, Cr4},
    dtables::DescriptorTablePointer,
    segmentation::SegmentSelector,
};

pub fn rdtsc() -> u64 {
    // Safety: RDTSC is unprivileged unless CR4.TSD is set, which the host
    // kernel never does.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// RDMSR. An MSR the processor lacks raises #GP, so callers only read
/// architectural MSRs or ones gated by a CPUID check.
pub fn rdmsr(msr: u32) -> u64 {
    // Safety: CPL0.
    unsafe { x86::msr::rdmsr(msr) }
}

pub fn wrmsr(msr: u32, value: u64) {
    // Safety: CPL0.
    unsafe { x86::msr::wrmsr(msr, value) };
}

/// Returns `[eax, ebx, ecx, edx]` of CPUID `leaf`/`sub_leaf` on the current
/// processor.
pub fn cpuid(leaf: u32, sub_leaf: u32) -> [u32; 4] {
    // Safety: CPUID exists on every x86-64 processor.
    let result = unsafe { core::arch::x86_64::__cpuid_count(leaf, sub_leaf) };
    [result.eax, result.ebx, result.ecx, result.edx]
}

pub fn cr0() -> Cr0 {
    // Safety: CPL0.
    unsafe { x86::controlregs::cr0() }
}

/// Used only to apply the VMX fixed bits before VMXON.
pub fn cr0_write(val: Cr0) {
    // Safety: CPL0.
    unsafe { x86::controlregs::cr0_write(val) };
}

pub fn cr3() -> u64 {
    // Safety: CPL0.
    unsafe { x86::controlregs::cr3() }
}

pub fn cr4() -> Cr4 {
    // Safety: CPL0.
    unsafe { x86::controlregs::cr4() }
}

pub fn cr4_write(val: Cr4) {
    // Safety: CPL0.
    unsafe { x86::controlregs::cr4_write(val) };
}

/// RFLAGS.IF of the host.
pub fn interrupts_enabled() -> bool {
    const RFLAGS_IF: u64 = 1 << 9;
    let rflags: u64;
    // Safety: reading RFLAGS has no side effects.
    unsafe { asm!("pushfq", "pop {}", out(reg) rflags, options(preserves_flags)) };
    rflags & RFLAGS_IF != 0
}

pub fn cli() {
    // Safety: CPL0.
    unsafe { x86::irq::disable() };
}

pub fn sti() {
    // Safety: CPL0.
    unsafe { x86::irq::enable() };
}

pub fn sidt<T>(idtr: &mut DescriptorTablePointer<T>) {
    // Safety: SIDT only stores into `idtr`.
    unsafe { x86::dtables::sidt(idtr) };
}

pub fn sgdt<T>(gdtr: &mut DescriptorTablePointer<T>) {
    // Safety: SGDT only stores into `gdtr`.
    unsafe { x86::dtables::sgdt(gdtr) };
}

/// The host's `[es, cs, ss, ds, fs, gs, tr]`.
pub fn segment_selectors() -> [SegmentSelector; 7] {
    // Safety: reading segment registers has no side effects.
    unsafe {
        [
            x86::segmentation::es(),
            x86::segmentation::cs(),
            x86::segmentation::ss(),
            x86::segmentation::ds(),
            x86::segmentation::fs(),
            x86::segmentation::gs(),
            x86::task::tr(),
        ]
    }
}

/// INVEPT type 1: drops every cached translation derived from `eptp`.
/// Requires VMX root operation.
pub fn invept_single_context(eptp: u64) {
    const SINGLE_CONTEXT: u64 = 1;
    let descriptor: [u64; 2] = [eptp, 0];
    // Safety: CPL0 in VMX root operation; the descriptor outlives the
    // instruction.
    unsafe {
        asm!(
            "invept {}, [{}]",
            in(reg) SINGLE_CONTEXT,
            in(reg) &descriptor,
            options(nostack),
        );
    }
}
