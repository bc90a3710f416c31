//! The VM exit dispatcher. Each exit is classified and either emulated,
//! after which the guest resumes, or reported as fatal.

use crate::{
    error::HypervisorError,
    guest_paging,
    hardware_vt::{CrAccess, CrAccessType, ExitReason, ExitSnapshot, GuestField, IoAccess},
    hypercall::HypercallOutcome,
    lapic::VirtualLapic,
    state::GuestRegisters,
    vm::Vm,
    x86_instructions,
};
use log::{trace, warn};
use serde::Serialize;

/// Where a VM is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    /// Inside the guest, or ready to enter it.
    Running,
    /// In the host, inside the dispatcher.
    Handling,
    /// Executed HLT with an interrupt source armed; resumes on the next
    /// injected interrupt.
    Waiting,
    /// Executed HLT with nothing to wake it, or the exit hypercall.
    Halted,
    /// Stopped by a fatal condition or a close request.
    Terminated,
}

impl RunState {
    /// Whether the VM will never enter the guest again.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Halted | Self::Terminated)
    }
}

/// What the run loop does after an exit was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Resume,
    /// Resume after the task yielded to the scheduler.
    Yield,
    /// Park until an interrupt arrives.
    Wait,
    Halt,
}

/// The COM1 port range.
const COM1: u16 = 0x3f8;
const COM1_LAST: u16 = 0x3ff;
const COM1_LINE_STATUS: u16 = 0x3fd;
/// Transmitter holding register and transmitter empty.
const LINE_STATUS_IDLE: u64 = 0x60;

const RFLAGS_DF: u64 = 1 << 10;

/// Longest x86 instruction.
const MAX_INSTRUCTION_LENGTH: u64 = 15;

/// Hides virtualization from the guest: the hypervisor-present bit and the
/// VMX and SVM feature bits. The x2APIC bit is always reported because the
/// virtual LAPIC is programmed through x2APIC MSRs.
pub fn mask_cpuid(leaf: u32, mut result: [u32; 4], hide_virtualization: bool) -> [u32; 4] {
    const LEAF1_ECX_VMX: u32 = 1 << 5;
    const LEAF1_ECX_X2APIC: u32 = 1 << 21;
    const LEAF1_ECX_HYPERVISOR: u32 = 1 << 31;
    const EXT_LEAF1_ECX_SVM: u32 = 1 << 2;

    match leaf {
        0x1 => {
            result[2] |= LEAF1_ECX_X2APIC;
            if hide_virtualization {
                result[2] &= !(LEAF1_ECX_VMX | LEAF1_ECX_HYPERVISOR);
            }
        }
        0x8000_0001 if hide_virtualization => result[2] &= !EXT_LEAF1_ECX_SVM,
        _ => {}
    }
    result
}

/// Moves RIP past the exiting instruction.
fn advance_rip(regs: &mut GuestRegisters, exit: &ExitSnapshot) -> crate::Result<()> {
    let length = exit.instruction_length;
    if !(1..=MAX_INSTRUCTION_LENGTH).contains(&length) {
        return Err(HypervisorError::MalformedExit("instruction length"));
    }
    regs.rip = regs.rip.wrapping_add(length);
    Ok(())
}

/// Stores an IN result the way the processor does: 8 and 16 bit reads keep
/// the rest of RAX, 32 bit reads zero-extend.
fn write_in_result(regs: &mut GuestRegisters, size: u8, value: u64) {
    regs.rax = match size {
        1 => (regs.rax & !0xff) | (value & 0xff),
        2 => (regs.rax & !0xffff) | (value & 0xffff),
        _ => value & 0xffff_ffff,
    };
}

impl Vm {
    /// Handles one exit. `Err` terminates the VM.
    pub(crate) fn dispatch(&mut self, exit: &ExitSnapshot) -> crate::Result<ExitAction> {
        trace!("VM {}: exit {:?} at {:#x}", self.id, exit.reason, exit.rip);
        match exit.reason {
            ExitReason::Cpuid => {
                let leaf = self.regs.rax as u32;
                let sub_leaf = self.regs.rcx as u32;
                let result = mask_cpuid(
                    leaf,
                    x86_instructions::cpuid(leaf, sub_leaf),
                    self.mask_cpuid,
                );
                self.regs.rax = u64::from(result[0]);
                self.regs.rbx = u64::from(result[1]);
                self.regs.rcx = u64::from(result[2]);
                self.regs.rdx = u64::from(result[3]);
                advance_rip(&mut self.regs, exit)?;
                Ok(ExitAction::Resume)
            }
            ExitReason::Hlt => {
                advance_rip(&mut self.regs, exit)?;
                let wakeable = self.lapic.is_armed()
                    || !self.interrupts.is_empty()
                    || self.lapic.pending().is_some();
                Ok(if self.regs.interrupts_enabled() && wakeable {
                    ExitAction::Wait
                } else {
                    ExitAction::Halt
                })
            }
            ExitReason::Pause => {
                advance_rip(&mut self.regs, exit)?;
                Ok(ExitAction::Yield)
            }
            ExitReason::Io(access) => {
                self.emulate_io(&access)?;
                advance_rip(&mut self.regs, exit)?;
                Ok(ExitAction::Resume)
            }
            ExitReason::MsrRead => {
                let msr = self.regs.rcx as u32;
                let value = self.read_msr(msr)?;
                trace!("RDMSR {msr:#x} -> {value:#x}");
                self.regs.rax = value & 0xffff_ffff;
                self.regs.rdx = value >> 32;
                advance_rip(&mut self.regs, exit)?;
                Ok(ExitAction::Resume)
            }
            ExitReason::MsrWrite => {
                let msr = self.regs.rcx as u32;
                let value = (self.regs.rdx << 32) | (self.regs.rax & 0xffff_ffff);
                trace!("WRMSR {msr:#x} <- {value:#x}");
                self.write_msr(msr, value)?;
                advance_rip(&mut self.regs, exit)?;
                Ok(ExitAction::Resume)
            }
            ExitReason::NestedPageFault(fault) => {
                if self.ept.handle_violation(&fault)? == crate::ept::Resolution::Remapped {
                    self.vt.invalidate_caches();
                }
                Ok(ExitAction::Resume)
            }
            ExitReason::Hypercall => {
                let outcome = self.handle_hypercall()?;
                advance_rip(&mut self.regs, exit)?;
                Ok(match outcome {
                    HypercallOutcome::Resume => ExitAction::Resume,
                    HypercallOutcome::Exit => ExitAction::Halt,
                })
            }
            ExitReason::ControlRegisterAccess(access) => {
                self.emulate_cr_access(&access, exit.raw_reason)?;
                advance_rip(&mut self.regs, exit)?;
                Ok(ExitAction::Resume)
            }
            // The host takes the interrupt once the context switch restores
            // its interrupt flag.
            ExitReason::ExternalInterrupt | ExitReason::InterruptWindow => Ok(ExitAction::Resume),
            ExitReason::Nmi => {
                warn!("VM {}: NMI while running the guest", self.id);
                Ok(ExitAction::Resume)
            }
            ExitReason::Shutdown => Err(HypervisorError::TripleFault),
            ExitReason::InvalidGuestState => Err(HypervisorError::EntryFailed(exit.raw_reason)),
            ExitReason::NestedPagingMisconfiguration
            | ExitReason::Exception(_)
            | ExitReason::Unexpected(_) => Err(HypervisorError::UnhandledExit(exit.raw_reason)),
        }
    }

    fn emulate_io(&mut self, access: &IoAccess) -> crate::Result<()> {
        let unhandled = HypervisorError::UnhandledIo {
            port: access.port,
            size: access.size,
        };
        if !(COM1..=COM1_LAST).contains(&access.port) {
            return Err(unhandled);
        }
        if access.string {
            if access.input || access.port != COM1 || access.size != 1 {
                return Err(unhandled);
            }
            return self.emulate_outs(access.rep);
        }
        if access.input {
            let value = if access.port == COM1_LINE_STATUS {
                LINE_STATUS_IDLE
            } else {
                0
            };
            write_in_result(&mut self.regs, access.size, value);
        } else if access.port == COM1 && access.size == 1 {
            self.host.console.write(self.id, &[self.regs.rax as u8]);
        }
        Ok(())
    }

    /// `outsb` and `rep outsb` to the COM1 data port: the string is copied
    /// out of guest memory starting at RSI.
    fn emulate_outs(&mut self, rep: bool) -> crate::Result<()> {
        let count = if rep { self.regs.rcx } else { 1 };
        let cr3 = self.vt.guest_field(GuestField::Cr3)?;
        let backwards = self.regs.rflags & RFLAGS_DF != 0;

        let mut bytes = alloc::vec::Vec::with_capacity(count.min(0x1000) as usize);
        for i in 0..count {
            let va = if backwards {
                self.regs.rsi.wrapping_sub(i)
            } else {
                self.regs.rsi.wrapping_add(i)
            };
            let gpa = guest_paging::translate(&self.ept, cr3, va)
                .ok_or(HypervisorError::UnmappedGuestVirtual { va })?;
            let mut byte = [0u8];
            self.ept.read(gpa, &mut byte)?;
            bytes.push(byte[0]);
        }
        self.host.console.write(self.id, &bytes);

        self.regs.rsi = if backwards {
            self.regs.rsi.wrapping_sub(count)
        } else {
            self.regs.rsi.wrapping_add(count)
        };
        if rep {
            self.regs.rcx = 0;
        }
        Ok(())
    }

    fn read_msr(&mut self, msr: u32) -> crate::Result<u64> {
        if VirtualLapic::handles_msr(msr) {
            return Ok(self.lapic.read_msr(msr, self.host.clock.now()));
        }
        if let Some(field) = GuestField::from_msr(msr) {
            return self.vt.guest_field(field);
        }
        Ok(self.msrs.get(&msr).copied().unwrap_or(0))
    }

    fn write_msr(&mut self, msr: u32, value: u64) -> crate::Result<()> {
        if VirtualLapic::handles_msr(msr) {
            return self.lapic.write_msr(msr, value, self.host.clock.now());
        }
        if let Some(field) = GuestField::from_msr(msr) {
            return self.vt.set_guest_field(field, value);
        }
        self.msrs.insert(msr, value);
        Ok(())
    }

    fn emulate_cr_access(&mut self, access: &CrAccess, raw_reason: u64) -> crate::Result<()> {
        if access.cr != 3 {
            return Err(HypervisorError::UnhandledExit(raw_reason));
        }
        let Some(gpr) = self.regs.gpr_mut(access.gpr) else {
            return Err(HypervisorError::MalformedExit("control register GPR"));
        };
        match access.access {
            CrAccessType::MovToCr => {
                let value = *gpr;
                self.vt.set_guest_field(GuestField::Cr3, value)?;
                self.vt.invalidate_caches();
            }
            CrAccessType::MovFromCr => *gpr = self.vt.guest_field(GuestField::Cr3)?,
            CrAccessType::Other => return Err(HypervisorError::UnhandledExit(raw_reason)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpuid_hides_virtualization_when_asked() {
        let leaf1 = [0, 0, (1 << 31) | (1 << 5) | 1, 0];
        assert_eq!(mask_cpuid(1, leaf1, true)[2], (1 << 21) | 1);
        assert_eq!(mask_cpuid(1, leaf1, false)[2], leaf1[2] | (1 << 21));
        assert_eq!(mask_cpuid(0x8000_0001, [0, 0, 0b111, 0], true)[2], 0b011);
        assert_eq!(mask_cpuid(0, [7, 1, 2, 3], true), [7, 1, 2, 3]);
    }

    #[test]
    fn rip_advance_rejects_bogus_lengths() {
        let mut regs = GuestRegisters {
            rip: 0x1000,
            ..GuestRegisters::default()
        };
        let mut exit = ExitSnapshot::new(ExitReason::Cpuid, 10, 2);
        advance_rip(&mut regs, &exit).unwrap();
        assert_eq!(regs.rip, 0x1002);
        exit.instruction_length = 0;
        assert!(advance_rip(&mut regs, &exit).is_err());
        exit.instruction_length = 16;
        assert!(advance_rip(&mut regs, &exit).is_err());
        assert_eq!(regs.rip, 0x1002);
    }

    #[test]
    fn in_results_follow_operand_size() {
        let mut regs = GuestRegisters {
            rax: 0xffff_ffff_ffff_ffff,
            ..GuestRegisters::default()
        };
        write_in_result(&mut regs, 1, 0x60);
        assert_eq!(regs.rax, 0xffff_ffff_ffff_ff60);
        write_in_result(&mut regs, 2, 0x1234);
        assert_eq!(regs.rax, 0xffff_ffff_ffff_1234);
        write_in_result(&mut regs, 4, 0x8765_4321);
        assert_eq!(regs.rax, 0x8765_4321);
    }

    #[test]
    fn only_halted_and_terminated_are_final() {
        assert!(RunState::Halted.is_final());
        assert!(RunState::Terminated.is_final());
        assert!(!RunState::Waiting.is_final());
        assert!(!RunState::Handling.is_final());
    }
}
