//! The module containing the AMD SVM backend.
//!
//! The VMCB is accessed by byte offset (APM Vol. 2, Appendix B) through the
//! allocator's direct map rather than through a Rust struct, since only a
//! fraction of its 4KB is used.

use super::{
    context_switch, CrAccess, CrAccessType, ExitReason, ExitSnapshot, GuestField, HardwareVt,
    InterruptedEvent, IoAccess, NestedPageFault, NestedPagingStructureEntryFlags,
    NestedPagingStructureEntryType, Vendor,
};
use crate::{
    control_block::ControlBlockConfig,
    error::HypervisorError,
    frames::{FrameAllocator, FRAME_SIZE},
    state::GuestRegisters,
    x86_data::SegmentState,
    x86_instructions::{cpuid, rdmsr, wrmsr},
};
use alloc::sync::Arc;
use log::trace;
use x86::msr;

// Control area.
const CTRL_INTERCEPT_EXCEPTIONS: usize = 0x008;
const CTRL_INTERCEPT_MISC1: usize = 0x00c;
const CTRL_INTERCEPT_MISC2: usize = 0x010;
const CTRL_IOPM_BASE: usize = 0x040;
const CTRL_MSRPM_BASE: usize = 0x048;
const CTRL_GUEST_ASID: usize = 0x058;
const CTRL_TLB_CONTROL: usize = 0x05c;
const CTRL_V_INTR: usize = 0x060;
const CTRL_INTERRUPT_SHADOW: usize = 0x068;
const CTRL_EXIT_CODE: usize = 0x070;
const CTRL_EXIT_INFO1: usize = 0x078;
const CTRL_EXIT_INFO2: usize = 0x080;
const CTRL_EXIT_INT_INFO: usize = 0x088;
const CTRL_NP_ENABLE: usize = 0x090;
const CTRL_EVENT_INJECTION: usize = 0x0a8;
const CTRL_NCR3: usize = 0x0b0;
const CTRL_CLEAN_BITS: usize = 0x0c0;
const CTRL_NRIP: usize = 0x0c8;

// State save area.
const SAVE_ES: usize = 0x400;
const SAVE_CS: usize = 0x410;
const SAVE_SS: usize = 0x420;
const SAVE_DS: usize = 0x430;
const SAVE_FS: usize = 0x440;
const SAVE_GS: usize = 0x450;
const SAVE_GDTR: usize = 0x460;
const SAVE_LDTR: usize = 0x470;
const SAVE_IDTR: usize = 0x480;
const SAVE_TR: usize = 0x490;
const SAVE_EFER: usize = 0x4d0;
const SAVE_CR4: usize = 0x548;
const SAVE_CR3: usize = 0x550;
const SAVE_CR0: usize = 0x558;
const SAVE_DR7: usize = 0x560;
const SAVE_DR6: usize = 0x568;
const SAVE_RFLAGS: usize = 0x570;
const SAVE_RIP: usize = 0x578;
const SAVE_RSP: usize = 0x5d8;
const SAVE_RAX: usize = 0x5f8;
const SAVE_STAR: usize = 0x600;
const SAVE_LSTAR: usize = 0x608;
const SAVE_CSTAR: usize = 0x610;
const SAVE_SFMASK: usize = 0x618;
const SAVE_KERNEL_GS_BASE: usize = 0x620;
const SAVE_G_PAT: usize = 0x668;

/// Offset of the base within a VMCB segment (selector u16, attrib u16,
/// limit u32, base u64).
const SEGMENT_BASE: usize = 8;

const INTERCEPT_INTR: u32 = 1 << 0;
const INTERCEPT_NMI: u32 = 1 << 1;
const INTERCEPT_VINTR: u32 = 1 << 4;
const INTERCEPT_CPUID: u32 = 1 << 18;
const INTERCEPT_PAUSE: u32 = 1 << 23;
const INTERCEPT_HLT: u32 = 1 << 24;
const INTERCEPT_IOIO: u32 = 1 << 27;
const INTERCEPT_MSR: u32 = 1 << 28;
const INTERCEPT_SHUTDOWN: u32 = 1 << 31;

const INTERCEPT_VMRUN: u32 = 1 << 0;
const INTERCEPT_VMMCALL: u32 = 1 << 1;

mod exit_code {
    pub const CR_FIRST: u64 = 0x00;
    pub const CR_LAST: u64 = 0x1f;
    pub const EXCEPTION_FIRST: u64 = 0x40;
    pub const EXCEPTION_LAST: u64 = 0x5f;
    pub const INTR: u64 = 0x60;
    pub const NMI: u64 = 0x61;
    pub const VINTR: u64 = 0x64;
    pub const CPUID: u64 = 0x72;
    pub const PAUSE: u64 = 0x77;
    pub const HLT: u64 = 0x78;
    pub const IOIO: u64 = 0x7b;
    pub const MSR: u64 = 0x7c;
    pub const SHUTDOWN: u64 = 0x7f;
    pub const VMMCALL: u64 = 0x81;
    pub const NPF: u64 = 0x400;
    pub const INVALID: u64 = u64::MAX;
}

const EFER_SVME: u64 = 1 << 12;

/// The AMD SVM backend. One instance manages one VMCB.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Svm {
    #[derivative(Debug = "ignore")]
    memory: Arc<dyn FrameAllocator>,
    /// Physical address of the VMCB bound with [`HardwareVt::load`].
    vmcb: u64,
    /// Physical address of the page the host's hidden state is VMSAVE'd to.
    host_save: u64,
}

impl Svm {
    pub fn new(memory: Arc<dyn FrameAllocator>) -> crate::Result<Self> {
        const CPUID_EXT1_ECX_SVM: u32 = 1 << 2;
        const CPUID_SVM_EDX_NP: u32 = 1 << 0;
        const CPUID_SVM_EDX_NRIPS: u32 = 1 << 3;

        if cpuid(0x8000_0001, 0)[2] & CPUID_EXT1_ECX_SVM == 0 {
            return Err(HypervisorError::VirtualizationUnsupported("SVM"));
        }
        let features = cpuid(0x8000_000a, 0)[3];
        if features & CPUID_SVM_EDX_NP == 0 {
            return Err(HypervisorError::VirtualizationUnsupported("nested paging"));
        }
        if features & CPUID_SVM_EDX_NRIPS == 0 {
            return Err(HypervisorError::VirtualizationUnsupported("next RIP save"));
        }
        Ok(Self {
            memory,
            vmcb: 0,
            host_save: 0,
        })
    }

    fn read<T: Copy>(&self, offset: usize) -> T {
        let ptr = self.memory.physical_to_virtual(self.vmcb).wrapping_add(offset);
        // Safety: the VMCB is a page owned by the VM and `offset` is a field
        // within it.
        unsafe { ptr.cast::<T>().read_volatile() }
    }

    fn write<T: Copy>(&mut self, offset: usize, value: T) {
        let ptr = self.memory.physical_to_virtual(self.vmcb).wrapping_add(offset);
        // Safety: see `read`.
        unsafe { ptr.cast::<T>().write_volatile(value) };
    }

    fn write_segment(&mut self, offset: usize, segment: &SegmentState) {
        // The packed attributes are the VMCB attrib encoding already.
        let attributes = if segment.is_usable() { segment.attributes } else { 0 };
        self.write(offset, segment.selector);
        self.write(offset + 2, attributes);
        self.write(offset + 4, segment.limit);
        self.write(offset + SEGMENT_BASE, segment.base);
    }

    fn field_offset(field: GuestField) -> usize {
        match field {
            GuestField::Cr0 => SAVE_CR0,
            GuestField::Cr3 => SAVE_CR3,
            GuestField::Cr4 => SAVE_CR4,
            GuestField::Efer => SAVE_EFER,
            GuestField::FsBase => SAVE_FS + SEGMENT_BASE,
            GuestField::GsBase => SAVE_GS + SEGMENT_BASE,
            GuestField::KernelGsBase => SAVE_KERNEL_GS_BASE,
            GuestField::Star => SAVE_STAR,
            GuestField::Lstar => SAVE_LSTAR,
            GuestField::Cstar => SAVE_CSTAR,
            GuestField::Sfmask => SAVE_SFMASK,
        }
    }
}

impl HardwareVt for Svm {
    fn vendor(&self) -> Vendor {
        Vendor::Amd
    }

    fn enable(&mut self, host_area: u64) -> crate::Result<()> {
        const VM_CR: u32 = 0xc001_0114;
        const VM_CR_SVMDIS: u64 = 1 << 4;
        const VM_HSAVE_PA: u32 = 0xc001_0117;

        if rdmsr(VM_CR) & VM_CR_SVMDIS != 0 {
            return Err(HypervisorError::VirtualizationLocked);
        }
        wrmsr(msr::IA32_EFER, rdmsr(msr::IA32_EFER) | EFER_SVME);
        // The first page receives VMSAVE state, the second is the processor's
        // host save area.
        self.host_save = host_area;
        wrmsr(VM_HSAVE_PA, host_area + FRAME_SIZE as u64);
        Ok(())
    }

    fn disable(&mut self) {
        wrmsr(msr::IA32_EFER, rdmsr(msr::IA32_EFER) & !EFER_SVME);
    }

    fn load(&mut self, control_block: u64) -> crate::Result<()> {
        self.vmcb = control_block;
        Ok(())
    }

    fn clear(&mut self, _control_block: u64) -> crate::Result<()> {
        // Nothing is cached across VMRUNs while the clean bits are zero.
        self.write(CTRL_CLEAN_BITS, 0u32);
        Ok(())
    }

    fn apply(&mut self, config: &ControlBlockConfig) -> crate::Result<()> {
        let wanted = &config.controls;
        let mut misc1 = INTERCEPT_CPUID | INTERCEPT_IOIO | INTERCEPT_MSR | INTERCEPT_SHUTDOWN;
        if wanted.external_interrupt_exiting {
            misc1 |= INTERCEPT_INTR;
        }
        if wanted.nmi_exiting {
            misc1 |= INTERCEPT_NMI;
        }
        if wanted.hlt_exiting {
            misc1 |= INTERCEPT_HLT;
        }
        if wanted.pause_exiting {
            misc1 |= INTERCEPT_PAUSE;
        }
        trace!("SVM intercepts: misc1 {misc1:#x}");
        self.write(CTRL_INTERCEPT_EXCEPTIONS, wanted.exception_bitmap);
        self.write(CTRL_INTERCEPT_MISC1, misc1);
        self.write(CTRL_INTERCEPT_MISC2, INTERCEPT_VMRUN | INTERCEPT_VMMCALL);
        self.write(CTRL_IOPM_BASE, config.io_bitmap);
        self.write(CTRL_MSRPM_BASE, config.msr_bitmap);
        self.write(CTRL_GUEST_ASID, config.asid);
        self.write(CTRL_TLB_CONTROL, 0u32);
        self.write(CTRL_NP_ENABLE, 1u64);
        self.write(CTRL_NCR3, config.nested_root);
        self.write(CTRL_CLEAN_BITS, 0u32);

        let state = &config.guest;
        self.write_segment(SAVE_ES, &state.es);
        self.write_segment(SAVE_CS, &state.cs);
        self.write_segment(SAVE_SS, &state.ss);
        self.write_segment(SAVE_DS, &state.ds);
        self.write_segment(SAVE_FS, &state.fs);
        self.write_segment(SAVE_GS, &state.gs);
        self.write_segment(SAVE_LDTR, &state.ldtr);
        self.write_segment(SAVE_TR, &state.tr);
        self.write(SAVE_GDTR + 4, state.gdtr_limit);
        self.write(SAVE_GDTR + SEGMENT_BASE, state.gdtr_base);
        self.write(SAVE_IDTR + 4, state.idtr_limit);
        self.write(SAVE_IDTR + SEGMENT_BASE, state.idtr_base);

        self.write(SAVE_EFER, state.efer | EFER_SVME);
        self.write(SAVE_CR0, state.cr0);
        self.write(SAVE_CR3, state.cr3);
        self.write(SAVE_CR4, state.cr4);
        self.write(SAVE_DR6, 0xffff_0ff0u64);
        self.write(SAVE_DR7, state.dr7);
        self.write(SAVE_RFLAGS, state.rflags);
        self.write(SAVE_RIP, state.rip);
        self.write(SAVE_RSP, state.rsp);
        self.write(SAVE_G_PAT, state.pat);
        Ok(())
    }

    fn reload_host_state(&mut self, _config: &ControlBlockConfig) -> crate::Result<()> {
        // VMRUN saves the host state itself; `enable` pointed it at this
        // processor's save area.
        Ok(())
    }

    fn enter(&mut self, regs: &mut GuestRegisters) -> crate::Result<ExitSnapshot> {
        self.write(SAVE_RIP, regs.rip);
        self.write(SAVE_RSP, regs.rsp);
        self.write(SAVE_RFLAGS, regs.rflags);
        self.write(SAVE_RAX, regs.rax);

        // Safety: `enable` set EFER.SVME and VM_HSAVE_PA, and `apply` filled
        // the VMCB.
        unsafe { context_switch::svm_enter(regs, self.vmcb, self.host_save) };

        self.write(CTRL_TLB_CONTROL, 0u32);
        regs.rip = self.read(SAVE_RIP);
        regs.rsp = self.read(SAVE_RSP);
        regs.rflags = self.read(SAVE_RFLAGS);
        regs.rax = self.read(SAVE_RAX);

        let code: u64 = self.read(CTRL_EXIT_CODE);
        let info1: u64 = self.read(CTRL_EXIT_INFO1);
        let info2: u64 = self.read(CTRL_EXIT_INFO2);
        let nrip: u64 = self.read(CTRL_NRIP);
        let reason = decode_exit(code, info1, info2)?;
        let exit_int_info: u64 = self.read(CTRL_EXIT_INT_INFO);
        let instruction_length = instruction_length(regs.rip, nrip);
        Ok(ExitSnapshot {
            reason,
            raw_reason: code,
            qualification: info1,
            guest_linear_address: 0,
            guest_physical_address: if code == exit_code::NPF { info2 } else { 0 },
            instruction_length,
            instruction_info: 0,
            interruption_info: exit_int_info,
            error_code: 0,
            rip: regs.rip,
            interrupted_event: InterruptedEvent::decode(
                exit_int_info,
                (exit_int_info >> 32) as u32,
                instruction_length,
            ),
        })
    }

    fn instruction_error(&self) -> u64 {
        self.read(CTRL_EXIT_CODE)
    }

    fn inject_interrupt(&mut self, vector: u8) -> crate::Result<()> {
        const VALID: u64 = 1 << 31;
        const TYPE_INTR: u64 = 0 << 8;
        self.write(CTRL_EVENT_INJECTION, u64::from(vector) | TYPE_INTR | VALID);
        Ok(())
    }

    /// EVENTINJ carries the error code in its upper half.
    fn reinject_event(&mut self, event: &InterruptedEvent) -> crate::Result<()> {
        let error_code = u64::from(event.error_code.unwrap_or(0)) << 32;
        self.write(
            CTRL_EVENT_INJECTION,
            event.encode(event.kind.svm_type()) | error_code,
        );
        Ok(())
    }

    fn set_interrupt_window_exiting(&mut self, enabled: bool) -> crate::Result<()> {
        const V_IRQ: u64 = 1 << 8;
        const V_INTR_PRIO: u64 = 0xf << 16;

        let misc1: u32 = self.read(CTRL_INTERCEPT_MISC1);
        if enabled {
            self.write(CTRL_V_INTR, V_IRQ | V_INTR_PRIO);
            self.write(CTRL_INTERCEPT_MISC1, misc1 | INTERCEPT_VINTR);
        } else {
            self.write(CTRL_V_INTR, 0u64);
            self.write(CTRL_INTERCEPT_MISC1, misc1 & !INTERCEPT_VINTR);
        }
        Ok(())
    }

    fn interrupt_shadow(&self) -> crate::Result<bool> {
        let shadow: u64 = self.read(CTRL_INTERRUPT_SHADOW);
        Ok(shadow & 1 != 0)
    }

    fn guest_field(&self, field: GuestField) -> crate::Result<u64> {
        let value: u64 = self.read(Self::field_offset(field));
        Ok(if field == GuestField::Efer { value & !EFER_SVME } else { value })
    }

    fn set_guest_field(&mut self, field: GuestField, value: u64) -> crate::Result<()> {
        let value = if field == GuestField::Efer { value | EFER_SVME } else { value };
        self.write(Self::field_offset(field), value);
        Ok(())
    }

    fn invalidate_caches(&mut self) {
        const FLUSH_ALL: u32 = 1;
        self.write(CTRL_TLB_CONTROL, FLUSH_ALL);
    }

    fn nps_entry_flags(
        &self,
        entry_type: NestedPagingStructureEntryType,
    ) -> NestedPagingStructureEntryFlags {
        const PRESENT: u8 = 0b001;
        const WRITE: u8 = 0b010;
        const USER: u8 = 0b100;
        // PWT and PCD.
        const UNCACHED: u8 = 0b011;

        let (permission, memory_type, no_execute) = match entry_type {
            NestedPagingStructureEntryType::Table | NestedPagingStructureEntryType::Rwx => {
                (PRESENT | WRITE | USER, 0, false)
            }
            NestedPagingStructureEntryType::Rw => (PRESENT | WRITE | USER, 0, true),
            NestedPagingStructureEntryType::Rx => (PRESENT | USER, 0, false),
            NestedPagingStructureEntryType::R => (PRESENT | USER, 0, true),
            NestedPagingStructureEntryType::UncachedRw => (PRESENT | WRITE | USER, UNCACHED, true),
            NestedPagingStructureEntryType::UncachedR => (PRESENT | USER, UNCACHED, true),
        };
        NestedPagingStructureEntryFlags {
            permission,
            memory_type,
            no_execute,
        }
    }
}

/// Length of the intercepted instruction. NRIP is only written for
/// instruction intercepts and reads as zero otherwise.
fn instruction_length(rip: u64, nrip: u64) -> u64 {
    if nrip == 0 {
        0
    } else {
        nrip.wrapping_sub(rip)
    }
}

/// Translates the SVM exit code and information into an [`ExitReason`].
fn decode_exit(code: u64, info1: u64, info2: u64) -> crate::Result<ExitReason> {
    let reason = match code {
        exit_code::CR_FIRST..=exit_code::CR_LAST => {
            ExitReason::ControlRegisterAccess(decode_cr_access(code, info1)?)
        }
        exit_code::EXCEPTION_FIRST..=exit_code::EXCEPTION_LAST => {
            ExitReason::Exception((code - exit_code::EXCEPTION_FIRST) as u8)
        }
        exit_code::INTR => ExitReason::ExternalInterrupt,
        exit_code::NMI => ExitReason::Nmi,
        exit_code::VINTR => ExitReason::InterruptWindow,
        exit_code::CPUID => ExitReason::Cpuid,
        exit_code::PAUSE => ExitReason::Pause,
        exit_code::HLT => ExitReason::Hlt,
        exit_code::IOIO => ExitReason::Io(decode_io(info1)?),
        exit_code::MSR => {
            if info1 == 0 {
                ExitReason::MsrRead
            } else {
                ExitReason::MsrWrite
            }
        }
        exit_code::SHUTDOWN => ExitReason::Shutdown,
        exit_code::VMMCALL => ExitReason::Hypercall,
        exit_code::NPF => ExitReason::NestedPageFault(decode_npf(info1, info2)),
        exit_code::INVALID => ExitReason::InvalidGuestState,
        _ => ExitReason::Unexpected(code),
    };
    Ok(reason)
}

/// Decodes EXITINFO1 of an IOIO intercept (APM Vol. 2, 15.10.2).
fn decode_io(info1: u64) -> crate::Result<IoAccess> {
    let size = match (info1 >> 4) & 0b111 {
        0b001 => 1,
        0b010 => 2,
        0b100 => 4,
        _ => return Err(HypervisorError::MalformedExit("IO access size")),
    };
    Ok(IoAccess {
        port: (info1 >> 16) as u16,
        size,
        input: info1 & (1 << 0) != 0,
        string: info1 & (1 << 2) != 0,
        rep: info1 & (1 << 3) != 0,
    })
}

/// Decodes a CR read/write intercept. Requires decode assists.
fn decode_cr_access(code: u64, info1: u64) -> crate::Result<CrAccess> {
    const MOV_CR_VALID: u64 = 1 << 63;
    if info1 & MOV_CR_VALID == 0 {
        return Err(HypervisorError::MalformedExit("CR access without decode assist"));
    }
    Ok(CrAccess {
        cr: (code & 0xf) as u8,
        access: if code & 0x10 == 0 {
            CrAccessType::MovFromCr
        } else {
            CrAccessType::MovToCr
        },
        gpr: (info1 & 0xf) as u8,
    })
}

/// Decodes a nested page fault: EXITINFO1 is the #PF-style error code and
/// EXITINFO2 the faulting guest physical address.
fn decode_npf(info1: u64, info2: u64) -> NestedPageFault {
    let write = info1 & (1 << 1) != 0;
    let fetch = info1 & (1 << 4) != 0;
    NestedPageFault {
        gpa: info2,
        read: !write && !fetch,
        write,
        fetch,
        present: info1 & (1 << 0) != 0,
    }
}
