//! The module containing the Intel VMX backend.

use super::{
    context_switch::{self, VmxEntryFailure, TRAMPOLINE_SLOTS},
    get_system_segment_base, CrAccess, CrAccessType, ExitReason, ExitSnapshot, GuestField,
    HardwareVt, InterruptedEvent, IoAccess, NestedPageFault, NestedPagingStructureEntryFlags,
    NestedPagingStructureEntryType, Vendor,
};
use crate::{
    control_block::{ControlBlockConfig, MsrEntry, SWITCHED_MSRS},
    error::HypervisorError,
    frames::FrameAllocator,
    state::GuestRegisters,
    x86_data::SegmentState,
    x86_instructions::{
        cpuid, cr0, cr0_write, cr3, cr4, cr4_write, invept_single_context, rdmsr,
        segment_selectors, sgdt, sidt, wrmsr,
    },
};
use alloc::sync::Arc;
use log::trace;
use x86::{
    controlregs::{Cr0, Cr4},
    dtables::DescriptorTablePointer,
    msr,
    vmx::vmcs::{
        control::{
            self, EntryControls, ExitControls, PinbasedControls, PrimaryControls,
            SecondaryControls,
        },
        guest, host, ro,
    },
};

/// Basic VM exit reasons, Appendix C.
mod exit_reason {
    pub const EXCEPTION_OR_NMI: u16 = 0;
    pub const EXTERNAL_INTERRUPT: u16 = 1;
    pub const TRIPLE_FAULT: u16 = 2;
    pub const INTERRUPT_WINDOW: u16 = 7;
    pub const CPUID: u16 = 10;
    pub const HLT: u16 = 12;
    pub const VMCALL: u16 = 18;
    pub const CR_ACCESS: u16 = 28;
    pub const IO_INSTRUCTION: u16 = 30;
    pub const RDMSR: u16 = 31;
    pub const WRMSR: u16 = 32;
    pub const INVALID_GUEST_STATE: u16 = 33;
    pub const MSR_LOADING: u16 = 34;
    pub const PAUSE: u16 = 40;
    pub const EPT_VIOLATION: u16 = 48;
    pub const EPT_MISCONFIGURATION: u16 = 49;
}

const EPT_MEMORY_TYPE_WB: u8 = 6;
const EPT_MEMORY_TYPE_UC: u8 = 0;

/// The Intel VMX backend. One instance manages one VMCS.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Vmx {
    #[derivative(Debug = "ignore")]
    memory: Arc<dyn FrameAllocator>,
    /// VMCS revision identifier from IA32_VMX_BASIC.
    revision_id: u32,
    /// Whether the current VMCS has been launched since the last VMCLEAR.
    launched: bool,
    /// Physical address of the guest MSR area (exit store / entry load).
    guest_msrs: u64,
    eptp: u64,
}

impl Vmx {
    pub fn new(memory: Arc<dyn FrameAllocator>) -> crate::Result<Self> {
        const CPUID_1_ECX_VMX: u32 = 1 << 5;
        const EPT_CAP_WALK_LENGTH_4: u64 = 1 << 6;
        const EPT_CAP_WRITE_BACK: u64 = 1 << 14;

        if cpuid(1, 0)[2] & CPUID_1_ECX_VMX == 0 {
            return Err(HypervisorError::VirtualizationUnsupported("VMX"));
        }
        let secondary_allowed1 = rdmsr(msr::IA32_VMX_PROCBASED_CTLS2) >> 32;
        if secondary_allowed1 & u64::from(SecondaryControls::ENABLE_EPT.bits()) == 0 {
            return Err(HypervisorError::VirtualizationUnsupported("EPT"));
        }
        let ept_caps = rdmsr(msr::IA32_VMX_EPT_VPID_CAP);
        if ept_caps & EPT_CAP_WALK_LENGTH_4 == 0 || ept_caps & EPT_CAP_WRITE_BACK == 0 {
            return Err(HypervisorError::VirtualizationUnsupported("4-level write-back EPT"));
        }

        Ok(Self {
            memory,
            revision_id: rdmsr(msr::IA32_VMX_BASIC) as u32 & 0x7fff_ffff,
            launched: false,
            guest_msrs: 0,
            eptp: 0,
        })
    }

    fn write_revision_id(&self, pa: u64) {
        let ptr = self.memory.physical_to_virtual(pa).cast::<u32>();
        // Safety: `pa` is a VMXON region or VMCS owned by the VM.
        unsafe { ptr.write_volatile(self.revision_id) };
    }

    fn uses_true_controls() -> bool {
        rdmsr(msr::IA32_VMX_BASIC) & (1 << 55) != 0
    }

    fn apply_host_state(config: &ControlBlockConfig) -> crate::Result<()> {
        let mut gdtr = DescriptorTablePointer::<u64>::default();
        let mut idtr = DescriptorTablePointer::<u64>::default();
        sgdt(&mut gdtr);
        sidt(&mut idtr);
        let [es, cs, ss, ds, fs, gs, tr] = segment_selectors();

        vmwrite(host::CR0, cr0().bits() as u64)?;
        vmwrite(host::CR3, cr3())?;
        vmwrite(host::CR4, cr4().bits() as u64)?;

        // RPL and TI must be zero in host selectors.
        vmwrite(host::ES_SELECTOR, es.bits() & !0x7)?;
        vmwrite(host::CS_SELECTOR, cs.bits() & !0x7)?;
        vmwrite(host::SS_SELECTOR, ss.bits() & !0x7)?;
        vmwrite(host::DS_SELECTOR, ds.bits() & !0x7)?;
        vmwrite(host::FS_SELECTOR, fs.bits() & !0x7)?;
        vmwrite(host::GS_SELECTOR, gs.bits() & !0x7)?;
        vmwrite(host::TR_SELECTOR, tr.bits() & !0x7)?;

        vmwrite(host::FS_BASE, rdmsr(msr::IA32_FS_BASE))?;
        vmwrite(host::GS_BASE, rdmsr(msr::IA32_GS_BASE))?;
        vmwrite(host::TR_BASE, get_system_segment_base(gdtr.base as u64, tr.bits()))?;
        vmwrite(host::GDTR_BASE, gdtr.base as u64)?;
        vmwrite(host::IDTR_BASE, idtr.base as u64)?;

        vmwrite(host::IA32_SYSENTER_CS, rdmsr(msr::IA32_SYSENTER_CS))?;
        vmwrite(host::IA32_SYSENTER_ESP, rdmsr(msr::IA32_SYSENTER_ESP))?;
        vmwrite(host::IA32_SYSENTER_EIP, rdmsr(msr::IA32_SYSENTER_EIP))?;
        vmwrite(host::IA32_EFER_FULL, rdmsr(msr::IA32_EFER))?;
        vmwrite(host::IA32_PAT_FULL, rdmsr(msr::IA32_PAT))?;

        vmwrite(host::RSP, config.host.registers - TRAMPOLINE_SLOTS)?;
        vmwrite(host::RIP, context_switch::vmx_exit_trampoline())?;
        Ok(())
    }

    fn apply_guest_state(config: &ControlBlockConfig) -> crate::Result<()> {
        let state = &config.guest;
        let segments: [(&SegmentState, u32, u32, u32, u32); 8] = [
            (&state.es, guest::ES_SELECTOR, guest::ES_BASE, guest::ES_LIMIT, guest::ES_ACCESS_RIGHTS),
            (&state.cs, guest::CS_SELECTOR, guest::CS_BASE, guest::CS_LIMIT, guest::CS_ACCESS_RIGHTS),
            (&state.ss, guest::SS_SELECTOR, guest::SS_BASE, guest::SS_LIMIT, guest::SS_ACCESS_RIGHTS),
            (&state.ds, guest::DS_SELECTOR, guest::DS_BASE, guest::DS_LIMIT, guest::DS_ACCESS_RIGHTS),
            (&state.fs, guest::FS_SELECTOR, guest::FS_BASE, guest::FS_LIMIT, guest::FS_ACCESS_RIGHTS),
            (&state.gs, guest::GS_SELECTOR, guest::GS_BASE, guest::GS_LIMIT, guest::GS_ACCESS_RIGHTS),
            (&state.ldtr, guest::LDTR_SELECTOR, guest::LDTR_BASE, guest::LDTR_LIMIT, guest::LDTR_ACCESS_RIGHTS),
            (&state.tr, guest::TR_SELECTOR, guest::TR_BASE, guest::TR_LIMIT, guest::TR_ACCESS_RIGHTS),
        ];
        for (segment, selector, base, limit, access_rights) in segments {
            vmwrite(selector, segment.selector)?;
            vmwrite(base, segment.base)?;
            vmwrite(limit, segment.limit)?;
            vmwrite(access_rights, segment.vmx_access_rights())?;
        }

        vmwrite(guest::GDTR_BASE, state.gdtr_base)?;
        vmwrite(guest::GDTR_LIMIT, state.gdtr_limit)?;
        vmwrite(guest::IDTR_BASE, state.idtr_base)?;
        vmwrite(guest::IDTR_LIMIT, state.idtr_limit)?;

        let cr0 = adjust_cr0(state.cr0);
        let cr4 = adjust_cr4(state.cr4);
        vmwrite(guest::CR0, cr0)?;
        vmwrite(guest::CR3, state.cr3)?;
        vmwrite(guest::CR4, cr4)?;
        // Bits the processor requires stay owned by the host; the guest reads
        // the values it asked for.
        vmwrite(control::CR0_GUEST_HOST_MASK, rdmsr(msr::IA32_VMX_CR0_FIXED0))?;
        vmwrite(control::CR0_READ_SHADOW, state.cr0)?;
        vmwrite(control::CR4_GUEST_HOST_MASK, rdmsr(msr::IA32_VMX_CR4_FIXED0))?;
        vmwrite(control::CR4_READ_SHADOW, state.cr4)?;

        vmwrite(guest::DR7, state.dr7)?;
        vmwrite(guest::RSP, state.rsp)?;
        vmwrite(guest::RIP, state.rip)?;
        vmwrite(guest::RFLAGS, state.rflags)?;
        vmwrite(guest::IA32_EFER_FULL, state.efer)?;
        vmwrite(guest::IA32_PAT_FULL, state.pat)?;
        vmwrite(guest::IA32_DEBUGCTL_FULL, 0u64)?;
        vmwrite(guest::IA32_SYSENTER_CS, 0u64)?;
        vmwrite(guest::IA32_SYSENTER_ESP, 0u64)?;
        vmwrite(guest::IA32_SYSENTER_EIP, 0u64)?;
        vmwrite(guest::LINK_PTR_FULL, u64::MAX)?;
        vmwrite(guest::INTERRUPTIBILITY_STATE, 0u64)?;
        vmwrite(guest::ACTIVITY_STATE, 0u64)?;
        vmwrite(guest::PENDING_DBG_EXCEPTIONS, 0u64)?;
        Ok(())
    }

    fn apply_controls(&mut self, config: &ControlBlockConfig) -> crate::Result<()> {
        let true_controls = Self::uses_true_controls();
        let capability = |true_msr: u32, legacy_msr: u32| {
            rdmsr(if true_controls { true_msr } else { legacy_msr })
        };
        let wanted = &config.controls;

        let mut pin = PinbasedControls::empty();
        pin.set(PinbasedControls::EXTERNAL_INTERRUPT_EXITING, wanted.external_interrupt_exiting);
        pin.set(PinbasedControls::NMI_EXITING, wanted.nmi_exiting);
        let pin = adjust_vmx_control(
            u64::from(pin.bits()),
            capability(msr::IA32_VMX_TRUE_PINBASED_CTLS, msr::IA32_VMX_PINBASED_CTLS),
        );

        let mut primary = PrimaryControls::USE_IO_BITMAPS
            | PrimaryControls::USE_MSR_BITMAPS
            | PrimaryControls::SECONDARY_CONTROLS;
        primary.set(PrimaryControls::HLT_EXITING, wanted.hlt_exiting);
        primary.set(PrimaryControls::PAUSE_EXITING, wanted.pause_exiting);
        let required_primary = u64::from(primary.bits());
        let primary = adjust_vmx_control(
            required_primary,
            capability(msr::IA32_VMX_TRUE_PROCBASED_CTLS, msr::IA32_VMX_PROCBASED_CTLS),
        );

        let secondary = SecondaryControls::ENABLE_EPT
            | SecondaryControls::ENABLE_VPID
            | SecondaryControls::ENABLE_RDTSCP;
        let secondary = adjust_vmx_control(
            u64::from(secondary.bits()),
            rdmsr(msr::IA32_VMX_PROCBASED_CTLS2),
        );

        let exit = ExitControls::HOST_ADDRESS_SPACE_SIZE
            | ExitControls::SAVE_IA32_EFER
            | ExitControls::LOAD_IA32_EFER
            | ExitControls::SAVE_IA32_PAT
            | ExitControls::LOAD_IA32_PAT;
        let required_exit = u64::from(exit.bits());
        let exit = adjust_vmx_control(
            required_exit,
            capability(msr::IA32_VMX_TRUE_EXIT_CTLS, msr::IA32_VMX_EXIT_CTLS),
        );

        let entry = EntryControls::IA32E_MODE_GUEST
            | EntryControls::LOAD_IA32_EFER
            | EntryControls::LOAD_IA32_PAT;
        let required_entry = u64::from(entry.bits());
        let entry = adjust_vmx_control(
            required_entry,
            capability(msr::IA32_VMX_TRUE_ENTRY_CTLS, msr::IA32_VMX_ENTRY_CTLS),
        );

        if primary & required_primary != required_primary {
            return Err(HypervisorError::VirtualizationUnsupported("VMX bitmaps"));
        }
        if exit & required_exit != required_exit || entry & required_entry != required_entry {
            return Err(HypervisorError::VirtualizationUnsupported("VMX EFER/PAT switching"));
        }

        trace!("VMX controls: pin {pin:#x} primary {primary:#x} secondary {secondary:#x}");
        trace!("VMX controls: exit {exit:#x} entry {entry:#x}");
        vmwrite(control::PINBASED_EXEC_CONTROLS, pin)?;
        vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, primary)?;
        vmwrite(control::SECONDARY_PROCBASED_EXEC_CONTROLS, secondary)?;
        vmwrite(control::VMEXIT_CONTROLS, exit)?;
        vmwrite(control::VMENTRY_CONTROLS, entry)?;
        vmwrite(control::EXCEPTION_BITMAP, wanted.exception_bitmap)?;

        vmwrite(control::IO_BITMAP_A_ADDR_FULL, config.io_bitmap)?;
        vmwrite(control::IO_BITMAP_B_ADDR_FULL, config.io_bitmap + 0x1000)?;
        vmwrite(control::MSR_BITMAPS_ADDR_FULL, config.msr_bitmap)?;

        self.write_msr_areas(config);
        let count = SWITCHED_MSRS.len() as u64;
        vmwrite(control::VMEXIT_MSR_STORE_ADDR_FULL, config.guest_msrs)?;
        vmwrite(control::VMEXIT_MSR_STORE_COUNT, count)?;
        vmwrite(control::VMENTRY_MSR_LOAD_ADDR_FULL, config.guest_msrs)?;
        vmwrite(control::VMENTRY_MSR_LOAD_COUNT, count)?;
        vmwrite(control::VMEXIT_MSR_LOAD_ADDR_FULL, config.host_msrs)?;
        vmwrite(control::VMEXIT_MSR_LOAD_COUNT, count)?;

        // 4-level walk, write-back paging structures.
        self.eptp = config.nested_root | (3 << 3) | u64::from(EPT_MEMORY_TYPE_WB);
        vmwrite(control::EPTP_FULL, self.eptp)?;
        if secondary & u64::from(SecondaryControls::ENABLE_VPID.bits()) != 0 {
            vmwrite(control::VPID, config.asid as u64)?;
        }
        Ok(())
    }

    /// Seeds the guest area with the switched MSR indexes and zero values,
    /// and the host area with the current host values.
    fn write_msr_areas(&mut self, config: &ControlBlockConfig) {
        self.guest_msrs = config.guest_msrs;
        for (i, &index) in SWITCHED_MSRS.iter().enumerate() {
            let offset = (i * size_of::<MsrEntry>()) as u64;
            let guest = MsrEntry::new(index, 0);
            let host = MsrEntry::new(index, rdmsr(index));
            let guest_ptr = self.memory.physical_to_virtual(config.guest_msrs + offset);
            let host_ptr = self.memory.physical_to_virtual(config.host_msrs + offset);
            // Safety: both areas are frames owned by this VM and hold one
            // entry per switched MSR.
            unsafe {
                guest_ptr.cast::<MsrEntry>().write_volatile(guest);
                host_ptr.cast::<MsrEntry>().write_volatile(host);
            }
        }
    }

    fn guest_msr_slot(&self, field: GuestField) -> Option<*mut MsrEntry> {
        let index = match field {
            GuestField::KernelGsBase => msr::IA32_KERNEL_GSBASE,
            GuestField::Star => msr::IA32_STAR,
            GuestField::Lstar => msr::IA32_LSTAR,
            GuestField::Cstar => msr::IA32_CSTAR,
            GuestField::Sfmask => msr::IA32_FMASK,
            _ => return None,
        };
        let slot = SWITCHED_MSRS.iter().position(|&m| m == index)?;
        let pa = self.guest_msrs + (slot * size_of::<MsrEntry>()) as u64;
        Some(self.memory.physical_to_virtual(pa).cast())
    }

    fn read_exit_snapshot(&self) -> crate::Result<ExitSnapshot> {
        let raw_reason = vmread(ro::EXIT_REASON)?;
        let qualification = vmread(ro::EXIT_QUALIFICATION)?;
        let guest_physical_address = vmread(ro::GUEST_PHYSICAL_ADDR_FULL)?;
        let interruption_info = vmread(ro::VMEXIT_INTERRUPTION_INFO)?;
        let reason = decode_exit(raw_reason, qualification, guest_physical_address, interruption_info)?;
        let instruction_length = vmread(ro::VMEXIT_INSTRUCTION_LEN)?;
        let interrupted_event = InterruptedEvent::decode(
            vmread(ro::IDT_VECTORING_INFO)?,
            vmread(ro::IDT_VECTORING_ERR_CODE)? as u32,
            instruction_length,
        );
        Ok(ExitSnapshot {
            reason,
            raw_reason,
            qualification,
            guest_linear_address: vmread(ro::GUEST_LINEAR_ADDR)?,
            guest_physical_address,
            instruction_length,
            instruction_info: vmread(ro::VMEXIT_INSTRUCTION_INFO)?,
            interruption_info,
            error_code: vmread(ro::VMEXIT_INTERRUPTION_ERR_CODE)?,
            rip: vmread(guest::RIP)?,
            interrupted_event,
        })
    }
}

impl HardwareVt for Vmx {
    fn vendor(&self) -> Vendor {
        Vendor::Intel
    }

    fn enable(&mut self, host_area: u64) -> crate::Result<()> {
        const LOCKED: u64 = 1 << 0;
        const VMXON_OUTSIDE_SMX: u64 = 1 << 2;

        let feature_control = rdmsr(msr::IA32_FEATURE_CONTROL);
        if feature_control & LOCKED == 0 {
            wrmsr(msr::IA32_FEATURE_CONTROL, feature_control | VMXON_OUTSIDE_SMX | LOCKED);
        } else if feature_control & VMXON_OUTSIDE_SMX == 0 {
            return Err(HypervisorError::VirtualizationLocked);
        }

        cr0_write(Cr0::from_bits_truncate(adjust_cr0(cr0().bits() as u64) as usize));
        cr4_write(Cr4::from_bits_truncate(
            adjust_cr4((cr4() | Cr4::CR4_ENABLE_VMX).bits() as u64) as usize,
        ));

        self.write_revision_id(host_area);
        // Safety: `host_area` is a zeroed, page aligned VMXON region.
        unsafe { x86::bits64::vmx::vmxon(host_area) }
            .map_err(|_| HypervisorError::VmInstructionFailed { instruction: "VMXON" })
    }

    fn disable(&mut self) {
        // Safety: only called after a successful `enable`.
        if unsafe { x86::bits64::vmx::vmxoff() }.is_ok() {
            cr4_write(cr4() - Cr4::CR4_ENABLE_VMX);
        }
    }

    fn load(&mut self, control_block: u64) -> crate::Result<()> {
        self.write_revision_id(control_block);
        // Safety: `control_block` is a VMCS region owned by this VM.
        unsafe { x86::bits64::vmx::vmptrld(control_block) }
            .map_err(|_| HypervisorError::VmInstructionFailed { instruction: "VMPTRLD" })
    }

    fn clear(&mut self, control_block: u64) -> crate::Result<()> {
        self.launched = false;
        // Safety: `control_block` is a VMCS region owned by this VM.
        unsafe { x86::bits64::vmx::vmclear(control_block) }
            .map_err(|_| HypervisorError::VmInstructionFailed { instruction: "VMCLEAR" })
    }

    fn apply(&mut self, config: &ControlBlockConfig) -> crate::Result<()> {
        Self::apply_host_state(config)?;
        Self::apply_guest_state(config)?;
        self.apply_controls(config)
    }

    fn reload_host_state(&mut self, config: &ControlBlockConfig) -> crate::Result<()> {
        Self::apply_host_state(config)
    }

    fn enter(&mut self, regs: &mut GuestRegisters) -> crate::Result<ExitSnapshot> {
        vmwrite(guest::RIP, regs.rip)?;
        vmwrite(guest::RSP, regs.rsp)?;
        vmwrite(guest::RFLAGS, regs.rflags)?;

        // Safety: `apply` pointed HOST_RSP and HOST_RIP at the trampoline
        // slots below `regs`, which lives at the top of the exit stack.
        match unsafe { context_switch::vmx_enter(regs, self.launched) } {
            Ok(()) => {}
            Err(VmxEntryFailure::Invalid) => return Err(HypervisorError::EntryFailed(0)),
            Err(VmxEntryFailure::Valid) => {
                return Err(HypervisorError::EntryFailed(self.instruction_error()))
            }
        }
        self.launched = true;

        regs.rip = vmread(guest::RIP)?;
        regs.rsp = vmread(guest::RSP)?;
        regs.rflags = vmread(guest::RFLAGS)?;
        self.read_exit_snapshot()
    }

    fn instruction_error(&self) -> u64 {
        vmread(ro::VM_INSTRUCTION_ERROR).unwrap_or(0)
    }

    fn inject_interrupt(&mut self, vector: u8) -> crate::Result<()> {
        const VALID: u64 = 1 << 31;
        const TYPE_EXTERNAL_INTERRUPT: u64 = 0 << 8;
        vmwrite(
            control::VMENTRY_INTERRUPTION_INFO_FIELD,
            u64::from(vector) | TYPE_EXTERNAL_INTERRUPT | VALID,
        )
    }

    fn reinject_event(&mut self, event: &InterruptedEvent) -> crate::Result<()> {
        if let Some(error_code) = event.error_code {
            vmwrite(control::VMENTRY_EXCEPTION_ERR_CODE, error_code)?;
        }
        if event.kind.is_software() {
            vmwrite(control::VMENTRY_INSTRUCTION_LEN, event.instruction_length)?;
        }
        vmwrite(
            control::VMENTRY_INTERRUPTION_INFO_FIELD,
            event.encode(event.kind.vmx_type()),
        )
    }

    fn set_interrupt_window_exiting(&mut self, enabled: bool) -> crate::Result<()> {
        let window = u64::from(PrimaryControls::INTERRUPT_WINDOW_EXITING.bits());
        let primary = vmread(control::PRIMARY_PROCBASED_EXEC_CONTROLS)?;
        let updated = if enabled { primary | window } else { primary & !window };
        if updated != primary {
            vmwrite(control::PRIMARY_PROCBASED_EXEC_CONTROLS, updated)?;
        }
        Ok(())
    }

    fn interrupt_shadow(&self) -> crate::Result<bool> {
        const BLOCKING_BY_STI: u64 = 1 << 0;
        const BLOCKING_BY_MOV_SS: u64 = 1 << 1;
        let state = vmread(guest::INTERRUPTIBILITY_STATE)?;
        Ok(state & (BLOCKING_BY_STI | BLOCKING_BY_MOV_SS) != 0)
    }

    fn guest_field(&self, field: GuestField) -> crate::Result<u64> {
        if let Some(slot) = self.guest_msr_slot(field) {
            // Safety: the slot lies in the guest MSR area written by `apply`.
            return Ok(unsafe { (*slot).value });
        }
        vmread(match field {
            GuestField::Cr0 => control::CR0_READ_SHADOW,
            GuestField::Cr3 => guest::CR3,
            GuestField::Cr4 => control::CR4_READ_SHADOW,
            GuestField::Efer => guest::IA32_EFER_FULL,
            GuestField::FsBase => guest::FS_BASE,
            _ => guest::GS_BASE,
        })
    }

    fn set_guest_field(&mut self, field: GuestField, value: u64) -> crate::Result<()> {
        const EFER_LMA: u64 = 1 << 10;

        if let Some(slot) = self.guest_msr_slot(field) {
            // Safety: the slot lies in the guest MSR area written by `apply`.
            unsafe { (*slot).value = value };
            return Ok(());
        }
        match field {
            GuestField::Cr0 => {
                vmwrite(control::CR0_READ_SHADOW, value)?;
                vmwrite(guest::CR0, adjust_cr0(value))
            }
            GuestField::Cr3 => vmwrite(guest::CR3, value),
            GuestField::Cr4 => {
                vmwrite(control::CR4_READ_SHADOW, value)?;
                vmwrite(guest::CR4, adjust_cr4(value))
            }
            GuestField::Efer => {
                let ia32e = u64::from(EntryControls::IA32E_MODE_GUEST.bits());
                let entry = vmread(control::VMENTRY_CONTROLS)?;
                let entry = if value & EFER_LMA != 0 { entry | ia32e } else { entry & !ia32e };
                vmwrite(control::VMENTRY_CONTROLS, entry)?;
                vmwrite(guest::IA32_EFER_FULL, value)
            }
            GuestField::FsBase => vmwrite(guest::FS_BASE, value),
            _ => vmwrite(guest::GS_BASE, value),
        }
    }

    fn invalidate_caches(&mut self) {
        invept_single_context(self.eptp);
    }

    fn nps_entry_flags(
        &self,
        entry_type: NestedPagingStructureEntryType,
    ) -> NestedPagingStructureEntryFlags {
        const READ: u8 = 0b001;
        const WRITE: u8 = 0b010;
        const EXECUTE: u8 = 0b100;

        let (permission, memory_type) = match entry_type {
            NestedPagingStructureEntryType::Table => (READ | WRITE | EXECUTE, 0),
            NestedPagingStructureEntryType::Rwx => (READ | WRITE | EXECUTE, EPT_MEMORY_TYPE_WB),
            NestedPagingStructureEntryType::Rw => (READ | WRITE, EPT_MEMORY_TYPE_WB),
            NestedPagingStructureEntryType::Rx => (READ | EXECUTE, EPT_MEMORY_TYPE_WB),
            NestedPagingStructureEntryType::R => (READ, EPT_MEMORY_TYPE_WB),
            NestedPagingStructureEntryType::UncachedRw => (READ | WRITE, EPT_MEMORY_TYPE_UC),
            NestedPagingStructureEntryType::UncachedR => (READ, EPT_MEMORY_TYPE_UC),
        };
        NestedPagingStructureEntryFlags {
            permission,
            memory_type,
            no_execute: false,
        }
    }
}

fn vmwrite<T: Into<u64>>(field: u32, value: T) -> crate::Result<()> {
    // Safety: the backend only writes fields while its VMCS is current.
    unsafe { x86::bits64::vmx::vmwrite(field, value.into()) }
        .map_err(|_| HypervisorError::ControlBlockWrite { field })
}

fn vmread(field: u32) -> crate::Result<u64> {
    // Safety: the backend only reads fields while its VMCS is current.
    unsafe { x86::bits64::vmx::vmread(field) }
        .map_err(|_| HypervisorError::VmInstructionFailed { instruction: "VMREAD" })
}

/// Adjusts a VMX control value: bits the processor requires are set (allowed
/// 0-settings, low dword of the capability MSR) and bits it does not support
/// are cleared (allowed 1-settings, high dword).
fn adjust_vmx_control(desired: u64, capability: u64) -> u64 {
    let allowed0 = capability & 0xffff_ffff;
    let allowed1 = capability >> 32;
    (desired | allowed0) & allowed1
}

fn adjust_cr0(value: u64) -> u64 {
    (value | rdmsr(msr::IA32_VMX_CR0_FIXED0)) & rdmsr(msr::IA32_VMX_CR0_FIXED1)
}

fn adjust_cr4(value: u64) -> u64 {
    (value | rdmsr(msr::IA32_VMX_CR4_FIXED0)) & rdmsr(msr::IA32_VMX_CR4_FIXED1)
}

/// Translates the VMX exit information into an [`ExitReason`].
fn decode_exit(
    raw_reason: u64,
    qualification: u64,
    guest_physical_address: u64,
    interruption_info: u64,
) -> crate::Result<ExitReason> {
    const INTERRUPTION_TYPE_NMI: u64 = 2;

    let reason = match raw_reason as u16 {
        exit_reason::EXCEPTION_OR_NMI => {
            if (interruption_info >> 8) & 0b111 == INTERRUPTION_TYPE_NMI {
                ExitReason::Nmi
            } else {
                ExitReason::Exception(interruption_info as u8)
            }
        }
        exit_reason::EXTERNAL_INTERRUPT => ExitReason::ExternalInterrupt,
        exit_reason::TRIPLE_FAULT => ExitReason::Shutdown,
        exit_reason::INTERRUPT_WINDOW => ExitReason::InterruptWindow,
        exit_reason::CPUID => ExitReason::Cpuid,
        exit_reason::HLT => ExitReason::Hlt,
        exit_reason::VMCALL => ExitReason::Hypercall,
        exit_reason::CR_ACCESS => ExitReason::ControlRegisterAccess(decode_cr_access(qualification)),
        exit_reason::IO_INSTRUCTION => ExitReason::Io(decode_io(qualification)?),
        exit_reason::RDMSR => ExitReason::MsrRead,
        exit_reason::WRMSR => ExitReason::MsrWrite,
        exit_reason::INVALID_GUEST_STATE | exit_reason::MSR_LOADING => ExitReason::InvalidGuestState,
        exit_reason::PAUSE => ExitReason::Pause,
        exit_reason::EPT_VIOLATION => {
            ExitReason::NestedPageFault(decode_ept_violation(qualification, guest_physical_address))
        }
        exit_reason::EPT_MISCONFIGURATION => ExitReason::NestedPagingMisconfiguration,
        _ => ExitReason::Unexpected(raw_reason),
    };
    Ok(reason)
}

/// Decodes the exit qualification of an IO instruction (Table 28-5).
fn decode_io(qualification: u64) -> crate::Result<IoAccess> {
    let size = match qualification & 0b111 {
        0 => 1,
        1 => 2,
        3 => 4,
        _ => return Err(HypervisorError::MalformedExit("IO access size")),
    };
    Ok(IoAccess {
        port: (qualification >> 16) as u16,
        size,
        input: qualification & (1 << 3) != 0,
        string: qualification & (1 << 4) != 0,
        rep: qualification & (1 << 5) != 0,
    })
}

/// Decodes the exit qualification of a control-register access (Table 28-3).
fn decode_cr_access(qualification: u64) -> CrAccess {
    CrAccess {
        cr: (qualification & 0xf) as u8,
        access: match (qualification >> 4) & 0b11 {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            _ => CrAccessType::Other,
        },
        gpr: ((qualification >> 8) & 0xf) as u8,
    }
}

/// Decodes the exit qualification of an EPT violation (Table 28-7).
fn decode_ept_violation(qualification: u64, gpa: u64) -> NestedPageFault {
    NestedPageFault {
        gpa,
        read: qualification & (1 << 0) != 0,
        write: qualification & (1 << 1) != 0,
        fetch: qualification & (1 << 2) != 0,
        present: qualification & 0b11_1000 != 0,
    }
}
