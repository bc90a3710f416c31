//! The vendor-neutral face of the VMX and SVM backends: the backend trait,
//! decoded exit information and the shared nested paging entry format.

pub mod context_switch;
pub mod svm;
pub mod vmx;

use crate::{control_block::ControlBlockConfig, frames::FrameAllocator, state::GuestRegisters};
use alloc::{boxed::Box, sync::Arc};
use bitfield::bitfield;
use core::fmt;
use log::trace;
use serde::Serialize;
use x86::current::paging::PAGE_SIZE_ENTRIES;

/// One VM's view of the processor's virtualization extension. A backend owns
/// nothing but its vendor state; frames come from the VM's frame table.
///
/// Every method except [`HardwareVt::enable`] requires the processor to be in
/// root mode, and the guest-state accessors require the control block to be
/// loaded.
pub trait HardwareVt: fmt::Debug + Send {
    fn vendor(&self) -> Vendor;

    /// Enters root/host mode on the current processor. `host_area` is the
    /// physical address of the VM's host save area frame.
    fn enable(&mut self, host_area: u64) -> crate::Result<()>;

    /// Leaves root/host mode.
    fn disable(&mut self);

    /// Binds the control block to the current processor.
    fn load(&mut self, control_block: u64) -> crate::Result<()>;

    /// Flushes the control block to memory and unbinds it.
    fn clear(&mut self, control_block: u64) -> crate::Result<()>;

    /// Writes host state, guest state and execution controls into the loaded
    /// control block.
    fn apply(&mut self, config: &ControlBlockConfig) -> crate::Result<()>;

    /// Rewrites the host state of the loaded control block for the current
    /// processor. Called whenever the VM may have moved to another core.
    fn reload_host_state(&mut self, config: &ControlBlockConfig) -> crate::Result<()>;

    /// Executes the guest until it triggers VM exit. Guest general purpose
    /// registers are loaded from and saved back to `regs`.
    fn enter(&mut self, regs: &mut GuestRegisters) -> crate::Result<ExitSnapshot>;

    /// The hardware-reported reason for the last failed entry.
    fn instruction_error(&self) -> u64;

    /// Injects an external interrupt on the next entry.
    fn inject_interrupt(&mut self, vector: u8) -> crate::Result<()>;

    /// Injects `event` on the next entry exactly as the processor was
    /// delivering it when the guest exited.
    fn reinject_event(&mut self, event: &InterruptedEvent) -> crate::Result<()>;

    /// Requests an exit as soon as the guest can accept an interrupt.
    fn set_interrupt_window_exiting(&mut self, enabled: bool) -> crate::Result<()>;

    /// Whether the guest is in an STI or MOV SS interrupt shadow.
    fn interrupt_shadow(&self) -> crate::Result<bool>;

    fn guest_field(&self, field: GuestField) -> crate::Result<u64>;

    fn set_guest_field(&mut self, field: GuestField, value: u64) -> crate::Result<()>;

    /// Drops translations cached from the nested paging tree, eg, after a
    /// leaf was replaced.
    fn invalidate_caches(&mut self);

    /// Vendor encoding of permissions and memory type for `entry_type`.
    fn nps_entry_flags(
        &self,
        entry_type: NestedPagingStructureEntryType,
    ) -> NestedPagingStructureEntryFlags;
}

/// Creates the backend for a new VM.
pub trait BackendFactory: Send + Sync {
    fn create(&self, memory: Arc<dyn FrameAllocator>) -> crate::Result<Box<dyn HardwareVt>>;
}

/// Chooses VMX on Intel and SVM on AMD processors.
#[derive(Debug, Default)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create(&self, memory: Arc<dyn FrameAllocator>) -> crate::Result<Box<dyn HardwareVt>> {
        let vt: Box<dyn HardwareVt> = match detect_vendor() {
            Vendor::Intel => {
                trace!("Processor is Intel");
                Box::new(vmx::Vmx::new(memory)?)
            }
            Vendor::Amd => {
                trace!("Processor is AMD");
                Box::new(svm::Svm::new(memory)?)
            }
        };
        Ok(vt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Vendor {
    Intel,
    Amd,
}

/// Checks whether the current processor is Intel-processors (as opposed to
/// AMD).
pub fn detect_vendor() -> Vendor {
    let is_intel = x86::cpuid::CpuId::new()
        .get_vendor_info()
        .is_some_and(|info| info.as_str() == "GenuineIntel");
    if is_intel {
        Vendor::Intel
    } else {
        Vendor::Amd
    }
}

/// Guest state kept in the control block (or in vendor-managed MSR areas)
/// rather than in [`GuestRegisters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestField {
    Cr0,
    Cr3,
    Cr4,
    Efer,
    FsBase,
    GsBase,
    KernelGsBase,
    Star,
    Lstar,
    Cstar,
    Sfmask,
}

impl GuestField {
    /// The guest-state field that backs `msr`, if any.
    pub fn from_msr(msr: u32) -> Option<Self> {
        Some(match msr {
            x86::msr::IA32_EFER => Self::Efer,
            x86::msr::IA32_FS_BASE => Self::FsBase,
            x86::msr::IA32_GS_BASE => Self::GsBase,
            x86::msr::IA32_KERNEL_GSBASE => Self::KernelGsBase,
            x86::msr::IA32_STAR => Self::Star,
            x86::msr::IA32_LSTAR => Self::Lstar,
            x86::msr::IA32_CSTAR => Self::Cstar,
            x86::msr::IA32_FMASK => Self::Sfmask,
            _ => return None,
        })
    }
}

/// Everything the hardware reported about one VM exit, in vendor-agnostic
/// form. Consumed by a single dispatcher pass.
#[derive(Debug, Clone, Serialize)]
pub struct ExitSnapshot {
    pub reason: ExitReason,
    /// The vendor specific exit code.
    pub raw_reason: u64,
    pub qualification: u64,
    pub guest_linear_address: u64,
    pub guest_physical_address: u64,
    pub instruction_length: u64,
    pub instruction_info: u64,
    pub interruption_info: u64,
    pub error_code: u64,
    /// Guest RIP of the exiting instruction.
    pub rip: u64,
    /// The event whose delivery the exit interrupted, if any.
    pub interrupted_event: Option<InterruptedEvent>,
}

impl ExitSnapshot {
    /// A snapshot with only the reason and instruction length populated.
    pub fn new(reason: ExitReason, raw_reason: u64, instruction_length: u64) -> Self {
        Self {
            reason,
            raw_reason,
            qualification: 0,
            guest_linear_address: 0,
            guest_physical_address: 0,
            instruction_length,
            instruction_info: 0,
            interruption_info: 0,
            error_code: 0,
            rip: 0,
            interrupted_event: None,
        }
    }
}

/// How an event is delivered through the guest IDT. The VMX and SVM
/// encodings agree on every kind except the software exceptions, which SVM
/// reports as exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    ExternalInterrupt,
    Nmi,
    HardwareException,
    /// INT n.
    SoftwareInterrupt,
    /// INT1.
    PrivilegedSoftwareException,
    /// INT3 and INTO.
    SoftwareException,
}

impl EventKind {
    /// The 3-bit type field shared by IDT-vectoring information, EXITINTINFO
    /// and the injection fields.
    pub fn from_type(raw: u64) -> Option<Self> {
        Some(match raw & 0b111 {
            0 => Self::ExternalInterrupt,
            2 => Self::Nmi,
            3 => Self::HardwareException,
            4 => Self::SoftwareInterrupt,
            5 => Self::PrivilegedSoftwareException,
            6 => Self::SoftwareException,
            _ => return None,
        })
    }

    pub fn vmx_type(self) -> u64 {
        match self {
            Self::ExternalInterrupt => 0,
            Self::Nmi => 2,
            Self::HardwareException => 3,
            Self::SoftwareInterrupt => 4,
            Self::PrivilegedSoftwareException => 5,
            Self::SoftwareException => 6,
        }
    }

    pub fn svm_type(self) -> u64 {
        match self {
            Self::ExternalInterrupt => 0,
            Self::Nmi => 2,
            Self::HardwareException
            | Self::PrivilegedSoftwareException
            | Self::SoftwareException => 3,
            Self::SoftwareInterrupt => 4,
        }
    }

    /// Events that restart an instruction and need its length on entry.
    pub fn is_software(self) -> bool {
        matches!(
            self,
            Self::SoftwareInterrupt | Self::PrivilegedSoftwareException | Self::SoftwareException
        )
    }
}

/// An event the processor was delivering when the guest exited, eg, a timer
/// interrupt whose push onto a not yet backed stack page caused a nested
/// page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InterruptedEvent {
    pub vector: u8,
    pub kind: EventKind,
    pub error_code: Option<u32>,
    /// Length of the instruction raising a software event.
    pub instruction_length: u64,
}

impl InterruptedEvent {
    /// Decodes the common layout of IDT-vectoring information and
    /// EXITINTINFO: vector in bits 7:0, type in 10:8, error code valid in 11,
    /// valid in 31.
    pub fn decode(info: u64, error_code: u32, instruction_length: u64) -> Option<Self> {
        const VALID: u64 = 1 << 31;
        const ERROR_CODE_VALID: u64 = 1 << 11;
        if info & VALID == 0 {
            return None;
        }
        Some(Self {
            vector: info as u8,
            kind: EventKind::from_type(info >> 8)?,
            error_code: (info & ERROR_CODE_VALID != 0).then_some(error_code),
            instruction_length,
        })
    }

    /// The injection field value for a backend using `event_type`.
    pub fn encode(&self, event_type: u64) -> u64 {
        const VALID: u64 = 1 << 31;
        const DELIVER_ERROR_CODE: u64 = 1 << 11;
        let mut info = u64::from(self.vector) | (event_type << 8) | VALID;
        if self.error_code.is_some() {
            info |= DELIVER_ERROR_CODE;
        }
        info
    }
}

/// Why the guest left, decoded from the vendor exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    Cpuid,
    Hlt,
    Pause,
    Io(IoAccess),
    MsrRead,
    MsrWrite,
    /// An address translation failure with nested paging.
    NestedPageFault(NestedPageFault),
    /// The nested paging structures are malformed.
    NestedPagingMisconfiguration,
    /// VMCALL or VMMCALL.
    Hypercall,
    ControlRegisterAccess(CrAccess),
    ExternalInterrupt,
    Nmi,
    InterruptWindow,
    /// An intercepted exception. Contains the vector.
    Exception(u8),
    /// Triple fault.
    Shutdown,
    /// The hardware rejected the guest state on entry.
    InvalidGuestState,
    /// Any exit code the dispatcher has no handler for.
    Unexpected(u64),
}

/// Decoded IN/OUT/INS/OUTS exit information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IoAccess {
    pub port: u16,
    /// Access size in bytes: 1, 2 or 4.
    pub size: u8,
    pub input: bool,
    pub string: bool,
    pub rep: bool,
}

/// The access that failed nested translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NestedPageFault {
    pub gpa: u64,
    pub read: bool,
    pub write: bool,
    pub fetch: bool,
    /// The translation existed but did not permit the access.
    pub present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CrAccessType {
    MovToCr,
    MovFromCr,
    Other,
}

/// Decoded MOV to/from control register exit information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrAccess {
    pub cr: u8,
    pub access: CrAccessType,
    /// The general purpose register, in hardware encoding.
    pub gpr: u8,
}

/// The kinds of nested paging entries the tree writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedPagingStructureEntryType {
    /// Non-leaf entry pointing at the next table.
    Table,

    /// Readable, writable, executable guest RAM.
    Rwx,

    /// Readable, writable guest RAM.
    Rw,

    /// Readable, executable guest RAM.
    Rx,

    /// Read only guest RAM.
    R,

    /// Readable, writable device memory, uncached.
    UncachedRw,

    /// Read only device memory, uncached.
    UncachedR,
}

/// Vendor bits written by [`NestedPagingStructureEntry::set_translation`].
#[derive(Debug, Clone, Copy)]
pub struct NestedPagingStructureEntryFlags {
    pub permission: u8,
    pub memory_type: u8,
    pub no_execute: bool,
}

/// One 4 KiB table of the nested paging tree at any level, EPT on Intel and
/// NPT on AMD.
#[derive(Clone, Copy, Debug)]
#[repr(C, align(4096))]
pub struct NestedPagingStructure {
    pub entries: [NestedPagingStructureEntry; PAGE_SIZE_ENTRIES],
}
const _: () = assert!(size_of::<NestedPagingStructure>() == 0x1000);

bitfield! {
    /// A nested paging entry in a layout both vendors can share. Only the
    /// bits written here are meaningful. For example, bit 5:3 `memory_type` is the EPT memory type on Intel and
    /// the PWT/PCD/A bits on AMD. Bit 63 is NX on AMD and must stay clear on
    /// Intel.
    /*
         6 66665 5     1 110000 000 000
         3 21098 8.....2 109876 543 210
        +-+-----+-------+------+---+---+
        |N|xxxxx|  PFN  |xxxxxx| M | P |
        +-+-----+-------+------+---+---+
    */
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct NestedPagingStructureEntry(u64);
    impl Debug;
    pub permission, set_permission: 2, 0;
    pub memory_type, set_memory_type: 5, 3;
    flags1, _: 11, 6;
    pub pfn, set_pfn: 58, 12;
    flags2, _: 62, 59;
    pub no_execute, set_no_execute: 63;
}

impl NestedPagingStructureEntry {
    pub const PERMISSION_READ: u64 = 0b001;
    pub const PERMISSION_WRITE: u64 = 0b010;

    /// Points the entry at `pa`, a table or a final frame, replacing every
    /// other bit.
    pub fn set_translation(&mut self, pa: u64, flags: NestedPagingStructureEntryFlags) {
        self.0 = 0;
        self.set_pfn(pa >> 12);
        self.set_permission(u64::from(flags.permission));
        self.set_memory_type(u64::from(flags.memory_type));
        self.set_no_execute(flags.no_execute);
    }

    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_present(&self) -> bool {
        self.permission() & Self::PERMISSION_READ != 0
    }

    pub fn is_writable(&self) -> bool {
        self.permission() & Self::PERMISSION_WRITE != 0
    }

    pub fn address(&self) -> u64 {
        self.pfn() << 12
    }
}

/// The low 8 bytes of the host GDT descriptor `selector` refers to.
fn get_segment_descriptor_value(table_base: u64, selector: u16) -> u64 {
    let sel = x86::segmentation::SegmentSelector::from_raw(selector);
    let descriptor_addr = table_base + u64::from(sel.index() * 8);
    let ptr = descriptor_addr as *const u64;
    // Safety: the host GDT is mapped and `selector` is loaded from it.
    unsafe { ptr.read_unaligned() }
}

/// Returns the base address of the system segment (TSS) for the given
/// selector, including the upper half of the 16-byte descriptor.
fn get_system_segment_base(table_base: u64, selector: u16) -> u64 {
    let sel = x86::segmentation::SegmentSelector::from_raw(selector);
    if sel.index() == 0 {
        return 0;
    }
    let low = get_segment_descriptor_value(table_base, selector);
    let high_addr = table_base + u64::from(sel.index() * 8) + 8;
    // Safety: a 64-bit TSS descriptor spans two GDT slots.
    let high = unsafe { (high_addr as *const u64).read_unaligned() };
    ((low >> 16) & 0xff_ffff) | (((low >> 56) & 0xff) << 24) | ((high & 0xffff_ffff) << 32)
}
