//! The vendor-neutral description of a control block, built once per VM and
//! written into the VMCS or VMCB by [`HardwareVt::apply`].
//!
//! [`HardwareVt::apply`]: crate::hardware_vt::HardwareVt::apply

use crate::{
    frames::{bytes_mut, FrameAllocator, FrameRole, FrameTable, FRAME_SIZE},
    layout,
    state::GuestRegisters,
    x86_data::{guest_gdt, SegmentState},
};
use bit_vec::BitVec;
use log::trace;
use x86::{
    controlregs::{Cr0, Cr4},
    msr,
};

/// MSRs swapped between host and guest values on every transition through
/// the VMX MSR areas. On SVM they live in the VMCB and move with VMLOAD.
pub const SWITCHED_MSRS: [u32; 5] = [
    msr::IA32_KERNEL_GSBASE,
    msr::IA32_STAR,
    msr::IA32_LSTAR,
    msr::IA32_CSTAR,
    msr::IA32_FMASK,
];

/// One entry of a VMX MSR load/store area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MsrEntry {
    pub index: u32,
    reserved: u32,
    pub value: u64,
}
const _: () = assert!(size_of::<MsrEntry>() == 16);
const _: () = assert!(SWITCHED_MSRS.len() * size_of::<MsrEntry>() <= FRAME_SIZE);

impl MsrEntry {
    pub fn new(index: u32, value: u64) -> Self {
        Self {
            index,
            reserved: 0,
            value,
        }
    }
}

/// State the processor switches to on every exit.
#[derive(Debug, Clone, Copy)]
pub struct HostEntryState {
    /// Host virtual address of the guest register file at the top of the
    /// exit stack. The exit stack pointer sits just below it.
    pub registers: u64,
}

/// Guest state loaded on the first entry.
#[derive(Debug, Clone, Copy)]
pub struct GuestEntryState {
    pub es: SegmentState,
    pub cs: SegmentState,
    pub ss: SegmentState,
    pub ds: SegmentState,
    pub fs: SegmentState,
    pub gs: SegmentState,
    pub ldtr: SegmentState,
    pub tr: SegmentState,
    pub gdtr_base: u64,
    pub gdtr_limit: u32,
    pub idtr_base: u64,
    pub idtr_limit: u32,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub dr7: u64,
    pub pat: u64,
    pub rflags: u64,
    pub rip: u64,
    pub rsp: u64,
}

impl GuestEntryState {
    /// The 64-bit flat environment every guest boots into.
    pub fn long_mode(entry: u64, stack_top: u64) -> Self {
        const EFER_LME: u64 = 1 << 8;
        const EFER_LMA: u64 = 1 << 10;
        const EFER_NXE: u64 = 1 << 11;
        const DR7_INITIAL: u64 = 0x400;
        const PAT_DEFAULT: u64 = 0x0007_0406_0007_0406;
        const RFLAGS_RESERVED: u64 = 1 << 1;

        let gdt = guest_gdt(layout::TSS_GPA);
        let code = SegmentState::from_descriptor(
            layout::CODE_SELECTOR,
            gdt[usize::from(layout::CODE_SELECTOR >> 3)],
        );
        let data = SegmentState {
            limit: 0xffff,
            ..SegmentState::from_descriptor(
                layout::DATA_SELECTOR,
                gdt[usize::from(layout::DATA_SELECTOR >> 3)],
            )
        };
        let tr = SegmentState::from_descriptor(
            layout::TSS_SELECTOR,
            gdt[usize::from(layout::TSS_SELECTOR >> 3)],
        );

        let cr0 = Cr0::CR0_PROTECTED_MODE
            | Cr0::CR0_MONITOR_COPROCESSOR
            | Cr0::CR0_NUMERIC_ERROR
            | Cr0::CR0_WRITE_PROTECT
            | Cr0::CR0_ENABLE_PAGING;
        let cr4 = Cr4::CR4_ENABLE_PAE
            | Cr4::CR4_ENABLE_SSE
            | Cr4::CR4_UNMASKED_SSE
            | Cr4::CR4_ENABLE_GLOBAL_PAGES;

        Self {
            es: data,
            cs: SegmentState { limit: 0xffff, ..code },
            ss: data,
            ds: data,
            fs: data,
            gs: data,
            ldtr: SegmentState::UNUSABLE,
            tr,
            gdtr_base: layout::GDT_GPA,
            gdtr_limit: layout::GDT_LIMIT,
            idtr_base: layout::IDT_GPA,
            idtr_limit: layout::IDT_LIMIT,
            cr0: cr0.bits() as u64,
            cr3: layout::GUEST_PAGE_TABLE_ROOT_GPA,
            cr4: cr4.bits() as u64,
            efer: EFER_LME | EFER_LMA | EFER_NXE,
            dr7: DR7_INITIAL,
            pat: PAT_DEFAULT,
            rflags: RFLAGS_RESERVED,
            rip: entry,
            // Keep the stack aligned as if `entry` had been called.
            rsp: stack_top - 8,
        }
    }
}

/// Which events leave the guest.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionControls {
    pub external_interrupt_exiting: bool,
    pub nmi_exiting: bool,
    pub hlt_exiting: bool,
    pub pause_exiting: bool,
    /// Exceptions that cause an exit, one bit per vector.
    pub exception_bitmap: u32,
}

impl Default for ExecutionControls {
    fn default() -> Self {
        Self {
            external_interrupt_exiting: true,
            nmi_exiting: true,
            hlt_exiting: true,
            pause_exiting: true,
            exception_bitmap: 0,
        }
    }
}

/// Everything a backend needs to initialize its control block.
#[derive(Debug, Clone, Copy)]
pub struct ControlBlockConfig {
    pub host: HostEntryState,
    pub guest: GuestEntryState,
    pub controls: ExecutionControls,
    /// Physical address of the IO permission bitmap (three pages).
    pub io_bitmap: u64,
    /// Physical address of the MSR permission bitmap (two pages).
    pub msr_bitmap: u64,
    /// Physical address of the nested paging root.
    pub nested_root: u64,
    /// Guest values of [`SWITCHED_MSRS`], stored on exit and loaded on entry.
    pub guest_msrs: u64,
    /// Host values of [`SWITCHED_MSRS`], loaded on exit.
    pub host_msrs: u64,
    /// VPID on Intel, ASID on AMD. Never 0, which belongs to the host.
    pub asid: u32,
}

impl ControlBlockConfig {
    /// Builds the configuration from the VM's frames.
    pub fn new(
        frames: &FrameTable,
        memory: &dyn FrameAllocator,
        nested_root: u64,
        guest: GuestEntryState,
    ) -> Self {
        Self {
            host: HostEntryState {
                registers: register_file_address(frames, memory),
            },
            guest,
            controls: ExecutionControls::default(),
            io_bitmap: frames.pa(FrameRole::IoBitmap),
            msr_bitmap: frames.pa(FrameRole::MsrBitmap),
            nested_root,
            guest_msrs: frames.pa(FrameRole::ExitMsrStore),
            host_msrs: frames.pa(FrameRole::ExitMsrLoad),
            asid: 1,
        }
    }
}

/// The host virtual address of the [`GuestRegisters`] at the top of the exit
/// stack, aligned down to 64 bytes.
pub fn register_file_address(frames: &FrameTable, memory: &dyn FrameAllocator) -> u64 {
    let Some(stack) = frames.get(FrameRole::ExitStack) else {
        return 0;
    };
    let top = memory.physical_to_virtual(stack.pa()) as u64 + stack.size();
    (top - size_of::<GuestRegisters>() as u64) & !0x3f
}

/// Number of IO ports.
const IO_PORTS: usize = 0x1_0000;

/// IO permission bitmap: one bit per port, a set bit traps.
///
/// VMX bitmaps A and B and the SVM IOPM share this layout when bitmap B
/// directly follows A.
#[derive(Debug, Clone)]
pub struct IoPermissions {
    bits: BitVec<u32>,
}

impl IoPermissions {
    pub fn trap_all() -> Self {
        Self {
            bits: BitVec::from_elem(IO_PORTS, true),
        }
    }

    /// Lets the guest access `count` ports starting at `base` directly.
    pub fn pass_through(&mut self, base: u16, count: u32) {
        trace!("IO ports {base:#x}+{count:#x} pass through");
        for port in u32::from(base)..(u32::from(base) + count).min(IO_PORTS as u32) {
            self.bits.set(port as usize, false);
        }
    }

    pub fn trap(&mut self, port: u16) {
        self.bits.set(usize::from(port), true);
    }

    pub fn is_trapped(&self, port: u16) -> bool {
        self.bits.get(usize::from(port)).unwrap_or(true)
    }

    /// Writes the bitmap into the IO bitmap frame at `pa`. The bytes past the
    /// last port (the third SVM page) trap.
    pub fn write_to(&self, memory: &dyn FrameAllocator, pa: u64) {
        let len = FrameRole::IoBitmap.pages() * FRAME_SIZE;
        // Safety: `pa` is the VM's IO bitmap frame.
        let bytes = unsafe { bytes_mut(memory, pa, len) };
        bytes.fill(0xff);
        for (i, block) in self.bits.storage().iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&block.to_le_bytes());
        }
    }
}

/// Fills the MSR permission bitmap frame so that every access traps.
pub fn write_msr_bitmap(memory: &dyn FrameAllocator, pa: u64) {
    let len = FrameRole::MsrBitmap.pages() * FRAME_SIZE;
    // Safety: `pa` is the VM's MSR bitmap frame.
    unsafe { bytes_mut(memory, pa, len) }.fill(0xff);
}
