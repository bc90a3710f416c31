//! Fixed guest physical and virtual address layout shared by every VM.

/// Guest physical page holding the IDT.
pub const IDT_GPA: u64 = 0x1000;
pub const IDT_LIMIT: u32 = 0xfff;

/// Guest physical page holding the GDT.
pub const GDT_GPA: u64 = 0x2000;
pub const GDT_LIMIT: u32 = 0x2f;

/// Guest physical page holding the TSS.
pub const TSS_GPA: u64 = 0x3000;

pub const CODE_SELECTOR: u16 = 0x08;
pub const DATA_SELECTOR: u16 = 0x10;
pub const TSS_SELECTOR: u16 = 0x18;

/// Root of the guest page tables (the initial guest CR3).
pub const GUEST_PAGE_TABLE_ROOT_GPA: u64 = 0x4000;
/// First guest physical address handed out for further guest page tables.
pub const GUEST_PAGE_TABLE_POOL_GPA: u64 = 0x5000;
/// End (exclusive) of the guest page table area.
pub const GUEST_PAGE_TABLE_POOL_END: u64 = 0x20_0000;

/// Program and module images are placed upwards from here.
pub const IMAGE_GPA: u64 = 0x20_0000;
pub const IMAGE_GPA_END: u64 = 0x4000_0000;
pub const IMAGE_VA: u64 = 2 << 40;

/// The global offset table window.
pub const GOT_GPA: u64 = 0x4000_0000;
pub const GOT_VA: u64 = 8 << 40;
pub const GOT_MAX_SIZE: u64 = 2 * 1024 * 1024;

/// The guest stack, growing down to just below the heap.
pub const STACK_GPA: u64 = 0x8000_0000;
pub const STACK_TOP_VA: u64 = 4 << 40;
pub const DEFAULT_STACK_SIZE: u64 = 2 * 1024 * 1024;
pub const MAX_STACK_SIZE: u64 = 64 * 1024 * 1024;

/// The guest heap, growing up from the stack top.
pub const HEAP_GPA: u64 = 0x1_0000_0000;
pub const HEAP_VA: u64 = 4 << 40;
pub const DEFAULT_HEAP_SIZE: u64 = 16 * 1024 * 1024;
pub const MAX_HEAP_SIZE: u64 = 512 * 1024 * 1024;

/// Attached device windows, one per device.
pub const DEVICE_GPA: u64 = 0x40_0000_0000;
pub const DEVICE_VA: u64 = 12 << 40;
pub const DEVICE_WINDOW_SIZE: u64 = 256 * 1024 * 1024;
pub const MAX_ATTACHED_DEVICES: u64 = 64;

/// A contiguous range of guest memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GuestRegion {
    pub gpa: u64,
    pub va: u64,
    pub size: u64,
}

impl GuestRegion {
    pub fn contains_gpa(&self, gpa: u64) -> bool {
        gpa >= self.gpa && gpa < self.gpa + self.size
    }

    pub fn end_va(&self) -> u64 {
        self.va + self.size
    }
}

const _: () = assert!(STACK_GPA + MAX_STACK_SIZE <= HEAP_GPA);
const _: () = assert!(GOT_GPA + GOT_MAX_SIZE <= STACK_GPA);
const _: () = assert!(HEAP_GPA + MAX_HEAP_SIZE <= DEVICE_GPA);
