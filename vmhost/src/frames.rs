//! Physical frames owned by VMs and the allocator they come from.

use crate::{error::HypervisorError, Page};
use core::fmt;
use log::trace;

/// Size of one frame.
pub const FRAME_SIZE: usize = size_of::<Page>();

/// A run of physically contiguous pages handed out by a [`FrameAllocator`].
///
/// A `Frame` is a unique token: it is neither `Clone` nor `Copy`, so a frame
/// can only be returned to the allocator once.
#[derive(PartialEq, Eq)]
pub struct Frame {
    pa: u64,
    pages: usize,
}

impl Frame {
    /// Creates the token for `pages` pages at `pa`. Only allocators should
    /// call this.
    pub fn new(pa: u64, pages: usize) -> Self {
        Self { pa, pages }
    }

    pub fn pa(&self) -> u64 {
        self.pa
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn size(&self) -> u64 {
        (self.pages * FRAME_SIZE) as u64
    }

    pub fn contains(&self, pa: u64) -> bool {
        pa >= self.pa && pa < self.pa + self.size()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:#x}, {} pages)", self.pa, self.pages)
    }
}

/// The physical frame allocator of the host kernel, together with its direct
/// map so the hypervisor can read and write the frames it owns.
pub trait FrameAllocator: Send + Sync {
    /// Allocates `pages` contiguous, page aligned frames.
    fn allocate(&self, pages: usize) -> Option<Frame>;

    /// Returns a frame to the allocator.
    fn free(&self, frame: Frame);

    /// Number of free pages, used for leak accounting.
    fn free_pages(&self) -> usize;

    /// The host virtual address through which `pa` is accessible.
    fn physical_to_virtual(&self, pa: u64) -> *mut u8;
}

/// Allocates `pages` zero-filled pages.
pub fn allocate_zeroed(allocator: &dyn FrameAllocator, pages: usize) -> Option<Frame> {
    let frame = allocator.allocate(pages)?;
    let ptr = allocator.physical_to_virtual(frame.pa());
    // Safety: the frame was just allocated and is exclusively ours.
    unsafe { core::ptr::write_bytes(ptr, 0, frame.size() as usize) };
    Some(frame)
}

/// Views `len` bytes of host physical memory starting at `pa`.
///
/// # Safety
///
/// The range must lie within frames owned (or lent read-only, for shared
/// access) by the caller, and no other reference to it may be live.
pub unsafe fn bytes_mut<'a>(allocator: &dyn FrameAllocator, pa: u64, len: usize) -> &'a mut [u8] {
    core::slice::from_raw_parts_mut(allocator.physical_to_virtual(pa), len)
}

/// Reads a `u64` from host physical memory.
///
/// # Safety
///
/// `pa` must be 8-byte aligned and within a frame the caller may read.
pub unsafe fn read_u64(allocator: &dyn FrameAllocator, pa: u64) -> u64 {
    allocator.physical_to_virtual(pa).cast::<u64>().read_volatile()
}

/// Writes a `u64` to host physical memory.
///
/// # Safety
///
/// `pa` must be 8-byte aligned and within a frame owned by the caller.
pub unsafe fn write_u64(allocator: &dyn FrameAllocator, pa: u64, value: u64) {
    allocator.physical_to_virtual(pa).cast::<u64>().write_volatile(value);
}

/// The closed set of per-VM frames allocated at creation time. The VM's own
/// descriptor has no role here: it lives in the heap allocated `Box<Vm>`
/// and never needs a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRole {
    /// VMCS or VMCB.
    ControlBlock,
    /// VMXON region, or the SVM host save area plus the VMSAVE area.
    HostSaveArea,
    /// Stack used by the exit trampoline; the guest register file lives at
    /// its top.
    ExitStack,
    /// Virtual-APIC page mirroring the emulated LAPIC.
    VirtualApic,
    /// MSR permission bitmap.
    MsrBitmap,
    /// IO permission bitmap.
    IoBitmap,
    /// MSRs saved on exit and loaded on entry (guest values).
    ExitMsrStore,
    /// MSRs loaded on exit (host values).
    ExitMsrLoad,
}

impl FrameRole {
    /// All roles, in allocation order.
    pub const ALL: [FrameRole; 8] = [
        FrameRole::ControlBlock,
        FrameRole::HostSaveArea,
        FrameRole::ExitStack,
        FrameRole::VirtualApic,
        FrameRole::MsrBitmap,
        FrameRole::IoBitmap,
        FrameRole::ExitMsrStore,
        FrameRole::ExitMsrLoad,
    ];

    /// Number of contiguous pages this role needs.
    pub fn pages(self) -> usize {
        match self {
            // SVM MSRPM is 8KB.
            FrameRole::MsrBitmap => 2,
            // VMX IO bitmaps A and B, or the 12KB SVM IOPM.
            FrameRole::IoBitmap => 3,
            FrameRole::HostSaveArea => 2,
            FrameRole::ExitStack => 4,
            _ => 1,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Frames indexed by [`FrameRole`]. Each slot owns at most one frame, and
/// [`FrameTable::release`] consumes the table, so each frame is freed exactly
/// once.
#[derive(Debug, Default)]
pub struct FrameTable {
    slots: [Option<Frame>; FrameRole::ALL.len()],
}

impl FrameTable {
    /// Allocates a zeroed frame for every role in order. On failure, every
    /// frame acquired so far is returned to the allocator.
    pub fn allocate_all(allocator: &dyn FrameAllocator) -> crate::Result<Self> {
        let mut table = Self::default();
        for role in FrameRole::ALL {
            let Some(frame) = allocate_zeroed(allocator, role.pages()) else {
                table.release(allocator);
                return Err(HypervisorError::OutOfFrames(role));
            };
            trace!("{role:?}: {frame:?}");
            table.slots[role.index()] = Some(frame);
        }
        Ok(table)
    }

    pub fn get(&self, role: FrameRole) -> Option<&Frame> {
        self.slots[role.index()].as_ref()
    }

    /// The physical address of the frame for `role`, or 0 for an empty slot.
    pub fn pa(&self, role: FrameRole) -> u64 {
        self.get(role).map_or(0, Frame::pa)
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Frees every populated slot.
    pub fn release(mut self, allocator: &dyn FrameAllocator) {
        for slot in &mut self.slots {
            if let Some(frame) = slot.take() {
                allocator.free(frame);
            }
        }
    }
}
