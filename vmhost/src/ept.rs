//! The nested paging (EPT/NPT) manager: the guest-physical to host-physical
//! translation tree of one VM and the frames that back it.

use crate::{
    error::HypervisorError,
    frames::{allocate_zeroed, bytes_mut, Frame, FrameAllocator, FRAME_SIZE},
    hardware_vt::{
        HardwareVt, NestedPageFault, NestedPagingStructure, NestedPagingStructureEntry,
        NestedPagingStructureEntryFlags, NestedPagingStructureEntryType,
    },
};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::ptr::addr_of_mut;
use log::{debug, trace};

/// The number of pre-allocated nested paging structures per VM. The more
/// memory the VM touches, the more tables are needed; when they run out the
/// VM is terminated.
pub const NESTED_TABLE_POOL: usize = 512;

const ENTRY_TYPES: usize = 7;

/// The backend's entry flags for every [`NestedPagingStructureEntryType`],
/// captured once so the tree can be edited without a backend at hand.
#[derive(Debug, Clone, Copy)]
pub struct EntryFlagTable([NestedPagingStructureEntryFlags; ENTRY_TYPES]);

impl EntryFlagTable {
    pub fn from_backend(vt: &dyn HardwareVt) -> Self {
        use NestedPagingStructureEntryType as T;
        Self(
            [T::Table, T::Rwx, T::Rw, T::Rx, T::R, T::UncachedRw, T::UncachedR]
                .map(|entry_type| vt.nps_entry_flags(entry_type)),
        )
    }

    fn get(&self, entry_type: NestedPagingStructureEntryType) -> NestedPagingStructureEntryFlags {
        self.0[entry_type as usize]
    }

    /// Whether a leaf permits instruction fetches. The execute control is
    /// whatever tells [`NestedPagingStructureEntryType::Rx`] apart from
    /// [`NestedPagingStructureEntryType::R`]: a permission bit on Intel, NX on
    /// AMD.
    fn is_executable(&self, entry: &NestedPagingStructureEntry) -> bool {
        let rx = self.get(NestedPagingStructureEntryType::Rx);
        let r = self.get(NestedPagingStructureEntryType::R);
        let execute_bits = u64::from(rx.permission ^ r.permission);
        if entry.permission() & execute_bits != u64::from(rx.permission) & execute_bits {
            return false;
        }
        rx.no_execute == r.no_execute || entry.no_execute() == rx.no_execute
    }
}

/// What backs a range of guest physical memory that is mapped on first
/// access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Guest RAM backed by fresh zeroed frames.
    DemandRam,
    /// A device BAR or configuration page at `host_base`.
    Device { host_base: u64, writable: bool },
    /// Read-only frames at `host_base` lent by another owner. Writes to
    /// non-executable lent pages are copied into a VM-owned frame.
    Lent { host_base: u64, executable: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestPhysicalRegion {
    pub gpa: u64,
    pub size: u64,
    pub kind: RegionKind,
}

impl GuestPhysicalRegion {
    fn contains(&self, gpa: u64) -> bool {
        gpa >= self.gpa && gpa - self.gpa < self.size
    }
}

/// A guest physical address resolved to a host physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub pa: u64,
    pub writable: bool,
    pub executable: bool,
}

/// How a nested page fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A missing translation was created.
    Mapped,
    /// An existing translation was replaced; cached translations must be
    /// invalidated before the next entry.
    Remapped,
    /// The translation already permits the access.
    Stale,
}

/// The nested paging structures of a VM. The root and every table node come
/// from frames owned by this structure; leaves point at frames recorded in
/// [`NestedPageTable::backing`], at device memory or at lent frames.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct NestedPageTable {
    #[derivative(Debug = "ignore")]
    memory: Arc<dyn FrameAllocator>,
    flags: EntryFlagTable,

    /// The nested PML4.
    root: Frame,

    /// Preallocated nested paging structures for dynamically building
    /// GPA -> PA translation.
    pool: Frame,

    /// How many tables of [`NestedPageTable::pool`] have been consumed.
    used_tables: usize,

    /// Frames exclusively owned by the VM, keyed by physical address.
    backing: BTreeMap<u64, Frame>,

    regions: Vec<GuestPhysicalRegion>,
}

impl NestedPageTable {
    pub fn new(memory: Arc<dyn FrameAllocator>, flags: EntryFlagTable) -> crate::Result<Self> {
        let root = allocate_zeroed(memory.as_ref(), 1).ok_or(HypervisorError::OutOfGuestMemory)?;
        let Some(pool) = allocate_zeroed(memory.as_ref(), NESTED_TABLE_POOL) else {
            memory.free(root);
            return Err(HypervisorError::OutOfGuestMemory);
        };
        trace!("Nested PML4 {root:?}, table pool {pool:?}");
        Ok(Self {
            memory,
            flags,
            root,
            pool,
            used_tables: 0,
            backing: BTreeMap::new(),
            regions: Vec::new(),
        })
    }

    /// Physical address of the nested PML4.
    pub fn root_pa(&self) -> u64 {
        self.root.pa()
    }

    pub fn used_tables(&self) -> usize {
        self.used_tables
    }

    pub fn add_region(&mut self, region: GuestPhysicalRegion) {
        trace!("Guest physical region {region:x?}");
        self.regions.push(region);
    }

    pub fn region(&self, gpa: u64) -> Option<&GuestPhysicalRegion> {
        self.regions.iter().find(|region| region.contains(gpa))
    }

    /// The frames exclusively owned by the VM.
    pub fn backing(&self) -> impl Iterator<Item = &Frame> {
        self.backing.values()
    }

    /// Whether `pa` lies in a frame owned by the VM.
    pub fn owns(&self, pa: u64) -> bool {
        self.backing
            .range(..=pa)
            .next_back()
            .is_some_and(|(_, frame)| frame.contains(pa))
    }

    /// Takes ownership of a frame mapped into the guest by the caller.
    pub fn adopt(&mut self, frame: Frame) {
        self.backing.insert(frame.pa(), frame);
    }

    /// Gives up ownership of the frame starting at `pa`.
    pub fn surrender(&mut self, pa: u64) -> Option<Frame> {
        self.backing.remove(&pa)
    }

    /// Allocates a zeroed frame, maps it at `gpa` and records it as owned.
    pub fn map_new_frame(
        &mut self,
        gpa: u64,
        entry_type: NestedPagingStructureEntryType,
    ) -> crate::Result<u64> {
        let frame = allocate_zeroed(self.memory.as_ref(), 1).ok_or(HypervisorError::OutOfGuestMemory)?;
        let pa = frame.pa();
        if let Err(err) = self.map(gpa, pa, entry_type) {
            self.memory.free(frame);
            return Err(err);
        }
        self.adopt(frame);
        Ok(pa)
    }

    /// Builds nested paging translation for `gpa` to translate to `pa`.
    pub fn map(
        &mut self,
        gpa: u64,
        pa: u64,
        entry_type: NestedPagingStructureEntryType,
    ) -> crate::Result<()> {
        let flags = self.flags.get(entry_type);
        let pte = self.leaf_mut(gpa)?;
        pte.set_translation(pa & !0xfff, flags);
        trace!("GPA {:#x} -> PA {:#x} {entry_type:?}", gpa & !0xfff, pa & !0xfff);
        Ok(())
    }

    /// Removes the translation of `gpa` and returns the page it pointed at.
    pub fn unmap(&mut self, gpa: u64) -> Option<u64> {
        let pte = self.find_leaf(gpa)?;
        // Safety: `find_leaf` returns an entry inside a table owned by self.
        let pte = unsafe { &mut *pte };
        if !pte.is_present() {
            return None;
        }
        let pa = pte.address();
        pte.clear();
        Some(pa)
    }

    /// Translates `gpa` without modifying the tree.
    pub fn translate(&self, gpa: u64) -> Option<Translation> {
        let pte = self.find_leaf(gpa)?;
        // Safety: `find_leaf` returns an entry inside a table owned by self.
        let pte = unsafe { *pte };
        pte.is_present().then(|| Translation {
            pa: pte.address() | (gpa & 0xfff),
            writable: pte.is_writable(),
            executable: self.flags.is_executable(&pte),
        })
    }

    /// Backs the guest RAM page containing `gpa` with a new frame unless it is
    /// mapped already. Returns whether a frame was allocated.
    pub fn ensure_mapped(&mut self, gpa: u64) -> crate::Result<bool> {
        if self.translate(gpa).is_some() {
            return Ok(false);
        }
        self.map_new_frame(gpa, NestedPagingStructureEntryType::Rwx)?;
        Ok(true)
    }

    /// Resolves a nested page fault, or reports why the guest must be
    /// terminated.
    pub fn handle_violation(&mut self, fault: &NestedPageFault) -> crate::Result<Resolution> {
        let gpa = fault.gpa;
        let Some(region) = self.region(gpa).copied() else {
            return Err(HypervisorError::UnmappedGuestPhysical { gpa });
        };
        let current = self.translate(gpa);
        if fault.fetch && !Self::region_executable(region.kind) {
            return Err(HypervisorError::ExecuteFromNonExecutable { gpa });
        }
        if let Some(translation) = current {
            if fault.fetch && !translation.executable {
                return Err(HypervisorError::ExecuteFromNonExecutable { gpa });
            }
            if !fault.write || translation.writable {
                return Ok(Resolution::Stale);
            }
        }

        let page = gpa & !0xfff;
        let offset = page - region.gpa;
        match region.kind {
            RegionKind::DemandRam => {
                if current.is_some() {
                    return Err(HypervisorError::WriteToReadOnly { gpa });
                }
                self.ensure_mapped(gpa)?;
                Ok(Resolution::Mapped)
            }
            RegionKind::Device { host_base, writable } => {
                if fault.write && !writable {
                    return Err(HypervisorError::WriteToReadOnly { gpa });
                }
                let entry_type = if writable {
                    NestedPagingStructureEntryType::UncachedRw
                } else {
                    NestedPagingStructureEntryType::UncachedR
                };
                self.map(page, host_base + offset, entry_type)?;
                Ok(Resolution::Mapped)
            }
            RegionKind::Lent { host_base, executable } => {
                if !fault.write {
                    let entry_type = if executable {
                        NestedPagingStructureEntryType::Rx
                    } else {
                        NestedPagingStructureEntryType::R
                    };
                    self.map(page, host_base + offset, entry_type)?;
                    return Ok(Resolution::Mapped);
                }
                if executable {
                    return Err(HypervisorError::WriteToReadOnly { gpa });
                }
                self.copy_on_write(page, host_base + offset)?;
                Ok(if current.is_some() {
                    Resolution::Remapped
                } else {
                    Resolution::Mapped
                })
            }
        }
    }

    /// Whether any page of a region of `kind` can ever be fetched from.
    fn region_executable(kind: RegionKind) -> bool {
        match kind {
            RegionKind::DemandRam => true,
            RegionKind::Device { .. } => false,
            RegionKind::Lent { executable, .. } => executable,
        }
    }

    fn copy_on_write(&mut self, page: u64, source: u64) -> crate::Result<()> {
        let pa = self.map_new_frame(page, NestedPagingStructureEntryType::Rw)?;
        // Safety: `source` is a lent page readable by the VM and `pa` is the
        // frame just allocated for it.
        unsafe {
            let from = bytes_mut(self.memory.as_ref(), source, FRAME_SIZE);
            bytes_mut(self.memory.as_ref(), pa, FRAME_SIZE).copy_from_slice(from);
        }
        debug!("Copied lent page {source:#x} for GPA {page:#x}");
        Ok(())
    }

    /// Copies guest physical memory into `buffer`. Only mapped pages can be
    /// read, and nothing is mapped as a side effect.
    pub fn read(&self, gpa: u64, buffer: &mut [u8]) -> crate::Result<()> {
        let mut done = 0;
        while done < buffer.len() {
            let address = gpa + done as u64;
            let translation = self
                .translate(address)
                .ok_or(HypervisorError::UnmappedGuestPhysical { gpa: address })?;
            let chunk = (FRAME_SIZE - (address & 0xfff) as usize).min(buffer.len() - done);
            // Safety: the translation points into a frame mapped to the guest.
            let source = unsafe { bytes_mut(self.memory.as_ref(), translation.pa, chunk) };
            buffer[done..done + chunk].copy_from_slice(source);
            done += chunk;
        }
        Ok(())
    }

    /// Copies `bytes` into guest physical memory on behalf of the host.
    /// Unmapped guest RAM is mapped first. Only frames owned by the VM can be
    /// written, regardless of the guest's permissions.
    pub fn write(&mut self, gpa: u64, bytes: &[u8]) -> crate::Result<()> {
        let mut done = 0;
        while done < bytes.len() {
            let address = gpa + done as u64;
            if self.translate(address).is_none()
                && self.region(address).map(|r| r.kind) == Some(RegionKind::DemandRam)
            {
                self.ensure_mapped(address)?;
            }
            let translation = self
                .translate(address)
                .ok_or(HypervisorError::UnmappedGuestPhysical { gpa: address })?;
            if !self.owns(translation.pa) {
                return Err(HypervisorError::WriteToReadOnly { gpa: address });
            }
            let chunk = (FRAME_SIZE - (address & 0xfff) as usize).min(bytes.len() - done);
            // Safety: the destination lies in a frame owned by the VM.
            let target = unsafe { bytes_mut(self.memory.as_ref(), translation.pa, chunk) };
            target.copy_from_slice(&bytes[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Undoes everything mapped in `[gpa, gpa + size)`: leaves are cleared,
    /// frames owned by the VM are freed and regions lying inside the range
    /// are forgotten. Table nodes stay linked. Returns whether a translation
    /// was removed.
    pub fn discard(&mut self, gpa: u64, size: u64) -> bool {
        let mut removed = false;
        for page in (gpa..gpa + size).step_by(FRAME_SIZE) {
            let Some(pa) = self.unmap(page) else {
                continue;
            };
            removed = true;
            if let Some(frame) = self.surrender(pa) {
                self.memory.free(frame);
            }
        }
        self.regions
            .retain(|region| region.gpa < gpa || region.gpa + region.size > gpa + size);
        trace!("Discarded GPA {gpa:#x}..{:#x}", gpa + size);
        removed
    }

    /// Frees every owned frame, the table pool and the root.
    pub fn release(self) {
        let Self {
            memory,
            root,
            pool,
            backing,
            ..
        } = self;
        debug!("Releasing {} guest frames", backing.len());
        for frame in backing.into_values() {
            memory.free(frame);
        }
        memory.free(pool);
        memory.free(root);
    }

    fn table(&self, pa: u64) -> *mut NestedPagingStructure {
        self.memory.physical_to_virtual(pa).cast()
    }

    /// Walks the tree to the PT entry of `gpa` without allocating.
    fn find_leaf(&self, gpa: u64) -> Option<*mut NestedPagingStructureEntry> {
        let mut table = self.table(self.root_pa());
        for level in [39, 30, 21] {
            let index = ((gpa >> level) & 0x1ff) as usize;
            // Safety: `table` is the root or a pool table owned by self.
            let entry = unsafe { (*table).entries[index] };
            if !entry.is_present() {
                return None;
            }
            table = self.table(entry.address());
        }
        // Safety: as above.
        Some(unsafe { addr_of_mut!((*table).entries[((gpa >> 12) & 0x1ff) as usize]) })
    }

    /// Locates the PT entry of `gpa`, walking through whole PML4 -> PDPT ->
    /// PD -> PT as a processor does and allocating tables as needed.
    fn leaf_mut(&mut self, gpa: u64) -> crate::Result<&mut NestedPagingStructureEntry> {
        let mut table_pa = self.root_pa();
        for level in [39, 30, 21] {
            let index = ((gpa >> level) & 0x1ff) as usize;
            table_pa = self.walk_table(table_pa, index)?;
        }
        let table = self.table(table_pa);
        // Safety: `table` is a pool table owned by self, and `&mut self`
        // guarantees no other reference into the tree is live.
        Ok(unsafe { &mut (*table).entries[((gpa >> 12) & 0x1ff) as usize] })
    }

    /// Returns the next table referenced by `index` of the table at
    /// `table_pa`. An unused pool table is linked in if the entry is empty.
    fn walk_table(&mut self, table_pa: u64, index: usize) -> crate::Result<u64> {
        let table = self.table(table_pa);
        // Safety: `table` is the root or a pool table owned by self.
        let entry = unsafe { &mut (*table).entries[index] };
        if entry.is_unused() {
            if self.used_tables >= NESTED_TABLE_POOL {
                return Err(HypervisorError::NestedPagingStructuresExhausted);
            }
            let next_table = self.pool.pa() + (self.used_tables * FRAME_SIZE) as u64;
            entry.set_translation(next_table, self.flags.get(NestedPagingStructureEntryType::Table));
            self.used_tables += 1;
        }
        Ok(entry.address())
    }
}
