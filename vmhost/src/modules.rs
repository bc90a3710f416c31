//! Guest images and the per-VM dynamic loader: placement of program and
//! module sections, the global offset table and relocation.

use crate::{
    ept::{GuestPhysicalRegion, NestedPageTable, RegionKind},
    error::HypervisorError,
    frames::{allocate_zeroed, bytes_mut, FrameAllocator, FRAME_SIZE},
    guest_paging::GuestPageTables,
    hardware_vt::NestedPagingStructureEntryType,
    layout, page_align_up, size_to_pages,
};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use log::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Text,
    ReadOnlyData,
    Data,
    Bss,
}

impl SectionKind {
    fn entry_type(self) -> NestedPagingStructureEntryType {
        match self {
            SectionKind::Text => NestedPagingStructureEntryType::Rx,
            SectionKind::ReadOnlyData => NestedPagingStructureEntryType::R,
            SectionKind::Data | SectionKind::Bss => NestedPagingStructureEntryType::Rw,
        }
    }

    fn guest_writable(self) -> bool {
        matches!(self, SectionKind::Data | SectionKind::Bss)
    }
}

/// Where the contents of a section come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionData {
    /// Copied into VM-owned frames; shorter than the section means
    /// zero-filled tail.
    Bytes(Vec<u8>),
    /// Physically contiguous read-only host frames lent by the provider.
    Lent { host_pa: u64 },
    Zero,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub kind: SectionKind,
    pub size: u64,
    pub data: SectionData,
}

/// A position inside a section of the same image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionOffset {
    pub section: usize,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    /// `*at = va(target) + addend`, 8 bytes.
    Absolute64 {
        at: SectionOffset,
        target: SectionOffset,
        addend: i64,
    },
    /// `*at = va(target) + addend - va(at)`, 4 bytes.
    PcRel32 {
        at: SectionOffset,
        target: SectionOffset,
        addend: i64,
    },
    /// `*at = va(got slot) + addend - va(at)`, 4 bytes. `slot` indexes the
    /// image's own GOT entries.
    GotPcRel32 {
        at: SectionOffset,
        slot: usize,
        addend: i64,
    },
}

/// A relocatable guest image as produced by the toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    pub id: u64,
    pub entry: SectionOffset,
    pub sections: Vec<Section>,
    /// The targets of the image's GOT entries, in slot order.
    pub got_entries: Vec<SectionOffset>,
    pub relocations: Vec<Relocation>,
}

impl ModuleImage {
    /// Guest memory the image occupies once placed.
    pub fn size(&self) -> u64 {
        self.sections
            .iter()
            .map(|section| page_align_up(section.size))
            .sum()
    }
}

/// Where guest images come from.
pub trait ModuleProvider: Send + Sync {
    /// The program the VM boots, by entry-point name.
    fn program(&self, name: &str) -> Option<Arc<ModuleImage>>;

    /// A module requested through the load-module hypercall.
    fn module(&self, id: u64) -> Option<Arc<ModuleImage>>;
}

/// A placed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedModule {
    pub id: u64,
    pub image_va: u64,
    pub size: u64,
    pub entry_va: u64,
    /// GOT window after loading.
    pub got_va: u64,
    pub got_size: u64,
    /// An existing nested translation changed; cached translations must be
    /// invalidated.
    pub remapped: bool,
}

/// Global offset table state: a physically contiguous VM-owned frame run
/// mapped at [`layout::GOT_GPA`] that grows as modules load.
#[derive(Debug, Default)]
struct Got {
    pa: u64,
    pages: usize,
    /// Bytes in use.
    len: u64,
}

/// The loaded images of one VM.
#[derive(Debug)]
pub struct ModuleRegistry {
    modules: BTreeMap<u64, LoadedModule>,
    got: Got,
    next_gpa: u64,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self {
            modules: BTreeMap::new(),
            got: Got::default(),
            next_gpa: layout::IMAGE_GPA,
        }
    }
}

/// The memory a load writes into.
pub struct LoadTarget<'a> {
    pub memory: &'a dyn FrameAllocator,
    pub ept: &'a mut NestedPageTable,
    pub tables: &'a mut GuestPageTables,
}

impl ModuleRegistry {
    pub fn contains(&self, id: u64) -> bool {
        self.modules.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.modules.keys().copied()
    }

    pub fn got_size(&self) -> u64 {
        self.got.len
    }

    /// Places, links and records `image`. The id must not be loaded yet.
    /// A failed load leaves the registry, the guest page tables and the
    /// nested translations of the image and GOT windows as they were.
    pub fn load(&mut self, image: &ModuleImage, target: LoadTarget<'_>) -> crate::Result<LoadedModule> {
        if self.contains(image.id) {
            return Err(HypervisorError::InvalidConfiguration("module already loaded"));
        }
        validate(image)?;

        let size = image.size();
        let base_gpa = self.next_gpa;
        if base_gpa
            .checked_add(size)
            .map_or(true, |end| end > layout::IMAGE_GPA_END)
        {
            return Err(HypervisorError::ImageWindowExhausted);
        }
        let placement = Placement::new(image, base_gpa);
        if self.got.len + image.got_entries.len() as u64 * 8 > layout::GOT_MAX_SIZE {
            return Err(HypervisorError::GotExhausted);
        }
        let first_slot = self.got.len / 8;
        let patches = placement.relocate(image, first_slot)?;
        let got_entries: Vec<u64> = image
            .got_entries
            .iter()
            .map(|target| placement.va(*target))
            .collect();
        debug!(
            "Loading module {:#x} at {:#x} ({size:#x} bytes)",
            image.id, placement.base_va
        );

        let LoadTarget { memory, ept, tables } = target;
        let linked = place_sections(image, &placement, ept, tables).and_then(|()| {
            for (gpa, bytes) in &patches {
                ept.write(*gpa, bytes)?;
            }
            self.extend_got(&got_entries, memory, ept, tables)
        });
        let remapped = match linked {
            Ok(remapped) => remapped,
            Err(err) => {
                debug!("Module {:#x} not loaded: {err}", image.id);
                tables.unmap_range(ept, placement.base_va, size)?;
                ept.discard(base_gpa, size);
                return Err(err);
            }
        };

        self.next_gpa += size;
        let loaded = LoadedModule {
            id: image.id,
            image_va: placement.base_va,
            size,
            entry_va: placement.va(image.entry),
            got_va: layout::GOT_VA,
            got_size: self.got.len,
            remapped,
        };
        self.modules.insert(image.id, loaded);
        Ok(loaded)
    }

    /// Appends `entries` to the GOT. When the mapped frame run is too small,
    /// a larger run is allocated, filled and mapped in place of the old one,
    /// which is then freed. Returns whether existing translations changed.
    /// On failure the GOT is left as it was.
    fn extend_got(
        &mut self,
        entries: &[u64],
        memory: &dyn FrameAllocator,
        ept: &mut NestedPageTable,
        tables: &mut GuestPageTables,
    ) -> crate::Result<bool> {
        if entries.is_empty() {
            return Ok(false);
        }
        let old_len = self.got.len as usize;
        let len = old_len + entries.len() * 8;
        if len as u64 > layout::GOT_MAX_SIZE {
            return Err(HypervisorError::GotExhausted);
        }
        let pages = size_to_pages(len);
        if pages <= self.got.pages {
            // Safety: the run is VM-owned and `len` fits its pages.
            let run = unsafe { bytes_mut(memory, self.got.pa, len) };
            fill_got(&mut run[old_len..], entries);
            self.got.len = len as u64;
            return Ok(false);
        }

        let frame = allocate_zeroed(memory, pages).ok_or(HypervisorError::OutOfGuestMemory)?;
        // Safety: both runs are VM-owned and do not overlap.
        unsafe {
            let run = bytes_mut(memory, frame.pa(), len);
            if self.got.pages != 0 {
                run[..old_len].copy_from_slice(bytes_mut(memory, self.got.pa, old_len));
            }
            fill_got(&mut run[old_len..], entries);
        }

        let grown_va = layout::GOT_VA + (self.got.pages * FRAME_SIZE) as u64;
        let grown_size = ((pages - self.got.pages) * FRAME_SIZE) as u64;
        let mapped = tables
            .map_range(
                ept,
                grown_va,
                layout::GOT_GPA + (self.got.pages * FRAME_SIZE) as u64,
                grown_size,
                false,
                false,
            )
            .and_then(|()| map_got_run(ept, frame.pa(), pages));
        if let Err(err) = mapped {
            if self.got.pages != 0 {
                map_got_run(ept, self.got.pa, self.got.pages)?;
            }
            for page in self.got.pages..pages {
                ept.unmap(layout::GOT_GPA + (page * FRAME_SIZE) as u64);
            }
            tables.unmap_range(ept, grown_va, grown_size)?;
            memory.free(frame);
            return Err(err);
        }

        let new_pa = frame.pa();
        ept.adopt(frame);
        let remapped = self.got.pages != 0;
        if remapped {
            if let Some(old) = ept.surrender(self.got.pa) {
                memory.free(old);
            }
        }
        debug!("GOT grown to {pages} pages at {new_pa:#x}");
        self.got = Got {
            pa: new_pa,
            pages,
            len: len as u64,
        };
        Ok(remapped)
    }
}

/// Where the sections of an image land, computed before anything is mapped.
struct Placement {
    base_gpa: u64,
    base_va: u64,
    section_va: Vec<u64>,
}

impl Placement {
    fn new(image: &ModuleImage, base_gpa: u64) -> Self {
        let base_va = layout::IMAGE_VA + (base_gpa - layout::IMAGE_GPA);
        let mut next = base_va;
        let section_va = image
            .sections
            .iter()
            .map(|section| {
                let va = next;
                next += page_align_up(section.size);
                va
            })
            .collect();
        Self {
            base_gpa,
            base_va,
            section_va,
        }
    }

    fn va(&self, at: SectionOffset) -> u64 {
        self.section_va[at.section] + at.offset
    }

    fn gpa_of_va(&self, va: u64) -> u64 {
        va - self.base_va + self.base_gpa
    }

    /// The bytes every relocation writes, keyed by guest physical address.
    fn relocate(&self, image: &ModuleImage, first_slot: u64) -> crate::Result<Vec<(u64, Vec<u8>)>> {
        image
            .relocations
            .iter()
            .map(|relocation| {
                trace!("{relocation:x?}");
                let (at, bytes) = match *relocation {
                    Relocation::Absolute64 { at, target, addend } => {
                        let value = self.va(target).wrapping_add_signed(addend);
                        (at, value.to_le_bytes().to_vec())
                    }
                    Relocation::PcRel32 { at, target, addend } => {
                        let value = pc_relative(self.va(target), addend, self.va(at))?;
                        (at, value.to_le_bytes().to_vec())
                    }
                    Relocation::GotPcRel32 { at, slot, addend } => {
                        let slot_va = layout::GOT_VA + (first_slot + slot as u64) * 8;
                        let value = pc_relative(slot_va, addend, self.va(at))?;
                        (at, value.to_le_bytes().to_vec())
                    }
                };
                Ok((self.gpa_of_va(self.va(at)), bytes))
            })
            .collect()
    }
}

fn fill_got(slots: &mut [u8], entries: &[u64]) {
    for (slot, entry) in slots.chunks_exact_mut(8).zip(entries) {
        slot.copy_from_slice(&entry.to_le_bytes());
    }
}

fn map_got_run(ept: &mut NestedPageTable, pa: u64, pages: usize) -> crate::Result<()> {
    for page in 0..pages {
        let offset = (page * FRAME_SIZE) as u64;
        ept.map(
            layout::GOT_GPA + offset,
            pa + offset,
            NestedPagingStructureEntryType::R,
        )?;
    }
    Ok(())
}

fn place_sections(
    image: &ModuleImage,
    placement: &Placement,
    ept: &mut NestedPageTable,
    tables: &mut GuestPageTables,
) -> crate::Result<()> {
    for (section, &va) in image.sections.iter().zip(&placement.section_va) {
        let gpa = placement.gpa_of_va(va);
        place_section(section, gpa, ept)?;
        tables.map_range(
            ept,
            va,
            gpa,
            page_align_up(section.size),
            section.kind.guest_writable(),
            section.kind == SectionKind::Text,
        )?;
    }
    Ok(())
}

fn place_section(section: &Section, gpa: u64, ept: &mut NestedPageTable) -> crate::Result<()> {
    let aligned = page_align_up(section.size);
    match &section.data {
        SectionData::Lent { host_pa } => {
            let executable = section.kind == SectionKind::Text;
            ept.add_region(GuestPhysicalRegion {
                gpa,
                size: aligned,
                kind: RegionKind::Lent {
                    host_base: *host_pa,
                    executable,
                },
            });
            let entry_type = if executable {
                NestedPagingStructureEntryType::Rx
            } else {
                NestedPagingStructureEntryType::R
            };
            for offset in (0..aligned).step_by(FRAME_SIZE) {
                ept.map(gpa + offset, host_pa + offset, entry_type)?;
            }
        }
        SectionData::Bytes(bytes) => {
            for offset in (0..aligned).step_by(FRAME_SIZE) {
                ept.map_new_frame(gpa + offset, section.kind.entry_type())?;
            }
            ept.write(gpa, bytes)?;
        }
        SectionData::Zero => {
            for offset in (0..aligned).step_by(FRAME_SIZE) {
                ept.map_new_frame(gpa + offset, section.kind.entry_type())?;
            }
        }
    }
    Ok(())
}

fn pc_relative(target: u64, addend: i64, at: u64) -> crate::Result<u32> {
    let value = target.wrapping_add_signed(addend).wrapping_sub(at) as i64;
    i32::try_from(value)
        .map(|value| value as u32)
        .map_err(|_| HypervisorError::MalformedModule("PC-relative relocation out of range"))
}

/// Checks every reference of `image` before anything is mapped.
fn validate(image: &ModuleImage) -> crate::Result<()> {
    let in_bounds = |at: &SectionOffset, width: u64| {
        image.sections.get(at.section).is_some_and(|section| {
            at.offset
                .checked_add(width)
                .is_some_and(|end| end <= section.size)
        })
    };
    if image.sections.is_empty() || !in_bounds(&image.entry, 1) {
        return Err(HypervisorError::MalformedModule("entry point"));
    }
    for section in &image.sections {
        match &section.data {
            SectionData::Bytes(bytes) if bytes.len() as u64 > section.size => {
                return Err(HypervisorError::MalformedModule("section data exceeds size"));
            }
            SectionData::Lent { host_pa }
                if section.kind == SectionKind::Bss || host_pa & 0xfff != 0 =>
            {
                return Err(HypervisorError::MalformedModule("lent section"));
            }
            _ => {}
        }
    }
    if !image.got_entries.iter().all(|target| in_bounds(target, 0)) {
        return Err(HypervisorError::MalformedModule("GOT entry"));
    }
    for relocation in &image.relocations {
        let (at, valid) = match relocation {
            Relocation::Absolute64 { at, target, .. } => {
                (at, in_bounds(at, 8) && in_bounds(target, 0))
            }
            Relocation::PcRel32 { at, target, .. } => (at, in_bounds(at, 4) && in_bounds(target, 0)),
            Relocation::GotPcRel32 { at, slot, .. } => {
                (at, in_bounds(at, 4) && *slot < image.got_entries.len())
            }
        };
        if !valid {
            return Err(HypervisorError::MalformedModule("relocation"));
        }
        if matches!(image.sections[at.section].data, SectionData::Lent { .. }) {
            return Err(HypervisorError::MalformedModule("relocation in a lent section"));
        }
    }
    Ok(())
}
