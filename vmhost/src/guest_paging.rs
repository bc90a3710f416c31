//! The guest's own 4-level page tables, built by the host in guest physical
//! memory at load time and walked read-only for address translation.

use crate::{ept::NestedPageTable, error::HypervisorError, layout, Page};
use log::trace;
use x86::bits64::paging::{
    pd_index, pdpt_index, pml4_index, pt_index, PAddr, PDEntry, PDFlags, PDPTEntry, PDPTFlags,
    PML4Entry, PML4Flags, PTEntry, PTFlags, VAddr,
};

const ENTRY_SIZE: u64 = 8;

/// The guest page table tree rooted at the initial guest CR3.
#[derive(Debug)]
pub struct GuestPageTables {
    root: u64,
    /// Guest physical address of the next unused table page.
    next_table: u64,
}

impl Default for GuestPageTables {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestPageTables {
    pub fn new() -> Self {
        Self {
            root: layout::GUEST_PAGE_TABLE_ROOT_GPA,
            next_table: layout::GUEST_PAGE_TABLE_POOL_GPA,
        }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// Maps the guest virtual page `va` to the guest physical page `gpa`.
    /// Pages are supervisor pages; everything but code is non-executable.
    pub fn map(
        &mut self,
        ept: &mut NestedPageTable,
        va: u64,
        gpa: u64,
        writable: bool,
        executable: bool,
    ) -> crate::Result<()> {
        let vaddr = VAddr::from(va);
        let table_flags = PML4Flags::P | PML4Flags::RW;

        let pml4e_gpa = self.root + pml4_index(vaddr) as u64 * ENTRY_SIZE;
        let pml4e = PML4Entry(read_entry(ept, pml4e_gpa)?);
        let pdpt = if pml4e.is_present() {
            pml4e.address().as_u64()
        } else {
            let table = self.allocate_table(ept)?;
            write_entry(ept, pml4e_gpa, PML4Entry::new(PAddr::from(table), table_flags).0)?;
            table
        };

        let pdpte_gpa = pdpt + pdpt_index(vaddr) as u64 * ENTRY_SIZE;
        let pdpte = PDPTEntry(read_entry(ept, pdpte_gpa)?);
        let pd = if pdpte.is_present() {
            pdpte.address().as_u64()
        } else {
            let table = self.allocate_table(ept)?;
            let flags = PDPTFlags::from_bits_truncate(table_flags.bits());
            write_entry(ept, pdpte_gpa, PDPTEntry::new(PAddr::from(table), flags).0)?;
            table
        };

        let pde_gpa = pd + pd_index(vaddr) as u64 * ENTRY_SIZE;
        let pde = PDEntry(read_entry(ept, pde_gpa)?);
        let pt = if pde.is_present() {
            pde.address().as_u64()
        } else {
            let table = self.allocate_table(ept)?;
            let flags = PDFlags::from_bits_truncate(table_flags.bits());
            write_entry(ept, pde_gpa, PDEntry::new(PAddr::from(table), flags).0)?;
            table
        };

        let mut flags = PTFlags::P;
        flags.set(PTFlags::RW, writable);
        flags.set(PTFlags::XD, !executable);
        let pte_gpa = pt + pt_index(vaddr) as u64 * ENTRY_SIZE;
        write_entry(ept, pte_gpa, PTEntry::new(PAddr::from(gpa & !0xfff), flags).0)
    }

    /// Maps `size` bytes of contiguous guest physical memory at `va`.
    pub fn map_range(
        &mut self,
        ept: &mut NestedPageTable,
        va: u64,
        gpa: u64,
        size: u64,
        writable: bool,
        executable: bool,
    ) -> crate::Result<()> {
        trace!("Guest VA {va:#x} -> GPA {gpa:#x} ({size:#x} bytes, w={writable} x={executable})");
        for offset in (0..size).step_by(size_of::<Page>()) {
            self.map(ept, va + offset, gpa + offset, writable, executable)?;
        }
        Ok(())
    }

    /// Clears the leaf entries of `size` bytes at `va`. Tables stay in place
    /// for the next mapping of the range.
    pub fn unmap_range(&mut self, ept: &mut NestedPageTable, va: u64, size: u64) -> crate::Result<()> {
        for offset in (0..size).step_by(size_of::<Page>()) {
            if let Some(pte_gpa) = leaf_entry(ept, self.root, va + offset) {
                write_entry(ept, pte_gpa, 0)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_next_table(&mut self, gpa: u64) -> u64 {
        core::mem::replace(&mut self.next_table, gpa)
    }

    fn allocate_table(&mut self, ept: &mut NestedPageTable) -> crate::Result<u64> {
        let table = self.next_table;
        if table + size_of::<Page>() as u64 > layout::GUEST_PAGE_TABLE_POOL_END {
            return Err(HypervisorError::GuestPageTablesExhausted);
        }
        ept.write(table, &[0u8; size_of::<Page>()])?;
        self.next_table += size_of::<Page>() as u64;
        Ok(table)
    }
}

/// Translates the guest virtual address `va` with the tables rooted at
/// `cr3`. Nothing is mapped as a side effect; unmapped tables yield `None`.
pub fn translate(ept: &NestedPageTable, cr3: u64, va: u64) -> Option<u64> {
    const GIGABYTE_MASK: u64 = (1 << 30) - 1;
    const TWO_MEGABYTE_MASK: u64 = (1 << 21) - 1;

    let vaddr = VAddr::from(va);
    let root = cr3 & !0xfff;

    let pml4e = PML4Entry(read_entry(ept, root + pml4_index(vaddr) as u64 * ENTRY_SIZE).ok()?);
    if !pml4e.is_present() {
        return None;
    }

    let pdpte = PDPTEntry(
        read_entry(ept, pml4e.address().as_u64() + pdpt_index(vaddr) as u64 * ENTRY_SIZE).ok()?,
    );
    if !pdpte.is_present() {
        return None;
    }
    if pdpte.flags().contains(PDPTFlags::PS) {
        return Some((pdpte.address().as_u64() & !GIGABYTE_MASK) | (va & GIGABYTE_MASK));
    }

    let pde = PDEntry(
        read_entry(ept, pdpte.address().as_u64() + pd_index(vaddr) as u64 * ENTRY_SIZE).ok()?,
    );
    if !pde.is_present() {
        return None;
    }
    if pde.flags().contains(PDFlags::PS) {
        return Some((pde.address().as_u64() & !TWO_MEGABYTE_MASK) | (va & TWO_MEGABYTE_MASK));
    }

    let pte = PTEntry(
        read_entry(ept, pde.address().as_u64() + pt_index(vaddr) as u64 * ENTRY_SIZE).ok()?,
    );
    pte.is_present()
        .then(|| pte.address().as_u64() | (va & 0xfff))
}

/// The guest physical address of the 4 KiB leaf entry for `va`, if every
/// table above it is present.
fn leaf_entry(ept: &NestedPageTable, root: u64, va: u64) -> Option<u64> {
    let vaddr = VAddr::from(va);
    let pml4e = PML4Entry(read_entry(ept, root + pml4_index(vaddr) as u64 * ENTRY_SIZE).ok()?);
    if !pml4e.is_present() {
        return None;
    }
    let pdpt = pml4e.address().as_u64();
    let pdpte = PDPTEntry(read_entry(ept, pdpt + pdpt_index(vaddr) as u64 * ENTRY_SIZE).ok()?);
    if !pdpte.is_present() || pdpte.flags().contains(PDPTFlags::PS) {
        return None;
    }
    let pd = pdpte.address().as_u64();
    let pde = PDEntry(read_entry(ept, pd + pd_index(vaddr) as u64 * ENTRY_SIZE).ok()?);
    if !pde.is_present() || pde.flags().contains(PDFlags::PS) {
        return None;
    }
    Some(pde.address().as_u64() + pt_index(vaddr) as u64 * ENTRY_SIZE)
}

fn read_entry(ept: &NestedPageTable, gpa: u64) -> crate::Result<u64> {
    let mut bytes = [0u8; ENTRY_SIZE as usize];
    ept.read(gpa, &mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn write_entry(ept: &mut NestedPageTable, gpa: u64, value: u64) -> crate::Result<()> {
    ept.write(gpa, &value.to_le_bytes())
}
