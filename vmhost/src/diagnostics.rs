//! Fatal-exit diagnostics.

use crate::{ept::NestedPageTable, guest_paging};
use alloc::string::String;
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};

const MAX_INSTRUCTION_BYTES: usize = 15;

/// Reads up to 15 bytes at `rip`, stopping at the first page that is not
/// mapped. Nothing is mapped as a side effect.
fn instruction_bytes(ept: &NestedPageTable, cr3: u64, rip: u64) -> ([u8; MAX_INSTRUCTION_BYTES], usize) {
    let mut bytes = [0u8; MAX_INSTRUCTION_BYTES];
    let mut len = 0;
    while len < MAX_INSTRUCTION_BYTES {
        let va = rip.wrapping_add(len as u64);
        let Some(gpa) = guest_paging::translate(ept, cr3, va) else {
            break;
        };
        let chunk = (0x1000 - (va & 0xfff) as usize).min(MAX_INSTRUCTION_BYTES - len);
        if ept.read(gpa, &mut bytes[len..len + chunk]).is_err() {
            break;
        }
        len += chunk;
    }
    (bytes, len)
}

/// Disassembles the instruction at the guest `rip`, e.g. `"ud2"`.
pub(crate) fn disassemble(ept: &NestedPageTable, cr3: u64, rip: u64) -> Option<String> {
    let (bytes, len) = instruction_bytes(ept, cr3, rip);
    if len == 0 {
        return None;
    }
    let mut decoder = Decoder::with_ip(64, &bytes[..len], rip, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    decoder.decode_out(&mut instruction);
    if instruction.is_invalid() {
        return None;
    }
    let mut output = String::new();
    IntelFormatter::new().format(&instruction, &mut output);
    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ept::{GuestPhysicalRegion, RegionKind, NESTED_TABLE_POOL},
        guest_paging::GuestPageTables,
        layout,
        testing::{test_flags, HeapFrameAllocator},
    };
    use alloc::sync::Arc;

    fn guest_with_code(code: &[u8], offset: u64) -> (Arc<HeapFrameAllocator>, NestedPageTable, u64) {
        let allocator = Arc::new(HeapFrameAllocator::new(NESTED_TABLE_POOL + 32));
        let mut ept = NestedPageTable::new(allocator.clone(), test_flags()).unwrap();
        ept.add_region(GuestPhysicalRegion {
            gpa: 0x1000,
            size: layout::IMAGE_GPA_END - 0x1000,
            kind: RegionKind::DemandRam,
        });
        ept.write(layout::GUEST_PAGE_TABLE_ROOT_GPA, &[0u8; 0x1000]).unwrap();
        let mut tables = GuestPageTables::new();
        tables
            .map(&mut ept, layout::IMAGE_VA, layout::IMAGE_GPA, false, true)
            .unwrap();
        ept.write(layout::IMAGE_GPA + offset, code).unwrap();
        (allocator, ept, tables.root())
    }

    #[test]
    fn decodes_instruction_at_rip() {
        let (_allocator, ept, cr3) = guest_with_code(&[0x0f, 0x0b], 0x10);
        let text = disassemble(&ept, cr3, layout::IMAGE_VA + 0x10).unwrap();
        assert_eq!(text, "ud2");
        ept.release();
    }

    #[test]
    fn stops_at_unmapped_page() {
        // `hlt` is the last byte of the only mapped page.
        let (_allocator, ept, cr3) = guest_with_code(&[0xf4], 0xfff);
        assert_eq!(instruction_bytes(&ept, cr3, layout::IMAGE_VA + 0xfff).1, 1);
        assert_eq!(disassemble(&ept, cr3, layout::IMAGE_VA + 0xfff).unwrap(), "hlt");
        assert_eq!(disassemble(&ept, cr3, layout::IMAGE_VA + 0x1000), None);
        ept.release();
    }
}
