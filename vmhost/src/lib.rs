//! This crate provides the hardware-assisted virtualization layer of the
//! kernel: creating, running and tearing down guest VMs on Intel VMX or AMD SVM.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

pub mod hardware_vt;

pub mod x86_instructions;

pub mod x86_data;

pub mod error;

pub use error::HypervisorError as Error;
pub use error::Result;

pub mod frames;

pub mod layout;

pub mod state;

pub mod control_block;

pub mod ept;

pub mod guest_paging;

pub mod lapic;

pub mod ipc;

pub mod pci;

pub mod modules;

pub mod hypercall;

pub mod vmexit;

pub mod vm;

pub mod hypervisor;

mod diagnostics;

#[cfg(test)]
mod testing;

/// A 4 KiB page, page aligned so that `Box<Page>` is usable as a frame.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(4096))]
pub struct Page([u8; BASE_PAGE_SIZE]);

const _: () = assert!(size_of::<Page>() == 0x1000);

/// Pages needed to hold `size` bytes.
pub(crate) fn size_to_pages(size: usize) -> usize {
    const PAGE_MASK: usize = 0xfff;

    (size >> BASE_PAGE_SHIFT) + usize::from((size & PAGE_MASK) != 0)
}

/// Rounds `value` up to the next page boundary.
pub(crate) fn page_align_up(value: u64) -> u64 {
    (value + 0xfff) & !0xfff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_to_pages_rounds_up() {
        assert_eq!(size_to_pages(0), 0);
        assert_eq!(size_to_pages(1), 1);
        assert_eq!(size_to_pages(0x1000), 1);
        assert_eq!(size_to_pages(0x1001), 2);
    }

    #[test]
    fn page_align_up_keeps_aligned_values() {
        assert_eq!(page_align_up(0x2000), 0x2000);
        assert_eq!(page_align_up(0x2001), 0x3000);
    }
}
