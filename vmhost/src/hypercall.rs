//! The guest hypercall ABI: exit, host physical address queries, PCI device
//! and interrupt attachment, and module loading.
//!
//! The hypercall number is passed in RAX and arguments in RDI, RSI and RDX.
//! Results come back in RAX (and RDI/RSI for `LOAD_MODULE`); a failure is a
//! negative [`HypercallError::code`] in RAX.

use crate::{
    ept::{GuestPhysicalRegion, RegionKind},
    error::HypervisorError,
    guest_paging,
    hardware_vt::GuestField,
    layout::{self, GuestRegion},
    modules::LoadTarget,
    page_align_up,
    pci::{InterruptKind, PciAddress, PciBar, BAR_COUNT},
    vm::Vm,
};
use alloc::vec::Vec;
use log::{debug, warn};
use serde::Serialize;
use thiserror_no_std::Error;

pub const EXIT: u64 = 0x000;
pub const GET_HOST_PHYSICAL_ADDRESS: u64 = 0x100;
pub const ATTACH_PCI_DEVICE: u64 = 0x200;
pub const ATTACH_INTERRUPT: u64 = 0x201;
pub const LOAD_MODULE: u64 = 0x1000;

/// Failures reported to the guest. None of them terminates the VM.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypercallError {
    #[error("Unknown hypercall")]
    Unknown,

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Device or interrupt already attached")]
    AlreadyAttached,

    #[error("Module already loaded")]
    DuplicateModule,

    #[error("Address not mapped")]
    NotMapped,

    #[error("Out of guest memory")]
    OutOfMemory,

    #[error("Not supported by the device")]
    Unsupported,
}

impl HypercallError {
    /// The value written to the guest's RAX.
    pub fn code(self) -> i64 {
        match self {
            Self::Unknown => -1,
            Self::InvalidArgument => -2,
            Self::AlreadyAttached => -3,
            Self::DuplicateModule => -4,
            Self::NotMapped => -5,
            Self::OutOfMemory => -6,
            Self::Unsupported => -7,
        }
    }
}

/// What the dispatcher does after a hypercall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypercallOutcome {
    Resume,
    Exit,
}

/// A PCI device attached to a VM, with everything needed to undo it.
#[derive(Debug, Clone, Serialize)]
pub struct AttachedDevice {
    pub address: PciAddress,
    /// The guest window holding the configuration page and memory BARs.
    pub window: GuestRegion,
    /// IO BARs passed through to the guest, as `(base, count)`.
    pub io_ranges: Vec<(u16, u32)>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AttachedInterrupt {
    pub device: PciAddress,
    pub kind: InterruptKind,
    pub host_vector: u8,
    pub guest_vector: u8,
}

/// First vector a device interrupt may be delivered on.
const FIRST_DEVICE_VECTOR: u64 = 32;

type HypercallResult<T> = core::result::Result<T, HypercallError>;

impl Vm {
    /// Serves the hypercall in the guest registers. `Err` is reserved for
    /// conditions that terminate the VM.
    pub(crate) fn handle_hypercall(&mut self) -> crate::Result<HypercallOutcome> {
        let number = self.regs.rax;
        let (rdi, rsi, rdx) = (self.regs.rdi, self.regs.rsi, self.regs.rdx);
        debug!("VM {}: hypercall {number:#x} ({rdi:#x}, {rsi:#x}, {rdx:#x})", self.id);

        let result = match number {
            EXIT => return Ok(HypercallOutcome::Exit),
            GET_HOST_PHYSICAL_ADDRESS => self.host_physical_address(rdi),
            ATTACH_PCI_DEVICE => self.attach_pci_device(rdi)?,
            ATTACH_INTERRUPT => self.attach_interrupt(rdi, rsi, rdx),
            LOAD_MODULE => self.load_module(rdi, rsi)?,
            _ => Err(HypercallError::Unknown),
        };
        self.regs.rax = match result {
            Ok(value) => value,
            Err(err) => {
                debug!("VM {}: hypercall {number:#x} failed: {err}", self.id);
                err.code() as u64
            }
        };
        Ok(HypercallOutcome::Resume)
    }

    /// Translates a guest virtual address through the guest page tables and
    /// the nested page table. Never maps anything.
    fn host_physical_address(&self, va: u64) -> HypercallResult<u64> {
        let cr3 = self
            .vt
            .guest_field(GuestField::Cr3)
            .map_err(|_| HypercallError::NotMapped)?;
        let gpa = guest_paging::translate(&self.ept, cr3, va).ok_or(HypercallError::NotMapped)?;
        self.ept
            .translate(gpa)
            .map(|translation| translation.pa)
            .ok_or(HypercallError::NotMapped)
    }

    fn attach_pci_device(&mut self, raw: u64) -> crate::Result<HypercallResult<u64>> {
        let Some(address) = PciAddress::from_raw(raw) else {
            return Ok(Err(HypercallError::InvalidArgument));
        };
        let pci = self.host.pci.clone();
        let Some(config_space) = pci.config_space(address) else {
            return Ok(Err(HypercallError::InvalidArgument));
        };
        let slot = self.next_device_window;
        if slot >= layout::MAX_ATTACHED_DEVICES {
            return Ok(Err(HypercallError::OutOfMemory));
        }

        // Lay out the window before claiming anything so that a device that
        // does not fit leaves no trace.
        let mut memory_bars = Vec::new();
        let mut io_ranges = Vec::new();
        let mut offset = page_align_up(1);
        for index in 0..BAR_COUNT {
            match pci.bar(address, index) {
                Some(PciBar::Memory { base, size }) => {
                    let size = page_align_up(size);
                    if offset + size > layout::DEVICE_WINDOW_SIZE {
                        warn!("PCI {address}: BAR {index} does not fit the device window");
                        return Ok(Err(HypercallError::Unsupported));
                    }
                    memory_bars.push((offset, base, size));
                    offset += size;
                }
                Some(PciBar::Io { base, size }) => io_ranges.push((base, size)),
                None => {}
            }
        }

        if !self.devices.claim(address, self.id) {
            return Ok(Err(HypercallError::AlreadyAttached));
        }
        let window = GuestRegion {
            gpa: layout::DEVICE_GPA + slot * layout::DEVICE_WINDOW_SIZE,
            va: layout::DEVICE_VA + slot * layout::DEVICE_WINDOW_SIZE,
            size: offset,
        };
        if let Err(err) = self.map_device_window(&window, config_space, &memory_bars) {
            self.unmap_device_window(&window)?;
            self.devices.release(address, self.id);
            return Self::exhaustion_to_guest(err);
        }

        self.next_device_window += 1;
        self.attached.push(AttachedDevice {
            address,
            window,
            io_ranges: io_ranges.clone(),
        });
        for (base, count) in io_ranges {
            self.io.pass_through(base, count);
        }
        self.write_io_bitmap();

        debug!("VM {}: PCI {address} attached at {:#x}", self.id, window.va);
        Ok(Ok(window.va))
    }

    /// Maps the configuration page read-only at the start of `window` and
    /// each memory BAR, `(offset, host base, size)`, behind it.
    fn map_device_window(
        &mut self,
        window: &GuestRegion,
        config_space: u64,
        memory_bars: &[(u64, u64, u64)],
    ) -> crate::Result<()> {
        let pages = core::iter::once((0, config_space, page_align_up(1), false))
            .chain(memory_bars.iter().map(|&(offset, base, size)| (offset, base, size, true)));
        for (offset, host_base, size, writable) in pages {
            self.ept.add_region(GuestPhysicalRegion {
                gpa: window.gpa + offset,
                size,
                kind: RegionKind::Device { host_base, writable },
            });
            self.tables.map_range(
                &mut self.ept,
                window.va + offset,
                window.gpa + offset,
                size,
                writable,
                false,
            )?;
        }
        Ok(())
    }

    /// Undoes a partial [`Vm::map_device_window`].
    fn unmap_device_window(&mut self, window: &GuestRegion) -> crate::Result<()> {
        self.tables.unmap_range(&mut self.ept, window.va, window.size)?;
        if self.ept.discard(window.gpa, window.size) {
            self.vt.invalidate_caches();
        }
        Ok(())
    }

    fn attach_interrupt(&mut self, handle: u64, kind: u64, vector: u64) -> HypercallResult<u64> {
        let device = self
            .attached
            .iter()
            .find(|device| device.window.va == handle)
            .map(|device| device.address)
            .ok_or(HypercallError::InvalidArgument)?;
        let kind = InterruptKind::from_raw(kind).ok_or(HypercallError::InvalidArgument)?;
        if !(FIRST_DEVICE_VECTOR..=0xff).contains(&vector) {
            return Err(HypercallError::InvalidArgument);
        }
        if self
            .interrupts
            .iter()
            .any(|interrupt| interrupt.device == device && interrupt.kind == kind)
        {
            return Err(HypercallError::AlreadyAttached);
        }
        let host_vector = self
            .host
            .pci
            .route_interrupt(device, kind)
            .ok_or(HypercallError::Unsupported)?;

        let guest_vector = vector as u8;
        self.devices
            .add_route(host_vector, device, self.id, guest_vector, self.mailbox.clone());
        self.interrupts.push(AttachedInterrupt {
            device,
            kind,
            host_vector,
            guest_vector,
        });
        Ok(0)
    }

    fn load_module(&mut self, id: u64, expected_size: u64) -> crate::Result<HypercallResult<u64>> {
        if self.modules.contains(id) {
            return Ok(Err(HypercallError::DuplicateModule));
        }
        let Some(image) = self.host.modules.module(id) else {
            return Ok(Err(HypercallError::InvalidArgument));
        };
        if expected_size != 0 && expected_size != image.size() {
            return Ok(Err(HypercallError::InvalidArgument));
        }

        let target = LoadTarget {
            memory: self.host.frames.as_ref(),
            ept: &mut self.ept,
            tables: &mut self.tables,
        };
        let loaded = match self.modules.load(&image, target) {
            Ok(loaded) => loaded,
            Err(HypervisorError::MalformedModule(what)) => {
                warn!("VM {}: module {id:#x} rejected: {what}", self.id);
                return Ok(Err(HypercallError::InvalidArgument));
            }
            Err(err) => return Self::exhaustion_to_guest(err),
        };
        if loaded.remapped {
            self.vt.invalidate_caches();
        }
        debug!(
            "VM {}: module {id:#x} loaded at {:#x}, GOT {:#x} bytes",
            self.id, loaded.image_va, loaded.got_size
        );
        self.regs.rdi = loaded.got_va;
        self.regs.rsi = loaded.got_size;
        Ok(Ok(loaded.image_va))
    }

    /// Bounded guest windows running out is the guest's problem; running out
    /// of host frames or nested tables terminates the VM.
    fn exhaustion_to_guest(err: HypervisorError) -> crate::Result<HypercallResult<u64>> {
        match err {
            HypervisorError::GotExhausted
            | HypervisorError::GuestPageTablesExhausted
            | HypervisorError::ImageWindowExhausted => Ok(Err(HypercallError::OutOfMemory)),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let codes = [
            HypercallError::Unknown,
            HypercallError::InvalidArgument,
            HypercallError::AlreadyAttached,
            HypercallError::DuplicateModule,
            HypercallError::NotMapped,
            HypercallError::OutOfMemory,
            HypercallError::Unsupported,
        ]
        .map(HypercallError::code);
        assert_eq!(codes, [-1, -2, -3, -4, -5, -6, -7]);
        assert_eq!(HypercallError::NotMapped.code() as u64, 0xffff_ffff_ffff_fffb);
    }

    #[test]
    fn bounded_windows_running_out_is_reported_to_the_guest() {
        for err in [
            HypervisorError::GotExhausted,
            HypervisorError::GuestPageTablesExhausted,
            HypervisorError::ImageWindowExhausted,
        ] {
            assert_eq!(Vm::exhaustion_to_guest(err).unwrap(), Err(HypercallError::OutOfMemory));
        }
        assert!(Vm::exhaustion_to_guest(HypervisorError::OutOfGuestMemory).is_err());
        assert!(Vm::exhaustion_to_guest(HypervisorError::NestedPagingStructuresExhausted).is_err());
    }
}
