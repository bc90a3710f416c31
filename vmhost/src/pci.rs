//! The PCI collaborator interface and the host-wide record of which VM owns
//! which device and interrupt route.

use crate::ipc::{IpcMessage, Mailbox};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use bitfield::bitfield;
use core::fmt;
use log::debug;
use serde::Serialize;
use spin::Mutex;

bitfield! {
    /// A PCI function in the hypercall encoding.
    /*
         33222222 22221111 11111100 00000000
         10987654 32109876 54321098 76543210
        +--------+--------+--------+--------+
        | group  |  bus   | device |function|
        +--------+--------+--------+--------+
    */
    #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
    pub struct PciAddress(u32);
    impl Debug;
    pub function, set_function: 7, 0;
    pub device, set_device: 15, 8;
    pub bus, set_bus: 23, 16;
    pub group, set_group: 31, 24;
}

impl PciAddress {
    /// Decodes a hypercall argument, rejecting impossible device or
    /// function numbers.
    pub fn from_raw(raw: u64) -> Option<Self> {
        let address = Self(u32::try_from(raw).ok()?);
        (address.device() < 32 && address.function() < 8).then_some(address)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.group(),
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

/// A decoded base address register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciBar {
    Memory { base: u64, size: u64 },
    Io { base: u16, size: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InterruptKind {
    Legacy,
    Msi,
    MsiX,
}

impl InterruptKind {
    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::Legacy,
            1 => Self::Msi,
            2 => Self::MsiX,
            _ => return None,
        })
    }
}

/// Number of BARs of a type 0 header.
pub const BAR_COUNT: u8 = 6;

/// The PCI bus as enumerated by the host kernel.
pub trait PciBus: Send + Sync {
    /// Physical address of the 4 KiB configuration space of `address`, or
    /// `None` if no such function exists.
    fn config_space(&self, address: PciAddress) -> Option<u64>;

    /// The decoded BAR `index`, or `None` if it is unimplemented.
    fn bar(&self, address: PciAddress, index: u8) -> Option<PciBar>;

    /// Routes the device's interrupt of `kind` to a host vector and returns
    /// that vector. `None` if the device does not support `kind`.
    fn route_interrupt(&self, address: PciAddress, kind: InterruptKind) -> Option<u8>;

    /// Undoes [`PciBus::route_interrupt`].
    fn unroute_interrupt(&self, address: PciAddress, host_vector: u8);
}

#[derive(Debug)]
struct Route {
    host_vector: u8,
    device: PciAddress,
    vm: u64,
    guest_vector: u8,
    mailbox: Arc<Mailbox>,
}

/// Host-wide ownership of PCI devices and interrupt routes, shared by every
/// VM of a [`Hypervisor`](crate::hypervisor::Hypervisor).
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    owners: Mutex<BTreeMap<PciAddress, u64>>,
    routes: Mutex<Vec<Route>>,
}

impl DeviceRegistry {
    /// Records `vm` as the owner of `device`. Fails if any VM owns it.
    pub fn claim(&self, device: PciAddress, vm: u64) -> bool {
        let mut owners = self.owners.lock();
        if owners.contains_key(&device) {
            return false;
        }
        owners.insert(device, vm);
        debug!("PCI {device} attached to VM {vm}");
        true
    }

    pub fn owner(&self, device: PciAddress) -> Option<u64> {
        self.owners.lock().get(&device).copied()
    }

    pub fn release(&self, device: PciAddress, vm: u64) {
        let mut owners = self.owners.lock();
        if owners.get(&device) == Some(&vm) {
            owners.remove(&device);
        }
    }

    pub fn add_route(
        &self,
        host_vector: u8,
        device: PciAddress,
        vm: u64,
        guest_vector: u8,
        mailbox: Arc<Mailbox>,
    ) {
        debug!("Host vector {host_vector} -> VM {vm} vector {guest_vector}");
        self.routes.lock().push(Route {
            host_vector,
            device,
            vm,
            guest_vector,
            mailbox,
        });
    }

    /// Removes every route of `vm` and returns the `(device, host_vector)`
    /// pairs to unroute on the bus.
    pub fn remove_routes(&self, vm: u64) -> Vec<(PciAddress, u8)> {
        let mut removed = Vec::new();
        self.routes.lock().retain(|route| {
            if route.vm == vm {
                removed.push((route.device, route.host_vector));
                false
            } else {
                true
            }
        });
        removed
    }

    /// Queues an interrupt for every VM routed to `host_vector`. Returns the
    /// VMs whose tasks are parked and must be woken.
    pub fn deliver(&self, host_vector: u8) -> Vec<u64> {
        let routes = self.routes.lock();
        routes
            .iter()
            .filter(|route| route.host_vector == host_vector)
            .filter_map(|route| {
                route
                    .mailbox
                    .send(IpcMessage::Interrupt(route.guest_vector))
                    .then_some(route.vm)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_fields_follow_hypercall_encoding() {
        let address = PciAddress::from_raw(0x0201_0302).unwrap();
        assert_eq!(address.group(), 2);
        assert_eq!(address.bus(), 1);
        assert_eq!(address.device(), 3);
        assert_eq!(address.function(), 2);
        assert_eq!(address.to_string(), "0002:01:03.2");
        assert!(PciAddress::from_raw(0x0001_0308).is_none());
        assert!(PciAddress::from_raw(0x20 << 8).is_none());
        assert!(PciAddress::from_raw(1 << 32).is_none());
    }

    #[test]
    fn devices_have_one_owner() {
        let registry = DeviceRegistry::default();
        let device = PciAddress::from_raw(0x100).unwrap();
        assert!(registry.claim(device, 1));
        assert!(!registry.claim(device, 2));
        registry.release(device, 2);
        assert_eq!(registry.owner(device), Some(1));
        registry.release(device, 1);
        assert!(registry.claim(device, 2));
    }

    #[test]
    fn host_interrupts_reach_routed_vms() {
        let registry = DeviceRegistry::default();
        let device = PciAddress::from_raw(0x100).unwrap();
        let first = Arc::new(Mailbox::default());
        let second = Arc::new(Mailbox::default());
        second.set_waiting(true);
        registry.add_route(0x50, device, 1, 0x30, first.clone());
        registry.add_route(0x50, device, 2, 0x31, second.clone());
        registry.add_route(0x51, device, 2, 0x32, second.clone());

        assert_eq!(registry.deliver(0x50), [2]);
        assert!(matches!(first.receive(), Some(IpcMessage::Interrupt(0x30))));
        assert!(matches!(second.receive(), Some(IpcMessage::Interrupt(0x31))));
        assert!(second.receive().is_none());

        assert_eq!(registry.remove_routes(2).len(), 2);
        assert!(registry.deliver(0x51).is_empty());
    }
}
