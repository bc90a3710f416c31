//! The per-VM software local APIC: the x2APIC timer registers, the
//! requested-vector bitmap and EOI bookkeeping.

use crate::{error::HypervisorError, frames::FrameAllocator};
use alloc::vec::Vec;
use bit_vec::BitVec;
use log::trace;
use serde::Serialize;

/// x2APIC MSR numbers handled by the virtual LAPIC.
pub mod x2apic {
    pub const EOI: u32 = 0x80b;
    pub const LVT_TIMER: u32 = 0x832;
    pub const INITIAL_COUNT: u32 = 0x838;
    pub const CURRENT_COUNT: u32 = 0x839;
    pub const DIVIDE_CONFIGURATION: u32 = 0x83e;
}

const LVT_MASKED: u32 = 1 << 16;
const LVT_PERIODIC: u32 = 1 << 17;

/// Vectors below this are exceptions and are never requested.
const FIRST_INTERRUPT_VECTOR: u8 = 16;

const VAPIC_ISR: usize = 0x100;
const VAPIC_IRR: usize = 0x200;

/// Decodes the divide configuration register (bits 0, 1 and 3).
fn decode_divider(config: u64) -> crate::Result<u64> {
    Ok(match config {
        0x0 => 2,
        0x1 => 4,
        0x2 => 8,
        0x3 => 16,
        0x8 => 32,
        0x9 => 64,
        0xa => 128,
        0xb => 1,
        _ => return Err(HypervisorError::InvalidTimerDivider(config)),
    })
}

/// Serializable view of the LAPIC for dumps.
#[derive(Debug, Clone, Serialize)]
pub struct LapicSnapshot {
    pub initial_count: u32,
    pub current_count: u32,
    pub divider: u64,
    pub lvt_timer: u32,
    pub armed: bool,
    pub requested: Vec<u8>,
    pub in_service: Option<u8>,
    pub eoi_pending: bool,
}

#[derive(Debug, Clone)]
pub struct VirtualLapic {
    initial_count: u32,
    current_count: u32,
    divide_configuration: u64,
    divider: u64,
    lvt_timer: u32,
    /// Whether the countdown is running.
    armed: bool,
    /// TSC value up to which the countdown has been advanced.
    last_tsc: u64,
    tsc_per_tick: u64,
    requested: BitVec,
    in_service: Option<u8>,
    eoi_pending: bool,
}

impl VirtualLapic {
    /// A LAPIC in its reset state: timer masked and disarmed, divide by 2.
    pub fn new(now: u64, tsc_per_tick: u64) -> Self {
        Self {
            initial_count: 0,
            current_count: 0,
            divide_configuration: 0,
            divider: 2,
            lvt_timer: LVT_MASKED,
            armed: false,
            last_tsc: now,
            tsc_per_tick: tsc_per_tick.max(1),
            requested: BitVec::from_elem(256, false),
            in_service: None,
            eoi_pending: false,
        }
    }

    pub fn handles_msr(msr: u32) -> bool {
        matches!(
            msr,
            x2apic::EOI
                | x2apic::LVT_TIMER
                | x2apic::INITIAL_COUNT
                | x2apic::CURRENT_COUNT
                | x2apic::DIVIDE_CONFIGURATION
        )
    }

    pub fn read_msr(&mut self, msr: u32, now: u64) -> u64 {
        match msr {
            x2apic::LVT_TIMER => u64::from(self.lvt_timer),
            x2apic::INITIAL_COUNT => u64::from(self.initial_count),
            x2apic::CURRENT_COUNT => {
                self.advance(now);
                u64::from(self.current_count)
            }
            x2apic::DIVIDE_CONFIGURATION => self.divide_configuration,
            _ => 0,
        }
    }

    pub fn write_msr(&mut self, msr: u32, value: u64, now: u64) -> crate::Result<()> {
        trace!("LAPIC MSR {msr:#x} <- {value:#x}");
        match msr {
            x2apic::LVT_TIMER => {
                self.advance(now);
                self.lvt_timer = value as u32;
            }
            x2apic::INITIAL_COUNT => {
                self.initial_count = value as u32;
                self.current_count = self.initial_count;
                self.armed = self.initial_count != 0;
                self.last_tsc = now;
            }
            x2apic::DIVIDE_CONFIGURATION => {
                let divider = decode_divider(value)?;
                // Time elapsed so far counts at the old rate.
                self.advance(now);
                self.divide_configuration = value;
                self.divider = divider;
            }
            x2apic::EOI => self.end_of_interrupt(),
            _ => {}
        }
        Ok(())
    }

    pub fn divider(&self) -> u64 {
        self.divider
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn timer_vector(&self) -> u8 {
        self.lvt_timer as u8
    }

    fn ticks_per_count(&self) -> u64 {
        self.tsc_per_tick * self.divider
    }

    /// Advances the countdown to `now`. Returns whether the timer expired.
    pub fn advance(&mut self, now: u64) -> bool {
        if !self.armed {
            self.last_tsc = now;
            return false;
        }
        let ticks_per_count = self.ticks_per_count();
        let counts = now.saturating_sub(self.last_tsc) / ticks_per_count;
        if counts == 0 {
            return false;
        }
        self.last_tsc += counts * ticks_per_count;

        let current = u64::from(self.current_count);
        if counts < current {
            self.current_count = (current - counts) as u32;
            return false;
        }

        if self.lvt_timer & LVT_PERIODIC != 0 {
            let initial = u64::from(self.initial_count);
            let overshoot = (counts - current) % initial;
            self.current_count = (initial - overshoot) as u32;
        } else {
            self.current_count = 0;
            self.armed = false;
        }
        if self.lvt_timer & LVT_MASKED == 0 {
            self.request(self.timer_vector());
        }
        true
    }

    /// TSC value at which the timer next expires.
    pub fn deadline(&self) -> Option<u64> {
        self.armed
            .then(|| self.last_tsc + u64::from(self.current_count) * self.ticks_per_count())
    }

    /// Marks `vector` as requested.
    pub fn request(&mut self, vector: u8) {
        if vector < FIRST_INTERRUPT_VECTOR {
            trace!("Ignoring request for reserved vector {vector}");
            return;
        }
        self.requested.set(usize::from(vector), true);
    }

    pub fn is_requested(&self, vector: u8) -> bool {
        self.requested.get(usize::from(vector)).unwrap_or(false)
    }

    /// The vector that would be injected next, without taking it.
    pub fn pending(&self) -> Option<u8> {
        if self.eoi_pending {
            return None;
        }
        self.requested.iter().position(|bit| bit).map(|vector| vector as u8)
    }

    /// Takes the next vector to inject: the lowest requested vector, and
    /// only while no vector awaits EOI.
    pub fn next_injection(&mut self) -> Option<u8> {
        let vector = self.pending()?;
        self.requested.set(usize::from(vector), false);
        self.in_service = Some(vector);
        self.eoi_pending = true;
        trace!("Injecting vector {vector}");
        Some(vector)
    }

    pub fn end_of_interrupt(&mut self) {
        self.in_service = None;
        self.eoi_pending = false;
    }

    pub fn in_service(&self) -> Option<u8> {
        self.in_service
    }

    /// Mirrors the requested and in-service vectors into the IRR and ISR
    /// areas of the virtual-APIC page at `pa`.
    pub fn mirror(&self, memory: &dyn FrameAllocator, pa: u64) {
        let page = memory.physical_to_virtual(pa);
        for (i, block) in self.requested.storage().iter().enumerate() {
            let isr = match self.in_service {
                Some(vector) if usize::from(vector) / 32 == i => 1u32 << (vector % 32),
                _ => 0,
            };
            // Safety: `pa` is the VM's virtual-APIC page; both areas are
            // eight 16-byte aligned registers within it.
            unsafe {
                page.add(VAPIC_IRR + i * 0x10).cast::<u32>().write_volatile(*block);
                page.add(VAPIC_ISR + i * 0x10).cast::<u32>().write_volatile(isr);
            }
        }
    }

    pub fn snapshot(&self) -> LapicSnapshot {
        LapicSnapshot {
            initial_count: self.initial_count,
            current_count: self.current_count,
            divider: self.divider,
            lvt_timer: self.lvt_timer,
            armed: self.armed,
            requested: self
                .requested
                .iter()
                .enumerate()
                .filter(|(_, bit)| *bit)
                .map(|(vector, _)| vector as u8)
                .collect(),
            in_service: self.in_service,
            eoi_pending: self.eoi_pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HeapFrameAllocator;

    const TIMER_VECTOR: u64 = 0x30;

    fn periodic_timer(count: u64) -> VirtualLapic {
        let mut lapic = VirtualLapic::new(0, 1);
        lapic
            .write_msr(x2apic::LVT_TIMER, TIMER_VECTOR | u64::from(LVT_PERIODIC), 0)
            .unwrap();
        lapic.write_msr(x2apic::DIVIDE_CONFIGURATION, 0xb, 0).unwrap();
        lapic.write_msr(x2apic::INITIAL_COUNT, count, 0).unwrap();
        lapic
    }

    #[test]
    fn divider_codes() {
        assert_eq!(decode_divider(0x0).unwrap(), 2);
        assert_eq!(decode_divider(0x3).unwrap(), 16);
        assert_eq!(decode_divider(0xa).unwrap(), 128);
        assert_eq!(decode_divider(0xb).unwrap(), 1);
        assert!(matches!(decode_divider(0x4), Err(HypervisorError::InvalidTimerDivider(4))));
    }

    #[test]
    fn divider_write_scales_next_countdown() {
        let mut lapic = VirtualLapic::new(0, 10);
        lapic.write_msr(x2apic::INITIAL_COUNT, 1000, 0).unwrap();
        // Divide by 2: 20 TSC ticks per count.
        lapic.advance(200);
        assert_eq!(lapic.read_msr(x2apic::CURRENT_COUNT, 200), 990);

        lapic.write_msr(x2apic::DIVIDE_CONFIGURATION, 0x3, 200).unwrap();
        assert_eq!(lapic.divider(), 16);
        assert_eq!(lapic.read_msr(x2apic::DIVIDE_CONFIGURATION, 200), 0x3);
        // Divide by 16: 160 TSC ticks per count.
        assert_eq!(lapic.read_msr(x2apic::CURRENT_COUNT, 200 + 1600), 980);
    }

    #[test]
    fn invalid_divider_keeps_previous_value() {
        let mut lapic = VirtualLapic::new(0, 1);
        assert!(lapic.write_msr(x2apic::DIVIDE_CONFIGURATION, 0x7, 0).is_err());
        assert_eq!(lapic.divider(), 2);
    }

    #[test]
    fn one_shot_timer_fires_once() {
        let mut lapic = VirtualLapic::new(0, 1);
        lapic.write_msr(x2apic::LVT_TIMER, TIMER_VECTOR, 0).unwrap();
        lapic.write_msr(x2apic::INITIAL_COUNT, 5, 0).unwrap();
        assert_eq!(lapic.deadline(), Some(10));
        assert!(!lapic.advance(9));
        assert!(lapic.advance(10));
        assert!(lapic.is_requested(TIMER_VECTOR as u8));
        assert!(!lapic.is_armed());
        assert!(!lapic.advance(1000));
        assert_eq!(lapic.deadline(), None);
    }

    #[test]
    fn periodic_timer_reloads() {
        let mut lapic = periodic_timer(100);
        assert!(lapic.advance(250));
        assert!(lapic.is_armed());
        assert_eq!(lapic.read_msr(x2apic::CURRENT_COUNT, 250), 50);
        assert_eq!(lapic.deadline(), Some(300));
    }

    #[test]
    fn masked_timer_counts_without_requesting() {
        let mut lapic = VirtualLapic::new(0, 1);
        lapic
            .write_msr(x2apic::LVT_TIMER, TIMER_VECTOR | u64::from(LVT_MASKED), 0)
            .unwrap();
        lapic.write_msr(x2apic::INITIAL_COUNT, 1, 0).unwrap();
        assert!(lapic.advance(2));
        assert_eq!(lapic.pending(), None);
    }

    #[test]
    fn writing_zero_initial_count_disarms() {
        let mut lapic = periodic_timer(10);
        lapic.write_msr(x2apic::INITIAL_COUNT, 0, 5).unwrap();
        assert!(!lapic.is_armed());
        assert!(!lapic.advance(1000));
    }

    #[test]
    fn injection_respects_priority_and_eoi() {
        let mut lapic = VirtualLapic::new(0, 1);
        lapic.request(0x40);
        lapic.request(0x21);
        assert_eq!(lapic.next_injection(), Some(0x21));
        assert!(!lapic.is_requested(0x21));
        assert_eq!(lapic.in_service(), Some(0x21));
        assert_eq!(lapic.next_injection(), None);

        lapic.write_msr(x2apic::EOI, 0, 0).unwrap();
        assert_eq!(lapic.next_injection(), Some(0x40));
        lapic.end_of_interrupt();
        assert_eq!(lapic.next_injection(), None);
    }

    #[test]
    fn reserved_vectors_are_never_requested() {
        let mut lapic = VirtualLapic::new(0, 1);
        lapic.request(14);
        assert_eq!(lapic.pending(), None);
    }

    #[test]
    fn mirror_writes_irr_and_isr() {
        let allocator = HeapFrameAllocator::new(1);
        let page = crate::frames::allocate_zeroed(&allocator, 1).unwrap();
        let mut lapic = VirtualLapic::new(0, 1);
        lapic.request(0x21);
        lapic.request(0x41);
        lapic.next_injection();
        lapic.mirror(&allocator, page.pa());

        let base = allocator.physical_to_virtual(page.pa());
        let read = |offset: usize| unsafe { base.add(offset).cast::<u32>().read() };
        assert_eq!(read(VAPIC_IRR + 0x20), 1 << 1);
        assert_eq!(read(VAPIC_IRR + 0x10), 0);
        assert_eq!(read(VAPIC_ISR + 0x10), 1 << 1);
        allocator.free(page);
    }
}
