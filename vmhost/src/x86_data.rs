//! Architectural data structures the guest boots with.

/// Size of the 64-bit task state segment.
pub const TSS_SIZE: usize = 104;

/// The 64-bit task state segment. Reserved fields are implied by
/// [`Tss::to_bytes`].
#[derive(Debug, Default, Clone)]
pub struct Tss {
    pub rsp: [u64; 3],
    pub ist: [u64; 7],
    pub iomap_base: u16,
}

impl Tss {
    /// A TSS without an IO permission map.
    pub fn without_io_map() -> Self {
        Self {
            iomap_base: TSS_SIZE as u16,
            ..Self::default()
        }
    }

    /// Serializes the TSS into its in-memory layout.
    pub fn to_bytes(&self) -> [u8; TSS_SIZE] {
        let mut bytes = [0u8; TSS_SIZE];
        for (i, rsp) in self.rsp.iter().enumerate() {
            let offset = 4 + i * 8;
            bytes[offset..offset + 8].copy_from_slice(&rsp.to_le_bytes());
        }
        for (i, ist) in self.ist.iter().enumerate() {
            let offset = 36 + i * 8;
            bytes[offset..offset + 8].copy_from_slice(&ist.to_le_bytes());
        }
        bytes[102..104].copy_from_slice(&self.iomap_base.to_le_bytes());
        bytes
    }
}

/// A segment register value the way the hardware caches it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SegmentState {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    /// Packed attributes: access byte in bits 7:0, flags nibble in bits 11:8.
    pub attributes: u16,
}

impl SegmentState {
    /// A null, unusable segment.
    pub const UNUSABLE: Self = Self {
        selector: 0,
        base: 0,
        limit: 0,
        attributes: 0,
    };

    /// Decodes a segment from its GDT descriptor value.
    pub fn from_descriptor(selector: u16, descriptor: u64) -> Self {
        let limit_low = descriptor & 0xffff;
        let limit_high = (descriptor >> (32 + 16)) & 0xf;
        let mut limit = limit_low | (limit_high << 16);
        if (descriptor >> (32 + 23)) & 1 != 0 {
            limit = ((limit + 1) << 12) - 1;
        }
        let base = ((descriptor >> 16) & 0xff_ffff) | (((descriptor >> 56) & 0xff) << 24);
        let access = (descriptor >> 40) & 0xff;
        let flags = (descriptor >> 52) & 0xf;
        Self {
            selector,
            base,
            limit: limit as u32,
            attributes: (access | (flags << 8)) as u16,
        }
    }

    pub fn is_usable(&self) -> bool {
        // Present bit.
        self.attributes & 0x80 != 0
    }

    /// The VMX access-rights encoding of this segment.
    pub fn vmx_access_rights(&self) -> u32 {
        const UNUSABLE: u32 = 1 << 16;
        if !self.is_usable() {
            return UNUSABLE;
        }
        let attributes = u32::from(self.attributes);
        (attributes & 0xff) | ((attributes & 0xf00) << 4)
    }
}

/// The GDT the guest starts with: null, 64-bit code, data, and a 16-byte TSS
/// descriptor for a TSS at `tss_base`.
pub fn guest_gdt(tss_base: u64) -> [u64; 5] {
    const CODE64: u64 = 0x0020_9b00_0000_0000;
    const DATA: u64 = 0x0000_9300_0000_0000;
    const TSS_LIMIT: u64 = 0x67;
    const TSS_BUSY_PRESENT: u64 = 0x8b << 40;

    let tss_low = TSS_LIMIT
        | ((tss_base & 0xff_ffff) << 16)
        | TSS_BUSY_PRESENT
        | (((tss_base >> 24) & 0xff) << 56);
    [0, CODE64, DATA, tss_low, tss_base >> 32]
}
