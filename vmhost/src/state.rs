//! Guest register state as saved by the context switch, and the serializable
//! views of it used by dumps.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Guest general purpose registers, RIP, RFLAGS and the FXSAVE area, as
/// saved by the context switch.
///
/// The layout is shared with the context switch assembly, which addresses
/// fields by their offsets. `rip`, `rsp` and `rflags` are synchronized with
/// the control block by the backend around each entry.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    #[serde(skip)]
    pub fx: FxSaveArea,
}

impl GuestRegisters {
    /// Returns the register named by the hardware GPR encoding (0 = RAX,
    /// 1 = RCX, 2 = RDX, 3 = RBX, 4 = RSP, 5 = RBP, 6 = RSI, 7 = RDI,
    /// 8-15 = R8-R15).
    pub fn gpr_mut(&mut self, index: u8) -> Option<&mut u64> {
        Some(match index {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            15 => &mut self.r15,
            _ => return None,
        })
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.rflags & RFLAGS_IF != 0
    }
}

pub const RFLAGS_IF: u64 = 1 << 9;

/// The legacy FXSAVE area.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C, align(16))]
pub struct FxSaveArea {
    pub fcw: u16,
    pub fsw: u16,
    pub ftw: u8,
    reserved_0: u8,
    pub fop: u16,
    pub fip: u64,
    pub fdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub st: [M128A; 8],
    pub xmm: [M128A; 16],
    reserved_1: [M128A; 6],
}

const _: () = assert!(size_of::<FxSaveArea>() == 512);

impl FxSaveArea {
    /// Power-on FPU and SSE state: all exceptions masked.
    pub fn initial() -> Self {
        Self {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Self::default()
        }
    }
}

#[repr(C)]
#[repr(align(16))]
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct M128A {
    pub low: u64,
    pub high: i64,
}

impl fmt::Debug for M128A {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:#018x}, {:#018x})", self.low, self.high)
    }
}

/// Guest control registers captured for diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestControlState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}
