use thiserror_no_std::Error;

use crate::frames::FrameRole;

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("Processor does not support {0}")]
    VirtualizationUnsupported(&'static str),

    #[error("Virtualization is disabled and locked by firmware")]
    VirtualizationLocked,

    #[error("{instruction} failed")]
    VmInstructionFailed { instruction: &'static str },

    #[error("Control block field {field:#x} rejected by hardware")]
    ControlBlockWrite { field: u32 },

    #[error("Guest entry failed with instruction error {0}")]
    EntryFailed(u64),

    #[error("Invalid VM configuration: {0}")]
    InvalidConfiguration(&'static str),

    #[error("Out of physical frames while allocating {0:?}")]
    OutOfFrames(FrameRole),

    #[error("Out of physical frames for guest memory")]
    OutOfGuestMemory,

    #[error("Guest VM ran out of nested paging structures")]
    NestedPagingStructuresExhausted,

    #[error("Guest page table area exhausted")]
    GuestPageTablesExhausted,

    #[error("Global offset table window exhausted")]
    GotExhausted,

    #[error("Image window exhausted")]
    ImageWindowExhausted,

    #[error("Guest physical address {gpa:#x} is not backed")]
    UnmappedGuestPhysical { gpa: u64 },

    #[error("Guest wrote to read-only guest physical address {gpa:#x}")]
    WriteToReadOnly { gpa: u64 },

    #[error("Guest fetched an instruction from non-executable guest physical address {gpa:#x}")]
    ExecuteFromNonExecutable { gpa: u64 },

    #[error("Guest virtual address {va:#x} is not mapped")]
    UnmappedGuestVirtual { va: u64 },

    #[error("Unhandled VM exit {0:#x}")]
    UnhandledExit(u64),

    #[error("Malformed VM exit information: {0}")]
    MalformedExit(&'static str),

    #[error("Unsupported IO access to port {port:#x} ({size} bytes)")]
    UnhandledIo { port: u16, size: u8 },

    #[error("Unsupported timer divide configuration {0:#x}")]
    InvalidTimerDivider(u64),

    #[error("Guest triple faulted")]
    TripleFault,

    #[error("Program {0:?} is not provided")]
    UnknownProgram(alloc::string::String),

    #[error("Malformed module image: {0}")]
    MalformedModule(&'static str),

    #[error("Unknown VM {0}")]
    UnknownVm(u64),

    #[error("VM {0} is still attached to its task")]
    VmStillRunning(u64),

    #[error("Scheduler refused to create a task")]
    TaskCreationFailed,
}

pub type Result<T> = core::result::Result<T, HypervisorError>;
