//! Messages other tasks send to a running VM, and the inbox the VM's own task
//! drains between guest entries.

use crate::{
    hardware_vt::ExitSnapshot,
    lapic::LapicSnapshot,
    state::{GuestControlState, GuestRegisters},
    vmexit::RunState,
};
use alloc::{collections::VecDeque, format, string::String, sync::Arc};
use core::{
    fmt::Write,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use serde::Serialize;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DumpFormat {
    Text,
    Json,
}

/// A state dump requested by another task. The requester keeps one reference
/// and polls [`DumpRequest::is_complete`]; the flag turns true at most once.
/// If the VM is destroyed first it stays false.
#[derive(Debug)]
pub struct DumpRequest {
    format: DumpFormat,
    capacity: usize,
    buffer: Mutex<String>,
    complete: AtomicBool,
}

impl DumpRequest {
    pub fn new(format: DumpFormat, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            format,
            capacity,
            buffer: Mutex::new(String::new()),
            complete: AtomicBool::new(false),
        })
    }

    pub fn format(&self) -> DumpFormat {
        self.format
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// The dump text. Empty until the request is complete.
    pub fn contents(&self) -> String {
        if !self.is_complete() {
            return String::new();
        }
        self.buffer.lock().clone()
    }

    /// Stores `text`, truncated to the capacity, and completes the request.
    /// Later calls are ignored.
    pub(crate) fn fulfil(&self, text: &str) {
        if self.is_complete() {
            return;
        }
        let mut end = text.len().min(self.capacity);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        {
            let mut buffer = self.buffer.lock();
            buffer.clear();
            buffer.push_str(&text[..end]);
        }
        self.complete.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub enum IpcMessage {
    Dump(Arc<DumpRequest>),
    /// The host clock says the virtual timer may have expired.
    TimerInterrupt,
    /// A routed device interrupt for the given guest vector.
    Interrupt(u8),
    /// Terminate at the next safe point.
    Close,
}

const NO_DEADLINE: u64 = u64::MAX;

/// The inbox of one VM. Any task may send; only the VM's task receives.
#[derive(Debug)]
pub struct Mailbox {
    queue: Mutex<VecDeque<IpcMessage>>,
    /// A timer interrupt is queued and not yet received.
    timer_outstanding: AtomicBool,
    /// TSC value at which the VM's timer expires, published by its task.
    timer_deadline: AtomicU64,
    /// The VM's task is parked waiting for an interrupt.
    waiting: AtomicBool,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            timer_outstanding: AtomicBool::new(false),
            timer_deadline: AtomicU64::new(NO_DEADLINE),
            waiting: AtomicBool::new(false),
        }
    }
}

impl Mailbox {
    /// Enqueues `message`. Returns whether the VM's task is parked and must
    /// be woken to see it.
    pub fn send(&self, message: IpcMessage) -> bool {
        self.queue.lock().push_back(message);
        self.waiting.load(Ordering::Acquire)
    }

    /// Enqueues a timer interrupt unless one is already outstanding. Returns
    /// `None` if nothing was sent, otherwise whether the task must be woken.
    pub fn send_timer_interrupt(&self) -> Option<bool> {
        if self.timer_outstanding.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(self.send(IpcMessage::TimerInterrupt))
    }

    /// Dequeues the oldest message.
    pub fn receive(&self) -> Option<IpcMessage> {
        let message = self.queue.lock().pop_front()?;
        if matches!(message, IpcMessage::TimerInterrupt) {
            self.timer_outstanding.store(false, Ordering::Release);
        }
        Some(message)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn publish_deadline(&self, deadline: Option<u64>) {
        self.timer_deadline
            .store(deadline.unwrap_or(NO_DEADLINE), Ordering::Release);
    }

    pub fn deadline(&self) -> Option<u64> {
        let deadline = self.timer_deadline.load(Ordering::Acquire);
        (deadline != NO_DEADLINE).then_some(deadline)
    }

    pub fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::Release);
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }
}

/// Everything a dump reports about a VM.
#[derive(Debug, Clone, Serialize)]
pub struct VmDump {
    pub id: u64,
    pub name: String,
    pub state: RunState,
    pub registers: GuestRegisters,
    pub control: GuestControlState,
    pub last_exit: Option<ExitSnapshot>,
    pub lapic: LapicSnapshot,
    pub failure: Option<String>,
}

impl VmDump {
    pub fn render(&self, format: DumpFormat) -> String {
        match format {
            DumpFormat::Json => serde_json::to_string(self)
                .unwrap_or_else(|err| format!("{{\"error\":\"{err}\"}}")),
            DumpFormat::Text => self.render_text(),
        }
    }

    fn render_text(&self) -> String {
        let r = &self.registers;
        let mut text = String::new();
        // Writing to a String cannot fail.
        let _ = writeln!(text, "VM {} ({}) {:?}", self.id, self.name, self.state);
        let _ = writeln!(text, "rax={:#018x} rbx={:#018x} rcx={:#018x}", r.rax, r.rbx, r.rcx);
        let _ = writeln!(text, "rdx={:#018x} rsi={:#018x} rdi={:#018x}", r.rdx, r.rsi, r.rdi);
        let _ = writeln!(text, "rsp={:#018x} rbp={:#018x} r8 ={:#018x}", r.rsp, r.rbp, r.r8);
        let _ = writeln!(text, "r9 ={:#018x} r10={:#018x} r11={:#018x}", r.r9, r.r10, r.r11);
        let _ = writeln!(text, "r12={:#018x} r13={:#018x} r14={:#018x}", r.r12, r.r13, r.r14);
        let _ = writeln!(text, "r15={:#018x} rip={:#018x} rflags={:#x}", r.r15, r.rip, r.rflags);
        let c = &self.control;
        let _ = writeln!(
            text,
            "cr0={:#x} cr3={:#x} cr4={:#x} efer={:#x}",
            c.cr0, c.cr3, c.cr4, c.efer
        );
        if let Some(exit) = &self.last_exit {
            let _ = writeln!(
                text,
                "last exit {:?} (raw {:#x}) qualification={:#x} gpa={:#x} len={}",
                exit.reason,
                exit.raw_reason,
                exit.qualification,
                exit.guest_physical_address,
                exit.instruction_length
            );
        }
        let l = &self.lapic;
        let _ = writeln!(
            text,
            "timer lvt={:#x} initial={} current={} divider={} armed={} requested={:?} in_service={:?}",
            l.lvt_timer, l.initial_count, l.current_count, l.divider, l.armed, l.requested, l.in_service
        );
        if let Some(failure) = &self.failure {
            let _ = writeln!(text, "terminated: {failure}");
        }
        text
    }
}
