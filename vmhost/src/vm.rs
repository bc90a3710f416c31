//! The module containing the [`Vm`] type: everything one guest owns, how it
//! is built, how its entry loop runs and how it is torn down.

use crate::{
    control_block::{write_msr_bitmap, ControlBlockConfig, GuestEntryState, IoPermissions},
    diagnostics,
    ept::{EntryFlagTable, GuestPhysicalRegion, NestedPageTable, RegionKind},
    error::HypervisorError,
    frames::{FrameRole, FrameTable, FRAME_SIZE},
    guest_paging::GuestPageTables,
    hardware_vt::{ExitSnapshot, GuestField, HardwareVt, InterruptedEvent},
    hypercall::{AttachedDevice, AttachedInterrupt},
    hypervisor::HostInterfaces,
    ipc::{IpcMessage, Mailbox, VmDump},
    lapic::VirtualLapic,
    layout::{self, GuestRegion},
    modules::{LoadTarget, LoadedModule, ModuleImage, ModuleRegistry},
    page_align_up,
    pci::DeviceRegistry,
    state::{FxSaveArea, GuestControlState, GuestRegisters},
    vmexit::{ExitAction, RunState},
    x86_data::{guest_gdt, Tss},
};
use alloc::{
    boxed::Box,
    collections::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use core::ptr::NonNull;
use log::{debug, error, info, trace};

/// Guest entries per scheduling slice before the task yields.
const ENTRIES_PER_SLICE: usize = 256;

/// The per-VM creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDescriptor {
    /// Name of the program to boot, resolved through the module provider.
    pub entry_point: String,
    pub stack_size: u64,
    pub heap_size: u64,
    /// Ports that trap even when an attached device's IO BAR covers them.
    pub trapped_io_ports: Vec<u16>,
    /// Hide the hypervisor from CPUID.
    pub mask_cpuid: bool,
}

impl Default for VmDescriptor {
    fn default() -> Self {
        Self {
            entry_point: String::new(),
            stack_size: layout::DEFAULT_STACK_SIZE,
            heap_size: layout::DEFAULT_HEAP_SIZE,
            trapped_io_ports: Vec::new(),
            mask_cpuid: true,
        }
    }
}

impl VmDescriptor {
    pub fn new(entry_point: &str) -> Self {
        Self {
            entry_point: entry_point.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> crate::Result<()> {
        if self.stack_size == 0 || self.stack_size > layout::MAX_STACK_SIZE {
            return Err(HypervisorError::InvalidConfiguration("stack size"));
        }
        if self.heap_size > layout::MAX_HEAP_SIZE {
            return Err(HypervisorError::InvalidConfiguration("heap size"));
        }
        Ok(())
    }
}

/// What the task driving a VM does after a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Yield to the scheduler and run the next slice.
    Yield,
    /// Park until woken by an interrupt or message.
    Wait,
    /// The VM halted or terminated. Hand it back to the hypervisor.
    Finished,
}

/// The representation of a virtual machine, made up of collection of
/// registers, which is managed through [`HardwareVt`], the frames it owns and
/// its nested paging structures.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Vm {
    pub(crate) id: u64,
    pub(crate) name: String,
    #[derivative(Debug = "ignore")]
    pub(crate) host: HostInterfaces,
    #[derivative(Debug = "ignore")]
    pub(crate) devices: Arc<DeviceRegistry>,

    /// Encapsulates implementation of hardware assisted virtualization
    /// technology, which is capable of managing VM's registers and memory.
    pub(crate) vt: Box<dyn HardwareVt>,

    frames: FrameTable,
    pub(crate) ept: NestedPageTable,
    pub(crate) tables: GuestPageTables,
    pub(crate) modules: ModuleRegistry,

    pub(crate) program: Option<LoadedModule>,
    pub(crate) stack: GuestRegion,
    pub(crate) heap: GuestRegion,

    pub(crate) regs: GuestRegisters,
    /// The register file the context switch works on, at the top of the exit
    /// stack.
    register_file: NonNull<GuestRegisters>,
    config: Option<ControlBlockConfig>,
    /// Control registers as of the end of the last slice.
    control: GuestControlState,

    pub(crate) lapic: VirtualLapic,
    pub(crate) io: IoPermissions,
    trapped_io_ports: Vec<u16>,
    /// MSRs without any emulation, read back as written.
    pub(crate) msrs: BTreeMap<u32, u64>,
    pub(crate) mask_cpuid: bool,

    pub(crate) attached: Vec<AttachedDevice>,
    pub(crate) interrupts: Vec<AttachedInterrupt>,
    pub(crate) next_device_window: u64,

    #[derivative(Debug = "ignore")]
    pub(crate) mailbox: Arc<Mailbox>,
    pub(crate) state: RunState,
    pub(crate) last_exit: Option<ExitSnapshot>,
    /// Why the VM was terminated.
    pub(crate) failure: Option<String>,
    /// An event cut short by the last exit, delivered again before anything
    /// else.
    pending_event: Option<InterruptedEvent>,
    window_armed: bool,
    /// Completed guest entries.
    entries: u64,
}

// Safety: `register_file` points into the exit stack frame owned by this VM
// and is only dereferenced by the task currently driving it.
unsafe impl Send for Vm {}

impl Vm {
    /// Builds a VM ready for its first entry. On failure every frame
    /// acquired so far has been returned.
    pub(crate) fn create(
        id: u64,
        descriptor: &VmDescriptor,
        host: HostInterfaces,
        devices: Arc<DeviceRegistry>,
        mailbox: Arc<Mailbox>,
    ) -> crate::Result<Box<Self>> {
        descriptor.validate()?;
        let program = host
            .modules
            .program(&descriptor.entry_point)
            .ok_or_else(|| HypervisorError::UnknownProgram(descriptor.entry_point.clone()))?;

        let memory = host.frames.clone();
        let vt = host.backends.create(memory.clone())?;
        let frames = FrameTable::allocate_all(memory.as_ref())?;
        let ept = match NestedPageTable::new(memory.clone(), EntryFlagTable::from_backend(vt.as_ref())) {
            Ok(ept) => ept,
            Err(err) => {
                frames.release(memory.as_ref());
                return Err(err);
            }
        };
        let Some(register_file) = NonNull::new(
            crate::control_block::register_file_address(&frames, memory.as_ref()) as *mut GuestRegisters,
        ) else {
            ept.release();
            frames.release(memory.as_ref());
            return Err(HypervisorError::OutOfFrames(FrameRole::ExitStack));
        };

        let now = host.clock.now();
        let tsc_per_tick = host.clock.tsc_per_tick();
        let mut vm = Box::new(Self {
            id,
            name: descriptor.entry_point.clone(),
            host,
            devices,
            vt,
            frames,
            ept,
            tables: GuestPageTables::new(),
            modules: ModuleRegistry::default(),
            program: None,
            stack: GuestRegion::default(),
            heap: GuestRegion::default(),
            regs: GuestRegisters::default(),
            register_file,
            config: None,
            control: GuestControlState::default(),
            lapic: VirtualLapic::new(now, tsc_per_tick),
            io: IoPermissions::trap_all(),
            trapped_io_ports: descriptor.trapped_io_ports.clone(),
            msrs: BTreeMap::new(),
            mask_cpuid: descriptor.mask_cpuid,
            attached: Vec::new(),
            interrupts: Vec::new(),
            next_device_window: 0,
            mailbox,
            state: RunState::Running,
            last_exit: None,
            failure: None,
            pending_event: None,
            window_armed: false,
            entries: 0,
        });

        if let Err(err) = vm.prepare(descriptor, &program) {
            error!("Creating VM {id} ({}) failed: {err}", vm.name);
            vm.release();
            return Err(err);
        }
        info!("VM {id} ({}) created, entry {:#x}", vm.name, vm.regs.rip);
        Ok(vm)
    }

    fn prepare(&mut self, descriptor: &VmDescriptor, program: &ModuleImage) -> crate::Result<()> {
        self.build_address_space(descriptor)?;

        let target = LoadTarget {
            memory: self.host.frames.as_ref(),
            ept: &mut self.ept,
            tables: &mut self.tables,
        };
        let loaded = self.modules.load(program, target)?;
        self.program = Some(loaded);

        let guest = GuestEntryState::long_mode(loaded.entry_va, self.stack.end_va());
        self.regs = GuestRegisters {
            rip: guest.rip,
            rsp: guest.rsp,
            rflags: guest.rflags,
            fx: FxSaveArea::initial(),
            ..GuestRegisters::default()
        };
        self.control = GuestControlState {
            cr0: guest.cr0,
            cr3: guest.cr3,
            cr4: guest.cr4,
            efer: guest.efer,
        };
        let config = ControlBlockConfig::new(
            &self.frames,
            self.host.frames.as_ref(),
            self.ept.root_pa(),
            guest,
        );
        self.config = Some(config);

        self.write_io_bitmap();
        write_msr_bitmap(self.host.frames.as_ref(), self.frames.pa(FrameRole::MsrBitmap));
        self.configure_backend(&config)
    }

    /// Lays out low memory, the descriptor tables, the stack and the heap.
    fn build_address_space(&mut self, descriptor: &VmDescriptor) -> crate::Result<()> {
        self.ept.add_region(GuestPhysicalRegion {
            gpa: layout::IDT_GPA,
            size: layout::GUEST_PAGE_TABLE_POOL_END - layout::IDT_GPA,
            kind: RegionKind::DemandRam,
        });
        self.ept
            .write(layout::GUEST_PAGE_TABLE_ROOT_GPA, &[0u8; FRAME_SIZE])?;
        self.ept.write(layout::IDT_GPA, &[0u8; FRAME_SIZE])?;
        let gdt: Vec<u8> = guest_gdt(layout::TSS_GPA)
            .iter()
            .flat_map(|descriptor| descriptor.to_le_bytes())
            .collect();
        self.ept.write(layout::GDT_GPA, &gdt)?;
        self.ept.write(layout::TSS_GPA, &Tss::without_io_map().to_bytes())?;

        // Low memory, including every guest page table, is identity mapped.
        self.tables.map_range(
            &mut self.ept,
            layout::IDT_GPA,
            layout::IDT_GPA,
            layout::GUEST_PAGE_TABLE_POOL_END - layout::IDT_GPA,
            true,
            false,
        )?;

        let stack_size = page_align_up(descriptor.stack_size);
        self.stack = GuestRegion {
            gpa: layout::STACK_GPA,
            va: layout::STACK_TOP_VA - stack_size,
            size: stack_size,
        };
        let heap_size = page_align_up(descriptor.heap_size);
        self.heap = GuestRegion {
            gpa: layout::HEAP_GPA,
            va: layout::HEAP_VA,
            size: heap_size,
        };
        for region in [self.stack, self.heap] {
            if region.size == 0 {
                continue;
            }
            self.ept.add_region(GuestPhysicalRegion {
                gpa: region.gpa,
                size: region.size,
                kind: RegionKind::DemandRam,
            });
            self.tables
                .map_range(&mut self.ept, region.va, region.gpa, region.size, true, false)?;
        }
        debug!("VM {}: stack {:x?}, heap {:x?}", self.id, self.stack, self.heap);
        Ok(())
    }

    /// Writes the control block once on the creating processor so that a
    /// rejected field fails creation rather than the first entry.
    fn configure_backend(&mut self, config: &ControlBlockConfig) -> crate::Result<()> {
        let control_block = self.frames.pa(FrameRole::ControlBlock);
        self.vt.enable(self.frames.pa(FrameRole::HostSaveArea))?;
        let result = self
            .vt
            .load(control_block)
            .and_then(|()| self.vt.apply(config))
            .and_then(|()| self.vt.clear(control_block));
        self.vt.disable();
        result
    }

    /// Rewrites the IO permission bitmap frame from [`Vm::io`].
    pub(crate) fn write_io_bitmap(&mut self) {
        for port in &self.trapped_io_ports {
            self.io.trap(*port);
        }
        self.io
            .write_to(self.host.frames.as_ref(), self.frames.pa(FrameRole::IoBitmap));
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn registers(&self) -> &GuestRegisters {
        &self.regs
    }

    pub fn program(&self) -> Option<&LoadedModule> {
        self.program.as_ref()
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Runs one scheduling slice: drains the mailbox, then enters the guest
    /// until it yields, waits, finishes or the slice is used up.
    pub(crate) fn run_slice(&mut self) -> Step {
        self.drain_mailbox();
        if self.state.is_final() {
            return Step::Finished;
        }
        if self.state == RunState::Waiting {
            self.lapic.advance(self.host.clock.now());
            if self.lapic.pending().is_none() {
                return self.park();
            }
            debug!("VM {}: woken", self.id);
            self.state = RunState::Running;
        }

        match self.run_entries() {
            Ok(ExitAction::Halt) => {
                self.halt();
                Step::Finished
            }
            Ok(ExitAction::Wait) => {
                self.state = RunState::Waiting;
                self.park()
            }
            Ok(_) => Step::Yield,
            Err(err) => {
                self.terminate(&err);
                Step::Finished
            }
        }
    }

    /// Parks a waiting VM unless a message slipped in.
    fn park(&mut self) -> Step {
        self.mailbox.publish_deadline(self.lapic.deadline());
        self.mailbox.set_waiting(true);
        if self.mailbox.is_empty() {
            return Step::Wait;
        }
        self.mailbox.set_waiting(false);
        Step::Yield
    }

    /// Enables the backend on this processor for the duration of the slice.
    fn run_entries(&mut self) -> crate::Result<ExitAction> {
        let Some(config) = self.config else {
            return Err(HypervisorError::InvalidConfiguration("control block not built"));
        };
        let control_block = self.frames.pa(FrameRole::ControlBlock);
        self.vt.enable(self.frames.pa(FrameRole::HostSaveArea))?;
        let result = self
            .vt
            .load(control_block)
            .and_then(|()| self.vt.reload_host_state(&config))
            .and_then(|()| self.enter_loop());
        self.refresh_control_state();
        let cleared = self.vt.clear(control_block);
        self.vt.disable();
        let action = result?;
        cleared?;
        Ok(action)
    }

    fn enter_loop(&mut self) -> crate::Result<ExitAction> {
        for _ in 0..ENTRIES_PER_SLICE {
            self.prepare_entry()?;
            self.state = RunState::Running;
            let exit = self.enter_guest()?;
            self.entries += 1;
            self.state = RunState::Handling;
            self.pending_event = exit.interrupted_event;
            self.last_exit = Some(exit.clone());

            let action = self.dispatch(&exit)?;
            self.state = RunState::Running;
            if action != ExitAction::Resume {
                return Ok(action);
            }
            if !self.mailbox.is_empty() {
                break;
            }
        }
        Ok(ExitAction::Yield)
    }

    /// Advances the timer and injects at most one event: the one the last
    /// exit interrupted, else the highest pending vector. A vector that cannot
    /// be injected now arms interrupt-window exiting instead.
    fn prepare_entry(&mut self) -> crate::Result<()> {
        self.lapic.advance(self.host.clock.now());

        let mut want_window = false;
        if let Some(event) = self.pending_event.take() {
            trace!("VM {}: reinjecting {event:x?}", self.id);
            self.vt.reinject_event(&event)?;
            want_window = self.lapic.pending().is_some();
        } else if self.lapic.pending().is_some() {
            if self.regs.interrupts_enabled() && !self.vt.interrupt_shadow()? {
                if let Some(vector) = self.lapic.next_injection() {
                    self.vt.inject_interrupt(vector)?;
                }
            } else {
                want_window = true;
            }
        }
        if want_window != self.window_armed {
            trace!("VM {}: interrupt window exiting {want_window}", self.id);
            self.vt.set_interrupt_window_exiting(want_window)?;
            self.window_armed = want_window;
        }

        self.lapic
            .mirror(self.host.frames.as_ref(), self.frames.pa(FrameRole::VirtualApic));
        self.mailbox.publish_deadline(self.lapic.deadline());
        Ok(())
    }

    fn enter_guest(&mut self) -> crate::Result<ExitSnapshot> {
        let file = self.register_file.as_ptr();
        // Safety: the register file lies in the exit stack frame owned by
        // this VM, and nothing else refers to it between entries.
        unsafe { file.write(self.regs.clone()) };
        let result = self.vt.enter(unsafe { &mut *file });
        // Safety: as above.
        self.regs = unsafe { (*file).clone() };
        result
    }

    fn refresh_control_state(&mut self) {
        let read = |field, old| self.vt.guest_field(field).unwrap_or(old);
        self.control = GuestControlState {
            cr0: read(GuestField::Cr0, self.control.cr0),
            cr3: read(GuestField::Cr3, self.control.cr3),
            cr4: read(GuestField::Cr4, self.control.cr4),
            efer: read(GuestField::Efer, self.control.efer),
        };
    }

    /// Processes every queued message. Runs between slices only.
    fn drain_mailbox(&mut self) {
        while let Some(message) = self.mailbox.receive() {
            match message {
                IpcMessage::Dump(request) => {
                    let text = self.dump().render(request.format());
                    request.fulfil(&text);
                }
                IpcMessage::TimerInterrupt => {
                    self.lapic.advance(self.host.clock.now());
                }
                IpcMessage::Interrupt(vector) => self.lapic.request(vector),
                IpcMessage::Close => {
                    if !self.state.is_final() {
                        info!("VM {} ({}): closed", self.id, self.name);
                        self.state = RunState::Terminated;
                        self.detach_interrupts();
                    }
                }
            }
        }
        self.mailbox.set_waiting(false);
    }

    pub fn dump(&self) -> VmDump {
        VmDump {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            registers: self.regs.clone(),
            control: self.control.clone(),
            last_exit: self.last_exit.clone(),
            lapic: self.lapic.snapshot(),
            failure: self.failure.clone(),
        }
    }

    fn halt(&mut self) {
        info!("VM {} ({}): halted after {} entries", self.id, self.name, self.entries);
        self.state = RunState::Halted;
        self.detach_interrupts();
    }

    /// Logs everything known about the VM and stops it for good.
    fn terminate(&mut self, err: &HypervisorError) {
        error!("VM {} ({}) terminated: {err}", self.id, self.name);
        if self.entries == 0 {
            error!("No guest instruction was executed");
        }
        if let Some(exit) = &self.last_exit {
            error!("{exit:#x?}");
        }
        error!("{:#x?}", self.regs);
        error!("{:#x?}", self.control);
        if let Some(text) = diagnostics::disassemble(&self.ept, self.control.cr3, self.regs.rip) {
            error!("{:#x}: {text}", self.regs.rip);
        }
        self.failure = Some(err.to_string());
        self.state = RunState::Terminated;
        self.detach_interrupts();
    }

    /// Removes the VM's interrupt routes from the registry and the bus.
    fn detach_interrupts(&mut self) {
        for (device, host_vector) in self.devices.remove_routes(self.id) {
            self.host.pci.unroute_interrupt(device, host_vector);
        }
        self.interrupts.clear();
    }

    /// Returns everything the VM owns: nested paging frames first, then the
    /// frame table, then device and interrupt attachments.
    pub(crate) fn release(self: Box<Self>) {
        let Self {
            id,
            host,
            devices,
            frames,
            ept,
            attached,
            ..
        } = *self;
        debug!("VM {id}: releasing");
        ept.release();
        frames.release(host.frames.as_ref());
        for (device, host_vector) in devices.remove_routes(id) {
            host.pci.unroute_interrupt(device, host_vector);
        }
        for device in attached {
            devices.release(device.address, id);
        }
    }
}
