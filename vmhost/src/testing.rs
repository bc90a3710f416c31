//! Host collaborators and a scripted backend for running VMs in unit tests.

use crate::{
    control_block::ControlBlockConfig,
    ept::EntryFlagTable,
    error::HypervisorError,
    frames::{Frame, FrameAllocator, FRAME_SIZE},
    hardware_vt::{
        BackendFactory, ExitReason, ExitSnapshot, GuestField, HardwareVt, InterruptedEvent,
        NestedPagingStructureEntryFlags, NestedPagingStructureEntryType, Vendor,
    },
    hypervisor::{Clock, Console, HostInterfaces, Hypervisor, Scheduler, TaskId, VmRunner},
    modules::{ModuleImage, ModuleProvider, Section, SectionData, SectionKind, SectionOffset},
    pci::{InterruptKind, PciAddress, PciBar, PciBus},
    state::GuestRegisters,
    vm::Step,
};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

/// A frame allocator over the test process' heap. Physical addresses are
/// host pointers, so `physical_to_virtual` is the identity.
pub(crate) struct HeapFrameAllocator {
    inner: Mutex<HeapFrames>,
}

struct HeapFrames {
    free: usize,
    live: BTreeMap<u64, usize>,
    /// Allocations left before every further allocation fails.
    fail_after: Option<usize>,
}

impl HeapFrameAllocator {
    pub(crate) fn new(pages: usize) -> Self {
        Self {
            inner: Mutex::new(HeapFrames {
                free: pages,
                live: BTreeMap::new(),
                fail_after: None,
            }),
        }
    }

    /// Lets `count` more allocations succeed, then fails all of them.
    pub(crate) fn fail_after(&self, count: usize) {
        self.inner.lock().unwrap().fail_after = Some(count);
    }

    pub(crate) fn stop_failing(&self) {
        self.inner.lock().unwrap().fail_after = None;
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    fn layout(pages: usize) -> Layout {
        Layout::from_size_align(pages * FRAME_SIZE, FRAME_SIZE).unwrap()
    }
}

impl FrameAllocator for HeapFrameAllocator {
    fn allocate(&self, pages: usize) -> Option<Frame> {
        let mut inner = self.inner.lock().unwrap();
        if pages == 0 || pages > inner.free {
            return None;
        }
        match &mut inner.fail_after {
            Some(0) => return None,
            Some(left) => *left -= 1,
            None => {}
        }
        let ptr = unsafe { alloc_zeroed(Self::layout(pages)) };
        assert!(!ptr.is_null());
        inner.free -= pages;
        inner.live.insert(ptr as u64, pages);
        Some(Frame::new(ptr as u64, pages))
    }

    fn free(&self, frame: Frame) {
        let mut inner = self.inner.lock().unwrap();
        let pages = inner
            .live
            .remove(&frame.pa())
            .unwrap_or_else(|| panic!("{frame:?} freed twice or never allocated"));
        assert_eq!(pages, frame.pages());
        unsafe { dealloc(frame.pa() as *mut u8, Self::layout(pages)) };
        inner.free += pages;
    }

    fn free_pages(&self) -> usize {
        self.inner.lock().unwrap().free
    }

    fn physical_to_virtual(&self, pa: u64) -> *mut u8 {
        pa as *mut u8
    }
}

impl Drop for HeapFrameAllocator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        for (pa, pages) in core::mem::take(&mut inner.live) {
            unsafe { dealloc(pa as *mut u8, Self::layout(pages)) };
        }
    }
}

fn vmx_like_flags(entry_type: NestedPagingStructureEntryType) -> NestedPagingStructureEntryFlags {
    use NestedPagingStructureEntryType as T;
    let (permission, memory_type) = match entry_type {
        T::Table => (0b111, 0),
        T::Rwx => (0b111, 6),
        T::Rw => (0b011, 6),
        T::Rx => (0b101, 6),
        T::R => (0b001, 6),
        T::UncachedRw => (0b011, 0),
        T::UncachedR => (0b001, 0),
    };
    NestedPagingStructureEntryFlags {
        permission,
        memory_type,
        no_execute: false,
    }
}

/// Entry flags laid out the way VMX encodes them.
pub(crate) fn test_flags() -> EntryFlagTable {
    EntryFlagTable::from_backend(&ScriptedBackend::default())
}

/// What the guest "does" for one entry: edits the registers and reports the
/// exit it ends with.
pub(crate) type ScriptStep = Box<dyn FnMut(&mut GuestRegisters) -> ExitSnapshot + Send>;

/// A step ending in `reason` after an instruction of `length` bytes, with
/// `setup` applied to the registers first.
pub(crate) fn step(
    reason: ExitReason,
    length: u64,
    mut setup: impl FnMut(&mut GuestRegisters) + Send + 'static,
) -> ScriptStep {
    Box::new(move |regs| {
        setup(regs);
        let mut exit = ExitSnapshot::new(reason, 0, length);
        exit.rip = regs.rip;
        exit
    })
}

/// A `vmcall` issuing hypercall `number` with `rdi`, `rsi` and `rdx`.
pub(crate) fn hypercall(number: u64, rdi: u64, rsi: u64, rdx: u64) -> ScriptStep {
    step(ExitReason::Hypercall, 3, move |regs| {
        regs.rax = number;
        regs.rdi = rdi;
        regs.rsi = rsi;
        regs.rdx = rdx;
    })
}

/// A `wrmsr` of `value` to `msr`.
pub(crate) fn wrmsr(msr: u32, value: u64) -> ScriptStep {
    step(ExitReason::MsrWrite, 2, move |regs| {
        regs.rcx = u64::from(msr);
        regs.rax = value & 0xffff_ffff;
        regs.rdx = value >> 32;
    })
}

/// Everything the scripted backends of a factory observed.
#[derive(Debug, Default)]
pub(crate) struct BackendLog {
    pub(crate) entries: usize,
    pub(crate) injected: Vec<u8>,
    pub(crate) reinjected: Vec<InterruptedEvent>,
    pub(crate) enables: usize,
    pub(crate) disables: usize,
    pub(crate) applied: usize,
    pub(crate) host_reloads: usize,
    pub(crate) invalidations: usize,
    pub(crate) window: bool,
}

/// A backend replaying [`ScriptStep`]s instead of running a guest. Running
/// out of steps looks like a triple fault.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    script: Arc<Mutex<VecDeque<ScriptStep>>>,
    log: Arc<Mutex<BackendLog>>,
    fail_entries: bool,
    enabled: bool,
    loaded: Option<u64>,
    fields: [u64; 11],
}

impl core::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("enabled", &self.enabled)
            .field("loaded", &self.loaded)
            .finish_non_exhaustive()
    }
}

impl ScriptedBackend {
    fn require_loaded(&self, instruction: &'static str) -> crate::Result<()> {
        if self.enabled && self.loaded.is_some() {
            Ok(())
        } else {
            Err(HypervisorError::VmInstructionFailed { instruction })
        }
    }
}

impl HardwareVt for ScriptedBackend {
    fn vendor(&self) -> Vendor {
        Vendor::Intel
    }

    fn enable(&mut self, _host_area: u64) -> crate::Result<()> {
        assert!(!self.enabled, "enabled twice");
        self.enabled = true;
        self.log.lock().unwrap().enables += 1;
        Ok(())
    }

    fn disable(&mut self) {
        self.enabled = false;
        self.loaded = None;
        self.log.lock().unwrap().disables += 1;
    }

    fn load(&mut self, control_block: u64) -> crate::Result<()> {
        if !self.enabled {
            return Err(HypervisorError::VmInstructionFailed { instruction: "VMPTRLD" });
        }
        self.loaded = Some(control_block);
        Ok(())
    }

    fn clear(&mut self, control_block: u64) -> crate::Result<()> {
        assert_eq!(self.loaded, Some(control_block));
        self.loaded = None;
        Ok(())
    }

    fn apply(&mut self, config: &ControlBlockConfig) -> crate::Result<()> {
        self.require_loaded("VMWRITE")?;
        self.fields[GuestField::Cr0 as usize] = config.guest.cr0;
        self.fields[GuestField::Cr3 as usize] = config.guest.cr3;
        self.fields[GuestField::Cr4 as usize] = config.guest.cr4;
        self.fields[GuestField::Efer as usize] = config.guest.efer;
        self.log.lock().unwrap().applied += 1;
        Ok(())
    }

    fn reload_host_state(&mut self, _config: &ControlBlockConfig) -> crate::Result<()> {
        self.require_loaded("VMWRITE")?;
        self.log.lock().unwrap().host_reloads += 1;
        Ok(())
    }

    fn enter(&mut self, regs: &mut GuestRegisters) -> crate::Result<ExitSnapshot> {
        self.require_loaded("VMLAUNCH")?;
        if self.fail_entries {
            return Err(HypervisorError::EntryFailed(self.instruction_error()));
        }
        self.log.lock().unwrap().entries += 1;
        let next = self.script.lock().unwrap().pop_front();
        Ok(match next {
            Some(mut step) => step(regs),
            None => ExitSnapshot::new(ExitReason::Shutdown, 2, 0),
        })
    }

    fn instruction_error(&self) -> u64 {
        if self.fail_entries {
            7
        } else {
            0
        }
    }

    fn inject_interrupt(&mut self, vector: u8) -> crate::Result<()> {
        self.require_loaded("VMWRITE")?;
        self.log.lock().unwrap().injected.push(vector);
        Ok(())
    }

    fn reinject_event(&mut self, event: &InterruptedEvent) -> crate::Result<()> {
        self.require_loaded("VMWRITE")?;
        self.log.lock().unwrap().reinjected.push(*event);
        Ok(())
    }

    fn set_interrupt_window_exiting(&mut self, enabled: bool) -> crate::Result<()> {
        self.require_loaded("VMWRITE")?;
        self.log.lock().unwrap().window = enabled;
        Ok(())
    }

    fn interrupt_shadow(&self) -> crate::Result<bool> {
        self.require_loaded("VMREAD")?;
        Ok(false)
    }

    fn guest_field(&self, field: GuestField) -> crate::Result<u64> {
        self.require_loaded("VMREAD")?;
        Ok(self.fields[field as usize])
    }

    fn set_guest_field(&mut self, field: GuestField, value: u64) -> crate::Result<()> {
        self.require_loaded("VMWRITE")?;
        self.fields[field as usize] = value;
        Ok(())
    }

    fn invalidate_caches(&mut self) {
        self.log.lock().unwrap().invalidations += 1;
    }

    fn nps_entry_flags(
        &self,
        entry_type: NestedPagingStructureEntryType,
    ) -> NestedPagingStructureEntryFlags {
        vmx_like_flags(entry_type)
    }
}

/// Hands out [`ScriptedBackend`]s sharing one script and one log.
#[derive(Default)]
pub(crate) struct ScriptedFactory {
    pub(crate) script: Arc<Mutex<VecDeque<ScriptStep>>>,
    pub(crate) log: Arc<Mutex<BackendLog>>,
    pub(crate) fail_entries: AtomicBool,
}

impl ScriptedFactory {
    pub(crate) fn push(&self, step: ScriptStep) {
        self.script.lock().unwrap().push_back(step);
    }
}

impl BackendFactory for ScriptedFactory {
    fn create(&self, _memory: Arc<dyn FrameAllocator>) -> crate::Result<Box<dyn HardwareVt>> {
        Ok(Box::new(ScriptedBackend {
            script: self.script.clone(),
            log: self.log.clone(),
            fail_entries: self.fail_entries.load(Ordering::Relaxed),
            ..ScriptedBackend::default()
        }))
    }
}

/// Keeps spawned runners so tests decide when each task runs.
#[derive(Default)]
pub(crate) struct RecordingScheduler {
    runners: Mutex<Vec<(TaskId, VmRunner)>>,
    pub(crate) woken: Mutex<Vec<TaskId>>,
    pub(crate) refuse: AtomicBool,
    next_task: AtomicU64,
}

impl RecordingScheduler {
    /// Runs the task of VM `id` the way a host task would, until it parks or
    /// finishes. A finished runner goes back to `hypervisor`.
    pub(crate) fn drive(&self, hypervisor: &Hypervisor, id: u64) -> Step {
        let index = {
            let runners = self.runners.lock().unwrap();
            runners.iter().position(|(_, runner)| runner.id() == id)
        }
        .unwrap_or_else(|| panic!("VM {id} has no task"));
        let (task, mut runner) = self.runners.lock().unwrap().remove(index);
        for _ in 0..64 {
            match runner.step() {
                Step::Yield => continue,
                Step::Wait => {
                    self.runners.lock().unwrap().push((task, runner));
                    return Step::Wait;
                }
                Step::Finished => {
                    hypervisor.on_task_exited(runner);
                    return Step::Finished;
                }
            }
        }
        panic!("VM {id} kept yielding");
    }

    /// Gives `f` the runner of VM `id` while its task is not running.
    pub(crate) fn with_runner<R>(&self, id: u64, f: impl FnOnce(&mut VmRunner) -> R) -> R {
        let mut runners = self.runners.lock().unwrap();
        let (_, runner) = runners
            .iter_mut()
            .find(|(_, runner)| runner.id() == id)
            .unwrap_or_else(|| panic!("VM {id} has no task"));
        f(runner)
    }

    pub(crate) fn task_count(&self) -> usize {
        self.runners.lock().unwrap().len()
    }
}

impl Scheduler for RecordingScheduler {
    fn spawn(&self, runner: VmRunner) -> Result<TaskId, VmRunner> {
        if self.refuse.load(Ordering::Relaxed) {
            return Err(runner);
        }
        let task = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
        self.runners.lock().unwrap().push((task, runner));
        Ok(task)
    }

    fn wake(&self, task: TaskId) {
        self.woken.lock().unwrap().push(task);
    }
}

pub(crate) struct TestDevice {
    pub(crate) config_space: u64,
    pub(crate) bars: Vec<(u8, PciBar)>,
    pub(crate) interrupts: Vec<InterruptKind>,
}

/// A PCI bus with a fixed set of functions.
#[derive(Default)]
pub(crate) struct MemoryPciBus {
    devices: BTreeMap<PciAddress, TestDevice>,
    pub(crate) routed: Mutex<Vec<(PciAddress, u8)>>,
}

impl MemoryPciBus {
    /// The host vector the next routed interrupt gets.
    pub(crate) const FIRST_HOST_VECTOR: u8 = 0x60;

    pub(crate) fn with_device(mut self, address: PciAddress, device: TestDevice) -> Self {
        self.devices.insert(address, device);
        self
    }
}

impl PciBus for MemoryPciBus {
    fn config_space(&self, address: PciAddress) -> Option<u64> {
        self.devices.get(&address).map(|device| device.config_space)
    }

    fn bar(&self, address: PciAddress, index: u8) -> Option<PciBar> {
        let device = self.devices.get(&address)?;
        device
            .bars
            .iter()
            .find(|(bar, _)| *bar == index)
            .map(|(_, bar)| *bar)
    }

    fn route_interrupt(&self, address: PciAddress, kind: InterruptKind) -> Option<u8> {
        if !self.devices.get(&address)?.interrupts.contains(&kind) {
            return None;
        }
        let mut routed = self.routed.lock().unwrap();
        let vector = Self::FIRST_HOST_VECTOR + routed.len() as u8;
        routed.push((address, vector));
        Some(vector)
    }

    fn unroute_interrupt(&self, address: PciAddress, host_vector: u8) {
        self.routed
            .lock()
            .unwrap()
            .retain(|route| *route != (address, host_vector));
    }
}

#[derive(Default)]
pub(crate) struct StaticModules {
    programs: BTreeMap<String, Arc<ModuleImage>>,
    modules: BTreeMap<u64, Arc<ModuleImage>>,
}

impl StaticModules {
    pub(crate) fn with_program(mut self, name: &str, image: ModuleImage) -> Self {
        self.programs.insert(name.into(), Arc::new(image));
        self
    }

    pub(crate) fn with_module(mut self, image: ModuleImage) -> Self {
        self.modules.insert(image.id, Arc::new(image));
        self
    }
}

impl ModuleProvider for StaticModules {
    fn program(&self, name: &str) -> Option<Arc<ModuleImage>> {
        self.programs.get(name).cloned()
    }

    fn module(&self, id: u64) -> Option<Arc<ModuleImage>> {
        self.modules.get(&id).cloned()
    }
}

/// A code-only image entered at its first byte.
pub(crate) fn code_image(id: u64, code: &[u8]) -> ModuleImage {
    ModuleImage {
        id,
        entry: SectionOffset { section: 0, offset: 0 },
        sections: vec![Section {
            kind: SectionKind::Text,
            size: code.len() as u64,
            data: SectionData::Bytes(code.to_vec()),
        }],
        got_entries: Vec::new(),
        relocations: Vec::new(),
    }
}

/// Collects serial output per VM.
#[derive(Default)]
pub(crate) struct BufferConsole {
    output: Mutex<BTreeMap<u64, Vec<u8>>>,
}

impl BufferConsole {
    pub(crate) fn text(&self, vm: u64) -> String {
        let output = self.output.lock().unwrap();
        String::from_utf8_lossy(output.get(&vm).map_or(&[][..], Vec::as_slice)).into_owned()
    }
}

impl Console for BufferConsole {
    fn write(&self, vm: u64, bytes: &[u8]) {
        self.output
            .lock()
            .unwrap()
            .entry(vm)
            .or_default()
            .extend_from_slice(bytes);
    }
}

/// A TSC that only moves when told to.
pub(crate) struct ManualClock {
    now: AtomicU64,
    tsc_per_tick: u64,
}

impl ManualClock {
    pub(crate) fn new(tsc_per_tick: u64) -> Self {
        Self {
            now: AtomicU64::new(1_000),
            tsc_per_tick,
        }
    }

    pub(crate) fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn tsc_per_tick(&self) -> u64 {
        self.tsc_per_tick
    }
}

/// One of every collaborator, kept typed so tests can inspect them.
pub(crate) struct TestHost {
    pub(crate) frames: Arc<HeapFrameAllocator>,
    pub(crate) scheduler: Arc<RecordingScheduler>,
    pub(crate) pci: Arc<MemoryPciBus>,
    pub(crate) modules: Arc<StaticModules>,
    pub(crate) console: Arc<BufferConsole>,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) backends: Arc<ScriptedFactory>,
}

impl TestHost {
    /// Enough frames for a couple of small VMs.
    pub(crate) const PAGES: usize = 2048;

    pub(crate) fn new(modules: StaticModules, pci: MemoryPciBus) -> Self {
        Self {
            frames: Arc::new(HeapFrameAllocator::new(Self::PAGES)),
            scheduler: Arc::new(RecordingScheduler::default()),
            pci: Arc::new(pci),
            modules: Arc::new(modules),
            console: Arc::new(BufferConsole::default()),
            clock: Arc::new(ManualClock::new(10)),
            backends: Arc::new(ScriptedFactory::default()),
        }
    }

    pub(crate) fn interfaces(&self) -> HostInterfaces {
        HostInterfaces {
            frames: self.frames.clone(),
            scheduler: self.scheduler.clone(),
            pci: self.pci.clone(),
            modules: self.modules.clone(),
            console: self.console.clone(),
            clock: self.clock.clone(),
            backends: self.backends.clone(),
        }
    }
}
