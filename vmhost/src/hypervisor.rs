//! The host-facing API: creating VMs on scheduler tasks, messaging them and
//! destroying them once their task is gone.

use crate::{
    error::HypervisorError,
    frames::FrameAllocator,
    hardware_vt::BackendFactory,
    ipc::{DumpFormat, DumpRequest, IpcMessage, Mailbox},
    modules::ModuleProvider,
    pci::{DeviceRegistry, PciBus},
    vm::{Step, Vm, VmDescriptor},
    vmexit::RunState,
    x86_instructions,
};
use alloc::{boxed::Box, collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, info, warn};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// The cooperative scheduler of the host kernel.
pub trait Scheduler: Send + Sync {
    /// Creates a task that calls [`VmRunner::step`] until it returns
    /// [`Step::Finished`], yielding after [`Step::Yield`] and parking after
    /// [`Step::Wait`], then hands the runner to
    /// [`Hypervisor::on_task_exited`]. A refused runner is given back.
    fn spawn(&self, runner: VmRunner) -> Result<TaskId, VmRunner>;

    /// Makes a parked task runnable.
    fn wake(&self, task: TaskId);
}

/// Where guests' serial output goes.
pub trait Console: Send + Sync {
    fn write(&self, vm: u64, bytes: &[u8]);
}

/// The host time source driving virtual timers.
pub trait Clock: Send + Sync {
    /// Current time-stamp counter value.
    fn now(&self) -> u64;

    /// TSC ticks per LAPIC timer tick before division.
    fn tsc_per_tick(&self) -> u64;
}

/// The processor's time-stamp counter.
#[derive(Debug, Clone, Copy)]
pub struct TscClock {
    pub tsc_per_tick: u64,
}

impl Clock for TscClock {
    fn now(&self) -> u64 {
        x86_instructions::rdtsc()
    }

    fn tsc_per_tick(&self) -> u64 {
        self.tsc_per_tick
    }
}

/// The collaborators of the host kernel a [`Hypervisor`] works with.
#[derive(Clone, derivative::Derivative)]
#[derivative(Debug)]
pub struct HostInterfaces {
    #[derivative(Debug = "ignore")]
    pub frames: Arc<dyn FrameAllocator>,
    #[derivative(Debug = "ignore")]
    pub scheduler: Arc<dyn Scheduler>,
    #[derivative(Debug = "ignore")]
    pub pci: Arc<dyn PciBus>,
    #[derivative(Debug = "ignore")]
    pub modules: Arc<dyn ModuleProvider>,
    #[derivative(Debug = "ignore")]
    pub console: Arc<dyn Console>,
    #[derivative(Debug = "ignore")]
    pub clock: Arc<dyn Clock>,
    #[derivative(Debug = "ignore")]
    pub backends: Arc<dyn BackendFactory>,
}

/// Drives one VM on its scheduler task.
#[derive(Debug)]
pub struct VmRunner {
    vm: Box<Vm>,
}

impl VmRunner {
    pub fn id(&self) -> u64 {
        self.vm.id()
    }

    pub fn state(&self) -> RunState {
        self.vm.state()
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Runs one slice. Once [`Step::Finished`] was returned, further calls
    /// return it again without entering the guest.
    pub fn step(&mut self) -> Step {
        if self.vm.state().is_final() {
            return Step::Finished;
        }
        self.vm.run_slice()
    }
}

#[derive(Debug)]
struct VmHandle {
    name: String,
    mailbox: Arc<Mailbox>,
    task: Option<TaskId>,
    /// The VM once its task has exited.
    finished: Option<Box<Vm>>,
}

/// A pool of VMs sharing one set of host collaborators.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct Hypervisor {
    host: HostInterfaces,
    #[derivative(Debug = "ignore")]
    devices: Arc<DeviceRegistry>,
    vms: Mutex<BTreeMap<u64, VmHandle>>,
    next_id: AtomicU64,
}

impl Hypervisor {
    pub fn new(host: HostInterfaces) -> Self {
        Self {
            host,
            devices: Arc::new(DeviceRegistry::default()),
            vms: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Builds a VM and binds it to a new scheduler task. Nothing is leaked
    /// and nothing is scheduled on failure.
    pub fn create_and_attach(&self, descriptor: &VmDescriptor) -> crate::Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::default());
        let vm = Vm::create(
            id,
            descriptor,
            self.host.clone(),
            self.devices.clone(),
            mailbox.clone(),
        )?;

        // Registered before spawning so that a task finishing right away
        // finds its handle.
        self.vms.lock().insert(
            id,
            VmHandle {
                name: descriptor.entry_point.clone(),
                mailbox,
                task: None,
                finished: None,
            },
        );
        match self.host.scheduler.spawn(VmRunner { vm }) {
            Ok(task) => {
                if let Some(handle) = self.vms.lock().get_mut(&id) {
                    handle.task = Some(task);
                }
                info!("VM {id} ({}) attached to task {}", descriptor.entry_point, task.0);
                Ok(id)
            }
            Err(runner) => {
                self.vms.lock().remove(&id);
                runner.vm.release();
                Err(HypervisorError::TaskCreationFailed)
            }
        }
    }

    /// Takes the VM back from its exited task.
    pub fn on_task_exited(&self, runner: VmRunner) {
        let id = runner.id();
        debug!("VM {id}: task exited in state {:?}", runner.state());
        let mut vms = self.vms.lock();
        match vms.get_mut(&id) {
            Some(handle) => handle.finished = Some(runner.vm),
            None => {
                drop(vms);
                warn!("VM {id}: task exited for an unknown VM");
                runner.vm.release();
            }
        }
    }

    /// Releases every resource of the VM. Valid only after its task exited.
    pub fn destroy(&self, id: u64) -> crate::Result<()> {
        let vm = {
            let mut vms = self.vms.lock();
            let handle = vms.get_mut(&id).ok_or(HypervisorError::UnknownVm(id))?;
            let vm = handle.finished.take().ok_or(HypervisorError::VmStillRunning(id))?;
            vms.remove(&id);
            vm
        };
        info!("VM {id} ({}) destroyed", vm.name());
        vm.release();
        Ok(())
    }

    /// Tells the VM its timer may have expired.
    pub fn send_timer_interrupt(&self, id: u64) -> crate::Result<()> {
        let (mailbox, task) = self.running(id)?;
        if mailbox.send_timer_interrupt() == Some(true) {
            self.wake(task);
        }
        Ok(())
    }

    /// Queues a dump request. The caller polls the returned request.
    pub fn request_dump(
        &self,
        id: u64,
        format: DumpFormat,
        capacity: usize,
    ) -> crate::Result<Arc<DumpRequest>> {
        let (mailbox, task) = self.running(id)?;
        let request = DumpRequest::new(format, capacity);
        if mailbox.send(IpcMessage::Dump(request.clone())) {
            self.wake(task);
        }
        Ok(request)
    }

    /// Asks the VM to terminate at its next safe point.
    pub fn close(&self, id: u64) -> crate::Result<()> {
        let (mailbox, task) = self.running(id)?;
        if mailbox.send(IpcMessage::Close) {
            self.wake(task);
        }
        Ok(())
    }

    /// Sends a timer interrupt to every VM whose published deadline passed.
    pub fn notify_timers(&self) {
        let now = self.host.clock.now();
        let due: Vec<(Arc<Mailbox>, Option<TaskId>)> = self
            .vms
            .lock()
            .values()
            .filter(|handle| handle.finished.is_none())
            .filter(|handle| handle.mailbox.deadline().is_some_and(|deadline| deadline <= now))
            .map(|handle| (handle.mailbox.clone(), handle.task))
            .collect();
        for (mailbox, task) in due {
            if mailbox.send_timer_interrupt() == Some(true) {
                self.wake(task);
            }
        }
    }

    /// Forwards a host interrupt to every VM routed to `host_vector`.
    pub fn deliver_host_interrupt(&self, host_vector: u8) {
        for id in self.devices.deliver(host_vector) {
            let task = self.vms.lock().get(&id).and_then(|handle| handle.task);
            self.wake(task);
        }
    }

    pub fn vm_ids(&self) -> Vec<u64> {
        self.vms.lock().keys().copied().collect()
    }

    pub fn name(&self, id: u64) -> Option<String> {
        self.vms.lock().get(&id).map(|handle| handle.name.clone())
    }

    /// The final state of a VM whose task exited.
    pub fn finished_state(&self, id: u64) -> Option<RunState> {
        self.vms
            .lock()
            .get(&id)
            .and_then(|handle| handle.finished.as_ref().map(|vm| vm.state()))
    }

    fn running(&self, id: u64) -> crate::Result<(Arc<Mailbox>, Option<TaskId>)> {
        let vms = self.vms.lock();
        let handle = vms.get(&id).ok_or(HypervisorError::UnknownVm(id))?;
        if handle.finished.is_some() {
            return Err(HypervisorError::UnknownVm(id));
        }
        Ok((handle.mailbox.clone(), handle.task))
    }

    fn wake(&self, task: Option<TaskId>) {
        if let Some(task) = task {
            self.host.scheduler.wake(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        guest_paging,
        hardware_vt::{
            EventKind, ExitReason, ExitSnapshot, InterruptedEvent, IoAccess, NestedPageFault,
        },
        hypercall::{
            ATTACH_INTERRUPT, ATTACH_PCI_DEVICE, EXIT, GET_HOST_PHYSICAL_ADDRESS, LOAD_MODULE,
        },
        layout,
        pci::{InterruptKind, PciAddress, PciBar},
        testing::{
            code_image, hypercall, step, wrmsr, MemoryPciBus, StaticModules, TestDevice, TestHost,
        },
    };
    use std::sync::Mutex as StdMutex;

    const RFLAGS_IF: u64 = 1 << 9;

    fn setup(modules: StaticModules, pci: MemoryPciBus) -> (TestHost, Hypervisor) {
        let host = TestHost::new(modules.with_program("greeter", code_image(1, &[0xf4])), pci);
        let hypervisor = Hypervisor::new(host.interfaces());
        (host, hypervisor)
    }

    fn descriptor() -> VmDescriptor {
        VmDescriptor {
            stack_size: 0x4000,
            heap_size: 0x4000,
            ..VmDescriptor::new("greeter")
        }
    }

    fn finished<R>(hypervisor: &Hypervisor, id: u64, f: impl FnOnce(&Vm) -> R) -> R {
        let vms = hypervisor.vms.lock();
        f(vms[&id].finished.as_ref().expect("task still running"))
    }

    /// A step that records RAX as left by the previous exit, then applies
    /// `setup`.
    fn observe(
        observed: &Arc<StdMutex<Vec<u64>>>,
        reason: ExitReason,
        mut setup: impl FnMut(&mut crate::state::GuestRegisters) + Send + 'static,
    ) -> crate::testing::ScriptStep {
        let observed = observed.clone();
        step(reason, 3, move |regs| {
            observed.lock().unwrap().push(regs.rax);
            setup(regs);
        })
    }

    #[test]
    fn create_and_destroy_returns_every_frame() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        assert!(host.frames.free_pages() < TestHost::PAGES);
        assert_eq!(hypervisor.name(id).as_deref(), Some("greeter"));
        assert!(matches!(hypervisor.destroy(id), Err(HypervisorError::VmStillRunning(_))));

        host.backends.push(hypercall(EXIT, 0, 0, 0));
        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Finished);
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Halted));

        hypervisor.destroy(id).unwrap();
        assert_eq!(host.frames.free_pages(), TestHost::PAGES);
        assert_eq!(host.frames.live_allocations(), 0);
        assert!(matches!(hypervisor.destroy(id), Err(HypervisorError::UnknownVm(_))));
        assert!(hypervisor.vm_ids().is_empty());
    }

    #[test]
    fn failed_creation_leaks_nothing() {
        let mut created = false;
        for budget in 0..400 {
            let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
            host.frames.fail_after(budget);
            match hypervisor.create_and_attach(&descriptor()) {
                Ok(id) => {
                    assert!(budget > 10);
                    host.backends.push(hypercall(EXIT, 0, 0, 0));
                    host.scheduler.drive(&hypervisor, id);
                    hypervisor.destroy(id).unwrap();
                    created = true;
                }
                Err(_) => assert_eq!(host.scheduler.task_count(), 0),
            }
            assert_eq!(host.frames.free_pages(), TestHost::PAGES, "budget {budget}");
            assert_eq!(host.frames.live_allocations(), 0);
            if created {
                break;
            }
        }
        assert!(created);
    }

    #[test]
    fn refused_task_releases_the_vm() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        host.scheduler.refuse.store(true, Ordering::Relaxed);
        let err = hypervisor.create_and_attach(&descriptor()).unwrap_err();
        assert!(matches!(err, HypervisorError::TaskCreationFailed));
        assert_eq!(host.frames.free_pages(), TestHost::PAGES);
        assert!(hypervisor.vm_ids().is_empty());
    }

    #[test]
    fn unknown_program_and_bad_sizes_are_rejected() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let err = hypervisor
            .create_and_attach(&VmDescriptor::new("missing"))
            .unwrap_err();
        assert!(matches!(err, HypervisorError::UnknownProgram(_)));
        let zero_stack = VmDescriptor {
            stack_size: 0,
            ..descriptor()
        };
        assert!(hypervisor.create_and_attach(&zero_stack).is_err());
        assert_eq!(host.frames.free_pages(), TestHost::PAGES);
    }

    #[test]
    fn greeting_then_exit_halts() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        let out = |byte: u8| {
            let access = IoAccess {
                port: 0x3f8,
                size: 1,
                input: false,
                string: false,
                rep: false,
            };
            step(ExitReason::Io(access), 1, move |regs| regs.rax = u64::from(byte))
        };
        host.backends.push(out(b'H'));
        host.backends.push(out(b'i'));
        host.backends.push(hypercall(EXIT, 0, 0, 0));
        host.backends.push(hypercall(EXIT, 0, 0, 0));

        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Finished);
        assert_eq!(host.console.text(id), "Hi");
        assert_eq!(host.backends.log.lock().unwrap().entries, 3);
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Halted));
        finished(&hypervisor, id, |vm| assert_eq!(vm.registers().rip, layout::IMAGE_VA + 5));

        let log = host.backends.log.lock().unwrap();
        assert_eq!(log.enables, log.disables);
        drop(log);
        hypervisor.destroy(id).unwrap();
        assert_eq!(host.frames.free_pages(), TestHost::PAGES);
    }

    #[test]
    fn timer_divider_write_is_emulated() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        host.backends.push(wrmsr(0x83e, 0x3));
        host.backends.push(hypercall(EXIT, 0, 0, 0));
        host.scheduler.drive(&hypervisor, id);
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Halted));
        finished(&hypervisor, id, |vm| assert_eq!(vm.lapic.divider(), 16));
        hypervisor.destroy(id).unwrap();
    }

    #[test]
    fn expired_timer_is_injected() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        let clock = host.clock.clone();
        host.backends.push(wrmsr(0x832, 0x30));
        host.backends.push(wrmsr(0x838, 5));
        host.backends.push(step(ExitReason::Pause, 2, move |regs| {
            regs.rflags |= RFLAGS_IF;
            clock.advance(1_000);
        }));
        host.backends.push(hypercall(EXIT, 0, 0, 0));

        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Finished);
        assert_eq!(host.backends.log.lock().unwrap().injected, vec![0x30]);
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Halted));
        hypervisor.destroy(id).unwrap();
    }

    #[test]
    fn halted_guest_waits_for_its_timer() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        host.backends.push(wrmsr(0x832, 0x31));
        host.backends.push(wrmsr(0x838, 5));
        host.backends.push(step(ExitReason::Hlt, 1, |regs| regs.rflags |= RFLAGS_IF));
        host.backends.push(hypercall(EXIT, 0, 0, 0));

        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Wait);
        let mailbox = hypervisor.vms.lock()[&id].mailbox.clone();
        assert!(mailbox.is_waiting());
        assert!(mailbox.deadline().is_some());

        hypervisor.notify_timers();
        assert!(host.scheduler.woken.lock().unwrap().is_empty());
        host.clock.advance(1_000);
        hypervisor.notify_timers();
        assert_eq!(host.scheduler.woken.lock().unwrap().len(), 1);

        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Finished);
        assert_eq!(host.backends.log.lock().unwrap().injected, vec![0x31]);
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Halted));
        hypervisor.destroy(id).unwrap();
    }

    #[test]
    fn hlt_with_nothing_armed_halts() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        host.backends.push(step(ExitReason::Hlt, 1, |regs| regs.rflags |= RFLAGS_IF));
        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Finished);
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Halted));
        hypervisor.destroy(id).unwrap();
    }

    #[test]
    fn unknown_io_port_terminates() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        let access = IoAccess {
            port: 0x60,
            size: 1,
            input: true,
            string: false,
            rep: false,
        };
        host.backends.push(step(ExitReason::Io(access), 2, |_| {}));
        host.backends.push(hypercall(EXIT, 0, 0, 0));
        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Finished);
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Terminated));
        assert_eq!(host.backends.log.lock().unwrap().entries, 1);
        hypervisor.destroy(id).unwrap();
        assert_eq!(host.frames.free_pages(), TestHost::PAGES);
    }

    #[test]
    fn failed_first_entry_terminates() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        host.backends.fail_entries.store(true, Ordering::Relaxed);
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Finished);
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Terminated));
        assert_eq!(host.backends.log.lock().unwrap().entries, 0);
        hypervisor.destroy(id).unwrap();
    }

    #[test]
    fn close_terminates_before_entering() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        hypervisor.close(id).unwrap();
        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Finished);
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Terminated));
        assert_eq!(host.backends.log.lock().unwrap().entries, 0);
        assert!(matches!(hypervisor.close(id), Err(HypervisorError::UnknownVm(_))));
        hypervisor.destroy(id).unwrap();
    }

    #[test]
    fn dump_is_served_between_slices() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        let request = hypervisor.request_dump(id, DumpFormat::Json, 64 * 1024).unwrap();
        assert!(!request.is_complete());
        host.backends.push(hypercall(EXIT, 0, 0, 0));
        host.scheduler.drive(&hypervisor, id);

        assert!(request.is_complete());
        let dump: serde_json::Value = serde_json::from_str(&request.contents()).unwrap();
        assert_eq!(dump["id"], id);
        assert_eq!(dump["name"], "greeter");
        assert_eq!(dump["state"], "Running");
        assert_eq!(dump["registers"]["rip"], layout::IMAGE_VA);
        hypervisor.destroy(id).unwrap();
    }

    #[test]
    fn host_physical_address_matches_nested_translation() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        let observed = Arc::new(StdMutex::new(Vec::new()));
        host.backends.push(step(ExitReason::Hypercall, 3, |regs| {
            regs.rdi = regs.rip;
            regs.rax = GET_HOST_PHYSICAL_ADDRESS;
        }));
        host.backends.push(observe(&observed, ExitReason::Hypercall, |regs| {
            regs.rax = GET_HOST_PHYSICAL_ADDRESS;
            regs.rdi = 0x7000_0000_0000;
        }));
        host.backends.push(observe(&observed, ExitReason::Hypercall, |regs| regs.rax = 0x4242));
        host.backends.push(observe(&observed, ExitReason::Hypercall, |regs| regs.rax = EXIT));
        host.scheduler.drive(&hypervisor, id);

        let observed = observed.lock().unwrap().clone();
        finished(&hypervisor, id, |vm| {
            let gpa = guest_paging::translate(
                &vm.ept,
                layout::GUEST_PAGE_TABLE_ROOT_GPA,
                layout::IMAGE_VA,
            )
            .unwrap();
            let pa = vm.ept.translate(gpa).unwrap().pa;
            assert!(vm.ept.owns(pa));
            assert_eq!(observed[0], pa);
        });
        assert_eq!(observed[1], -5i64 as u64);
        assert_eq!(observed[2], -1i64 as u64);
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Halted));
        hypervisor.destroy(id).unwrap();
    }

    #[test]
    fn modules_load_once() {
        let modules = StaticModules::default().with_module(code_image(7, &[0xc3]));
        let (host, hypervisor) = setup(modules, MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        let observed = Arc::new(StdMutex::new(Vec::new()));
        host.backends.push(hypercall(LOAD_MODULE, 7, 0, 0));
        host.backends.push(observe(&observed, ExitReason::Hypercall, |regs| {
            regs.rax = LOAD_MODULE;
            regs.rdi = 7;
            regs.rsi = 0;
        }));
        host.backends.push(observe(&observed, ExitReason::Hypercall, |regs| {
            regs.rax = LOAD_MODULE;
            regs.rdi = 8;
        }));
        host.backends.push(observe(&observed, ExitReason::Hypercall, |regs| regs.rax = EXIT));
        host.scheduler.drive(&hypervisor, id);

        let observed = observed.lock().unwrap().clone();
        assert!(observed[0] > layout::IMAGE_VA);
        assert_eq!(observed[1], -4i64 as u64);
        assert_eq!(observed[2], -2i64 as u64);
        finished(&hypervisor, id, |vm| {
            assert!(vm.modules.contains(7));
            assert_eq!(vm.state(), RunState::Halted);
        });
        hypervisor.destroy(id).unwrap();
        assert_eq!(host.frames.free_pages(), TestHost::PAGES);
    }

    #[test]
    fn attached_device_interrupts_reach_the_guest() {
        let address = PciAddress::from_raw(0x300).unwrap();
        let pci = MemoryPciBus::default().with_device(
            address,
            TestDevice {
                config_space: 0xfe00_0000,
                bars: vec![
                    (0, PciBar::Memory { base: 0xfd00_0000, size: 0x2000 }),
                    (1, PciBar::Io { base: 0xc000, size: 0x20 }),
                ],
                interrupts: vec![InterruptKind::Msi],
            },
        );
        let (host, hypervisor) = setup(StaticModules::default(), pci);
        let id = hypervisor
            .create_and_attach(&VmDescriptor {
                trapped_io_ports: vec![0xc004],
                ..descriptor()
            })
            .unwrap();

        let observed = Arc::new(StdMutex::new(Vec::new()));
        host.backends.push(hypercall(ATTACH_PCI_DEVICE, 0x300, 0, 0));
        host.backends.push(observe(&observed, ExitReason::Hypercall, |regs| {
            regs.rdi = regs.rax;
            regs.rax = ATTACH_INTERRUPT;
            regs.rsi = 1;
            regs.rdx = 0x40;
        }));
        host.backends.push(observe(&observed, ExitReason::Hypercall, |regs| {
            regs.rax = ATTACH_PCI_DEVICE;
            regs.rdi = 0x300;
        }));
        host.backends.push(observe(&observed, ExitReason::Hlt, |regs| {
            regs.rflags |= RFLAGS_IF;
        }));
        host.backends.push(hypercall(EXIT, 0, 0, 0));

        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Wait);
        let observed = observed.lock().unwrap().clone();
        assert_eq!(observed[0], layout::DEVICE_VA);
        assert_eq!(observed[1], 0);
        assert_eq!(observed[2], -3i64 as u64);
        assert_eq!(hypervisor.devices.owner(address), Some(id));
        let host_vector = MemoryPciBus::FIRST_HOST_VECTOR;
        assert_eq!(*host.pci.routed.lock().unwrap(), vec![(address, host_vector)]);

        hypervisor.deliver_host_interrupt(host_vector);
        assert_eq!(host.scheduler.woken.lock().unwrap().len(), 1);
        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Finished);
        assert_eq!(host.backends.log.lock().unwrap().injected, vec![0x40]);

        // Halting drops the routes but keeps the device until destruction.
        assert!(host.pci.routed.lock().unwrap().is_empty());
        assert!(hypervisor.devices.deliver(host_vector).is_empty());
        finished(&hypervisor, id, |vm| {
            assert!(!vm.io.is_trapped(0xc000));
            assert!(vm.io.is_trapped(0xc004));
            assert!(vm.io.is_trapped(0x3f8));
        });
        assert_eq!(hypervisor.devices.owner(address), Some(id));
        hypervisor.destroy(id).unwrap();
        assert_eq!(hypervisor.devices.owner(address), None);
        assert_eq!(host.frames.free_pages(), TestHost::PAGES);
    }

    #[test]
    fn interrupted_timer_delivery_is_retried() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        let timer = InterruptedEvent {
            vector: 0x30,
            kind: EventKind::ExternalInterrupt,
            error_code: None,
            instruction_length: 0,
        };
        let first = host.clock.clone();
        let second = host.clock.clone();
        host.backends.push(wrmsr(0x832, 0x30));
        host.backends.push(wrmsr(0x838, 5));
        host.backends.push(step(ExitReason::Pause, 2, move |regs| {
            regs.rflags |= RFLAGS_IF;
            first.advance(1_000);
        }));
        // Pushing the interrupt frame faults on a stack page not backed yet.
        host.backends.push(Box::new(move |regs| {
            let fault = NestedPageFault {
                gpa: layout::STACK_GPA + 0x3000,
                read: false,
                write: true,
                fetch: false,
                present: false,
            };
            let mut exit = ExitSnapshot::new(ExitReason::NestedPageFault(fault), 0, 0);
            exit.rip = regs.rip;
            exit.interrupted_event = Some(timer);
            exit
        }));
        host.backends.push(wrmsr(0x80b, 0));
        host.backends.push(wrmsr(0x838, 5));
        host.backends.push(step(ExitReason::Pause, 2, move |_| second.advance(1_000)));
        host.backends.push(hypercall(EXIT, 0, 0, 0));

        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Finished);
        let log = host.backends.log.lock().unwrap();
        assert_eq!(log.reinjected, vec![timer]);
        // The retried delivery is not a second interrupt.
        assert_eq!(log.injected, vec![0x30, 0x30]);
        drop(log);
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Halted));
        finished(&hypervisor, id, |vm| {
            assert!(vm.ept.translate(layout::STACK_GPA + 0x3000).is_some());
        });
        hypervisor.destroy(id).unwrap();
        assert_eq!(host.frames.free_pages(), TestHost::PAGES);
    }

    #[test]
    fn rep_outs_from_unmapped_memory_terminates() {
        let (host, hypervisor) = setup(StaticModules::default(), MemoryPciBus::default());
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        let access = IoAccess {
            port: 0x3f8,
            size: 1,
            input: false,
            string: true,
            rep: true,
        };
        host.backends.push(step(ExitReason::Io(access), 2, |regs| {
            regs.rsi = 0x7000_0000_0000;
            regs.rcx = 4;
        }));
        host.backends.push(hypercall(EXIT, 0, 0, 0));

        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Finished);
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Terminated));
        assert_eq!(host.console.text(id), "");
        finished(&hypervisor, id, |vm| {
            assert_eq!(
                vm.failure(),
                Some("Guest virtual address 0x700000000000 is not mapped")
            );
        });
        hypervisor.destroy(id).unwrap();
    }

    #[test]
    fn failed_attach_releases_the_device() {
        let address = PciAddress::from_raw(0x300).unwrap();
        let pci = MemoryPciBus::default().with_device(
            address,
            TestDevice {
                config_space: 0xfe00_0000,
                // Crosses a page table boundary behind the configuration page.
                bars: vec![(0, PciBar::Memory { base: 0xc000_0000, size: 0x20_0000 })],
                interrupts: vec![],
            },
        );
        let (host, hypervisor) = setup(StaticModules::default(), pci);
        let id = hypervisor.create_and_attach(&descriptor()).unwrap();
        let next_table = host.scheduler.with_runner(id, |runner| {
            runner
                .vm
                .tables
                .set_next_table(layout::GUEST_PAGE_TABLE_POOL_END - 3 * 0x1000)
        });

        let observed = Arc::new(StdMutex::new(Vec::new()));
        let clock = host.clock.clone();
        host.backends.push(wrmsr(0x832, 0x31));
        host.backends.push(wrmsr(0x838, 5));
        host.backends.push(hypercall(ATTACH_PCI_DEVICE, 0x300, 0, 0));
        host.backends.push(observe(&observed, ExitReason::Hlt, |regs| {
            regs.rflags |= RFLAGS_IF;
        }));
        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Wait);

        assert_eq!(observed.lock().unwrap()[0], -6i64 as u64);
        assert_eq!(hypervisor.devices.owner(address), None);
        host.scheduler.with_runner(id, |runner| {
            let vm = &mut runner.vm;
            assert!(vm.attached.is_empty());
            assert_eq!(vm.next_device_window, 0);
            assert!(vm.ept.region(layout::DEVICE_GPA).is_none());
            assert!(vm.ept.region(layout::DEVICE_GPA + 0x1000).is_none());
            for va in [layout::DEVICE_VA, layout::DEVICE_VA + 0x1000] {
                let cr3 = layout::GUEST_PAGE_TABLE_ROOT_GPA;
                assert_eq!(guest_paging::translate(&vm.ept, cr3, va), None);
            }
            vm.tables.set_next_table(next_table);
        });

        clock.advance(1_000);
        host.backends.push(hypercall(ATTACH_PCI_DEVICE, 0x300, 0, 0));
        host.backends.push(observe(&observed, ExitReason::Hypercall, |regs| regs.rax = EXIT));
        assert_eq!(host.scheduler.drive(&hypervisor, id), Step::Finished);
        assert_eq!(observed.lock().unwrap()[1], layout::DEVICE_VA);
        assert_eq!(hypervisor.devices.owner(address), Some(id));
        assert_eq!(hypervisor.finished_state(id), Some(RunState::Halted));

        hypervisor.destroy(id).unwrap();
        assert_eq!(hypervisor.devices.owner(address), None);
        assert_eq!(host.frames.free_pages(), TestHost::PAGES);
    }
}
