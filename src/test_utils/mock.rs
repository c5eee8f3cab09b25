//! A simulated VMX processor.
//!
//! [`MockHal`] keeps every piece of "hardware" state in one process-wide
//! [`MockState`]. A test owns it through [`MockPlatform::install`], which also
//! serializes the tests that use it. Each OS thread plays one physical CPU,
//! chosen with [`MockPlatform::bind_cpu`]; the guest is a queue of closures,
//! one per VM exit.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use raw_cpuid::CpuIdResult;
use x86::vmx::{Result as VmResult, VmFail};

use crate::frame::PAGE_SIZE;
use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::vmx::VmxExitReason;
use crate::vmx::definitions::{InvEptType, InvVpidType};
use crate::vmx::vmcs::{
    VmcsControl32, VmcsField, VmcsGuestNW, VmcsReadOnly32, VmcsReadOnlyNW,
};
use crate::xstate::XSaveArea;
use crate::{HostPhysAddr, HostState, HostVirtAddr, VmxHal};

static SERIAL: Mutex<()> = Mutex::new(());
static STATE: Mutex<Option<MockState>> = Mutex::new(None);

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
    static PREEMPT_DEPTH: Cell<usize> = const { Cell::new(0) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
}

const REVISION_ID: u64 = 1;
const HOST_CR0: u64 = 0x8005_0033;
/// PAE, PGE, OSFXSR, OSXMMEXCPT and OSXSAVE.
const HOST_CR4: u64 = 0x0004_06a0;
const HOST_EFER: u64 = 0xd01;

const VM_INSTRUCTION_ERROR_VMLAUNCH_NONCLEAR: u64 = 4;
const VM_INSTRUCTION_ERROR_VMRESUME_NONLAUNCHED: u64 = 5;

/// Something the simulated processor was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Vmxon,
    Vmxoff,
    Vmptrld { cpu: usize, vmcs: usize },
    Vmclear { cpu: usize, vmcs: usize },
    Invept { cpu: usize, eptp: u64 },
    Invvpid { cpu: usize, vpid: u16 },
    /// A successful VMLAUNCH or VMRESUME, with the event injected by it.
    Entry {
        cpu: usize,
        launched: bool,
        injected: Option<u32>,
    },
    Ipi(usize),
}

#[derive(Default)]
struct MockVmcs {
    fields: HashMap<u32, u64>,
    active_on: Option<usize>,
    launched: bool,
}

type GuestStep = Box<dyn FnOnce(&mut MockGuest) + Send>;
type IpiHandler = Arc<dyn Fn(usize) + Send + Sync>;

pub struct MockState {
    msrs: HashMap<u32, u64>,
    cpuid: HashMap<u32, CpuIdResult>,
    cr4: HashMap<usize, u64>,
    xcr0: u64,
    dr: [u64; 7],
    cr2: u64,
    tsc: u64,
    vmcs: HashMap<usize, MockVmcs>,
    current: HashMap<usize, usize>,
    events: Vec<MockEvent>,
    ipi: Option<IpiHandler>,
    guest: VecDeque<GuestStep>,
    yield_requests: usize,
    entry_error: Option<u64>,
    frames: HashSet<usize>,
}

impl MockState {
    fn new() -> Self {
        let msrs = HashMap::from([
            (
                Msr::IA32_VMX_BASIC as u32,
                REVISION_ID | (PAGE_SIZE as u64) << 32 | 6 << 50 | 1 << 54 | 1 << 55,
            ),
            (Msr::IA32_VMX_TRUE_PINBASED_CTLS as u32, 0x7f << 32 | 0x16),
            (
                Msr::IA32_VMX_TRUE_PROCBASED_CTLS as u32,
                0xfff9_fffe << 32 | 0x0400_6172,
            ),
            (Msr::IA32_VMX_PROCBASED_CTLS2 as u32, 0xffff_ffff << 32),
            (Msr::IA32_VMX_TRUE_EXIT_CTLS as u32, 0xff_ffff << 32 | 0x3_6dfb),
            (Msr::IA32_VMX_TRUE_ENTRY_CTLS as u32, 0xffff << 32 | 0x11fb),
            (Msr::IA32_VMX_CR0_FIXED0 as u32, 0x8000_0021),
            (Msr::IA32_VMX_CR0_FIXED1 as u32, 0xffff_ffff),
            (Msr::IA32_VMX_CR4_FIXED0 as u32, 0x2000),
            (Msr::IA32_VMX_CR4_FIXED1 as u32, 0x3727ff),
            (
                Msr::IA32_VMX_EPT_VPID_CAP as u32,
                1 << 6 | 1 << 8 | 1 << 14 | 1 << 20 | 1 << 25 | 1 << 26 | 1 << 32 | 1 << 41 | 1 << 42,
            ),
            (Msr::IA32_FEATURE_CONTROL as u32, 0x5),
            (Msr::IA32_PAT as u32, 0x0007_0406_0007_0406),
            (Msr::IA32_EFER as u32, HOST_EFER),
            (Msr::IA32_MISC_ENABLE as u32, 1 | 1 << 7 | 1 << 16 | 1 << 18),
            (Msr::IA32_LSTAR as u32, 0xffff_8000_0010_0000),
            (Msr::IA32_STAR as u32, 0x0023_0010_0000_0000),
        ]);
        let cpuid = HashMap::from([
            (
                0,
                CpuIdResult {
                    eax: 0x20,
                    ebx: u32::from_le_bytes(*b"Genu"),
                    ecx: u32::from_le_bytes(*b"ntel"),
                    edx: u32::from_le_bytes(*b"ineI"),
                },
            ),
            (
                1,
                CpuIdResult {
                    eax: 0x906ea,
                    ebx: 0,
                    // VMX, XSAVE and OSXSAVE.
                    ecx: 1 << 5 | 1 << 26 | 1 << 27,
                    edx: 0,
                },
            ),
        ]);
        Self {
            msrs,
            cpuid,
            cr4: HashMap::new(),
            xcr0: 0x7,
            dr: [0; 7],
            cr2: 0,
            tsc: 1_000_000,
            vmcs: HashMap::new(),
            current: HashMap::new(),
            events: Vec::new(),
            ipi: None,
            guest: VecDeque::new(),
            yield_requests: 0,
            entry_error: None,
            frames: HashSet::new(),
        }
    }

    fn current_vmcs(&mut self, cpu: usize) -> Option<&mut MockVmcs> {
        let paddr = *self.current.get(&cpu)?;
        self.vmcs.get_mut(&paddr)
    }
}

fn with_state<R>(f: impl FnOnce(&mut MockState) -> R) -> R {
    let mut state = STATE.lock().unwrap_or_else(|e| e.into_inner());
    f(state.as_mut().expect("no MockPlatform installed"))
}

fn cpu() -> usize {
    CPU.with(Cell::get)
}

/// Exclusive ownership of the simulated processor for one test.
pub struct MockPlatform {
    _serial: MutexGuard<'static, ()>,
}

impl MockPlatform {
    /// Resets the simulated processor and binds the calling thread to CPU 0.
    pub fn install(_cpus: usize) -> Self {
        let serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let stale = STATE
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(MockState::new());
        drop(stale);
        Self::bind_cpu(0);
        PREEMPT_DEPTH.with(|d| d.set(0));
        Self { _serial: serial }
    }

    /// Makes the calling thread run as physical CPU `cpu`.
    pub fn bind_cpu(cpu: usize) {
        CPU.with(|c| c.set(cpu));
    }

    pub fn preempt_depth() -> usize {
        PREEMPT_DEPTH.with(Cell::get)
    }

    /// Frames allocated since `install` and not yet freed.
    pub fn frames_in_use(&self) -> usize {
        with_state(|s| s.frames.len())
    }

    pub fn set_msr(&self, msr: u32, value: u64) {
        with_state(|s| s.msrs.insert(msr, value));
    }

    pub fn msr(&self, msr: u32) -> u64 {
        with_state(|s| s.msrs.get(&msr).copied().unwrap_or(0))
    }

    /// Result of `leaf` for every subleaf.
    pub fn set_cpuid(&self, leaf: u32, result: CpuIdResult) {
        with_state(|s| s.cpuid.insert(leaf, result));
    }

    /// Runs `handler(cpu)` on a thread bound to `cpu` for every IPI.
    pub fn on_ipi(&self, handler: impl Fn(usize) + Send + Sync + 'static) {
        with_state(|s| s.ipi = Some(Arc::new(handler)));
    }

    /// Queues the behaviour of the guest up to its next VM exit.
    ///
    /// Once the queue is empty the guest executes HLT.
    pub fn push_guest(&self, step: impl FnOnce(&mut MockGuest) + Send + 'static) {
        with_state(|s| s.guest.push_back(Box::new(step)));
    }

    pub fn pending_guest_steps(&self) -> usize {
        with_state(|s| s.guest.len())
    }

    /// Makes the next `count` calls of `should_yield` return true.
    pub fn request_yield(&self, count: usize) {
        with_state(|s| s.yield_requests = count);
    }

    /// Makes the next VMLAUNCH or VMRESUME fail with VM-instruction error `error`.
    pub fn fail_next_entry(&self, error: u64) {
        with_state(|s| s.entry_error = Some(error));
    }

    pub fn events(&self) -> Vec<MockEvent> {
        with_state(|s| s.events.clone())
    }

    pub fn count(&self, pred: impl Fn(&MockEvent) -> bool) -> usize {
        with_state(|s| s.events.iter().filter(|e| pred(e)).count())
    }

    pub fn clear_events(&self) {
        with_state(|s| s.events.clear());
    }

    /// CPU on which the VMCS at `paddr` is active.
    pub fn active_on(&self, paddr: HostPhysAddr) -> Option<usize> {
        with_state(|s| s.vmcs.get(&paddr.as_usize()).and_then(|v| v.active_on))
    }

    /// Raw value of a field of the VMCS at `paddr`.
    pub fn vmcs_field(&self, paddr: HostPhysAddr, field: impl VmcsField) -> u64 {
        with_state(|s| {
            s.vmcs
                .get(&paddr.as_usize())
                .and_then(|v| v.fields.get(&field.encoding()).copied())
                .unwrap_or(0)
        })
    }

    /// VMCS current on `cpu`.
    pub fn current_on(&self, cpu: usize) -> Option<HostPhysAddr> {
        with_state(|s| s.current.get(&cpu).map(|p| HostPhysAddr::from(*p)))
    }
}

impl Drop for MockPlatform {
    fn drop(&mut self) {
        // Dropping the state may free frames, which takes the lock again.
        let state = STATE.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(state);
    }
}

/// The guest's view of the processor between a VM entry and the next VM exit.
pub struct MockGuest<'a> {
    pub regs: &'a mut GeneralRegisters,
    fields: HashMap<u32, u64>,
    /// Event delivered by this entry, as written to the interruption field.
    pub injected: Option<u32>,
}

impl MockGuest<'_> {
    pub fn read(&self, field: impl VmcsField) -> u64 {
        self.fields.get(&field.encoding()).copied().unwrap_or(0)
    }

    pub fn write(&mut self, field: impl VmcsField, value: u64) {
        self.fields.insert(field.encoding(), value);
    }

    pub fn rip(&self) -> u64 {
        self.read(VmcsGuestNW::RIP)
    }

    /// Leaves the guest with `reason` at the current RIP.
    pub fn exit(&mut self, reason: VmxExitReason, qualification: u64, instr_len: u32) {
        self.write(VmcsReadOnly32::EXIT_REASON, reason as u64);
        self.write(VmcsReadOnlyNW::EXIT_QUALIFICATION, qualification);
        self.write(VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN, instr_len as u64);
        self.write(VmcsReadOnly32::IDT_VECTORING_INFO, 0);
    }

    /// Fails the entry itself, as for invalid guest state.
    pub fn fail_entry(&mut self, reason: VmxExitReason) {
        self.exit(reason, 0, 0);
        self.write(VmcsReadOnly32::EXIT_REASON, reason as u64 | 1 << 31);
    }
}

/// [`VmxHal`] backed by the simulated processor.
#[derive(Debug)]
pub struct MockHal;

impl VmxHal for MockHal {
    fn alloc_frame() -> Option<HostPhysAddr> {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        with_state(|s| s.frames.insert(ptr as usize));
        Some(HostPhysAddr::from(ptr as usize))
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        // Frames of an earlier test may be freed after its platform is gone.
        if let Some(state) = STATE.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
            state.frames.remove(&paddr.as_usize());
        }
        unsafe { dealloc(paddr.as_usize() as *mut u8, layout) }
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }

    fn current_cpu_id() -> usize {
        cpu()
    }

    fn preempt_disable() {
        PREEMPT_DEPTH.with(|d| d.set(d.get() + 1));
    }

    fn preempt_enable() {
        PREEMPT_DEPTH.with(|d| {
            assert!(d.get() > 0, "unbalanced preempt_enable");
            d.set(d.get() - 1)
        });
    }

    fn send_ipi(cpu_id: usize) {
        let handler = with_state(|s| {
            s.events.push(MockEvent::Ipi(cpu_id));
            s.ipi.clone()
        })
        .expect("IPI sent without a handler");
        std::thread::spawn(move || {
            MockPlatform::bind_cpu(cpu_id);
            handler(cpu_id);
        });
    }

    fn should_yield() -> bool {
        with_state(|s| {
            let yield_now = s.yield_requests > 0;
            s.yield_requests = s.yield_requests.saturating_sub(1);
            yield_now
        })
    }

    fn irq_save_disable() -> bool {
        IRQ_ENABLED.with(|e| e.replace(false))
    }

    fn irq_restore(enabled: bool) {
        IRQ_ENABLED.with(|e| e.set(enabled));
    }

    fn host_nmi() {}

    fn rdmsr(msr: u32) -> u64 {
        with_state(|s| s.msrs.get(&msr).copied().unwrap_or(0))
    }

    fn wrmsr(msr: u32, value: u64) {
        with_state(|s| s.msrs.insert(msr, value));
    }

    fn cpuid(leaf: u32, _subleaf: u32) -> CpuIdResult {
        with_state(|s| {
            s.cpuid.get(&leaf).copied().unwrap_or(CpuIdResult {
                eax: 0,
                ebx: 0,
                ecx: 0,
                edx: 0,
            })
        })
    }

    fn rdtsc() -> u64 {
        with_state(|s| {
            s.tsc += 100;
            s.tsc
        })
    }

    fn read_cr0() -> u64 {
        HOST_CR0
    }

    fn read_cr4() -> u64 {
        let cpu = cpu();
        with_state(|s| s.cr4.get(&cpu).copied().unwrap_or(HOST_CR4))
    }

    fn write_cr4(value: u64) {
        let cpu = cpu();
        with_state(|s| s.cr4.insert(cpu, value));
    }

    fn read_cr2() -> u64 {
        with_state(|s| s.cr2)
    }

    fn write_cr2(value: u64) {
        with_state(|s| s.cr2 = value);
    }

    fn read_dr(index: u8) -> u64 {
        with_state(|s| s.dr[index as usize])
    }

    fn write_dr(index: u8, value: u64) {
        with_state(|s| s.dr[index as usize] = value);
    }

    fn xcr0() -> u64 {
        with_state(|s| s.xcr0)
    }

    fn set_xcr0(value: u64) {
        with_state(|s| s.xcr0 = value);
    }

    fn fpu_save(_area: &mut XSaveArea, _mask: u64) {}

    fn fpu_restore(_area: &XSaveArea, _mask: u64) {}

    fn vmxon(_paddr: HostPhysAddr) -> VmResult<()> {
        with_state(|s| s.events.push(MockEvent::Vmxon));
        Ok(())
    }

    fn vmxoff() -> VmResult<()> {
        with_state(|s| s.events.push(MockEvent::Vmxoff));
        Ok(())
    }

    fn vmptrld(paddr: HostPhysAddr) -> VmResult<()> {
        let cpu = cpu();
        let revision = unsafe { *(paddr.as_usize() as *const u32) } & 0x7fff_ffff;
        with_state(|s| {
            let expected = s.msrs[&(Msr::IA32_VMX_BASIC as u32)] & 0x7fff_ffff;
            if revision as u64 != expected {
                return Err(VmFail::VmFailInvalid);
            }
            let vmcs = s.vmcs.entry(paddr.as_usize()).or_default();
            match vmcs.active_on {
                Some(owner) if owner != cpu => {
                    panic!("VMCS {:#x} loaded on CPU {} while active on CPU {}", paddr, cpu, owner)
                }
                _ => vmcs.active_on = Some(cpu),
            }
            s.current.insert(cpu, paddr.as_usize());
            s.events.push(MockEvent::Vmptrld {
                cpu,
                vmcs: paddr.as_usize(),
            });
            Ok(())
        })
    }

    fn vmclear(paddr: HostPhysAddr) -> VmResult<()> {
        let cpu = cpu();
        with_state(|s| {
            let vmcs = s.vmcs.entry(paddr.as_usize()).or_default();
            if let Some(owner) = vmcs.active_on {
                assert_eq!(owner, cpu, "VMCS {:#x} cleared on a foreign CPU", paddr);
            }
            vmcs.active_on = None;
            vmcs.launched = false;
            if s.current.get(&cpu) == Some(&paddr.as_usize()) {
                s.current.remove(&cpu);
            }
            s.events.push(MockEvent::Vmclear {
                cpu,
                vmcs: paddr.as_usize(),
            });
            Ok(())
        })
    }

    fn vmread(field: u32) -> VmResult<u64> {
        let cpu = cpu();
        with_state(|s| {
            let vmcs = s.current_vmcs(cpu).ok_or(VmFail::VmFailInvalid)?;
            Ok(vmcs.fields.get(&field).copied().unwrap_or(0))
        })
    }

    fn vmwrite(field: u32, value: u64) -> VmResult<()> {
        let cpu = cpu();
        with_state(|s| {
            let vmcs = s.current_vmcs(cpu).ok_or(VmFail::VmFailInvalid)?;
            vmcs.fields.insert(field, value);
            Ok(())
        })
    }

    fn invept(_inv_type: InvEptType, eptp: u64) -> VmResult<()> {
        let cpu = cpu();
        with_state(|s| s.events.push(MockEvent::Invept { cpu, eptp }));
        Ok(())
    }

    fn invvpid(_inv_type: InvVpidType, vpid: u16) -> VmResult<()> {
        let cpu = cpu();
        with_state(|s| s.events.push(MockEvent::Invvpid { cpu, vpid }));
        Ok(())
    }

    fn vm_entry(regs: &mut GeneralRegisters, launched: bool) -> VmResult<()> {
        let cpu = cpu();
        let error_field = VmcsReadOnly32::VM_INSTRUCTION_ERROR.encoding();
        let intr_field = VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD.encoding();
        let (paddr, fields, step) = with_state(|s| {
            let paddr = *s.current.get(&cpu).ok_or(VmFail::VmFailInvalid)?;
            let vmcs = s.vmcs.get_mut(&paddr).ok_or(VmFail::VmFailInvalid)?;
            let error = if vmcs.launched != launched {
                Some(if launched {
                    VM_INSTRUCTION_ERROR_VMRESUME_NONLAUNCHED
                } else {
                    VM_INSTRUCTION_ERROR_VMLAUNCH_NONCLEAR
                })
            } else {
                s.entry_error.take()
            };
            if let Some(error) = error {
                vmcs.fields.insert(error_field, error);
                return Err(VmFail::VmFailValid);
            }
            let fields = vmcs.fields.clone();
            Ok((paddr, fields, s.guest.pop_front()))
        })?;

        let injected = fields
            .get(&intr_field)
            .map(|bits| *bits as u32)
            .filter(|bits| bits & (1 << 31) != 0);
        let mut guest = MockGuest {
            regs,
            fields,
            injected,
        };
        match step {
            Some(step) => step(&mut guest),
            None => guest.exit(VmxExitReason::HLT, 0, 1),
        }
        // Delivered or not, the event is consumed by the entry.
        if let Some(bits) = injected {
            guest.write(VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD, (bits & !(1 << 31)) as u64);
        }
        let entry_failed = guest.read(VmcsReadOnly32::EXIT_REASON) & (1 << 31) != 0;

        with_state(|s| {
            if let Some(vmcs) = s.vmcs.get_mut(&paddr) {
                vmcs.fields = guest.fields;
                if !entry_failed {
                    vmcs.launched = true;
                }
            }
            s.events.push(MockEvent::Entry {
                cpu,
                launched,
                injected,
            });
        });
        Ok(())
    }

    fn host_state() -> HostState {
        let cpu = cpu() as u64;
        HostState {
            cr0: HOST_CR0,
            cr3: 0x10_0000,
            cr4: Self::read_cr4(),
            es: 0,
            cs: 0x8,
            ss: 0x10,
            ds: 0,
            fs: 0,
            gs: 0,
            tr: 0x18,
            fs_base: 0,
            gs_base: 0xffff_8000_0100_0000 + cpu * 0x1000,
            tr_base: 0xffff_8000_0200_0000 + cpu * 0x1000,
            gdtr_base: 0xffff_8000_0300_0000 + cpu * 0x1000,
            idtr_base: 0xffff_8000_0400_0000,
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
            efer: HOST_EFER,
            pat: 0x0007_0406_0007_0406,
            rip: 0xffff_8000_0000_1000,
        }
    }
}
