use alloc::format;
use alloc::sync::Arc;
use core::fmt::{Debug, Formatter, Result as FmtResult};
use core::sync::atomic::{AtomicBool, Ordering};

use x86::vmx::VmFail;

use super::asid::Asid;
use super::definitions::VmxInterruptionType;
use super::exit::{ExitAction, ExitContext, ExitEvent};
use super::machine::{Machine, TprPolicy};
use super::residency::{Residency, Vmcs, VmcsGuard};
use super::state::{self, GuestContext, StateGroups, VcpuState};
use super::structs::MsrBitmap;
use super::vmcs::controls::{InterruptibilityState, PinbasedControls, PrimaryControls};
use super::vmcs::{
    self, VmcsControl16, VmcsControl32, VmcsControl64, VmcsGuest32, VmcsGuest64, VmcsGuestNW,
    VmcsHost16, VmcsHost32, VmcsHost64, VmcsHostNW, VmxInterruptInfo,
};
use crate::msr::Msr;
use crate::regs::GeneralRegistersDiff;
use crate::{HostState, Result, VmxError, VmxHal};

const RFLAGS_IF: u64 = 1 << 9;
const NMI_VECTOR: u8 = 2;

/// Host MSRs that neither VM entry nor VM exit switches.
const HOST_SAVED_MSRS: [Msr; 5] = [
    Msr::IA32_STAR,
    Msr::IA32_LSTAR,
    Msr::IA32_CSTAR,
    Msr::IA32_FMASK,
    Msr::IA32_KERNEL_GSBASE,
];

/// MSRs the guest accesses without exiting.
const PASSTHROUGH_MSRS: [Msr; 11] = [
    Msr::IA32_EFER,
    Msr::IA32_STAR,
    Msr::IA32_LSTAR,
    Msr::IA32_CSTAR,
    Msr::IA32_FMASK,
    Msr::IA32_KERNEL_GSBASE,
    Msr::IA32_SYSENTER_CS,
    Msr::IA32_SYSENTER_ESP,
    Msr::IA32_SYSENTER_EIP,
    Msr::IA32_FS_BASE,
    Msr::IA32_GS_BASE,
];

/// MSRs the guest may read without exiting but not write.
const READ_ONLY_MSRS: [Msr; 2] = [Msr::IA32_TSC, Msr::IA32_ARCH_CAPABILITIES];

/// IA32_MISC_ENABLE bits. (SDM Vol. 4, Table 2-2)
mod misc_enable {
    pub const PERFMON: u64 = 1 << 7;
    pub const BTS_UNAVAILABLE: u64 = 1 << 11;
    pub const PEBS_UNAVAILABLE: u64 = 1 << 12;
    pub const EIST: u64 = 1 << 16;
    pub const MWAIT: u64 = 1 << 18;

    /// Host value as shown to guests: no performance monitoring, SpeedStep
    /// or MONITOR/MWAIT.
    pub fn guest_view(host: u64) -> u64 {
        (host & !(PERFMON | EIST | MWAIT)) | BTS_UNAVAILABLE | PEBS_UNAVAILABLE
    }
}

/// Class of an event queued by [`VirtualCpu::inject_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// External interrupt; vector 2 is an NMI.
    Interrupt,
    /// Hardware exception.
    Exception,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEvent {
    vector: u8,
    err_code: Option<u32>,
}

/// Summary of the guest's interrupt state, refreshed by every `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitState {
    pub cr8: u64,
    pub rflags: u64,
    /// STI or MOV SS blocking is in effect.
    pub int_shadow: bool,
    pub int_window_exiting: bool,
    pub nmi_window_exiting: bool,
    /// An event is still waiting to be delivered.
    pub event_pending: bool,
}

/// Handle forcing a running vCPU back to its caller at the next exit.
#[derive(Debug, Clone)]
pub struct VcpuKicker(Arc<AtomicBool>);

impl VcpuKicker {
    pub fn kick(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// State of a vCPU that exit handlers operate on.
pub(crate) struct VcpuInner<H: VmxHal> {
    pub id: u32,
    pub ctx: GuestContext<H>,
    /// Event cut short by the last exit, with its instruction length.
    pub reinject: Option<(VmxInterruptInfo, u32)>,
    exception: Option<PendingEvent>,
    interrupt: Option<PendingEvent>,
    pub int_window: bool,
    pub nmi_window: bool,
    /// EPT generation this vCPU last invalidated for.
    ept_generation: u64,
    last_cpu: Option<usize>,
    exit_state: ExitState,
    /// TPR policy the execution controls currently reflect.
    tpr_policy: Option<TprPolicy>,
}

impl<H: VmxHal> VcpuInner<H> {
    /// Queues a hardware exception for the next entry, replacing any other.
    pub fn raise_exception(&mut self, vector: u8, err_code: Option<u32>) {
        self.exception = Some(PendingEvent { vector, err_code });
    }

    /// Whether a queued interrupt would wake a halted guest with `rflags`.
    pub fn has_deliverable_interrupt(&self, rflags: u64) -> bool {
        self.exception.is_some()
            || self
                .interrupt
                .is_some_and(|intr| intr.vector == NMI_VECTOR || rflags & RFLAGS_IF != 0)
    }

    fn event_pending(&self) -> bool {
        self.reinject.is_some() || self.exception.is_some() || self.interrupt.is_some()
    }

    fn clear_events(&mut self) {
        self.reinject = None;
        self.exception = None;
        self.interrupt = None;
    }

    /// Writes the highest-priority pending event into the VMCS.
    fn commit_events(&mut self, vmcs: &VmcsGuard<'_, H>) -> Result {
        if let Some((info, instr_len)) = self.reinject.take() {
            trace!("[VMX] vCPU {} re-injecting {:?}", self.id, info);
            return vmcs::inject_event(vmcs, &info, instr_len);
        }

        if let Some(exc) = self.exception.take() {
            if matches!(exc.vector, 0 | 2 | 3) || exc.vector >= 32 {
                return Err(VmxError::InvalidInput(format!(
                    "exception vector {} cannot be injected",
                    exc.vector
                )));
            }
            let info = VmxInterruptInfo::exception(exc.vector, exc.err_code);
            return vmcs::inject_event(vmcs, &info, 0);
        }

        let Some(intr) = self.interrupt else {
            return Ok(());
        };
        let blocking =
            InterruptibilityState::from_bits_truncate(vmcs.read(VmcsGuest32::INTERRUPTIBILITY_STATE)?);
        let shadow = blocking
            .intersects(InterruptibilityState::BLOCKING_BY_STI | InterruptibilityState::BLOCKING_BY_MOV_SS);

        if intr.vector == NMI_VECTOR {
            if !shadow && !blocking.contains(InterruptibilityState::BLOCKING_BY_NMI) {
                let info = VmxInterruptInfo::new(NMI_VECTOR, VmxInterruptionType::NMI, None);
                vmcs::inject_event(vmcs, &info, 0)?;
                self.interrupt = None;
            }
            // Exits once the guest can take the next NMI.
            self.arm_window(vmcs, PrimaryControls::NMI_WINDOW_EXITING)?;
            self.nmi_window = true;
            return Ok(());
        }

        let rflags = vmcs.read(VmcsGuestNW::RFLAGS)?;
        if rflags & RFLAGS_IF != 0 && !shadow {
            let info = VmxInterruptInfo::new(intr.vector, VmxInterruptionType::External, None);
            vmcs::inject_event(vmcs, &info, 0)?;
            self.interrupt = None;
        } else {
            self.arm_window(vmcs, PrimaryControls::INTERRUPT_WINDOW_EXITING)?;
            self.int_window = true;
        }
        Ok(())
    }

    /// Backs CR8 with the virtual-APIC page when the policy enables it and the
    /// processor can, and makes CR8 accesses exit otherwise.
    fn apply_tpr_policy(&mut self, vmcs: &VmcsGuard<'_, H>, policy: TprPolicy) -> Result {
        if self.tpr_policy == Some(policy) {
            return Ok(());
        }
        let shadow = match (&self.ctx.vapic, policy.enabled) {
            (Some(vapic), true) => {
                vmcs.write(VmcsControl64::VIRT_APIC_ADDR, vapic.phys_addr().as_usize() as u64)?;
                vmcs.write(VmcsControl32::TPR_THRESHOLD, 0)?;
                true
            }
            _ => false,
        };
        let ctls = VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS;
        vmcs::update_control(vmcs, ctls, PrimaryControls::USE_TPR_SHADOW.bits(), shadow)?;
        vmcs::update_control(vmcs, ctls, PrimaryControls::CR8_STORE_EXITING.bits(), !shadow)?;
        // CR8 writes keep exiting while the caller wants to hear about them.
        vmcs::update_control(
            vmcs,
            ctls,
            PrimaryControls::CR8_LOAD_EXITING.bits(),
            !shadow || policy.notify,
        )?;
        debug!(
            "[VMX] vCPU {} TPR shadow {}, notify {}",
            self.id, shadow, policy.notify
        );
        self.tpr_policy = Some(policy);
        Ok(())
    }

    fn arm_window(&self, vmcs: &VmcsGuard<'_, H>, control: PrimaryControls) -> Result {
        vmcs::update_control(
            vmcs,
            VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
            control.bits(),
            true,
        )
    }

    /// Keeps an event whose delivery the exit interrupted. (SDM Vol. 3C, Section 28.2.4)
    fn save_idt_vectoring(&mut self, vmcs: &VmcsGuard<'_, H>) -> Result {
        if let Some(info) = vmcs::idt_vectoring_info(vmcs)? {
            let instr_len = vmcs.read(vmcs::VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN)?;
            trace!("[VMX] vCPU {} exit during delivery of {:?}", self.id, info);
            self.reinject = Some((info, instr_len));
        }
        Ok(())
    }

    fn refresh_exit_state(&mut self, vmcs: &VmcsGuard<'_, H>) -> Result {
        let blocking =
            InterruptibilityState::from_bits_truncate(vmcs.read(VmcsGuest32::INTERRUPTIBILITY_STATE)?);
        self.exit_state = ExitState {
            cr8: self.ctx.cr8(),
            rflags: vmcs.read(VmcsGuestNW::RFLAGS)?,
            int_shadow: blocking
                .intersects(InterruptibilityState::BLOCKING_BY_STI | InterruptibilityState::BLOCKING_BY_MOV_SS),
            int_window_exiting: self.int_window,
            nmi_window_exiting: self.nmi_window,
            event_pending: self.event_pending(),
        };
        Ok(())
    }
}

/// Debug registers and CR2, which VM transitions leave alone.
#[derive(Default)]
struct DebugRegs {
    dr: [u64; 4],
    dr6: u64,
    cr2: u64,
}

impl DebugRegs {
    fn save<H: VmxHal>() -> Self {
        Self {
            dr: [H::read_dr(0), H::read_dr(1), H::read_dr(2), H::read_dr(3)],
            dr6: H::read_dr(6),
            cr2: H::read_cr2(),
        }
    }

    fn load<H: VmxHal>(&self) {
        for (index, value) in self.dr.iter().enumerate() {
            H::write_dr(index as u8, *value);
        }
        H::write_dr(6, self.dr6);
        H::write_cr2(self.cr2);
    }
}

/// A virtual CPU backed by one VMCS.
pub struct VirtualCpu<H: VmxHal> {
    machine: Arc<Machine<H>>,
    vmcs: Vmcs<H>,
    msr_bitmap: MsrBitmap<H>,
    asid: Option<Asid>,
    inner: VcpuInner<H>,
    kick: Arc<AtomicBool>,
    poisoned: bool,
}

impl<H: VmxHal> VirtualCpu<H> {
    pub(crate) fn new(machine: Arc<Machine<H>>, id: u32) -> Result<Self> {
        let host = machine.host().clone();
        let caps = host.caps();

        let mut msr_bitmap = MsrBitmap::intercept_all()?;
        for msr in PASSTHROUGH_MSRS {
            msr_bitmap.set_read_intercept(msr as u32, false);
            msr_bitmap.set_write_intercept(msr as u32, false);
        }
        for msr in READ_ONLY_MSRS {
            msr_bitmap.set_read_intercept(msr as u32, false);
        }

        let misc_enable = misc_enable::guest_view(Msr::IA32_MISC_ENABLE.read::<H>());
        let ctx = GuestContext::new(caps, misc_enable)?;
        let vmcs = Vmcs::new(host.clone())?;
        let asid = host.asids().alloc()?;
        let vpid = asid.value();

        let mut vcpu = Self {
            machine,
            vmcs,
            msr_bitmap,
            asid: Some(asid),
            inner: VcpuInner {
                id,
                ctx,
                reinject: None,
                exception: None,
                interrupt: None,
                int_window: false,
                nmi_window: false,
                ept_generation: 0,
                last_cpu: None,
                exit_state: ExitState::default(),
                tpr_policy: None,
            },
            kick: Arc::new(AtomicBool::new(false)),
            poisoned: false,
        };
        vcpu.setup_vmcs(vpid)?;
        debug!("[VMX] created vCPU {} with VPID {}", id, vpid);
        Ok(vcpu)
    }

    fn setup_vmcs(&mut self, vpid: u16) -> Result {
        let machine = &self.machine;
        let caps = machine.host().caps();
        let inner = &mut self.inner;
        let bitmap = self.msr_bitmap.phys_addr();
        let vmcs = self.vmcs.enter()?;

        vmcs.write(VmcsGuest64::LINK_PTR, u64::MAX)?;
        let mut pinbased = caps.pinbased_ctls;
        if machine.preemption_timer().is_some() {
            pinbased |= PinbasedControls::VMX_PREEMPTION_TIMER.bits();
        }
        vmcs.write(VmcsControl32::PINBASED_EXEC_CONTROLS, pinbased)?;
        vmcs.write(VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS, caps.procbased_ctls)?;
        inner.apply_tpr_policy(&vmcs, machine.tpr_policy())?;
        vmcs.write(VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS, caps.procbased_ctls2)?;
        vmcs.write(VmcsControl32::VMENTRY_CONTROLS, caps.entry_ctls)?;
        vmcs.write(VmcsControl32::VMEXIT_CONTROLS, caps.exit_ctls)?;
        vmcs.write(VmcsControl32::EXCEPTION_BITMAP, 0)?;
        vmcs.write(VmcsControl32::CR3_TARGET_COUNT, 0)?;
        vmcs.write(VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD, 0)?;

        vmcs.write(VmcsControl64::MSR_BITMAPS_ADDR, bitmap.as_usize() as u64)?;
        // Guest MSRs are stored on exit and loaded on entry from the same list;
        // host values are put back by `run`.
        let msrs = &inner.ctx.msrs;
        vmcs.write(VmcsControl64::VMEXIT_MSR_STORE_ADDR, msrs.phys_addr().as_usize() as u64)?;
        vmcs.write(VmcsControl32::VMEXIT_MSR_STORE_COUNT, msrs.exit_count())?;
        vmcs.write(VmcsControl64::VMENTRY_MSR_LOAD_ADDR, msrs.phys_addr().as_usize() as u64)?;
        vmcs.write(VmcsControl32::VMENTRY_MSR_LOAD_COUNT, msrs.entry_count())?;
        vmcs.write(VmcsControl32::VMEXIT_MSR_LOAD_COUNT, 0)?;

        vmcs.write(VmcsControl16::VPID, vpid)?;
        vmcs.write(VmcsControl64::EPTP, machine.eptp())?;
        vmcs.write(VmcsControl64::TSC_OFFSET, H::rdtsc().wrapping_neg())?;

        write_host_state(&vmcs, &H::host_state())?;
        inner.last_cpu = Some(vmcs.cpu());

        vmcs.write(VmcsGuest64::IA32_DEBUGCTL, 0)?;
        vmcs.write(VmcsGuestNW::PENDING_DBG_EXCEPTIONS, 0)?;
        // Zero the registers import compares against.
        vmcs.write(VmcsGuestNW::CR0, 0)?;
        vmcs.write(VmcsGuestNW::CR3, 0)?;
        vmcs.write(VmcsGuestNW::CR4, 0)?;
        vmcs.write(VmcsGuest64::IA32_EFER, 0)?;
        state::import(
            &vmcs,
            &mut inner.ctx,
            caps,
            StateGroups::ALL,
            &VcpuState::reset(),
        )
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn machine(&self) -> &Arc<Machine<H>> {
        &self.machine
    }

    /// Where the VMCS of this vCPU is current.
    pub fn residency(&self) -> Residency {
        self.vmcs.residency()
    }

    /// Interrupt state as of the last exit.
    pub fn exit_state(&self) -> ExitState {
        self.inner.exit_state
    }

    /// State groups the last exchange with the caller left valid.
    pub fn cached_groups(&self) -> StateGroups {
        self.inner.ctx.cached
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn kicker(&self) -> VcpuKicker {
        VcpuKicker(self.kick.clone())
    }

    /// Queues an event for delivery on a later `run`.
    ///
    /// A newer event of the same kind replaces an undelivered one. Whether an
    /// exception vector may be injected at all is checked when it is committed.
    pub fn inject_event(&mut self, kind: EventKind, vector: u32, err_code: Option<u32>) -> Result {
        let vector = u8::try_from(vector)
            .map_err(|_| VmxError::InvalidInput(format!("event vector {}", vector)))?;
        let event = Some(PendingEvent { vector, err_code });
        match kind {
            EventKind::Interrupt => self.inner.interrupt = event,
            EventKind::Exception => self.inner.exception = event,
        }
        trace!("[VMX] vCPU {} queued {:?} {:#x}", self.inner.id, kind, vector);
        Ok(())
    }

    /// Copies the requested groups of guest state out.
    ///
    /// Groups not requested hold their RESET values.
    pub fn get_state(&mut self, groups: StateGroups) -> Result<VcpuState> {
        let mut snapshot = VcpuState::reset();
        let vmcs = self.vmcs.enter()?;
        state::export(&vmcs, &mut self.inner.ctx, groups, &mut snapshot)?;
        Ok(snapshot)
    }

    /// Loads the requested groups of `snapshot` into the guest.
    pub fn set_state(&mut self, snapshot: &VcpuState, groups: StateGroups) -> Result {
        let caps = self.machine.host().caps();
        let vmcs = self.vmcs.enter()?;
        state::import(&vmcs, &mut self.inner.ctx, caps, groups, snapshot)
    }

    /// Puts the guest back into its RESET state and makes it runnable again.
    pub fn reset(&mut self) -> Result {
        self.set_state(&VcpuState::reset(), StateGroups::ALL)?;
        let vmcs = self.vmcs.enter()?;
        vmcs.write(VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD, 0)?;
        vmcs.write(
            VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
            self.machine.host().caps().procbased_ctls,
        )?;
        drop(vmcs);
        self.inner.clear_events();
        self.inner.tpr_policy = None;
        self.inner.int_window = false;
        self.inner.nmi_window = false;
        self.inner.ctx.flush_tlb = true;
        if self.poisoned {
            info!("[VMX] vCPU {} reset, no longer poisoned", self.inner.id);
        }
        self.poisoned = false;
        Ok(())
    }

    /// Runs the guest until an exit needs the caller.
    pub fn run(&mut self) -> Result<ExitEvent> {
        if self.poisoned {
            return Err(VmxError::VcpuPoisoned);
        }
        let machine = &*self.machine;
        let inner = &mut self.inner;
        let kick = &*self.kick;
        let asid = self.asid.as_ref().map_or(0, Asid::value);
        let mut vmcs = self.vmcs.enter()?;

        let host_msrs = HOST_SAVED_MSRS.map(|msr| msr.read::<H>());
        let result = run_loop(&mut vmcs, inner, machine, kick, asid)
            .and_then(|event| inner.refresh_exit_state(&vmcs).map(|_| event));
        // Any return to the caller answers a pending kick.
        kick.store(false, Ordering::Release);
        for (msr, value) in HOST_SAVED_MSRS.iter().zip(host_msrs) {
            unsafe { msr.write::<H>(value) };
        }
        drop(vmcs);

        if let Err(err) = &result {
            if err.is_fatal() {
                error!("[VMX] vCPU {} poisoned: {}", self.inner.id, err);
                self.poisoned = true;
            }
        }
        result
    }

    /// Forces the VMCS out of every CPU and releases the VPID.
    pub fn destroy(mut self) -> Result {
        let vmcs = self.vmcs.enter()?;
        vmcs.destroy()?;
        if let Some(asid) = self.asid.take() {
            self.machine.host().asids().free(asid);
        }
        info!("[VMX] destroyed vCPU {}", self.inner.id);
        Ok(())
    }
}

impl<H: VmxHal> Drop for VirtualCpu<H> {
    fn drop(&mut self) {
        if let Some(asid) = self.asid.take() {
            self.machine.host().asids().free(asid);
        }
    }
}

impl<H: VmxHal> Debug for VirtualCpu<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("VirtualCpu")
            .field("id", &self.inner.id)
            .field("asid", &self.asid)
            .field("residency", &self.vmcs.residency())
            .field("exit_state", &self.inner.exit_state)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

fn run_loop<H: VmxHal>(
    vmcs: &mut VmcsGuard<'_, H>,
    inner: &mut VcpuInner<H>,
    machine: &Machine<H>,
    kick: &AtomicBool,
    asid: u16,
) -> Result<ExitEvent> {
    let caps = machine.host().caps();
    loop {
        let cpu = vmcs.cpu();
        if inner.last_cpu != Some(cpu) {
            debug!("[VMX] vCPU {} moved to CPU {}", inner.id, cpu);
            write_host_percpu_state(vmcs, &H::host_state())?;
            inner.ctx.flush_tlb = true;
            inner.last_cpu = Some(cpu);
        }

        inner.apply_tpr_policy(vmcs, machine.tpr_policy())?;
        inner.commit_events(vmcs)?;

        if inner.ctx.flush_tlb {
            H::invvpid(caps.invvpid_op, asid).map_err(super::as_vmx_err::<H>)?;
            inner.ctx.flush_tlb = false;
        }
        let generation = machine.ept_generation();
        let mut invept = machine.take_ept_stale(cpu);
        if generation != inner.ept_generation {
            machine.mark_ept_stale(cpu);
            inner.ept_generation = generation;
            invept = true;
        }
        if invept {
            trace!("[VMX] CPU {} INVEPT for generation {}", cpu, generation);
            H::invept(caps.invept_op, machine.eptp()).map_err(super::as_vmx_err::<H>)?;
        }
        if let Some(ticks) = machine.preemption_timer() {
            vmcs.write(VmcsGuest32::VMX_PREEMPTION_TIMER_VALUE, ticks)?;
        }

        let guest_debug = DebugRegs {
            dr: inner.ctx.dr,
            dr6: inner.ctx.dr6,
            cr2: inner.ctx.cr2,
        };
        let irq_enabled = H::irq_save_disable();
        inner.ctx.xstate.switch_to_guest::<H>();
        let host_debug = DebugRegs::save::<H>();
        guest_debug.load::<H>();

        let entered = H::vm_entry(&mut inner.ctx.regs, vmcs.launched());

        let guest_debug = DebugRegs::save::<H>();
        host_debug.load::<H>();
        inner.ctx.xstate.switch_to_host::<H>();
        H::irq_restore(irq_enabled);
        inner.ctx.dr = guest_debug.dr;
        inner.ctx.dr6 = guest_debug.dr6;
        inner.ctx.cr2 = guest_debug.cr2;

        if let Err(fail) = entered {
            let reason = match fail {
                VmFail::VmFailValid => vmcs::instruction_error::<H>().as_str(),
                VmFail::VmFailInvalid => "VMfailInvalid",
            };
            return Err(VmxError::EntryFailed(format!(
                "{} failed on CPU {}: {}",
                if vmcs.launched() { "VMRESUME" } else { "VMLAUNCH" },
                cpu,
                reason
            )));
        }
        inner.ctx.cached = StateGroups::empty();

        let info = vmcs::exit_info(vmcs)?;
        trace!(
            "[VMX] vCPU {} exit {:?} ({:#x}) at {:#x}",
            inner.id, info.exit_reason, info.raw_reason, info.guest_rip
        );
        // A failed entry leaves the launch state alone.
        if !info.entry_failure {
            vmcs.mark_launched();
            inner.save_idt_vectoring(vmcs)?;
        }

        let regs_before = inner.ctx.regs;
        let action = machine.exits().dispatch(&mut ExitContext {
            vmcs: &*vmcs,
            vcpu: &mut *inner,
            machine,
            info,
        })?;
        if log_enabled!(log::Level::Trace) {
            let diff = GeneralRegistersDiff::new(regs_before, inner.ctx.regs);
            if !diff.is_same() {
                trace!("[VMX] vCPU {} exit handler wrote {:?}", inner.id, diff);
            }
        }
        match action {
            ExitAction::Handled => {}
            ExitAction::ReturnToCaller(event) => return Ok(event),
            ExitAction::Fatal(code) => return Err(VmxError::UnhandledExit(code)),
        }
        if kick.swap(false, Ordering::AcqRel) || H::should_yield() {
            return Ok(ExitEvent::None);
        }
    }
}

fn write_host_state<H: VmxHal>(vmcs: &VmcsGuard<'_, H>, host: &HostState) -> Result {
    vmcs.write(VmcsHost16::ES_SELECTOR, host.es)?;
    vmcs.write(VmcsHost16::CS_SELECTOR, host.cs)?;
    vmcs.write(VmcsHost16::SS_SELECTOR, host.ss)?;
    vmcs.write(VmcsHost16::DS_SELECTOR, host.ds)?;
    vmcs.write(VmcsHostNW::CR0, host.cr0)?;
    vmcs.write(VmcsHostNW::CR3, host.cr3)?;
    vmcs.write(VmcsHostNW::CR4, host.cr4)?;
    vmcs.write(VmcsHost32::IA32_SYSENTER_CS, host.sysenter_cs)?;
    vmcs.write(VmcsHostNW::IA32_SYSENTER_ESP, host.sysenter_esp)?;
    vmcs.write(VmcsHostNW::IA32_SYSENTER_EIP, host.sysenter_eip)?;
    vmcs.write(VmcsHost64::IA32_PAT, host.pat)?;
    vmcs.write(VmcsHost64::IA32_EFER, host.efer)?;
    vmcs.write(VmcsHostNW::RIP, host.rip)?;
    write_host_percpu_state(vmcs, host)
}

/// Host state that differs between physical CPUs.
fn write_host_percpu_state<H: VmxHal>(vmcs: &VmcsGuard<'_, H>, host: &HostState) -> Result {
    vmcs.write(VmcsHost16::FS_SELECTOR, host.fs)?;
    vmcs.write(VmcsHost16::GS_SELECTOR, host.gs)?;
    vmcs.write(VmcsHost16::TR_SELECTOR, host.tr)?;
    vmcs.write(VmcsHostNW::FS_BASE, host.fs_base)?;
    vmcs.write(VmcsHostNW::GS_BASE, host.gs_base)?;
    vmcs.write(VmcsHostNW::TR_BASE, host.tr_base)?;
    vmcs.write(VmcsHostNW::GDTR_BASE, host.gdtr_base)?;
    vmcs.write(VmcsHostNW::IDTR_BASE, host.idtr_base)?;
    Ok(())
}
