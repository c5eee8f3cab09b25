#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

pub(crate) mod regs;

cfg_if::cfg_if! {
    if #[cfg(feature = "vmx")] {
        mod frame;
        mod hal;
        pub(crate) mod msr;
        mod vmx;
        mod xstate;

        pub use hal::{HostState, VmxHal};
        pub use vmx::{
            Asid, AsidSpace, CpuidOverride, CpuidTable, EventKind, ExitEvent, ExitState, FpuState,
            IoAccess, Machine, MachineConfig, MemoryAccess, Residency, Segment, SegmentAttrib,
            SegmentReg, StateGroups, TprPolicy, VcpuKicker, VcpuState, VirtualCpu,
            VmxCapabilities, VmxExitReason, VmxHost, VmxPerCpuState,
        };
        pub use vmx::has_hardware_support;
    }
}

#[cfg(all(test, feature = "vmx"))]
mod test_utils;
#[cfg(all(test, feature = "vmx"))]
mod tests;

pub use regs::GeneralRegisters;

/// Host physical address.
pub type HostPhysAddr = memory_addr::PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = memory_addr::VirtAddr;
/// Guest physical address, as reported by second-level translation faults.
pub type GuestPhysAddr = u64;

use alloc::string::String;

/// Errors returned by the VMX engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmxError {
    /// A VMX instruction failed with a valid VMCS; carries the decoded instruction error.
    #[error("VMX instruction error: {0}")]
    VmxInstructionError(String),
    /// A VMX instruction failed because no valid VMCS was current.
    #[error("invalid VMCS pointer")]
    InvalidVmcsPtr,
    /// The processor lacks a feature this engine requires.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("VMX is already enabled")]
    VmxAlreadyEnabled,
    #[error("VMX is not enabled")]
    VmxNotEnabled,
    /// The computed VMCS configuration is not accepted by the processor.
    #[error("invalid VMCS configuration: {0}")]
    InvalidVmcsConfig(String),
    #[error("memory allocation failed")]
    MemoryAllocationFailed,
    /// The caller passed an argument the engine refuses (bad vector, overlapping masks...).
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A fixed-size table is full.
    #[error("no space left in table")]
    NoSpace,
    /// Every address-space identifier is in use.
    #[error("no free ASID")]
    AsidExhausted,
    /// The vCPU hit a platform-fatal condition earlier and must be reset before running again.
    #[error("vCPU must be reset before it can run again")]
    VcpuPoisoned,
    /// VMLAUNCH/VMRESUME itself failed.
    #[error("VM entry failed: {0}")]
    EntryFailed(String),
    /// The processor reported an exit the engine has no handler for.
    #[error("unhandled VM exit {0:#x}")]
    UnhandledExit(u32),
}

impl VmxError {
    /// Whether this error leaves the vCPU unusable until it is reset.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::EntryFailed(_)
                | Self::UnhandledExit(_)
                | Self::VmxInstructionError(_)
                | Self::InvalidVmcsPtr
        )
    }
}

/// Result type of this crate.
pub type Result<T = ()> = core::result::Result<T, VmxError>;
