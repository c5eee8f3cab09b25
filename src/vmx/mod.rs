pub(crate) mod definitions;
pub(crate) mod entry;
pub(crate) mod instructions;
pub(crate) mod vmcs;

mod asid;
mod caps;
mod cpuid;
mod exit;
mod host;
mod machine;
mod percpu;
mod residency;
mod state;
mod structs;
mod vcpu;

pub use self::asid::{Asid, AsidSpace};
pub use self::caps::VmxCapabilities;
pub use self::cpuid::{CpuidOverride, CpuidTable};
pub use self::definitions::VmxExitReason;
pub use self::exit::{ExitEvent, IoAccess, MemoryAccess};
pub use self::host::VmxHost;
pub use self::machine::{Machine, MachineConfig, TprPolicy};
pub use self::percpu::VmxPerCpuState;
pub use self::residency::Residency;
pub use self::state::{Segment, SegmentAttrib, SegmentReg, StateGroups, VcpuState};
pub use self::vcpu::{EventKind, ExitState, VcpuKicker, VirtualCpu};
pub use crate::xstate::FpuState;

use alloc::string::String;

use crate::{VmxError, VmxHal};

/// Return if current platform support virtualization extension.
pub fn has_hardware_support() -> bool {
    if let Some(feature) = raw_cpuid::CpuId::new().get_feature_info() {
        feature.has_vmx()
    } else {
        false
    }
}

/// Converts a VMX instruction failure into a [`VmxError`].
///
/// Must be called while the failing VMCS is still current, since `VmFailValid`
/// is decoded from its VM-instruction error field.
pub(crate) fn as_vmx_err<H: VmxHal>(err: x86::vmx::VmFail) -> VmxError {
    use x86::vmx::VmFail;
    match err {
        VmFail::VmFailValid => {
            VmxError::VmxInstructionError(String::from(vmcs::instruction_error::<H>().as_str()))
        }
        VmFail::VmFailInvalid => VmxError::InvalidVmcsPtr,
    }
}
