// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! GICv3 CPU interface as used by the EL3 exception handling framework.

/// The highest priority that may be used by the normal world.
pub const GIC_HIGHEST_NS_PRIORITY: u8 = 0x80;

/// The lowest possible priority, i.e. the idle priority reported when no interrupt is active.
pub const GIC_PRI_MASK: u8 = 0xff;

#[cfg(any(test, target_arch = "aarch64"))]
pub use self::cpu_interface::GicCpuInterface;

#[cfg(any(test, target_arch = "aarch64"))]
mod cpu_interface {
    use crate::{ehf::InterruptController, interrupt_mgmt::InterruptType};
    use arm_gic::{IntId, InterruptGroup, gicv3::GicCpuInterface as GicV3};
    use arm_sysregs::read_icc_rpr_el1;

    /// The GICv3 CPU interface of the current core, accessed through system registers.
    ///
    /// The GIC must already have been configured for system register access at EL3.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct GicCpuInterface;

    impl InterruptController for GicCpuInterface {
        fn running_priority(&self) -> u8 {
            // The priority is in bits [7:0].
            read_icc_rpr_el1().bits() as u8
        }

        fn set_priority_mask(&self, mask: u8) -> u8 {
            let old_mask = GicV3::get_priority_mask();
            GicV3::set_priority_mask(mask);
            old_mask
        }

        fn acknowledge(&self) -> Option<IntId> {
            GicV3::get_and_acknowledge_interrupt(InterruptGroup::Group0)
        }

        fn supports_interrupt_type(&self, interrupt_type: InterruptType) -> bool {
            // Group 0, secure Group 1 and non-secure Group 1 are all available with GICv3 at EL3.
            matches!(
                interrupt_type,
                InterruptType::El3 | InterruptType::SecureEl1 | InterruptType::NonSecure
            )
        }
    }

}
