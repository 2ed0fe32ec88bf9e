// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! EL3 exception handling framework.
//!
//! Tracks, for each core, which EL3 priority levels are active, and keeps the GIC priority mask
//! consistent with them. Priority levels are activated either by taking an EL3 interrupt, or
//! explicitly with [`Ehf::activate_priority`] around delegating work to a lower EL, and must be
//! deactivated in the reverse order.
//!
//! It also raises the priority mask while executing in the secure world on behalf of the normal
//! world, so that non-secure interrupts can't preempt secure execution unless explicitly allowed
//! with [`Ehf::allow_ns_preemption`].

use crate::{
    context::{PerCoreState, World, WorldSwitchSubscriber, exception_free},
    fatal,
    gicv3::GIC_HIGHEST_NS_PRIORITY,
    interrupt_mgmt::{InterruptRouting, InterruptType, InterruptTypeHandler, RoutingFlags},
    priority::{
        ActivePriorities, MAX_PRIORITY_BITS, NestingError, PriorityConfig, PriorityHandler,
        PriorityTable, is_secure_priority,
    },
};
use arm_gic::IntId;
use core::{
    cell::RefCell,
    fmt::{self, Display, Formatter},
};
use log::{info, trace};
use percore::{Cores, ExceptionLock, PerCore};

/// The interrupt controller operations needed to manage EL3 priorities on the current core.
pub trait InterruptController {
    /// Returns the priority of the highest priority active interrupt, or the idle priority if no
    /// interrupt is active.
    fn running_priority(&self) -> u8;

    /// Sets the priority mask to `mask`, and returns the previous value.
    fn set_priority_mask(&self, mask: u8) -> u8;

    /// Acknowledges the highest priority pending EL3 interrupt, if there is one.
    fn acknowledge(&self) -> Option<IntId>;

    /// Returns whether the controller can deliver interrupts of the given type.
    fn supports_interrupt_type(&self, interrupt_type: InterruptType) -> bool;
}

/// EL3 exception handling state of a single core.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PeExceptionState {
    /// The explicitly activated priority levels.
    pub active_priorities: ActivePriorities,
    /// The priority mask before the first of the current activations. Only meaningful while
    /// `active_priorities` isn't empty.
    pub init_pri_mask: u8,
    /// The normal world priority mask, stashed while running in the secure world.
    pub ns_pri_mask: Option<u8>,
}

impl PeExceptionState {
    const EMPTY: Self = Self {
        active_priorities: ActivePriorities::EMPTY,
        init_pri_mask: 0,
        ns_pri_mask: None,
    };
}

/// The priority value of the currently active level, for error messages.
struct ActiveLevel(Option<u8>);

impl Display for ActiveLevel {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.0 {
            Some(priority) => write!(f, "{priority:#x}"),
            None => f.write_str("none"),
        }
    }
}

/// The EL3 exception handling framework for `CORE_COUNT` cores.
pub struct Ehf<IC, C: Cores, const CORE_COUNT: usize> {
    controller: IC,
    priorities: PriorityTable,
    pe_state: PerCoreState<PeExceptionState, C, CORE_COUNT>,
}

impl<IC: InterruptController, C: Cores, const CORE_COUNT: usize> Ehf<IC, C, CORE_COUNT> {
    /// Creates a new instance with the given platform priority levels, with no priorities active on
    /// any core.
    pub fn new(config: &PriorityConfig, controller: IC) -> Self {
        Self {
            controller,
            priorities: PriorityTable::new(config),
            pe_state: PerCore::new(
                [const { ExceptionLock::new(RefCell::new(PeExceptionState::EMPTY)) }; CORE_COUNT],
            ),
        }
    }

    /// Returns the interrupt controller.
    pub fn controller(&self) -> &IC {
        &self.controller
    }

    /// Returns the platform priority table.
    pub fn priorities(&self) -> &PriorityTable {
        &self.priorities
    }

    /// Returns a copy of the exception handling state of the current core.
    pub fn pe_state(&self) -> PeExceptionState {
        self.with_pe_state(|pe_state| *pe_state)
    }

    fn with_pe_state<T>(&self, f: impl FnOnce(&mut PeExceptionState) -> T) -> T {
        exception_free(|token| f(&mut *self.pe_state.get().borrow_mut(token)))
    }

    fn active_level(&self, index: Option<usize>) -> ActiveLevel {
        ActiveLevel(index.map(|index| self.priorities.value_of(index)))
    }

    /// Checks that `priority` is higher than the running priority of the interrupt controller.
    fn check_running_priority(&self, priority: u8) {
        let running_priority = self.controller.running_priority();
        if priority >= running_priority {
            fatal!(
                "Running priority higher ({running_priority:#x}) than requested ({priority:#x})"
            );
        }
    }

    /// Registers `handler` to handle EL3 interrupts at the given priority.
    ///
    /// Panics if the priority isn't one of the platform's EL3 priorities, or a handler has already
    /// been registered for it.
    pub fn register_priority_handler(&self, priority: u8, handler: PriorityHandler) {
        self.priorities.register_handler(priority, handler);
        trace!("EHF: register pri={priority:#x} handler={:p}", handler as *const ());
    }

    /// Marks the given priority as active on the current core and raises the priority mask to it.
    ///
    /// This is for delegating to a lower EL other than for an interrupt, e.g. while handling a
    /// synchronous exception, and should be called before restoring the context of the world being
    /// delegated to.
    ///
    /// Panics if the priority isn't higher than the running priority and every priority already
    /// active on this core.
    pub fn activate_priority(&self, priority: u8) {
        self.check_running_priority(priority);
        let index = self.priorities.index_of(priority);

        self.with_pe_state(|pe_state| {
            let first_activation = pe_state.active_priorities.is_empty();
            if let Err(NestingError { current }) = pe_state.active_priorities.push(index) {
                fatal!(
                    "Activation priority mismatch: req={priority:#x} current={}",
                    self.active_level(current)
                );
            }

            let old_mask = self.controller.set_priority_mask(priority);
            if priority >= old_mask {
                fatal!("Requested priority ({priority:#x}) lower than Priority Mask ({old_mask:#x})");
            }

            // Restored after the last deactivation.
            if first_activation {
                pe_state.init_pri_mask = old_mask;
            }

            trace!("EHF: activate prio={index}");
        });
    }

    /// Marks the given priority as no longer active on the current core, and restores the priority
    /// mask once no priorities remain active.
    ///
    /// This should be called after saving the context of the world which was delegated to.
    ///
    /// Panics if the priority isn't the most recently activated priority on this core.
    pub fn deactivate_priority(&self, priority: u8) {
        self.check_running_priority(priority);
        let index = self.priorities.index_of(priority);

        self.with_pe_state(|pe_state| {
            if let Err(NestingError { current }) = pe_state.active_priorities.pop(index) {
                fatal!(
                    "Deactivation priority mismatch: req={priority:#x} current={}",
                    self.active_level(current)
                );
            }

            // While outer activations remain, the mask stays at the level just deactivated rather
            // than dropping to the next active level.
            let old_mask = if pe_state.active_priorities.is_empty() {
                let init_pri_mask = pe_state.init_pri_mask;
                pe_state.init_pri_mask = 0;
                self.controller.set_priority_mask(init_pri_mask)
            } else {
                self.controller.set_priority_mask(priority)
            };
            if old_mask > priority {
                fatal!(
                    "Deactivation priority ({priority:#x}) lower than Priority Mask ({old_mask:#x})"
                );
            }

            trace!(
                "EHF: deactivate prio={}",
                self.active_level(pe_state.active_priorities.top())
            );
        });
    }

    /// Stashes the normal world priority mask and raises the mask to the highest non-secure
    /// priority, so that non-secure interrupts can't preempt secure execution.
    ///
    /// Does nothing if the running priority is in the secure range or there are explicitly active
    /// priorities.
    pub fn on_exited_normal_world(&self) {
        if is_secure_priority(self.controller.running_priority()) {
            return;
        }

        self.with_pe_state(|pe_state| {
            if !pe_state.active_priorities.is_empty() {
                return;
            }
            if let Some(ns_pri_mask) = pe_state.ns_pri_mask {
                fatal!("Non-secure Priority Mask ({ns_pri_mask:#x}) already stashed");
            }

            let ns_pri_mask = self.controller.set_priority_mask(GIC_HIGHEST_NS_PRIORITY);
            if is_secure_priority(ns_pri_mask) {
                fatal!("Priority Mask ({ns_pri_mask:#x}) already in secure range");
            }
            pe_state.ns_pri_mask = Some(ns_pri_mask);

            trace!("EHF: Priority Mask: {ns_pri_mask:#x} => {GIC_HIGHEST_NS_PRIORITY:#x}");
        });
    }

    /// Restores the normal world priority mask stashed by [`Self::on_exited_normal_world`].
    ///
    /// Does nothing if the running priority is in the secure range, there are explicitly active
    /// priorities, or no mask is stashed.
    pub fn on_entering_normal_world(&self) {
        if is_secure_priority(self.controller.running_priority()) {
            return;
        }

        self.with_pe_state(|pe_state| {
            // With explicit activations the mask is restored by the last deactivation.
            if !pe_state.active_priorities.is_empty() {
                return;
            }
            let Some(ns_pri_mask) = pe_state.ns_pri_mask else {
                return;
            };

            let old_mask = self.controller.set_priority_mask(ns_pri_mask);
            // The mask must still be as set on leaving the normal world, or as restored by
            // `allow_ns_preemption`.
            if old_mask != GIC_HIGHEST_NS_PRIORITY && old_mask != ns_pri_mask {
                fatal!("Invalid Priority Mask ({old_mask:#x}) restored");
            }
            pe_state.ns_pri_mask = None;

            trace!("EHF: Priority Mask: {old_mask:#x} => {ns_pri_mask:#x}");
        });
    }

    /// Restores the normal world priority mask early, so that non-secure interrupts may preempt
    /// secure execution, e.g. during a yielding SMC.
    ///
    /// This must be called between saving the normal world context and restoring the secure world
    /// context. Panics if no normal world priority mask was stashed, or any priority is explicitly
    /// active.
    pub fn allow_ns_preemption(&self) {
        self.with_pe_state(|pe_state| {
            let Some(ns_pri_mask) = pe_state.ns_pri_mask else {
                fatal!(
                    "No Non-secure Priority Mask stashed on core {}",
                    C::core_index()
                );
            };
            if !pe_state.active_priorities.is_empty() {
                fatal!(
                    "Core {} has priority activations: {:#x}",
                    C::core_index(),
                    pe_state.active_priorities.bits()
                );
            }

            let old_mask = self.controller.set_priority_mask(ns_pri_mask);
            pe_state.ns_pri_mask = None;

            trace!("EHF: Priority Mask: {old_mask:#x} => {ns_pri_mask:#x}");
        });
    }

    /// Returns whether secure execution has allowed non-secure interrupts to preempt it.
    pub fn is_ns_preemption_allowed(&self) -> bool {
        if is_secure_priority(self.controller.running_priority()) {
            return false;
        }

        self.with_pe_state(|pe_state| {
            pe_state.active_priorities.is_empty() && pe_state.ns_pri_mask.is_none()
        })
    }

    /// Acknowledges a pending EL3 interrupt and calls the handler registered for its priority,
    /// returning the handler's result.
    ///
    /// Returns 0 without calling any handler if no EL3 interrupt is pending any more.
    pub fn handle_el3_interrupt(&self, world: World) -> u64 {
        // The interrupt may have been deasserted, or preempted by a higher priority interrupt of
        // another type, since it was signalled.
        let Some(int_id) = self.controller.acknowledge() else {
            return 0;
        };

        let priority = self.controller.running_priority();
        if !is_secure_priority(priority) {
            fatal!("EL3 interrupt {int_id:?} running at non-secure priority {priority:#x}");
        }
        let index = self.priorities.index_of(priority);
        if self.priorities.value_of(index) != priority {
            fatal!("Running priority {priority:#x} does not match level {index}");
        }

        let Some(handler) = self.priorities.handler(index) else {
            fatal!("No EL3 exception handler for priority {priority:#x}");
        };
        trace!("EHF: {int_id:?} from {world:?} at priority {priority:#x}");

        handler(int_id, world)
    }
}

impl<IC, C, const CORE_COUNT: usize> Ehf<IC, C, CORE_COUNT>
where
    IC: InterruptController + Sync + 'static,
    C: Cores + Sync + 'static,
{
    /// Checks the platform configuration and registers the framework to handle EL3 interrupts
    /// from both worlds.
    ///
    /// This must be called once, before EL3 interrupts are enabled.
    pub fn init(&'static self, routing: &InterruptRouting) {
        if !self.controller.supports_interrupt_type(InterruptType::El3) {
            fatal!("EL3 interrupts not supported by the interrupt controller");
        }

        let num_priorities = self.priorities.num_priorities();
        if num_priorities == 0 {
            fatal!("No EL3 priority levels configured");
        }
        // Both already enforced when the table was built.
        debug_assert!(num_priorities <= ActivePriorities::CAPACITY);
        debug_assert!((1..=MAX_PRIORITY_BITS).contains(&self.priorities.translator().pri_bits()));

        if let Err(e) = routing.register_type_handler(
            InterruptType::El3,
            self,
            RoutingFlags::SECURE | RoutingFlags::NON_SECURE,
        ) {
            fatal!("Failed to register EL3 interrupt handler: {e:?}");
        }

        info!("EL3 exception handling priorities: {:?}", self.priorities);
    }
}

impl<IC, C, const CORE_COUNT: usize> InterruptTypeHandler for Ehf<IC, C, CORE_COUNT>
where
    IC: InterruptController + Sync,
    C: Cores + Sync,
{
    fn handle_interrupt(&self, world: World) -> u64 {
        self.handle_el3_interrupt(world)
    }
}

impl<IC: InterruptController, C: Cores, const CORE_COUNT: usize> WorldSwitchSubscriber
    for Ehf<IC, C, CORE_COUNT>
{
    fn exited_normal_world(&self) {
        self.on_exited_normal_world();
    }

    fn entering_normal_world(&self) {
        self.on_entering_normal_world();
    }
}
