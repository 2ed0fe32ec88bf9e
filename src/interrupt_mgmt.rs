// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Routing of interrupt types to their top-level EL3 handlers.

use crate::context::World;
use arm_sysregs::ScrEl3;
use bitflags::bitflags;
use log::debug;
use num_enum::TryFromPrimitive;
use spin::Once;

/// The type of an interrupt, according to where it should be handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum InterruptType {
    /// Secure Group 1 interrupts, handled by the secure world.
    SecureEl1 = 0,
    /// Group 0 interrupts, handled at EL3.
    El3 = 1,
    /// Non-secure Group 1 interrupts, handled by the normal world.
    NonSecure = 2,
}

impl InterruptType {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        self as usize
    }

    /// Returns the `SCR_EL3` bit which causes this type of interrupt to be taken to EL3 while
    /// running in `world`.
    ///
    /// Group 0 interrupts are always signalled as FIQs. Group 1 interrupts are signalled as IRQs for
    /// the current security state and as FIQs for the other one.
    fn routing_bit(self, world: World) -> ScrEl3 {
        match (self, world) {
            (Self::El3, _) => ScrEl3::FIQ,
            (Self::SecureEl1, World::Secure) | (Self::NonSecure, World::NonSecure) => ScrEl3::IRQ,
            (Self::SecureEl1, World::NonSecure) | (Self::NonSecure, World::Secure) => ScrEl3::FIQ,
        }
    }
}

bitflags! {
    /// The worlds from which an interrupt type should be routed to EL3.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct RoutingFlags: u32 {
        /// Route to EL3 while executing in the secure world.
        const SECURE = 1 << 0;
        /// Route to EL3 while executing in the normal world.
        const NON_SECURE = 1 << 1;
    }
}

impl RoutingFlags {
    /// Returns the flag for the given world.
    pub fn for_world(world: World) -> Self {
        match world {
            World::Secure => Self::SECURE,
            World::NonSecure => Self::NON_SECURE,
        }
    }
}

/// Top-level handler for all interrupts of a given type taken to EL3.
pub trait InterruptTypeHandler: Sync {
    /// Handles an interrupt which was taken to EL3 while running in `world`.
    fn handle_interrupt(&self, world: World) -> u64;
}

/// Errors from registering an interrupt type handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoutingError {
    /// No world was specified to route from.
    InvalidFlags,
    /// A handler was already registered for the interrupt type.
    AlreadyRegistered,
}

struct Route {
    flags: RoutingFlags,
    handler: &'static dyn InterruptTypeHandler,
}

/// The registered top-level handlers, one per interrupt type.
pub struct InterruptRouting {
    routes: [Once<Route>; InterruptType::COUNT],
}

impl InterruptRouting {
    /// Creates an empty set of routes.
    pub const fn new() -> Self {
        Self {
            routes: [const { Once::new() }; InterruptType::COUNT],
        }
    }

    /// Registers `handler` for interrupts of type `interrupt_type` taken from the worlds in
    /// `flags`.
    pub fn register_type_handler(
        &self,
        interrupt_type: InterruptType,
        handler: &'static dyn InterruptTypeHandler,
        flags: RoutingFlags,
    ) -> Result<(), RoutingError> {
        if flags.is_empty() {
            return Err(RoutingError::InvalidFlags);
        }

        let mut registered = false;
        self.routes[interrupt_type.index()].call_once(|| {
            registered = true;
            Route { flags, handler }
        });
        if !registered {
            return Err(RoutingError::AlreadyRegistered);
        }

        debug!("Registered {interrupt_type:?} interrupt handler, routed from {flags:?}");
        Ok(())
    }

    /// Returns the routing flags for the given interrupt type, if a handler has been registered.
    pub fn routing_flags(&self, interrupt_type: InterruptType) -> Option<RoutingFlags> {
        self.routes[interrupt_type.index()]
            .get()
            .map(|route| route.flags)
    }

    /// Calls the handler for an interrupt of the given type taken while running in `world`.
    ///
    /// Returns `None` if there is no handler routing that type of interrupt from `world`.
    pub fn dispatch(&self, interrupt_type: InterruptType, world: World) -> Option<u64> {
        let route = self.routes[interrupt_type.index()].get()?;
        if !route.flags.contains(RoutingFlags::for_world(world)) {
            return None;
        }
        Some(route.handler.handle_interrupt(world))
    }

    /// Configures the interrupt routing bits in `scr_el3` for running in `world`, according to the
    /// registered handlers.
    pub fn set_routing_model(&self, scr_el3: &mut ScrEl3, world: World) {
        *scr_el3 -= ScrEl3::IRQ | ScrEl3::FIQ;
        for interrupt_type in [
            InterruptType::SecureEl1,
            InterruptType::El3,
            InterruptType::NonSecure,
        ] {
            if self
                .routing_flags(interrupt_type)
                .is_some_and(|flags| flags.contains(RoutingFlags::for_world(world)))
            {
                *scr_el3 |= interrupt_type.routing_bit(world);
            }
        }
    }
}

impl Default for InterruptRouting {
    fn default() -> Self {
        Self::new()
    }
}
