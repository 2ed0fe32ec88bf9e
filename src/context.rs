// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Security states, per-core state storage, and world switch notifications.

use core::cell::RefCell;
#[cfg(test)]
use percore::ExceptionFree;
#[cfg(not(test))]
pub use percore::exception_free;
use percore::{ExceptionLock, PerCore};

/// Per-core mutable state, for `CORE_COUNT` cores indexed by `C`.
pub type PerCoreState<T, C, const CORE_COUNT: usize> =
    PerCore<[ExceptionLock<RefCell<T>>; CORE_COUNT], C>;

/// The security state of a lower EL.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum World {
    /// The secure world, e.g. S-EL1 or S-EL2.
    Secure = 0,
    /// The normal world.
    NonSecure = 1,
}

/// Something which needs to be told when execution leaves or is about to re-enter the normal world.
pub trait WorldSwitchSubscriber {
    /// Called after leaving the normal world, before any secure work is done.
    fn exited_normal_world(&self);

    /// Called just before returning to the normal world.
    fn entering_normal_world(&self);
}

/// Notifies `subscribers` of a world switch from `old_world` to `new_world` on the current core.
pub fn publish_world_switch(
    old_world: World,
    new_world: World,
    subscribers: &[&dyn WorldSwitchSubscriber],
) {
    assert_ne!(old_world, new_world);

    match (old_world, new_world) {
        (World::NonSecure, _) => {
            for subscriber in subscribers {
                subscriber.exited_normal_world();
            }
        }
        (_, World::NonSecure) => {
            for subscriber in subscribers {
                subscriber.entering_normal_world();
            }
        }
        _ => {}
    }
}

/// Runs the given function and returns the result.
///
/// This is a fake version of `percore::exception_free` for use in unit tests only, which must be
/// run with a single thread per fake core.
#[cfg(test)]
pub fn exception_free<T>(f: impl FnOnce(ExceptionFree) -> T) -> T {
    // SAFETY: Unit tests run on the host, where there are no hardware exceptions, and each test
    // thread selects its own fake core.
    let token = unsafe { ExceptionFree::new() };
    f(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<&'static str>>,
    }

    impl WorldSwitchSubscriber for Recorder {
        fn exited_normal_world(&self) {
            self.events.borrow_mut().push("exited");
        }

        fn entering_normal_world(&self) {
            self.events.borrow_mut().push("entering");
        }
    }

    #[test]
    fn publish_to_all_subscribers() {
        let first = Recorder::default();
        let second = Recorder::default();

        publish_world_switch(World::NonSecure, World::Secure, &[&first, &second]);
        publish_world_switch(World::Secure, World::NonSecure, &[&first, &second]);

        assert_eq!(*first.events.borrow(), ["exited", "entering"]);
        assert_eq!(*second.events.borrow(), ["exited", "entering"]);
    }

    #[test]
    #[should_panic]
    fn switch_to_same_world() {
        publish_world_switch(World::Secure, World::Secure, &[]);
    }
}
