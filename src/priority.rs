// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! EL3 exception priority levels: translation between GIC priority values and priority table
//! indices, the platform priority table, and the per-core stack of active levels.

use crate::{context::World, fatal};
use arm_gic::IntId;
use core::fmt::{self, Debug, Formatter};
use spin::Once;

/// Bit 7 of a GIC priority is clear for every priority in the secure range.
const NON_SECURE_PRIORITY_BIT: u8 = 0x80;

/// Mask of the bits of a GIC priority usable by secure priorities.
const SECURE_PRIORITY_MASK: u8 = 0x7f;

/// The largest number of priority bits a platform may use for EL3 priorities.
pub const MAX_PRIORITY_BITS: u8 = 7;

/// The maximum number of EL3 priority levels, bounded by the width of [`ActivePriorities`].
pub const MAX_PRIORITY_LEVELS: usize = ActivePriorities::CAPACITY;

/// Handler for interrupts taken at a given EL3 priority level.
///
/// The handler is passed the acknowledged interrupt ID and the world which was interrupted, and is
/// responsible for signalling the end of the interrupt to the interrupt controller.
pub type PriorityHandler = fn(int_id: IntId, world: World) -> u64;

/// Returns whether the given GIC priority is in the secure range.
pub const fn is_secure_priority(priority: u8) -> bool {
    priority & NON_SECURE_PRIORITY_BIT == 0
}

/// Platform description of its EL3 priority levels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PriorityConfig {
    /// Number of significant bits of the GIC priority used to tell EL3 priorities apart.
    pub pri_bits: u8,
    /// The GIC priority value of each EL3 priority level.
    pub priorities: &'static [u8],
}

/// Converts between GIC priority values and indices in the priority table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PriorityTranslator {
    pri_bits: u8,
}

impl PriorityTranslator {
    /// Creates a translator for the given number of priority bits.
    ///
    /// Panics if `pri_bits` is not between 1 and [`MAX_PRIORITY_BITS`].
    pub fn new(pri_bits: u8) -> Self {
        if !(1..=MAX_PRIORITY_BITS).contains(&pri_bits) {
            fatal!("Invalid number of EL3 priority bits {pri_bits}");
        }
        Self { pri_bits }
    }

    /// Returns the number of priority bits this translator was created with.
    pub fn pri_bits(self) -> u8 {
        self.pri_bits
    }

    fn shift(self) -> u8 {
        MAX_PRIORITY_BITS - self.pri_bits
    }

    /// Returns the priority table index for the given priority value.
    pub fn index_of(self, priority: u8) -> usize {
        usize::from(priority >> self.shift())
    }

    /// Returns the secure priority value for the given priority table index.
    pub fn value_of(self, index: usize) -> u8 {
        ((index << self.shift()) & usize::from(SECURE_PRIORITY_MASK)) as u8
    }
}

/// Descriptor for a single EL3 priority level.
struct PriorityDescriptor {
    valid: bool,
    handler: Once<PriorityHandler>,
}

impl PriorityDescriptor {
    const fn new() -> Self {
        Self {
            valid: false,
            handler: Once::new(),
        }
    }
}

/// Table of the EL3 priority levels of the platform and their handlers.
///
/// The set of valid levels is fixed on construction. Each level may have a handler registered
/// exactly once.
pub struct PriorityTable {
    translator: PriorityTranslator,
    num_priorities: usize,
    descriptors: [PriorityDescriptor; MAX_PRIORITY_LEVELS],
}

impl PriorityTable {
    /// Builds the priority table from the platform configuration.
    ///
    /// Panics if any of the configured priorities is not a valid EL3 priority for the configured
    /// number of priority bits, or if two priorities map to the same level.
    pub fn new(config: &PriorityConfig) -> Self {
        let translator = PriorityTranslator::new(config.pri_bits);
        let mut descriptors = [const { PriorityDescriptor::new() }; MAX_PRIORITY_LEVELS];
        let mut num_priorities = 0;

        for &priority in config.priorities {
            if !is_secure_priority(priority) {
                fatal!("EL3 priority {priority:#x} not in secure range");
            }
            let index = translator.index_of(priority);
            if index >= MAX_PRIORITY_LEVELS {
                fatal!("EL3 priority {priority:#x} has index {index} beyond table capacity");
            }
            if translator.value_of(index) != priority {
                fatal!(
                    "EL3 priority {priority:#x} not representable with {} priority bits",
                    config.pri_bits
                );
            }
            if descriptors[index].valid {
                fatal!("Duplicate EL3 priority {priority:#x}");
            }
            descriptors[index].valid = true;
            num_priorities = num_priorities.max(index + 1);
        }

        Self {
            translator,
            num_priorities,
            descriptors,
        }
    }

    /// Returns the translator between priority values and table indices.
    pub fn translator(&self) -> PriorityTranslator {
        self.translator
    }

    /// Returns the number of entries in the table, i.e. one more than the highest valid index.
    pub fn num_priorities(&self) -> usize {
        self.num_priorities
    }

    /// Returns whether the level at `index` was configured by the platform.
    pub fn is_valid_index(&self, index: usize) -> bool {
        index < self.num_priorities && self.descriptors[index].valid
    }

    /// Returns the table index of the given priority.
    ///
    /// Panics if the priority doesn't correspond to a configured level.
    pub fn index_of(&self, priority: u8) -> usize {
        let index = self.translator.index_of(priority);
        if !self.is_valid_index(index) {
            fatal!("Invalid EL3 priority {priority:#x} (index {index})");
        }
        index
    }

    /// Returns the priority value of the given table index.
    pub fn value_of(&self, index: usize) -> u8 {
        self.translator.value_of(index)
    }

    /// Returns the handler registered for the level at `index`, if any.
    pub fn handler(&self, index: usize) -> Option<PriorityHandler> {
        self.descriptors.get(index)?.handler.get().copied()
    }

    /// Registers `handler` for the given priority.
    ///
    /// Panics if the priority is not a configured level, or if a handler was already registered for
    /// it.
    pub fn register_handler(&self, priority: u8, handler: PriorityHandler) {
        let index = self.index_of(priority);
        if self.value_of(index) != priority {
            fatal!("EL3 priority {priority:#x} does not match level {index}");
        }

        let mut installed = false;
        self.descriptors[index].handler.call_once(|| {
            installed = true;
            handler
        });
        if !installed {
            fatal!("Handler already registered for priority {priority:#x}");
        }
    }
}

impl Debug for PriorityTable {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut list = f.debug_list();
        for index in (0..self.num_priorities).filter(|&index| self.is_valid_index(index)) {
            list.entry(&format_args!(
                "{:#04x}{}",
                self.value_of(index),
                if self.handler(index).is_some() {
                    ""
                } else {
                    " (no handler)"
                }
            ));
        }
        list.finish()
    }
}

/// Error returned when a priority level is pushed or popped out of order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NestingError {
    /// Index of the currently active level, if any.
    pub current: Option<usize>,
}

/// The set of priority levels active on a core, as a bitmask of table indices.
///
/// Levels are activated in strictly decreasing index order (i.e. increasing priority), so the
/// lowest set bit is always the most recently activated level, and only that level may be
/// deactivated.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct ActivePriorities(u32);

impl ActivePriorities {
    /// The maximum number of levels which can be tracked.
    pub const CAPACITY: usize = u32::BITS as usize;

    /// No active levels.
    pub const EMPTY: Self = Self(0);

    /// Returns whether no level is active.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the index of the most recently activated level, if any.
    pub fn top(self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Returns the raw bitmask.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Marks the level at `index` as active.
    ///
    /// Fails unless `index` is strictly lower than the index of every level already active.
    pub fn push(&mut self, index: usize) -> Result<(), NestingError> {
        let current = self.top();
        if index >= Self::CAPACITY || current.is_some_and(|top| index >= top) {
            return Err(NestingError { current });
        }
        self.0 |= 1 << index;
        Ok(())
    }

    /// Marks the level at `index` as no longer active.
    ///
    /// Fails unless `index` is the most recently activated level.
    pub fn pop(&mut self, index: usize) -> Result<(), NestingError> {
        let current = self.top();
        if current != Some(index) {
            return Err(NestingError { current });
        }
        // Clear the lowest set bit.
        self.0 &= self.0 - 1;
        Ok(())
    }
}

impl Debug for ActivePriorities {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "ActivePriorities({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: PriorityConfig = PriorityConfig {
        pri_bits: 3,
        priorities: &[0x20, 0x40],
    };

    fn dummy_handler(_int_id: IntId, _world: World) -> u64 {
        0
    }

    fn other_handler(_int_id: IntId, _world: World) -> u64 {
        1
    }

    #[test]
    fn translate_three_bits() {
        let translator = PriorityTranslator::new(3);
        assert_eq!(translator.index_of(0x00), 0);
        assert_eq!(translator.index_of(0x10), 1);
        assert_eq!(translator.index_of(0x20), 2);
        assert_eq!(translator.index_of(0x70), 7);
        assert_eq!(translator.value_of(2), 0x20);
        assert_eq!(translator.value_of(7), 0x70);
    }

    #[test]
    fn translate_masks_out_non_secure_bit() {
        let translator = PriorityTranslator::new(1);
        assert_eq!(translator.index_of(0x40), 1);
        assert_eq!(translator.value_of(1), 0x40);
        assert_eq!(translator.value_of(2), 0x00);

        let translator = PriorityTranslator::new(7);
        assert_eq!(translator.index_of(0x05), 5);
        assert_eq!(translator.value_of(0x85), 0x05);
    }

    #[test]
    #[should_panic(expected = "Invalid number of EL3 priority bits 0")]
    fn translator_zero_bits() {
        PriorityTranslator::new(0);
    }

    #[test]
    #[should_panic(expected = "Invalid number of EL3 priority bits 8")]
    fn translator_too_many_bits() {
        PriorityTranslator::new(8);
    }

    #[test]
    fn secure_range() {
        assert!(is_secure_priority(0x00));
        assert!(is_secure_priority(0x7f));
        assert!(!is_secure_priority(0x80));
        assert!(!is_secure_priority(0xff));
    }

    #[test]
    fn table_from_config() {
        // With 3 priority bits, index = priority >> 4.
        let table = PriorityTable::new(&PriorityConfig {
            pri_bits: 3,
            priorities: &[0x10, 0x20],
        });
        assert_eq!(table.num_priorities(), 3);
        assert!(!table.is_valid_index(0));
        assert!(table.is_valid_index(1));
        assert!(table.is_valid_index(2));
        assert!(!table.is_valid_index(3));
        assert_eq!(table.index_of(0x10), 1);
        assert_eq!(table.index_of(0x20), 2);
        assert_eq!(format!("{table:?}"), "[0x10 (no handler), 0x20 (no handler)]");
    }

    #[test]
    #[should_panic(expected = "Duplicate EL3 priority 0x20")]
    fn table_duplicate_priority() {
        PriorityTable::new(&PriorityConfig {
            pri_bits: 3,
            priorities: &[0x20, 0x20],
        });
    }

    #[test]
    #[should_panic(expected = "not in secure range")]
    fn table_non_secure_priority() {
        PriorityTable::new(&PriorityConfig {
            pri_bits: 3,
            priorities: &[0x80],
        });
    }

    #[test]
    #[should_panic(expected = "not representable with 3 priority bits")]
    fn table_unaligned_priority() {
        PriorityTable::new(&PriorityConfig {
            pri_bits: 3,
            priorities: &[0x28],
        });
    }

    #[test]
    #[should_panic(expected = "beyond table capacity")]
    fn table_index_too_large() {
        PriorityTable::new(&PriorityConfig {
            pri_bits: 7,
            priorities: &[0x40],
        });
    }

    #[test]
    #[should_panic(expected = "Invalid EL3 priority 0x30")]
    fn unconfigured_priority() {
        let table = PriorityTable::new(&CONFIG);
        table.index_of(0x30);
    }

    #[test]
    #[should_panic(expected = "Invalid EL3 priority 0x70")]
    fn priority_beyond_table() {
        let table = PriorityTable::new(&CONFIG);
        table.index_of(0x70);
    }

    #[test]
    fn register_handler_once() {
        let table = PriorityTable::new(&CONFIG);
        assert!(table.handler(2).is_none());

        table.register_handler(0x20, other_handler);
        assert_eq!(
            table.handler(2).map(|handler| handler(IntId::spi(3), World::Secure)),
            Some(1)
        );
        assert!(table.handler(4).is_none());
        assert_eq!(format!("{table:?}"), "[0x20, 0x40 (no handler)]");
    }

    #[test]
    #[should_panic(expected = "Handler already registered for priority 0x20")]
    fn register_handler_twice() {
        let table = PriorityTable::new(&CONFIG);
        table.register_handler(0x20, dummy_handler);
        table.register_handler(0x20, other_handler);
    }

    #[test]
    #[should_panic(expected = "does not match level 2")]
    fn register_handler_inexact_priority() {
        let table = PriorityTable::new(&CONFIG);
        table.register_handler(0x21, dummy_handler);
    }

    #[test]
    fn active_priorities_nest() {
        let mut active = ActivePriorities::EMPTY;
        assert!(active.is_empty());
        assert_eq!(active.top(), None);

        active.push(4).unwrap();
        assert_eq!(active.top(), Some(4));
        active.push(1).unwrap();
        assert_eq!(active.top(), Some(1));
        assert_eq!(active.bits(), 0b10010);

        assert_eq!(active.push(1), Err(NestingError { current: Some(1) }));
        assert_eq!(active.push(3), Err(NestingError { current: Some(1) }));

        assert_eq!(active.pop(4), Err(NestingError { current: Some(1) }));
        active.pop(1).unwrap();
        assert_eq!(active.top(), Some(4));
        active.pop(4).unwrap();
        assert!(active.is_empty());
        assert_eq!(active.pop(4), Err(NestingError { current: None }));
    }

    #[test]
    fn active_priorities_bounds() {
        let mut active = ActivePriorities::EMPTY;
        assert_eq!(
            active.push(ActivePriorities::CAPACITY),
            Err(NestingError { current: None })
        );
        active.push(ActivePriorities::CAPACITY - 1).unwrap();
        active.push(0).unwrap();
        assert_eq!(format!("{active:?}"), "ActivePriorities(0x80000001)");
    }
}
