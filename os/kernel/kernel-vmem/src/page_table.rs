//! # Two-Level Page Structures
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! A [`PageDirectory`] holds 1024 [`PdEntry`] values, each covering 4 MiB
//! through one [`PageTable`] of 1024 [`PtEntry`] leaves of 4 KiB.

pub mod pd;
pub mod pt;

use crate::page_table::pd::L2Index;
use crate::page_table::pt::L1Index;
use kernel_memory_addresses::VirtualAddress;

/// Split a virtual address into its directory and table indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (L2Index, L1Index) {
    (L2Index::from(va), L1Index::from(va))
}
