//! In-memory forest configuration (spec.md §6 `new`'s parameters, bundled).
//! No file-based format is implied — forests are always constructed
//! programmatically, consistent with the Non-goals.

use crate::types::quadrant::ConnectType;

/// Parameters a forest is built and balanced with. Passed by value into
/// [`crate::types::forest::Forest::new`]/[`crate::balance::balance`] rather
/// than threaded as loose arguments.
#[derive(Clone, Copy, Debug)]
pub struct ForestConfig {
    /// Minimum global leaf count `new` builds a uniform forest up to.
    pub min_total_quadrants: u64,
    /// Co-dimension up to which balance is enforced.
    pub connect_type: ConnectType,
    /// Selects the sort variant over the default ghost-layer protocol.
    pub balance_sort: bool,
}

impl Default for ForestConfig {
    fn default() -> Self {
        ForestConfig {
            min_total_quadrants: 1,
            connect_type: ConnectType::Full,
            balance_sort: false,
        }
    }
}
