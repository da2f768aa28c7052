//! Optional counters for balance (spec.md §9: "the source uses a
//! module-level 'inspect' record for counters. This should be an optional
//! handle passed into the operation, not a singleton.").

/// Counters updated during one `balance` call. Passed by `&mut` reference
/// into [`crate::balance::ghost::balance_ghost`] /
/// [`crate::balance::sort::balance_sort`]; never a global.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inspect {
    pub local_pass_added: u64,
    pub first_round_sent: u64,
    pub first_round_received: u64,
    pub second_round_sent: u64,
    pub second_round_received: u64,
    pub merge_passes: u32,
    /// Selects the sort variant (spec.md §4.6) over the default ghost-layer
    /// protocol (spec.md §4.5).
    pub balance_sort: bool,
}
