//! Policy checks that sit between the caller and the outside world:
//! the scratch-root filesystem jail and the outbound request guard.

pub mod egress;
pub mod path;

pub use egress::{
    AddressFamily, EgressGuard, Resolver, SystemResolver, ValidatedUrl, blocked_range,
    is_blocked_ip,
};
#[cfg(test)]
pub use egress::StaticResolver;
pub use path::{EntryKind, Intent, ListEntry, ScratchFs, WriteOutcome};
