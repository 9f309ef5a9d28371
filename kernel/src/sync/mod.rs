//! Synchronization primitives.
//!
//! Mutable containers use `spin` locks; read-mostly structures (the VFS
//! node graph, the process map, handle lookups) are protected by the
//! two-generation RCU domain in [`rcu`], with [`rcu_ptr`] providing the
//! shared/weak pointer types whose destruction is deferred through it.

pub mod rcu;
pub mod rcu_ptr;

pub use rcu::{RcuDomain, RcuGuard, RcuObject};
pub use rcu_ptr::{RcuShared, RcuWeak};

/// The domain backing the VFS node graph, the process map, and handle
/// lookups.
static KERNEL_DOMAIN: RcuDomain = RcuDomain::new();

pub fn kernel_domain() -> &'static RcuDomain {
    &KERNEL_DOMAIN
}
