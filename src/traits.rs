//! Domain records and the interfaces the scheduling core depends on.

mod context;
mod cron;
mod escalations;
mod goals;
mod runtime;
mod state_store;

pub use context::*;
pub use cron::*;
pub use escalations::*;
pub use goals::*;
pub use runtime::*;
pub use state_store::*;

/// Import this in modules that call store-trait methods on concrete types.
///
/// `StateStore` is a facade (supertrait) used for trait objects, but Rust still
/// requires the defining trait to be in scope for method-call syntax.
pub mod store_prelude {
    #![allow(unused_imports)]
    pub use super::{
        CronJobStore, DecisionStore, EscalationStore, GoalStore, RunStore, StateStore,
        WorkItemStore,
    };
}
