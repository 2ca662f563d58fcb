//! labwarden reconciliation core
//!
//! Provider-agnostic desired-state reconciliation for a small
//! heterogeneous fleet: describe resources as [`ResourceSpec`]s, diff
//! them against the last observed state, and apply the resulting plan
//! through pluggable provider adapters.
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                 labwarden CLI                   │
//! │           (labwarden plan / apply)              │
//! └──────────────────┬─────────────────────────────┘
//!                    │
//! ┌──────────────────▼─────────────────────────────┐
//! │               labwarden-core                    │
//! │  DesiredState ──► plan() ──► Plan ──► apply()  │
//! │        ▲                                │       │
//! │  ObservedState (state.json)      ExportStore    │
//! └───────┬──────────────────────────┬─────────────┘
//!         │                          │
//! ┌───────▼───────┐          ┌───────▼───────┐
//! │    proxmox    │          │    linode     │
//! │    adapter    │          │    adapter    │
//! └───────────────┘          └───────────────┘
//! ```
//!
//! The core never talks to an API directly; every side effect goes
//! through the [`Provider`] trait, which keeps the whole diff/plan/
//! apply pipeline testable with mock adapters.

pub mod apply;
pub mod error;
pub mod exports;
pub mod plan;
pub mod provider;
pub mod resource;
pub mod state;

// Re-exports
pub use apply::{apply, ApplyOptions, ApplyReport};
pub use error::{ApplyError, ConfigError, PlanError, StateError};
pub use exports::{DuplicateExportError, ExportSnapshot, ExportStore};
pub use plan::{plan, FieldChange, OpKind, Operation, Plan, PlanSummary};
pub use provider::{CreatedResource, Provider, ProviderError, ProviderRegistry};
pub use resource::{
    Attributes, DesiredState, DesiredStateBuilder, GlobalSettings, ResourceKey, ResourceKind,
    ResourceSpec,
};
pub use state::{ObservedState, ResourceRecord, StateLock, StateManager};
