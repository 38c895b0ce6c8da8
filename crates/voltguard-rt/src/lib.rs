//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the sampling and policy workers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Periodic worker helpers for the VoltGuard runtime.

pub mod scheduling;
pub mod worker;

pub use scheduling::RateLimiter;
pub use worker::{spawn_periodic, WorkerError, WorkerHandle};
