//! V-Insight Monitor core: the probe-and-alert control plane for a
//! multi-user website/endpoint monitoring platform (spec §1).
//!
//! This crate is the "hard core" only — scheduler, prober pool, alert
//! evaluator, notification dispatcher, event bus, job runtime, and the
//! repository contracts they're built against. The REST/CRUD surface,
//! authentication, status pages, and persistence engine choice beyond the
//! `repo` traits are all external concerns (spec §1 "Explicitly out of
//! scope").

pub mod config;
pub mod db;
pub mod error;
pub mod eventbus;
pub mod evaluator;
pub mod jobs;
pub mod models;
pub mod notify;
pub mod pool;
pub mod probe;
pub mod repo;

pub use config::Config;
pub use eventbus::EventBus;
pub use jobs::{JobHandles, JobRuntime};
pub use repo::Repos;
