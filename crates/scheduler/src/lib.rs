#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The scheduling core: pipelines of run entries, the priority/due-date
//! ordering policy, cooperative preemption, the flush gate, and graceful
//! shutdown with in-flight work.
//!
//! A submission enters through [`Scheduler::submit`], is assigned a run
//! identifier, and is driven through `pending → … → deleting` by its
//! pipeline's prepare, run, and analyze tasks, with every transition
//! mirrored onto the [`notifier::Notifier`] passed to [`Scheduler::new`].

mod entry;
mod ordering;
mod pipeline;
mod scheduler;
mod status;

pub use scheduler::{Error, Scheduler};
pub use status::Status;
