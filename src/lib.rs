#![doc = include_str!("../README.md")]
#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Gantry is the scheduling core of a laboratory experiment-control master.
//! It accepts submissions describing experiments to run on shared physical
//! hardware, orders them across one or more named pipelines by priority and
//! due date, drives each submission through a fixed lifecycle (prepare → run
//! → analyze → delete), and coordinates cooperative preemption so a
//! newly-arrived higher-priority experiment can temporarily displace a
//! lower-priority one already executing on the same hardware.
//!
//! The [`scheduler`] crate is the entry point: [`scheduler::Scheduler`] owns
//! a set of pipelines, each of which owns its run entries and the three
//! cooperating tasks (prepare, run, analyze) that drive them through the
//! status DAG. Every state change is mirrored onto a [`notifier::Notifier`]
//! so external subscribers (a UI, a persistence layer, an RPC bridge) can
//! maintain an exact copy of the public state without touching the live
//! objects. The [`worker`] crate defines the narrow seam through which the
//! scheduler drives the experiment subprocess itself — construction of a
//! concrete, subprocess-backed `WorkerHandle` is outside this crate's scope.

pub use config;
pub use notifier;
pub use scheduler;
pub use task;
pub use worker;
