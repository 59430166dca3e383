//! Per-page generation-state detection for tabwatch.
//!
//! A page feed supplies two signals: a boolean presence signal ("a stop
//! control or streaming indicator is currently visible") and page
//! visibility. [`machine::Detector`] reduces both, plus forced-status
//! corrections from the daemon, into idle/generating/completed transitions
//! with the debouncing each service needs. [`intercept`] classifies
//! page-side request URLs so the same transitions can also be driven from
//! the network layer.
//!
//! The machine never performs I/O; it emits [`machine::Output`] values and
//! leaves delivery to the embedding (see the `tabwatch-agent` crate).

pub mod intercept;
pub mod machine;
pub mod profile;

pub use machine::{Detector, Output};
pub use profile::{service_for_hostname, ServiceProfile};
