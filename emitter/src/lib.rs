//! The Log Cache emitter.
//!
//! This library supports the `log-cache-emitter` binary found elsewhere in
//! this project. On request over HTTP the emitter pushes a fixed number of
//! synthetic log or gauge envelopes into Log Cache for each caller-supplied
//! source ID, giving a predictable load against the store.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod emit;
pub mod envelope;
pub mod ingress;
pub mod proto;
pub mod sender;
pub mod server;
pub mod signals;
