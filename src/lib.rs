#![allow(clippy::multiple_crate_versions)]

//! filetrace-rs: record which files a command and its whole process and
//! thread tree open, attributed to the exact process or thread.
//!
//! The tracer is built on `ptrace(2)`: [`engine::Engine`] runs the
//! attach/wait/resume loop, [`registry::Registry`] keeps the process and
//! thread tree, [`decoder::Decoder`] extracts paths from `open`/`openat`
//! calls and [`oplog::OperationLog`] keeps them in order. Kernel access goes
//! through [`control::Control`] so the loop can be driven without a kernel.
//!
//! See `bin/filetrace.rs` for the command-line front-end.

pub mod control;
pub mod decoder;
pub mod diag;
pub mod engine;
pub mod hwaccess;
pub mod input;
pub mod oplog;
pub mod path;
pub mod registry;
pub mod report;
pub mod trace;
