//! Treedelta: binary delta archives between directory trees.
//!
//! The crate provides:
//! - A bsdiff-style byte differ and patcher (`bsdiff`)
//! - Tree scanning, fingerprinting and diff planning (`tree`)
//! - The streaming delta archive container (`archive`)
//! - The create/apply pipeline (`delta`)
//! - An optional CLI (`cli` feature)
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use treedelta::delta::{self, ApplyOptions, CreateOptions};
//!
//! let stats = delta::create_delta(
//!     Path::new("app-1.0"),
//!     Path::new("app-1.1"),
//!     Path::new("update.tdlt"),
//!     &CreateOptions::default(),
//! )
//! .unwrap();
//! println!("archive: {} bytes", stats.archive_size);
//!
//! delta::apply_delta(
//!     Path::new("app-1.0"),
//!     Path::new("update.tdlt"),
//!     Path::new("app-1.1-rebuilt"),
//!     &ApplyOptions::default(),
//!     &mut |fraction: f64| eprintln!("{:.0}%", fraction * 100.0),
//! )
//! .unwrap();
//! ```

pub mod archive;
pub mod bsdiff;
pub mod command;
pub mod delta;
pub mod fsops;
pub mod tree;

#[cfg(feature = "cli")]
pub mod cli;
