//! # Creative Capture
//!
//! Captures ad creatives from an ad-transparency portal and stores each one as
//! a canonical, content-addressed PNG. Every work item is a creative page; the
//! pipeline navigates to it in headless Chrome, works out how the creative is
//! rendered, captures every variant, and records the outcome.
//!
//! ## Pipeline
//!
//! | Stage | Module | What it does |
//! |-------|--------|--------------|
//! | Enumerate | [`manifest`], [`store`] | Work items from a manifest or an [`Enumerator`] |
//! | Queue | [`worker`] | Owner skips, stable sharding, skip-if-done, one browser per worker |
//! | Resolve | [`resolver`] | Ordered DOM templates yield the item's variants |
//! | Capture | [`capture`], [`sampler`] | Direct fetch or settled element screenshot per variant |
//! | Finalize | [`finalize`], [`normalizer`] | Canonical PNG, hashes, optional OCR, upload, asset row |
//!
//! Outcomes are `done`, a terminal page state (policy removal, rate limiting,
//! not found, variation unavailable) or `error`. Errors are retried with
//! exponential backoff; a browser that dies mid-item is relaunched and the
//! item repeated without spending a retry.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use creative_capture::{hamming_distance, normalize};
//!
//! let first = normalize(&std::fs::read("a.png")?, true)?;
//! let second = normalize(&std::fs::read("b.png")?, true)?;
//! println!("{} ({}x{})", first.content_hash, first.width, first.height);
//! println!("distance: {}", hamming_distance(&first.fingerprint, &second.fingerprint));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! # One creative, ids parsed from the URL
//! creative-capture run --url https://adstransparency.google.com/advertiser/AR01/creative/CR02
//!
//! # A manifest, sharded across four tasks, without writing anything
//! creative-capture --shard-index 1 --shard-count 4 --dry-run run --manifest items.jsonl
//!
//! # Canonicalize a local file
//! creative-capture normalize --input raw.png --output canonical.png
//! ```

/// Configuration and settings for the capture pipeline
pub mod config;

/// Error taxonomy and retry classification
pub mod error;

/// Canonical PNG encoding, content hash and perceptual fingerprint
pub mod normalizer;

/// Screenshot sampling until the rendered creative stops changing
pub mod sampler;

/// Browser page abstraction the pipeline is written against
pub mod page;

/// chromiumoxide implementation of the page abstraction
pub mod chrome;

/// Per-worker browser lifecycle and relaunch
pub mod browser;

/// Renderer resolution into capturable variants
pub mod resolver;

/// Click-through URL extraction and normalization
pub mod click;

/// Per-item capture state machine
pub mod capture;

/// Normalize, upload and link a captured variant
pub mod finalize;

/// Item store, blob store and enumerator interfaces
pub mod store;

/// Optional text recognition
pub mod ocr;

/// Direct HTTP fetches of creative bytes
pub mod fetch;

/// Manifest-file work source
pub mod manifest;

/// Work queue, producer and worker pool
pub mod worker;

/// Command-line interface implementation
pub mod cli;

/// Pipeline counters and periodic status summary
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod fakes;


pub use browser::*;
pub use capture::*;
pub use chrome::*;
pub use cli::*;
pub use click::*;
pub use config::*;
pub use error::*;
pub use fetch::*;
pub use finalize::*;
pub use manifest::*;
pub use metrics::*;
pub use normalizer::*;
pub use ocr::*;
pub use page::*;
pub use resolver::*;
pub use sampler::*;
pub use store::*;
pub use utils::*;
pub use worker::*;
