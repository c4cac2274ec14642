//! Block caching for the mailstore engine.
//!
//! This crate provides an in-memory cache of clean decoded blocks with:
//! - Fixed capacity configured per session
//! - Clock eviction policy
//! - Copy-out lookups so cached values are never mutated in place

mod cache;
mod frame;
mod replacer;

pub use cache::{BlockCache, CacheStats};
pub use frame::{CacheFrame, FrameId};
pub use replacer::{ClockReplacer, Replacer};
