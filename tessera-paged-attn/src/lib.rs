//! Reference kernels for paged attention over a block-structured KV cache.
//!
//! This crate owns the pieces that touch the physical cache planes directly:
//! the explicit layout descriptor, the in-place K/V fill, the slot gather,
//! unfused CPU attention for the context (prefill) and decode paths, and
//! rotary coordinate computation. The addressing and dispatch logic lives in
//! `tessera-core`; everything here takes a layout parameter and a flat slot
//! mapping and performs no classification of its own.

mod attention;
mod cache;
mod layout;
mod rope;

pub use attention::{context_attention, paged_decode_attention};
pub use cache::{gather_kv, slots_for_prefix, write_kv};
pub use layout::{CacheDims, CacheLayout};
pub use rope::{apply_rotary_pos_emb, cos_sin_for_positions};
