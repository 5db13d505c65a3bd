//! Paged KV cache addressing and attention dispatch.
//!
//! The cache is a fixed pool of fixed-size blocks; each sequence maps its
//! logical token positions onto physical blocks through a block table, and
//! every new token gets a flat slot `block_id * block_size + offset`. A step
//! is described once by a [`StepContext`] (slot mapping, cumulative lengths,
//! position ids), the [`CacheWriter`] scatters the step's K/V rows into
//! place, and the [`AttentionDispatcher`] routes the batch to the prefill or
//! decode kernel in [`tessera_paged_attn`].

mod block_engine;
mod cache_engine;
mod config;
mod dispatcher;
mod error;
mod rotary;
mod sequence;
mod slot_indexer;
mod step;

pub use block_engine::{BlockEngine, BlockId, BlockTable, SeqId};
pub use cache_engine::{CacheEngine, CacheWriter, KVCache};
pub use config::{CacheConfig, ModelConfigLike};
pub use dispatcher::{AttentionBackend, AttentionDispatcher, CpuBackend, StepKind};
pub use error::{Error, Result};
pub use rotary::{RotaryCoordinateCache, RotaryEntry};
pub use sequence::ScheduledSequence;
pub use slot_indexer::{cumulative_seqlens, slot_mapping};
pub use step::{StepContext, StepContextBuilder};
