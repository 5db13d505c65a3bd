use serde::{Deserialize, Serialize};
use tessera_paged_attn::CacheLayout;

/// The model geometry the cache engine needs. Kept as a trait so pipelines
/// can hand over their own config structs.
pub trait ModelConfigLike {
    fn num_layers(&self) -> usize;
    fn num_attention_heads(&self) -> usize;
    fn num_kv_heads(&self) -> usize;
    fn head_dim(&self) -> usize;
}

/// Physical cache pool configuration, constant for a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub block_size: usize,
    pub num_blocks: usize,
    pub layout: CacheLayout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_serde_roundtrip() {
        let config = CacheConfig {
            block_size: 16,
            num_blocks: 1024,
            layout: CacheLayout::HeadMajor,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: CacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
