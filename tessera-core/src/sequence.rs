/// One scheduled sequence's view for the current step.
///
/// `q_len` counts the new tokens contributed this step; `kv_len` is the total
/// current length including them, so `kv_len - q_len` tokens of history are
/// already in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSequence {
    pub id: usize,
    pub q_len: usize,
    pub kv_len: usize,
}

impl ScheduledSequence {
    pub fn new(id: usize, q_len: usize, kv_len: usize) -> Self {
        Self { id, q_len, kv_len }
    }

    pub fn history_len(&self) -> usize {
        self.kv_len - self.q_len
    }

    /// One new token against existing history.
    pub fn is_decode(&self) -> bool {
        self.q_len == 1 && self.history_len() > 0
    }

    /// No history at all; the causal mask needs no diagonal shift.
    pub fn is_full_prefill(&self) -> bool {
        self.q_len == self.kv_len
    }
}
