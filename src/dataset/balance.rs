use serde::Serialize;

/// Existing per-class image counts on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SplitCounts {
    pub train: usize,
    pub valid: usize,
}

impl SplitCounts {
    pub fn total(&self) -> usize {
        self.train + self.valid
    }
}

/// Train/valid decision for one class's newly produced samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SplitAllocation {
    pub existing: SplitCounts,
    pub n_new: usize,
    pub need_train: usize,
    pub need_valid: usize,
}

/// Place `n_new` samples so the class's overall train share approaches
/// `train_ratio`. The train target is floored; it never moves existing files.
pub fn allocate(existing: SplitCounts, n_new: usize, train_ratio: f64) -> SplitAllocation {
    let total_after = (existing.total() + n_new) as f64;
    let target_train = (total_after * train_ratio + 1e-9).floor() as i64;
    let need_train = (target_train - existing.train as i64).clamp(0, n_new as i64) as usize;

    SplitAllocation {
        existing,
        n_new,
        need_train,
        need_valid: n_new - need_train,
    }
}
