use super::{LimitAlgorithm, Sample};

/// A simple, fixed concurrency limit.
#[derive(Debug, Clone, Copy)]
pub struct Fixed(usize);
impl Fixed {
    /// A limit which never changes.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0);

        Self(limit)
    }
}

impl LimitAlgorithm for Fixed {
    fn limit(&self) -> usize {
        self.0
    }

    fn update(&self, _sample: Sample) -> usize {
        self.0
    }
}
