use crate::configuration::types::SuccessThreshold;

use super::Verdict;

/// Maps the number of successful expected nodes to a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerdictPolicy {
    pub threshold: SuccessThreshold,
}

impl VerdictPolicy {
    pub fn new(threshold: SuccessThreshold) -> Self {
        Self { threshold }
    }

    pub fn evaluate(&self, expected: usize, succeeded: usize) -> Verdict {
        if succeeded == 0 {
            return Verdict::Failed;
        }
        if succeeded >= expected {
            return Verdict::Complete;
        }
        match self.threshold {
            SuccessThreshold::All => Verdict::Failed,
            SuccessThreshold::AtLeast(n) if succeeded >= n.max(1) => Verdict::Degraded,
            SuccessThreshold::AtLeast(_) => Verdict::Failed,
        }
    }
}
