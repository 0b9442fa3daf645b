use crate::activation::Activation;
use crate::error::{MoeError, Result};

/// The part of the embedding dimension this block sums over.
///
/// Sharded deployments give each worker its own segment; a single worker
/// covers the whole embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingSegment {
    /// Inclusive start offset.
    pub start: usize,
    pub length: usize,
}

impl EmbeddingSegment {
    pub fn new(start: usize, length: usize) -> Self {
        EmbeddingSegment { start, length }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> usize {
        self.start + self.length
    }
}

/// How selected experts' contributions are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combine {
    /// Plain sum; every selected expert counts equally.
    #[default]
    Uniform,
    /// Each contribution is scaled by the expert's softmax probability.
    GateWeighted,
}

/// Hyperparameters of a mixture-of-experts feed-forward block.
#[derive(Debug, Clone, PartialEq)]
pub struct MoeConfig {
    /// Total number of experts.
    pub n_experts: usize,
    /// Experts selected per token (k).
    pub n_experts_per_token: usize,
    /// Embedding dimension.
    pub embedding_length: usize,
    /// Per-expert intermediate dimension.
    pub hidden_length: usize,
    pub segment: EmbeddingSegment,
    pub activation: Activation,
    pub combine: Combine,
}

impl MoeConfig {
    /// A config covering the full embedding with SiLU and uniform combination.
    pub fn new(
        n_experts: usize,
        n_experts_per_token: usize,
        embedding_length: usize,
        hidden_length: usize,
    ) -> Self {
        MoeConfig {
            n_experts,
            n_experts_per_token,
            embedding_length,
            hidden_length,
            segment: EmbeddingSegment::new(0, embedding_length),
            activation: Activation::default(),
            combine: Combine::default(),
        }
    }

    pub fn with_segment(mut self, start: usize, length: usize) -> Self {
        self.segment = EmbeddingSegment::new(start, length);
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_combine(mut self, combine: Combine) -> Self {
        self.combine = combine;
        self
    }

    /// Check the invariants the forward pass relies on.
    pub fn validate(&self) -> Result<()> {
        if self.n_experts == 0 {
            return Err(MoeError::InvalidConfig("n_experts must be > 0".to_string()));
        }
        if self.n_experts_per_token == 0 || self.n_experts_per_token > self.n_experts {
            return Err(MoeError::InvalidConfig(format!(
                "n_experts_per_token={} must be in 1..={}",
                self.n_experts_per_token, self.n_experts
            )));
        }
        if self.embedding_length == 0 || self.hidden_length == 0 {
            return Err(MoeError::InvalidConfig(format!(
                "embedding_length={} and hidden_length={} must be > 0",
                self.embedding_length, self.hidden_length
            )));
        }
        if self.segment.length == 0 || self.segment.end() > self.embedding_length {
            return Err(MoeError::InvalidConfig(format!(
                "segment {}..{} is not inside embedding of length {}",
                self.segment.start,
                self.segment.end(),
                self.embedding_length
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_full_embedding() {
        let c = MoeConfig::new(8, 2, 64, 128);
        assert_eq!(c.segment, EmbeddingSegment::new(0, 64));
        assert_eq!(c.activation, Activation::Silu);
        assert_eq!(c.combine, Combine::Uniform);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let c = MoeConfig::new(8, 2, 64, 128)
            .with_segment(32, 32)
            .with_activation(Activation::Gelu)
            .with_combine(Combine::GateWeighted);
        assert_eq!(c.segment.end(), 64);
        assert_eq!(c.activation, Activation::Gelu);
        assert_eq!(c.combine, Combine::GateWeighted);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let bad = [
            MoeConfig::new(0, 0, 8, 8),
            MoeConfig::new(4, 0, 8, 8),
            MoeConfig::new(4, 5, 8, 8),
            MoeConfig::new(4, 2, 0, 8),
            MoeConfig::new(4, 2, 8, 0),
            MoeConfig::new(4, 2, 8, 8).with_segment(4, 8),
            MoeConfig::new(4, 2, 8, 8).with_segment(0, 0),
        ];
        for c in bad {
            assert!(
                matches!(c.validate(), Err(MoeError::InvalidConfig(_))),
                "{:?} should be invalid",
                c
            );
        }
    }
}
