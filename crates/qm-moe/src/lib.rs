//! `qm-moe` - Mixture-of-experts feed-forward block.
//!
//! Scores a token embedding against a router matrix, keeps the top-k
//! experts and combines their gated feed-forward outputs, using the
//! kernels and parallel primitives from `qm-tensor`.

pub mod activation;
pub mod block;
pub mod config;
pub mod error;

pub use activation::Activation;
pub use block::{MoeBlock, MoeScratch, MoeWeights, ProjectionHook};
pub use config::{Combine, EmbeddingSegment, MoeConfig};
pub use error::{MoeError, Result};
