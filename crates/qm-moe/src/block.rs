use qm_tensor::math::{select_top_k, softmax};
use qm_tensor::parallel::{try_parallel_chunks_mut, try_parallel_chunks_mut_batch};
use qm_tensor::{ComputeBackend, DType, Shape, Tensor, TensorPool, TensorView};
use tracing::{debug, trace};

use crate::config::{Combine, MoeConfig};
use crate::error::{MoeError, Result};

/// Observer called with the gate-projection and up-projection buffers of
/// each selected expert, before the activation is applied.
pub type ProjectionHook<'h> = &'h mut dyn FnMut(&Tensor, &Tensor);

/// Weights of a mixture-of-experts block.
///
/// - `gate`: router weights, shape [n_experts, embedding_length]
/// - `expert_gate`, `expert_up`: per expert, shape [hidden_length, embedding_length]
/// - `expert_down`: per expert, shape [embedding_length, hidden_length]
#[derive(Debug, Clone)]
pub struct MoeWeights {
    pub gate: Tensor,
    pub expert_gate: Vec<Tensor>,
    pub expert_up: Vec<Tensor>,
    pub expert_down: Vec<Tensor>,
}

/// Caller-owned scratch state for one forward call at a time.
///
/// Concurrent forward calls on the same block each need their own scratch.
#[derive(Debug)]
pub struct MoeScratch {
    scores: Tensor,
    probs: Vec<f32>,
    selected: Vec<usize>,
    gate: Tensor,
    up: Tensor,
    expert_out: Tensor,
}

impl MoeScratch {
    pub fn new(config: &MoeConfig) -> Result<Self> {
        Ok(MoeScratch {
            scores: f32_buffer(config.n_experts)?,
            probs: vec![0.0; config.n_experts],
            selected: vec![0; config.n_experts_per_token],
            gate: f32_buffer(config.hidden_length)?,
            up: f32_buffer(config.hidden_length)?,
            expert_out: f32_buffer(config.embedding_length)?,
        })
    }

    /// Experts chosen by the last forward call, in selection order.
    pub fn selected(&self) -> &[usize] {
        &self.selected
    }

    /// Router probabilities from the last forward call.
    pub fn probabilities(&self) -> &[f32] {
        &self.probs
    }

    fn fits(&self, config: &MoeConfig) -> bool {
        self.probs.len() == config.n_experts
            && self.selected.len() == config.n_experts_per_token
            && self.gate.numel() == config.hidden_length
            && self.up.numel() == config.hidden_length
            && self.expert_out.numel() == config.embedding_length
    }
}

fn f32_buffer(len: usize) -> Result<Tensor> {
    Ok(Tensor::zeros(DType::F32, Shape::new(vec![len]))?)
}

/// The three per-expert working buffers, borrowed from scratch or a pool.
struct ExpertBuffers<'s> {
    gate: &'s mut Tensor,
    up: &'s mut Tensor,
    expert_out: &'s mut Tensor,
}

/// A mixture-of-experts feed-forward block.
#[derive(Debug)]
pub struct MoeBlock {
    config: MoeConfig,
    weights: MoeWeights,
}

impl MoeBlock {
    /// Validate the config and every weight shape against it.
    pub fn new(config: MoeConfig, weights: MoeWeights) -> Result<Self> {
        config.validate()?;
        let (e, d, h) = (
            config.n_experts,
            config.embedding_length,
            config.hidden_length,
        );

        check_shape("gate", &weights.gate, &[e, d])?;
        for (name, list, dims) in [
            ("expert_gate", &weights.expert_gate, [h, d]),
            ("expert_up", &weights.expert_up, [h, d]),
            ("expert_down", &weights.expert_down, [d, h]),
        ] {
            if list.len() != e {
                return Err(MoeError::WeightShape {
                    name: name.to_string(),
                    expected: vec![e],
                    got: vec![list.len()],
                });
            }
            for (i, t) in list.iter().enumerate() {
                check_shape(&format!("{}[{}]", name, i), t, &dims)?;
            }
        }

        debug!(
            n_experts = e,
            k = config.n_experts_per_token,
            embedding = d,
            hidden = h,
            gate_dtype = %weights.gate.dtype(),
            "built MOE block"
        );
        Ok(MoeBlock { config, weights })
    }

    pub fn config(&self) -> &MoeConfig {
        &self.config
    }

    pub fn weights(&self) -> &MoeWeights {
        &self.weights
    }

    /// Router logits for every expert over the configured embedding segment.
    ///
    /// Multi-segment deployments sum these partial scores across segments
    /// before calling [`MoeBlock::route`].
    pub fn score_experts(
        &self,
        input: &TensorView<'_>,
        scores: &mut Tensor,
        backend: &dyn ComputeBackend,
    ) -> Result<()> {
        self.check_input(input)?;
        check_shape("scores", scores, &[self.config.n_experts])?;
        let seg = self.config.segment;
        let gate = self.weights.gate.view();
        try_parallel_chunks_mut(scores.view_mut()?, |chunk_start, dest| {
            backend.dot_product_chunk(
                dest,
                input,
                &gate,
                seg.start,
                seg.start,
                seg.length,
                chunk_start,
            )
        })?;
        Ok(())
    }

    /// Turn logits into probabilities in place and select the top experts.
    ///
    /// `selected.len()` is the number of experts to pick. The selection order
    /// follows the replacement scan of [`select_top_k`] and is not sorted.
    pub fn route(&self, scores: &mut [f32], selected: &mut [usize]) -> Result<()> {
        if scores.len() != self.config.n_experts {
            return Err(MoeError::WeightShape {
                name: "scores".to_string(),
                expected: vec![self.config.n_experts],
                got: vec![scores.len()],
            });
        }
        softmax(scores);
        select_top_k(scores, selected)?;
        Ok(())
    }

    /// Full forward pass for one token embedding.
    ///
    /// Returns a new embedding-length F32 tensor. Only the configured
    /// segment of the output is written; the rest stays zero.
    pub fn forward(
        &self,
        input: &TensorView<'_>,
        scratch: &mut MoeScratch,
        backend: &dyn ComputeBackend,
        hook: Option<ProjectionHook<'_>>,
    ) -> Result<Tensor> {
        self.check_scratch(scratch)?;
        self.score_experts(input, &mut scratch.scores, backend)?;
        scratch.scores.view().decode_into(0, &mut scratch.probs)?;
        self.route(&mut scratch.probs, &mut scratch.selected)?;
        debug!(
            selected = ?scratch.selected,
            segment_start = self.config.segment.start,
            segment_length = self.config.segment.length,
            "MOE forward"
        );

        let buffers = ExpertBuffers {
            gate: &mut scratch.gate,
            up: &mut scratch.up,
            expert_out: &mut scratch.expert_out,
        };
        self.combine(input, &scratch.selected, &scratch.probs, buffers, backend, hook)
    }

    /// Run the selected experts and combine their outputs.
    ///
    /// `probs` holds one router probability per expert; it is only read
    /// under [`Combine::GateWeighted`].
    pub fn forward_routed(
        &self,
        input: &TensorView<'_>,
        selected: &[usize],
        probs: &[f32],
        scratch: &mut MoeScratch,
        backend: &dyn ComputeBackend,
        hook: Option<ProjectionHook<'_>>,
    ) -> Result<Tensor> {
        self.check_scratch(scratch)?;
        self.check_input(input)?;
        self.check_routing(selected, probs)?;
        let buffers = ExpertBuffers {
            gate: &mut scratch.gate,
            up: &mut scratch.up,
            expert_out: &mut scratch.expert_out,
        };
        self.combine(input, selected, probs, buffers, backend, hook)
    }

    /// [`MoeBlock::forward`] with working buffers taken from `pool`.
    ///
    /// Buffers go back to the pool when this returns, on success or error.
    pub fn forward_pooled(
        &self,
        input: &TensorView<'_>,
        pool: &TensorPool,
        backend: &dyn ComputeBackend,
        hook: Option<ProjectionHook<'_>>,
    ) -> Result<Tensor> {
        let c = &self.config;
        let mut scores = pool.acquire(DType::F32, Shape::new(vec![c.n_experts]))?;
        let mut gate = pool.acquire(DType::F32, Shape::new(vec![c.hidden_length]))?;
        let mut up = pool.acquire(DType::F32, Shape::new(vec![c.hidden_length]))?;
        let mut expert_out = pool.acquire(DType::F32, Shape::new(vec![c.embedding_length]))?;

        self.score_experts(input, &mut scores, backend)?;
        let mut probs = scores.to_f32_vec();
        let mut selected = vec![0usize; c.n_experts_per_token];
        self.route(&mut probs, &mut selected)?;
        debug!(selected = ?selected, "MOE forward (pooled)");

        let buffers = ExpertBuffers {
            gate: &mut gate,
            up: &mut up,
            expert_out: &mut expert_out,
        };
        self.combine(input, &selected, &probs, buffers, backend, hook)
    }

    fn combine(
        &self,
        input: &TensorView<'_>,
        selected: &[usize],
        probs: &[f32],
        buffers: ExpertBuffers<'_>,
        backend: &dyn ComputeBackend,
        mut hook: Option<ProjectionHook<'_>>,
    ) -> Result<Tensor> {
        let ExpertBuffers {
            gate,
            up,
            expert_out,
        } = buffers;
        let seg = self.config.segment;
        let hidden = self.config.hidden_length;
        let activation = self.config.activation;
        let mut result = f32_buffer(self.config.embedding_length)?;

        for (n, &expert) in selected.iter().enumerate() {
            trace!(expert, position = n, "running expert");
            let projections = [
                self.weights.expert_gate[expert].view(),
                self.weights.expert_up[expert].view(),
            ];
            let down = self.weights.expert_down[expert].view();

            try_parallel_chunks_mut_batch(
                vec![gate.view_mut()?, up.view_mut()?],
                |chunk_start, dests| {
                    backend.dot_product_batch_chunk(
                        dests,
                        input,
                        &projections,
                        seg.start,
                        seg.length,
                        chunk_start,
                    )
                },
            )?;

            if let Some(hook) = hook.as_deref_mut() {
                hook(&*gate, &*up);
            }

            try_parallel_chunks_mut(gate.view_mut()?, |_, chunk| {
                let mut values = vec![0.0f32; chunk.numel()];
                chunk.decode_into(0, &mut values)?;
                activation.apply(&mut values);
                chunk.write_from(0, &values)
            })?;
            backend.maccumulate(&mut gate.view_mut()?, &up.view(), 0, hidden)?;

            let activated = gate.view();
            let (_, rest) = expert_out.view_mut()?.split_at_mut(seg.start)?;
            let (segment, _) = rest.split_at_mut(seg.length)?;
            try_parallel_chunks_mut(segment, |chunk_start, dest| {
                backend.dot_product_chunk(
                    dest,
                    &activated,
                    &down,
                    0,
                    0,
                    hidden,
                    seg.start + chunk_start,
                )
            })?;

            if self.config.combine == Combine::GateWeighted {
                backend.scale(
                    probs[expert],
                    &mut expert_out.view_mut()?,
                    seg.start,
                    seg.length,
                )?;
            }

            if n == 0 {
                result.copy_range(&expert_out.view(), seg.start, seg.start, seg.length)?;
            } else {
                backend.accumulate(
                    &mut result.view_mut()?,
                    &expert_out.view(),
                    seg.start,
                    seg.length,
                )?;
            }
        }
        Ok(result)
    }

    fn check_input(&self, input: &TensorView<'_>) -> Result<()> {
        if input.numel() != self.config.embedding_length {
            return Err(MoeError::WeightShape {
                name: "input".to_string(),
                expected: vec![self.config.embedding_length],
                got: input.shape().dims().to_vec(),
            });
        }
        Ok(())
    }

    fn check_scratch(&self, scratch: &MoeScratch) -> Result<()> {
        if !scratch.fits(&self.config) {
            return Err(MoeError::InvalidConfig(
                "scratch buffers were sized for a different config".to_string(),
            ));
        }
        Ok(())
    }

    fn check_routing(&self, selected: &[usize], probs: &[f32]) -> Result<()> {
        if probs.len() != self.config.n_experts {
            return Err(MoeError::WeightShape {
                name: "probs".to_string(),
                expected: vec![self.config.n_experts],
                got: vec![probs.len()],
            });
        }
        if let Some(&bad) = selected.iter().find(|&&e| e >= self.config.n_experts) {
            return Err(MoeError::InvalidConfig(format!(
                "selected expert {} out of range for {} experts",
                bad, self.config.n_experts
            )));
        }
        Ok(())
    }
}

fn check_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.shape().dims() != expected {
        return Err(MoeError::WeightShape {
            name: name.to_string(),
            expected: expected.to_vec(),
            got: tensor.shape().dims().to_vec(),
        });
    }
    Ok(())
}
