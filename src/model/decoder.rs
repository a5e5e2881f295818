//! Forward pass of the Llama-layout decoder.

use candle_core::{DType, Device, Tensor, D};

use super::{CausalLm, EMBED_TOKENS};
use crate::adapters::LoraAdapters;
use crate::error::Result;

/// Per-call switches for [`CausalLm::forward`].
#[derive(Clone, Copy, Default)]
pub struct ForwardOptions<'a> {
    /// Adapters added on top of the targeted projections.
    pub adapters: Option<&'a LoraAdapters>,
    /// NEFTune noise alpha applied to the input embeddings.
    pub neftune_alpha: Option<f64>,
}

impl CausalLm {
    /// Compute next-token logits (`batch x seq x vocab`) for `input_ids`
    /// (`batch x seq`, u32).
    ///
    /// # Errors
    ///
    /// Returns an error if a weight is missing or shapes disagree.
    pub fn forward(&self, input_ids: &Tensor, options: ForwardOptions<'_>) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        let arch = self.arch();
        let hidden = arch.hidden_size;

        let embed = self.weight(EMBED_TOKENS)?;
        let mut xs = embed
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((batch, seq_len, hidden))?;

        if let Some(alpha) = options.neftune_alpha {
            let magnitude = alpha / ((seq_len * hidden) as f64).sqrt();
            let noise = Tensor::rand(-magnitude, magnitude, xs.dims(), xs.device())?
                .to_dtype(xs.dtype())?;
            xs = (xs + noise)?;
        }

        let (cos, sin) = rotary_tables(
            seq_len,
            arch.head_dim(),
            arch.rope_theta,
            xs.device(),
            xs.dtype(),
        )?;
        let mask = causal_mask(seq_len, xs.device())?;

        for layer in 0..arch.num_hidden_layers {
            let prefix = format!("model.layers.{layer}");

            let residual = xs.clone();
            let normed = self.rms_norm(&xs, &format!("{prefix}.input_layernorm.weight"))?;
            let attn = self.attention(&normed, &prefix, &cos, &sin, &mask, options)?;
            xs = (residual + attn)?;

            let residual = xs.clone();
            let normed =
                self.rms_norm(&xs, &format!("{prefix}.post_attention_layernorm.weight"))?;
            let mlp = self.mlp(&normed, &prefix, options)?;
            xs = (residual + mlp)?;
        }

        let xs = self.rms_norm(&xs, "model.norm.weight")?;
        let lm_head = self.lm_head_weight()?;
        Ok(xs.broadcast_matmul(&lm_head.t()?)?)
    }

    fn linear(&self, xs: &Tensor, name: &str, options: ForwardOptions<'_>) -> Result<Tensor> {
        let weight = self.weight(name)?;
        let mut out = xs.broadcast_matmul(&weight.t()?)?;

        if let Some(bias) = self.parameter(&name.replace(".weight", ".bias")) {
            out = out.broadcast_add(&bias.tensor(self.device(), self.dtype())?)?;
        }
        if let Some(adapter) = options.adapters.and_then(|adapters| adapters.get(name)) {
            out = (out + adapter.delta(xs)?)?;
        }
        Ok(out)
    }

    fn rms_norm(&self, xs: &Tensor, name: &str) -> Result<Tensor> {
        let weight = self.weight(name)?;
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = xs.broadcast_div(&(variance + self.arch().rms_norm_eps)?.sqrt()?)?;
        Ok(normed.to_dtype(dtype)?.broadcast_mul(&weight)?)
    }

    fn attention(
        &self,
        xs: &Tensor,
        prefix: &str,
        cos: &Tensor,
        sin: &Tensor,
        mask: &Tensor,
        options: ForwardOptions<'_>,
    ) -> Result<Tensor> {
        let arch = self.arch();
        let (batch, seq_len, _) = xs.dims3()?;
        let heads = arch.num_attention_heads;
        let kv_heads = arch.kv_heads();
        let head_dim = arch.head_dim();

        let split_heads = |t: Tensor, n: usize| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, n, head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split_heads(
            self.linear(xs, &format!("{prefix}.self_attn.q_proj.weight"), options)?,
            heads,
        )?;
        let k = split_heads(
            self.linear(xs, &format!("{prefix}.self_attn.k_proj.weight"), options)?,
            kv_heads,
        )?;
        let v = split_heads(
            self.linear(xs, &format!("{prefix}.self_attn.v_proj.weight"), options)?,
            kv_heads,
        )?;

        let q = apply_rotary(&q, cos, sin)?;
        let k = apply_rotary(&k, cos, sin)?;
        let k = repeat_kv(k, heads / kv_heads)?;
        let v = repeat_kv(v, heads / kv_heads)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = (q.to_dtype(DType::F32)?.matmul(&k.to_dtype(DType::F32)?.t()?)? * scale)?
            .broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(v.dtype())?;
        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, heads * head_dim))?;

        self.linear(&out, &format!("{prefix}.self_attn.o_proj.weight"), options)
    }

    fn mlp(&self, xs: &Tensor, prefix: &str, options: ForwardOptions<'_>) -> Result<Tensor> {
        let gate = self
            .linear(xs, &format!("{prefix}.mlp.gate_proj.weight"), options)?
            .silu()?;
        let up = self.linear(xs, &format!("{prefix}.mlp.up_proj.weight"), options)?;
        self.linear(&(gate * up)?, &format!("{prefix}.mlp.down_proj.weight"), options)
    }
}

/// Cosine and sine tables (`seq x head_dim`) in the rotate-half convention.
fn rotary_tables(
    seq_len: usize,
    head_dim: usize,
    theta: f64,
    device: &Device,
    dtype: DType,
) -> Result<(Tensor, Tensor)> {
    let inv_freq: Vec<f32> = (0..head_dim)
        .step_by(2)
        .map(|i| (1.0 / theta.powf(i as f64 / head_dim as f64)) as f32)
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, head_dim / 2), device)?;
    let positions = Tensor::arange(0u32, seq_len as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((seq_len, 1))?;
    let freqs = positions.broadcast_mul(&inv_freq)?;
    let freqs = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
    Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
}

fn apply_rotary(xs: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let half = xs.dim(D::Minus1)? / 2;
    let x1 = xs.narrow(D::Minus1, 0, half)?;
    let x2 = xs.narrow(D::Minus1, half, half)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
    Ok((xs.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?)?)
}

fn repeat_kv(xs: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(xs);
    }
    let (batch, kv_heads, seq_len, head_dim) = xs.dims4()?;
    Ok(Tensor::cat(&vec![&xs; n_rep], 2)?.reshape((batch, kv_heads * n_rep, seq_len, head_dim))?)
}

/// Additive mask (`seq x seq`): 0 on and below the diagonal, -inf above.
fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(mask, (seq_len, seq_len), device)?)
}
