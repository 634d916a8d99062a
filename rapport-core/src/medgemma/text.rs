//! Gemma 3 text decoder with a KV cache.
//!
//! Takes input embeddings rather than token ids so image features can be
//! spliced into the prompt before the first forward pass.

use std::ops::Range;
use std::sync::Arc;

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{linear_b, Embedding, Linear, VarBuilder};
use candle_transformers::utils::repeat_kv;

use super::config::TextConfig;

/// Gemma flavour of RMS norm: the learned weight is an offset from one.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = (vb.get(dim, "weight")?.to_dtype(DType::F32)? + 1.0)?;
        Ok(Self { weight, eps })
    }

    #[cfg(test)]
    pub fn from_weight(weight: Tensor, eps: f64) -> Result<Self> {
        Ok(Self {
            weight: (weight.to_dtype(DType::F32)? + 1.0)?,
            eps,
        })
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let xs = xs.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        xs.broadcast_mul(&self.weight)?.to_dtype(dtype)
    }
}

#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    /// `scaling` divides the inverse frequencies (linear position scaling).
    pub fn new(
        dtype: DType,
        head_dim: usize,
        base: f64,
        scaling: f64,
        max_seq_len: usize,
        dev: &Device,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| (1f64 / base.powf(i as f64 / head_dim as f64) / scaling) as f32)
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), dev)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, dev)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        let cos = self.cos.narrow(0, offset, seq_len)?;
        let sin = self.sin.narrow(0, offset, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn new(cfg: &TextConfig, vb: VarBuilder) -> Result<Self> {
        let (h, i) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(Self {
            gate_proj: linear_b(h, i, false, vb.pp("gate_proj"))?,
            up_proj: linear_b(h, i, false, vb.pp("up_proj"))?,
            down_proj: linear_b(i, h, false, vb.pp("down_proj"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(xs)?.gelu()?;
        let up = self.up_proj.forward(xs)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
    sliding_window: Option<usize>,
    softcap: Option<f64>,
    rotary: Arc<RotaryEmbedding>,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn new(
        cfg: &TextConfig,
        sliding_window: Option<usize>,
        rotary: Arc<RotaryEmbedding>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (h, hd) = (cfg.hidden_size, cfg.head_dim);
        let (nh, nkv) = (cfg.num_attention_heads, cfg.num_key_value_heads);
        let bias = cfg.attention_bias;
        Ok(Self {
            q_proj: linear_b(h, nh * hd, bias, vb.pp("q_proj"))?,
            k_proj: linear_b(h, nkv * hd, bias, vb.pp("k_proj"))?,
            v_proj: linear_b(h, nkv * hd, bias, vb.pp("v_proj"))?,
            o_proj: linear_b(nh * hd, h, bias, vb.pp("o_proj"))?,
            q_norm: RmsNorm::new(hd, cfg.rms_norm_eps, vb.pp("q_norm"))?,
            k_norm: RmsNorm::new(hd, cfg.rms_norm_eps, vb.pp("k_norm"))?,
            num_heads: nh,
            num_kv_heads: nkv,
            head_dim: hd,
            scale: 1f64 / cfg.query_pre_attn_scalar.sqrt(),
            sliding_window,
            softcap: cfg.attn_logit_softcapping,
            rotary,
            kv_cache: None,
        })
    }

    fn forward(&mut self, xs: &Tensor, mask: Option<&Tensor>, offset: usize) -> Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        let dtype = xs.dtype();

        let q = self
            .q_proj
            .forward(xs)?
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(xs)?
            .reshape((b, t, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(xs)?
            .reshape((b, t, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = self.q_norm.forward(&q)?;
        let k = self.k_norm.forward(&k)?;
        let (q, k) = self.rotary.apply(&q, &k, offset)?;

        let (k, v) = match &self.kv_cache {
            None => (k, v),
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?,
                Tensor::cat(&[prev_v, &v], 2)?,
            ),
        };
        self.kv_cache = Some((k.clone(), v.clone()));

        // A single decode step on a local layer sees only the last window.
        let (k, v) = match self.sliding_window {
            Some(window) if t == 1 && k.dim(2)? > window => {
                let kv_len = k.dim(2)?;
                (
                    k.narrow(2, kv_len - window, window)?,
                    v.narrow(2, kv_len - window, window)?,
                )
            }
            _ => (k, v),
        };

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let q = (q * self.scale)?;
        let mut att = q.matmul(&k.t()?)?.to_dtype(DType::F32)?;
        if let Some(cap) = self.softcap {
            att = ((att / cap)?.tanh()? * cap)?;
        }
        if let Some(mask) = mask {
            att = att.broadcast_add(mask)?;
        }
        let att = candle_nn::ops::softmax_last_dim(&att)?.to_dtype(dtype)?;

        att.matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))?
            .apply(&self.o_proj)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
    pre_feedforward_layernorm: RmsNorm,
    post_feedforward_layernorm: RmsNorm,
    is_sliding: bool,
}

impl DecoderLayer {
    fn new(
        cfg: &TextConfig,
        is_sliding: bool,
        rotary: Arc<RotaryEmbedding>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let window = is_sliding.then_some(cfg.sliding_window);
        let (h, eps) = (cfg.hidden_size, cfg.rms_norm_eps);
        Ok(Self {
            self_attn: Attention::new(cfg, window, rotary, vb.pp("self_attn"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            input_layernorm: RmsNorm::new(h, eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: RmsNorm::new(h, eps, vb.pp("post_attention_layernorm"))?,
            pre_feedforward_layernorm: RmsNorm::new(h, eps, vb.pp("pre_feedforward_layernorm"))?,
            post_feedforward_layernorm: RmsNorm::new(
                h,
                eps,
                vb.pp("post_feedforward_layernorm"),
            )?,
            is_sliding,
        })
    }

    fn forward(&mut self, xs: &Tensor, mask: Option<&Tensor>, offset: usize) -> Result<Tensor> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = self.self_attn.forward(&xs, mask, offset)?;
        let xs = (self.post_attention_layernorm.forward(&xs)? + residual)?;
        let residual = &xs;
        let ys = self.pre_feedforward_layernorm.forward(&xs)?;
        let ys = self.mlp.forward(&ys)?;
        self.post_feedforward_layernorm.forward(&ys)? + residual
    }
}

pub struct TextModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    embed_scale: f64,
    sliding_window: usize,
    final_logit_softcapping: Option<f64>,
    device: Device,
}

impl TextModel {
    pub fn new(cfg: &TextConfig, max_seq_len: usize, vb: VarBuilder) -> Result<Self> {
        let embed_tokens =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;
        let global_rotary = Arc::new(RotaryEmbedding::new(
            vb.dtype(),
            cfg.head_dim,
            cfg.rope_theta,
            cfg.rope_scaling_factor(),
            max_seq_len,
            vb.device(),
        )?);
        let local_rotary = Arc::new(RotaryEmbedding::new(
            vb.dtype(),
            cfg.head_dim,
            cfg.rope_local_base_freq,
            1.0,
            max_seq_len,
            vb.device(),
        )?);

        let vb_l = vb.pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|idx| {
                let is_sliding = cfg.is_sliding(idx);
                let rotary = if is_sliding {
                    local_rotary.clone()
                } else {
                    global_rotary.clone()
                };
                DecoderLayer::new(cfg, is_sliding, rotary, vb_l.pp(idx))
            })
            .collect::<Result<Vec<_>>>()?;

        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        let lm_head = Linear::new(embed_tokens.embeddings().clone(), None);
        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            embed_scale: (cfg.hidden_size as f64).sqrt(),
            sliding_window: cfg.sliding_window,
            final_logit_softcapping: cfg.final_logit_softcapping,
            device: vb.device().clone(),
        })
    }

    /// Scaled token embeddings, shape `(b, t, hidden)`.
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(input_ids)? * self.embed_scale
    }

    /// Runs `embeds` (positions starting at `offset`) through the decoder and
    /// returns logits for the last position, shape `(b, vocab)`.
    ///
    /// Positions inside one of `bidirectional` attend to each other regardless
    /// of order.
    pub fn forward_embeds(
        &mut self,
        embeds: &Tensor,
        offset: usize,
        bidirectional: &[Range<usize>],
    ) -> Result<Tensor> {
        let (_b, t, _) = embeds.dims3()?;
        let (global_mask, local_mask) = if t <= 1 {
            (None, None)
        } else {
            let global = attention_mask(t, offset, None, bidirectional);
            let local = attention_mask(t, offset, Some(self.sliding_window), bidirectional);
            let shape = (t, t + offset);
            (
                Some(Tensor::from_vec(global, shape, &self.device)?),
                Some(Tensor::from_vec(local, shape, &self.device)?),
            )
        };

        let mut xs = embeds.clone();
        for layer in self.layers.iter_mut() {
            let mask = if layer.is_sliding {
                local_mask.as_ref()
            } else {
                global_mask.as_ref()
            };
            xs = layer.forward(&xs, mask, offset)?;
        }

        let xs = xs.narrow(1, t - 1, 1)?;
        let logits = self.lm_head.forward(&self.norm.forward(&xs)?)?;
        let logits = match self.final_logit_softcapping {
            Some(cap) => ((logits / cap)?.tanh()? * cap)?,
            None => logits,
        };
        logits.squeeze(1)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.self_attn.kv_cache = None;
        }
    }
}

/// Additive attention mask of shape `(t, offset + t)` in row-major order.
///
/// Query `i` (absolute position `offset + i`) may see key `j` when `j` is not
/// in its future and, for local layers, lies within the window. Keys in the
/// same bidirectional span as the query are always visible.
pub fn attention_mask(
    t: usize,
    offset: usize,
    window: Option<usize>,
    bidirectional: &[Range<usize>],
) -> Vec<f32> {
    let kv_len = offset + t;
    let span_of = |pos: usize| bidirectional.iter().position(|r| r.contains(&pos));
    let mut mask = Vec::with_capacity(t * kv_len);
    for i in 0..t {
        let qi = offset + i;
        let q_span = span_of(qi);
        for j in 0..kv_len {
            let causal = j <= qi && window.map_or(true, |w| qi - j < w);
            let same_span = q_span.is_some() && q_span == span_of(j);
            mask.push(if causal || same_span {
                0.
            } else {
                f32::NEG_INFINITY
            });
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visible(mask: &[f32], kv_len: usize, i: usize) -> Vec<usize> {
        (0..kv_len)
            .filter(|&j| mask[i * kv_len + j] == 0.)
            .collect()
    }

    #[test]
    fn causal_mask_hides_the_future() {
        let mask = attention_mask(3, 0, None, &[]);
        assert_eq!(visible(&mask, 3, 0), vec![0]);
        assert_eq!(visible(&mask, 3, 2), vec![0, 1, 2]);
    }

    #[test]
    fn sliding_window_hides_the_distant_past() {
        let mask = attention_mask(5, 0, Some(2), &[]);
        assert_eq!(visible(&mask, 5, 4), vec![3, 4]);
        assert_eq!(visible(&mask, 5, 1), vec![0, 1]);
    }

    #[test]
    fn image_span_is_bidirectional() {
        let mask = attention_mask(5, 0, None, &[1..4]);
        assert_eq!(visible(&mask, 5, 1), vec![0, 1, 2, 3]);
        assert_eq!(visible(&mask, 5, 0), vec![0]);
        assert_eq!(visible(&mask, 5, 4), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn offset_keeps_cached_keys_visible() {
        let mask = attention_mask(2, 3, None, &[]);
        assert_eq!(visible(&mask, 5, 0), vec![0, 1, 2, 3]);
        assert_eq!(visible(&mask, 5, 1), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn rms_norm_uses_offset_weight() -> Result<()> {
        let norm = RmsNorm::from_weight(Tensor::new(&[0f32, 1.0], &Device::Cpu)?, 0.0)?;
        let xs = Tensor::new(&[[3f32, 4.0]], &Device::Cpu)?;
        let ys = norm.forward(&xs)?.to_vec2::<f32>()?;
        // rms of [3, 4] is sqrt(12.5)
        let rms = 12.5f32.sqrt();
        assert!((ys[0][0] - 3.0 / rms).abs() < 1e-5);
        assert!((ys[0][1] - 2.0 * 4.0 / rms).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn rotary_tables_start_at_identity() -> Result<()> {
        let rope = RotaryEmbedding::new(DType::F32, 8, 10_000., 1.0, 16, &Device::Cpu)?;
        assert_eq!(rope.cos.dims(), &[16, 4]);
        let first_cos = rope.cos.get(0)?.to_vec1::<f32>()?;
        let first_sin = rope.sin.get(0)?.to_vec1::<f32>()?;
        assert!(first_cos.iter().all(|&c| (c - 1.0).abs() < 1e-6));
        assert!(first_sin.iter().all(|&s| s.abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn linear_scaling_slows_rotation() -> Result<()> {
        let plain = RotaryEmbedding::new(DType::F32, 4, 10_000., 1.0, 4, &Device::Cpu)?;
        let scaled = RotaryEmbedding::new(DType::F32, 4, 10_000., 8.0, 4, &Device::Cpu)?;
        let p = plain.sin.get(1)?.to_vec1::<f32>()?;
        let s = scaled.sin.get(1)?.to_vec1::<f32>()?;
        assert!((p[0] - 1f32.sin()).abs() < 1e-6);
        assert!((s[0] - (1f32 / 8.0).sin()).abs() < 1e-6);
        Ok(())
    }
}
