//! `config.json` of a Gemma 3 image-text-to-text checkpoint.
//!
//! Published configs omit fields that equal the upstream defaults, so every
//! field here carries the default of the 4B variant.

use candle_transformers::models::siglip;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub text_config: TextConfig,
    pub vision_config: VisionConfig,
    #[serde(default = "default_mm_tokens_per_image")]
    pub mm_tokens_per_image: usize,
    #[serde(default = "default_image_token_index")]
    pub image_token_index: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RopeScaling {
    pub factor: f64,
    #[serde(default)]
    pub rope_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_text_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_text_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_text_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_text_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_kv_heads")]
    pub num_key_value_heads: usize,
    #[serde(default = "default_head_dim")]
    pub head_dim: usize,
    #[serde(default = "default_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rope_local_base_freq")]
    pub rope_local_base_freq: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default = "default_query_pre_attn_scalar")]
    pub query_pre_attn_scalar: f64,
    #[serde(default = "default_sliding_window")]
    pub sliding_window: usize,
    #[serde(default = "default_sliding_window_pattern")]
    pub sliding_window_pattern: usize,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub final_logit_softcapping: Option<f64>,
    #[serde(default)]
    pub attn_logit_softcapping: Option<f64>,
}

impl TextConfig {
    /// Every `sliding_window_pattern`-th layer attends globally; the rest use
    /// the local window.
    pub fn is_sliding(&self, layer_idx: usize) -> bool {
        self.sliding_window_pattern == 0 || (layer_idx + 1) % self.sliding_window_pattern != 0
    }

    pub fn rope_scaling_factor(&self) -> f64 {
        self.rope_scaling.as_ref().map(|s| s.factor).unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_vision_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_vision_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_vision_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_vision_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_eps")]
    pub layer_norm_eps: f64,
}

impl VisionConfig {
    pub fn patches_per_side(&self) -> usize {
        self.image_size / self.patch_size
    }

    /// Encoder settings for the pooling-head-free SigLIP tower.
    pub fn siglip(&self) -> siglip::VisionConfig {
        siglip::VisionConfig {
            hidden_size: self.hidden_size,
            intermediate_size: self.intermediate_size,
            num_hidden_layers: self.num_hidden_layers,
            num_attention_heads: self.num_attention_heads,
            num_channels: self.num_channels,
            image_size: self.image_size,
            patch_size: self.patch_size,
            hidden_act: candle_nn::Activation::GeluPytorchTanh,
            layer_norm_eps: self.layer_norm_eps,
        }
    }
}

fn default_mm_tokens_per_image() -> usize {
    256
}
fn default_image_token_index() -> u32 {
    262144
}
fn default_vocab_size() -> usize {
    262208
}
fn default_text_hidden_size() -> usize {
    2560
}
fn default_text_intermediate_size() -> usize {
    10240
}
fn default_text_layers() -> usize {
    34
}
fn default_text_heads() -> usize {
    8
}
fn default_kv_heads() -> usize {
    4
}
fn default_head_dim() -> usize {
    256
}
fn default_eps() -> f64 {
    1e-6
}
fn default_rope_theta() -> f64 {
    1_000_000.
}
fn default_rope_local_base_freq() -> f64 {
    10_000.
}
fn default_query_pre_attn_scalar() -> f64 {
    256.
}
fn default_sliding_window() -> usize {
    1024
}
fn default_sliding_window_pattern() -> usize {
    6
}
fn default_vision_hidden_size() -> usize {
    1152
}
fn default_vision_intermediate_size() -> usize {
    4304
}
fn default_vision_layers() -> usize {
    27
}
fn default_vision_heads() -> usize {
    16
}
fn default_num_channels() -> usize {
    3
}
fn default_image_size() -> usize {
    896
}
fn default_patch_size() -> usize {
    14
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEDGEMMA_CONFIG: &str = r#"{
        "architectures": ["Gemma3ForConditionalGeneration"],
        "boi_token_index": 255999,
        "eoi_token_index": 256000,
        "image_token_index": 262144,
        "mm_tokens_per_image": 256,
        "model_type": "gemma3",
        "text_config": {
            "hidden_size": 2560,
            "intermediate_size": 10240,
            "model_type": "gemma3_text",
            "num_hidden_layers": 34,
            "rope_scaling": {"factor": 8.0, "rope_type": "linear"},
            "sliding_window": 1024
        },
        "vision_config": {
            "hidden_size": 1152,
            "image_size": 896,
            "intermediate_size": 4304,
            "model_type": "siglip_vision_model",
            "num_attention_heads": 16,
            "num_hidden_layers": 27,
            "patch_size": 14,
            "vision_use_head": false
        }
    }"#;

    #[test]
    fn parses_sparse_checkpoint_config() {
        let cfg: Config = serde_json::from_str(MEDGEMMA_CONFIG).unwrap();
        assert_eq!(cfg.mm_tokens_per_image, 256);
        assert_eq!(cfg.text_config.head_dim, 256);
        assert_eq!(cfg.text_config.num_key_value_heads, 4);
        assert_eq!(cfg.text_config.rope_scaling_factor(), 8.0);
        assert_eq!(cfg.vision_config.patches_per_side(), 64);
        let siglip = cfg.vision_config.siglip();
        assert_eq!(siglip.hidden_size, 1152);
        assert_eq!(siglip.patch_size, 14);
        assert_eq!(siglip.num_hidden_layers, 27);
    }

    #[test]
    fn every_sixth_layer_is_global() {
        let cfg: Config = serde_json::from_str(MEDGEMMA_CONFIG).unwrap();
        let globals: Vec<usize> = (0..cfg.text_config.num_hidden_layers)
            .filter(|&i| !cfg.text_config.is_sliding(i))
            .collect();
        assert_eq!(globals, vec![5, 11, 17, 23, 29]);
    }
}
