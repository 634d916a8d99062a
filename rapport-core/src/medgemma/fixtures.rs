//! A tiny Gemma 3 checkpoint for exercising the real decode path.
//!
//! Every weight is zero except the token embeddings, so the residual stream
//! carries the embedding straight to the tied head and the argmax is steered
//! by the embedding rows alone:
//!
//! - after `model` the next token is `findings`, and `findings` repeats;
//! - after `hello` the next token is `<eos>`.

use std::str::FromStr;
use std::sync::Mutex;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tokenizers::Tokenizer;

use super::config::Config;
use super::text::TextModel;
use super::vision::{Projector, VisionTower};
use super::MedGemmaModel;

pub const EOS: u32 = 1;
pub const END_OF_TURN: u32 = 4;
pub const USER: u32 = 9;
pub const MODEL: u32 = 10;
pub const HELLO: u32 = 11;
pub const FINDINGS: u32 = 13;

const VOCAB: usize = 16;

const TOKENS: [&str; 14] = [
    "<pad>",
    "<eos>",
    "<bos>",
    "<start_of_turn>",
    "<end_of_turn>",
    "<start_of_image>",
    "<end_of_image>",
    "<image_soft_token>",
    "<unk>",
    "user",
    "model",
    "hello",
    "world",
    "findings",
];

pub fn config() -> Config {
    serde_json::from_str(
        r#"{
            "image_token_index": 7,
            "mm_tokens_per_image": 4,
            "text_config": {
                "vocab_size": 16,
                "hidden_size": 16,
                "intermediate_size": 8,
                "num_hidden_layers": 2,
                "num_attention_heads": 2,
                "num_key_value_heads": 1,
                "head_dim": 4,
                "query_pre_attn_scalar": 4,
                "sliding_window": 8,
                "sliding_window_pattern": 2
            },
            "vision_config": {
                "hidden_size": 8,
                "intermediate_size": 16,
                "num_attention_heads": 2,
                "num_hidden_layers": 1,
                "image_size": 16,
                "patch_size": 4
            }
        }"#,
    )
    .unwrap()
}

/// Word-level tokenizer over [`TOKENS`]; every `<...>` entry except `<unk>`
/// is a special token.
pub fn tokenizer() -> Tokenizer {
    let vocab: serde_json::Map<String, serde_json::Value> = TOKENS
        .iter()
        .enumerate()
        .map(|(id, t)| (t.to_string(), id.into()))
        .collect();
    let added_tokens: Vec<serde_json::Value> = TOKENS
        .iter()
        .enumerate()
        .filter(|(_, t)| t.starts_with('<') && **t != "<unk>")
        .map(|(id, t)| {
            serde_json::json!({
                "id": id,
                "content": t,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        })
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "added_tokens": added_tokens,
        "pre_tokenizer": {"type": "Whitespace"},
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    });
    Tokenizer::from_str(&json.to_string()).unwrap()
}

fn steering_embeddings() -> candle_core::Result<Tensor> {
    let mut rows = vec![0f32; VOCAB * VOCAB];
    for id in 0..VOCAB {
        rows[id * VOCAB + id] = 1.0;
    }
    for (id, follows) in [(FINDINGS, MODEL), (EOS, HELLO)] {
        let (id, follows) = (id as usize, follows as usize);
        rows[id * VOCAB + id] = 0.0;
        rows[id * VOCAB + follows] = 2.0;
    }
    Tensor::from_vec(rows, (VOCAB, VOCAB), &Device::Cpu)
}

pub fn model(max_seq_len: usize) -> Result<MedGemmaModel> {
    let cfg = config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let text = TextModel::new(&cfg.text_config, max_seq_len, vb.pp("text"))?;
    let vision = VisionTower::new(&cfg.vision_config, vb.pp("vision"))?;
    let projector = Projector::new(&cfg, vb.pp("projector"))?;

    for (name, var) in varmap.data().lock().unwrap().iter() {
        let value = if name == "text.embed_tokens.weight" {
            steering_embeddings()?
        } else {
            var.zeros_like()?
        };
        var.set(&value)?;
    }

    Ok(MedGemmaModel {
        text: Mutex::new(text),
        vision,
        projector,
        image_token_id: cfg.image_token_index,
        eos_token_ids: vec![EOS, END_OF_TURN],
        device: Device::Cpu,
        dtype: DType::F32,
        max_seq_len,
        seed: 0,
    })
}
