//! Integration tests for delta-audit
//!
//! Most tests run a tiny in-memory GPT-2 with a word-level tokenizer.
//! Tests marked with #[ignore] require a model download.
//! Run them explicitly with: cargo test -- --ignored

use std::cell::RefCell;
use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use delta_audit::{
    compute_delta, Audit, AuditConfig, AuditError, AuditGpt2, AuditModel, AuditRenderer,
    CapturePoint, Gpt2Config, HeatmapSpec, ModelRunner, SvgRenderer,
};
use tokenizers::Tokenizer;

const SAFE: &str = "I want to help the community.";
const HOSTILE: &str = "I want to destroy the community.";

const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": { "type": "Whitespace" },
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {
            "<|endoftext|>": 0,
            "<unk>": 1,
            "I": 2,
            "want": 3,
            "to": 4,
            "help": 5,
            "destroy": 6,
            "the": 7,
            "community": 8,
            ".": 9
        },
        "unk_token": "<unk>"
    }
}"#;

fn tiny_config() -> Gpt2Config {
    Gpt2Config {
        vocab_size: 16,
        n_positions: 16,
        n_embd: 8,
        n_layer: 2,
        n_head: 2,
        n_inner: None,
        layer_norm_epsilon: 1e-5,
        activation_function: "gelu_new".to_string(),
        bos_token_id: 0,
        model_type: Some("gpt2".to_string()),
    }
}

/// Deterministic pseudo-random weights in [-0.3, 0.3]
fn weight(shape: &[usize], seed: usize) -> Tensor {
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n)
        .map(|i| ((i as f64 * 0.731 + seed as f64 * 1.37).sin() * 0.3) as f32)
        .collect();
    Tensor::from_vec(values, shape, &Device::Cpu).unwrap()
}

fn tiny_gpt2() -> AuditGpt2 {
    let config = tiny_config();
    let d = config.n_embd;
    let m = config.d_mlp();

    let mut shapes: Vec<(String, Vec<usize>)> = vec![
        ("wte.weight".into(), vec![config.vocab_size, d]),
        ("wpe.weight".into(), vec![config.n_positions, d]),
        ("ln_f.weight".into(), vec![d]),
        ("ln_f.bias".into(), vec![d]),
    ];
    for i in 0..config.n_layer {
        for (name, shape) in [
            ("ln_1.weight", vec![d]),
            ("ln_1.bias", vec![d]),
            ("attn.c_attn.weight", vec![d, 3 * d]),
            ("attn.c_attn.bias", vec![3 * d]),
            ("attn.c_proj.weight", vec![d, d]),
            ("attn.c_proj.bias", vec![d]),
            ("ln_2.weight", vec![d]),
            ("ln_2.bias", vec![d]),
            ("mlp.c_fc.weight", vec![d, m]),
            ("mlp.c_fc.bias", vec![m]),
            ("mlp.c_proj.weight", vec![m, d]),
            ("mlp.c_proj.bias", vec![d]),
        ] {
            shapes.push((format!("h.{i}.{name}"), shape));
        }
    }

    let tensors: HashMap<String, Tensor> = shapes
        .into_iter()
        .enumerate()
        .map(|(seed, (name, shape))| (name, weight(&shape, seed)))
        .collect();
    let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
    AuditGpt2::from_var_builder(vb, config).unwrap()
}

fn tiny_model() -> AuditModel {
    let tokenizer = Tokenizer::from_bytes(TOKENIZER_JSON.as_bytes()).unwrap();
    AuditModel::from_parts(Box::new(tiny_gpt2()), tokenizer, Device::Cpu, "tiny-gpt2")
}

#[test]
fn test_encode_prepends_bos() {
    let model = tiny_model();
    assert_eq!(model.encode(SAFE).unwrap(), vec![0, 2, 3, 4, 5, 7, 8, 9]);
    assert_eq!(
        model.tokenize("I want").unwrap(),
        vec!["<|endoftext|>", "I", "want"]
    );

    let model = model.with_prepend_bos(false);
    assert_eq!(model.encode(SAFE).unwrap(), vec![2, 3, 4, 5, 7, 8, 9]);
}

#[test]
fn test_runner_exposes_every_block_point() {
    let model = tiny_model();
    let points = model.capture_points();
    assert_eq!(points.len(), 2 + 2 * 8);

    let cache = model.run_with_cache(SAFE).unwrap();
    for point in &points {
        assert!(cache.contains(point), "missing {point}");
    }
    // BOS + 7 word tokens
    assert_eq!(
        cache.get(&CapturePoint::mlp_post(1)).unwrap().dims(),
        &[1, 8, 32]
    );
}

#[test]
fn test_delta_length_matches_unit_count() {
    let model = tiny_model();

    let mlp = compute_delta(&model, &CapturePoint::mlp_post(1), SAFE, HOSTILE).unwrap();
    assert_eq!(mlp.len(), model.d_mlp());

    let resid = compute_delta(&model, &CapturePoint::resid_post(0), SAFE, HOSTILE).unwrap();
    assert_eq!(resid.len(), model.d_model());

    // The two prompts differ in one token, so something must move
    assert!(mlp.values().iter().any(|&v| v != 0.0));
}

#[test]
fn test_identical_inputs_give_zero_delta() {
    let model = tiny_model();
    let delta = compute_delta(&model, &CapturePoint::mlp_post(1), HOSTILE, HOSTILE).unwrap();
    assert!(delta.values().iter().all(|&v| v == 0.0));
}

#[test]
fn test_swapping_inputs_negates_delta() {
    let model = tiny_model();
    let point = CapturePoint::mlp_post(0);
    let forward = compute_delta(&model, &point, SAFE, HOSTILE).unwrap();
    let backward = compute_delta(&model, &point, HOSTILE, SAFE).unwrap();

    assert_eq!(forward.len(), backward.len());
    for (f, b) in forward.values().iter().zip(backward.values()) {
        assert_eq!(*f, -*b);
    }
}

#[test]
fn test_repeated_audits_are_bit_identical() {
    let model = tiny_model();
    let point = CapturePoint::attn_z(1);
    let first = compute_delta(&model, &point, SAFE, HOSTILE).unwrap();
    let second = compute_delta(&model, &point, SAFE, HOSTILE).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_inputs_of_different_length() {
    let model = tiny_model();
    let delta = compute_delta(&model, &CapturePoint::mlp_post(1), "I", HOSTILE).unwrap();
    assert_eq!(delta.len(), 32);
}

#[test]
fn test_layer_beyond_depth_is_not_found() {
    // The default point (layer 7) does not exist in a 2-layer model
    let model = tiny_model();
    let point = delta_audit::default_capture_point();
    let err = compute_delta(&model, &point, SAFE, HOSTILE).unwrap_err();
    assert!(matches!(err, AuditError::CapturePointNotFound { point: p } if p == point));
}

#[test]
fn test_context_overflow_is_runner_failure() {
    let model = tiny_model();
    // One word past the window once BOS is added
    let long = vec!["community"; model.context_length()].join(" ");
    let err = compute_delta(&model, &CapturePoint::mlp_post(0), SAFE, &long).unwrap_err();
    assert!(matches!(err, AuditError::ModelRunnerFailure(_)));
}

/// Renderer that keeps what it was handed
#[derive(Default)]
struct RecordingRenderer {
    frames: RefCell<Vec<(Vec<Vec<f32>>, HeatmapSpec)>>,
}

impl AuditRenderer for RecordingRenderer {
    fn render(&self, grid: &[Vec<f32>], spec: &HeatmapSpec) -> delta_audit::Result<()> {
        self.frames.borrow_mut().push((grid.to_vec(), spec.clone()));
        Ok(())
    }
}

#[test]
fn test_audit_renders_prefix_and_reports() {
    let model = tiny_model();
    let config = AuditConfig {
        model_id: "tiny-gpt2".to_string(),
        capture_point: CapturePoint::mlp_post(1),
        top_units: 12,
        ..Default::default()
    };
    let audit = Audit::new(&model, config);
    let delta = audit.run().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let svg_path = dir.path().join("map.svg");
    let svg = SvgRenderer::new(&svg_path);
    let recorder = RecordingRenderer::default();
    let renderers: [&dyn AuditRenderer; 2] = [&svg, &recorder];
    audit.render(&delta, &renderers).unwrap();

    // The first 12 units arrive unchanged, in unit order, as one row
    let frames = recorder.frames.borrow();
    assert_eq!(frames.len(), 1);
    let (grid, spec) = &frames[0];
    assert_eq!(grid, &vec![delta.values()[..12].to_vec()]);
    assert_eq!(
        spec.title,
        "Forensic Audit: Safety Circuit Map (tiny-gpt2 Layer 1)"
    );
    assert_eq!(
        spec.labels.x_label,
        "Individual Neuron Index (Top 12 Neurons)"
    );

    let written = std::fs::read_to_string(&svg_path).unwrap();
    assert_eq!(written.matches("<title>").count(), 12);
    assert!(written.contains("tiny-gpt2 Layer 1"));

    let report = audit.report(&delta, 5);
    assert_eq!(report.unit_count, 32);
    assert_eq!(report.displayed_units, 12);
    assert_eq!(report.strongest.len(), 5);
    assert_eq!(report.strongest[0].delta.abs(), delta.max_abs());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["capture_point"], "blocks.1.mlp.hook_post");
    assert_eq!(json["delta"].as_array().unwrap().len(), 32);
}

/// Model-download test: the reference audit on GPT-2 small
#[test]
#[ignore = "requires model download"]
fn test_gpt2_layer7_audit() {
    let model = AuditModel::from_pretrained_with_device("openai-community/gpt2", Some(true)).unwrap();
    assert_eq!(model.n_layers(), 12);
    assert_eq!(model.d_mlp(), 3072);

    let audit = Audit::new(&model, AuditConfig::default());
    let delta = audit.run().unwrap();
    assert_eq!(delta.len(), 3072);

    let grid = delta_audit::delta_grid(&delta, 50);
    assert_eq!(grid.len(), 1);
    assert_eq!(grid[0].as_slice(), &delta.values()[..50]);
}
