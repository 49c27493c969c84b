//! Property-based tests for core components using proptest.

use ndarray::{Array2, ArrayD, IxDyn};
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use rankforge_core::adapters::classifier::{CLS_TOKEN_ID, SEP_TOKEN_ID, Tokenizer};
use rankforge_core::adapters::qrank::target_rank;
use rankforge_core::adapters::{DoraAdapter, ModelAdapter, QuantizedRankAdapter};
use rankforge_core::config::EngineConfig;
use rankforge_core::data::Dataset;
use rankforge_core::decomposition::{DecompositionStrategy, RefinedLowRank};
use rankforge_core::model::{BaseModel, Layer, SyntheticLayerSpec};
use rankforge_core::quantize::{QuantizationMode, dequantize_int8, quantize_int8, quantize_nf4};
use rankforge_core::training::{ModelConfiguration, TrainingProgress, TrainingStatus};

fn vector(values: Vec<f32>) -> ArrayD<f32> {
    let len = values.len();
    ArrayD::from_shape_vec(IxDyn(&[len]), values).unwrap()
}

// --- Quantization properties ---

proptest! {
    #[test]
    fn int8_round_trip_within_one_step(values in prop::collection::vec(-10.0f32..10.0, 2..64)) {
        let weights = vector(values);
        let quantized = quantize_int8(&weights);
        let restored = dequantize_int8(&quantized);
        prop_assert_eq!(restored.shape(), weights.shape());
        let tolerance = quantized.scale.abs() + 1e-4;
        for (w, r) in weights.iter().zip(restored.iter()) {
            prop_assert!((w - r).abs() <= tolerance, "{} vs {} (scale {})", w, r, quantized.scale);
        }
    }

    #[test]
    fn nf4_uses_at_most_fifteen_levels(values in prop::collection::vec(-5.0f32..5.0, 1..64)) {
        let weights = vector(values);
        let abs_max = weights.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        let quantized = quantize_nf4(&weights);
        if abs_max == 0.0 {
            prop_assert!(quantized.iter().all(|v| *v == 0.0));
        } else {
            let scale = abs_max / 7.0;
            for v in quantized.iter() {
                let level = v / scale;
                prop_assert!(level.abs() <= 7.0 + 1e-3);
                prop_assert!((level - level.round()).abs() < 1e-3);
            }
        }
    }
}

// --- Rank selection ---

proptest! {
    #[test]
    fn target_rank_stays_in_bounds(rows in 1usize..256, cols in 1usize..256, ratio in 0.001f32..=1.0) {
        let rank = target_rank(rows, cols, ratio);
        prop_assert!(rank >= 1);
        prop_assert!(rank <= rows.min(cols));
    }

    #[test]
    fn refined_factors_reconstruct_the_input_shape(
        rows in 1usize..12,
        cols in 1usize..12,
        ratio in 0.1f32..=1.0,
        seed in any::<u64>(),
    ) {
        let matrix = Array2::from_shape_fn((rows, cols), |(i, j)| ((i * cols + j) as f32).sin());
        let rank = target_rank(rows, cols, ratio);
        let mut rng = StdRng::seed_from_u64(seed);
        let factors = RefinedLowRank::new(0.01, 5, 0.01).factorize(&matrix, rank, &mut rng);
        prop_assert_eq!(factors.rank(), rank);
        prop_assert_eq!(factors.product().dim(), (rows, cols));
        prop_assert!(factors.product().iter().all(|v| v.is_finite()));
    }
}

// --- Adapter shapes and sizes ---

fn weight_shape() -> impl Strategy<Value = Vec<usize>> {
    prop_oneof![
        (1usize..10, 1usize..10).prop_map(|(m, n)| vec![m, n]),
        (1usize..5, 1usize..4, 1usize..4, 1usize..4).prop_map(|(o, i, h, w)| vec![o, i, h, w]),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn dora_reconstruction_keeps_weight_shape(
        shape in weight_shape(),
        rank in 1usize..16,
        seed in any::<u64>(),
    ) {
        let len: usize = shape.iter().product();
        let value = ArrayD::from_shape_fn(IxDyn(&shape), |idx| ((idx[0] * 3 + idx[1]) as f32 * 0.3).cos());
        let base = BaseModel::new("prop").with_layer(Layer::new("q_proj").with_weight("weight", value));
        let config = ModelConfiguration::dora(rank, vec!["q_proj".into()]).with_seed(seed);
        let mut dora = DoraAdapter::from_config(&config, &EngineConfig::default()).unwrap();
        dora.initialize(&base).unwrap();

        let adapted = dora.adapted_weight("q_proj", "weight").unwrap();
        prop_assert_eq!(adapted.shape(), shape.as_slice());
        prop_assert_eq!(adapted.len(), len);
        let cols = len / shape[0];
        let effective = dora.ranks()[0].1.unwrap();
        prop_assert_eq!(effective, rank.min(shape[0]).min(cols));
    }

    #[test]
    fn quantized_rank_layer_sizes_sum_to_totals(
        shapes in prop::collection::vec(weight_shape(), 1..5),
        ratio in 0.05f32..=1.0,
        seed in any::<u64>(),
    ) {
        let specs: Vec<SyntheticLayerSpec> = shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| SyntheticLayerSpec {
                name: format!("block{i}.attn"),
                shapes: vec![shape.clone()],
            })
            .collect();
        let base = BaseModel::synthetic("prop", &specs, seed);
        let config = ModelConfiguration::quantized_rank(QuantizationMode::Nf4, ratio, vec!["attn".into()])
            .with_seed(seed);
        let mut qr = QuantizedRankAdapter::from_config(&config, &EngineConfig::default()).unwrap();
        qr.initialize(&base).unwrap();

        let analysis = qr.compression_analysis();
        prop_assert_eq!(analysis.layers.len(), shapes.len());
        prop_assert_eq!(
            analysis.total_original_size,
            shapes.iter().map(|s| s.iter().product::<usize>()).sum::<usize>()
        );
        prop_assert_eq!(
            analysis.total_compressed_size,
            analysis.layers.iter().map(|l| l.compressed_size).sum::<usize>()
        );
        for (layer, shape) in analysis.layers.iter().zip(&shapes) {
            let rows = shape[0];
            let cols = shape.iter().product::<usize>() / rows;
            prop_assert_eq!(layer.rank, target_rank(rows, cols, ratio));
            prop_assert_eq!(layer.compressed_size, layer.rank * (rows + cols));
        }
    }
}

// --- Tokenizer ---

proptest! {
    #[test]
    fn encoding_has_fixed_length_and_markers(text in "[a-z ,.!?]{0,80}", max_length in 2usize..48) {
        let tokenizer = Tokenizer::new();
        let ids = tokenizer.encode(&text, max_length);
        prop_assert_eq!(ids.len(), max_length);
        prop_assert_eq!(ids[0], CLS_TOKEN_ID);
        prop_assert!(ids.contains(&SEP_TOKEN_ID));
        prop_assert!(ids.iter().all(|&id| (id as usize) < tokenizer.vocab_size()));
    }
}

// --- Data and progress bookkeeping ---

proptest! {
    #[test]
    fn minibatches_cover_every_sample(samples in 0usize..100, batch_size in 1usize..40) {
        let data = Dataset::synthetic(samples, 4, 32, 2, 1);
        let batches: Vec<usize> = data.minibatches(batch_size).map(|b| b.len()).collect();
        prop_assert_eq!(batches.len(), data.batch_count(batch_size));
        prop_assert_eq!(batches.iter().sum::<usize>(), samples);
    }

    #[test]
    fn rewind_never_exceeds_bounds(total_epochs in 1usize..10, steps in 1usize..200, target in 0usize..200) {
        let mut progress = TrainingProgress::new(total_epochs);
        progress.total_steps = steps;
        progress.loss_history = vec![1.0; steps];
        progress.accuracy_history = vec![0.5; steps];
        let step = target.min(steps);
        progress.rewind_to(total_epochs + 1, step);
        prop_assert!(progress.current_epoch <= total_epochs);
        prop_assert_eq!(progress.loss_history.len(), step);
        prop_assert!(progress.completion_percentage <= 100.0);
    }
}

#[test]
fn terminal_states_have_no_exits() {
    use TrainingStatus::*;
    for from in [Completed, Failed] {
        for to in [Pending, Running, Paused, Completed, Failed] {
            assert!(!from.can_transition_to(to), "{from} -> {to}");
        }
    }
}
