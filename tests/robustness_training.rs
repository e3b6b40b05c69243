//! Training dynamics over small fake datasets: rolling buffers, weight
//! movement, cross-validated fan-out.

use cambrian::config::GenomeParams;
use cambrian::dataset::Dataset;
use cambrian::{trainer, Context, FastSigmoid, Genome, Network};

fn test_params() -> GenomeParams {
    GenomeParams { neuron_min: 10, neuron_max: 20, fanin_max: 256 }
}

#[test]
fn ten_batches_move_the_weights_and_bound_the_buffer() {
    let ctx = Context::seeded(test_params(), 42);
    let mut rng = ctx.child_rng();
    let genome = Genome::random(&ctx, &mut rng, 1, 4, 2);

    // Blank fake dataset: 2 sections x 2 batches x 100 samples of 4 inputs
    // and 2 outputs.
    let dataset = Dataset::blank(2, 2, 100, 4, 2);
    let mut network = Network::new(&genome, Box::new(FastSigmoid));
    let initial_weights = network.weight_snapshot();

    let mask = vec![false, false];
    let metrics = network.train_from_dataset(&dataset, &mask, 10, 0, false).unwrap();

    assert_eq!(network.trained_batches(), 10);
    assert!(network.cost_buffer_len() <= 100);
    assert_ne!(initial_weights, network.weight_snapshot());
    // No test sections were reserved, so test metrics stay zero.
    assert_eq!(metrics.testing_accuracy, 0.0);
    assert!(metrics.training_cost > 0.0);
}

#[test]
fn rolling_buffer_never_exceeds_its_window() {
    let ctx = Context::seeded(test_params(), 2);
    let mut rng = ctx.child_rng();
    let genome = Genome::random(&ctx, &mut rng, 1, 4, 2);
    let dataset = Dataset::blank(2, 2, 10, 4, 2);
    let mut network = Network::new(&genome, Box::new(FastSigmoid));

    network.train_from_dataset(&dataset, &[false, false], 250, 0, false).unwrap();
    assert_eq!(network.cost_buffer_len(), 100);
}

#[test]
fn batch_offset_shifts_the_training_schedule() {
    let ctx = Context::seeded(test_params(), 3);
    let mut rng = ctx.child_rng();
    let genome = Genome::random(&ctx, &mut rng, 1, 4, 2);
    let dataset = Dataset::synthetic(2, 3, 10, 4, 2, &mut rng);

    let mut at_zero = Network::new(&genome, Box::new(FastSigmoid));
    let mut at_one = Network::new(&genome, Box::new(FastSigmoid));
    at_zero.train_from_dataset(&dataset, &[false, false], 1, 0, false).unwrap();
    at_one.train_from_dataset(&dataset, &[false, false], 1, 1, false).unwrap();
    // Different starting batches of a random dataset all but guarantee
    // diverging first updates.
    assert_ne!(at_zero.weight_snapshot(), at_one.weight_snapshot());
}

#[test]
fn masked_sections_are_never_trained_on() {
    let ctx = Context::seeded(test_params(), 4);
    let mut rng = ctx.child_rng();
    let genome = Genome::random(&ctx, &mut rng, 1, 4, 2);
    let dataset = Dataset::synthetic(3, 2, 10, 4, 2, &mut rng);
    let mut network = Network::new(&genome, Box::new(FastSigmoid));

    // All sections masked: nothing to train on.
    let err = network.train_from_dataset(&dataset, &[true, true, true], 4, 0, false);
    assert!(err.is_err());
}

#[test]
fn crossval_averages_ten_fold_metrics_onto_the_genome() {
    let ctx = Context::seeded(test_params(), 5);
    let mut rng = ctx.child_rng();
    let mut genome = Genome::random(&ctx, &mut rng, 6, 4, 2);
    let dataset = Dataset::synthetic(10, 2, 10, 4, 2, &mut rng);

    let metrics = trainer::crossval_train(&mut genome, &dataset, &FastSigmoid, 4).unwrap();
    assert!(genome.is_tested());
    assert_eq!(genome.metrics(), metrics);
    assert!(metrics.testing_accuracy >= 0.0 && metrics.testing_accuracy <= 100.0);
    assert!(metrics.training_cost >= 0.0);
}
