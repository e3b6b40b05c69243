//! Invariant suite over the destructive genome operations: random
//! construction, mutation, supermutation and crossover.

use cambrian::config::GenomeParams;
use cambrian::{Context, Genome};

fn test_params() -> GenomeParams {
    GenomeParams { neuron_min: 10, neuron_max: 20, fanin_max: 256 }
}

#[test]
fn random_construction_satisfies_all_invariants() {
    let ctx = Context::seeded(test_params(), 42);
    let mut rng = ctx.child_rng();
    let genome = Genome::random(&ctx, &mut rng, 1000, 4, 2);

    genome.validate().unwrap();
    assert!(genome.len() >= 10 && genome.len() <= 20);
    assert_eq!(genome.input_count(), 4);
    assert_eq!(genome.output_count(), 2);
    assert_eq!(genome.generation(), 0);
    assert!(!genome.is_tested());

    // Spot-check the invariants validate() promises.
    let outputs = genome.output_nids();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0], genome.lowest_output_nid());
    for (nid, chromosome) in genome.chromosomes() {
        assert_ne!(chromosome.bias(), 0.0);
        assert!(!chromosome.weights().is_empty());
        assert!(chromosome.weights().len() <= 256);
        for (&source, &weight) in chromosome.weights() {
            assert!(source < nid);
            assert_ne!(weight, 0.0);
        }
        assert_eq!(chromosome.is_output(), outputs.contains(&nid));
    }
}

#[test]
fn generation_is_reproducible_under_a_fixed_seed() {
    let build = || {
        let ctx = Context::seeded(test_params(), 42);
        let mut rng = ctx.child_rng();
        Genome::random(&ctx, &mut rng, 7, 4, 2)
    };
    assert_eq!(build(), build());
}

#[test]
fn hundred_crossovers_all_produce_valid_children() {
    let ctx = Context::seeded(test_params(), 42);
    let mut rng = ctx.child_rng();
    let a = Genome::random(&ctx, &mut rng, 2000, 4, 2);
    let b = Genome::random(&ctx, &mut rng, 2000, 4, 2);
    assert_ne!(a, b);

    for _ in 0..100 {
        let child = a.crossover(&b, &mut rng).unwrap();
        child.validate().unwrap();
        assert!(child.len() >= 10 && child.len() <= 20);
        assert_eq!(child.output_nids().len(), 2);
        assert_eq!(child.generation(), 1);
    }
}

#[test]
fn thousand_mutations_keep_the_genome_legal() {
    let ctx = Context::seeded(test_params(), 42);
    let mut rng = ctx.child_rng();
    let mut genome = Genome::random(&ctx, &mut rng, 3000, 4, 2);

    for i in 0..1000 {
        genome.mutate(&ctx, &mut rng, false);
        assert!(!genome.is_tested(), "tested flag survived mutation {i}");
        let size = genome.len();
        assert!((10..=20).contains(&size), "size {size} escaped bounds at mutation {i}");
        if i % 50 == 0 {
            genome.validate().unwrap();
        }
    }
    genome.validate().unwrap();
}

#[test]
fn supermutation_keeps_the_genome_legal() {
    let ctx = Context::seeded(test_params(), 43);
    let mut rng = ctx.child_rng();
    let mut genome = Genome::random(&ctx, &mut rng, 3001, 4, 2);
    for _ in 0..100 {
        genome.mutate(&ctx, &mut rng, true);
        genome.validate().unwrap();
    }
}

#[test]
fn crossover_of_minimal_genomes_tops_up_to_the_floor() {
    let params = GenomeParams { neuron_min: 2, neuron_max: 5, fanin_max: 8 };
    let ctx = Context::seeded(params, 5);
    let mut rng = ctx.child_rng();
    let a = Genome::random(&ctx, &mut rng, 1, 2, 1);
    let b = Genome::random(&ctx, &mut rng, 1, 2, 1);
    for _ in 0..25 {
        let child = a.crossover(&b, &mut rng).unwrap();
        child.validate().unwrap();
        assert!(child.len() >= 2);
    }
}

#[test]
fn mutation_propagates_across_interfaces_of_different_widths() {
    // Larger interface: MNIST-shaped inputs, ten classes.
    let params = GenomeParams { neuron_min: 30, neuron_max: 60, fanin_max: 64 };
    let ctx = Context::seeded(params, 9);
    let mut rng = ctx.child_rng();
    let mut genome = Genome::random(&ctx, &mut rng, 1, 784, 10);
    genome.validate().unwrap();
    for _ in 0..50 {
        genome.mutate(&ctx, &mut rng, false);
    }
    genome.validate().unwrap();
    assert_eq!(genome.output_nids().len(), 10);
}
