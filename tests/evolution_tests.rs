//! Generational loop behaviour: fixed width, elitism, ranking and the
//! persisted artefacts of a short run.

use cambrian::config::GenomeParams;
use cambrian::dataset::Dataset;
use cambrian::evolve::Evolution;
use cambrian::{Context, FastSigmoid};

fn test_params() -> GenomeParams {
    GenomeParams { neuron_min: 10, neuron_max: 20, fanin_max: 256 }
}

#[test]
fn three_generations_keep_width_and_monotone_top_accuracy() {
    let ctx = Context::seeded(test_params(), 42);
    let mut rng = ctx.child_rng();
    let dataset = Dataset::synthetic(10, 1, 10, 4, 2, &mut rng);
    let mut population = Evolution::random(&ctx, 16, 4, 2);

    let out_dir = tempfile::tempdir().unwrap();
    let mut best_accuracy = f32::NEG_INFINITY;
    for generation in 0..3 {
        population.test_generation(&dataset, &FastSigmoid, 2, 2).unwrap();
        population.sort_and_rank();
        population.append_stats_row(out_dir.path()).unwrap();
        population.save(out_dir.path()).unwrap();

        assert_eq!(population.width(), 16);
        let top = population.genomes()[0].average_accuracy();
        // Elitism keeps the top three verbatim, so the champion can only be
        // matched or beaten.
        assert!(
            top >= best_accuracy - 1e-4,
            "generation {generation}: top accuracy {top} regressed below {best_accuracy}"
        );
        best_accuracy = best_accuracy.max(top);
        for (rank, genome) in population.genomes().iter().enumerate() {
            assert_eq!(genome.rank(), rank as u32);
            assert!(genome.is_tested());
        }

        population.step_population(&ctx).unwrap();
        assert_eq!(population.width(), 16);
    }

    // Elites carried over tested results; the rest await retraining.
    let tested = population.genomes().iter().filter(|g| g.is_tested()).count();
    assert_eq!(tested, 3);

    // data.txt holds a header plus one row per generation.
    let stats_path = out_dir
        .path()
        .join(population.population_id().to_string())
        .join("data.txt");
    let stats = std::fs::read_to_string(stats_path).unwrap();
    let lines: Vec<&str> = stats.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0].split('\t').count(), 1 + 6 * 7);
}

#[test]
fn stepping_increments_every_generation_counter() {
    let ctx = Context::seeded(test_params(), 9);
    let mut rng = ctx.child_rng();
    let dataset = Dataset::synthetic(10, 1, 10, 4, 2, &mut rng);
    let mut population = Evolution::random(&ctx, 16, 4, 2);
    assert_eq!(population.generation(), 0);

    population.test_generation(&dataset, &FastSigmoid, 1, 2).unwrap();
    population.sort_and_rank();
    population.step_population(&ctx).unwrap();

    for genome in population.genomes() {
        assert_eq!(genome.generation(), 1);
    }
}

#[test]
fn population_width_must_be_a_multiple_of_sixteen() {
    let ctx = Context::seeded(test_params(), 10);
    let mut population = Evolution::random(&ctx, 8, 4, 2);
    assert!(population.step_population(&ctx).is_err());
}

#[test]
fn full_run_writes_population_files() {
    let ctx = Context::seeded(test_params(), 11);
    let mut rng = ctx.child_rng();
    let dataset = Dataset::synthetic(10, 1, 10, 4, 2, &mut rng);
    let mut population = Evolution::random(&ctx, 16, 4, 2);
    let out_dir = tempfile::tempdir().unwrap();

    let options = cambrian::evolve::RunOptions {
        generation_limit: 2,
        batch_count: 1,
        concurrent_genomes: 2,
        output_dir: out_dir.path().to_path_buf(),
    };
    population.run(&dataset, &ctx, &FastSigmoid, &options).unwrap();

    let folder = out_dir.path().join(population.population_id().to_string());
    assert!(folder.join("0.population").exists());
    assert!(folder.join("1.population").exists());
    assert!(folder.join("data.txt").exists());
    // Two generations were stepped.
    assert_eq!(population.generation(), 2);
}
