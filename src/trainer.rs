//! k-fold cross-validated training: one genome, `crossval_count` networks,
//! rotating test folds, concurrent training on a dedicated pool.

use rayon::prelude::*;
use tracing::{info, warn};

use crate::dataset::Dataset;
use crate::errors::{CbError, CbResult};
use crate::genome::Genome;
use crate::metrics::Metrics;
use crate::network::Network;
use crate::squash::Squasher;

/// Builds one network per dataset section and trains them concurrently.
/// Network `i` tests on the 30% of sections starting at `i` (wrapping) and
/// trains on the rest, with its batch schedule offset by one section per
/// network so the folds stagger. Returns the averaged metrics.
pub fn evaluate_crossval(
    genome: &Genome,
    dataset: &Dataset,
    squasher: &dyn Squasher,
    batch_count: u32,
) -> CbResult<Metrics> {
    let crossval_count = dataset.section_count();
    if crossval_count == 0 {
        return Err(CbError::Usage("dataset has no cross-validation sections".into()));
    }
    let test_fold_count = (crossval_count as f32 * 0.3) as usize;

    let mut jobs: Vec<(Network, Vec<bool>, usize)> = Vec::with_capacity(crossval_count);
    let mut offset = 0usize;
    for fold in 0..crossval_count {
        let mut mask = vec![false; crossval_count];
        for j in 0..test_fold_count {
            mask[(fold + j) % crossval_count] = true;
        }
        jobs.push((Network::new(genome, squasher.clone_box()), mask, offset));
        offset += dataset.sections[fold].batches.len();
    }

    // Exactly one worker per fold network.
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(crossval_count)
        .build()
        .map_err(|e| CbError::Worker(e.to_string()))?;
    let results: Vec<CbResult<Metrics>> = pool.install(|| {
        jobs.par_iter_mut()
            .map(|(network, mask, offset)| {
                network.train_from_dataset(dataset, mask, batch_count, *offset, false)
            })
            .collect()
    });

    let mut total = Metrics::default();
    let mut successes = 0u32;
    for result in results {
        match result {
            Ok(metrics) => {
                total = total + metrics;
                successes += 1;
            }
            Err(e) => warn!("Fold worker failed: {e}"),
        }
    }
    if successes == 0 {
        return Err(CbError::Worker("every cross-validation fold failed".into()));
    }
    Ok(total / successes as f32)
}

/// `evaluate_crossval`, with the averaged metrics attached to the genome
/// (which also marks it tested).
pub fn crossval_train(
    genome: &mut Genome,
    dataset: &Dataset,
    squasher: &dyn Squasher,
    batch_count: u32,
) -> CbResult<Metrics> {
    let metrics = evaluate_crossval(genome, dataset, squasher, batch_count)?;
    genome.set_metrics(metrics);
    info!(
        "pop{} gen{}: crossval over {batch_count} batches complete. Train cost/CAcost/accuracy {:.4}/{:.4}/{:.1}%; test {:.4}/{:.4}/{:.1}%.",
        genome.population_id(),
        genome.generation(),
        metrics.training_cost,
        metrics.training_ca_cost,
        metrics.training_accuracy,
        metrics.testing_cost,
        metrics.testing_ca_cost,
        metrics.testing_accuracy,
    );
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenomeParams;
    use crate::context::Context;
    use crate::squash::FastSigmoid;

    #[test]
    fn crossval_marks_the_genome_tested() {
        let params = GenomeParams { neuron_min: 10, neuron_max: 20, fanin_max: 256 };
        let ctx = Context::seeded(params, 42);
        let mut rng = ctx.child_rng();
        let mut genome = Genome::random(&ctx, &mut rng, 2, 4, 2);
        let dataset = Dataset::synthetic(10, 1, 10, 4, 2, &mut rng);
        assert!(!genome.is_tested());
        crossval_train(&mut genome, &dataset, &FastSigmoid, 5).unwrap();
        assert!(genome.is_tested());
        // 10 folds, 3 test sections each: accuracy lands in [0, 100].
        let metrics = genome.metrics();
        assert!(metrics.testing_accuracy >= 0.0 && metrics.testing_accuracy <= 100.0);
    }
}
