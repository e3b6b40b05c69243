//! The genetic representation: a sparse feed-forward DAG described per
//! neuron, with invariants preserved across generation, mutation and
//! crossover.
//!
//! Neuron IDs partition into `[0, input_count)` (virtual inputs),
//! `[input_count, lowest_output_nid)` (hidden) and the output band above.
//! Connections only point from lower to higher NIDs, so ascending-ID order
//! is the evaluation order and the graph is acyclic by construction.

pub mod mutate;

mod crossover;
mod generate;
mod repair;
mod serial;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::GenomeParams;
use crate::errors::{CbError, CbResult};
use crate::metrics::Metrics;

/// Neuron identifier: primary key and topological-order stamp.
pub type Nid = u32;

/// Rank value of a genome that has not been ranked yet.
pub const UNRANKED: u32 = 100;

/// One neuron's genetic description: starting bias, incoming weights keyed
/// by source NID (all strictly lower), and the set of NIDs referencing this
/// neuron (all strictly higher).
#[derive(Clone, Debug, PartialEq)]
pub struct Chromosome {
    pub(crate) weights: BTreeMap<Nid, f32>,
    pub(crate) references: BTreeSet<Nid>,
    pub(crate) bias: f32,
    pub(crate) is_output: bool,
}

impl Chromosome {
    pub(crate) fn new(bias: f32, is_output: bool) -> Self {
        Self {
            weights: BTreeMap::new(),
            references: BTreeSet::new(),
            bias,
            is_output,
        }
    }

    pub fn fan_in(&self) -> usize {
        self.weights.len()
    }

    pub fn is_output(&self) -> bool {
        self.is_output
    }

    pub fn bias(&self) -> f32 {
        self.bias
    }

    pub fn weights(&self) -> &BTreeMap<Nid, f32> {
        &self.weights
    }

    pub fn references(&self) -> &BTreeSet<Nid> {
        &self.references
    }

    /// Xavier-style rationalisation: scales every incoming weight by
    /// `fan_in^-1.1`. Only meaningful on fresh neurons.
    pub(crate) fn rationalise_weightings(&mut self) {
        let factor = (self.weights.len() as f32).powf(-1.1);
        for weight in self.weights.values_mut() {
            *weight *= factor;
        }
    }
}

/// The complete description of one network: chromosomes ordered by NID plus
/// population bookkeeping and the learning-rate schedule.
#[derive(Clone, Debug, PartialEq)]
pub struct Genome {
    pub(crate) chromosomes: BTreeMap<Nid, Chromosome>,
    pub(crate) input_count: u32,
    pub(crate) output_count: u32,
    pub(crate) lowest_output_nid: Nid,
    pub(crate) population_id: u32,
    pub(crate) generation: u32,
    pub(crate) tested: bool,
    pub(crate) metrics: Metrics,
    pub(crate) rank: u32,
    pub(crate) start_lr_exponent: f32,
    pub(crate) lr_exponent_delta: f32,
    pub(crate) params: GenomeParams,
}

impl Genome {
    pub(crate) fn new_blank(
        params: GenomeParams,
        population_id: u32,
        input_count: u32,
        output_count: u32,
        generation: u32,
    ) -> Self {
        Self {
            chromosomes: BTreeMap::new(),
            input_count,
            output_count,
            lowest_output_nid: 0,
            population_id,
            generation,
            tested: false,
            metrics: Metrics::default(),
            rank: UNRANKED,
            start_lr_exponent: -4.0,
            lr_exponent_delta: -6.0,
            params,
        }
    }

    pub fn len(&self) -> usize {
        self.chromosomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chromosomes.is_empty()
    }

    pub fn input_count(&self) -> u32 {
        self.input_count
    }

    pub fn output_count(&self) -> u32 {
        self.output_count
    }

    pub fn lowest_output_nid(&self) -> Nid {
        self.lowest_output_nid
    }

    pub fn population_id(&self) -> u32 {
        self.population_id
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u32) {
        self.generation = generation;
    }

    pub fn increment_generation(&mut self) {
        self.generation += 1;
    }

    pub fn is_tested(&self) -> bool {
        self.tested
    }

    pub fn average_accuracy(&self) -> f32 {
        self.metrics.testing_accuracy
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics
    }

    pub fn set_metrics(&mut self, metrics: Metrics) {
        self.metrics = metrics;
        self.tested = true;
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn set_rank(&mut self, rank: u32) {
        self.rank = rank;
    }

    pub fn lr_exponents(&self) -> (f32, f32) {
        (self.start_lr_exponent, self.lr_exponent_delta)
    }

    pub fn params(&self) -> GenomeParams {
        self.params
    }

    pub fn chromosome(&self, nid: Nid) -> Option<&Chromosome> {
        self.chromosomes.get(&nid)
    }

    pub fn chromosomes(&self) -> impl Iterator<Item = (Nid, &Chromosome)> {
        self.chromosomes.iter().map(|(&nid, c)| (nid, c))
    }

    /// NIDs of the output neurons, ascending.
    pub fn output_nids(&self) -> Vec<Nid> {
        let skip = self.chromosomes.len().saturating_sub(self.output_count as usize);
        self.chromosomes.keys().copied().skip(skip).collect()
    }

    pub(crate) fn is_output_nid(&self, nid: Nid) -> bool {
        self.chromosomes.get(&nid).is_some_and(|c| c.is_output)
    }

    /// Walks `shift` positions through the ordered ID universe (input IDs as
    /// a contiguous prefix, then chromosome NIDs ascending), clamping at the
    /// ends. `keys` must be the sorted chromosome NIDs.
    pub(crate) fn shift_walk(&self, keys: &[Nid], from: Nid, shift: i64) -> Nid {
        let input_count = self.input_count as usize;
        let position = if from < self.input_count {
            from as usize
        } else {
            match keys.binary_search(&from) {
                Ok(i) => input_count + i,
                Err(i) => input_count + i.min(keys.len().saturating_sub(1)),
            }
        };
        let len = input_count + keys.len();
        let landed = (position as i64 + shift).clamp(0, len as i64 - 1) as usize;
        if landed < input_count {
            landed as Nid
        } else {
            keys[landed - input_count]
        }
    }

    /// Checks every structural invariant, returning the first violation.
    pub fn validate(&self) -> CbResult<()> {
        let fail = |message: String| Err(CbError::Validation(message));

        let count = self.chromosomes.len();
        if count < self.params.neuron_min as usize || count > self.params.neuron_max as usize {
            return fail(format!(
                "chromosome count {count} outside [{}, {}]",
                self.params.neuron_min, self.params.neuron_max
            ));
        }

        // Output flags must sit exactly on the highest output_count NIDs.
        let output_nids = self.output_nids();
        if output_nids.len() != self.output_count as usize {
            return fail(format!("expected {} outputs, found {}", self.output_count, output_nids.len()));
        }
        if output_nids.first().copied() != Some(self.lowest_output_nid) {
            return fail(format!(
                "lowest output NID {:?} does not match stored {}",
                output_nids.first(),
                self.lowest_output_nid
            ));
        }
        for (&nid, chromosome) in &self.chromosomes {
            let should_be_output = nid >= self.lowest_output_nid;
            if chromosome.is_output != should_be_output {
                return fail(format!("output flag mismatch on neuron {nid}"));
            }
        }

        for (&nid, chromosome) in &self.chromosomes {
            if chromosome.bias == 0.0 {
                return fail(format!("neuron {nid} has zero bias"));
            }
            if chromosome.weights.is_empty() {
                return fail(format!("neuron {nid} has no incoming weights"));
            }
            if chromosome.weights.len() > self.params.fanin_max as usize {
                return fail(format!(
                    "neuron {nid} fan-in {} exceeds cap {}",
                    chromosome.weights.len(),
                    self.params.fanin_max
                ));
            }
            for (&source, &weight) in &chromosome.weights {
                if weight == 0.0 {
                    return fail(format!("zero weight {source} -> {nid}"));
                }
                if source >= nid {
                    return fail(format!("weight source {source} not below owner {nid}"));
                }
                if source >= self.input_count {
                    match self.chromosomes.get(&source) {
                        None => return fail(format!("weight source {source} of {nid} does not exist")),
                        Some(sc) => {
                            if chromosome.is_output && sc.is_output {
                                return fail(format!("output {nid} references output {source}"));
                            }
                            if !sc.references.contains(&nid) {
                                return fail(format!("missing reverse reference {source} -> {nid}"));
                            }
                        }
                    }
                }
            }
            for &referrer in &chromosome.references {
                let Some(rc) = self.chromosomes.get(&referrer) else {
                    return fail(format!("reference {nid} -> {referrer} points at nothing"));
                };
                if !rc.weights.contains_key(&nid) {
                    return fail(format!("stale reference {nid} -> {referrer}"));
                }
            }
        }

        // Every non-output neuron must transitively reach an output.
        let mut reaching: HashSet<Nid> = output_nids.iter().copied().collect();
        for (&nid, chromosome) in self.chromosomes.iter().rev() {
            if reaching.contains(&nid) {
                for &source in chromosome.weights.keys() {
                    if source >= self.input_count {
                        reaching.insert(source);
                    }
                }
            }
        }
        for &nid in self.chromosomes.keys() {
            if !reaching.contains(&nid) {
                return fail(format!("neuron {nid} cannot reach any output"));
            }
        }

        Ok(())
    }
}

/// Samples a normal distribution, retrying until the result is nonzero.
/// The deviation is floored away from zero so the distribution is valid.
pub(crate) fn nonzero_normal(rng: &mut impl Rng, mean: f32, sd: f32) -> f32 {
    let dist = Normal::new(mean, sd.max(1.0e-6)).unwrap();
    loop {
        let sample = dist.sample(rng);
        if sample != 0.0 {
            return sample;
        }
    }
}

/// Samples a normal distribution and rounds to the nearest integer,
/// flooring at zero.
pub(crate) fn normal_count(rng: &mut impl Rng, mean: f32, sd: f32) -> usize {
    let dist = Normal::new(mean, sd.max(1.0e-6)).unwrap();
    let sample: f32 = dist.sample(rng);
    sample.round().max(0.0) as usize
}
