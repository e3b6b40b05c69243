//! The weighted mutation table and the mutation cycle applied between
//! generations.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::repair::RepairFlags;
use super::{nonzero_normal, normal_count, Genome, Nid};
use crate::context::Context;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    NeuronAddition,
    NeuronDeletion,
    NeuronIdDrift,
    NeuronBiasDrift,
    ConnectionAddition,
    ConnectionDeletion,
    ConnectionIdDrift,
    ConnectionWeightDrift,
    LrStartDrift,
    LrDeltaDrift,
}

pub const MUTATION_KIND_COUNT: usize = 10;

const ALL_KINDS: [MutationKind; MUTATION_KIND_COUNT] = [
    MutationKind::NeuronAddition,
    MutationKind::NeuronDeletion,
    MutationKind::NeuronIdDrift,
    MutationKind::NeuronBiasDrift,
    MutationKind::ConnectionAddition,
    MutationKind::ConnectionDeletion,
    MutationKind::ConnectionIdDrift,
    MutationKind::ConnectionWeightDrift,
    MutationKind::LrStartDrift,
    MutationKind::LrDeltaDrift,
];

pub const DEFAULT_MUTATION_WEIGHTS: [u32; MUTATION_KIND_COUNT] = [1, 1, 2, 3, 2, 2, 1, 5, 1, 1];

/// Expanded ticket table: each kind appears as many times as its weight, so
/// one uniform draw picks a properly weighted mutation type. Read-only once
/// built and freely shared.
pub struct MutationTable {
    tickets: Vec<MutationKind>,
    weights: [u32; MUTATION_KIND_COUNT],
}

impl MutationTable {
    pub fn new(weights: [u32; MUTATION_KIND_COUNT]) -> Self {
        let total: u32 = weights.iter().sum();
        let mut tickets = Vec::with_capacity(total.max(1) as usize);
        for (kind, &weight) in ALL_KINDS.iter().zip(weights.iter()) {
            for _ in 0..weight {
                tickets.push(*kind);
            }
        }
        if tickets.is_empty() {
            tickets.push(MutationKind::ConnectionWeightDrift);
        }
        Self { tickets, weights }
    }

    pub fn weights(&self) -> &[u32; MUTATION_KIND_COUNT] {
        &self.weights
    }

    pub fn total_weight(&self) -> usize {
        self.tickets.len()
    }

    pub fn sample(&self, rng: &mut impl Rng) -> MutationKind {
        self.tickets[rng.gen_range(0..self.tickets.len())]
    }
}

impl Default for MutationTable {
    fn default() -> Self {
        Self::new(DEFAULT_MUTATION_WEIGHTS)
    }
}

impl Genome {
    /// Applies a normally-distributed number of weighted mutation actions,
    /// repairs whatever the cascades left outstanding, and clears `tested`.
    /// Supermutation doubles the average action count.
    pub fn mutate(&mut self, ctx: &Context, rng: &mut impl Rng, supermutate: bool) {
        let size = self.chromosomes.len() as f32;
        let mean = size * if supermutate { 0.2 } else { 0.1 };
        let deviation = (size * 0.15).max(1.0);
        let actions = normal_count(rng, mean, deviation);

        let mut flags = RepairFlags::default();
        for _ in 0..actions {
            if self.chromosomes.is_empty() {
                break;
            }
            let kind = ctx.mutation_table.sample(rng);
            let index = rng.gen_range(0..self.chromosomes.len());
            let target = *self.chromosomes.keys().nth(index).unwrap();
            self.apply_mutation(kind, target, rng, &mut flags);
        }

        if flags.any() {
            self.cleanup_outputs();
            self.prune_tree(rng);
        }
        self.tested = false;
    }

    fn apply_mutation(
        &mut self,
        kind: MutationKind,
        target: Nid,
        rng: &mut impl Rng,
        flags: &mut RepairFlags,
    ) {
        match kind {
            MutationKind::NeuronAddition => {
                if self.chromosomes.len() < self.params.neuron_max as usize {
                    self.add_random_neuron(rng, false, true);
                } else {
                    // At the cap: fall through to a deletion instead.
                    self.apply_mutation(MutationKind::NeuronDeletion, target, rng, flags);
                }
            }
            MutationKind::NeuronDeletion => {
                if self.chromosomes.len() > self.params.neuron_min as usize
                    && !self.is_output_nid(target)
                {
                    flags.merge(self.delete_neuron(target));
                }
            }
            MutationKind::NeuronIdDrift => self.drift_neuron_id(target, rng),
            MutationKind::NeuronBiasDrift => {
                if let Some(chromosome) = self.chromosomes.get_mut(&target) {
                    let bias = chromosome.bias;
                    chromosome.bias = nonzero_normal(rng, bias, (bias.abs() / 4.0).max(0.01));
                }
            }
            MutationKind::ConnectionAddition => {
                let fan_in = self.chromosomes[&target].weights.len();
                if fan_in < self.params.fanin_max as usize {
                    if let Some((owner, source)) =
                        self.add_random_connection_to_neuron(rng, target, false)
                    {
                        // Soften the newcomer so it does not swamp the
                        // neuron's existing balance.
                        let new_fan_in = self.chromosomes[&owner].weights.len() as f32;
                        let scale = (1.0 / new_fan_in).sqrt();
                        *self
                            .chromosomes
                            .get_mut(&owner)
                            .unwrap()
                            .weights
                            .get_mut(&source)
                            .unwrap() *= scale;
                    }
                }
            }
            MutationKind::ConnectionDeletion => self.drop_connection(target, rng, flags),
            MutationKind::ConnectionIdDrift => self.drift_connection_id(target, rng, flags),
            MutationKind::ConnectionWeightDrift => {
                if let Some(chromosome) = self.chromosomes.get_mut(&target) {
                    let index = rng.gen_range(0..chromosome.weights.len());
                    let source = *chromosome.weights.keys().nth(index).unwrap();
                    let weight = chromosome.weights.get_mut(&source).unwrap();
                    *weight = nonzero_normal(rng, *weight, (weight.abs() / 4.0).max(0.001));
                }
            }
            MutationKind::LrStartDrift => {
                let dist = Normal::new(self.start_lr_exponent, 0.5).unwrap();
                self.start_lr_exponent = dist.sample(rng);
            }
            MutationKind::LrDeltaDrift => {
                let dist = Normal::new(self.lr_exponent_delta, 0.5).unwrap();
                self.lr_exponent_delta = dist.sample(rng);
            }
        }
    }

    /// Slides a hidden neuron to a nearby unused NID, bounded strictly
    /// between its highest source and its lowest referrer.
    fn drift_neuron_id(&mut self, target: Nid, rng: &mut impl Rng) {
        let Some(chromosome) = self.chromosomes.get(&target) else { return };
        if chromosome.is_output {
            return;
        }
        let lower = chromosome.weights.keys().max().copied().unwrap_or(0);
        let upper = chromosome
            .references
            .iter()
            .min()
            .copied()
            .unwrap_or(self.lowest_output_nid);
        if upper <= lower + 1 {
            return;
        }

        let deviation = (0.15 * target as f32).max(1.0);
        for _ in 0..16 {
            let candidate = nonzero_normal(rng, target as f32, deviation).round();
            if candidate < self.input_count as f32 || candidate < 0.0 {
                continue;
            }
            let candidate = candidate as Nid;
            if candidate > lower
                && candidate < upper
                && candidate != target
                && !self.chromosomes.contains_key(&candidate)
            {
                self.move_neuron(target, candidate);
                return;
            }
        }
    }

    fn drop_connection(&mut self, target: Nid, rng: &mut impl Rng, flags: &mut RepairFlags) {
        let fan_in = self.chromosomes[&target].weights.len();
        if fan_in > 1 {
            let index = rng.gen_range(0..fan_in);
            let source = *self.chromosomes[&target].weights.keys().nth(index).unwrap();
            self.chromosomes.get_mut(&target).unwrap().weights.remove(&source);
            if source >= self.input_count {
                if let Some(sc) = self.chromosomes.get_mut(&source) {
                    sc.references.remove(&target);
                    if sc.references.is_empty() && !sc.is_output {
                        flags.requires_pruning = true;
                    }
                }
            }
        } else if self.chromosomes.len() > self.params.neuron_min as usize
            && !self.is_output_nid(target)
        {
            // A one-weight neuron loses its meaning with its last
            // connection; delete it outright.
            flags.merge(self.delete_neuron(target));
        }
    }

    /// Slides one incoming weight to a nearby source, never crossing the
    /// owner, never landing in the output band. Landing on an existing
    /// connection either replaces it or abandons the drift, on a coin flip.
    fn drift_connection_id(&mut self, target: Nid, rng: &mut impl Rng, flags: &mut RepairFlags) {
        let Some(chromosome) = self.chromosomes.get(&target) else { return };
        let index = rng.gen_range(0..chromosome.weights.len());
        let source = *chromosome.weights.keys().nth(index).unwrap();
        let weight = chromosome.weights[&source];

        let keys: Vec<Nid> = self.chromosomes.keys().copied().collect();
        let magnitude = (keys.len() as f32 * 0.15).max(20.0);
        let shift = Normal::new(0.0f32, magnitude).unwrap().sample(rng).round() as i64;
        if shift == 0 {
            return;
        }
        let landed = self.shift_walk(&keys, source, shift);
        if landed == source || landed >= target || self.is_output_nid(landed) {
            return;
        }

        let duplicate = self.chromosomes[&target].weights.contains_key(&landed);
        if duplicate && rng.gen_bool(0.5) {
            // Discard the drift.
            return;
        }

        self.chromosomes.get_mut(&target).unwrap().weights.remove(&source);
        if source >= self.input_count {
            if let Some(sc) = self.chromosomes.get_mut(&source) {
                sc.references.remove(&target);
                if sc.references.is_empty() && !sc.is_output {
                    flags.requires_pruning = true;
                }
            }
        }
        self.chromosomes.get_mut(&target).unwrap().weights.insert(landed, weight);
        if landed >= self.input_count {
            self.chromosomes.get_mut(&landed).unwrap().references.insert(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenomeParams;

    fn ctx() -> Context {
        Context::seeded(GenomeParams { neuron_min: 10, neuron_max: 20, fanin_max: 256 }, 42)
    }

    #[test]
    fn table_respects_weights() {
        let table = MutationTable::new([0, 0, 0, 0, 0, 0, 0, 1, 0, 0]);
        let mut rng = ctx().child_rng();
        for _ in 0..32 {
            assert_eq!(table.sample(&mut rng), MutationKind::ConnectionWeightDrift);
        }
        assert_eq!(MutationTable::default().total_weight(), 18);
    }

    #[test]
    fn mutate_preserves_invariants_and_clears_tested() {
        let ctx = ctx();
        let mut rng = ctx.child_rng();
        let mut genome = Genome::random(&ctx, &mut rng, 77, 4, 2);
        genome.set_metrics(crate::metrics::Metrics::default());
        assert!(genome.is_tested());
        for _ in 0..100 {
            genome.mutate(&ctx, &mut rng, false);
            assert!(!genome.is_tested());
            genome.validate().unwrap();
        }
    }

    #[test]
    fn supermutate_preserves_invariants() {
        let ctx = ctx();
        let mut rng = ctx.child_rng();
        let mut genome = Genome::random(&ctx, &mut rng, 78, 4, 2);
        for _ in 0..20 {
            genome.mutate(&ctx, &mut rng, true);
            genome.validate().unwrap();
        }
    }
}
