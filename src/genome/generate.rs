//! Random construction: whole genomes, single neurons and single
//! connections. Shared by generation, structural repair top-ups and the
//! mutation cycle.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use tracing::error;

use super::{nonzero_normal, normal_count, Chromosome, Genome, Nid};
use crate::context::Context;

impl Genome {
    /// Generates a fresh genome satisfying every invariant.
    ///
    /// Neuron count is sampled from a truncated normal centred on the middle
    /// of the permitted range; neurons are then added one at a time, outputs
    /// are designated, the tree is pruned, and every surviving chromosome
    /// gets its weights rationalised.
    pub fn random(
        ctx: &Context,
        rng: &mut impl Rng,
        population_id: u32,
        input_count: u32,
        output_count: u32,
    ) -> Genome {
        let params = ctx.params;
        let mut genome = Genome::new_blank(params, population_id, input_count, output_count, 0);

        let half_range = (params.neuron_max - params.neuron_min) as f32 / 2.0;
        let mean = params.neuron_min as f32 + half_range;
        let target = (normal_count(rng, mean, 0.15 * half_range) as u32)
            .clamp(params.neuron_min, params.neuron_max) as usize;

        let mut stalls = 0;
        while genome.len() < target && stalls < 1024 {
            if genome.add_random_neuron(rng, true, false).is_none() {
                stalls += 1;
            }
        }

        genome.cleanup_outputs();
        genome.prune_tree(rng);
        for chromosome in genome.chromosomes.values_mut() {
            chromosome.rationalise_weightings();
        }

        let start = Normal::new(-4.0f32, 1.0).unwrap();
        let delta = Normal::new(-6.0f32, 1.0).unwrap();
        genome.start_lr_exponent = start.sample(rng);
        genome.lr_exponent_delta = delta.sample(rng);

        if let Err(e) = genome.validate() {
            error!("Freshly generated genome failed validation: {e}");
        }
        genome
    }

    /// Adds one neuron at an unused NID with a sampled bias and a sampled
    /// number of random connections. Returns the new NID, or `None` when no
    /// slot or no connection could be found.
    pub(crate) fn add_random_neuron(
        &mut self,
        rng: &mut impl Rng,
        allow_output: bool,
        rationalise: bool,
    ) -> Option<Nid> {
        let ceiling = if allow_output {
            self.params.nid_ceiling()
        } else {
            self.lowest_output_nid
        };
        if ceiling <= self.input_count {
            return None;
        }

        let mut id = None;
        for _ in 0..1024 {
            let candidate = rng.gen_range(self.input_count..ceiling);
            if !self.chromosomes.contains_key(&candidate) {
                id = Some(candidate);
                break;
            }
        }
        let id = id?;

        // Sources must sit strictly below the new neuron; outputs never feed
        // anything.
        let available = self.input_count as usize
            + self
                .chromosomes
                .range(..id)
                .filter(|(_, c)| !c.is_output)
                .count();
        if available == 0 {
            return None;
        }
        let mu = (available as f32 / 4.0).min(32.0);
        let sigma = (mu / 4.0).max(1.0);
        let upper = (self.params.fanin_max as usize).min(available);
        let lower = 2.min(upper);
        let target = normal_count(rng, mu, sigma).clamp(lower, upper);

        let bias = nonzero_normal(rng, 0.0, 0.5);
        self.chromosomes.insert(id, Chromosome::new(bias, false));

        for _ in 0..target {
            self.add_random_connection_to_neuron(rng, id, false);
        }
        // The neuron is useless until something below actually feeds it.
        let mut guard = 0;
        while self.chromosomes[&id].weights.is_empty() && guard < 256 {
            self.add_random_connection_to_neuron(rng, id, false);
            guard += 1;
        }
        if self.chromosomes[&id].weights.is_empty() {
            self.delete_neuron(id);
            return None;
        }

        if rationalise {
            self.chromosomes
                .get_mut(&id)
                .unwrap()
                .rationalise_weightings();
        }
        Some(id)
    }

    /// Connects `id` to a neuron a normally-distributed walk away in ID
    /// order. A walk landing below `id` feeds `id`; a walk landing above
    /// makes `id` the source. Returns `(owner, source)` of the new weight.
    pub(crate) fn add_random_connection_to_neuron(
        &mut self,
        rng: &mut impl Rng,
        id: Nid,
        allow_referenced_outputs: bool,
    ) -> Option<(Nid, Nid)> {
        let keys: Vec<Nid> = self.chromosomes.keys().copied().collect();

        let magnitude = (keys.len() as f32 * 0.15).max(20.0);
        let dist = Normal::new(magnitude, magnitude).unwrap();
        let mut shift = dist.sample(rng).round() as i64;
        if shift == 0 {
            return None;
        }
        if rng.gen_bool(0.5) {
            shift = -shift;
        }

        let landed = self.shift_walk(&keys, id, shift);
        if landed == id {
            return None;
        }

        let (owner, source) = if landed < id { (id, landed) } else { (landed, id) };
        if source >= self.input_count && self.is_output_nid(source) {
            return None;
        }
        if owner != id && self.is_output_nid(owner) && !allow_referenced_outputs {
            return None;
        }
        {
            let owner_chromosome = self.chromosomes.get(&owner)?;
            if owner_chromosome.weights.contains_key(&source)
                || owner_chromosome.weights.len() >= self.params.fanin_max as usize
            {
                return None;
            }
        }

        let weight = nonzero_normal(rng, 0.0, 1.0);
        self.chromosomes
            .get_mut(&owner)
            .unwrap()
            .weights
            .insert(source, weight);
        if source >= self.input_count {
            self.chromosomes
                .get_mut(&source)
                .unwrap()
                .references
                .insert(owner);
        }
        Some((owner, source))
    }
}
