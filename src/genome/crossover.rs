//! Two-parent crossover. The operation is restartable: any step that paints
//! itself into a corner abandons the partial child and the whole combination
//! is retried from scratch.

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::Rng;
use tracing::error;

use super::{normal_count, Chromosome, Genome, Nid};
use crate::errors::{CbError, CbResult};

/// Provenance marker used while balancing the child's size.
const FROM_A: u8 = 1;
const FROM_B: u8 = 2;
const MERGED: u8 = 3;

impl Genome {
    /// Combines two parents into a child genome: output lineages are chosen
    /// per slot by coin flip, their ancestor cones copied (colliding neurons
    /// merged or relocated), the child resized towards the parents' average,
    /// and the result repaired and validated. Retries from scratch on any
    /// dead end, up to a fixed attempt limit.
    pub fn crossover(&self, other: &Genome, rng: &mut impl Rng) -> CbResult<Genome> {
        if self.input_count != other.input_count || self.output_count != other.output_count {
            return Err(CbError::Validation(
                "crossover parents disagree on input/output counts".into(),
            ));
        }

        for attempt in 0..100 {
            if let Some(child) = self.try_crossover(other, rng) {
                match child.validate() {
                    Ok(()) => return Ok(child),
                    Err(e) => {
                        error!("Crossover attempt {attempt} produced an invalid child: {e}. Retrying.");
                    }
                }
            }
        }
        Err(CbError::Validation(
            "crossover failed to produce a valid child within the attempt limit".into(),
        ))
    }

    fn try_crossover(&self, other: &Genome, rng: &mut impl Rng) -> Option<Genome> {
        let output_count = self.output_count as usize;
        let input_count = self.input_count;

        // Steps 1-2: pick a parent per output slot and flood-fill the
        // chosen output's ancestor cone in that parent.
        let a_outputs = self.output_nids();
        let b_outputs = other.output_nids();
        if a_outputs.len() != output_count || b_outputs.len() != output_count {
            return None;
        }
        let mut selected_a: HashSet<Nid> = HashSet::new();
        let mut selected_b: HashSet<Nid> = HashSet::new();
        let mut chosen: Vec<(bool, Nid)> = Vec::with_capacity(output_count);
        for slot in 0..output_count {
            let from_b = rng.gen_bool(0.5);
            let (parent, outputs, selected) = if from_b {
                (other, &b_outputs, &mut selected_b)
            } else {
                (self, &a_outputs, &mut selected_a)
            };
            let output = outputs[slot];
            let mut stack = vec![output];
            while let Some(nid) = stack.pop() {
                if selected.insert(nid) {
                    for &source in parent.chromosomes[&nid].weights.keys() {
                        if source >= input_count {
                            stack.push(source);
                        }
                    }
                }
            }
            chosen.push((from_b, output));
        }

        // Step 3: copy parent A wholesale, then parent B with collision
        // handling and a forward remap for relocated neurons.
        let mut child = Genome::new_blank(
            self.params,
            self.population_id,
            input_count,
            self.output_count,
            self.generation.max(other.generation) + 1,
        );
        let mut origin: HashMap<Nid, u8> = HashMap::new();
        let mut chosen_child: Vec<Option<Nid>> = vec![None; output_count];

        for (&nid, chromosome) in &self.chromosomes {
            if !selected_a.contains(&nid) {
                continue;
            }
            let mut is_output = false;
            for (slot, &(from_b, parent_nid)) in chosen.iter().enumerate() {
                if !from_b && parent_nid == nid {
                    is_output = true;
                    chosen_child[slot] = Some(nid);
                }
            }
            let mut copy = Chromosome::new(chromosome.bias, is_output);
            copy.weights = chromosome.weights.clone();
            child.chromosomes.insert(nid, copy);
            origin.insert(nid, FROM_A);
        }

        let mut remap: HashMap<Nid, Nid> = HashMap::new();
        for (&nid, chromosome) in &other.chromosomes {
            if !selected_b.contains(&nid) {
                continue;
            }
            let weights: BTreeMap<Nid, f32> = chromosome
                .weights
                .iter()
                .map(|(&source, &weight)| (remap.get(&source).copied().unwrap_or(source), weight))
                .collect();
            if weights.len() != chromosome.weights.len() {
                // Two sources folded onto one NID through the remap.
                return None;
            }
            let slots: Vec<usize> = chosen
                .iter()
                .enumerate()
                .filter(|&(_, &(from_b, parent_nid))| from_b && parent_nid == nid)
                .map(|(slot, _)| slot)
                .collect();
            let is_output = !slots.is_empty();

            let collision = child.chromosomes.get(&nid).map(|existing| existing.is_output);
            match collision {
                None => {
                    let mut copy = Chromosome::new(chromosome.bias, is_output);
                    copy.weights = weights;
                    child.chromosomes.insert(nid, copy);
                    origin.insert(nid, FROM_B);
                    for slot in slots {
                        chosen_child[slot] = Some(nid);
                    }
                }
                Some(false) if !is_output => {
                    let existing = &child.chromosomes[&nid];
                    let (merged_weights, bias) = merge_weight_sets(
                        rng,
                        &existing.weights,
                        existing.bias,
                        &weights,
                        chromosome.bias,
                        self.params.fanin_max as usize,
                    );
                    let mut merged = Chromosome::new(bias, false);
                    merged.weights = merged_weights;
                    child.chromosomes.insert(nid, merged);
                    origin.insert(nid, MERGED);
                }
                Some(_) => {
                    // One side is an output: push B's incoming chromosome
                    // forward to the nearest free NID above its sources.
                    let floor = weights.keys().max().copied().unwrap_or(0).max(input_count);
                    let limit = chromosome
                        .references
                        .iter()
                        .min()
                        .copied()
                        .unwrap_or_else(|| self.params.nid_ceiling() + self.output_count);
                    let new_nid = ((floor + 1)..limit)
                        .find(|candidate| !child.chromosomes.contains_key(candidate))?;
                    let mut copy = Chromosome::new(chromosome.bias, is_output);
                    copy.weights = weights;
                    child.chromosomes.insert(new_nid, copy);
                    origin.insert(new_nid, FROM_B);
                    remap.insert(nid, new_nid);
                    for slot in slots {
                        chosen_child[slot] = Some(new_nid);
                    }
                }
            }
        }

        let chosen_child: Vec<Nid> = chosen_child.into_iter().collect::<Option<Vec<_>>>()?;

        // Step 4: the flood-fill copied no reverse references; rebuild them
        // all, bailing out if the remap broke the NID ordering.
        let keys: Vec<Nid> = child.chromosomes.keys().copied().collect();
        for &nid in &keys {
            let sources: Vec<Nid> = child.chromosomes[&nid].weights.keys().copied().collect();
            for source in sources {
                if source < input_count {
                    continue;
                }
                if source >= nid {
                    return None;
                }
                child.chromosomes.get_mut(&source)?.references.insert(nid);
            }
        }

        // Step 5: hidden neurons stranded in the output band move down into
        // the largest NID gap, spread evenly. No gap big enough -> restart.
        let lowest_chosen = *chosen_child.iter().min().unwrap();
        let displaced: Vec<Nid> = child
            .chromosomes
            .range(lowest_chosen..)
            .filter(|(_, c)| !c.is_output)
            .map(|(&nid, _)| nid)
            .collect();
        if !displaced.is_empty() {
            let (gap_start, gap_len) = largest_gap(&child, input_count, lowest_chosen)?;
            if (gap_len as usize) < displaced.len() {
                return None;
            }
            let stride = gap_len / displaced.len() as u32;
            for (i, &old) in displaced.iter().enumerate() {
                let destination = gap_start + i as u32 * stride;
                let chromosome = &child.chromosomes[&old];
                let max_source = chromosome.weights.keys().max().copied().unwrap_or(0);
                let min_referrer = chromosome.references.iter().min().copied().unwrap_or(Nid::MAX);
                if destination <= max_source || destination >= min_referrer {
                    return None;
                }
                child.move_neuron(old, destination);
                if let Some(mark) = origin.remove(&old) {
                    origin.insert(destination, mark);
                }
            }
        }

        // Step 6: permute the chosen outputs so slot order matches ascending
        // NID order exactly.
        let mut sorted = chosen_child.clone();
        sorted.sort_unstable();
        if sorted != chosen_child {
            let staging = self.params.nid_ceiling() + 1;
            for (slot, &current) in chosen_child.iter().enumerate() {
                child.move_neuron(current, staging + slot as u32);
            }
            for (slot, &destination) in sorted.iter().enumerate() {
                child.move_neuron(staging + slot as u32, destination);
            }
        }
        child.lowest_output_nid = sorted[0];

        // Step 7: steer the size towards the parents' average, first by
        // merging adjacent cross-parent pairs, then by random deletion.
        let mean_size = (self.chromosomes.len() + other.chromosomes.len()) as f32 / 2.0;
        let desired = (normal_count(rng, mean_size, 0.15 * mean_size) as u32)
            .clamp(self.params.neuron_min, self.params.neuron_max) as usize;
        while child.chromosomes.len() > desired {
            let keys: Vec<Nid> = child.chromosomes.keys().copied().collect();
            let pair = keys.windows(2).find_map(|w| {
                let (low, high) = (w[0], w[1]);
                if child.is_output_nid(low) || child.is_output_nid(high) {
                    return None;
                }
                let marks = (
                    origin.get(&low).copied().unwrap_or(0),
                    origin.get(&high).copied().unwrap_or(0),
                );
                matches!(marks, (FROM_A, FROM_B) | (FROM_B, FROM_A)).then_some((low, high))
            });
            let Some((low, high)) = pair else { break };
            child.merge_pair(rng, low, high);
            origin.insert(low, MERGED);
            origin.remove(&high);
        }
        let mut guard = 0;
        while child.chromosomes.len() > desired && guard < 8192 {
            let hidden: Vec<Nid> = child
                .chromosomes
                .iter()
                .filter(|(_, c)| !c.is_output)
                .map(|(&nid, _)| nid)
                .collect();
            if hidden.is_empty() {
                break;
            }
            let victim = hidden[rng.gen_range(0..hidden.len())];
            child.delete_neuron(victim);
            guard += 1;
        }

        // Step 8: restore every invariant (tops back up if the cascades cut
        // below the floor).
        child.cleanup_outputs();
        child.prune_tree(rng);

        // Step 9: learning-rate schedule spans the parents' interval.
        child.start_lr_exponent =
            uniform_between(rng, self.start_lr_exponent, other.start_lr_exponent);
        child.lr_exponent_delta =
            uniform_between(rng, self.lr_exponent_delta, other.lr_exponent_delta);

        Some(child)
    }

    /// Folds `high` into `low` (both hidden, adjacent in NID order) using
    /// the crossover merge rule, rewiring high's referrers down to `low`.
    fn merge_pair(&mut self, rng: &mut impl Rng, low: Nid, high: Nid) {
        let high_c = self.chromosomes.remove(&high).unwrap();
        let low_c = self.chromosomes.remove(&low).unwrap();
        let input_count = self.input_count;

        for &source in low_c.weights.keys() {
            if source >= input_count {
                if let Some(sc) = self.chromosomes.get_mut(&source) {
                    sc.references.remove(&low);
                }
            }
        }
        for &source in high_c.weights.keys() {
            if source >= input_count {
                if let Some(sc) = self.chromosomes.get_mut(&source) {
                    sc.references.remove(&high);
                }
            }
        }

        // An edge low -> high would become a self loop; drop it pre-merge.
        let mut high_weights = high_c.weights.clone();
        high_weights.remove(&low);
        let (weights, bias) = merge_weight_sets(
            rng,
            &low_c.weights,
            low_c.bias,
            &high_weights,
            high_c.bias,
            self.params.fanin_max as usize,
        );

        let mut merged = Chromosome::new(bias, false);
        merged.weights = weights;
        for &source in merged.weights.keys() {
            if source >= input_count {
                if let Some(sc) = self.chromosomes.get_mut(&source) {
                    sc.references.insert(low);
                }
            }
        }

        for &referrer in low_c.references.iter().filter(|&&r| r != high) {
            if self.chromosomes.contains_key(&referrer) {
                merged.references.insert(referrer);
            }
        }
        for &referrer in &high_c.references {
            if let Some(rc) = self.chromosomes.get_mut(&referrer) {
                if let Some(weight) = rc.weights.remove(&high) {
                    if !rc.weights.contains_key(&low) {
                        rc.weights.insert(low, weight);
                        merged.references.insert(referrer);
                    }
                }
            }
        }

        self.chromosomes.insert(low, merged);
    }
}

/// The crossover merge rule: coin-flipped bias, union of the weight maps
/// with overlaps coin-flipped, fan-in resampled around the larger side and
/// random excess trimmed.
fn merge_weight_sets(
    rng: &mut impl Rng,
    a_weights: &BTreeMap<Nid, f32>,
    a_bias: f32,
    b_weights: &BTreeMap<Nid, f32>,
    b_bias: f32,
    fanin_max: usize,
) -> (BTreeMap<Nid, f32>, f32) {
    let bias = if rng.gen_bool(0.5) { a_bias } else { b_bias };
    let mut union = a_weights.clone();
    for (&source, &weight) in b_weights {
        union
            .entry(source)
            .and_modify(|existing| {
                if rng.gen_bool(0.5) {
                    *existing = weight;
                }
            })
            .or_insert(weight);
    }
    if union.is_empty() {
        return (union, bias);
    }

    let larger = a_weights.len().max(b_weights.len());
    let smaller = a_weights.len().min(b_weights.len());
    let deviation = ((larger - smaller) as f32 / 2.0).max(1.0);
    let target = normal_count(rng, larger as f32, deviation).clamp(1, union.len().min(fanin_max));
    while union.len() > target {
        let index = rng.gen_range(0..union.len());
        let key = *union.keys().nth(index).unwrap();
        union.remove(&key);
    }
    (union, bias)
}

/// Largest run of unused NIDs in `[from, to)`. Returns `(start, length)`.
fn largest_gap(genome: &Genome, from: Nid, to: Nid) -> Option<(Nid, u32)> {
    let mut best: Option<(Nid, u32)> = None;
    let mut previous = from as i64 - 1;
    let used = genome
        .chromosomes
        .range(from..to)
        .map(|(&nid, _)| nid)
        .chain(std::iter::once(to));
    for nid in used {
        let start = (previous + 1) as u32;
        let length = nid.saturating_sub(start);
        if length > 0 && best.map_or(true, |(_, len)| length > len) {
            best = Some((start, length));
        }
        previous = nid as i64;
    }
    best
}

fn uniform_between(rng: &mut impl Rng, a: f32, b: f32) -> f32 {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    if low == high {
        low
    } else {
        rng.gen_range(low..high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenomeParams;
    use crate::Context;

    fn ctx() -> Context {
        Context::seeded(GenomeParams { neuron_min: 10, neuron_max: 20, fanin_max: 256 }, 42)
    }

    #[test]
    fn children_satisfy_every_invariant() {
        let ctx = ctx();
        let mut rng = ctx.child_rng();
        let a = Genome::random(&ctx, &mut rng, 11, 4, 2);
        let b = Genome::random(&ctx, &mut rng, 11, 4, 2);
        for _ in 0..100 {
            let child = a.crossover(&b, &mut rng).unwrap();
            child.validate().unwrap();
            assert_eq!(child.generation(), 1);
            assert!(!child.is_tested());
        }
    }

    #[test]
    fn minimal_parents_still_combine() {
        let params = GenomeParams { neuron_min: 3, neuron_max: 6, fanin_max: 16 };
        let ctx = Context::seeded(params, 7);
        let mut rng = ctx.child_rng();
        let a = Genome::random(&ctx, &mut rng, 5, 2, 2);
        let b = Genome::random(&ctx, &mut rng, 5, 2, 2);
        for _ in 0..20 {
            let child = a.crossover(&b, &mut rng).unwrap();
            child.validate().unwrap();
        }
    }

    #[test]
    fn lr_exponents_span_the_parents() {
        let ctx = ctx();
        let mut rng = ctx.child_rng();
        let a = Genome::random(&ctx, &mut rng, 3, 4, 2);
        let b = Genome::random(&ctx, &mut rng, 3, 4, 2);
        let (a_start, _) = a.lr_exponents();
        let (b_start, _) = b.lr_exponents();
        let (low, high) = if a_start <= b_start { (a_start, b_start) } else { (b_start, a_start) };
        for _ in 0..10 {
            let child = a.crossover(&b, &mut rng).unwrap();
            let (start, _) = child.lr_exponents();
            assert!(start >= low && start <= high);
        }
    }

    #[test]
    fn mismatched_interfaces_are_rejected() {
        let ctx = ctx();
        let mut rng = ctx.child_rng();
        let a = Genome::random(&ctx, &mut rng, 1, 4, 2);
        let b = Genome::random(&ctx, &mut rng, 1, 6, 2);
        assert!(a.crossover(&b, &mut rng).is_err());
    }
}
