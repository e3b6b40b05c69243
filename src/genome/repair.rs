//! Structural repair: cascading deletion, output designation and the
//! reachability prune that together restore every invariant after a
//! destructive edit.

use std::collections::HashSet;

use rand::Rng;
use tracing::{error, warn};

use super::{Genome, Nid};

/// Side-effect summary returned by cascading edits, telling the caller which
/// global repairs are still outstanding.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RepairFlags {
    pub requires_pruning: bool,
    pub requires_output_cleanup: bool,
}

impl RepairFlags {
    pub(crate) fn merge(&mut self, other: RepairFlags) {
        self.requires_pruning |= other.requires_pruning;
        self.requires_output_cleanup |= other.requires_output_cleanup;
    }

    pub(crate) fn any(&self) -> bool {
        self.requires_pruning || self.requires_output_cleanup
    }
}

impl Genome {
    /// Deletes a neuron and cascades: sources left with no referrers are
    /// deleted, referrers left with no weights are deleted. Reachability is
    /// a global property this cannot see, so any removal that leaves a
    /// neighbour alive flags a pending prune.
    pub(crate) fn delete_neuron(&mut self, id: Nid) -> RepairFlags {
        let mut flags = RepairFlags::default();
        let mut doomed = vec![id];

        while let Some(nid) = doomed.pop() {
            let Some(chromosome) = self.chromosomes.remove(&nid) else {
                continue;
            };
            if chromosome.is_output {
                flags.requires_output_cleanup = true;
            }

            for &source in chromosome.weights.keys() {
                if source < self.input_count {
                    continue;
                }
                if let Some(sc) = self.chromosomes.get_mut(&source) {
                    sc.references.remove(&nid);
                    if sc.references.is_empty() && !sc.is_output {
                        doomed.push(source);
                    } else {
                        flags.requires_pruning = true;
                    }
                }
            }

            for &referrer in &chromosome.references {
                if let Some(rc) = self.chromosomes.get_mut(&referrer) {
                    rc.weights.remove(&nid);
                    if rc.weights.is_empty() {
                        doomed.push(referrer);
                    } else {
                        flags.requires_pruning = true;
                    }
                }
            }
        }
        flags
    }

    /// Designates the `output_count` highest neurons as the outputs, strips
    /// any connection landing inside the output band, and deletes outputs
    /// that lost their last weight (re-designating afterwards). Returns
    /// whether deletions left a prune outstanding.
    pub(crate) fn cleanup_outputs(&mut self) -> RepairFlags {
        let mut flags = RepairFlags::default();
        let output_count = self.output_count as usize;

        loop {
            if self.chromosomes.len() < output_count {
                // Not enough neurons to designate; the caller must top up.
                flags.requires_pruning = true;
                return flags;
            }

            let keys: Vec<Nid> = self.chromosomes.keys().copied().collect();
            let lowest = keys[keys.len() - output_count];
            self.lowest_output_nid = lowest;
            for (&nid, chromosome) in self.chromosomes.iter_mut() {
                chromosome.is_output = nid >= lowest;
            }

            let mut deleted_any = false;
            for &output in &keys[keys.len() - output_count..] {
                // A previous deletion's cascade may already have taken this
                // output with it.
                let Some(chromosome) = self.chromosomes.get(&output) else {
                    deleted_any = true;
                    continue;
                };
                let in_band: Vec<Nid> = chromosome
                    .weights
                    .keys()
                    .copied()
                    .filter(|&source| source >= lowest)
                    .collect();
                for source in in_band {
                    self.chromosomes.get_mut(&output).unwrap().weights.remove(&source);
                    if let Some(sc) = self.chromosomes.get_mut(&source) {
                        sc.references.remove(&output);
                    }
                }
                if self.chromosomes[&output].weights.is_empty() {
                    flags.merge(self.delete_neuron(output));
                    flags.requires_pruning = true;
                    deleted_any = true;
                }
            }

            if !deleted_any {
                return flags;
            }
        }
    }

    /// Removes every neuron that no output transitively depends on, then
    /// tops the genome back up above the floor with fresh random neurons,
    /// looping until the population of neurons is stable and legal.
    pub(crate) fn prune_tree(&mut self, rng: &mut impl Rng) {
        for pass in 0.. {
            if pass >= 64 {
                error!("prune_tree failed to stabilise after {pass} passes");
                return;
            }

            self.cleanup_outputs();

            // Everything an output depends on survives; edges only point
            // downward, so one descending sweep marks the full closure.
            let mut keep: HashSet<Nid> = self
                .chromosomes
                .iter()
                .filter(|(_, c)| c.is_output)
                .map(|(&nid, _)| nid)
                .collect();
            for (&nid, chromosome) in self.chromosomes.iter().rev() {
                if keep.contains(&nid) {
                    for &source in chromosome.weights.keys() {
                        if source >= self.input_count {
                            keep.insert(source);
                        }
                    }
                }
            }

            let doomed: Vec<Nid> = self
                .chromosomes
                .keys()
                .copied()
                .filter(|nid| !keep.contains(nid))
                .collect();
            for nid in doomed {
                if self.chromosomes.contains_key(&nid) {
                    self.delete_neuron(nid);
                }
            }

            if self.chromosomes.len() >= self.params.neuron_min as usize {
                return;
            }

            // Fell below the floor: inject fresh neurons and re-check.
            let deficit = self.params.neuron_min as usize - self.chromosomes.len();
            let allow_output = self.chromosomes.len() < self.output_count as usize;
            for _ in 0..2 * deficit {
                self.add_random_neuron(rng, allow_output, true);
            }
        }
    }

    /// Relocates a neuron to `destination`, rewriting every edge endpoint in
    /// its neighbours. When the destination is already occupied the two
    /// neurons merge, keeping the destination's bias and at most `fanin_max`
    /// weights; leftover connections are dropped.
    ///
    /// Does not police direction: callers pick destinations that keep every
    /// weight pointing downward.
    pub(crate) fn move_neuron(&mut self, source_id: Nid, destination: Nid) {
        if source_id == destination {
            return;
        }
        let Some(chromosome) = self.chromosomes.remove(&source_id) else {
            warn!("move_neuron called on missing neuron {source_id}");
            return;
        };

        if !self.chromosomes.contains_key(&destination) {
            for &source in chromosome.weights.keys() {
                if source >= self.input_count {
                    if let Some(sc) = self.chromosomes.get_mut(&source) {
                        sc.references.remove(&source_id);
                        sc.references.insert(destination);
                    }
                }
            }
            for &referrer in &chromosome.references {
                if let Some(rc) = self.chromosomes.get_mut(&referrer) {
                    if let Some(weight) = rc.weights.remove(&source_id) {
                        rc.weights.insert(destination, weight);
                    }
                }
            }
            self.chromosomes.insert(destination, chromosome);
            return;
        }

        // Occupied destination: fold the moved neuron in.
        let fanin_max = self.params.fanin_max as usize;
        let mut merged = self.chromosomes.remove(&destination).unwrap();

        for (&source, &weight) in &chromosome.weights {
            if source >= self.input_count {
                if let Some(sc) = self.chromosomes.get_mut(&source) {
                    sc.references.remove(&source_id);
                }
            }
            if source == destination || merged.weights.contains_key(&source) {
                continue;
            }
            if merged.weights.len() >= fanin_max {
                continue;
            }
            merged.weights.insert(source, weight);
            if source >= self.input_count {
                if let Some(sc) = self.chromosomes.get_mut(&source) {
                    sc.references.insert(destination);
                }
            }
        }

        for &referrer in &chromosome.references {
            if referrer == destination {
                continue;
            }
            if let Some(rc) = self.chromosomes.get_mut(&referrer) {
                if let Some(weight) = rc.weights.remove(&source_id) {
                    if !rc.weights.contains_key(&destination) && destination < referrer {
                        rc.weights.insert(destination, weight);
                        merged.references.insert(referrer);
                    }
                }
            }
        }
        // The moved neuron may have fed the destination directly; that edge
        // would now be a self loop.
        merged.weights.remove(&source_id);
        merged.references.remove(&source_id);

        self.chromosomes.insert(destination, merged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenomeParams;
    use crate::context::Context;
    use crate::genome::Chromosome;

    fn params() -> GenomeParams {
        GenomeParams { neuron_min: 10, neuron_max: 20, fanin_max: 256 }
    }

    /// Hand-built four-neuron genome over two inputs:
    /// 2 -> 4 -> 6, 3 -> 5 -> 6, with 6 and an extra 7 fed by 5 as outputs.
    fn tiny_genome() -> Genome {
        let mut genome = Genome::new_blank(
            GenomeParams { neuron_min: 1, neuron_max: 20, fanin_max: 8 },
            1,
            2,
            2,
            0,
        );
        let mut add = |nid: Nid, sources: &[(Nid, f32)], is_output: bool| {
            let mut c = Chromosome::new(0.5, is_output);
            for &(s, w) in sources {
                c.weights.insert(s, w);
            }
            genome.chromosomes.insert(nid, c);
        };
        add(2, &[(0, 1.0)], false);
        add(3, &[(1, 1.0)], false);
        add(4, &[(2, 0.5)], false);
        add(5, &[(3, 0.5)], false);
        add(6, &[(4, 1.0), (5, -1.0)], true);
        add(7, &[(5, 2.0)], true);
        genome.lowest_output_nid = 6;
        // Build the reverse index.
        let pairs: Vec<(Nid, Nid)> = genome
            .chromosomes
            .iter()
            .flat_map(|(&nid, c)| c.weights.keys().map(move |&s| (s, nid)).collect::<Vec<_>>())
            .collect();
        for (source, owner) in pairs {
            if source >= 2 {
                genome.chromosomes.get_mut(&source).unwrap().references.insert(owner);
            }
        }
        genome.validate().unwrap();
        genome
    }

    #[test]
    fn delete_cascades_through_chains() {
        let mut genome = tiny_genome();
        // Deleting 4 orphans 2, which loses its only referrer.
        let flags = genome.delete_neuron(4);
        assert!(!genome.chromosomes.contains_key(&4));
        assert!(!genome.chromosomes.contains_key(&2));
        assert!(flags.requires_pruning);
        // 6 kept its other weight.
        assert_eq!(genome.chromosomes[&6].fan_in(), 1);
    }

    #[test]
    fn deleting_a_feed_of_all_outputs_flags_output_cleanup() {
        let mut genome = tiny_genome();
        // 5 feeds both outputs; 7 has no other weight and dies with it.
        let flags = genome.delete_neuron(5);
        assert!(flags.requires_output_cleanup);
        assert!(!genome.chromosomes.contains_key(&7));
    }

    #[test]
    fn cleanup_strips_output_to_output_edges() {
        let mut genome = tiny_genome();
        // Force an illegal 6 -> 7 edge.
        genome.chromosomes.get_mut(&7).unwrap().weights.insert(6, 1.0);
        genome.chromosomes.get_mut(&6).unwrap().references.insert(7);
        genome.cleanup_outputs();
        assert!(!genome.chromosomes[&7].weights.contains_key(&6));
        genome.validate().unwrap();
    }

    #[test]
    fn prune_removes_unreachable_and_tops_up() {
        let ctx = Context::seeded(params(), 42);
        let mut rng = ctx.child_rng();
        let mut genome = Genome::random(&ctx, &mut rng, 9, 4, 2);
        // Deleting every hidden neuron forces the prune to inject fresh
        // random neurons until the invariants hold again.
        let hidden: Vec<Nid> = genome
            .chromosomes
            .iter()
            .filter(|(_, c)| !c.is_output)
            .map(|(&nid, _)| nid)
            .collect();
        for nid in hidden {
            if genome.chromosomes.contains_key(&nid) {
                genome.delete_neuron(nid);
            }
        }
        genome.prune_tree(&mut rng);
        genome.validate().unwrap();
        assert!(genome.len() >= 10);
    }

    #[test]
    fn move_to_empty_slot_rewrites_neighbours() {
        let mut genome = tiny_genome();
        genome.move_neuron(4, 40);
        assert!(genome.chromosomes.contains_key(&40));
        assert!(genome.chromosomes[&2].references.contains(&40));
        assert!(genome.chromosomes[&6].weights.contains_key(&40));
        // 40 sits above 6 now, so the genome is (deliberately) invalid; the
        // caller is responsible for picking legal destinations.
    }

    #[test]
    fn move_to_occupied_slot_merges_capped() {
        let mut genome = tiny_genome();
        genome.move_neuron(4, 5);
        let merged = &genome.chromosomes[&5];
        // Union of {3} and {2}, bias kept from the destination.
        assert!(merged.weights.contains_key(&3));
        assert!(merged.weights.contains_key(&2));
        // 6 dropped its duplicate source; it still reads 5.
        assert!(genome.chromosomes[&6].weights.contains_key(&5));
        assert!(!genome.chromosomes[&6].weights.contains_key(&4));
        assert!(genome.chromosomes[&2].references.contains(&5));
    }
}
