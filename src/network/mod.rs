//! Runtime materialisation of a genome: a dense neuron array in ascending
//! NID order over a flat value buffer, with per-sample backpropagation and
//! mini-batch gradient updates.

mod neuron;

use std::collections::HashMap;

use tracing::{info, warn};

use crate::config::STANDARD_TRAINING_BATCH_COUNT;
use crate::dataset::{Batch, Dataset};
use crate::errors::{CbError, CbResult};
use crate::genome::Genome;
use crate::metrics::{BatchStats, Metrics, RollingBuffer};
use crate::squash::Squasher;

use self::neuron::{Neuron, Weight};

pub struct Network {
    input_count: usize,
    output_count: usize,
    neurons: Vec<Neuron>,
    /// `input_count` input slots followed by one activation per neuron.
    values: Vec<f32>,
    squasher: Box<dyn Squasher>,
    start_lr_exponent: f32,
    lr_exponent_delta: f32,
    trained_batches: u32,
    cost_buffer: RollingBuffer,
    ca_cost_buffer: RollingBuffer,
    accuracy_buffer: RollingBuffer,
}

impl Network {
    /// Compiles a genome: NIDs collapse to compact indices, weights to value
    /// buffer offsets. The network owns its squasher for life.
    pub fn new(genome: &Genome, squasher: Box<dyn Squasher>) -> Self {
        let input_count = genome.input_count() as usize;
        let neuron_count = genome.len();

        // Ascending NID order doubles as evaluation order.
        let mut index_of: HashMap<u32, usize> = HashMap::with_capacity(neuron_count);
        for (position, (nid, _)) in genome.chromosomes().enumerate() {
            index_of.insert(nid, position);
        }

        let mut neurons = Vec::with_capacity(neuron_count);
        for (_, chromosome) in genome.chromosomes() {
            let weights = chromosome
                .weights()
                .iter()
                .map(|(&source, &value)| {
                    if source < genome.input_count() {
                        Weight {
                            source_offset: source as usize,
                            source_neuron: None,
                            value,
                            gradient: 0.0,
                        }
                    } else {
                        let index = index_of[&source];
                        Weight {
                            source_offset: input_count + index,
                            source_neuron: Some(index),
                            value,
                            gradient: 0.0,
                        }
                    }
                })
                .collect();
            neurons.push(Neuron::new(chromosome.bias(), weights));
        }

        let (start_lr_exponent, lr_exponent_delta) = genome.lr_exponents();
        Self {
            input_count,
            output_count: genome.output_count() as usize,
            neurons,
            values: vec![0.0; input_count + neuron_count],
            squasher,
            start_lr_exponent,
            lr_exponent_delta,
            trained_batches: 0,
            cost_buffer: RollingBuffer::default(),
            ca_cost_buffer: RollingBuffer::default(),
            accuracy_buffer: RollingBuffer::default(),
        }
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }

    pub fn neuron_count(&self) -> usize {
        self.neurons.len()
    }

    pub fn trained_batches(&self) -> u32 {
        self.trained_batches
    }

    pub fn cost_buffer_len(&self) -> usize {
        self.cost_buffer.len()
    }

    /// Every connection weight, flattened in evaluation order. Handy for
    /// comparing training states.
    pub fn weight_snapshot(&self) -> Vec<f32> {
        self.neurons
            .iter()
            .flat_map(|n| n.weights.iter().map(|w| w.value))
            .collect()
    }

    /// Feeds one input vector forward and returns the output activations.
    /// Wrong-sized inputs are zero-padded (or truncated) with a warning.
    pub fn run_network(&mut self, inputs: &[f32], prep_for_backprop: bool) -> Vec<f32> {
        if inputs.len() != self.input_count {
            warn!(
                "Input vector of incorrect size {} fed to network expecting size {}",
                inputs.len(),
                self.input_count
            );
        }
        let copied = inputs.len().min(self.input_count);
        self.values[..copied].copy_from_slice(&inputs[..copied]);
        self.values[copied..self.input_count].fill(0.0);

        self.forward(prep_for_backprop);
        self.values[self.values.len() - self.output_count..].to_vec()
    }

    fn forward(&mut self, prep_for_backprop: bool) {
        for index in 0..self.neurons.len() {
            let z = self.neurons[index].weigh_inputs(&self.values);
            self.values[self.input_count + index] = self.squasher.squash(z);
            if prep_for_backprop {
                let neuron = &mut self.neurons[index];
                neuron.da_dz = self.squasher.derivative(z);
                neuron.dc_da = 0.0;
            }
        }
    }

    /// Squared-error cost of the current output region against a target
    /// row, the correct answer weighted x5. Returns
    /// `(cost, ca_cost, predicted, correct)` output indices included.
    fn score_outputs(&mut self, targets: &[f32], set_gradients: bool) -> (f32, f32, usize, usize) {
        let output_base = self.values.len() - self.output_count;
        let neuron_base = self.neurons.len() - self.output_count;

        let mut cost = 0.0;
        let mut ca_cost = 0.0;
        let mut correct = 0;
        let mut predicted = 0;
        let mut best = f32::NEG_INFINITY;
        for position in 0..self.output_count {
            let activation = self.values[output_base + position];
            let target = targets[position];
            let diff = activation - target;
            let is_correct = target > 0.5;
            if is_correct {
                correct = position;
                cost += 5.0 * diff * diff;
                ca_cost += 5.0 * diff * diff;
            } else {
                cost += diff * diff;
            }
            if set_gradients {
                self.neurons[neuron_base + position].dc_da =
                    if is_correct { 10.0 * diff } else { 2.0 * diff };
            }
            if activation > best {
                best = activation;
                predicted = position;
            }
        }
        (cost, ca_cost, predicted, correct)
    }

    /// Reverse walk: each neuron turns `∂C/∂a` into `∂C/∂z`, accumulates its
    /// bias and weight gradients, and pushes blame upstream.
    fn backprop(&mut self) {
        for index in (0..self.neurons.len()).rev() {
            let (upstream, tail) = self.neurons.split_at_mut(index);
            let neuron = &mut tail[0];
            let dc_dz = neuron.da_dz * neuron.dc_da;
            neuron.bias_gradient += dc_dz;
            for weight in &mut neuron.weights {
                weight.gradient += self.values[weight.source_offset] * dc_dz;
                if let Some(source) = weight.source_neuron {
                    upstream[source].dc_da += weight.value * dc_dz;
                }
            }
        }
    }

    /// `2^(start + trained · delta / STANDARD_TRAINING_BATCH_COUNT)`.
    fn learning_rate(&self) -> f32 {
        let exponent = self.start_lr_exponent
            + self.trained_batches as f32 * self.lr_exponent_delta
                / STANDARD_TRAINING_BATCH_COUNT as f32;
        exponent.exp2()
    }

    /// Runs one minibatch of forward/backward passes, then applies the mean
    /// gradient once. The batch lock serialises fold networks sharing the
    /// same sample memory.
    pub fn train_from_batch(&mut self, batch: &Batch) -> BatchStats {
        let _guard = batch.lock.lock().unwrap();
        let sample_count = batch.len();
        let mut total_cost = 0.0;
        let mut total_ca_cost = 0.0;
        let mut correct_count = 0usize;

        for sample in 0..sample_count {
            self.load_inputs(batch, sample);
            self.forward(true);
            let targets: Vec<f32> = batch.targets.row(sample).iter().copied().collect();
            let (cost, ca_cost, predicted, correct) = self.score_outputs(&targets, true);
            total_cost += cost;
            total_ca_cost += ca_cost;
            if predicted == correct {
                correct_count += 1;
            }
            self.backprop();
        }

        let learning_rate = self.learning_rate();
        let scale = learning_rate / sample_count as f32;
        for neuron in &mut self.neurons {
            neuron.bias -= neuron.bias_gradient * scale;
            neuron.bias_gradient = 0.0;
            for weight in &mut neuron.weights {
                weight.value -= weight.gradient * scale;
                weight.gradient = 0.0;
            }
        }
        self.trained_batches += 1;

        let stats = BatchStats {
            cost: total_cost / sample_count as f32,
            ca_cost: total_ca_cost / sample_count as f32,
            accuracy: 100.0 * correct_count as f32 / sample_count as f32,
        };
        self.cost_buffer.push(stats.cost);
        self.ca_cost_buffer.push(stats.ca_cost);
        self.accuracy_buffer.push(stats.accuracy);
        stats
    }

    /// Forward-only twin of `train_from_batch`: same statistics, no weight
    /// movement, no buffer writes.
    pub fn test_from_batch(&mut self, batch: &Batch) -> BatchStats {
        let sample_count = batch.len();
        let mut total_cost = 0.0;
        let mut total_ca_cost = 0.0;
        let mut correct_count = 0usize;

        for sample in 0..sample_count {
            self.load_inputs(batch, sample);
            self.forward(false);
            let targets: Vec<f32> = batch.targets.row(sample).iter().copied().collect();
            let (cost, ca_cost, predicted, correct) = self.score_outputs(&targets, false);
            total_cost += cost;
            total_ca_cost += ca_cost;
            if predicted == correct {
                correct_count += 1;
            }
        }

        BatchStats {
            cost: total_cost / sample_count as f32,
            ca_cost: total_ca_cost / sample_count as f32,
            accuracy: 100.0 * correct_count as f32 / sample_count as f32,
        }
    }

    fn load_inputs(&mut self, batch: &Batch, sample: usize) {
        let row = batch.inputs.row(sample);
        let copied = row.len().min(self.input_count);
        for (slot, &value) in self.values[..copied].iter_mut().zip(row.iter()) {
            *slot = value;
        }
        self.values[copied..self.input_count].fill(0.0);
    }

    /// Trains over the sections `test_mask` leaves for training, in order
    /// and with wraparound, for `batch_count` minibatches starting
    /// `batch_offset` batches in. Afterwards evaluates once over every
    /// testing section and averages.
    pub fn train_from_dataset(
        &mut self,
        dataset: &Dataset,
        test_mask: &[bool],
        batch_count: u32,
        batch_offset: usize,
        verbose: bool,
    ) -> CbResult<Metrics> {
        if dataset.input_count() != self.input_count {
            warn!(
                "Dataset samples carry {} inputs; network expects {}. Samples will be padded or truncated.",
                dataset.input_count(),
                self.input_count
            );
        }
        if test_mask.len() != dataset.section_count() {
            return Err(CbError::ShapeMismatch {
                expected: dataset.section_count(),
                found: test_mask.len(),
            });
        }

        let train_batches: Vec<(usize, usize)> = dataset
            .sections
            .iter()
            .enumerate()
            .filter(|&(section, _)| !test_mask[section])
            .flat_map(|(section, s)| (0..s.batches.len()).map(move |batch| (section, batch)))
            .collect();
        if train_batches.is_empty() {
            return Err(CbError::Usage(
                "every section is masked for testing; nothing to train on".into(),
            ));
        }

        let mut cursor = batch_offset % train_batches.len();
        for trained in 0..batch_count {
            let (section, batch) = train_batches[cursor];
            self.train_from_batch(&dataset.sections[section].batches[batch]);
            cursor = (cursor + 1) % train_batches.len();
            if verbose && (trained + 1) % 50 == 0 {
                info!(
                    "Batch {}/{batch_count}: rolling cost {:.4}, accuracy {:.1}%",
                    trained + 1,
                    self.cost_buffer.mean(),
                    self.accuracy_buffer.mean()
                );
            }
        }

        let mut test_total = BatchStats::default();
        let mut test_batches = 0usize;
        for (section, s) in dataset.sections.iter().enumerate() {
            if !test_mask[section] {
                continue;
            }
            for batch in &s.batches {
                test_total = test_total + self.test_from_batch(batch);
                test_batches += 1;
            }
        }
        let test_average = if test_batches > 0 {
            test_total / test_batches as f32
        } else {
            BatchStats::default()
        };

        Ok(Metrics {
            training_cost: self.cost_buffer.mean(),
            training_ca_cost: self.ca_cost_buffer.mean(),
            training_accuracy: self.accuracy_buffer.mean(),
            testing_cost: test_average.cost,
            testing_ca_cost: test_average.ca_cost,
            testing_accuracy: test_average.accuracy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenomeParams;
    use crate::context::Context;
    use crate::squash::FastSigmoid;

    fn build() -> (Context, Genome) {
        let params = GenomeParams { neuron_min: 10, neuron_max: 20, fanin_max: 256 };
        let ctx = Context::seeded(params, 42);
        let mut rng = ctx.child_rng();
        let genome = Genome::random(&ctx, &mut rng, 1, 4, 2);
        (ctx, genome)
    }

    #[test]
    fn forward_pass_is_deterministic_and_bounded() {
        let (_ctx, genome) = build();
        let mut a = Network::new(&genome, Box::new(FastSigmoid));
        let mut b = Network::new(&genome, Box::new(FastSigmoid));
        let out_a = a.run_network(&[0.0; 4], false);
        let out_b = b.run_network(&[0.0; 4], false);
        assert_eq!(out_a, out_b);
        assert_eq!(out_a.len(), 2);
        for v in out_a {
            assert!(v > 0.0 && v < 1.0);
        }
    }

    #[test]
    fn short_input_is_zero_padded_with_a_warning() {
        let (_ctx, genome) = build();
        let mut network = Network::new(&genome, Box::new(FastSigmoid));
        let padded = network.run_network(&[0.3], false);
        let explicit = network.run_network(&[0.3, 0.0, 0.0, 0.0], false);
        assert_eq!(padded, explicit);
    }

    #[test]
    fn testing_leaves_weights_untouched() {
        let (_ctx, genome) = build();
        let mut network = Network::new(&genome, Box::new(FastSigmoid));
        let dataset = crate::dataset::Dataset::blank(2, 2, 10, 4, 2);
        let before = network.weight_snapshot();
        network.test_from_batch(&dataset.sections[0].batches[0]);
        assert_eq!(before, network.weight_snapshot());
    }

    #[test]
    fn learning_rate_decays_with_batches() {
        let (_ctx, genome) = build();
        let mut network = Network::new(&genome, Box::new(FastSigmoid));
        // Schedules with negative delta shrink as batches accumulate.
        network.start_lr_exponent = -4.0;
        network.lr_exponent_delta = -6.0;
        let initial = network.learning_rate();
        network.trained_batches = STANDARD_TRAINING_BATCH_COUNT;
        let decayed = network.learning_rate();
        assert!((initial - (-4.0f32).exp2()).abs() < 1e-7);
        assert!((decayed - (-10.0f32).exp2()).abs() < 1e-9);
    }
}
