//! The generational control loop: cross-validated testing under a bounded
//! worker pool, ranking, statistics, persistence, and the
//! elitism + roulette + mutation step to the next generation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use rand::Rng;
use tracing::{error, info, warn};

use crate::config::GenomeParams;
use crate::context::Context;
use crate::dataset::Dataset;
use crate::errors::{CbError, CbResult};
use crate::genome::Genome;
use crate::metrics::Metrics;
use crate::squash::Squasher;
use crate::trainer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Awaiting,
    Running,
    Completed,
}

pub struct RunOptions {
    pub generation_limit: u32,
    pub batch_count: u32,
    pub concurrent_genomes: usize,
    pub output_dir: PathBuf,
}

/// A fixed-width population of genomes and the machinery to evolve it.
pub struct Evolution {
    genomes: Vec<Genome>,
    roulette: Option<Vec<usize>>,
}

impl Evolution {
    /// Generates a fresh random population, one worker thread per genome.
    pub fn random(
        ctx: &Context,
        width: usize,
        input_count: u32,
        output_count: u32,
    ) -> Evolution {
        let population_id = ctx.child_rng().gen_range(1000..=9999);
        info!("Generating population pop{population_id} across {width} threads...");
        let genomes = thread::scope(|scope| {
            let handles: Vec<_> = (0..width)
                .map(|_| {
                    let mut rng = ctx.child_rng();
                    scope.spawn(move || {
                        Genome::random(ctx, &mut rng, population_id, input_count, output_count)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        info!("Completed generation of population pop{population_id}.");
        Evolution { genomes, roulette: None }
    }

    pub fn from_genomes(genomes: Vec<Genome>) -> Evolution {
        Evolution { genomes, roulette: None }
    }

    pub fn genomes(&self) -> &[Genome] {
        &self.genomes
    }

    pub fn width(&self) -> usize {
        self.genomes.len()
    }

    pub fn population_id(&self) -> u32 {
        self.genomes.first().map_or(0, Genome::population_id)
    }

    pub fn generation(&self) -> u32 {
        self.genomes.first().map_or(0, Genome::generation)
    }

    /// Runs generations until the limit (0 = indefinitely): test, rank,
    /// log statistics, persist, step.
    pub fn run(
        &mut self,
        dataset: &Dataset,
        ctx: &Context,
        squasher: &dyn Squasher,
        options: &RunOptions,
    ) -> CbResult<()> {
        info!("Training population...");
        let indefinite = options.generation_limit == 0;
        let mut remaining = options.generation_limit;
        while indefinite || remaining > 0 {
            remaining = remaining.saturating_sub(1);

            self.test_generation(dataset, squasher, options.batch_count, options.concurrent_genomes)?;
            self.sort_and_rank();
            if let Err(e) = self.append_stats_row(&options.output_dir) {
                warn!("Could not write generation statistics: {e}");
            }
            if let Err(e) = self.save(&options.output_dir) {
                warn!("Could not persist population: {e}");
            }
            self.step_population(ctx)?;
            info!("Generation complete. Continuing...");
        }
        info!("Finished training population.");
        Ok(())
    }

    /// Cross-validates every untested genome, `concurrent` at a time. Worker
    /// threads claim population slots under a mutex and skip genomes that
    /// already carry results.
    pub fn test_generation(
        &mut self,
        dataset: &Dataset,
        squasher: &dyn Squasher,
        batch_count: u32,
        concurrent: usize,
    ) -> CbResult<()> {
        let width = self.genomes.len();
        let states = Mutex::new(vec![RunState::Awaiting; width]);
        let results: Mutex<Vec<(usize, Metrics)>> = Mutex::new(Vec::with_capacity(width));
        let genomes = &self.genomes;

        thread::scope(|scope| {
            for _ in 0..concurrent.max(1) {
                scope.spawn(|| loop {
                    let candidate = {
                        let mut states = states.lock().unwrap();
                        let mut claimed = None;
                        for (slot, state) in states.iter_mut().enumerate() {
                            if *state != RunState::Awaiting {
                                continue;
                            }
                            if genomes[slot].is_tested() {
                                *state = RunState::Completed;
                                info!(
                                    "Viable previous results for pop{} slot {slot} - accuracy {:.1}%. Skipping.",
                                    genomes[slot].population_id(),
                                    genomes[slot].average_accuracy()
                                );
                                continue;
                            }
                            *state = RunState::Running;
                            claimed = Some(slot);
                            break;
                        }
                        claimed
                    };
                    let Some(slot) = candidate else { break };

                    info!("Starting cross-validated training for slot {slot}...");
                    match trainer::evaluate_crossval(&genomes[slot], dataset, squasher, batch_count) {
                        Ok(metrics) => results.lock().unwrap().push((slot, metrics)),
                        Err(e) => error!("Cross-validated training for slot {slot} failed: {e}"),
                    }
                    states.lock().unwrap()[slot] = RunState::Completed;
                    info!("Completed cross-validated training for slot {slot}.");
                });
            }
        });

        for (slot, metrics) in results.into_inner().unwrap() {
            self.genomes[slot].set_metrics(metrics);
        }
        Ok(())
    }

    /// Sorts by descending test accuracy and stamps ranks 0..width.
    pub fn sort_and_rank(&mut self) {
        self.genomes
            .sort_by(|a, b| b.average_accuracy().total_cmp(&a.average_accuracy()));
        for (rank, genome) in self.genomes.iter_mut().enumerate() {
            genome.set_rank(rank as u32);
        }
    }

    /// Linear roulette wheel over ranks: rank 0 holds 16 tickets, the
    /// bottom rank 1, scaled for wider populations. Built once and reused.
    fn roulette_wheel(&mut self) -> &[usize] {
        if self.roulette.is_none() {
            let width = self.genomes.len();
            let mut wheel = Vec::new();
            for rank in 0..width {
                let tickets = (width - rank) * 16 / width;
                for _ in 0..tickets {
                    wheel.push(rank);
                }
            }
            info!("Constructed roulette wheel containing {} tickets.", wheel.len());
            self.roulette = Some(wheel);
        }
        self.roulette.as_deref().unwrap()
    }

    /// Produces the next generation. For a width of 16: three elites kept,
    /// one fresh random genome, four unmutated roulette children, four
    /// mutated roulette children, three mutated mid-tier survivors and one
    /// super-mutated mid-tier survivor.
    pub fn step_population(&mut self, ctx: &Context) -> CbResult<()> {
        let width = self.genomes.len();
        if width % 16 != 0 || width == 0 {
            return Err(CbError::Usage(format!(
                "population width {width} is not a multiple of 16"
            )));
        }
        let sixteenth = width / 16;
        let three = 3 * sixteenth;
        let four = 4 * sixteenth;

        let population_id = self.population_id();
        let current_generation = self.generation();
        let input_count = self.genomes[0].input_count();
        let output_count = self.genomes[0].output_count();
        info!(
            "Stepping population pop{population_id} from generation {current_generation} to {}...",
            current_generation + 1
        );

        let mut rng = ctx.child_rng();
        let wheel: Vec<usize> = self.roulette_wheel().to_vec();
        let draw = |rng: &mut rand_chacha::ChaCha8Rng| wheel[rng.gen_range(0..wheel.len())];

        // Children first, while every parent slot is still present.
        let mut children = Vec::with_capacity(2 * four);
        for mutated in [false, true] {
            for _ in 0..four {
                let parent_a = draw(&mut rng);
                let mut parent_b = draw(&mut rng);
                while parent_b == parent_a {
                    parent_b = draw(&mut rng);
                }
                let mut child = match self.genomes[parent_a].crossover(&self.genomes[parent_b], &mut rng) {
                    Ok(child) => child,
                    Err(e) => {
                        // Keep the generation full: substitute fresh blood.
                        error!("Crossover of slots {parent_a} and {parent_b} failed: {e}. Substituting a random genome.");
                        let mut replacement =
                            Genome::random(ctx, &mut rng, population_id, input_count, output_count);
                        replacement.set_generation(current_generation + 1);
                        replacement
                    }
                };
                if mutated {
                    child.mutate(ctx, &mut rng, false);
                }
                children.push(child);
            }
        }

        let mut last: Vec<Option<Genome>> = std::mem::take(&mut self.genomes)
            .into_iter()
            .map(Some)
            .collect();
        let mut next = Vec::with_capacity(width);

        // Elites transfer by ownership, generation bumped.
        for slot in last.iter_mut().take(three) {
            let mut elite = slot.take().unwrap();
            elite.increment_generation();
            next.push(elite);
        }
        for _ in 0..sixteenth {
            let mut fresh = Genome::random(ctx, &mut rng, population_id, input_count, output_count);
            fresh.set_generation(current_generation + 1);
            next.push(fresh);
        }
        next.append(&mut children);
        // Mid-tier survivors: three mutated, then super-mutated until full.
        for index in 0..three {
            let mut survivor = last[three + index].take().unwrap();
            survivor.mutate(ctx, &mut rng, false);
            survivor.increment_generation();
            next.push(survivor);
        }
        let mut index = 0;
        while next.len() < width {
            let mut survivor = last[2 * three + index].take().unwrap();
            survivor.mutate(ctx, &mut rng, true);
            survivor.increment_generation();
            next.push(survivor);
            index += 1;
        }

        // Whatever was not retained drops here.
        self.genomes = next;
        info!(
            "Successfully stepped population pop{population_id} to generation {}.",
            self.generation()
        );
        Ok(())
    }

    /// Persists the whole population and the best genome separately, under
    /// `<dir>/<populationID>/<generation>.population|.genome`.
    pub fn save(&self, dir: &Path) -> CbResult<PathBuf> {
        let population_id = self.population_id();
        let generation = self.generation();
        let folder = dir.join(population_id.to_string());
        std::fs::create_dir_all(&folder)?;

        let path = folder.join(format!("{generation}.population"));
        info!("Saving population pop{population_id} gen{generation} to '{}'...", path.display());
        let mut writer = BufWriter::new(File::create(&path)?);
        write_u32(&mut writer, self.genomes.len() as u32)?;
        for genome in &self.genomes {
            genome.write_to(&mut writer)?;
        }
        writer.flush()?;

        if let Some(best) = self.genomes.iter().min_by_key(|g| g.rank()) {
            let best_path = folder.join(format!("{}.genome", best.generation()));
            info!("Saving best of generation (rank {}) to '{}'.", best.rank(), best_path.display());
            let mut writer = BufWriter::new(File::create(&best_path)?);
            best.write_to(&mut writer)?;
            writer.flush()?;
        }
        Ok(path)
    }

    pub fn load(
        dir: &Path,
        population_id: u32,
        generation: u32,
        params: GenomeParams,
    ) -> CbResult<Evolution> {
        let path = dir
            .join(population_id.to_string())
            .join(format!("{generation}.population"));
        info!("Loading population from '{}'...", path.display());
        let mut reader = BufReader::new(File::open(&path)?);
        let count = read_u32(&mut reader)?;
        let mut genomes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            genomes.push(Genome::read_from(&mut reader, params)?);
        }
        info!("Successfully read all {count} genomes.");
        Ok(Evolution::from_genomes(genomes))
    }

    /// Appends one row to `<dir>/<populationID>/data.txt`: for each metric,
    /// the top performer's value plus mean/best/quartiles/worst across the
    /// ranked population. Writes the header on first use.
    pub fn append_stats_row(&self, dir: &Path) -> CbResult<()> {
        let width = self.genomes.len();
        if width < 4 {
            return Err(CbError::Usage(
                "population too narrow for quartile statistics".into(),
            ));
        }
        let folder = dir.join(self.population_id().to_string());
        std::fs::create_dir_all(&folder)?;
        let path = folder.join("data.txt");

        const METRICS: [(&str, fn(&Metrics) -> f32, bool); 6] = [
            ("tr_ac", |m: &Metrics| m.training_cost, false),
            ("tr_acac", |m: &Metrics| m.training_ca_cost, false),
            ("tr_aa", |m: &Metrics| m.training_accuracy, true),
            ("te_ac", |m: &Metrics| m.testing_cost, false),
            ("te_acac", |m: &Metrics| m.testing_ca_cost, false),
            ("te_aa", |m: &Metrics| m.testing_accuracy, true),
        ];

        if !path.exists() {
            let mut header = vec!["gen".to_string()];
            for (prefix, _, _) in METRICS {
                for suffix in ["top", "mean", "best", "uq", "median", "lq", "worst"] {
                    header.push(format!("{prefix}_{suffix}"));
                }
            }
            let mut file = File::create(&path)?;
            writeln!(file, "{}", header.join("\t"))?;
        }

        let top = self.genomes[0].metrics();
        let mut row = vec![self.generation().to_string()];
        for (_, extract, higher_is_better) in METRICS {
            let mut values: Vec<f32> = self.genomes.iter().map(|g| extract(&g.metrics())).collect();
            let mean = values.iter().sum::<f32>() / width as f32;
            // Best-first ordering: ascending for costs, descending for
            // accuracy.
            values.sort_by(f32::total_cmp);
            if higher_is_better {
                values.reverse();
            }
            let median_index = width / 2 - 1;
            let uq_index = ((1 + width) as f32 * 0.25) as usize - 1;
            let lq_index = ((1 + width) as f32 * 0.75) as usize - 1;
            let column = [
                extract(&top),
                mean,
                values[0],
                values[uq_index],
                (values[median_index] + values[median_index + 1]) * 0.5,
                values[lq_index],
                values[width - 1],
            ];
            row.extend(column.iter().map(|v| format!("{v:.6}")));
        }

        let mut file = OpenOptions::new().append(true).open(&path)?;
        writeln!(file, "{}", row.join("\t"))?;
        info!("Appended generation statistics to '{}'.", path.display());
        Ok(())
    }
}

fn write_u32(writer: &mut impl Write, value: u32) -> CbResult<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u32(reader: &mut impl std::io::Read) -> CbResult<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}
