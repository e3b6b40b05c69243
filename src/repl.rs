//! Line-oriented command shell. Commands separated by ` -> ` are queued and
//! executed in order; unmet preconditions warn with a remediation hint and
//! the shell carries on.

use std::collections::VecDeque;
use std::io::BufRead;

use rand::Rng;
use tracing::{info, warn};

use crate::config::Settings;
use crate::context::Context;
use crate::dataset::Dataset;
use crate::errors::CbResult;
use crate::evolve::{Evolution, RunOptions};
use crate::genome::Genome;
use crate::network::Network;
use crate::trainer;

pub struct Console {
    settings: Settings,
    ctx: Context,
    dataset: Option<Dataset>,
    genome: Option<Genome>,
    network: Option<Network>,
    population: Option<Evolution>,
    queue: VecDeque<(String, Vec<String>)>,
    ordered_to_quit: bool,
}

impl Console {
    pub fn new(settings: Settings) -> Self {
        let ctx = Context::from_settings(&settings);
        Self {
            settings,
            ctx,
            dataset: None,
            genome: None,
            network: None,
            population: None,
            queue: VecDeque::new(),
            ordered_to_quit: false,
        }
    }

    /// Reads one line, queues its commands and runs them. Returns `false`
    /// when the session should end.
    pub fn run_loop(&mut self, input: &mut impl BufRead) -> bool {
        info!("Awaiting instruction:");
        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => return false,
            Ok(_) => {}
        }
        self.enqueue(&line);
        while let Some((command, params)) = self.queue.pop_front() {
            if self.ordered_to_quit {
                break;
            }
            self.execute(&command, &params, input);
        }
        !self.ordered_to_quit
    }

    /// Splits a line into queued `(command, params)` pairs on `->`.
    pub fn enqueue(&mut self, line: &str) {
        let mut current: Option<(String, Vec<String>)> = None;
        for token in line.split_whitespace() {
            if token == "->" {
                if let Some(pair) = current.take() {
                    self.queue.push_back(pair);
                }
                continue;
            }
            match current.as_mut() {
                None => current = Some((token.to_lowercase(), Vec::new())),
                Some((_, params)) => params.push(token.to_lowercase()),
            }
        }
        if let Some(pair) = current {
            self.queue.push_back(pair);
        }
    }

    #[cfg(test)]
    fn queued(&self) -> &VecDeque<(String, Vec<String>)> {
        &self.queue
    }

    fn execute(&mut self, command: &str, params: &[String], input: &mut impl BufRead) {
        match command {
            "quit" | "q" | "end" | "stop" | "close" => {
                info!("Are you sure you wish to quit? (Y/N)");
                let mut answer = String::new();
                if input.read_line(&mut answer).is_err() {
                    return;
                }
                if matches!(answer.trim(), "y" | "Y") {
                    self.ordered_to_quit = true;
                }
            }
            "load_dataset" | "ld" => self.load_dataset(params),
            "load_default_dataset" | "load_dataset_default" | "ldd" => {
                self.load_dataset(&[
                    "MNIST/train-images.idx3-ubyte".into(),
                    crate::config::IDX_DATA_MAGIC.to_string(),
                    "MNIST/train-labels.idx1-ubyte".into(),
                    crate::config::IDX_LABEL_MAGIC.to_string(),
                ]);
            }
            "gen_random_network" | "grn" => self.generate_random_network(),
            "gen_random_population" | "gen_random_pop" | "grp" => self.generate_random_population(),
            "train_network" | "tn" => self.train_network(params),
            "crossval_train_network" | "ctn" => self.crossval_train_network(params),
            "train_population" | "tp" => self.train_population(params),
            "save_network" | "sn" | "save_genome" | "sg" => self.save_network(),
            "load_network" | "ln" | "load_genome" | "lg" => self.load_network(params),
            "save_population" | "sp" | "save_pop" => self.save_population(),
            "load_population" | "lp" | "load_pop" => self.load_population(params),
            "step_population" | "step_p" => self.step_population(),
            "help" => self.help(),
            _ => info!("'{command}' is not a recognised command."),
        }
    }

    fn parse_u32(params: &[String], index: usize, default: u32) -> u32 {
        match params.get(index) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("Could not parse '{raw}' as a number; using {default}.");
                default
            }),
        }
    }

    fn load_dataset(&mut self, params: &[String]) {
        if self.dataset.is_some() {
            warn!("A dataset is already loaded. Dataset concatenation not supported.");
            return;
        }
        if params.len() < 4 {
            info!("Cannot execute 'load_dataset'. Parameters required: dataFileName, dataFileMagicNumber, labelFileName, labelFileMagicNumber. Alternatively, use 'load_default_dataset'.");
            return;
        }
        let data_path = self.settings.data_dir.join(&params[0]);
        let label_path = self.settings.data_dir.join(&params[2]);
        let data_magic = Self::parse_u32(params, 1, crate::config::IDX_DATA_MAGIC);
        let label_magic = Self::parse_u32(params, 3, crate::config::IDX_LABEL_MAGIC);

        info!(
            "Loading data file '{}' ({data_magic}) with label file '{}' ({label_magic}).",
            data_path.display(),
            label_path.display()
        );
        match Dataset::read_idx(
            &data_path,
            data_magic,
            &label_path,
            label_magic,
            self.settings.crossval_count,
            self.settings.minibatch,
            self.settings.output_count as usize,
        ) {
            Ok(dataset) => self.dataset = Some(dataset),
            Err(e) => warn!("Failed to load dataset: {e}"),
        }
    }

    fn interface_counts(&self) -> (u32, u32) {
        match &self.dataset {
            Some(dataset) => (dataset.input_count() as u32, dataset.output_count() as u32),
            None => (self.settings.input_count, self.settings.output_count),
        }
    }

    fn generate_random_network(&mut self) {
        if self.network.is_some() {
            warn!("Network already exists!");
            return;
        }
        let population_id = self.ctx.child_rng().gen_range(1000..=9999);
        let (input_count, output_count) = self.interface_counts();
        let mut rng = self.ctx.child_rng();
        let genome = Genome::random(&self.ctx, &mut rng, population_id, input_count, output_count);
        info!("Generating network from genome...");
        self.network = Some(Network::new(&genome, self.settings.squasher.clone()));
        self.genome = Some(genome);
        info!("Generated network from genome.");
    }

    fn generate_random_population(&mut self) {
        if self.population.is_some() {
            warn!("Generation already exists!");
            return;
        }
        let (input_count, output_count) = self.interface_counts();
        self.population = Some(Evolution::random(
            &self.ctx,
            self.settings.gen_width,
            input_count,
            output_count,
        ));
    }

    fn train_network(&mut self, params: &[String]) {
        let Some(network) = self.network.as_mut() else {
            warn!("No network available to train! Use 'gen_random_network' ('grn').");
            return;
        };
        let Some(dataset) = self.dataset.as_ref() else {
            warn!("No dataset available for training purposes! Use 'load_dataset' ('ld') or 'load_default_dataset' ('ldd').");
            return;
        };
        let batch_count = Self::parse_u32(params, 0, self.settings.standard_batch_count);
        let offset = Self::parse_u32(params, 1, 0) as usize;

        let test_folds = (dataset.section_count() as f32 * 0.3) as usize;
        let mask: Vec<bool> = (0..dataset.section_count()).map(|i| i < test_folds).collect();
        match network.train_from_dataset(dataset, &mask, batch_count, offset, true) {
            Ok(metrics) => info!(
                "Training complete. Train cost/CAcost/accuracy {:.4}/{:.4}/{:.1}%; test {:.4}/{:.4}/{:.1}%.",
                metrics.training_cost,
                metrics.training_ca_cost,
                metrics.training_accuracy,
                metrics.testing_cost,
                metrics.testing_ca_cost,
                metrics.testing_accuracy,
            ),
            Err(e) => warn!("Training failed: {e}"),
        }
    }

    fn crossval_train_network(&mut self, params: &[String]) {
        let Some(genome) = self.genome.as_mut() else {
            warn!("No genome available to train! Use 'gen_random_network' ('grn').");
            return;
        };
        let Some(dataset) = self.dataset.as_ref() else {
            warn!("No dataset available for training purposes! Use 'load_dataset' ('ld') or 'load_default_dataset' ('ldd').");
            return;
        };
        let batch_count = Self::parse_u32(params, 0, self.settings.standard_batch_count);
        info!("Starting cross-validated training of genome for {batch_count} batches.");
        if let Err(e) =
            trainer::crossval_train(genome, dataset, self.settings.squasher.as_ref(), batch_count)
        {
            warn!("Cross-validated training failed: {e}");
        } else {
            info!("Cross-validated training complete.");
        }
    }

    fn train_population(&mut self, params: &[String]) {
        let Some(population) = self.population.as_mut() else {
            warn!("No generation available to train! Use 'gen_random_population' ('grp'), followed by 'train_population' ('tp').");
            return;
        };
        let Some(dataset) = self.dataset.as_ref() else {
            warn!("No dataset available for training purposes! Use 'load_dataset' ('ld') or 'load_default_dataset' ('ldd').");
            return;
        };
        let generation_limit = Self::parse_u32(params, 0, 0);
        let options = RunOptions {
            generation_limit,
            batch_count: self.settings.standard_batch_count,
            concurrent_genomes: self.settings.concurrent_genomes,
            output_dir: self.settings.genome_dir.clone(),
        };
        if let Err(e) = population.run(dataset, &self.ctx, self.settings.squasher.as_ref(), &options) {
            warn!("Population training failed: {e}");
        }
    }

    fn save_network(&mut self) {
        let Some(genome) = self.genome.as_ref() else {
            warn!("No genome available to save! Use 'gen_random_network' ('grn'), followed by 'train_network' ('tn').");
            return;
        };
        if let Err(e) = self.write_genome(genome) {
            warn!("Operation failed: {e}");
        }
    }

    fn write_genome(&self, genome: &Genome) -> CbResult<()> {
        let folder = self.settings.genome_dir.join(genome.population_id().to_string());
        std::fs::create_dir_all(&folder)?;
        let path = folder.join(format!("{}.genome", genome.generation()));
        info!(
            "Saving genome (pop{}, gen{}) to '{}'...",
            genome.population_id(),
            genome.generation(),
            path.display()
        );
        let mut writer = std::io::BufWriter::new(std::fs::File::create(&path)?);
        genome.write_to(&mut writer)?;
        info!("Writing to file complete.");
        Ok(())
    }

    fn load_network(&mut self, params: &[String]) {
        if self.genome.is_some() || self.network.is_some() {
            warn!("Solo genome slot already taken.");
            return;
        }
        let Some(population_id) = params.first() else {
            warn!("No population ID specified. Cannot load genome.");
            return;
        };
        let generation = if params.len() < 2 {
            info!("No generation parameter specified. Generation 0 assumed...");
            "0"
        } else {
            &params[1]
        };
        let path = self
            .settings
            .genome_dir
            .join(population_id)
            .join(format!("{generation}.genome"));
        info!("Loading genome from file: '{}'", path.display());
        let result = std::fs::File::open(&path)
            .map_err(crate::errors::CbError::from)
            .and_then(|file| {
                Genome::read_from(&mut std::io::BufReader::new(file), self.settings.genome)
            });
        match result {
            Ok(genome) => {
                info!("File loaded. Generating network from genome...");
                self.network = Some(Network::new(&genome, self.settings.squasher.clone()));
                self.genome = Some(genome);
                info!("Generated network from genome.");
            }
            Err(e) => warn!("Operation failed: {e}"),
        }
    }

    fn save_population(&mut self) {
        match self.population.as_ref() {
            None => warn!("No generation available to save! Use 'gen_random_population' ('grp'), followed by 'train_population' ('tp')."),
            Some(population) => {
                if let Err(e) = population.save(&self.settings.genome_dir) {
                    warn!("Operation failed: {e}");
                }
            }
        }
    }

    fn load_population(&mut self, params: &[String]) {
        if self.population.is_some() {
            warn!("A population is already loaded.");
            return;
        }
        if params.len() < 2 {
            warn!("Inadequate parameter count, cannot load population. Use the form 'load_population popID generation', eg. 'lp 4649 3'.");
            return;
        }
        let (Ok(population_id), Ok(generation)) =
            (params[0].parse::<u32>(), params[1].parse::<u32>())
        else {
            warn!("Population ID and generation must be numbers.");
            return;
        };
        match Evolution::load(
            &self.settings.genome_dir,
            population_id,
            generation,
            self.settings.genome,
        ) {
            Ok(population) => self.population = Some(population),
            Err(e) => warn!("Operation failed: {e}"),
        }
    }

    fn step_population(&mut self) {
        let Some(population) = self.population.as_mut() else {
            warn!("No generation available! Use 'gen_random_population' ('grp').");
            return;
        };
        if let Err(e) = population.step_population(&self.ctx) {
            warn!("Step failed: {e}");
        }
    }

    fn help(&self) {
        info!("Command list:");
        info!("  - 'quit' ('q'): Exit the application.");
        info!("  - 'load_dataset' ('ld') dataFilePath dataMagic labelFilePath labelMagic: Loads an IDX file pair, relative to the data directory.");
        info!("  - 'load_default_dataset' ('ldd'): Loads the MNIST dataset.");
        info!("  - 'gen_random_network' ('grn'): Generates a single genome and its network into the solo slots.");
        info!("  - 'train_network' ('tn') [batches] [batchStartingOffset]: Trains the solo network.");
        info!("  - 'crossval_train_network' ('ctn') [batches]: Cross-validated training of the solo genome across multiple cores.");
        info!("  - 'save_network' ('sn') / 'load_network' ('ln') popID [gen]: Persist or restore the solo genome.");
        info!("  - 'gen_random_population' ('grp'): Generates a population of genomes.");
        info!("  - 'train_population' ('tp') [maxGenerations]: Evolves the population; runs indefinitely when no limit is given.");
        info!("  - 'save_population' ('sp') / 'load_population' ('lp') popID gen: Persist or restore the population.");
        info!("  - 'step_population' ('step_p'): Runs the generation-incrementation code on the population slot.");
        info!("IMPORTANT! Populations are saved AFTER testing but BEFORE the next generation is generated; run 'step_p' after loading a population before further training.");
        info!("IMPORTANT! Separate commands with ' -> ' to queue them, eg. 'ldd -> grp -> tp 5 -> q'.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenomeParams;
    use std::io::Cursor;

    fn tiny_settings(dir: &std::path::Path) -> Settings {
        Settings {
            genome: GenomeParams { neuron_min: 10, neuron_max: 20, fanin_max: 256 },
            input_count: 4,
            output_count: 2,
            gen_width: 16,
            master_seed: Some(42),
            genome_dir: dir.join("genomes"),
            data_dir: dir.join("data"),
            ..Settings::default()
        }
    }

    #[test]
    fn queue_splits_commands_on_arrows() {
        let dir = tempfile::tempdir().unwrap();
        let mut console = Console::new(tiny_settings(dir.path()));
        console.enqueue("ldd -> grp -> tp 5 -> q");
        let queued: Vec<_> = console.queued().iter().cloned().collect();
        assert_eq!(queued.len(), 4);
        assert_eq!(queued[0].0, "ldd");
        assert_eq!(queued[2], ("tp".to_string(), vec!["5".to_string()]));
    }

    #[test]
    fn generate_save_and_reload_a_network() {
        let dir = tempfile::tempdir().unwrap();
        let mut console = Console::new(tiny_settings(dir.path()));
        let mut input = Cursor::new(Vec::<u8>::new());
        console.execute("grn", &[], &mut input);
        assert!(console.genome.is_some());
        let saved = console.genome.clone().unwrap();
        console.execute("sn", &[], &mut input);

        let mut fresh = Console::new(tiny_settings(dir.path()));
        let params = vec![
            saved.population_id().to_string(),
            saved.generation().to_string(),
        ];
        fresh.execute("ln", &params, &mut input);
        assert_eq!(fresh.genome, Some(saved));
    }

    #[test]
    fn training_without_a_dataset_only_warns() {
        let dir = tempfile::tempdir().unwrap();
        let mut console = Console::new(tiny_settings(dir.path()));
        let mut input = Cursor::new(Vec::<u8>::new());
        console.execute("tn", &[], &mut input);
        console.execute("tp", &[], &mut input);
        assert!(console.dataset.is_none());
    }

    #[test]
    fn quit_requires_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let mut console = Console::new(tiny_settings(dir.path()));
        let mut no = Cursor::new(b"n\n".to_vec());
        console.execute("q", &[], &mut no);
        assert!(!console.ordered_to_quit);
        let mut yes = Cursor::new(b"y\n".to_vec());
        console.execute("q", &[], &mut yes);
        assert!(console.ordered_to_quit);
    }
}
