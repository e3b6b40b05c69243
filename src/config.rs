use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{CbError, CbResult};
use crate::genome::mutate::{DEFAULT_MUTATION_WEIGHTS, MUTATION_KIND_COUNT};
use crate::squash::{FastSigmoid, Squasher};

// Evolutionary parameters, matched to the MNIST reference task.
pub const NEURON_COUNT_MIN: u32 = 1000;
pub const NEURON_COUNT_MAX: u32 = 10_000;
pub const NEURON_CONNECTION_COUNT_MAX: u32 = 256;

pub const MINIBATCH_COUNT: usize = 100;
pub const CROSSVAL_COUNT: usize = 10;
pub const OUTPUT_COUNT: u32 = 10;
pub const STANDARD_TRAINING_BATCH_COUNT: u32 = 1260;

/// Population width. Must be a multiple of 16.
pub const GEN_WIDTH: usize = 16;
/// Genomes under cross-validated training at once. Each one runs
/// `CROSSVAL_COUNT` fold workers of its own.
pub const CONCURRENT_GENOMES: usize = 2;

/// Length of the rolling per-batch metric buffers.
pub const METRIC_BUFFER_LEN: usize = 100;

pub const IDX_DATA_MAGIC: u32 = 2051;
pub const IDX_LABEL_MAGIC: u32 = 2049;

/// Structural bounds a genome must respect. Carried by value inside every
/// genome so tests can shrink the population of neurons.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenomeParams {
    pub neuron_min: u32,
    pub neuron_max: u32,
    pub fanin_max: u32,
}

impl GenomeParams {
    /// Highest NID (exclusive) a freshly generated neuron may occupy.
    pub fn nid_ceiling(&self) -> u32 {
        self.neuron_max * 8
    }
}

impl Default for GenomeParams {
    fn default() -> Self {
        Self {
            neuron_min: NEURON_COUNT_MIN,
            neuron_max: NEURON_COUNT_MAX,
            fanin_max: NEURON_CONNECTION_COUNT_MAX,
        }
    }
}

/// Run configuration for the binary. Serialised as JSON; every field has a
/// default so a partial (or absent) file works.
#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub genome: GenomeParams,
    pub gen_width: usize,
    pub concurrent_genomes: usize,
    pub crossval_count: usize,
    pub minibatch: usize,
    pub standard_batch_count: u32,
    pub input_count: u32,
    pub output_count: u32,
    pub mutation_weights: [u32; MUTATION_KIND_COUNT],
    pub data_dir: PathBuf,
    pub genome_dir: PathBuf,
    /// Fixed master seed for reproducible runs; `None` seeds from entropy.
    pub master_seed: Option<u64>,
    pub squasher: Box<dyn Squasher>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            genome: GenomeParams::default(),
            gen_width: GEN_WIDTH,
            concurrent_genomes: CONCURRENT_GENOMES,
            crossval_count: CROSSVAL_COUNT,
            minibatch: MINIBATCH_COUNT,
            standard_batch_count: STANDARD_TRAINING_BATCH_COUNT,
            input_count: 28 * 28,
            output_count: OUTPUT_COUNT,
            mutation_weights: DEFAULT_MUTATION_WEIGHTS,
            data_dir: PathBuf::from("data"),
            genome_dir: PathBuf::from("genomes"),
            master_seed: None,
            squasher: Box::new(FastSigmoid),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> CbResult<Settings> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| CbError::SerializationError(e.to_string()))
    }

    /// Loads settings, falling back to the defaults when the file is absent
    /// or malformed (malformed files are reported, not fatal).
    pub fn load_or_default(path: &Path) -> Settings {
        if !path.exists() {
            return Settings::default();
        }
        match Settings::load(path) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to read settings file '{}': {e}. Using defaults.", path.display());
                Settings::default()
            }
        }
    }
}
