//! Binary genome persistence. Fields are written little-endian in a fixed
//! order; a population file is a genome count followed by the genomes
//! back-to-back.

use std::io::{Read, Write};

use crate::config::GenomeParams;
use crate::errors::CbResult;
use crate::metrics::Metrics;

use super::{Chromosome, Genome};

impl Genome {
    pub fn write_to(&self, writer: &mut impl Write) -> CbResult<()> {
        write_u32(writer, self.population_id)?;
        write_u32(writer, self.generation)?;
        write_bool(writer, self.tested)?;
        write_u32(writer, self.rank)?;
        write_f32(writer, self.metrics.training_cost)?;
        write_f32(writer, self.metrics.training_ca_cost)?;
        write_f32(writer, self.metrics.training_accuracy)?;
        write_f32(writer, self.metrics.testing_cost)?;
        write_f32(writer, self.metrics.testing_ca_cost)?;
        write_f32(writer, self.metrics.testing_accuracy)?;
        write_u32(writer, self.input_count)?;
        write_u32(writer, self.output_count)?;
        write_u32(writer, self.lowest_output_nid)?;
        write_f32(writer, self.start_lr_exponent)?;
        write_f32(writer, self.lr_exponent_delta)?;

        write_u32(writer, self.chromosomes.len() as u32)?;
        for (&nid, chromosome) in &self.chromosomes {
            write_u32(writer, nid)?;
            write_f32(writer, chromosome.bias)?;
            write_bool(writer, chromosome.is_output)?;
            write_u32(writer, chromosome.weights.len() as u32)?;
            for (&source, &weight) in &chromosome.weights {
                write_u32(writer, source)?;
                write_f32(writer, weight)?;
            }
            write_u32(writer, chromosome.references.len() as u32)?;
            for &referrer in &chromosome.references {
                write_u32(writer, referrer)?;
            }
        }
        Ok(())
    }

    /// Reads a genome in the `write_to` layout and validates it before
    /// handing it back.
    pub fn read_from(reader: &mut impl Read, params: GenomeParams) -> CbResult<Genome> {
        let population_id = read_u32(reader)?;
        let generation = read_u32(reader)?;
        let tested = read_bool(reader)?;
        let rank = read_u32(reader)?;
        let metrics = Metrics {
            training_cost: read_f32(reader)?,
            training_ca_cost: read_f32(reader)?,
            training_accuracy: read_f32(reader)?,
            testing_cost: read_f32(reader)?,
            testing_ca_cost: read_f32(reader)?,
            testing_accuracy: read_f32(reader)?,
        };
        let input_count = read_u32(reader)?;
        let output_count = read_u32(reader)?;
        let lowest_output_nid = read_u32(reader)?;
        let start_lr_exponent = read_f32(reader)?;
        let lr_exponent_delta = read_f32(reader)?;

        let mut genome = Genome::new_blank(params, population_id, input_count, output_count, generation);
        genome.tested = tested;
        genome.rank = rank;
        genome.metrics = metrics;
        genome.lowest_output_nid = lowest_output_nid;
        genome.start_lr_exponent = start_lr_exponent;
        genome.lr_exponent_delta = lr_exponent_delta;

        let chromosome_count = read_u32(reader)?;
        for _ in 0..chromosome_count {
            let nid = read_u32(reader)?;
            let bias = read_f32(reader)?;
            let is_output = read_bool(reader)?;
            let mut chromosome = Chromosome::new(bias, is_output);
            let weight_count = read_u32(reader)?;
            for _ in 0..weight_count {
                let source = read_u32(reader)?;
                let weight = read_f32(reader)?;
                chromosome.weights.insert(source, weight);
            }
            let reference_count = read_u32(reader)?;
            for _ in 0..reference_count {
                chromosome.references.insert(read_u32(reader)?);
            }
            genome.chromosomes.insert(nid, chromosome);
        }

        genome.validate()?;
        Ok(genome)
    }
}

fn write_u32(writer: &mut impl Write, value: u32) -> CbResult<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_f32(writer: &mut impl Write, value: f32) -> CbResult<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_bool(writer: &mut impl Write, value: bool) -> CbResult<()> {
    writer.write_all(&[u8::from(value)])?;
    Ok(())
}

fn read_u32(reader: &mut impl Read) -> CbResult<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_f32(reader: &mut impl Read) -> CbResult<f32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(f32::from_le_bytes(bytes))
}

fn read_bool(reader: &mut impl Read) -> CbResult<bool> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(byte[0] != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn genome_round_trips_byte_exactly() {
        let params = GenomeParams { neuron_min: 10, neuron_max: 20, fanin_max: 256 };
        let ctx = Context::seeded(params, 42);
        let mut rng = ctx.child_rng();
        let mut genome = Genome::random(&ctx, &mut rng, 4242, 4, 2);
        genome.set_rank(3);
        genome.set_metrics(Metrics { testing_accuracy: 12.5, ..Metrics::default() });

        let mut buffer = Vec::new();
        genome.write_to(&mut buffer).unwrap();
        let back = Genome::read_from(&mut buffer.as_slice(), params).unwrap();
        assert_eq!(genome, back);

        // Serialising the reloaded genome reproduces the same bytes.
        let mut second = Vec::new();
        back.write_to(&mut second).unwrap();
        assert_eq!(buffer, second);
    }

    #[test]
    fn truncated_stream_is_an_io_error() {
        let params = GenomeParams { neuron_min: 10, neuron_max: 20, fanin_max: 256 };
        let ctx = Context::seeded(params, 43);
        let mut rng = ctx.child_rng();
        let genome = Genome::random(&ctx, &mut rng, 1, 4, 2);
        let mut buffer = Vec::new();
        genome.write_to(&mut buffer).unwrap();
        buffer.truncate(buffer.len() / 2);
        assert!(Genome::read_from(&mut buffer.as_slice(), params).is_err());
    }
}
