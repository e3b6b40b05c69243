use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Mutex;

use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use tracing::info;

use crate::errors::{CbError, CbResult};

/// One minibatch of samples, stored row-per-sample.
///
/// The `lock` serialises the training code path over this batch across the
/// fold networks that share it; it guards the batch, not any network.
pub struct Batch {
    pub inputs: Array2<f32>,
    pub targets: Array2<f32>,
    pub lock: Mutex<()>,
}

impl Batch {
    pub fn new(inputs: Array2<f32>, targets: Array2<f32>) -> Self {
        Self { inputs, targets, lock: Mutex::new(()) }
    }

    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One cross-validation fold: a run of whole minibatches.
pub struct Section {
    pub batches: Vec<Batch>,
}

/// A dataset pre-partitioned into equal cross-validation sections. Read-only
/// after construction.
pub struct Dataset {
    pub sections: Vec<Section>,
    input_count: usize,
    output_count: usize,
}

impl Dataset {
    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Total number of minibatches across every section.
    pub fn batch_count(&self) -> usize {
        self.sections.iter().map(|s| s.batches.len()).sum()
    }

    /// Reads an IDX image/label file pair (the MNIST container format) and
    /// partitions it into `crossval_count` equal sections of whole
    /// minibatches. Samples that do not fill a whole section are discarded.
    ///
    /// Pixels map to `0.1 + p·0.8/255` (exactly zero stays `0.0`); targets
    /// are 0.9 for the labelled class and 0.1 elsewhere.
    pub fn read_idx(
        data_path: &Path,
        data_magic: u32,
        label_path: &Path,
        label_magic: u32,
        crossval_count: usize,
        minibatch: usize,
        output_count: usize,
    ) -> CbResult<Dataset> {
        let mut data = BufReader::new(File::open(data_path)?);
        let mut labels = BufReader::new(File::open(label_path)?);

        let found_data_magic = read_be_u32(&mut data)?;
        if found_data_magic != data_magic {
            return Err(CbError::DatasetFormat(format!(
                "data file magic number {found_data_magic} does not match expected {data_magic}"
            )));
        }
        let found_label_magic = read_be_u32(&mut labels)?;
        if found_label_magic != label_magic {
            return Err(CbError::DatasetFormat(format!(
                "label file magic number {found_label_magic} does not match expected {label_magic}"
            )));
        }

        let image_count = read_be_u32(&mut data)? as usize;
        let rows = read_be_u32(&mut data)? as usize;
        let columns = read_be_u32(&mut data)? as usize;
        let label_count = read_be_u32(&mut labels)? as usize;

        info!(
            "Data file contains {image_count} images of {rows}x{columns}px; label file contains {label_count} labels."
        );
        if image_count != label_count {
            return Err(CbError::DatasetFormat(format!(
                "image/label count mismatch: {image_count} != {label_count}"
            )));
        }

        let pixels = rows * columns;
        let batches_total = image_count / minibatch;
        let batches_per_section = batches_total / crossval_count;
        if batches_per_section == 0 {
            return Err(CbError::DatasetFormat(format!(
                "{image_count} samples cannot fill {crossval_count} sections of {minibatch}-sample batches"
            )));
        }
        let leftovers = image_count - crossval_count * batches_per_section * minibatch;
        info!(
            "Partitioning into {crossval_count} sections of {batches_per_section} minibatches; {leftovers} samples left unused."
        );

        let mut sections = Vec::with_capacity(crossval_count);
        let mut pixel_row = vec![0u8; pixels];
        for si in 0..crossval_count {
            let mut batches = Vec::with_capacity(batches_per_section);
            for _ in 0..batches_per_section {
                let mut inputs = Array2::<f32>::zeros((minibatch, pixels));
                let mut targets = Array2::<f32>::from_elem((minibatch, output_count), 0.1);
                for s in 0..minibatch {
                    let mut label = [0u8; 1];
                    labels.read_exact(&mut label).map_err(|_| {
                        CbError::DatasetFormat("end of label file reached unexpectedly".into())
                    })?;
                    let label = label[0] as usize;
                    if label >= output_count {
                        return Err(CbError::DatasetFormat(format!(
                            "label {label} out of range for {output_count} outputs"
                        )));
                    }
                    targets[[s, label]] = 0.9;

                    data.read_exact(&mut pixel_row).map_err(|_| {
                        CbError::DatasetFormat("end of data file reached unexpectedly".into())
                    })?;
                    let mut all_empty = true;
                    for (p, &pixel) in pixel_row.iter().enumerate() {
                        if pixel != 0 {
                            all_empty = false;
                            inputs[[s, p]] = f32::from(pixel) * (0.8 / 255.0) + 0.1;
                        }
                    }
                    if all_empty {
                        return Err(CbError::DatasetFormat(
                            "image detected to be entirely empty".into(),
                        ));
                    }
                }
                batches.push(Batch::new(inputs, targets));
            }
            sections.push(Section { batches });
            info!("Completed cross-validation section {}.", si + 1);
        }

        Ok(Dataset { sections, input_count: pixels, output_count })
    }

    /// Random dataset: inputs uniform over the pixel range, labels uniform
    /// over the classes. Used by tests and dry runs.
    pub fn synthetic(
        crossval_count: usize,
        batches_per_section: usize,
        minibatch: usize,
        input_count: usize,
        output_count: usize,
        rng: &mut impl Rng,
    ) -> Dataset {
        Self::build(crossval_count, batches_per_section, minibatch, input_count, output_count, |mb, ic, rng| {
            Array2::random_using((mb, ic), Uniform::new(0.1, 0.9), rng)
        }, rng)
    }

    /// All-zero inputs with cycling labels: the cheapest well-formed dataset.
    pub fn blank(
        crossval_count: usize,
        batches_per_section: usize,
        minibatch: usize,
        input_count: usize,
        output_count: usize,
    ) -> Dataset {
        let mut rng = rand::thread_rng();
        Self::build(crossval_count, batches_per_section, minibatch, input_count, output_count, |mb, ic, _| {
            Array2::zeros((mb, ic))
        }, &mut rng)
    }

    fn build<R: Rng>(
        crossval_count: usize,
        batches_per_section: usize,
        minibatch: usize,
        input_count: usize,
        output_count: usize,
        mut make_inputs: impl FnMut(usize, usize, &mut R) -> Array2<f32>,
        rng: &mut R,
    ) -> Dataset {
        let mut label = 0usize;
        let sections = (0..crossval_count)
            .map(|_| {
                let batches = (0..batches_per_section)
                    .map(|_| {
                        let inputs = make_inputs(minibatch, input_count, rng);
                        let mut targets = Array2::from_elem((minibatch, output_count), 0.1);
                        for s in 0..minibatch {
                            targets[[s, label % output_count]] = 0.9;
                            label += 1;
                        }
                        Batch::new(inputs, targets)
                    })
                    .collect();
                Section { batches }
            })
            .collect();
        Dataset { sections, input_count, output_count }
    }
}

fn read_be_u32(reader: &mut impl Read) -> CbResult<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::io::Write;

    fn write_idx_pair(dir: &Path, images: usize, side: usize) -> (std::path::PathBuf, std::path::PathBuf) {
        let data_path = dir.join("images.idx3-ubyte");
        let label_path = dir.join("labels.idx1-ubyte");

        let mut data = File::create(&data_path).unwrap();
        data.write_all(&2051u32.to_be_bytes()).unwrap();
        data.write_all(&(images as u32).to_be_bytes()).unwrap();
        data.write_all(&(side as u32).to_be_bytes()).unwrap();
        data.write_all(&(side as u32).to_be_bytes()).unwrap();
        for i in 0..images * side * side {
            // Never all-zero: every image carries at least one lit pixel.
            data.write_all(&[(i % 200) as u8 + 1]).unwrap();
        }

        let mut labels = File::create(&label_path).unwrap();
        labels.write_all(&2049u32.to_be_bytes()).unwrap();
        labels.write_all(&(images as u32).to_be_bytes()).unwrap();
        for i in 0..images {
            labels.write_all(&[(i % 10) as u8]).unwrap();
        }
        (data_path, label_path)
    }

    #[test]
    fn reads_idx_pair_and_partitions() {
        let dir = tempfile::tempdir().unwrap();
        // 2 sections x 2 batches x 5 samples, plus 3 leftovers to discard.
        let (data_path, label_path) = write_idx_pair(dir.path(), 23, 4);
        let dataset =
            Dataset::read_idx(&data_path, 2051, &label_path, 2049, 2, 5, 10).unwrap();
        assert_eq!(dataset.section_count(), 2);
        assert_eq!(dataset.sections[0].batches.len(), 2);
        assert_eq!(dataset.input_count(), 16);
        let batch = &dataset.sections[0].batches[0];
        assert_eq!(batch.len(), 5);
        // Pixel 1 maps into the 0.1..0.9 band.
        let v = batch.inputs[[0, 0]];
        assert!(v > 0.1 - 1e-6 && v < 0.9 + 1e-6);
        // Label 0 sample: first target hot, rest cold.
        assert_eq!(batch.targets[[0, 0]], 0.9);
        assert_eq!(batch.targets[[0, 1]], 0.1);
    }

    #[test]
    fn rejects_wrong_magic_number() {
        let dir = tempfile::tempdir().unwrap();
        let (data_path, label_path) = write_idx_pair(dir.path(), 10, 2);
        let err = Dataset::read_idx(&data_path, 9999, &label_path, 2049, 2, 5, 10);
        assert!(matches!(err, Err(CbError::DatasetFormat(_))));
    }

    #[test]
    fn synthetic_dataset_has_requested_shape() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let dataset = Dataset::synthetic(10, 3, 100, 4, 2, &mut rng);
        assert_eq!(dataset.section_count(), 10);
        assert_eq!(dataset.batch_count(), 30);
        assert_eq!(dataset.sections[9].batches[2].targets.ncols(), 2);
    }
}
