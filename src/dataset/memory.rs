//! In-memory containers with master-file path semantics.
//!
//! [`MemoryDataset`] stores values, vectors and frame blocks by full path and
//! derives the intermediate groups the way a hierarchical file would list
//! them. [`MemoryCatalog`] maps virtual paths to datasets so the stream engine
//! can load them through the same [`DatasetOpener`] seam as files on disk.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::pattern::generate_diffraction_pattern;
use super::{
    DatasetOpener, DatasetSource, FrameBlock, MetadataValue, PixelBuffer, PixelType, DATA_GROUP,
    OMEGA_PATH, TRANSLATION_PATH,
};
use crate::error::{DetectorError, DetectorResult};

#[derive(Debug, Clone)]
enum Node {
    Value(MetadataValue),
    Vector(Vec<f64>),
    Frames(FrameBlock),
}

/// A container held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDataset {
    nodes: BTreeMap<String, Node>,
}

impl MemoryDataset {
    /// Empty container.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &str) -> String {
        path.trim_start_matches('/').to_string()
    }

    /// Stores a scalar at `path`, replacing what was there.
    pub fn with_value(mut self, path: &str, value: MetadataValue) -> Self {
        self.nodes.insert(Self::key(path), Node::Value(value));
        self
    }

    /// Stores a 1-D numeric array at `path`.
    pub fn with_vector(mut self, path: &str, values: Vec<f64>) -> Self {
        self.nodes.insert(Self::key(path), Node::Vector(values));
        self
    }

    /// Adds a data file under `/entry/data/<name>`.
    pub fn with_data_file(mut self, name: &str, block: FrameBlock) -> Self {
        self.nodes
            .insert(format!("{DATA_GROUP}/{name}"), Node::Frames(block));
        self
    }

    /// Removes an entry, e.g. to simulate an incomplete master file.
    pub fn without(mut self, path: &str) -> Self {
        self.nodes.remove(&Self::key(path));
        self
    }
}

impl DatasetSource for MemoryDataset {
    fn entries(&self) -> DetectorResult<Vec<String>> {
        let mut all = BTreeSet::new();
        for path in self.nodes.keys() {
            let mut prefix = String::new();
            for segment in path.split('/') {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(segment);
                all.insert(prefix.clone());
            }
        }
        // Pre-order traversal with members in name order
        let mut entries: Vec<String> = all.into_iter().collect();
        entries.sort_by(|a, b| a.split('/').cmp(b.split('/')));
        Ok(entries)
    }

    fn read_value(&self, path: &str) -> DetectorResult<MetadataValue> {
        Ok(match self.nodes.get(&Self::key(path)) {
            Some(Node::Value(value)) => value.clone(),
            Some(Node::Vector(values)) if values.len() == 1 => MetadataValue::Real(values[0]),
            _ => MetadataValue::Absent,
        })
    }

    fn read_vector(&self, path: &str) -> DetectorResult<Option<Vec<f64>>> {
        Ok(match self.nodes.get(&Self::key(path)) {
            Some(Node::Vector(values)) => Some(values.clone()),
            Some(Node::Value(value)) => match value {
                MetadataValue::Integer(_) | MetadataValue::Real(_) => value.as_f64().map(|v| vec![v]),
                _ => None,
            },
            _ => None,
        })
    }

    fn data_file_names(&self) -> DetectorResult<Vec<String>> {
        let prefix = format!("{DATA_GROUP}/");
        Ok(self
            .nodes
            .iter()
            .filter_map(|(path, node)| match node {
                Node::Frames(_) => path
                    .strip_prefix(&prefix)
                    .filter(|name| !name.contains('/'))
                    .map(str::to_string),
                _ => None,
            })
            .collect())
    }

    fn read_frames(&self, name: &str) -> DetectorResult<FrameBlock> {
        match self.nodes.get(&format!("{DATA_GROUP}/{name}")) {
            Some(Node::Frames(block)) => Ok(block.clone()),
            _ => Err(DetectorError::Dataset(format!(
                "no data file '{name}' under /{DATA_GROUP}"
            ))),
        }
    }
}

impl DatasetSource for Arc<MemoryDataset> {
    fn entries(&self) -> DetectorResult<Vec<String>> {
        self.as_ref().entries()
    }

    fn read_value(&self, path: &str) -> DetectorResult<MetadataValue> {
        self.as_ref().read_value(path)
    }

    fn read_vector(&self, path: &str) -> DetectorResult<Option<Vec<f64>>> {
        self.as_ref().read_vector(path)
    }

    fn data_file_names(&self) -> DetectorResult<Vec<String>> {
        self.as_ref().data_file_names()
    }

    fn read_frames(&self, name: &str) -> DetectorResult<FrameBlock> {
        self.as_ref().read_frames(name)
    }
}

/// Virtual paths mapped to in-memory datasets.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    datasets: HashMap<PathBuf, Arc<MemoryDataset>>,
}

impl MemoryCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `dataset` under `path`.
    pub fn with_dataset(mut self, path: impl Into<PathBuf>, dataset: MemoryDataset) -> Self {
        self.datasets.insert(path.into(), Arc::new(dataset));
        self
    }
}

impl DatasetOpener for MemoryCatalog {
    fn open(&self, path: &Path) -> DetectorResult<Box<dyn DatasetSource>> {
        self.datasets
            .get(path)
            .map(|dataset| Box::new(Arc::clone(dataset)) as Box<dyn DatasetSource>)
            .ok_or_else(|| DetectorError::Dataset(format!("unknown dataset {}", path.display())))
    }
}

/// Shape of a simulated acquisition.
///
/// [`SimulatedAcquisition::build`] produces a master file with the entries a
/// real EIGER2 master carries, and one data file per entry of
/// `frames_per_file`.
#[derive(Debug, Clone)]
pub struct SimulatedAcquisition {
    /// Frame width in pixels.
    pub width: usize,
    /// Frame height in pixels.
    pub height: usize,
    /// Frames in each data file; one entry per file.
    pub frames_per_file: Vec<usize>,
    /// Element type of every data file.
    pub pixel_type: PixelType,
    /// Recorded trigger count.
    pub ntrigger: i64,
    /// Recorded images per trigger.
    pub nimages: i64,
    /// Recorded saturation value; `None` leaves the entry out.
    pub saturation_value: Option<i64>,
}

impl Default for SimulatedAcquisition {
    fn default() -> Self {
        Self {
            width: 64,
            height: 64,
            frames_per_file: vec![4],
            pixel_type: PixelType::U32,
            ntrigger: 1,
            nimages: 4,
            saturation_value: Some(126_634),
        }
    }
}

impl SimulatedAcquisition {
    /// Single data file of `frames` frames; `nimages` matches `frames`.
    pub fn new(width: usize, height: usize, frames: usize, pixel_type: PixelType) -> Self {
        Self {
            width,
            height,
            frames_per_file: vec![frames],
            pixel_type,
            nimages: frames as i64,
            ..Default::default()
        }
    }

    /// Writes the master entries and the data files.
    pub fn build(&self) -> DetectorResult<MemoryDataset> {
        let det = "entry/instrument/detector";
        let specific = "entry/instrument/detector/detectorSpecific";
        let total_frames: usize = self.frames_per_file.iter().sum();
        let max_count = match self.pixel_type {
            PixelType::U16 => u16::MAX as u32,
            PixelType::U32 => self.saturation_value.unwrap_or(126_634).max(1) as u32,
        };

        let mut dataset = MemoryDataset::new()
            .with_value(
                "entry/instrument/detector/detectorSpecific/data_collection_date",
                MetadataValue::Text("2024-03-12T09:41:07.061+00:00".into()),
            )
            .with_value(&format!("{det}/beam_center_x"), MetadataValue::Real(self.width as f64 / 2.0))
            .with_value(&format!("{det}/beam_center_y"), MetadataValue::Real(self.height as f64 / 2.0))
            .with_value(&format!("{det}/count_time"), MetadataValue::Real(0.0109))
            .with_value(&format!("{det}/countrate_correction_applied"), MetadataValue::Integer(1))
            .with_value(&format!("{det}/description"), MetadataValue::Text("Dectris EIGER2 Si 16M".into()))
            .with_value(&format!("{det}/detector_number"), MetadataValue::Text("E-32-0130".into()))
            .with_value(&format!("{det}/detector_readout_time"), MetadataValue::Real(1e-7))
            .with_value(&format!("{det}/bit_depth_image"), MetadataValue::Integer(8 * self.pixel_type.element_size() as i64))
            .with_value(&format!("{det}/bit_depth_readout"), MetadataValue::Integer(16))
            .with_value(&format!("{det}/flatfield_correction_applied"), MetadataValue::Integer(1))
            .with_value(&format!("{det}/frame_time"), MetadataValue::Real(0.011))
            .with_value(&format!("{det}/pixel_mask_applied"), MetadataValue::Integer(1))
            .with_value(&format!("{det}/x_pixel_size"), MetadataValue::Real(7.5e-5))
            .with_value(&format!("{det}/y_pixel_size"), MetadataValue::Real(7.5e-5))
            .with_value(&format!("{det}/sensor_material"), MetadataValue::Text("Si".into()))
            .with_value(&format!("{det}/sensor_thickness"), MetadataValue::Real(4.5e-4))
            .with_value(&format!("{det}/threshold_energy"), MetadataValue::Real(6350.0))
            .with_value(&format!("{det}/virtual_pixel_correction_applied"), MetadataValue::Integer(1))
            .with_value(&format!("{specific}/compression"), MetadataValue::Text("bslz4".into()))
            .with_value(&format!("{specific}/countrate_correction_count_cutoff"), MetadataValue::Integer(126_634))
            .with_value(&format!("{specific}/nimages"), MetadataValue::Integer(self.nimages))
            .with_value(&format!("{specific}/ntrigger"), MetadataValue::Integer(self.ntrigger))
            .with_value(&format!("{specific}/photon_energy"), MetadataValue::Real(12700.0))
            .with_value(&format!("{specific}/x_pixels_in_detector"), MetadataValue::Integer(self.width as i64))
            .with_value(&format!("{specific}/y_pixels_in_detector"), MetadataValue::Integer(self.height as i64))
            .with_value("entry/instrument/beam/incident_wavelength", MetadataValue::Real(0.9763))
            .with_value("entry/sample/goniometer/omega_range_average", MetadataValue::Real(0.1))
            .with_vector(TRANSLATION_PATH, vec![0.0, 0.0, -0.298])
            .with_vector(
                OMEGA_PATH,
                (0..total_frames).map(|i| 10.0 + 0.1 * i as f64).collect(),
            );

        if let Some(saturation) = self.saturation_value {
            dataset = dataset.with_value(&format!("{det}/saturation_value"), MetadataValue::Integer(saturation));
        }

        let mut frame_num = 0u64;
        for (file_idx, &frames) in self.frames_per_file.iter().enumerate() {
            let mut pixels: Vec<u32> = Vec::with_capacity(frames * self.width * self.height);
            for _ in 0..frames {
                pixels.extend(generate_diffraction_pattern(self.width, self.height, frame_num, max_count));
                frame_num += 1;
            }
            let buffer = match self.pixel_type {
                PixelType::U16 => PixelBuffer::U16(pixels.into_iter().map(|p| p.min(u16::MAX as u32) as u16).collect()),
                PixelType::U32 => PixelBuffer::U32(pixels),
            };
            let block = FrameBlock::new(frames, self.height, self.width, buffer)?;
            dataset = dataset.with_data_file(&format!("data_{:06}", file_idx + 1), block);
        }

        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_include_intermediate_groups_in_preorder() {
        let dataset = MemoryDataset::new()
            .with_value("entry/a-c", MetadataValue::Integer(1))
            .with_value("entry/a/b", MetadataValue::Integer(2));
        let entries = dataset.entries().unwrap();
        assert_eq!(entries, vec!["entry", "entry/a", "entry/a/b", "entry/a-c"]);
    }

    #[test]
    fn simulated_acquisition_lists_data_files_in_order() {
        let acquisition = SimulatedAcquisition {
            frames_per_file: vec![2, 3],
            ..SimulatedAcquisition::new(8, 4, 2, PixelType::U16)
        };
        let dataset = acquisition.build().unwrap();
        assert_eq!(
            dataset.data_file_names().unwrap(),
            vec!["data_000001".to_string(), "data_000002".to_string()]
        );
        let block = dataset.read_frames("data_000002").unwrap();
        assert_eq!(block.frames, 3);
        assert_eq!(block.frame_shape(), [4, 8]);
        assert_eq!(block.pixel_type(), PixelType::U16);
    }

    #[test]
    fn multi_element_vectors_are_not_scalars() {
        let dataset = SimulatedAcquisition::default().build().unwrap();
        assert!(dataset.read_value(TRANSLATION_PATH).unwrap().is_absent());
        assert_eq!(dataset.read_vector(TRANSLATION_PATH).unwrap().unwrap().len(), 3);
    }

    #[test]
    fn catalog_rejects_unknown_paths() {
        let catalog = MemoryCatalog::new().with_dataset("/data/a_master.h5", MemoryDataset::new());
        assert!(catalog.open(Path::new("/data/a_master.h5")).is_ok());
        let err = catalog.open(Path::new("/data/b_master.h5")).err().unwrap();
        assert!(matches!(err, DetectorError::Dataset(_)));
    }
}
