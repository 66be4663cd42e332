//! Recorded acquisition containers.
//!
//! A master file is a hierarchical container: metadata lives in small scalar
//! datasets scattered over groups such as `/entry/instrument/detector`, and the
//! frames live in 3-D blocks (frame × height × width) under `/entry/data`, one
//! entry per physical data file.
//!
//! Two seams keep the rest of the crate independent of the on-disk format:
//!
//! - [`DatasetSource`]: an open container. Values are decoded into
//!   [`MetadataValue`] at this boundary, never guessed by callers.
//! - [`DatasetOpener`]: turns a path into an open source. The HDF5 opener lives
//!   behind the `storage_hdf5` feature; [`memory::MemoryCatalog`] serves
//!   in-memory containers.
//!
//! [`MetadataIndex`] is built once per load from a source and answers lookups
//! by short key name, independent of the full path.

#[cfg(feature = "storage_hdf5")]
pub mod hdf5;
pub mod memory;
pub mod pattern;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{DetectorError, DetectorResult};

/// Path of the group holding one link per data file.
pub const DATA_GROUP: &str = "entry/data";
/// Detector translation vector (three distances).
pub const TRANSLATION_PATH: &str = "entry/instrument/detector/geometry/translation/distances";
/// Per-image omega angles; only the first is used.
pub const OMEGA_PATH: &str = "entry/sample/goniometer/omega";

/// Vector-valued entries captured by the index alongside the scalars.
const VECTOR_PATHS: [&str; 2] = [TRANSLATION_PATH, OMEGA_PATH];

/// A decoded scalar read from a container entry.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// String dataset, fixed or variable length.
    Text(String),
    /// Any integer dataset.
    Integer(i64),
    /// Any floating-point dataset.
    Real(f64),
    /// Missing path, group or multi-element array.
    Absent,
}

impl MetadataValue {
    /// `true` for [`MetadataValue::Absent`].
    pub fn is_absent(&self) -> bool {
        matches!(self, MetadataValue::Absent)
    }

    /// Numeric value; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Integer(v) => Some(*v as f64),
            MetadataValue::Real(v) => Some(*v),
            MetadataValue::Text(s) => s.trim().parse().ok(),
            MetadataValue::Absent => None,
        }
    }

    /// Integer value; reals only when they have no fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Integer(v) => Some(*v),
            MetadataValue::Real(v) if v.fract() == 0.0 => Some(*v as i64),
            MetadataValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text value, or the number rendered as text.
    pub fn as_text(&self) -> Option<String> {
        match self {
            MetadataValue::Text(s) => Some(s.clone()),
            MetadataValue::Integer(v) => Some(v.to_string()),
            MetadataValue::Real(v) => Some(v.to_string()),
            MetadataValue::Absent => None,
        }
    }

    /// Truthiness: zero, empty text and absence are all `false`.
    pub fn truthy(&self) -> bool {
        match self {
            MetadataValue::Integer(v) => *v != 0,
            MetadataValue::Real(v) => *v != 0.0,
            MetadataValue::Text(s) => !s.is_empty(),
            MetadataValue::Absent => false,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Text(s) => write!(f, "{s}"),
            MetadataValue::Integer(v) => write!(f, "{v}"),
            MetadataValue::Real(v) => write!(f, "{v}"),
            MetadataValue::Absent => write!(f, "<absent>"),
        }
    }
}

/// Element type of a frame block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelType {
    /// 16-bit unsigned, tag 69 on the wire.
    U16,
    /// 32-bit unsigned, tag 70 on the wire.
    U32,
}

impl PixelType {
    /// Bytes per element.
    pub fn element_size(self) -> usize {
        match self {
            PixelType::U16 => 2,
            PixelType::U32 => 4,
        }
    }

    /// Name as published in the start message (`image_dtype`).
    pub fn dtype_name(self) -> &'static str {
        match self {
            PixelType::U16 => "uint16",
            PixelType::U32 => "uint32",
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dtype_name())
    }
}

impl FromStr for PixelType {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uint16" | "u16" | "<u2" => Ok(PixelType::U16),
            "uint32" | "u32" | "<u4" => Ok(PixelType::U32),
            other => Err(DetectorError::UnsupportedPixelType(other.to_string())),
        }
    }
}

/// Pixel storage of one block. Never mixes element types.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    /// 16-bit pixels.
    U16(Vec<u16>),
    /// 32-bit pixels.
    U32(Vec<u32>),
}

impl PixelBuffer {
    /// Element type of the buffer.
    pub fn pixel_type(&self) -> PixelType {
        match self {
            PixelBuffer::U16(_) => PixelType::U16,
            PixelBuffer::U32(_) => PixelType::U32,
        }
    }

    /// Pixel count.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U16(v) => v.len(),
            PixelBuffer::U32(v) => v.len(),
        }
    }

    /// `true` when the buffer holds no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One data file read fully into memory: `frames × height × width` pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBlock {
    /// Number of frames.
    pub frames: usize,
    /// Rows per frame.
    pub height: usize,
    /// Columns per frame.
    pub width: usize,
    /// Frame-major pixels.
    pub pixels: PixelBuffer,
}

impl FrameBlock {
    /// Builds a block, checking the buffer length against the shape.
    pub fn new(frames: usize, height: usize, width: usize, pixels: PixelBuffer) -> DetectorResult<Self> {
        let expected = frames * height * width;
        if pixels.len() != expected {
            return Err(DetectorError::Dataset(format!(
                "frame block has {} pixels, shape {frames}x{height}x{width} needs {expected}",
                pixels.len()
            )));
        }
        Ok(Self {
            frames,
            height,
            width,
            pixels,
        })
    }

    /// Element type of the pixels.
    pub fn pixel_type(&self) -> PixelType {
        self.pixels.pixel_type()
    }

    /// `(height, width)` of a single frame.
    pub fn frame_shape(&self) -> [usize; 2] {
        [self.height, self.width]
    }

    /// Little-endian bytes of frame `index`, as a data consumer reads them.
    pub fn frame_bytes(&self, index: usize) -> Option<Vec<u8>> {
        if index >= self.frames {
            return None;
        }
        let len = self.height * self.width;
        let start = index * len;
        let bytes = match &self.pixels {
            PixelBuffer::U16(v) => v
                .get(start..start + len)?
                .iter()
                .flat_map(|p| p.to_le_bytes())
                .collect(),
            PixelBuffer::U32(v) => v
                .get(start..start + len)?
                .iter()
                .flat_map(|p| p.to_le_bytes())
                .collect(),
        };
        Some(bytes)
    }
}

/// An open, self-describing acquisition container.
///
/// Paths are `/`-separated and relative to the root (no leading slash).
pub trait DatasetSource {
    /// Every path in the container, groups included, in traversal order.
    fn entries(&self) -> DetectorResult<Vec<String>>;

    /// Scalar value stored at `path`. Groups, missing paths and
    /// multi-element arrays are [`MetadataValue::Absent`].
    fn read_value(&self, path: &str) -> DetectorResult<MetadataValue>;

    /// Numeric 1-D contents of `path`, if it exists and is numeric.
    fn read_vector(&self, path: &str) -> DetectorResult<Option<Vec<f64>>>;

    /// Names of the data-file entries under [`DATA_GROUP`], in name order.
    fn data_file_names(&self) -> DetectorResult<Vec<String>>;

    /// Reads one data file fully into memory.
    fn read_frames(&self, name: &str) -> DetectorResult<FrameBlock>;
}

/// Opens containers by path.
pub trait DatasetOpener: Send + Sync {
    /// Opens the container at `path`.
    fn open(&self, path: &Path) -> DetectorResult<Box<dyn DatasetSource>>;
}

/// Opener used when the crate is built without HDF5 support.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hdf5Unavailable;

impl DatasetOpener for Hdf5Unavailable {
    fn open(&self, _path: &Path) -> DetectorResult<Box<dyn DatasetSource>> {
        Err(DetectorError::FeatureNotEnabled("storage_hdf5".into()))
    }
}

/// The default opener for master files on disk.
pub fn default_opener() -> Box<dyn DatasetOpener> {
    #[cfg(feature = "storage_hdf5")]
    {
        Box::new(hdf5::Hdf5Opener)
    }
    #[cfg(not(feature = "storage_hdf5"))]
    {
        Box::new(Hdf5Unavailable)
    }
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Short-key view over the metadata of one container.
///
/// Every full path is split on `/`; a key resolves to the value of the first
/// path (in traversal order) that has the key as one of its segments. Keys are
/// assumed unique across the container; duplicates are not detected and the
/// first match wins.
#[derive(Debug, Clone, Default)]
pub struct MetadataIndex {
    entries: Vec<String>,
    by_key: HashMap<String, MetadataValue>,
    by_path: HashMap<String, MetadataValue>,
    vectors: HashMap<String, Vec<f64>>,
}

impl MetadataIndex {
    /// Reads every entry of `source` once and indexes it.
    pub fn build(source: &dyn DatasetSource) -> DetectorResult<Self> {
        let entries = source.entries()?;
        let mut by_key: HashMap<String, MetadataValue> = HashMap::new();
        let mut by_path = HashMap::with_capacity(entries.len());

        for entry in &entries {
            let value = source.read_value(entry)?;
            for segment in entry.split('/') {
                by_key
                    .entry(segment.to_string())
                    .or_insert_with(|| value.clone());
            }
            by_path.insert(entry.clone(), value);
        }

        let mut vectors = HashMap::new();
        for path in VECTOR_PATHS {
            if let Some(values) = source.read_vector(path)? {
                vectors.insert(path.to_string(), values);
            }
        }

        tracing::debug!(entries = entries.len(), keys = by_key.len(), "Indexed master file");

        Ok(Self {
            entries,
            by_key,
            by_path,
            vectors,
        })
    }

    /// Flat list of every path, in traversal order.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Value of the first entry whose path contains `key` as a segment.
    pub fn resolve(&self, key: &str) -> MetadataValue {
        self.by_key.get(key).cloned().unwrap_or(MetadataValue::Absent)
    }

    /// Value stored at an exact path (leading `/` optional).
    pub fn at_path(&self, path: &str) -> MetadataValue {
        self.by_path
            .get(normalize(path))
            .cloned()
            .unwrap_or(MetadataValue::Absent)
    }

    /// One of the captured vector entries.
    pub fn vector(&self, path: &str) -> Option<&[f64]> {
        self.vectors.get(normalize(path)).map(Vec::as_slice)
    }
}
