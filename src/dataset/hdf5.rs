//! HDF5 master-file reader.
//!
//! Master files written by the detector keep every metadata field in a small
//! dataset and reference the frame data through external links under
//! `/entry/data`. The HDF5 library follows those links transparently, so the
//! data files must sit next to the master file.

use std::path::{Path, PathBuf};

use hdf5::types::{FixedAscii, FixedUnicode, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Dataset, File, Group};

use super::{DatasetOpener, DatasetSource, FrameBlock, MetadataValue, PixelBuffer, DATA_GROUP};
use crate::error::{DetectorError, DetectorResult};

/// Opens master files from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hdf5Opener;

impl DatasetOpener for Hdf5Opener {
    fn open(&self, path: &Path) -> DetectorResult<Box<dyn DatasetSource>> {
        Ok(Box::new(Hdf5Dataset::open(path)?))
    }
}

/// An open master file. Closed when dropped.
pub struct Hdf5Dataset {
    path: PathBuf,
    file: File,
}

impl Hdf5Dataset {
    /// Opens `path` read-only.
    pub fn open(path: &Path) -> DetectorResult<Self> {
        let file = File::open(path)
            .map_err(|e| DetectorError::Dataset(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn visit(group: &Group, prefix: &str, out: &mut Vec<String>) -> DetectorResult<()> {
        let mut names = group.member_names()?;
        names.sort();
        for name in names {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            out.push(path.clone());
            // Only groups are descended into; datasets and external links are leaves
            if let Ok(child) = group.group(&name) {
                Self::visit(&child, &path, out)?;
            }
        }
        Ok(())
    }

    fn dataset(&self, path: &str) -> Option<Dataset> {
        self.file.dataset(path.trim_start_matches('/')).ok()
    }
}

fn first<T>(values: Vec<T>) -> Option<T> {
    values.into_iter().next()
}

fn read_scalar(dataset: &Dataset) -> DetectorResult<MetadataValue> {
    if dataset.size() != 1 {
        return Ok(MetadataValue::Absent);
    }
    let descriptor = dataset.dtype()?.to_descriptor()?;
    let value = match descriptor {
        TypeDescriptor::Integer(_) => first(dataset.read_raw::<i64>()?).map(MetadataValue::Integer),
        TypeDescriptor::Boolean => first(dataset.read_raw::<bool>()?)
            .map(|b| MetadataValue::Integer(i64::from(b))),
        TypeDescriptor::Unsigned(_) => first(dataset.read_raw::<u64>()?)
            .map(|v| MetadataValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))),
        TypeDescriptor::Float(_) => first(dataset.read_raw::<f64>()?).map(MetadataValue::Real),
        TypeDescriptor::VarLenUnicode => first(dataset.read_raw::<VarLenUnicode>()?)
            .map(|s| MetadataValue::Text(s.as_str().to_string())),
        TypeDescriptor::VarLenAscii => first(dataset.read_raw::<VarLenAscii>()?)
            .map(|s| MetadataValue::Text(s.as_str().to_string())),
        TypeDescriptor::FixedAscii(_) => first(dataset.read_raw::<FixedAscii<1024>>()?)
            .map(|s| MetadataValue::Text(s.as_str().to_string())),
        TypeDescriptor::FixedUnicode(_) => first(dataset.read_raw::<FixedUnicode<1024>>()?)
            .map(|s| MetadataValue::Text(s.as_str().to_string())),
        _ => None,
    };
    Ok(value.unwrap_or(MetadataValue::Absent))
}

impl DatasetSource for Hdf5Dataset {
    fn entries(&self) -> DetectorResult<Vec<String>> {
        let mut entries = Vec::new();
        let root = self.file.group("/")?;
        Self::visit(&root, "", &mut entries)?;
        Ok(entries)
    }

    fn read_value(&self, path: &str) -> DetectorResult<MetadataValue> {
        match self.dataset(path) {
            Some(dataset) => read_scalar(&dataset),
            None => Ok(MetadataValue::Absent),
        }
    }

    fn read_vector(&self, path: &str) -> DetectorResult<Option<Vec<f64>>> {
        let Some(dataset) = self.dataset(path) else {
            return Ok(None);
        };
        match dataset.dtype()?.to_descriptor()? {
            TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) | TypeDescriptor::Float(_) => {
                Ok(Some(dataset.read_raw::<f64>()?))
            }
            _ => Ok(None),
        }
    }

    fn data_file_names(&self) -> DetectorResult<Vec<String>> {
        let mut names = self.file.group(DATA_GROUP)?.member_names()?;
        names.sort();
        Ok(names)
    }

    fn read_frames(&self, name: &str) -> DetectorResult<FrameBlock> {
        let path = format!("{DATA_GROUP}/{name}");
        let dataset = self.file.dataset(&path)?;
        let shape = dataset.shape();
        let [frames, height, width] = shape[..] else {
            return Err(DetectorError::Dataset(format!(
                "{path} has shape {shape:?}, expected frames x height x width"
            )));
        };

        let descriptor = dataset.dtype()?.to_descriptor()?;
        let pixels = match descriptor {
            TypeDescriptor::Unsigned(hdf5::types::IntSize::U2) => {
                PixelBuffer::U16(dataset.read_raw::<u16>()?)
            }
            TypeDescriptor::Unsigned(hdf5::types::IntSize::U4) => {
                PixelBuffer::U32(dataset.read_raw::<u32>()?)
            }
            other => return Err(DetectorError::UnsupportedPixelType(format!("{other:?}"))),
        };

        tracing::debug!(file = %self.path.display(), data_file = name, frames, height, width, "Read data file");
        FrameBlock::new(frames, height, width, pixels)
    }
}
