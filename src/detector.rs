//! Detector-side configuration that is not part of the data stream.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dataset::MetadataIndex;

const READOUT_TIME_PATH: &str = "entry/instrument/detector/detector_readout_time";
const BIT_DEPTH_IMAGE_PATH: &str = "entry/instrument/detector/bit_depth_image";
const BIT_DEPTH_READOUT_PATH: &str = "entry/instrument/detector/bit_depth_readout";
const COMPRESSION_PATH: &str = "entry/instrument/detector/detectorSpecific/compression";
const COUNTRATE_CUTOFF_PATH: &str =
    "entry/instrument/detector/detectorSpecific/countrate_correction_count_cutoff";

/// Lifecycle label reported for the detector and stream subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorState {
    /// Armed and waiting for a trigger.
    Ready,
    /// Initializing.
    Initialize,
    /// Applying configuration.
    Configure,
    /// A trigger is streaming images.
    Acquire,
    /// Nothing loaded or armed.
    #[default]
    Idle,
    /// Self-test.
    Test,
    /// Failed; see the logs.
    Error,
    /// Not applicable.
    Na,
}

impl DetectorState {
    /// Lowercase label used on the control interface.
    pub fn as_str(self) -> &'static str {
        match self {
            DetectorState::Ready => "ready",
            DetectorState::Initialize => "initialize",
            DetectorState::Configure => "configure",
            DetectorState::Acquire => "acquire",
            DetectorState::Idle => "idle",
            DetectorState::Test => "test",
            DetectorState::Error => "error",
            DetectorState::Na => "na",
        }
    }
}

impl fmt::Display for DetectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings a control client can read back but that never reach the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfiguration {
    /// Readout dead time, in seconds.
    pub detector_readout_time: f64,
    /// Bits per stored pixel.
    pub detector_bit_depth_image: i64,
    /// Bits per pixel read from the sensor.
    pub detector_bit_depth_readout: i64,
    /// Compression the detector was set to.
    pub detector_compression: String,
    /// Counts above which correction is not applied.
    pub detector_countrate_correction_cutoff: i64,
    /// Triggers per series.
    pub detector_ntrigger: i64,
    /// Masked pixels.
    pub detector_number_of_excluded_pixels: i64,
    /// Trigger mode, e.g. `exts` or `ints`.
    pub detector_trigger_mode: String,
}

impl Default for DetectorConfiguration {
    fn default() -> Self {
        Self {
            detector_readout_time: 1e-7,
            detector_bit_depth_image: 32,
            detector_bit_depth_readout: 16,
            detector_compression: "bslz4".into(),
            detector_countrate_correction_cutoff: 126_634,
            detector_ntrigger: 1,
            detector_number_of_excluded_pixels: 1_251_206,
            detector_trigger_mode: "exts".into(),
        }
    }
}

impl DetectorConfiguration {
    /// Refreshes the fields recorded in a master file.
    ///
    /// All five entries must be present; otherwise the configuration is left
    /// unchanged.
    pub fn refresh_from(&mut self, index: &MetadataIndex) {
        let readout = index.at_path(READOUT_TIME_PATH).as_f64();
        let depth_image = index.at_path(BIT_DEPTH_IMAGE_PATH).as_i64();
        let depth_readout = index.at_path(BIT_DEPTH_READOUT_PATH).as_i64();
        let compression = index.at_path(COMPRESSION_PATH).as_text();
        let cutoff = index.at_path(COUNTRATE_CUTOFF_PATH).as_i64();

        match (readout, depth_image, depth_readout, compression, cutoff) {
            (Some(readout), Some(depth_image), Some(depth_readout), Some(compression), Some(cutoff)) => {
                self.detector_readout_time = readout;
                self.detector_bit_depth_image = depth_image;
                self.detector_bit_depth_readout = depth_readout;
                self.detector_compression = compression;
                self.detector_countrate_correction_cutoff = cutoff;
            }
            _ => {
                tracing::warn!("Detector configuration could not be loaded, using defaults");
            }
        }
    }
}

/// Stream subsystem settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfiguration {
    /// Always `cbor`.
    pub format: String,
    /// `enabled` or `disabled`.
    pub mode: String,
    /// Arbitrary user data copied into `user_data` of every start message.
    pub header_appendix: serde_json::Value,
}

impl Default for StreamConfiguration {
    fn default() -> Self {
        Self {
            format: "cbor".into(),
            mode: "enabled".into(),
            header_appendix: serde_json::Value::String(String::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::memory::SimulatedAcquisition;

    #[test]
    fn state_labels_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&DetectorState::Acquire).unwrap(), "\"acquire\"");
        assert_eq!(DetectorState::default().to_string(), "idle");
        assert_eq!(DetectorState::Na.as_str(), "na");
    }

    #[test]
    fn refresh_reads_recorded_fields() {
        let acquisition = SimulatedAcquisition::new(8, 8, 1, crate::dataset::PixelType::U16);
        let index = MetadataIndex::build(&acquisition.build().unwrap()).unwrap();
        let mut config = DetectorConfiguration::default();
        config.refresh_from(&index);
        assert_eq!(config.detector_bit_depth_image, 16);
        assert_eq!(config.detector_compression, "bslz4");
    }

    #[test]
    fn incomplete_master_keeps_defaults() {
        let dataset = SimulatedAcquisition::default()
            .build()
            .unwrap()
            .without(BIT_DEPTH_READOUT_PATH)
            .with_value(BIT_DEPTH_IMAGE_PATH, crate::dataset::MetadataValue::Integer(8));
        let index = MetadataIndex::build(&dataset).unwrap();
        let mut config = DetectorConfiguration::default();
        config.refresh_from(&index);
        assert_eq!(config, DetectorConfiguration::default());
    }

    #[test]
    fn default_header_appendix_is_empty_string() {
        assert_eq!(StreamConfiguration::default().header_appendix, serde_json::json!(""));
    }
}
