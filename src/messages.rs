//! Stream2 message records.
//!
//! Three message kinds travel over the data socket, each a CBOR map with a
//! `type` discriminator:
//!
//! - [`StartMessage`]: sent once per arm, carries the detector geometry and
//!   acquisition settings a consumer needs to interpret the frames.
//! - [`ImageMessage`]: one per frame. The compressed frame sits under
//!   `data.threshold_1` as a tag-40 container (see [`crate::codec`]).
//! - [`EndMessage`]: closes a series.
//!
//! Fields are declared in wire order; serde keeps that order in the encoded
//! map. [`build_templates`] fills the start message from a [`MetadataIndex`]
//! and produces the image and end templates the stream engine stamps at send
//! time.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use ciborium::tag::Required;
use ciborium::Value;
use serde::{Deserialize, Serialize};

use crate::dataset::{MetadataIndex, MetadataValue, PixelType, OMEGA_PATH, TRANSLATION_PATH};
use crate::error::{DetectorError, DetectorResult};

/// Saturation value published when the master file has none.
pub const DEFAULT_SATURATION_VALUE: i64 = 33_000;

/// Exact path of the saturation value; not resolved by short key.
pub const SATURATION_PATH: &str = "entry/instrument/detector/saturation_value";
/// Triggers per series; required.
pub const NTRIGGER_PATH: &str = "entry/instrument/detector/detectorSpecific/ntrigger";
/// Images per trigger; required.
pub const NIMAGES_PATH: &str = "entry/instrument/detector/detectorSpecific/nimages";

/// Key of the single threshold channel every image message carries.
pub const THRESHOLD_CHANNEL: &str = "threshold_1";

/// Placeholder exposure interval stamped on every image, as a rational.
pub const STOP_TIME: [u64; 2] = [50_000_000, 50_000_000];

/// One goniometer axis: start angle and per-image increment (degrees).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    /// Degrees per image
    pub increment: f64,
    /// Degrees at the first image
    pub start: f64,
}

/// Goniometer geometry for the series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goniometer {
    /// Rotation axis
    pub omega: Axis,
    /// Second axis, omitted when absent
    #[serde(rename = "otherAxis", default, skip_serializing_if = "Option::is_none")]
    pub other_axis: Option<Axis>,
}

impl Default for Goniometer {
    fn default() -> Self {
        Self {
            omega: Axis {
                increment: 0.1,
                start: 360.0,
            },
            other_axis: None,
        }
    }
}

/// Detector and series description sent on arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartMessage {
    /// Always `start`
    #[serde(rename = "type")]
    pub message_type: String,
    /// RFC 3339 time of the arm
    pub arm_date: String,
    /// Beam center x, in pixels
    pub beam_center_x: f64,
    /// Beam center y, in pixels
    pub beam_center_y: f64,
    /// Threshold channel names
    pub channels: Vec<String>,
    /// Exposure per frame, in seconds
    pub count_time: f64,
    /// Countrate correction enabled
    pub countrate_correction_enabled: bool,
    /// Omitted unless present in the master file
    pub countrate_correction_lookup_table: Option<Vec<i64>>,
    /// Detector description
    pub detector_description: String,
    /// Detector serial number
    pub detector_serial_number: String,
    /// Detector position (x, y, z), in meters
    pub detector_translation: [f64; 3],
    /// Per-pixel gain correction
    pub flatfield: Option<Vec<f64>>,
    /// Flatfield enabled
    pub flatfield_enabled: bool,
    /// Seconds between frame starts
    pub frame_time: f64,
    /// Goniometer
    pub goniometer: Goniometer,
    /// `uint16` or `uint32`
    pub image_dtype: String,
    /// Frame width, in pixels
    pub image_size_x: u64,
    /// Frame height, in pixels
    pub image_size_y: u64,
    /// Photon energy, in eV
    pub incident_energy: f64,
    /// Wavelength, in angstroms
    pub incident_wavelength: f64,
    /// ntrigger x nimages
    pub number_of_images: u64,
    /// Per-pixel mask bits
    pub pixel_mask: Option<Vec<u32>>,
    /// Pixel mask enabled
    pub pixel_mask_enabled: bool,
    /// Pixel width, in meters
    pub pixel_size_x: f64,
    /// Pixel height, in meters
    pub pixel_size_y: f64,
    /// Counts at which a pixel saturates
    pub saturation_value: Option<i64>,
    /// Sensor material
    pub sensor_material: String,
    /// In meters
    pub sensor_thickness: f64,
    /// Incremented on every arm
    pub series_id: u64,
    /// UUID of the series
    pub series_unique_id: String,
    /// Threshold energy per channel, in eV
    pub threshold_energy: BTreeMap<String, f64>,
    /// Copy of the header appendix
    pub user_data: serde_json::Value,
    /// Virtual pixel interpolation enabled
    pub virtual_pixel_interpolation_enabled: bool,
}

impl Default for StartMessage {
    fn default() -> Self {
        Self {
            message_type: "start".into(),
            arm_date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, false),
            beam_center_x: 1056.0,
            beam_center_y: 1134.0,
            channels: vec!["0".into()],
            count_time: 0.0109,
            countrate_correction_enabled: true,
            countrate_correction_lookup_table: Some(vec![0]),
            detector_description: "Dectris EIGER2 Si 16M".into(),
            detector_serial_number: "E-32-0130".into(),
            detector_translation: [0.0, 0.0, -0.298],
            flatfield: Some(Vec::new()),
            flatfield_enabled: true,
            frame_time: 0.011,
            goniometer: Goniometer::default(),
            image_dtype: PixelType::U32.dtype_name().into(),
            image_size_x: 2070,
            image_size_y: 2167,
            incident_energy: 12_700.0,
            incident_wavelength: 0.9763,
            number_of_images: 1,
            pixel_mask: Some(Vec::new()),
            pixel_mask_enabled: true,
            pixel_size_x: 7.5e-5,
            pixel_size_y: 7.5e-5,
            saturation_value: Some(0),
            sensor_material: "Si".into(),
            sensor_thickness: 4.5e-4,
            series_id: 0,
            series_unique_id: String::new(),
            threshold_energy: BTreeMap::from([(THRESHOLD_CHANNEL.to_string(), 6350.0)]),
            user_data: serde_json::Value::Object(serde_json::Map::new()),
            virtual_pixel_interpolation_enabled: true,
        }
    }
}

/// One frame of a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMessage {
    /// Always `image`
    #[serde(rename = "type")]
    pub message_type: String,
    /// Series id
    pub series_id: u64,
    /// Series unique id
    pub series_unique_id: String,
    /// Zero-based index within the series
    pub image_id: u64,
    /// RFC 3339 send time under CBOR tag 0.
    pub series_date: Required<String, 0>,
    /// Exposure interval as a rational
    pub stop_time: [u64; 2],
    /// Encoded frame per threshold channel.
    pub data: BTreeMap<String, Value>,
}

impl Default for ImageMessage {
    fn default() -> Self {
        Self {
            message_type: "image".into(),
            series_id: 0,
            series_unique_id: String::new(),
            image_id: 0,
            series_date: Required(String::new()),
            stop_time: STOP_TIME,
            data: BTreeMap::new(),
        }
    }
}

impl ImageMessage {
    /// A copy of the template holding `frame` as its only channel.
    pub fn with_frame(&self, frame: Value) -> Self {
        let mut message = self.clone();
        message.data.insert(THRESHOLD_CHANNEL.to_string(), frame);
        message
    }

    /// Fills the fields that change on every send.
    pub fn stamp(&mut self, series_id: u64, series_unique_id: &str, image_id: u64) {
        self.series_id = series_id;
        self.image_id = image_id;
        self.series_unique_id.clear();
        self.series_unique_id.push_str(series_unique_id);
        self.series_date = Required(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false));
        self.stop_time = STOP_TIME;
    }

    /// The encoded frame, if one was attached.
    pub fn frame(&self) -> Option<&Value> {
        self.data.get(THRESHOLD_CHANNEL)
    }
}

/// Closes a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndMessage {
    /// Always `end`
    #[serde(rename = "type")]
    pub message_type: String,
    /// Series being closed
    pub series_id: u64,
    /// Series unique id
    pub series_unique_id: String,
}

impl Default for EndMessage {
    fn default() -> Self {
        Self {
            message_type: "end".into(),
            series_id: 0,
            series_unique_id: String::new(),
        }
    }
}

/// Any message read back from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Series header
    Start(Box<StartMessage>),
    /// One frame
    Image(Box<ImageMessage>),
    /// Series trailer
    End(EndMessage),
}

impl StreamMessage {
    /// `start`, `image` or `end`.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Start(_) => "start",
            StreamMessage::Image(_) => "image",
            StreamMessage::End(_) => "end",
        }
    }
}

/// Serializes a message to CBOR.
pub fn to_cbor<T: Serialize>(message: &T) -> DetectorResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(message, &mut buf).map_err(|e| DetectorError::Encode(e.to_string()))?;
    Ok(buf)
}

fn from_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> DetectorResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| DetectorError::Decode(e.to_string()))
}

/// Parses one stream message, dispatching on its `type` field.
pub fn decode_message(bytes: &[u8]) -> DetectorResult<StreamMessage> {
    let value: Value = from_cbor(bytes)?;
    let kind = value
        .as_map()
        .and_then(|entries| {
            entries
                .iter()
                .find(|(k, _)| k.as_text() == Some("type"))
                .and_then(|(_, v)| v.as_text())
        })
        .ok_or_else(|| DetectorError::Decode("message has no type field".into()))?;

    match kind {
        "start" => Ok(StreamMessage::Start(Box::new(from_cbor(bytes)?))),
        "image" => Ok(StreamMessage::Image(Box::new(from_cbor(bytes)?))),
        "end" => Ok(StreamMessage::End(from_cbor(bytes)?)),
        other => Err(DetectorError::Decode(format!("unknown message type '{other}'"))),
    }
}

/// Start message plus the image and end templates derived from one load.
#[derive(Debug, Clone)]
pub struct MessageTemplates {
    /// Cached start message
    pub start: StartMessage,
    /// Image message without a frame
    pub image: ImageMessage,
    /// End message for the series
    pub end: EndMessage,
}

fn real(index: &MetadataIndex, key: &str, default: f64) -> f64 {
    index.resolve(key).as_f64().unwrap_or(default)
}

fn text(index: &MetadataIndex, key: &str, default: &str) -> String {
    index.resolve(key).as_text().unwrap_or_else(|| default.to_string())
}

fn required_count(index: &MetadataIndex, path: &str) -> DetectorResult<u64> {
    let value = index.at_path(path);
    value
        .as_i64()
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| DetectorError::MissingMetadata(format!("/{path} ({value})")))
}

/// Builds the message templates for one loaded dataset.
///
/// Absent keys keep the value of [`StartMessage::default`]; correction flags
/// resolve absent to `false`. The saturation value and the omega start angle
/// fall back to logged defaults. The trigger and image counts must be present.
///
/// `frame_shape` is `[height, width]` of the loaded frames, which take
/// precedence over the detector size recorded in the metadata.
pub fn build_templates(
    index: &MetadataIndex,
    frame_shape: [usize; 2],
    pixel_type: PixelType,
) -> DetectorResult<MessageTemplates> {
    let defaults = StartMessage::default();

    let ntrigger = required_count(index, NTRIGGER_PATH)?;
    let nimages = required_count(index, NIMAGES_PATH)?;
    let number_of_images = ntrigger.checked_mul(nimages).ok_or_else(|| {
        DetectorError::Dataset(format!("ntrigger {ntrigger} x nimages {nimages} overflows the image count"))
    })?;

    let saturation_value = match index.at_path(SATURATION_PATH).as_i64() {
        Some(value) => value,
        None => {
            tracing::warn!(
                path = SATURATION_PATH,
                default = DEFAULT_SATURATION_VALUE,
                "Saturation value not found in master file, using default"
            );
            DEFAULT_SATURATION_VALUE
        }
    };

    let omega_start = match index.vector(OMEGA_PATH).and_then(|angles| angles.first().copied()) {
        Some(start) => start,
        None => {
            tracing::warn!(path = OMEGA_PATH, "Omega start angle unavailable, using 0.0");
            0.0
        }
    };

    let detector_translation = match index.vector(TRANSLATION_PATH) {
        Some(&[x, y, z]) => [x, y, z],
        other => {
            tracing::warn!(
                path = TRANSLATION_PATH,
                found = ?other,
                "Detector translation is not a 3-vector, keeping default"
            );
            defaults.detector_translation
        }
    };

    let threshold_energy = match index.resolve("threshold_energy").as_f64() {
        Some(threshold) => BTreeMap::from([
            (THRESHOLD_CHANNEL.to_string(), threshold),
            ("threshold_2".to_string(), threshold * 3.0),
        ]),
        None => defaults.threshold_energy.clone(),
    };

    let arm_date = match index.resolve("data_collection_date") {
        MetadataValue::Absent => defaults.arm_date.clone(),
        value => value.to_string(),
    };

    let start = StartMessage {
        arm_date,
        beam_center_x: real(index, "beam_center_x", defaults.beam_center_x),
        beam_center_y: real(index, "beam_center_y", defaults.beam_center_y),
        channels: vec!["1".into()],
        count_time: real(index, "count_time", defaults.count_time),
        countrate_correction_enabled: index.resolve("countrate_correction_applied").truthy(),
        countrate_correction_lookup_table: None,
        detector_description: text(index, "description", &defaults.detector_description),
        detector_serial_number: text(index, "detector_number", &defaults.detector_serial_number),
        detector_translation,
        flatfield: None,
        flatfield_enabled: index.resolve("flatfield_correction_applied").truthy(),
        frame_time: real(index, "frame_time", defaults.frame_time),
        goniometer: Goniometer {
            omega: Axis {
                increment: real(index, "omega_range_average", defaults.goniometer.omega.increment),
                start: omega_start,
            },
            other_axis: Some(Axis {
                increment: 1.0,
                start: 0.0,
            }),
        },
        image_dtype: pixel_type.dtype_name().into(),
        image_size_x: frame_shape[1] as u64,
        image_size_y: frame_shape[0] as u64,
        incident_energy: real(index, "photon_energy", defaults.incident_energy),
        incident_wavelength: real(index, "incident_wavelength", defaults.incident_wavelength),
        number_of_images,
        pixel_mask: None,
        pixel_mask_enabled: index.resolve("pixel_mask_applied").truthy(),
        pixel_size_x: real(index, "x_pixel_size", defaults.pixel_size_x),
        pixel_size_y: real(index, "y_pixel_size", defaults.pixel_size_y),
        saturation_value: Some(saturation_value),
        sensor_material: text(index, "sensor_material", &defaults.sensor_material),
        sensor_thickness: real(index, "sensor_thickness", defaults.sensor_thickness),
        series_id: 0,
        series_unique_id: String::new(),
        threshold_energy,
        user_data: serde_json::json!({ "pi": std::f64::consts::PI }),
        virtual_pixel_interpolation_enabled: index.resolve("virtual_pixel_correction_applied").truthy(),
        ..defaults
    };

    Ok(MessageTemplates {
        start,
        image: ImageMessage::default(),
        end: EndMessage::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, Compression};
    use crate::dataset::memory::SimulatedAcquisition;
    use tracing_test::traced_test;

    fn index_for(acquisition: &SimulatedAcquisition) -> MetadataIndex {
        MetadataIndex::build(&acquisition.build().unwrap()).unwrap()
    }

    #[test]
    fn start_message_fields_come_from_metadata() {
        let acquisition = SimulatedAcquisition {
            ntrigger: 3,
            nimages: 5,
            ..SimulatedAcquisition::new(32, 16, 2, PixelType::U16)
        };
        let templates = build_templates(&index_for(&acquisition), [16, 32], PixelType::U16).unwrap();
        let start = templates.start;
        assert_eq!(start.number_of_images, 15);
        assert_eq!(start.image_size_x, 32);
        assert_eq!(start.image_size_y, 16);
        assert_eq!(start.image_dtype, "uint16");
        assert_eq!(start.beam_center_x, 16.0);
        assert_eq!(start.saturation_value, Some(126_634));
        assert_eq!(start.detector_translation, [0.0, 0.0, -0.298]);
        assert_eq!(start.goniometer.omega.start, 10.0);
        assert_eq!(start.threshold_energy["threshold_2"], 6350.0 * 3.0);
        assert_eq!(start.arm_date, "2024-03-12T09:41:07.061+00:00");
        assert!(start.countrate_correction_enabled);
    }

    #[test]
    #[traced_test]
    fn missing_saturation_value_defaults() {
        let acquisition = SimulatedAcquisition {
            saturation_value: None,
            ..Default::default()
        };
        let templates = build_templates(&index_for(&acquisition), [64, 64], PixelType::U32).unwrap();
        assert_eq!(templates.start.saturation_value, Some(DEFAULT_SATURATION_VALUE));
        assert!(logs_contain("Saturation value not found"));
    }

    #[test]
    fn missing_omega_vector_defaults_start_to_zero() {
        let dataset = SimulatedAcquisition::default().build().unwrap().without(OMEGA_PATH);
        let index = MetadataIndex::build(&dataset).unwrap();
        let templates = build_templates(&index, [64, 64], PixelType::U32).unwrap();
        assert_eq!(templates.start.goniometer.omega.start, 0.0);
    }

    #[test]
    fn missing_trigger_count_fails_the_build() {
        let dataset = SimulatedAcquisition::default().build().unwrap().without(NTRIGGER_PATH);
        let index = MetadataIndex::build(&dataset).unwrap();
        let err = build_templates(&index, [64, 64], PixelType::U32).unwrap_err();
        assert!(matches!(err, DetectorError::MissingMetadata(_)));
    }

    #[test]
    fn oversized_image_count_is_rejected() {
        let acquisition = SimulatedAcquisition {
            ntrigger: i64::MAX,
            nimages: 4,
            ..Default::default()
        };
        let err = build_templates(&index_for(&acquisition), [64, 64], PixelType::U32).unwrap_err();
        assert!(matches!(err, DetectorError::Dataset(_)));
    }

    #[test]
    fn absent_correction_flags_are_false() {
        let dataset = SimulatedAcquisition::default()
            .build()
            .unwrap()
            .without("entry/instrument/detector/flatfield_correction_applied");
        let index = MetadataIndex::build(&dataset).unwrap();
        let start = build_templates(&index, [64, 64], PixelType::U32).unwrap().start;
        assert!(!start.flatfield_enabled);
        assert!(start.pixel_mask_enabled);
    }

    #[test]
    fn start_message_keeps_wire_field_order() {
        let bytes = to_cbor(&StartMessage::default()).unwrap();
        let value: Value = ciborium::de::from_reader(bytes.as_slice()).unwrap();
        let keys: Vec<&str> = value
            .as_map()
            .unwrap()
            .iter()
            .filter_map(|(k, _)| k.as_text())
            .collect();
        assert_eq!(keys.first(), Some(&"type"));
        assert_eq!(keys[1], "arm_date");
        assert_eq!(keys.last(), Some(&"virtual_pixel_interpolation_enabled"));
        assert_eq!(keys.len(), 33);
    }

    #[test]
    fn image_message_round_trips_with_tagged_date() {
        let raw: Vec<u8> = (0..16u16).flat_map(|v| v.to_le_bytes()).collect();
        let frame = encode_frame(&raw, [4, 4], PixelType::U16, Compression::None).unwrap();
        let mut image = ImageMessage::default().with_frame(frame);
        image.stamp(7, "abc", 3);

        let bytes = to_cbor(&image).unwrap();
        match decode_message(&bytes).unwrap() {
            StreamMessage::Image(decoded) => {
                assert_eq!(decoded.series_id, 7);
                assert_eq!(decoded.image_id, 3);
                assert_eq!(decoded.series_unique_id, "abc");
                assert_eq!(decoded.stop_time, STOP_TIME);
                assert!(chrono::DateTime::parse_from_rfc3339(&decoded.series_date.0).is_ok());
                assert_eq!(decoded.frame(), image.frame());
            }
            other => panic!("expected image, got {}", other.kind()),
        }
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let bytes = to_cbor(&serde_json::json!({ "type": "status" })).unwrap();
        assert!(matches!(decode_message(&bytes), Err(DetectorError::Decode(_))));
        let bytes = to_cbor(&serde_json::json!({ "series_id": 1 })).unwrap();
        assert!(matches!(decode_message(&bytes), Err(DetectorError::Decode(_))));
    }
}
