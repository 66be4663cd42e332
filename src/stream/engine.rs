//! Stream engine: loaded frames, counters and the arm / trigger / disarm cycle.
//!
//! ```text
//!            load (any state)
//!                  |
//!   UNARMED --arm--> ARMED --trigger--> ARMED ... --disarm--> UNARMED
//!      ^               |  \__arm (new series)__/                 |
//!      \_______________+______________disarm_____________________/
//! ```
//!
//! Loading is split in two so the expensive half can run off the command
//! path: [`prepare_load`] opens the container, builds the message templates
//! and compresses every frame without touching the engine, and
//! [`StreamEngine::install`] swaps the result in. A failed prepare leaves the
//! previously loaded frames in place.
//!
//! Every transition either completes or restores [`StreamState`] to its value
//! before the call.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use super::transport::Transport;
use crate::codec::{encode_frame, Compression};
use crate::dataset::{DatasetOpener, FrameBlock, MetadataIndex};
use crate::detector::{DetectorConfiguration, StreamConfiguration};
use crate::error::{DetectorError, DetectorResult};
use crate::messages::{build_templates, to_cbor, EndMessage, ImageMessage, MessageTemplates, StartMessage};

/// Default pause before each image message.
pub const DEFAULT_FRAME_DELAY: Duration = Duration::from_millis(10);

/// Counters and knobs of the single stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamState {
    /// Incremented once per arm; never decreases.
    pub sequence_id: u64,
    /// Image id of the next image message; reset on arm only.
    pub image_number: u64,
    /// Index of the next loaded frame to send.
    pub frame_cursor: usize,
    /// UUID of the armed series
    pub series_unique_id: Option<String>,
    /// Applied to frames at load
    pub compression: Compression,
    /// Images each trigger sends
    pub frames_per_trigger: u64,
    /// Pause before each image message
    pub inter_frame_delay: Duration,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            sequence_id: 0,
            image_number: 0,
            frame_cursor: 0,
            series_unique_id: None,
            compression: Compression::Bslz4,
            frames_per_trigger: 1,
            inter_frame_delay: DEFAULT_FRAME_DELAY,
        }
    }
}

/// What to load: a master file, its compression and how many data files.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    /// Master file
    pub path: PathBuf,
    /// Compression for the frames
    pub compression: Compression,
    /// `None` loads every data file of the master.
    pub file_count: Option<usize>,
}

impl LoadRequest {
    /// Builds a request.
    pub fn new(path: impl Into<PathBuf>, compression: Compression, file_count: Option<usize>) -> Self {
        Self {
            path: path.into(),
            compression,
            file_count,
        }
    }
}

/// A fully decoded and compressed dataset, ready to be installed.
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    /// The request this was loaded from
    pub request: LoadRequest,
    /// Data files actually read
    pub file_count: usize,
    /// Messages derived from the metadata
    pub templates: MessageTemplates,
    /// One image message per frame, encoded
    pub frames: Vec<ImageMessage>,
    index: MetadataIndex,
}

impl PreparedDataset {
    /// Metadata read from the master file.
    pub fn metadata(&self) -> &MetadataIndex {
        &self.index
    }
}

#[derive(Debug)]
struct LoadedDataset {
    path: PathBuf,
    file_count: usize,
    frames: Vec<ImageMessage>,
}

/// Outcome of one trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerSummary {
    /// Image messages pushed
    pub frames_sent: u64,
    /// `None` when nothing was sent
    pub first_image_id: Option<u64>,
    /// Id of the final image sent
    pub last_image_id: Option<u64>,
    /// Wall time of the trigger
    pub elapsed: Duration,
    /// Achieved frames per second.
    pub frame_rate: f64,
}

/// Read-only view of the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    /// Counters and knobs
    pub state: StreamState,
    /// Whether a series is open
    pub armed: bool,
    /// Loaded master file
    pub dataset: Option<PathBuf>,
    /// Data files in the loaded dataset
    pub data_files: usize,
    /// Frames ready to send
    pub loaded_frames: usize,
}

fn check_consistent(blocks: &[FrameBlock]) -> DetectorResult<()> {
    let Some(first) = blocks.first() else {
        return Ok(());
    };
    for block in &blocks[1..] {
        if block.pixel_type() != first.pixel_type() {
            return Err(DetectorError::UnsupportedPixelType(format!(
                "data files mix {} and {}",
                first.pixel_type(),
                block.pixel_type()
            )));
        }
        if block.frame_shape() != first.frame_shape() {
            return Err(DetectorError::Dataset(format!(
                "data files mix frame shapes {:?} and {:?}",
                first.frame_shape(),
                block.frame_shape()
            )));
        }
    }
    Ok(())
}

/// Reads, indexes and compresses a dataset. Blocking; holds no engine state.
///
/// The container is closed before this returns.
pub fn prepare_load(opener: &dyn DatasetOpener, request: &LoadRequest) -> DetectorResult<PreparedDataset> {
    if request.file_count == Some(0) {
        return Err(DetectorError::InvalidFileCount);
    }

    let source = opener.open(&request.path)?;
    let names = source.data_file_names()?;
    let file_count = request.file_count.unwrap_or(names.len());
    if file_count > names.len() {
        return Err(DetectorError::FileCountOutOfRange {
            requested: file_count,
            available: names.len(),
        });
    }
    if file_count == 0 {
        return Err(DetectorError::Dataset(format!(
            "{} references no data files",
            request.path.display()
        )));
    }

    let blocks = names[..file_count]
        .iter()
        .map(|name| source.read_frames(name))
        .collect::<DetectorResult<Vec<_>>>()?;
    check_consistent(&blocks)?;
    let index = MetadataIndex::build(source.as_ref())?;
    drop(source);

    let (shape, pixel_type) = match blocks.first() {
        Some(block) => (block.frame_shape(), block.pixel_type()),
        None => return Err(DetectorError::Dataset("no data files read".into())),
    };
    let templates = build_templates(&index, shape, pixel_type)?;

    let mut frames = Vec::with_capacity(blocks.iter().map(|b| b.frames).sum());
    for (file_idx, block) in blocks.iter().enumerate() {
        tracing::info!(
            data_file = %names[file_idx],
            frames = block.frames,
            compression = %request.compression,
            "Compressing data file"
        );
        for frame in 0..block.frames {
            let raw = block
                .frame_bytes(frame)
                .ok_or_else(|| DetectorError::Dataset(format!("frame {frame} out of range")))?;
            let encoded = encode_frame(&raw, shape, pixel_type, request.compression)?;
            frames.push(templates.image.with_frame(encoded));
        }
    }
    if frames.is_empty() {
        return Err(DetectorError::Dataset(format!(
            "{} contains no frames",
            request.path.display()
        )));
    }

    tracing::info!(unique_frames = frames.len(), "Dataset prepared");
    Ok(PreparedDataset {
        request: request.clone(),
        file_count,
        templates,
        frames,
        index,
    })
}

/// Owns the stream state, the loaded frames and the transport.
///
/// Not internally synchronized: callers serialize access, normally through
/// [`super::actor::DetectorActor`].
pub struct StreamEngine<T: Transport> {
    transport: T,
    opener: Arc<dyn DatasetOpener>,
    state: StreamState,
    armed: bool,
    loaded: Option<LoadedDataset>,
    start: StartMessage,
    end: EndMessage,
    detector: DetectorConfiguration,
    stream: StreamConfiguration,
}

impl<T: Transport> StreamEngine<T> {
    /// Engine with nothing loaded, sending over `transport`.
    pub fn new(transport: T, opener: Arc<dyn DatasetOpener>) -> Self {
        Self {
            transport,
            opener,
            state: StreamState::default(),
            armed: false,
            loaded: None,
            start: StartMessage::default(),
            end: EndMessage::default(),
            detector: DetectorConfiguration::default(),
            stream: StreamConfiguration::default(),
        }
    }

    /// Sets the inter-frame delay.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.state.inter_frame_delay = delay;
        self
    }

    /// Sets the compression applied to later loads.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.state.compression = compression;
        self
    }

    /// Opener shared with load workers.
    pub fn opener(&self) -> Arc<dyn DatasetOpener> {
        Arc::clone(&self.opener)
    }

    /// Counters and knobs.
    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Whether a start message was sent without its end message.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Whether frames are installed.
    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Number of frames available to triggers.
    pub fn loaded_frames(&self) -> usize {
        self.loaded.as_ref().map_or(0, |l| l.frames.len())
    }

    /// Master file of the installed dataset.
    pub fn dataset_path(&self) -> Option<&Path> {
        self.loaded.as_ref().map(|l| l.path.as_path())
    }

    /// Snapshot for status queries.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state.clone(),
            armed: self.armed,
            dataset: self.loaded.as_ref().map(|l| l.path.clone()),
            data_files: self.loaded.as_ref().map_or(0, |l| l.file_count),
            loaded_frames: self.loaded_frames(),
        }
    }

    /// The start message sent on the next arm.
    pub fn start_message(&self) -> &StartMessage {
        &self.start
    }

    /// Detector settings outside the stream.
    pub fn detector_configuration(&self) -> &DetectorConfiguration {
        &self.detector
    }

    /// Stream subsystem settings.
    pub fn stream_configuration(&self) -> &StreamConfiguration {
        &self.stream
    }

    /// Mutates the live start message. Takes effect on the next arm.
    pub fn update_start_message<R>(&mut self, f: impl FnOnce(&mut StartMessage) -> R) -> R {
        f(&mut self.start)
    }

    /// Mutates the detector configuration.
    pub fn update_detector_configuration<R>(&mut self, f: impl FnOnce(&mut DetectorConfiguration) -> R) -> R {
        f(&mut self.detector)
    }

    /// Frames per trigger from the next trigger on.
    pub fn set_frames_per_trigger(&mut self, frames: u64) {
        self.state.frames_per_trigger = frames;
    }

    /// Delay from the next image on.
    pub fn set_frame_delay(&mut self, delay: Duration) {
        self.state.inter_frame_delay = delay;
    }

    /// User data embedded by later arms.
    pub fn set_header_appendix(&mut self, appendix: serde_json::Value) {
        self.stream.header_appendix = appendix;
    }

    /// Loads synchronously on the calling thread.
    pub fn load(&mut self, request: &LoadRequest) -> DetectorResult<()> {
        let prepared = prepare_load(self.opener.as_ref(), request)?;
        self.install(prepared);
        Ok(())
    }

    /// Replaces the loaded frames and templates in one step.
    ///
    /// Resets the frame cursor and image counter. `frames_per_trigger` takes
    /// the number of images recorded in the dataset.
    pub fn install(&mut self, prepared: PreparedDataset) {
        self.detector.refresh_from(&prepared.index);
        self.start = prepared.templates.start;
        self.end = prepared.templates.end;
        self.state.compression = prepared.request.compression;
        self.state.frame_cursor = 0;
        self.state.image_number = 0;
        self.state.frames_per_trigger = self.start.number_of_images;
        tracing::info!(
            path = %prepared.request.path.display(),
            compression = %self.state.compression,
            data_files = prepared.file_count,
            frames = prepared.frames.len(),
            frames_per_trigger = self.state.frames_per_trigger,
            "Dataset installed"
        );
        self.loaded = Some(LoadedDataset {
            path: prepared.request.path,
            file_count: prepared.file_count,
            frames: prepared.frames,
        });
    }

    /// Validates a compression change.
    ///
    /// Returns the load that re-derives the frames when a dataset is loaded;
    /// otherwise the new compression is recorded for the next load.
    pub fn compression_change(&mut self, name: &str) -> DetectorResult<Option<LoadRequest>> {
        let compression = name.parse::<Compression>()?;
        match &self.loaded {
            Some(loaded) => Ok(Some(LoadRequest::new(
                loaded.path.clone(),
                compression,
                Some(loaded.file_count),
            ))),
            None => {
                self.state.compression = compression;
                Ok(None)
            }
        }
    }

    /// Changes the compression, recompressing any loaded dataset in place.
    pub fn set_compression(&mut self, name: &str) -> DetectorResult<()> {
        match self.compression_change(name)? {
            Some(request) => self.load(&request),
            None => Ok(()),
        }
    }

    /// Starts a new series and sends its start message.
    ///
    /// Returns the new sequence id.
    pub async fn arm(&mut self) -> DetectorResult<u64> {
        if self.loaded.is_none() {
            return Err(DetectorError::NotLoaded);
        }
        let previous = self.state.clone();

        self.state.sequence_id += 1;
        self.state.image_number = 0;
        let series_unique_id = Uuid::new_v4().to_string();
        self.state.series_unique_id = Some(series_unique_id.clone());

        let mut start = self.start.clone();
        start.series_id = self.state.sequence_id;
        start.series_unique_id = series_unique_id;
        start.number_of_images = self.state.frames_per_trigger;
        start.user_data = self.stream.header_appendix.clone();

        let sent = match to_cbor(&start) {
            Ok(bytes) => self.transport.send(bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.state = previous;
            return Err(e);
        }

        tracing::info!(
            sequence_id = self.state.sequence_id,
            series_unique_id = %start.series_unique_id,
            number_of_images = start.number_of_images,
            "Sent start message"
        );
        self.start = start;
        self.armed = true;
        Ok(self.state.sequence_id)
    }

    /// Sends `frames_per_trigger` image messages, pacing each by the frame delay.
    pub async fn trigger(&mut self) -> DetectorResult<TriggerSummary> {
        if !self.armed {
            return Err(DetectorError::NotArmed);
        }
        let previous = self.state.clone();
        match self.stream_frames().await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.state = previous;
                Err(e)
            }
        }
    }

    async fn stream_frames(&mut self) -> DetectorResult<TriggerSummary> {
        let loaded = self.loaded.as_mut().ok_or(DetectorError::NotLoaded)?;
        let total = loaded.frames.len();
        let series_unique_id = self.state.series_unique_id.clone().unwrap_or_default();
        let first_image_id = self.state.image_number;
        let count = self.state.frames_per_trigger;

        let started = Instant::now();
        for _ in 0..count {
            tokio::time::sleep(self.state.inter_frame_delay).await;
            let frame = &mut loaded.frames[self.state.frame_cursor];
            frame.stamp(self.state.sequence_id, &series_unique_id, self.state.image_number);
            let bytes = to_cbor(&*frame)?;
            self.transport.send(bytes).await?;
            self.state.image_number += 1;
            self.state.frame_cursor = (self.state.frame_cursor + 1) % total;
        }
        let elapsed = started.elapsed();

        let frame_rate = if count == 0 || elapsed.is_zero() {
            0.0
        } else {
            count as f64 / elapsed.as_secs_f64()
        };
        tracing::info!(
            sequence_id = self.state.sequence_id,
            frames = count,
            frame_rate,
            "Trigger complete"
        );
        Ok(TriggerSummary {
            frames_sent: count,
            first_image_id: (count > 0).then_some(first_image_id),
            last_image_id: (count > 0).then(|| first_image_id + count - 1),
            elapsed,
            frame_rate,
        })
    }

    /// Ends the current series. Allowed in any state.
    pub async fn disarm(&mut self) -> DetectorResult<()> {
        let mut end = self.end.clone();
        end.series_id = self.state.sequence_id;
        end.series_unique_id = self.state.series_unique_id.clone().unwrap_or_default();
        self.transport.send(to_cbor(&end)?).await?;
        tracing::info!(sequence_id = end.series_id, "Sent end message");
        self.end = end;
        self.armed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::memory::{MemoryCatalog, SimulatedAcquisition};
    use crate::dataset::PixelType;
    use crate::messages::{decode_message, StreamMessage};
    use crate::stream::transport::ChannelTransport;
    use async_trait::async_trait;

    const MASTER: &str = "/data/sim_master.h5";

    fn catalog(acquisition: &SimulatedAcquisition) -> Arc<MemoryCatalog> {
        Arc::new(MemoryCatalog::new().with_dataset(MASTER, acquisition.build().unwrap()))
    }

    /// Accepts a fixed number of sends, then fails.
    struct FlakyTransport {
        remaining: usize,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&mut self, _payload: Vec<u8>) -> DetectorResult<()> {
            if self.remaining == 0 {
                return Err(DetectorError::Transport("peer went away".into()));
            }
            self.remaining -= 1;
            Ok(())
        }

        fn endpoint(&self) -> String {
            "flaky".into()
        }
    }

    #[tokio::test]
    async fn load_sets_frames_per_trigger_from_metadata() {
        let acquisition = SimulatedAcquisition {
            ntrigger: 2,
            nimages: 3,
            ..SimulatedAcquisition::new(8, 8, 3, PixelType::U16)
        };
        let (transport, _rx) = ChannelTransport::pair();
        let mut engine = StreamEngine::new(transport, catalog(&acquisition));
        engine
            .load(&LoadRequest::new(MASTER, Compression::None, None))
            .unwrap();
        assert_eq!(engine.state().frames_per_trigger, 6);
        assert_eq!(engine.loaded_frames(), 3);
        assert_eq!(engine.start_message().image_size_x, 8);
    }

    #[tokio::test]
    async fn arm_requires_a_dataset() {
        let (transport, _rx) = ChannelTransport::pair();
        let mut engine = StreamEngine::new(transport, Arc::new(MemoryCatalog::new()));
        assert!(matches!(engine.arm().await, Err(DetectorError::NotLoaded)));
        assert_eq!(engine.state().sequence_id, 0);
    }

    #[tokio::test]
    async fn failed_arm_restores_state() {
        let acquisition = SimulatedAcquisition::new(8, 8, 2, PixelType::U16);
        let mut engine = StreamEngine::new(FlakyTransport { remaining: 0 }, catalog(&acquisition));
        engine
            .load(&LoadRequest::new(MASTER, Compression::Bslz4, None))
            .unwrap();
        let before = engine.state().clone();
        assert!(engine.arm().await.is_err());
        assert_eq!(engine.state(), &before);
        assert!(!engine.is_armed());
    }

    #[tokio::test]
    async fn failed_trigger_rolls_back_counters() {
        let acquisition = SimulatedAcquisition::new(8, 8, 2, PixelType::U32);
        // start message plus two of the three images
        let mut engine = StreamEngine::new(FlakyTransport { remaining: 3 }, catalog(&acquisition))
            .with_frame_delay(Duration::ZERO);
        engine
            .load(&LoadRequest::new(MASTER, Compression::Bslz4, None))
            .unwrap();
        engine.set_frames_per_trigger(3);
        engine.arm().await.unwrap();
        let before = engine.state().clone();
        let err = engine.trigger().await.unwrap_err();
        assert!(matches!(err, DetectorError::Transport(_)));
        assert_eq!(engine.state(), &before);
    }

    #[tokio::test]
    async fn failed_disarm_keeps_series_armed() {
        let acquisition = SimulatedAcquisition::new(8, 8, 1, PixelType::U16);
        // start message only
        let mut engine = StreamEngine::new(FlakyTransport { remaining: 1 }, catalog(&acquisition));
        engine
            .load(&LoadRequest::new(MASTER, Compression::None, None))
            .unwrap();
        engine.arm().await.unwrap();
        let before = engine.state().clone();

        let err = engine.disarm().await.unwrap_err();
        assert!(matches!(err, DetectorError::Transport(_)));
        assert!(engine.is_armed());
        assert_eq!(engine.state(), &before);
    }

    #[tokio::test]
    async fn start_message_carries_header_appendix_and_trigger_count() {
        let acquisition = SimulatedAcquisition::new(8, 8, 2, PixelType::U16);
        let (transport, mut rx) = ChannelTransport::pair();
        let mut engine = StreamEngine::new(transport, catalog(&acquisition));
        engine
            .load(&LoadRequest::new(MASTER, Compression::None, None))
            .unwrap();
        engine.set_frames_per_trigger(5);
        engine.set_header_appendix(serde_json::json!({ "sample": "lysozyme" }));
        let sequence_id = engine.arm().await.unwrap();

        match decode_message(&rx.recv().await.unwrap()).unwrap() {
            StreamMessage::Start(start) => {
                assert_eq!(start.series_id, sequence_id);
                assert_eq!(start.number_of_images, 5);
                assert_eq!(start.user_data, serde_json::json!({ "sample": "lysozyme" }));
                assert_eq!(Some(start.series_unique_id), engine.state().series_unique_id);
            }
            other => panic!("expected start message, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn compression_change_without_dataset_is_recorded() {
        let (transport, _rx) = ChannelTransport::pair();
        let mut engine = StreamEngine::new(transport, Arc::new(MemoryCatalog::new()));
        assert!(engine.compression_change("none").unwrap().is_none());
        assert_eq!(engine.state().compression, Compression::None);
        assert!(engine.set_compression("gzip").is_err());
        assert_eq!(engine.state().compression, Compression::None);
    }

    #[tokio::test]
    async fn disarm_without_arm_sends_end_message() {
        let (transport, mut rx) = ChannelTransport::pair();
        let mut engine = StreamEngine::new(transport, Arc::new(MemoryCatalog::new()));
        engine.disarm().await.unwrap();
        match decode_message(&rx.recv().await.unwrap()).unwrap() {
            StreamMessage::End(end) => {
                assert_eq!(end.series_id, 0);
                assert_eq!(end.series_unique_id, "");
            }
            other => panic!("expected end message, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn zero_file_count_is_rejected() {
        let acquisition = SimulatedAcquisition::new(8, 8, 2, PixelType::U16);
        let err = prepare_load(
            catalog(&acquisition).as_ref(),
            &LoadRequest::new(MASTER, Compression::None, Some(0)),
        )
        .unwrap_err();
        assert!(matches!(err, DetectorError::InvalidFileCount));
    }
}
