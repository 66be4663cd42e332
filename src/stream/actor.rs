//! Actor that owns the [`StreamEngine`] and serializes every command.
//!
//! Commands arrive over an mpsc channel and carry a oneshot sender for the
//! reply. Each command variant has a helper constructor returning the command
//! together with the receiver:
//!
//! ```rust
//! use simplon_sim::stream::actor::DetectorCommand;
//!
//! let (cmd, rx) = DetectorCommand::arm();
//! // cmd_tx.send(cmd).await?;
//! // let sequence_id = rx.await??;
//! ```
//!
//! Loads are the exception to strict sequencing: the container read and
//! frame compression run on a blocking worker while the actor keeps serving
//! commands against the previous frames. The prepared dataset is installed
//! between two commands, so a trigger never sees a half-replaced frame list.
//! Only one load may be pending at a time.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::{prepare_load, EngineStatus, LoadRequest, PreparedDataset, StreamEngine, TriggerSummary};
use super::transport::Transport;
use crate::detector::{DetectorConfiguration, DetectorState, StreamConfiguration};
use crate::error::{DetectorError, DetectorResult};
use crate::messages::StartMessage;

/// Capacity of the command channel.
pub const COMMAND_CAPACITY: usize = 32;

type StartUpdate = Box<dyn FnOnce(&mut StartMessage) + Send>;
type DetectorUpdate = Box<dyn FnOnce(&mut DetectorConfiguration) + Send>;

/// Commands understood by [`DetectorActor`].
pub enum DetectorCommand {
    /// Loads a dataset on a worker and installs it when ready.
    ///
    /// Replies once the dataset is installed or the load failed.
    Load {
        /// What to load
        request: LoadRequest,
        /// Response channel
        response: oneshot::Sender<DetectorResult<()>>,
    },
    /// Validates and applies a compression; recompresses a loaded dataset.
    SetCompression {
        /// `bslz4` or `none`
        compression: String,
        /// Response channel
        response: oneshot::Sender<DetectorResult<()>>,
    },
    /// Frames sent by each subsequent trigger.
    SetFramesPerTrigger {
        /// Images per trigger
        frames: u64,
        /// Response channel
        response: oneshot::Sender<()>,
    },
    /// Pause before each image message.
    SetFrameDelay {
        /// Inter-frame delay
        delay: Duration,
        /// Response channel
        response: oneshot::Sender<()>,
    },
    /// User data copied into later start messages.
    SetHeaderAppendix {
        /// JSON value to embed
        appendix: serde_json::Value,
        /// Response channel
        response: oneshot::Sender<()>,
    },
    /// Edits the cached start message in place.
    UpdateStartMessage {
        /// Closure applied by the actor
        update: StartUpdate,
        /// Response channel
        response: oneshot::Sender<()>,
    },
    /// Edits the detector configuration in place.
    UpdateDetectorConfiguration {
        /// Closure applied by the actor
        update: DetectorUpdate,
        /// Response channel
        response: oneshot::Sender<()>,
    },
    /// Reads the cached start message.
    GetStartMessage {
        /// Response channel
        response: oneshot::Sender<StartMessage>,
    },
    /// Reads the detector configuration.
    GetDetectorConfiguration {
        /// Response channel
        response: oneshot::Sender<DetectorConfiguration>,
    },
    /// Reads the stream configuration.
    GetStreamConfiguration {
        /// Response channel
        response: oneshot::Sender<StreamConfiguration>,
    },
    /// Snapshot of the engine state.
    GetStatus {
        /// Response channel
        response: oneshot::Sender<EngineStatus>,
    },
    /// Replies with the new sequence id.
    Arm {
        /// Response channel
        response: oneshot::Sender<DetectorResult<u64>>,
    },
    /// Streams one trigger worth of images.
    Trigger {
        /// Response channel
        response: oneshot::Sender<DetectorResult<TriggerSummary>>,
    },
    /// Sends the end message and closes the series.
    Disarm {
        /// Response channel
        response: oneshot::Sender<DetectorResult<()>>,
    },
    /// Stops the actor. A pending load is abandoned.
    Shutdown {
        /// Response channel
        response: oneshot::Sender<()>,
    },
}

impl DetectorCommand {
    /// Helper to create a Load command
    pub fn load(request: LoadRequest) -> (Self, oneshot::Receiver<DetectorResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Load { request, response: tx }, rx)
    }

    /// Helper to create a SetCompression command
    pub fn set_compression(compression: String) -> (Self, oneshot::Receiver<DetectorResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetCompression {
                compression,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a SetFramesPerTrigger command
    pub fn set_frames_per_trigger(frames: u64) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetFramesPerTrigger { frames, response: tx }, rx)
    }

    /// Helper to create a SetFrameDelay command
    pub fn set_frame_delay(delay: Duration) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetFrameDelay { delay, response: tx }, rx)
    }

    /// Helper to create a SetHeaderAppendix command
    pub fn set_header_appendix(appendix: serde_json::Value) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetHeaderAppendix { appendix, response: tx }, rx)
    }

    /// Helper to create a UpdateStartMessage command
    pub fn update_start_message(
        update: impl FnOnce(&mut StartMessage) + Send + 'static,
    ) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::UpdateStartMessage {
                update: Box::new(update),
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a UpdateDetectorConfiguration command
    pub fn update_detector_configuration(
        update: impl FnOnce(&mut DetectorConfiguration) + Send + 'static,
    ) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::UpdateDetectorConfiguration {
                update: Box::new(update),
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a GetStartMessage command
    pub fn get_start_message() -> (Self, oneshot::Receiver<StartMessage>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStartMessage { response: tx }, rx)
    }

    /// Helper to create a GetDetectorConfiguration command
    pub fn get_detector_configuration() -> (Self, oneshot::Receiver<DetectorConfiguration>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetDetectorConfiguration { response: tx }, rx)
    }

    /// Helper to create a GetStreamConfiguration command
    pub fn get_stream_configuration() -> (Self, oneshot::Receiver<StreamConfiguration>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStreamConfiguration { response: tx }, rx)
    }

    /// Helper to create a GetStatus command
    pub fn get_status() -> (Self, oneshot::Receiver<EngineStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    /// Helper to create an Arm command
    pub fn arm() -> (Self, oneshot::Receiver<DetectorResult<u64>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Arm { response: tx }, rx)
    }

    /// Helper to create a Trigger command
    pub fn trigger() -> (Self, oneshot::Receiver<DetectorResult<TriggerSummary>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Trigger { response: tx }, rx)
    }

    /// Helper to create a Disarm command
    pub fn disarm() -> (Self, oneshot::Receiver<DetectorResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Disarm { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

struct PendingLoad {
    handle: JoinHandle<DetectorResult<PreparedDataset>>,
    response: oneshot::Sender<DetectorResult<()>>,
}

async fn join_pending(pending: &mut Option<PendingLoad>) -> DetectorResult<PreparedDataset> {
    match pending {
        Some(load) => match (&mut load.handle).await {
            Ok(result) => result,
            Err(e) => Err(DetectorError::Dataset(format!("load worker failed: {e}"))),
        },
        None => std::future::pending().await,
    }
}

/// Owns the engine; see the module docs.
pub struct DetectorActor<T: Transport> {
    engine: StreamEngine<T>,
    state_tx: watch::Sender<DetectorState>,
}

impl<T: Transport + 'static> DetectorActor<T> {
    /// Spawns the actor on the current runtime.
    pub fn spawn(engine: StreamEngine<T>) -> (DetectorHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(DetectorState::Idle);
        let actor = Self { engine, state_tx };
        let task = tokio::spawn(actor.run(cmd_rx));
        (
            DetectorHandle {
                tx: cmd_tx,
                state: state_rx,
            },
            task,
        )
    }

    fn settle(&self, pending: &Option<PendingLoad>) {
        let state = if pending.is_some() {
            DetectorState::Configure
        } else if self.engine.is_armed() {
            DetectorState::Ready
        } else {
            DetectorState::Idle
        };
        self.state_tx.send_replace(state);
    }

    fn begin_load(
        &self,
        pending: &mut Option<PendingLoad>,
        request: LoadRequest,
        response: oneshot::Sender<DetectorResult<()>>,
    ) {
        let opener = self.engine.opener();
        info!(path = %request.path.display(), compression = %request.compression, "Loading dataset");
        let handle = tokio::task::spawn_blocking(move || prepare_load(opener.as_ref(), &request));
        *pending = Some(PendingLoad { handle, response });
    }

    /// Processes commands until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<DetectorCommand>) {
        info!("DetectorActor started");
        let mut pending: Option<PendingLoad> = None;

        loop {
            tokio::select! {
                result = join_pending(&mut pending), if pending.is_some() => {
                    if let Some(load) = pending.take() {
                        let reply = result.map(|prepared| self.engine.install(prepared));
                        if let Err(e) = &reply {
                            warn!(error = %e, "Dataset load failed, keeping previous frames");
                        }
                        self.settle(&pending);
                        let _ = load.response.send(reply);
                    }
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        debug!("All detector handles dropped");
                        break;
                    };
                    match command {
                        DetectorCommand::Load { request, response } => {
                            if pending.is_some() {
                                let _ = response.send(Err(DetectorError::LoadInProgress));
                            } else {
                                self.begin_load(&mut pending, request, response);
                            }
                        }

                        DetectorCommand::SetCompression { compression, response } => {
                            if pending.is_some() {
                                let _ = response.send(Err(DetectorError::LoadInProgress));
                            } else {
                                match self.engine.compression_change(&compression) {
                                    Ok(Some(request)) => self.begin_load(&mut pending, request, response),
                                    Ok(None) => {
                                        let _ = response.send(Ok(()));
                                    }
                                    Err(e) => {
                                        let _ = response.send(Err(e));
                                    }
                                }
                            }
                        }

                        DetectorCommand::SetFramesPerTrigger { frames, response } => {
                            self.engine.set_frames_per_trigger(frames);
                            let _ = response.send(());
                        }

                        DetectorCommand::SetFrameDelay { delay, response } => {
                            self.engine.set_frame_delay(delay);
                            let _ = response.send(());
                        }

                        DetectorCommand::SetHeaderAppendix { appendix, response } => {
                            self.engine.set_header_appendix(appendix);
                            let _ = response.send(());
                        }

                        DetectorCommand::UpdateStartMessage { update, response } => {
                            self.engine.update_start_message(update);
                            let _ = response.send(());
                        }

                        DetectorCommand::UpdateDetectorConfiguration { update, response } => {
                            self.engine.update_detector_configuration(update);
                            let _ = response.send(());
                        }

                        DetectorCommand::GetStartMessage { response } => {
                            let _ = response.send(self.engine.start_message().clone());
                        }

                        DetectorCommand::GetDetectorConfiguration { response } => {
                            let _ = response.send(self.engine.detector_configuration().clone());
                        }

                        DetectorCommand::GetStreamConfiguration { response } => {
                            let _ = response.send(self.engine.stream_configuration().clone());
                        }

                        DetectorCommand::GetStatus { response } => {
                            let _ = response.send(self.engine.status());
                        }

                        DetectorCommand::Arm { response } => {
                            let reply = self.engine.arm().await;
                            self.settle(&pending);
                            let _ = response.send(reply);
                        }

                        DetectorCommand::Trigger { response } => {
                            if self.engine.is_armed() {
                                self.state_tx.send_replace(DetectorState::Acquire);
                            }
                            let reply = self.engine.trigger().await;
                            self.settle(&pending);
                            let _ = response.send(reply);
                        }

                        DetectorCommand::Disarm { response } => {
                            let reply = self.engine.disarm().await;
                            self.settle(&pending);
                            let _ = response.send(reply);
                        }

                        DetectorCommand::Shutdown { response } => {
                            info!("DetectorActor shutting down");
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
            self.settle(&pending);
        }

        if pending.is_some() {
            warn!("Abandoning pending dataset load");
        }
        self.state_tx.send_replace(DetectorState::Na);
        info!("DetectorActor stopped");
    }
}

/// Cloneable front end of a running [`DetectorActor`].
#[derive(Clone)]
pub struct DetectorHandle {
    tx: mpsc::Sender<DetectorCommand>,
    state: watch::Receiver<DetectorState>,
}

impl DetectorHandle {
    async fn request<R>(&self, (command, rx): (DetectorCommand, oneshot::Receiver<R>)) -> DetectorResult<R> {
        self.tx
            .send(command)
            .await
            .map_err(|_| DetectorError::ActorStopped)?;
        rx.await.map_err(|_| DetectorError::ActorStopped)
    }

    /// Current lifecycle label, without a round trip to the actor.
    pub fn state(&self) -> DetectorState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<DetectorState> {
        self.state.clone()
    }

    /// Loads a dataset; resolves once it is installed.
    pub async fn load(&self, request: LoadRequest) -> DetectorResult<()> {
        self.request(DetectorCommand::load(request)).await?
    }

    /// Switches compression, recompressing loaded frames.
    pub async fn set_compression(&self, compression: &str) -> DetectorResult<()> {
        self.request(DetectorCommand::set_compression(compression.to_string()))
            .await?
    }

    /// Frames sent per trigger.
    pub async fn set_frames_per_trigger(&self, frames: u64) -> DetectorResult<()> {
        self.request(DetectorCommand::set_frames_per_trigger(frames)).await
    }

    /// Delay before each image message.
    pub async fn set_frame_delay(&self, delay: Duration) -> DetectorResult<()> {
        self.request(DetectorCommand::set_frame_delay(delay)).await
    }

    /// User data for later start messages.
    pub async fn set_header_appendix(&self, appendix: serde_json::Value) -> DetectorResult<()> {
        self.request(DetectorCommand::set_header_appendix(appendix)).await
    }

    /// Applies `update` to the cached start message.
    pub async fn update_start_message(
        &self,
        update: impl FnOnce(&mut StartMessage) + Send + 'static,
    ) -> DetectorResult<()> {
        self.request(DetectorCommand::update_start_message(update)).await
    }

    /// Applies `update` to the detector configuration.
    pub async fn update_detector_configuration(
        &self,
        update: impl FnOnce(&mut DetectorConfiguration) + Send + 'static,
    ) -> DetectorResult<()> {
        self.request(DetectorCommand::update_detector_configuration(update))
            .await
    }

    /// Copy of the cached start message.
    pub async fn start_message(&self) -> DetectorResult<StartMessage> {
        self.request(DetectorCommand::get_start_message()).await
    }

    /// Copy of the detector configuration.
    pub async fn detector_configuration(&self) -> DetectorResult<DetectorConfiguration> {
        self.request(DetectorCommand::get_detector_configuration()).await
    }

    /// Copy of the stream configuration.
    pub async fn stream_configuration(&self) -> DetectorResult<StreamConfiguration> {
        self.request(DetectorCommand::get_stream_configuration()).await
    }

    /// Engine status snapshot.
    pub async fn status(&self) -> DetectorResult<EngineStatus> {
        self.request(DetectorCommand::get_status()).await
    }

    /// Starts a series and returns its id.
    pub async fn arm(&self) -> DetectorResult<u64> {
        self.request(DetectorCommand::arm()).await?
    }

    /// Streams one trigger; waits until the last image is sent.
    pub async fn trigger(&self) -> DetectorResult<TriggerSummary> {
        self.request(DetectorCommand::trigger()).await?
    }

    /// Ends the series.
    pub async fn disarm(&self) -> DetectorResult<()> {
        self.request(DetectorCommand::disarm()).await?
    }

    /// Stops the actor and waits for it to acknowledge.
    pub async fn shutdown(&self) -> DetectorResult<()> {
        self.request(DetectorCommand::shutdown()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compression;
    use crate::dataset::memory::{MemoryCatalog, SimulatedAcquisition};
    use crate::dataset::PixelType;
    use crate::stream::transport::ChannelTransport;
    use std::sync::Arc;

    const MASTER: &str = "/data/sim_master.h5";

    fn spawn_with(acquisition: SimulatedAcquisition) -> (DetectorHandle, mpsc::UnboundedReceiver<Vec<u8>>) {
        let catalog = MemoryCatalog::new().with_dataset(MASTER, acquisition.build().unwrap());
        let (transport, rx) = ChannelTransport::pair();
        let engine = StreamEngine::new(transport, Arc::new(catalog)).with_frame_delay(Duration::ZERO);
        let (handle, _task) = DetectorActor::spawn(engine);
        (handle, rx)
    }

    #[tokio::test]
    async fn handle_drives_a_full_series() {
        let (handle, mut rx) = spawn_with(SimulatedAcquisition::new(8, 8, 2, PixelType::U16));
        handle
            .load(LoadRequest::new(MASTER, Compression::Bslz4, None))
            .await
            .unwrap();
        assert_eq!(handle.state(), DetectorState::Idle);

        let sequence_id = handle.arm().await.unwrap();
        assert_eq!(sequence_id, 1);
        assert_eq!(handle.state(), DetectorState::Ready);

        handle.set_frames_per_trigger(3).await.unwrap();
        let summary = handle.trigger().await.unwrap();
        assert_eq!(summary.frames_sent, 3);
        assert_eq!(summary.last_image_id, Some(2));

        handle.disarm().await.unwrap();
        assert_eq!(handle.state(), DetectorState::Idle);

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 1 + 3 + 1);
    }

    #[tokio::test]
    async fn start_message_updates_apply_on_next_arm() {
        let (handle, _rx) = spawn_with(SimulatedAcquisition::new(8, 8, 1, PixelType::U32));
        handle
            .load(LoadRequest::new(MASTER, Compression::None, None))
            .await
            .unwrap();
        handle
            .update_start_message(|start| start.count_time = 0.5)
            .await
            .unwrap();
        assert_eq!(handle.start_message().await.unwrap().count_time, 0.5);
    }

    #[tokio::test]
    async fn failed_load_reports_error_and_keeps_state() {
        let (handle, _rx) = spawn_with(SimulatedAcquisition::new(8, 8, 1, PixelType::U16));
        let err = handle
            .load(LoadRequest::new("/data/missing_master.h5", Compression::Bslz4, None))
            .await
            .unwrap_err();
        assert!(matches!(err, DetectorError::Dataset(_)));
        assert!(handle.status().await.unwrap().dataset.is_none());
    }

    #[tokio::test]
    async fn handle_reports_stopped_actor() {
        let (handle, _rx) = spawn_with(SimulatedAcquisition::default());
        handle.shutdown().await.unwrap();
        assert!(matches!(handle.arm().await, Err(DetectorError::ActorStopped)));
    }
}
