//! # Simulated SIMPLON detector
//!
//! Replays a recorded acquisition as the stream2 CBOR data stream of a
//! photon-counting area detector, so data-acquisition consumers can be tested
//! without hardware.
//!
//! ## Crate Structure
//!
//! - **`dataset`**: reads master files (HDF5 behind `storage_hdf5`, or in
//!   memory) and resolves metadata by short key.
//! - **`codec`**: bit-shuffle/LZ4 frame compression and the tagged CBOR frame
//!   container.
//! - **`messages`**: start, image and end message records and the builder that
//!   fills them from a master file.
//! - **`detector`**: non-streamed detector configuration and lifecycle labels.
//! - **`stream`**: the stream engine (arm / trigger / disarm), its transports
//!   and the actor that serializes commands against it.
//! - **`config`** / **`logging`**: process configuration and tracing setup.
//! - **`error`**: the `DetectorError` taxonomy.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use simplon_sim::codec::Compression;
//! use simplon_sim::dataset::memory::{MemoryCatalog, SimulatedAcquisition};
//! use simplon_sim::dataset::PixelType;
//! use simplon_sim::stream::{ChannelTransport, DetectorActor, LoadRequest, StreamEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dataset = SimulatedAcquisition::new(64, 64, 10, PixelType::U32).build()?;
//! let catalog = Arc::new(MemoryCatalog::new().with_dataset("sim", dataset));
//! let (transport, mut rx) = ChannelTransport::pair();
//! let (detector, _task) = DetectorActor::spawn(StreamEngine::new(transport, catalog));
//!
//! detector.load(LoadRequest::new("sim", Compression::Bslz4, None)).await?;
//! detector.arm().await?;
//! detector.trigger().await?;
//! detector.disarm().await?;
//! while let Ok(message) = rx.try_recv() {
//!     println!("{:?}", simplon_sim::messages::decode_message(&message)?.kind());
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod dataset;
pub mod detector;
pub mod error;
pub mod logging;
pub mod messages;
pub mod stream;
