//! # dslcapture
//!
//! Acquisition core for USB logic analyzers: keeps bulk reads in flight,
//! runs a multi-stage software trigger over the incoming rows, and records the
//! resulting stream into a bounded sample ring with a multi-resolution
//! min/max envelope for fast zoomed-out display.
//!
//! ## Features
//!
//! - **Acquisition pipeline**: configure, start and stop a device behind the
//!   [`DeviceChannel`] trait; events arrive in order as Header, Trigger, Data
//!   and exactly one End
//! - **Software trigger**: up to 16 stages of level/edge terms with repeat
//!   counts and pre-trigger context, matched across transfer boundaries
//! - **Sample store**: fixed-capacity ring shared between the acquisition
//!   thread and readers, with envelope levels kept in step on every append
//! - **DataFrame output**: export a capture to `polars` with a time column
//! - **Devices**: a pattern-generating [`DemoDevice`] and a [`SerialDevice`]
//!   streaming over `serialport`
//!
//! ## Examples
//!
//! ### Capture a pattern into a store
//!
//! ```rust
//! use dslcapture::{
//!     AcquisitionConfig, AcquisitionPipeline, CaptureFeed, ChannelSet, DemoDevice, Pattern,
//!     PipelineState, SampleStore,
//! };
//! use std::sync::Arc;
//!
//! let store = Arc::new(SampleStore::new());
//! let mut pipeline = AcquisitionPipeline::new(
//!     DemoDevice::new(Pattern::Counter),
//!     CaptureFeed::new(Arc::clone(&store)),
//! );
//!
//! let config =
//!     AcquisitionConfig::new(1_000_000, ChannelSet::first(8, 1)).with_limit_samples(10_000);
//! pipeline.start(config)?;
//! assert_eq!(pipeline.run(), PipelineState::Finished);
//! assert_eq!(store.logical_count(), 10_000);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Trigger on a rising edge
//!
//! ```rust
//! use dslcapture::{TriggerConfig, TriggerStage};
//!
//! let trigger = TriggerConfig::new(vec![
//!     TriggerStage::when().low(0).matches_for(3),
//!     TriggerStage::when().rising(0).high(1).matches(),
//! ])
//! .with_position(25);
//! assert_eq!(trigger.stages().len(), 2);
//! ```

pub mod acquisition;
pub mod acquisition_config;
pub mod acquisition_event;
pub mod capture_feed;
pub mod capture_frame;
pub mod demo_device;
pub mod device_channel;
pub mod envelope_cache;
pub mod ring_index;
pub mod sample_store;
pub mod serial_device;
pub mod transfer_pool;
pub mod trigger_config;
pub mod trigger_matcher;

// Re-export the main types for convenience
pub use acquisition::{AcquisitionError, AcquisitionPipeline, PipelineState, StopHandle};

pub use acquisition_config::{AcquisitionConfig, ChannelSet, ConfigError, OperationMode};

pub use acquisition_event::{AcquisitionEvent, DataPacket, EventSink, Header};

pub use capture_feed::CaptureFeed;

pub use device_channel::{
    ControlCommand, DeviceChannel, DeviceError, DeviceSettings, TransferCompletion,
    TransferStatus,
};

pub use demo_device::{DemoDevice, Pattern};

pub use serial_device::{SerialDevice, SerialDeviceInfo};

pub use envelope_cache::{EnvelopeSample, EnvelopeSection, EnvelopeSnapshot};

pub use sample_store::{SampleStore, StoreError, StoreView};

pub use transfer_pool::{TransferHandle, TransferPool};

pub use trigger_config::{
    BitState, StageBuilder, StageLogic, TriggerConfig, TriggerStage, TriggerTerm,
};

pub use trigger_matcher::{MatchResult, TriggerMatcher};
