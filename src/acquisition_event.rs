//! Ordered event stream produced by the acquisition pipeline.

use crate::acquisition::AcquisitionError;
use crate::acquisition_config::{AcquisitionConfig, ChannelSet, OperationMode};
use std::borrow::Cow;

/// Describes the acquisition that the following events belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub sample_rate: u64,
    pub channels: ChannelSet,
    /// 0 when the acquisition is unbounded.
    pub limit_samples: u64,
    pub unit_pitch: u16,
    /// Samples preceding the trigger point that will be delivered.
    pub pretrigger_samples: usize,
    pub mode: OperationMode,
}

impl Header {
    pub fn from_config(config: &AcquisitionConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels.clone(),
            limit_samples: config.limit_samples,
            unit_pitch: config.unit_pitch,
            pretrigger_samples: config.pretrigger_samples(),
            mode: config.mode,
        }
    }
}

/// Whole sample rows, borrowed from the transfer buffer while the event is
/// being delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket<'a> {
    pub channel_mask: u64,
    pub data: Cow<'a, [u8]>,
    pub unit_pitch: u16,
    /// Set when a self-test sequence check failed inside this packet.
    pub error: bool,
}

impl DataPacket<'_> {
    pub fn rows(&self, stride: usize) -> usize {
        self.data.len() / stride
    }

    pub fn into_owned(self) -> DataPacket<'static> {
        DataPacket {
            channel_mask: self.channel_mask,
            data: Cow::Owned(self.data.into_owned()),
            unit_pitch: self.unit_pitch,
            error: self.error,
        }
    }
}

#[derive(Debug)]
pub enum AcquisitionEvent<'a> {
    Header(Header),
    /// `offset` samples of this acquisition precede the trigger point.
    Trigger { offset: u64 },
    Data(DataPacket<'a>),
    End,
    Error(AcquisitionError),
}

impl AcquisitionEvent<'_> {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionEvent::Header(_) => "header",
            AcquisitionEvent::Trigger { .. } => "trigger",
            AcquisitionEvent::Data(_) => "data",
            AcquisitionEvent::End => "end",
            AcquisitionEvent::Error(_) => "error",
        }
    }

    pub fn into_owned(self) -> AcquisitionEvent<'static> {
        match self {
            AcquisitionEvent::Header(header) => AcquisitionEvent::Header(header),
            AcquisitionEvent::Trigger { offset } => AcquisitionEvent::Trigger { offset },
            AcquisitionEvent::Data(packet) => AcquisitionEvent::Data(packet.into_owned()),
            AcquisitionEvent::End => AcquisitionEvent::End,
            AcquisitionEvent::Error(error) => AcquisitionEvent::Error(error),
        }
    }
}

/// Receives pipeline events in acquisition order.
///
/// Called on the acquisition thread; implementations must not block on the
/// consumer.
pub trait EventSink {
    fn emit(&mut self, event: AcquisitionEvent<'_>);
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn emit(&mut self, event: AcquisitionEvent<'_>) {
        (**self).emit(event);
    }
}

impl EventSink for Vec<AcquisitionEvent<'static>> {
    fn emit(&mut self, event: AcquisitionEvent<'_>) {
        self.push(event.into_owned());
    }
}

/// Forwards events to another thread. Events are dropped once the receiver
/// has gone away.
impl EventSink for crossbeam_channel::Sender<AcquisitionEvent<'static>> {
    fn emit(&mut self, event: AcquisitionEvent<'_>) {
        let kind = event.as_str();
        if self.send(event.into_owned()).is_err() {
            log::warn!("Event receiver disconnected, dropping {kind} event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_owned_copies_borrowed_data() {
        let buffer = vec![1u8, 2, 3, 4];
        let event = AcquisitionEvent::Data(DataPacket {
            channel_mask: 0b11,
            data: Cow::Borrowed(&buffer[..2]),
            unit_pitch: 1,
            error: false,
        });
        let owned = event.into_owned();
        drop(buffer);
        match owned {
            AcquisitionEvent::Data(packet) => {
                assert!(matches!(packet.data, Cow::Owned(_)));
                assert_eq!(packet.data.as_ref(), &[1, 2]);
                assert_eq!(packet.rows(2), 1);
            }
            other => panic!("unexpected event {}", other.as_str()),
        }
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (mut sender, receiver) = crossbeam_channel::unbounded();
        sender.emit(AcquisitionEvent::Trigger { offset: 3 });
        assert!(matches!(
            receiver.try_recv(),
            Ok(AcquisitionEvent::Trigger { offset: 3 })
        ));
        drop(receiver);
        sender.emit(AcquisitionEvent::End);
    }

    #[test]
    fn test_header_from_config() {
        let config = AcquisitionConfig::default()
            .with_limit_samples(200)
            .with_trigger(crate::trigger_config::TriggerConfig::free_run().with_position(10));
        let header = Header::from_config(&config);
        assert_eq!(header.pretrigger_samples, 20);
        assert_eq!(header.limit_samples, 200);
        assert_eq!(header.channels, config.channels);
    }
}
