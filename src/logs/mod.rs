//! Log demultiplexing and broadcast.
//!
//! - [`frame`]: 8-byte-header frame codec.
//! - [`lines`]: header-stripping line mode used by readiness checks.
//! - [`consumer`]: consumer trait, ready-made consumers, consumer list.
//! - [`producer`]: background worker fanning frames out to consumers.

pub mod consumer;
pub mod frame;
pub mod lines;
pub mod producer;

pub use consumer::{ChannelConsumer, ConsumerList, LogConsumer, TracingConsumer};
pub use frame::{encode_frames, FrameCodec, LogFrame, StreamKind};
pub use lines::{LogLine, LogLineCodec};
pub use producer::LogProducer;
