//! Edge capture: weigh both bowls, detect feeding/drinking events and turn
//! each closed event into an uploaded clip.

pub mod channel;
pub mod controller;
pub mod detector;
pub mod encoder;
pub mod loop_worker;
pub mod segments;
pub mod sensor;
pub mod worker;

pub use channel::{
    step, ChannelEvent, ChannelId, ChannelPhase, ChannelState, ClipJob, CloseReason,
    DetectorConfig, SensorReading,
};
pub use controller::CaptureController;
pub use detector::EventDetector;
pub use encoder::{FfmpegMerger, SegmentMerger, StreamEncoder};
pub use segments::{resolve_clip_segments, scan_segments, SegmentFile};
pub use sensor::{
    factory_for, RetryPolicy, ScriptedSensor, SensorFactory, SensorSupervisor, SerialLineSensor,
    SimulatedSensor, WeightSensor,
};
pub use worker::{ClipError, ClipOutcome, ClipStatus, ClipSubmitter, ClipWorker, ClipWorkerConfig};
