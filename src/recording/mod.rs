//! Persisting frames: per-camera containers, recording workers, the session
//! state machine and its descriptor.

pub mod container;
mod descriptor;
mod session;
mod worker;

pub use container::{ContainerHeader, ContainerReader, ContainerWriter, DecodeError, DecodedFrame};
pub use descriptor::{CameraOutput, DescriptorError, FailureKind, FailureRecord, SessionDescriptor};
pub use session::{
    output_file_name, RecordingSession, SessionError, SessionEvent, SessionFault, SessionOptions,
    SessionOutcome, SessionStatus, OUTPUT_EXTENSION,
};
pub use worker::{
    ContainerSinkFactory, FrameSink, RecordingWorker, SinkFactory, StreamSpec, WorkerReport,
};
