//! Shared event schema for the cortex runtime.
//!
//! Every stage of the engine, from the adapters and the bus through the
//! gate and the agent orchestrator, consumes and produces
//! [`observation::Observation`] values. Keeping the schema in its own
//! crate lets adapter and collaborator crates depend on the types without
//! pulling in the runtime.

pub mod observation;

pub use observation::Actor;
pub use observation::ActorType;
pub use observation::AlertPayload;
pub use observation::AlertSeverity;
pub use observation::ControlPayload;
pub use observation::Evidence;
pub use observation::MessagePayload;
pub use observation::Observation;
pub use observation::ObservationType;
pub use observation::Payload;
pub use observation::SchedulePayload;
pub use observation::SourceKind;
pub use observation::SystemPayload;
pub use observation::WorldDataPayload;
