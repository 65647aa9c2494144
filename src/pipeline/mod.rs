//! Pipeline lifecycle and event delivery.
//!
//! The controller owns the state machine; results, state changes and errors
//! reach the application through the dispatcher's bounded queue.

pub mod clock;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{ControlOutcome, PipelineController, PipelineStats};
pub use dispatcher::{DeliveryHandle, EventStream, ResultDispatcher};
pub use error::StationError;
pub use event::{ErrorEvent, EventCollector, PipelineEvent, StateChange, Subscriber};
pub use state::{FailureReason, PipelineState, StateCell};
