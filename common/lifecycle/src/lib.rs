//! Shutdown orchestration for a gRPC server holding long-lived duplex streams:
//! signal trapping, a monotonic Running → Draining → Stopping → Stopped state
//! machine, health flip before the listener stops, a one-shot release signal for
//! drained sessions, and timeout-bounded escalation to a forced stop.

mod coordinator;
mod error;
mod metrics;
mod release;
mod signals;
mod stop;

pub use coordinator::{
    ShutdownCoordinator, ShutdownCoordinatorBuilder, ShutdownHandle, ShutdownOutcome,
    ShutdownState,
};
pub use error::LifecycleError;
pub use release::{release_channel, ReleaseListener, ReleaseSignal};
pub use stop::GracefulStop;
