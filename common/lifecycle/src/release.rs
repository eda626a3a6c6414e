//! One-shot release signal for sessions parked after end-of-stream.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Creates a connected writer/reader pair. The writer is not `Clone`, so only
/// whoever owns it (the shutdown coordinator) can release sessions.
pub fn release_channel() -> (ReleaseSignal, ReleaseListener) {
    let token = CancellationToken::new();
    (
        ReleaseSignal {
            token: token.clone(),
        },
        ReleaseListener { token },
    )
}

/// Write side of the release signal. Releasing is write-once: later calls are no-ops.
#[derive(Debug)]
pub struct ReleaseSignal {
    token: CancellationToken,
}

impl ReleaseSignal {
    pub fn release(&self) {
        self.token.cancel();
    }

    pub fn is_released(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Read side of the release signal, handed to every session.
#[derive(Clone, Debug)]
pub struct ReleaseListener {
    token: CancellationToken,
}

impl ReleaseListener {
    /// Resolves once the coordinator releases sessions; immediately if it already has.
    pub fn released(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_released(&self) -> bool {
        self.token.is_cancelled()
    }
}
