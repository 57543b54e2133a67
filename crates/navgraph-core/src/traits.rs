use futures::future::BoxFuture;

use crate::error::Result;
use crate::tree::{Action, Verification};
use crate::types::ActionOutcome;

/// Device controller: drives the device under test.
///
/// Implementations must be safe to call repeatedly with the same action and
/// must eventually return. An `Err` is treated by the engine as an ordinary
/// failed action.
pub trait DeviceController: Send + Sync + 'static {
    /// Execute a single action against the device.
    fn execute(&self, action: &Action) -> BoxFuture<'_, Result<ActionOutcome>>;

    /// Controller name for logs.
    fn name(&self) -> &str {
        "device"
    }
}

/// Verification provider: image/text/audio checks against the device output.
pub trait VerificationProvider: Send + Sync + 'static {
    /// Run a single verification descriptor.
    fn run(&self, verification: &Verification) -> BoxFuture<'_, Result<ActionOutcome>>;
}
