//! Interrupt delivery.

use std::sync::Arc;

/// Implemented by drivers that want to be called when their interrupt fires.
pub trait InterruptHandler: Send + Sync {
    fn handle_interrupt(&self, vector: u8);
}

/// The host's interrupt routing service.
pub trait InterruptService: Send + Sync {
    /// Route `vector` to `handler`. A later assignment for the same vector
    /// replaces the earlier one.
    fn assign(&self, vector: u8, handler: Arc<dyn InterruptHandler>);

    /// Unmask a (level-triggered) interrupt line at the interrupt
    /// controller.
    fn unmask_line(&self, line: u8);
}
