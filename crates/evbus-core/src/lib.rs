// evbus-core: node-local event pools and the periodic control-loop driver.
//
// Everything here is transport-agnostic: pools hold events and account for
// them, the control loop paces the tasks that drain them.  The listener
// service wires these into an actual node.

pub mod control_loop;
pub mod pool;

pub use control_loop::ControlLoop;
pub use pool::{EventMetadata, EventPool, OverflowPolicy, PoolError, PoolStats};
