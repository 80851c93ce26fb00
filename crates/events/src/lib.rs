//! `lingoq-events`: explicit message passing for job lifecycle events.
//!
//! Workers push events onto a bus; observability consumers drain their own
//! subscription. There is no listener registry and no callback ordering to
//! reason about: a consumer that falls behind only delays itself.

pub mod bus;
pub mod in_memory_bus;
pub mod lifecycle;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use lifecycle::{JobLifecycleEvent, LifecycleKind};
