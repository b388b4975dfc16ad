pub mod events;
pub mod router;
pub mod watcher;

pub use events::{EventResolver, EventSubscriber};
pub use router::{InvalidationRouter, InvalidationSignal, RouterHandle, SignalSource};
pub use watcher::{BlockTick, BlockWatcher};
