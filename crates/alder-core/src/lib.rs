pub mod config;
pub mod derived;
pub mod events;
pub mod graph;
pub mod metamodel;
pub mod model;
pub mod repository;
pub mod sync;

mod indexer;

pub use config::Config;
pub use events::{ChangeBus, ChangeEvent, ChangeListener};
pub use graph::{GraphBackend, MemoryGraph, NodeId, PropertyValue};
pub use indexer::{IndexStats, IndexerState, ModelIndexer};
pub use sync::{SyncError, SyncOutcome, SyncReport};
