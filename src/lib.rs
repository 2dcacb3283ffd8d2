pub mod alarm;
pub mod cache;
pub mod config;
pub mod db;
pub mod directory;
pub mod entity;
pub mod error;
pub mod graph;
pub mod query;

pub use alarm::{Alarm, AlarmService, AlarmSeverity, AlarmStatus};
pub use config::Config;
pub use directory::{EntityDirectory, InMemoryDirectory, KeyValueSource};
pub use entity::{EntityRef, EntityType};
pub use error::{RelgraphError, Result};
pub use graph::{EntityRelation, RelationPathQuery, RelationService, RelationsQuery, SearchDirection};
