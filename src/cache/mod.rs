pub mod query_cache;

pub use query_cache::{query_signature, QueryResultCache};
