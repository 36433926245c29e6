pub mod dsl;

pub use dsl::{identity_query, SyncFilter};
