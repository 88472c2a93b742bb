//! redb table definitions for the corral resource store.
//!
//! One table: resource rows keyed by `resource_id`, values JSON-encoded
//! [`crate::ResourceRecord`]s.

use redb::TableDefinition;

/// Resource rows keyed by `{resource_id}`.
pub const RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");
