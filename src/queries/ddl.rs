use sea_query::{ColumnDef, Index, SqliteQueryBuilder, Table};

use crate::schema::KvEntries;

/// CREATE TABLE IF NOT EXISTS kv_entries (
///     key TEXT PRIMARY KEY,
///     object_type TEXT,
///     value BLOB NOT NULL
/// )
pub fn create_kv_entries_table() -> String {
    Table::create()
        .table(KvEntries::Table)
        .if_not_exists()
        .col(ColumnDef::new(KvEntries::Key).string().primary_key())
        .col(ColumnDef::new(KvEntries::ObjectType).string().null())
        .col(ColumnDef::new(KvEntries::Value).blob().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_kv_entries_object_type ON kv_entries(object_type)
pub fn create_object_type_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_kv_entries_object_type")
        .table(KvEntries::Table)
        .col(KvEntries::ObjectType)
        .to_string(SqliteQueryBuilder)
}
