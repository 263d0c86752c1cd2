//! SQL statements for the key-value table, built with sea-query.

pub mod ddl;
pub mod kv;
