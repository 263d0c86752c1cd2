use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};

use crate::schema::KvEntries;

/// SELECT value FROM kv_entries WHERE key = ?
pub fn select_value(key: &str) -> String {
    Query::select()
        .column(KvEntries::Value)
        .from(KvEntries::Table)
        .and_where(Expr::col(KvEntries::Key).eq(key))
        .to_string(SqliteQueryBuilder)
}

/// SELECT key, value FROM kv_entries WHERE object_type = ? ORDER BY key
pub fn select_by_object_type(object_type: &str) -> String {
    Query::select()
        .columns([KvEntries::Key, KvEntries::Value])
        .from(KvEntries::Table)
        .and_where(Expr::col(KvEntries::ObjectType).eq(object_type))
        .order_by(KvEntries::Key, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// INSERT INTO kv_entries (key, object_type, value) VALUES (?, ?, ?)
/// ON CONFLICT (key) DO UPDATE SET object_type = excluded.object_type, value = excluded.value
pub fn upsert(key: &str, value: &[u8], object_type: Option<&str>) -> String {
    Query::insert()
        .into_table(KvEntries::Table)
        .columns([KvEntries::Key, KvEntries::ObjectType, KvEntries::Value])
        .values_panic([
            key.into(),
            object_type.map(str::to_owned).into(),
            value.to_vec().into(),
        ])
        .on_conflict(
            OnConflict::column(KvEntries::Key)
                .update_columns([KvEntries::ObjectType, KvEntries::Value])
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM kv_entries WHERE key = ?
pub fn delete(key: &str) -> String {
    Query::delete()
        .from_table(KvEntries::Table)
        .and_where(Expr::col(KvEntries::Key).eq(key))
        .to_string(SqliteQueryBuilder)
}

/// INSERT INTO kv_entries (key, value) VALUES (?, ?) ON CONFLICT (key) DO NOTHING
///
/// Affects one row only when the key was absent.
pub fn insert_if_absent(key: &str, value: &[u8]) -> String {
    Query::insert()
        .into_table(KvEntries::Table)
        .columns([KvEntries::Key, KvEntries::Value])
        .values_panic([key.into(), value.to_vec().into()])
        .on_conflict(OnConflict::column(KvEntries::Key).do_nothing().to_owned())
        .to_string(SqliteQueryBuilder)
}

/// UPDATE kv_entries SET value = ? WHERE key = ? AND value = ?
pub fn update_if_matches(key: &str, expected: &[u8], value: &[u8]) -> String {
    Query::update()
        .table(KvEntries::Table)
        .value(KvEntries::Value, value.to_vec())
        .and_where(Expr::col(KvEntries::Key).eq(key))
        .and_where(Expr::col(KvEntries::Value).eq(expected.to_vec()))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM kv_entries WHERE key = ? AND value = ?
pub fn delete_if_matches(key: &str, expected: &[u8]) -> String {
    Query::delete()
        .from_table(KvEntries::Table)
        .and_where(Expr::col(KvEntries::Key).eq(key))
        .and_where(Expr::col(KvEntries::Value).eq(expected.to_vec()))
        .to_string(SqliteQueryBuilder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_value() {
        let sql = select_value("Queue_d1_audio");
        assert_eq!(
            sql,
            r#"SELECT "value" FROM "kv_entries" WHERE "key" = 'Queue_d1_audio'"#
        );
    }

    #[test]
    fn test_select_by_object_type_is_ordered() {
        let sql = select_by_object_type("queue");
        assert!(sql.contains(r#"WHERE "object_type" = 'queue'"#));
        assert!(sql.ends_with(r#"ORDER BY "key" ASC"#));
    }

    #[test]
    fn test_upsert_null_object_type() {
        let sql = upsert("Blob_d1_audio_1", b"ab", None);
        assert!(sql.contains("NULL"));
        assert!(sql.contains("ON CONFLICT"));
    }

    #[test]
    fn test_insert_if_absent_does_nothing_on_conflict() {
        let sql = insert_if_absent("Lock_d1_audio", b"1");
        assert!(sql.contains("ON CONFLICT"));
        assert!(sql.contains("DO NOTHING"));
    }

    #[test]
    fn test_conditional_statements_compare_value() {
        assert!(update_if_matches("k", b"1", b"2").contains(r#""value" = "#));
        assert!(delete_if_matches("k", b"1").starts_with(r#"DELETE FROM "kv_entries""#));
    }
}
