use sea_query::Iden;

/// Key-value table backing a recording store
///
/// `object_type` is the secondary index; queue records carry `"queue"`,
/// chunks, leases and flush markers leave it NULL.
#[derive(Iden)]
pub enum KvEntries {
    Table,
    Key,
    ObjectType,
    Value,
}
