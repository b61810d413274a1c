//! Consistency selection for coordination queries.

use scylla::client::session::Session;
use scylla::statement::unprepared::Statement;
use scylla::statement::Consistency;

// The peers table is local to whichever node coordinates the query, so the
// default consistency is good enough here. Its rows do not include the
// coordinator itself, hence any row at all means more than one host.
async fn cluster_has_multiple_hosts(session: &Session) -> anyhow::Result<bool> {
    let peers = session
        .query_unpaged("SELECT peer FROM system.peers", &[])
        .await?
        .into_rows_result()?
        .rows_num();
    Ok(peers > 0)
}

/// Picks the read consistency the coordination layer uses, recomputed per
/// statement: `QUORUM` when the cluster has more than one host, else `ONE`.
pub(crate) async fn select_consistency(session: &Session) -> anyhow::Result<Consistency> {
    Ok(if cluster_has_multiple_hosts(session).await? {
        Consistency::Quorum
    } else {
        Consistency::One
    })
}

pub(crate) async fn new_coordination_query(
    stmt: String,
    session: &Session,
) -> anyhow::Result<Statement> {
    let mut query = Statement::new(stmt);
    query.set_consistency(select_consistency(session).await?);

    Ok(query)
}
