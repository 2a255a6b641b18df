//! Blocking-chain trees built from one running-query snapshot generation.

use crate::db::{DbError, RunningQuerySnapshot, Store};
use crate::probe::truncate_chars;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Query text kept per node.
pub const NODE_QUERY_TEXT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockingNode {
    pub session_id: i64,
    pub login_name: Option<String>,
    pub host_name: Option<String>,
    pub program_name: Option<String>,
    pub database_name: Option<String>,
    pub query_text: Option<String>,
    pub duration_ms: Option<i64>,
    pub cpu_time_ms: Option<i64>,
    pub wait_type: Option<String>,
    pub blocked: Vec<BlockingNode>,
}

impl BlockingNode {
    fn leaf(q: &RunningQuerySnapshot) -> Self {
        Self {
            session_id: q.session_id,
            login_name: q.login_name.clone(),
            host_name: q.host_name.clone(),
            program_name: q.program_name.clone(),
            database_name: q.database_name.clone(),
            query_text: q
                .query_text
                .as_deref()
                .map(|t| truncate_chars(t, NODE_QUERY_TEXT_CHARS)),
            duration_ms: q.duration_ms,
            cpu_time_ms: q.cpu_time_ms,
            wait_type: q.wait_type.clone(),
            blocked: Vec::new(),
        }
    }

    /// Sessions below this node.
    pub fn blocked_count(&self) -> usize {
        self.blocked
            .iter()
            .map(|child| 1 + child.blocked_count())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockingChains {
    pub chains: Vec<BlockingNode>,
    pub total_blocked_sessions: usize,
    pub collected_at: Option<DateTime<Utc>>,
}

/// Build one tree per root blocker: a session that blocks another but is
/// not blocked itself. Roots and children are ordered by session id.
///
/// A branch that would revisit a session already on its path is cut, so
/// inconsistent data forming a cycle never loops.
pub fn build_blocking_chains(queries: &[RunningQuerySnapshot]) -> BlockingChains {
    // First row wins when a session has several requests.
    let mut by_session: BTreeMap<i64, &RunningQuerySnapshot> = BTreeMap::new();
    for q in queries {
        by_session.entry(q.session_id).or_insert(q);
    }

    let mut children: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    for q in by_session.values() {
        if let Some(blocker) = q.blocking_session_id {
            children.entry(blocker).or_default().insert(q.session_id);
        }
    }

    let chains: Vec<BlockingNode> = by_session
        .values()
        .filter(|q| q.blocking_session_id.is_none() && children.contains_key(&q.session_id))
        .filter_map(|q| build_tree(q.session_id, &by_session, &children, &mut HashSet::new()))
        .collect();

    let total_blocked_sessions = chains.iter().map(BlockingNode::blocked_count).sum();
    BlockingChains {
        chains,
        total_blocked_sessions,
        collected_at: queries.first().map(|q| q.collected_at),
    }
}

fn build_tree(
    session_id: i64,
    by_session: &BTreeMap<i64, &RunningQuerySnapshot>,
    children: &BTreeMap<i64, BTreeSet<i64>>,
    path: &mut HashSet<i64>,
) -> Option<BlockingNode> {
    let query = by_session.get(&session_id)?;
    if !path.insert(session_id) {
        return None;
    }

    let mut node = BlockingNode::leaf(query);
    if let Some(blocked) = children.get(&session_id) {
        node.blocked = blocked
            .iter()
            .filter_map(|child| build_tree(*child, by_session, children, path))
            .collect();
    }

    path.remove(&session_id);
    Some(node)
}

/// Chains for the newest running-query generation of a server.
pub fn blocking_chains_for_server(store: &Store, server_id: i64) -> Result<BlockingChains, DbError> {
    store.get_server(server_id)?;
    let queries = store.latest_running_queries(server_id)?;
    Ok(build_blocking_chains(&queries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(session_id: i64, blocked_by: Option<i64>) -> RunningQuerySnapshot {
        RunningQuerySnapshot {
            session_id,
            blocking_session_id: blocked_by,
            query_text: Some(format!("SELECT {}", session_id)),
            ..Default::default()
        }
    }

    #[test]
    fn test_simple_chain() {
        // 51 blocks 52 and 53; 53 blocks 54. 60 is idle.
        let queries = vec![
            q(53, Some(51)),
            q(51, None),
            q(52, Some(51)),
            q(54, Some(53)),
            q(60, None),
        ];
        let result = build_blocking_chains(&queries);
        assert_eq!(result.chains.len(), 1);
        let root = &result.chains[0];
        assert_eq!(root.session_id, 51);
        let kids: Vec<i64> = root.blocked.iter().map(|n| n.session_id).collect();
        assert_eq!(kids, vec![52, 53]);
        assert_eq!(root.blocked[1].blocked[0].session_id, 54);
        assert_eq!(result.total_blocked_sessions, 3);
    }

    #[test]
    fn test_cycle_has_no_roots() {
        let queries = vec![q(1, Some(3)), q(2, Some(1)), q(3, Some(2))];
        let result = build_blocking_chains(&queries);
        assert!(result.chains.is_empty());
        assert_eq!(result.total_blocked_sessions, 0);
    }

    #[test]
    fn test_self_blocking_session_is_not_a_root() {
        let queries = vec![q(1, None), q(2, Some(1)), q(4, Some(4))];
        let result = build_blocking_chains(&queries);
        assert_eq!(result.chains.len(), 1);
        assert_eq!(result.total_blocked_sessions, 1);
    }

    #[test]
    fn test_same_generation_gives_same_trees() {
        let queries = vec![q(10, None), q(11, Some(10)), q(12, Some(11)), q(13, Some(10))];
        assert_eq!(build_blocking_chains(&queries), build_blocking_chains(&queries));
    }

    #[test]
    fn test_dangling_blocker_is_ignored() {
        let queries = vec![q(5, Some(999)), q(6, None), q(7, Some(6))];
        let result = build_blocking_chains(&queries);
        assert_eq!(result.chains.len(), 1);
        assert_eq!(result.chains[0].session_id, 6);
        assert_eq!(result.total_blocked_sessions, 1);
    }

    #[test]
    fn test_node_query_text_is_truncated() {
        let mut root = q(1, None);
        root.query_text = Some("x".repeat(500));
        let result = build_blocking_chains(&[root, q(2, Some(1))]);
        assert_eq!(
            result.chains[0].query_text.as_ref().map(|t| t.chars().count()),
            Some(NODE_QUERY_TEXT_CHARS)
        );
    }
}
