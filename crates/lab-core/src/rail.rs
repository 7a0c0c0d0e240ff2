use crate::store::{InsightCard, StateStore};

/// Most recent insights shown across all agents.
pub const RAIL_CAP: usize = 24;

/// One rail slot; borrows from the store it was projected from.
#[derive(Debug, Clone, PartialEq)]
pub struct RailEntry<'a> {
    pub insight: &'a InsightCard,
    pub agent_id: &'a str,
    pub gpu: Option<&'a str>,
}

/// Recency-ordered, capped feed over every agent's insights. Stateless:
/// recomputed from the snapshot map on every change, never mutated
/// independently. Ties on timestamp break by `(run_id, seq)` descending
/// so two viewers always agree on the order.
pub fn project_rail(store: &StateStore) -> Vec<RailEntry<'_>> {
    let mut entries: Vec<RailEntry<'_>> = store
        .agents()
        .flat_map(|agent| {
            agent.insights.iter().map(|insight| RailEntry {
                insight,
                agent_id: agent.id.as_str(),
                gpu: agent.gpu(),
            })
        })
        .collect();

    entries.sort_by(|a, b| {
        b.insight
            .timestamp
            .cmp(&a.insight.timestamp)
            .then_with(|| b.agent_id.cmp(a.agent_id))
            .then_with(|| b.insight.seq.cmp(&a.insight.seq))
    });
    entries.truncate(RAIL_CAP);
    entries
}
