use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use common::storage::types::{
    chunk::Chunk,
    message::ChunkReference,
};
use tracing::debug;

use crate::{
    events::{ChatEvent, Next, Plugin, PluginError},
    turn::{ChatTurn, Passage},
};

/// Deduplicates candidates by (knowledge-id, chunk-index), drops disabled
/// chunks, optionally expands each passage with its pre/next neighbors, and
/// fixes the reference list for the rest of the turn.
pub struct MergeResultPlugin;

#[async_trait]
impl Plugin for MergeResultPlugin {
    fn name(&self) -> &'static str {
        "merge_result"
    }

    fn activates_on(&self) -> &'static [ChatEvent] {
        &[ChatEvent::MergeResult]
    }

    async fn handle(&self, turn: &mut ChatTurn, next: Next<'_>) -> Result<(), PluginError> {
        let mut seen: HashSet<(String, u32)> = HashSet::new();
        let deduped: Vec<_> = turn
            .candidates
            .iter()
            .filter(|candidate| {
                seen.insert((candidate.knowledge_id.clone(), candidate.chunk_index))
            })
            .cloned()
            .collect();

        let ids: Vec<String> = deduped.iter().map(|c| c.chunk_id.clone()).collect();
        let chunk_rows = Chunk::get_many(ids, &turn.services.db)
            .await
            .map_err(PluginError::from)?;
        let chunks_by_id: HashMap<String, Chunk> = chunk_rows
            .into_iter()
            .map(|chunk| (chunk.id.clone(), chunk))
            .collect();

        // Neighbor rows are fetched in one batch when expansion is on.
        let neighbors_by_id = if turn.session.enable_neighbor_expansion {
            let mut neighbor_ids: Vec<String> = Vec::new();
            for candidate in &deduped {
                if let Some(chunk) = chunks_by_id.get(&candidate.chunk_id) {
                    neighbor_ids.extend(chunk.pre_chunk_id.iter().cloned());
                    neighbor_ids.extend(chunk.next_chunk_id.iter().cloned());
                }
            }
            neighbor_ids.retain(|id| !chunks_by_id.contains_key(id));
            let rows = Chunk::get_many(neighbor_ids, &turn.services.db)
                .await
                .map_err(PluginError::from)?;
            rows.into_iter()
                .map(|chunk| (chunk.id.clone(), chunk))
                .collect()
        } else {
            HashMap::new()
        };

        let mut passages = Vec::with_capacity(deduped.len());
        let mut references = Vec::with_capacity(deduped.len());

        for candidate in deduped {
            let chunk = chunks_by_id.get(&candidate.chunk_id);
            if chunk.is_some_and(|chunk| !chunk.is_enabled) {
                continue;
            }

            let content = match (turn.session.enable_neighbor_expansion, chunk) {
                (true, Some(chunk)) => {
                    expand_with_neighbors(chunk, &candidate.content, &neighbors_by_id)
                }
                _ => candidate.content.clone(),
            };

            references.push(ChunkReference {
                chunk_id: candidate.chunk_id.clone(),
                knowledge_id: candidate.knowledge_id.clone(),
                score: candidate.score,
                match_type: candidate.match_type,
            });
            passages.push(Passage {
                chunk_id: candidate.chunk_id,
                knowledge_id: candidate.knowledge_id,
                chunk_index: candidate.chunk_index,
                content,
                score: candidate.score,
                match_type: candidate.match_type,
                image_info: chunk.and_then(|chunk| chunk.image_info.clone()),
            });
        }

        debug!(
            passages = passages.len(),
            neighbor_expansion = turn.session.enable_neighbor_expansion,
            "Merged retrieval candidates"
        );

        turn.passages = passages;
        turn.references = references;

        next.run(turn).await
    }
}

fn expand_with_neighbors(
    chunk: &Chunk,
    fallback_content: &str,
    neighbors: &HashMap<String, Chunk>,
) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(3);
    if let Some(pre) = chunk.pre_chunk_id.as_ref().and_then(|id| neighbors.get(id)) {
        if pre.is_enabled {
            parts.push(&pre.content);
        }
    }
    parts.push(if chunk.content.is_empty() {
        fallback_content
    } else {
        &chunk.content
    });
    if let Some(nxt) = chunk.next_chunk_id.as_ref().and_then(|id| neighbors.get(id)) {
        if nxt.is_enabled {
            parts.push(&nxt.content);
        }
    }
    parts.join("\n")
}
