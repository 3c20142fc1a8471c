use crate::embeddings::Embedder;
use crate::error::{SearchError, StoreError};
use crate::models::{MetadataFilter, NearestHit, NeighborScope, SearchQuery, SearchResult};
use crate::traits::VectorIndex;
use tracing::debug;

/// Nearest-neighbor search widened to each hit's sequence neighbors.
///
/// Hits come back with their raw cosine distance. Callers turn it into a
/// percentage with [`crate::models::relevance_percent`], i.e.
/// `max(0, (2 - distance) / 2 * 100)`.
pub struct QueryEngine<'a, S, E>
where
    S: VectorIndex,
    E: Embedder + ?Sized,
{
    store: &'a S,
    embedder: &'a E,
}

impl<'a, S, E> QueryEngine<'a, S, E>
where
    S: VectorIndex,
    E: Embedder + ?Sized,
{
    pub fn new(store: &'a S, embedder: &'a E) -> Self {
        Self { store, embedder }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResult, SearchError> {
        if query.text.trim().is_empty() {
            return Err(SearchError::EmptyQuery);
        }

        let query_vector = self.embedder.embed(&query.text).await?;
        let hits = self.store.query_nearest(&query_vector, query.top_k)?;

        let contexts = hits
            .iter()
            .map(|hit| self.neighbor_window(hit, query.neighbor_scope))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(query = %query.text, hits = hits.len(), "search complete");
        Ok(SearchResult {
            query: query.text.clone(),
            contexts,
            hits,
        })
    }

    /// Texts of the chunks numbered `n - 1`, `n` and `n + 1` around the hit,
    /// concatenated without separators in the order the store returns them.
    pub fn neighbor_window(
        &self,
        hit: &NearestHit,
        scope: NeighborScope,
    ) -> Result<String, StoreError> {
        let sequence = hit.metadata.chunk_id;
        let window = MetadataFilter::ChunkIdIn(vec![
            sequence.saturating_sub(1),
            sequence,
            sequence.saturating_add(1),
        ]);
        let filter = match scope {
            NeighborScope::Global => window,
            NeighborScope::SameSource => MetadataFilter::All(vec![
                window,
                MetadataFilter::SourceEq(hit.metadata.source.clone()),
            ]),
        };

        Ok(self
            .store
            .get_where(&filter)?
            .into_iter()
            .map(|record| record.text)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{ChunkMetadata, IndexConfig, IndexedChunk, UNKNOWN};
    use crate::store::LocalIndexStore;
    use tempfile::{tempdir, TempDir};

    const DIMENSIONS: usize = 64;

    fn embedder() -> CharacterNgramEmbedder {
        CharacterNgramEmbedder {
            dimensions: DIMENSIONS,
        }
    }

    fn insert(store: &mut LocalIndexStore, source: &str, chunk_id: u64, text: &str) -> Result<(), StoreError> {
        store.upsert(IndexedChunk {
            id: format!("{source}_chunk_{chunk_id}"),
            text: text.to_string(),
            embedding: embedder().embed_sync(text),
            metadata: ChunkMetadata {
                source: source.to_string(),
                category: UNKNOWN.to_string(),
                date: UNKNOWN.to_string(),
                chunk_id,
            },
        })
    }

    fn corpus() -> Result<(TempDir, LocalIndexStore), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut store = LocalIndexStore::open(dir.path(), &IndexConfig::new("char-trigram", DIMENSIONS))?;
        insert(&mut store, "arrete", 1, "[A1 collecte des encombrants]")?;
        insert(&mut store, "arrete", 2, "[A2 tri des papiers et cartons]")?;
        insert(&mut store, "arrete", 3, "[A3 sacs jaunes et bleus]")?;
        insert(&mut store, "ordonnance", 4, "[B1 permis d'environnement classe 1B]")?;
        insert(&mut store, "ordonnance", 5, "[B2 audit énergétique obligatoire]")?;
        Ok((dir, store))
    }

    #[tokio::test]
    async fn blank_queries_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, store) = corpus()?;
        let embedder = embedder();
        let engine = QueryEngine::new(&store, &embedder);

        for text in ["", "   ", "\n\t"] {
            let result = engine.search(&SearchQuery::new(text)).await;
            assert!(matches!(result, Err(SearchError::EmptyQuery)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn hit_is_widened_to_adjacent_sequence_numbers() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, store) = corpus()?;
        let embedder = embedder();
        let engine = QueryEngine::new(&store, &embedder);

        let result = engine
            .search(&SearchQuery::new("[A2 tri des papiers et cartons]"))
            .await?;

        assert_eq!(result.hits.len(), 3);
        assert_eq!(result.contexts.len(), 3);
        assert_eq!(result.hits[0].metadata.chunk_id, 2);
        assert!(result.hits[0].relevance_percent() > 99.9);
        assert_eq!(
            result.contexts[0],
            "[A1 collecte des encombrants][A2 tri des papiers et cartons][A3 sacs jaunes et bleus]"
        );
        Ok(())
    }

    #[tokio::test]
    async fn global_window_crosses_document_boundaries() -> Result<(), Box<dyn std::error::Error>> {
        let (_dir, store) = corpus()?;
        let embedder = embedder();
        let engine = QueryEngine::new(&store, &embedder);

        let mut query = SearchQuery::new("[B1 permis d'environnement classe 1B]");
        query.top_k = 1;
        let global = engine.search(&query).await?;
        assert_eq!(
            global.contexts,
            vec!["[A3 sacs jaunes et bleus][B1 permis d'environnement classe 1B][B2 audit énergétique obligatoire]"]
        );

        query.neighbor_scope = NeighborScope::SameSource;
        let scoped = engine.search(&query).await?;
        assert_eq!(
            scoped.contexts,
            vec!["[B1 permis d'environnement classe 1B][B2 audit énergétique obligatoire]"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn window_follows_store_order_not_sequence_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut store = LocalIndexStore::open(dir.path(), &IndexConfig::new("char-trigram", DIMENSIONS))?;
        insert(&mut store, "loi", 8, "<huit>")?;
        insert(&mut store, "loi", 6, "<six>")?;
        insert(&mut store, "loi", 7, "<sept>")?;
        insert(&mut store, "loi", 9, "<neuf>")?;

        let embedder = embedder();
        let engine = QueryEngine::new(&store, &embedder);
        let hit = store.query_nearest(&embedder.embed_sync("<sept>"), 1)?.remove(0);
        assert_eq!(
            engine.neighbor_window(&hit, NeighborScope::Global)?,
            "<huit><six><sept>"
        );
        Ok(())
    }

    #[tokio::test]
    async fn small_store_returns_fewer_hits() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let mut store = LocalIndexStore::open(dir.path(), &IndexConfig::new("char-trigram", DIMENSIONS))?;
        insert(&mut store, "loi", 1, "article premier")?;

        let embedder = embedder();
        let engine = QueryEngine::new(&store, &embedder);
        let result = engine.search(&SearchQuery::new("article")).await?;
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.contexts, vec!["article premier"]);
        Ok(())
    }

    #[tokio::test]
    async fn empty_store_is_not_an_empty_query() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = LocalIndexStore::open(dir.path(), &IndexConfig::new("char-trigram", DIMENSIONS))?;
        let embedder = embedder();
        let engine = QueryEngine::new(&store, &embedder);

        let result = engine.search(&SearchQuery::new("tri sélectif")).await?;
        assert!(result.hits.is_empty());
        assert!(result.contexts.is_empty());
        Ok(())
    }
}
