pub mod annotate_chunks;
pub mod chunk_chapter;
pub mod fetch_chapter;
pub mod store_chunks;

use std::sync::Arc;

use crate::activities::ActivityRegistry;

pub fn register_all(registry: &mut ActivityRegistry) {
    registry.register(Arc::new(fetch_chapter::FetchChapterActivity));
    registry.register(Arc::new(chunk_chapter::ChunkChapterActivity));
    registry.register(Arc::new(annotate_chunks::AnnotateChunksActivity));
    registry.register(Arc::new(store_chunks::StoreChunksActivity));
}
