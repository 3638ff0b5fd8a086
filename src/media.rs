//! Node media regeneration: render missing figure and video assets, upload
//! them to the blob store, and fill the doc's media URLs.
//!
//! Upload or generation failures return the error without touching the
//! stored doc; the doc is rewritten only after every requested asset landed.

use serde_json::Value;

use std::sync::Arc;

use crate::blob::BlobStore;
use crate::config::PipelineConfig;
use crate::doc::canonical::{canonicalize, content_hash};
use crate::doc::model::{BlockKind, NodeDoc};
use crate::error::{Error, Result};
use crate::llm::{LlmClient, VideoOptions};
use crate::store::docs::NodeMediaRow;
use crate::store::ContentStore;

/// What one regeneration pass produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaReport {
    pub figures_rendered: usize,
    pub videos_rendered: usize,
    /// Blocks left alone: already had a URL, or the render limit was hit.
    pub skipped: usize,
}

pub struct MediaGenerator {
    store: Arc<ContentStore>,
    llm: Arc<dyn LlmClient>,
    blob: Arc<dyn BlobStore>,
    config: PipelineConfig,
}

impl MediaGenerator {
    pub fn new(
        store: Arc<ContentStore>,
        llm: Arc<dyn LlmClient>,
        blob: Arc<dyn BlobStore>,
        config: PipelineConfig,
    ) -> Self {
        Self { store, llm, blob, config }
    }

    /// Render assets for every figure/video block in the node's doc that has
    /// no URL yet, up to the configured render limit. Media rows and the
    /// rewritten doc commit in one transaction.
    pub async fn render_for_node(&self, node_id: &str) -> Result<MediaReport> {
        let row = self
            .store
            .node_doc(node_id)
            .await?
            .ok_or_else(|| Error::MissingDependency(format!("no doc for node {node_id}")))?;
        let mut doc: NodeDoc = serde_json::from_str(&row.doc)?;

        let mut report = MediaReport::default();
        let mut rendered: Vec<(usize, NodeMediaRow, bool)> = Vec::new();

        for (index, block) in doc.blocks.iter().enumerate() {
            let is_video = match block.kind {
                BlockKind::Figure => false,
                BlockKind::Video => true,
                _ => continue,
            };
            if block.str_field("url").is_some() {
                report.skipped += 1;
                continue;
            }
            if report.figures_rendered + report.videos_rendered >= self.config.render_limit {
                report.skipped += 1;
                continue;
            }
            if is_video && self.config.video_model.is_none() {
                report.skipped += 1;
                continue;
            }

            let block_id = block.id.clone().unwrap_or_else(|| format!("blk{index}"));
            let prompt = block
                .str_field("caption")
                .or_else(|| block.str_field("alt"))
                .unwrap_or(&doc.title)
                .to_owned();

            let (media, category, extension) = if is_video {
                let media = self
                    .llm
                    .generate_video(&prompt, &VideoOptions { duration_sec: Some(20) })
                    .await?;
                (media, "videos", "mp4")
            } else {
                let media = self.llm.generate_image(&prompt).await?;
                (media, "figures", "png")
            };

            let storage_key = format!("{node_id}/{block_id}.{extension}");
            self.blob
                .upload_file(category, &storage_key, media.bytes)
                .await
                .map_err(|error| Error::AssetUpload(error.to_string()))?;
            let url = self.blob.public_url(category, &storage_key);

            rendered.push((
                index,
                NodeMediaRow {
                    id: uuid::Uuid::new_v4().to_string(),
                    node_id: node_id.to_owned(),
                    storage_key,
                    file_name: Some(format!("{block_id}.{extension}")),
                    url,
                },
                is_video,
            ));
            if is_video {
                report.videos_rendered += 1;
            } else {
                report.figures_rendered += 1;
            }
        }

        if rendered.is_empty() {
            return Ok(report);
        }

        // All assets landed: fill the doc and persist everything together.
        let mut tx = self.store.begin().await?;
        for (index, media, is_video) in &rendered {
            let block = &mut doc.blocks[*index];
            block
                .extra
                .insert("storage_key".into(), Value::String(media.storage_key.clone()));
            block.extra.insert("url".into(), Value::String(media.url.clone()));
            if *is_video {
                ContentStore::insert_node_video_tx(&mut tx, media).await?;
            } else {
                ContentStore::insert_node_figure_tx(&mut tx, media).await?;
            }
        }
        let text = String::from_utf8(canonicalize(&doc)?)
            .map_err(|e| Error::Validation(format!("canonical JSON is not UTF-8: {e}")))?;
        let hash = content_hash(&doc)?;
        ContentStore::save_node_doc_tx(&mut tx, node_id, &text, &hash, &row.sources_hash).await?;
        tx.commit().await?;

        tracing::info!(
            node_id,
            figures = report.figures_rendered,
            videos = report.videos_rendered,
            "node media rendered"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::testing::MemoryBlobStore;
    use crate::doc::model::{Block, Citation};
    use crate::llm::testing::ScriptedLlm;
    use serde_json::json;

    const C1: &str = "11111111-1111-4111-8111-111111111111";

    async fn seed_doc(store: &ContentStore, doc: &NodeDoc) {
        let text = String::from_utf8(canonicalize(doc).unwrap()).unwrap();
        let hash = content_hash(doc).unwrap();
        let mut tx = store.begin().await.unwrap();
        ContentStore::save_node_doc_tx(&mut tx, "n1", &text, &hash, "src").await.unwrap();
        tx.commit().await.unwrap();
    }

    fn doc_with_figure(with_url: bool) -> NodeDoc {
        let mut doc = NodeDoc::new("Ohm's Law");
        let mut figure = Block::new(BlockKind::Figure)
            .with_id("fig1")
            .with_field("caption", json!("circuit sketch"));
        if with_url {
            figure
                .extra
                .insert("url".into(), json!("https://cdn.example.com/existing.png"));
        }
        figure.citations.push(Citation::new(C1));
        doc.blocks.push(figure);
        doc
    }

    fn generator(
        store: Arc<ContentStore>,
        llm: Arc<ScriptedLlm>,
        blob: Arc<MemoryBlobStore>,
    ) -> MediaGenerator {
        MediaGenerator::new(store, llm, blob, PipelineConfig::default())
    }

    #[tokio::test]
    async fn missing_figure_url_is_rendered_and_filled() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        seed_doc(&store, &doc_with_figure(false)).await;
        let blob = Arc::new(MemoryBlobStore::default());
        let llm = Arc::new(ScriptedLlm::new(vec![]));

        let report = generator(store.clone(), llm, blob.clone())
            .render_for_node("n1")
            .await
            .expect("render");
        assert_eq!(report.figures_rendered, 1);

        // The asset landed in the blob store and in node_figures.
        assert_eq!(blob.objects.lock().unwrap().len(), 1);
        let figures = store.node_figures("n1").await.unwrap();
        assert_eq!(figures.len(), 1);
        assert_eq!(figures[0].storage_key, "n1/fig1.png");

        // The doc's figure block now carries the URL, and the hash moved.
        let row = store.node_doc("n1").await.unwrap().unwrap();
        let doc: NodeDoc = serde_json::from_str(&row.doc).unwrap();
        assert_eq!(
            doc.blocks[0].str_field("url"),
            Some("memory://figures/n1/fig1.png"),
        );
        assert_eq!(content_hash(&doc).unwrap(), row.content_hash);
    }

    #[tokio::test]
    async fn existing_urls_are_left_alone() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        seed_doc(&store, &doc_with_figure(true)).await;
        let before = store.node_doc("n1").await.unwrap().unwrap();

        let report = generator(
            store.clone(),
            Arc::new(ScriptedLlm::new(vec![])),
            Arc::new(MemoryBlobStore::default()),
        )
        .render_for_node("n1")
        .await
        .expect("render");
        assert_eq!(report, MediaReport { figures_rendered: 0, videos_rendered: 0, skipped: 1 });

        let after = store.node_doc("n1").await.unwrap().unwrap();
        assert_eq!(before.content_hash, after.content_hash);
    }

    #[tokio::test]
    async fn videos_require_a_configured_model() {
        let store = ContentStore::connect_in_memory().await.unwrap();
        let mut doc = NodeDoc::new("L");
        doc.blocks.push(Block::new(BlockKind::Video).with_id("v1"));
        seed_doc(&store, &doc).await;

        let report = generator(
            store.clone(),
            Arc::new(ScriptedLlm::new(vec![])),
            Arc::new(MemoryBlobStore::default()),
        )
        .render_for_node("n1")
        .await
        .expect("render");
        assert_eq!(report.videos_rendered, 0);
        assert_eq!(report.skipped, 1);
    }
}
