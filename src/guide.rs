//! Owner-side guide management and the guest-facing read path.

use crate::content::BlockContent;
use crate::db::models::{Block, BlockType, FeatureSet, Guide};
use crate::db::{BlockWrite, Database, DbError, GuidePatch, NewGuide};
use crate::license::{LicenseError, LicenseService};
use crate::vector_store::{ChunkInput, VectorStore, VectorStoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

const MAX_SLUG_LEN: usize = 64;
const DERIVED_SLUG_LEN: usize = 48;
const SLUG_SUFFIX_LEN: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum GuideError {
    #[error("guide not found")]
    NotFound,
    #[error("block {index}: {reason}")]
    InvalidBlock { index: usize, reason: String },
    #[error("plan allows at most {max} {what}")]
    LimitExceeded { what: &'static str, max: i64 },
    #[error("feature not available on current plan: {0}")]
    FeatureNotAvailable(&'static str),
    #[error("AI concierge is disabled for this guide")]
    AiDisabled,
    #[error("invalid slug {0:?}")]
    InvalidSlug(String),
    #[error("slug {0:?} is already taken")]
    SlugTaken(String),
    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),
    #[error(transparent)]
    License(#[from] LicenseError),
    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGuide {
    pub title: String,
    #[serde(default)]
    pub accommodation_name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
}

/// One entry of a full block-list save. List position decides the order;
/// any `orderIndex` the client sends is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default = "default_visible")]
    pub is_visible: bool,
}

fn default_visible() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DroppedField {
    pub block_id: String,
    pub field: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedBlocks {
    pub blocks: Vec<Block>,
    pub dropped_fields: Vec<DroppedField>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuideDetail {
    #[serde(flatten)]
    pub guide: Guide,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestBlock {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub order_index: i64,
    pub content: serde_json::Value,
}

/// What a guest sees at `/g/:slug`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestView {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub accommodation_name: Option<String>,
    pub theme_id: Option<String>,
    pub theme_settings: serde_json::Value,
    pub ai_enabled: bool,
    pub watermark: bool,
    pub blocks: Vec<GuestBlock>,
}

/// Lowercase ASCII alphanumerics and single inner dashes.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--")
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// URL-safe form of `title`; empty when nothing ASCII survives.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(DERIVED_SLUG_LEN);
    slug.trim_end_matches('-').to_string()
}

fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..SLUG_SUFFIX_LEN].to_string()
}

#[derive(Clone)]
pub struct GuideService {
    db: Arc<Database>,
    vector_store: VectorStore,
    licenses: LicenseService,
}

impl GuideService {
    pub fn new(db: Arc<Database>, vector_store: VectorStore, licenses: LicenseService) -> Self {
        Self {
            db,
            vector_store,
            licenses,
        }
    }

    fn features(&self, user_id: &str) -> Result<FeatureSet, GuideError> {
        Ok(self.licenses.entitlement(user_id)?.features)
    }

    fn pick_slug(&self, req: &CreateGuide) -> Result<String, GuideError> {
        if let Some(slug) = &req.slug {
            if !is_valid_slug(slug) {
                return Err(GuideError::InvalidSlug(slug.clone()));
            }
            if self.db.slug_exists(slug)? {
                return Err(GuideError::SlugTaken(slug.clone()));
            }
            return Ok(slug.clone());
        }

        let base = slugify(&req.title);
        if base.is_empty() {
            return Ok(format!("guide-{}", random_suffix()));
        }
        if !self.db.slug_exists(&base)? {
            return Ok(base);
        }
        Ok(format!("{base}-{}", random_suffix()))
    }

    pub fn create_guide(&self, user_id: &str, req: &CreateGuide) -> Result<Guide, GuideError> {
        let features = self.features(user_id)?;
        let owned = self.db.count_guides(user_id)?;
        if !features.allows_guides(owned as usize + 1) {
            return Err(GuideError::LimitExceeded {
                what: "guides",
                max: features.max_guides,
            });
        }

        let slug = self.pick_slug(req)?;
        let guide = self
            .db
            .create_guide(&NewGuide {
                user_id: user_id.to_string(),
                slug: slug.clone(),
                title: req.title.trim().to_string(),
                accommodation_name: req.accommodation_name.clone(),
            })
            .map_err(|e| {
                if e.is_unique_violation() {
                    GuideError::SlugTaken(slug)
                } else {
                    GuideError::Db(e)
                }
            })?;
        tracing::info!(user_id, guide_id = %guide.id, slug = %guide.slug, "guide created");
        Ok(guide)
    }

    /// A foreign guide is reported exactly like a missing one.
    pub fn guide_for_owner(&self, user_id: &str, guide_id: &str) -> Result<Guide, GuideError> {
        match self.db.get_guide(guide_id)? {
            Some(guide) if guide.user_id == user_id => Ok(guide),
            _ => Err(GuideError::NotFound),
        }
    }

    pub fn guide_detail(&self, user_id: &str, guide_id: &str) -> Result<GuideDetail, GuideError> {
        let guide = self.guide_for_owner(user_id, guide_id)?;
        let blocks = self.db.list_blocks(&guide.id)?;
        Ok(GuideDetail { guide, blocks })
    }

    pub fn list_guides(&self, user_id: &str) -> Result<Vec<Guide>, GuideError> {
        Ok(self.db.list_guides(user_id)?)
    }

    pub fn update_guide(
        &self,
        user_id: &str,
        guide_id: &str,
        patch: &GuidePatch,
    ) -> Result<Guide, GuideError> {
        self.guide_for_owner(user_id, guide_id)?;
        if (patch.theme_id.is_some() || patch.theme_settings.is_some())
            && !self.features(user_id)?.custom_theme
        {
            return Err(GuideError::FeatureNotAvailable("customTheme"));
        }
        self.db
            .update_guide(guide_id, patch)?
            .ok_or(GuideError::NotFound)
    }

    /// Does not touch slug or content.
    pub fn toggle_publish(
        &self,
        user_id: &str,
        guide_id: &str,
        published: bool,
    ) -> Result<Guide, GuideError> {
        self.guide_for_owner(user_id, guide_id)?;
        self.db.set_published(guide_id, published)?;
        tracing::info!(guide_id, published, "guide publish state changed");
        self.db.get_guide(guide_id)?.ok_or(GuideError::NotFound)
    }

    /// Blocks and embeddings go with the guide.
    pub fn delete_guide(&self, user_id: &str, guide_id: &str) -> Result<(), GuideError> {
        self.guide_for_owner(user_id, guide_id)?;
        if !self.db.delete_guide(guide_id)? {
            return Err(GuideError::NotFound);
        }
        tracing::info!(user_id, guide_id, "guide deleted");
        Ok(())
    }

    /// Replaces the whole block list. Content is validated before anything
    /// is written; embeddings are computed only for blocks whose retrieval
    /// text changed, then blocks and chunks are committed together.
    pub async fn replace_blocks(
        &self,
        user_id: &str,
        guide_id: &str,
        inputs: Vec<BlockInput>,
    ) -> Result<SavedBlocks, GuideError> {
        let guide = self.guide_for_owner(user_id, guide_id)?;
        let features = self.features(user_id)?;
        if !features.allows_blocks(inputs.len()) {
            return Err(GuideError::LimitExceeded {
                what: "blocks per guide",
                max: features.max_blocks_per_guide,
            });
        }

        let existing: HashSet<String> = self
            .db
            .list_blocks(&guide.id)?
            .into_iter()
            .map(|b| b.id)
            .collect();
        let mut claimed: HashSet<String> = HashSet::new();
        let mut writes = Vec::with_capacity(inputs.len());
        let mut texts: Vec<Option<String>> = Vec::with_capacity(inputs.len());
        let mut dropped_fields = Vec::new();

        for (index, input) in inputs.into_iter().enumerate() {
            let block_type = input.block_type.parse::<BlockType>().map_err(|e| {
                GuideError::InvalidBlock {
                    index,
                    reason: e.to_string(),
                }
            })?;
            let parsed = BlockContent::parse(block_type, &input.content).map_err(|e| {
                GuideError::InvalidBlock {
                    index,
                    reason: e.to_string(),
                }
            })?;

            // Ids are only trusted when they already belong to this guide.
            let id = match input.id {
                Some(id) if existing.contains(&id) && !claimed.contains(&id) => id,
                _ => uuid::Uuid::new_v4().to_string(),
            };
            claimed.insert(id.clone());

            for field in parsed.dropped {
                tracing::warn!(guide_id, block_id = %id, %field, "dropped mistyped block field");
                dropped_fields.push(DroppedField {
                    block_id: id.clone(),
                    field,
                });
            }

            texts.push(if input.is_visible {
                parsed.content.search_text()
            } else {
                None
            });
            writes.push(BlockWrite {
                id,
                block_type,
                content: parsed.content.to_value(),
                is_visible: input.is_visible,
            });
        }

        let stored = self.db.chunk_texts_by_block(&guide.id)?;
        let mut to_embed = Vec::new();
        let mut cleared = Vec::new();
        for (write, text) in writes.iter().zip(texts) {
            match text {
                Some(text) if stored.get(&write.id) != Some(&text) => to_embed.push(ChunkInput {
                    block_id: Some(write.id.clone()),
                    text,
                }),
                Some(_) => {}
                None if stored.contains_key(&write.id) => cleared.push(write.id.clone()),
                None => {}
            }
        }

        let new_chunks = self.vector_store.embed_chunks(&to_embed).await?;
        let blocks = self
            .db
            .replace_blocks(&guide.id, &writes, &new_chunks, &cleared)?;
        tracing::info!(
            guide_id,
            blocks = blocks.len(),
            embedded = new_chunks.len(),
            cleared = cleared.len(),
            "guide blocks saved"
        );
        Ok(SavedBlocks {
            blocks,
            dropped_fields,
        })
    }

    /// Unpublished guides resolve as not found.
    pub fn published_guide(&self, guide_id: &str) -> Result<Guide, GuideError> {
        match self.db.get_guide(guide_id)? {
            Some(guide) if guide.is_published => Ok(guide),
            _ => Err(GuideError::NotFound),
        }
    }

    /// A published guide whose owner's plan and settings allow the concierge.
    pub fn concierge_guide(&self, guide_id: &str) -> Result<Guide, GuideError> {
        let guide = self.published_guide(guide_id)?;
        if !guide.ai_enabled || !self.features(&guide.user_id)?.ai_concierge {
            return Err(GuideError::AiDisabled);
        }
        Ok(guide)
    }

    pub fn guest_view(&self, slug: &str) -> Result<GuestView, GuideError> {
        let guide = match self.db.get_guide_by_slug(slug)? {
            Some(guide) if guide.is_published => guide,
            _ => return Err(GuideError::NotFound),
        };
        let features = self.features(&guide.user_id)?;
        let blocks = self
            .db
            .list_blocks(&guide.id)?
            .into_iter()
            .filter(|b| b.is_visible)
            .map(|b| GuestBlock {
                id: b.id,
                block_type: b.block_type,
                order_index: b.order_index,
                content: b.content,
            })
            .collect();
        Ok(GuestView {
            ai_enabled: guide.ai_enabled && features.ai_concierge,
            watermark: !features.no_watermark,
            id: guide.id,
            slug: guide.slug,
            title: guide.title,
            accommodation_name: guide.accommodation_name,
            theme_id: guide.theme_id,
            theme_settings: guide.theme_settings,
            blocks,
        })
    }
}
