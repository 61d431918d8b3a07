//! Stage 2: generate the outreach bundle and persist its magnets.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, Cacheable};
use crate::error::StageError;
use crate::generation::PromptResponse;
use crate::model::{ItemError, Magnet, MagnetKey, MagnetRecord, OutreachUpdate};
use crate::pipeline::context::{CreatorState, StageContext, MISSING_PROMPTS, MISSING_STORE};
use crate::pipeline::stage::{Stage, StageId};
use crate::store::upsert_magnet;
use crate::utils::strip_markdown_fences;

/// The validated prompt answer plus what was written for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptOutput {
    pub creator_id: String,
    pub task_id: String,
    pub outlook: String,
    pub video_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The `magnet_sku_list`, in answer order.
    pub magnets: Vec<Magnet>,
    /// `context_id`s whose record was written.
    #[serde(default)]
    pub saved: Vec<String>,
    #[serde(default)]
    pub errors: Vec<ItemError>,
    #[serde(default)]
    pub outreach_written: bool,
}

impl PromptOutput {
    pub fn is_saved(&self, context_id: &str) -> bool {
        self.saved.iter().any(|c| c == context_id)
    }

    pub fn magnet(&self, context_id: &str) -> Option<&Magnet> {
        self.magnets.iter().find(|m| m.context_id == context_id)
    }
}

impl Cacheable for PromptOutput {
    fn success_count(&self) -> usize {
        self.saved.len()
    }
}

/// Calls the prompt service for one creator and upserts each magnet.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptStage;

impl PromptStage {
    fn record_for(creator_id: &str, task_id: &str, magnet: &Magnet) -> MagnetRecord {
        let key = MagnetKey::new(creator_id, &magnet.context_id, magnet.kind);
        let mut record = MagnetRecord::new(&key);
        record.task_id = Some(task_id.to_string());
        record.front_name = Some(magnet.front_name.clone());
        record.front_style_key = Some(magnet.front_style_key.clone());
        record.front_image_prompt = Some(magnet.front_image_prompt.clone());
        record
    }
}

#[async_trait]
impl Stage for PromptStage {
    type Input = CreatorState;
    type Output = PromptOutput;

    fn id(&self) -> StageId {
        StageId::Prompt
    }

    fn cache_key(&self, input: &CreatorState) -> CacheKey {
        CacheKey::new(&input.creator_id, self.id())
    }

    fn validate(&self, ctx: &StageContext, input: &CreatorState) -> Result<(), String> {
        if input.creator_id.trim().is_empty() {
            return Err("creator has no creator_id".to_string());
        }
        if ctx.prompts.is_none() {
            return Err(MISSING_PROMPTS.to_string());
        }
        if ctx.store.is_none() {
            return Err(MISSING_STORE.to_string());
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        input: &CreatorState,
    ) -> Result<PromptOutput, StageError> {
        self.ensure_valid(ctx, input)?;
        let prompts = ctx.prompts(self.id())?;
        let store = ctx.store(self.id())?;
        let creator_id = input.creator_id.as_str();

        let PromptResponse {
            task_id,
            outlook,
            video_prompt,
            message,
            magnets,
        } = prompts.generate(creator_id).await?;
        tracing::info!(task_id = %task_id, magnets = magnets.len(), "Prompt bundle generated");

        let mut saved = Vec::new();
        let mut errors = Vec::new();
        for magnet in &magnets {
            if magnet.context_id.trim().is_empty() {
                tracing::warn!(front_name = %magnet.front_name, "Magnet has no context_id, skipping");
                errors.push(ItemError::new("", "magnet has no context_id"));
                continue;
            }

            let record = Self::record_for(creator_id, &task_id, magnet);
            match upsert_magnet(store.as_ref(), &record).await {
                Ok(outcome) => {
                    tracing::debug!(context_id = %magnet.context_id, ?outcome, "Saved magnet");
                    saved.push(magnet.context_id.clone());
                }
                Err(e) => {
                    tracing::warn!(context_id = %magnet.context_id, error = %e, "Failed to save magnet");
                    errors.push(ItemError::new(&magnet.context_id, e));
                }
            }
        }

        if saved.is_empty() {
            return Err(StageError::NoSuccess {
                stage: self.id(),
                creator_id: creator_id.to_string(),
            });
        }

        let mut outreach_written = false;
        let body = strip_markdown_fences(&outlook);
        if body.is_empty() {
            tracing::debug!("Outlook is empty, not writing outreach message");
        } else {
            let update = OutreachUpdate {
                outreach_email_body: body,
                message: message.as_deref().map(strip_markdown_fences),
            };
            match store.update_outreach(creator_id, &update).await {
                Ok(()) => outreach_written = true,
                Err(e) => tracing::warn!(error = %e, "Failed to write outreach message"),
            }
        }

        tracing::info!(saved = saved.len(), failed = errors.len(), "Magnets saved");

        Ok(PromptOutput {
            creator_id: creator_id.to_string(),
            task_id,
            outlook,
            video_prompt,
            message,
            magnets,
            saved,
            errors,
            outreach_written,
        })
    }
}
