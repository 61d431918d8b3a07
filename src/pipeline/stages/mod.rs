//! The four pipeline stages.
//!
//! | Stage | Input | Output | Cache key |
//! |-------|-------|--------|-----------|
//! | [`FetchStage`] | `()` | [`FetchOutput`] | `all_creators` |
//! | [`PromptStage`] | [`CreatorState`](super::CreatorState) | [`PromptOutput`] | creator id |
//! | [`RenderStage`] | creator state with a prompt | [`RenderOutput`] | creator id |
//! | [`ComposeStage`] | creator state with renders | [`ComposeOutput`] | creator id |

mod compose;
mod fetch;
mod prompt;
mod render;

pub use compose::{pick_template, ComposeOutput, ComposeStage, SceneSource, SCENE_PROMPT};
pub use fetch::{FetchOutput, FetchStage};
pub use prompt::{PromptOutput, PromptStage};
pub use render::{GeneratedImage, RenderOutput, RenderStage, RenderedMagnet};
