use async_trait::async_trait;
use common::error::AppError;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

use crate::{
    events::{ChatEvent, Next, Plugin, PluginError},
    turn::ChatTurn,
};

/// Trims and normalizes the incoming question and tags its language.
pub struct PreprocessQueryPlugin;

#[async_trait]
impl Plugin for PreprocessQueryPlugin {
    fn name(&self) -> &'static str {
        "preprocess_query"
    }

    fn activates_on(&self) -> &'static [ChatEvent] {
        &[ChatEvent::PreprocessQuery]
    }

    async fn handle(&self, turn: &mut ChatTurn, next: Next<'_>) -> Result<(), PluginError> {
        let normalized: String = turn.query.trim().nfc().collect();
        if normalized.is_empty() {
            return Err(AppError::Validation("query must not be empty".into()).into());
        }

        let language = detect_language(&normalized);
        debug!(
            request_id = %turn.request_id,
            language,
            chars = normalized.chars().count(),
            "Preprocessed query"
        );

        turn.query = normalized;
        turn.language = Some(language.to_owned());

        next.run(turn).await
    }
}

/// Coarse language tag: CJK-dominant input is treated as Chinese, anything
/// else as English. Enough to pick prompt phrasing downstream.
fn detect_language(text: &str) -> &'static str {
    let total = text.chars().filter(|c| !c.is_whitespace()).count().max(1);
    let cjk = text
        .chars()
        .filter(|c| matches!(*c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF))
        .count();
    if cjk * 2 >= total {
        "zh"
    } else {
        "en"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::test_support::bare_turn;

    #[tokio::test]
    async fn trims_and_tags_language() {
        let (mut turn, _rx) = bare_turn("  what is a comet?  ").await;
        PreprocessQueryPlugin
            .handle(&mut turn, crate::events::Next::noop())
            .await
            .expect("preprocess");

        assert_eq!(turn.query, "what is a comet?");
        assert_eq!(turn.language.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let (mut turn, _rx) = bare_turn("   ").await;
        let result = PreprocessQueryPlugin
            .handle(&mut turn, crate::events::Next::noop())
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn detects_cjk_dominant_text() {
        assert_eq!(detect_language("彗星是什么"), "zh");
        assert_eq!(detect_language("tell me about comets"), "en");
    }
}
