//! Optional translation of post text.

use crate::error::Result;

use async_trait::async_trait;

/// Translation backend.
#[async_trait]
pub trait Translator: Send + Sync + 'static {
    /// Language code of `text`.
    async fn detect(&self, text: &str) -> Result<String>;

    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String>;
}

/// Translate `text` into `target` if it is in another language and the
/// result actually differs. Failures are logged and yield `None`.
pub async fn translate_foreign(
    translator: &dyn Translator,
    text: &str,
    target: &str,
) -> Option<String> {
    let source = match translator.detect(text).await {
        Ok(source) => source,
        Err(error) => {
            tracing::debug!(%error, "language detection failed");
            return None;
        }
    };
    if source.eq_ignore_ascii_case(target) {
        return None;
    }

    match translator.translate(text, &source, target).await {
        Ok(translated) if is_materially_different(text, &translated) => Some(translated),
        Ok(_) => None,
        Err(error) => {
            tracing::debug!(%error, source, target, "translation failed");
            None
        }
    }
}

/// Whether two texts differ beyond case, punctuation and whitespace.
pub fn is_materially_different(original: &str, translated: &str) -> bool {
    fn normalize(text: &str) -> String {
        text.chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect()
    }
    normalize(original) != normalize(translated)
}
