//! services/api/src/music.rs
//!
//! The natural-language-to-SQL gate for music chats. Turns a user's question
//! into a vetted, read-only query string, and renders result rows back into
//! conversational text. The model is untrusted here: whatever it produces is
//! validated before it can reach the database.

const SQL_INSTRUCTION_TEMPLATE: &str = r#"Convert the following natural language query to a SQL query for a music database.
The database has a table 'music' with columns: album, artist, composer, year, genre.
Make the search case-insensitive and use proper SQL syntax.

Query: {query}

Response should only contain the SQL query, nothing else."#;

const RESULTS_TEMPLATE: &str = r#"Convert these music database results into a natural language response:
{results}

Make the response conversational and well-formatted."#;

const NO_RESULTS_MESSAGE: &str = "No results found matching your query.";

/// Mutating statements are refused outright. The check is a substring match,
/// so a benign column value containing one of these words is also rejected;
/// that conservatism is intentional.
const FORBIDDEN_KEYWORDS: [&str; 6] = ["drop", "delete", "update", "insert", "alter", "create"];

use lm_chat_core::ports::{GenerationOptions, LanguageModelService, PortError, PortResult};
use regex::Regex;
use std::sync::Arc;

//=========================================================================================
// The Main Processor Struct
//=========================================================================================

/// Translates natural-language music questions into vetted SQL and renders
/// result sets back to prose, both via the language-model port.
#[derive(Clone)]
pub struct MusicQueryProcessor {
    lm: Arc<dyn LanguageModelService>,
}

impl MusicQueryProcessor {
    /// Creates a new `MusicQueryProcessor`.
    pub fn new(lm: Arc<dyn LanguageModelService>) -> Self {
        Self { lm }
    }

    /// Generates a read-only SQL query from natural language input. Fails with
    /// `PortError::UnsafeQuery` when the model's output does not pass the
    /// allowlist/denylist check; such output is never executed.
    pub async fn generate_sql(&self, query: &str) -> PortResult<String> {
        let prompt = SQL_INSTRUCTION_TEMPLATE.replace("{query}", query);
        let sql = self.lm.generate(&prompt, GenerationOptions::default()).await?;
        validate_and_clean_sql(&sql)
    }

    /// Renders a result set into natural language. An empty result set yields
    /// a fixed message without a model call.
    pub async fn format_results(&self, results: &[serde_json::Value]) -> PortResult<String> {
        if results.is_empty() {
            return Ok(NO_RESULTS_MESSAGE.to_string());
        }

        let serialized = serde_json::to_string_pretty(results)
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        let prompt = RESULTS_TEMPLATE.replace("{results}", &serialized);
        self.lm.generate(&prompt, GenerationOptions::default()).await
    }
}

/// Strips trailing `--` comments, trims, and validates that the statement is a
/// lone read-only query.
fn validate_and_clean_sql(sql: &str) -> PortResult<String> {
    let without_comments = Regex::new(r"(?m)--.*$").unwrap().replace_all(sql, "");
    let cleaned = without_comments.trim().to_string();

    let lowered = cleaned.to_lowercase();
    if !lowered.starts_with("select") {
        return Err(PortError::UnsafeQuery(
            "query must start with SELECT".to_string(),
        ));
    }

    if let Some(keyword) = FORBIDDEN_KEYWORDS.iter().find(|k| lowered.contains(*k)) {
        return Err(PortError::UnsafeQuery(format!(
            "query contains forbidden operation '{}'",
            keyword
        )));
    }

    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lm_chat_core::ports::TokenStream;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A model stub that always answers with the same text and records what it
    /// was asked.
    struct ScriptedLm {
        reply: String,
        calls: AtomicUsize,
        last_prompt: Mutex<Option<String>>,
    }

    impl ScriptedLm {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl LanguageModelService for ScriptedLm {
        async fn generate(&self, prompt: &str, _: GenerationOptions) -> PortResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
            Ok(self.reply.clone())
        }

        async fn generate_stream(
            &self,
            _: &str,
            _: GenerationOptions,
        ) -> PortResult<TokenStream> {
            Err(PortError::Unexpected("streaming not scripted".to_string()))
        }
    }

    #[test]
    fn validation_strips_comments_and_whitespace() {
        let sql = "  SELECT * FROM music WHERE year = 1969 -- classic year\n";
        let cleaned = validate_and_clean_sql(sql).unwrap();
        assert_eq!(cleaned, "SELECT * FROM music WHERE year = 1969");
    }

    #[test]
    fn validation_rejects_statements_not_starting_with_select() {
        let err = validate_and_clean_sql("DROP TABLE music").unwrap_err();
        assert!(matches!(err, PortError::UnsafeQuery(_)));

        let err = validate_and_clean_sql("show tables").unwrap_err();
        assert!(matches!(err, PortError::UnsafeQuery(_)));
    }

    #[test]
    fn validation_rejects_forbidden_keywords_anywhere() {
        let err =
            validate_and_clean_sql("SELECT * FROM music; DROP TABLE music").unwrap_err();
        assert!(matches!(err, PortError::UnsafeQuery(_)));
    }

    #[test]
    fn validation_is_conservative_about_keyword_substrings() {
        // "Delete Me" is a perfectly innocent album title, and it is still
        // refused. The check favors rejecting over parsing.
        let err = validate_and_clean_sql(
            "SELECT * FROM music WHERE lower(album) = 'delete me'",
        )
        .unwrap_err();
        assert!(matches!(err, PortError::UnsafeQuery(_)));
    }

    #[tokio::test]
    async fn translation_produces_a_vetted_select() {
        let lm = Arc::new(ScriptedLm::new(
            "SELECT * FROM music WHERE lower(artist) LIKE '%beatles%'",
        ));
        let processor = MusicQueryProcessor::new(lm.clone());

        let sql = processor.generate_sql("Find albums by Beatles").await.unwrap();
        let lowered = sql.to_lowercase();
        assert!(lowered.contains("select"));
        assert!(lowered.contains("beatles"));

        let prompt = lm.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("Find albums by Beatles"));
        assert!(prompt.contains("album, artist, composer, year, genre"));
    }

    #[tokio::test]
    async fn translation_rejects_unsafe_model_output() {
        let lm = Arc::new(ScriptedLm::new("DROP TABLE music"));
        let processor = MusicQueryProcessor::new(lm);

        let err = processor.generate_sql("Find albums by Beatles").await.unwrap_err();
        assert!(matches!(err, PortError::UnsafeQuery(_)));
    }

    #[tokio::test]
    async fn empty_result_sets_skip_the_model() {
        let lm = Arc::new(ScriptedLm::new("should never be asked"));
        let processor = MusicQueryProcessor::new(lm.clone());

        let rendered = processor.format_results(&[]).await.unwrap();
        assert_eq!(rendered, NO_RESULTS_MESSAGE);
        assert_eq!(lm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn result_rows_are_embedded_in_the_rendering_prompt() {
        let lm = Arc::new(ScriptedLm::new("You have one album: Abbey Road."));
        let processor = MusicQueryProcessor::new(lm.clone());

        let rows = vec![json!({"album": "Abbey Road", "artist": "The Beatles", "year": 1969})];
        let rendered = processor.format_results(&rows).await.unwrap();
        assert_eq!(rendered, "You have one album: Abbey Road.");

        let prompt = lm.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("Abbey Road"));
        assert!(prompt.contains("natural language response"));
    }
}
