//! The slide blueprint and the remote calls that create and replace it.
//!
//! A [`Blueprint`] is an ordered list of `{title, content[]}` slides. It is
//! only ever produced by strict parsing of a model reply (or of JSON a user
//! supplies by hand); a reply that does not match the shape is reported as a
//! [`StructuringParseError`] carrying the raw text, and is never coerced.
//!
//! Both remote operations replace the whole object:
//!
//! * [`BlueprintStore::generate`]: cleaned Markdown → new blueprint;
//! * [`BlueprintStore::mutate`]: current blueprint + instruction → new blueprint.

use crate::client::{RemoteModel, RemoteRequest};
use crate::config::PipelineConfig;
use crate::error::{Pdf2DeckError, StructuringParseError};
use crate::pipeline::postprocess::strip_json_fences;
use crate::prompts::{mutate_prompt, structure_prompt};
use crate::retry::{call_with_retry, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One slide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slide {
    pub title: String,
    pub content: Vec<String>,
}

impl Slide {
    pub fn new(title: impl Into<String>, content: Vec<String>) -> Self {
        Self {
            title: title.into(),
            content,
        }
    }
}

/// An ordered sequence of slides. Serialises as a bare JSON array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blueprint {
    pub slides: Vec<Slide>,
}

impl Blueprint {
    pub fn new(slides: Vec<Slide>) -> Self {
        Self { slides }
    }

    pub fn len(&self) -> usize {
        self.slides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slides.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Slide> {
        self.slides.iter()
    }

    /// Compact JSON, as sent back to the model for mutation.
    pub fn to_json(&self) -> Result<String, Pdf2DeckError> {
        serde_json::to_string(self).map_err(|e| Pdf2DeckError::Internal(format!("serialise: {e}")))
    }

    /// Indented JSON for files and terminals.
    pub fn to_json_pretty(&self) -> Result<String, Pdf2DeckError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Pdf2DeckError::Internal(format!("serialise: {e}")))
    }

    /// Strict parse; see [`parse_blueprint`].
    pub fn from_json(raw: &str, placeholder_title: &str) -> Result<Self, StructuringParseError> {
        parse_blueprint(raw, placeholder_title)
    }
}

/// Parse a model reply into a [`Blueprint`].
///
/// Accepted shape, after stripping an outer code fence: a non-empty JSON
/// array of objects. In each object `title` is a string (missing, `null` or
/// blank becomes `placeholder_title`) and `content` is an array of strings
/// (missing or `null` becomes empty). Other keys are ignored. Anything else,
/// including `null` entries, is an error that keeps the raw reply.
pub fn parse_blueprint(
    raw: &str,
    placeholder_title: &str,
) -> Result<Blueprint, StructuringParseError> {
    let fail = |detail: String| StructuringParseError {
        raw: raw.to_string(),
        detail,
    };

    let body = strip_json_fences(raw);
    if body.is_empty() {
        return Err(fail("reply is empty".into()));
    }

    let value: Value = serde_json::from_str(&body).map_err(|e| fail(e.to_string()))?;
    let entries = match value {
        Value::Array(entries) => entries,
        other => return Err(fail(format!("expected a JSON array, found {}", kind(&other)))),
    };
    if entries.is_empty() {
        return Err(fail("array contains no slides".into()));
    }

    let mut slides = Vec::with_capacity(entries.len());
    for (i, entry) in entries.into_iter().enumerate() {
        let n = i + 1;
        let mut obj = match entry {
            Value::Object(obj) => obj,
            other => {
                return Err(fail(format!("slide {n}: expected an object, found {}", kind(&other))))
            }
        };

        let title = match obj.remove("title") {
            None | Some(Value::Null) => placeholder_title.to_string(),
            Some(Value::String(t)) if t.trim().is_empty() => placeholder_title.to_string(),
            Some(Value::String(t)) => t.trim().to_string(),
            Some(other) => {
                return Err(fail(format!(
                    "slide {n}: \"title\" must be a string, found {}",
                    kind(&other)
                )))
            }
        };

        let content = match obj.remove("content") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => {
                let mut points = Vec::with_capacity(items.len());
                for (j, item) in items.into_iter().enumerate() {
                    match item {
                        Value::String(s) if s.trim().is_empty() => {}
                        Value::String(s) => points.push(s.trim().to_string()),
                        other => {
                            return Err(fail(format!(
                                "slide {n}, point {}: expected a string, found {}",
                                j + 1,
                                kind(&other)
                            )))
                        }
                    }
                }
                points
            }
            Some(other) => {
                return Err(fail(format!(
                    "slide {n}: \"content\" must be an array, found {}",
                    kind(&other)
                )))
            }
        };

        slides.push(Slide { title, content });
    }

    Ok(Blueprint { slides })
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Creates and replaces blueprints through the remote model.
pub struct BlueprintStore {
    client: Arc<dyn RemoteModel>,
    policy: RetryPolicy,
    temperature: f32,
    max_tokens: usize,
    placeholder_title: String,
    style: String,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl BlueprintStore {
    pub fn new(client: Arc<dyn RemoteModel>, config: &PipelineConfig) -> Self {
        Self {
            client,
            policy: config.retry_policy(),
            temperature: config.structure_temperature,
            max_tokens: config.max_tokens,
            placeholder_title: config.placeholder_title.clone(),
            style: config.style().to_string(),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
        }
    }

    /// The system instruction used for structuring and mutation.
    pub fn style(&self) -> &str {
        &self.style
    }

    pub fn set_style(&mut self, style: impl Into<String>) {
        self.style = style.into();
    }

    pub fn placeholder_title(&self) -> &str {
        &self.placeholder_title
    }

    /// Remote tokens spent by this store so far, `(input, output)`.
    pub fn usage(&self) -> (u64, u64) {
        (
            self.input_tokens.load(Ordering::Relaxed),
            self.output_tokens.load(Ordering::Relaxed),
        )
    }

    async fn call(
        &self,
        stage: &'static str,
        prompt: String,
        style: &str,
    ) -> Result<String, Pdf2DeckError> {
        let outcome = call_with_retry(&self.policy, stage, |_| {
            let request = RemoteRequest {
                system: Some(style.to_string()),
                prompt: prompt.clone(),
                image: None,
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                expect_json: true,
            };
            self.client.generate(request)
        })
        .await
        .map_err(|e| Pdf2DeckError::RemoteCallFailed {
            stage,
            attempts: e.attempts,
            detail: e.last.message,
        })?;

        let reply = outcome.value;
        self.input_tokens.fetch_add(reply.input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(reply.output_tokens, Ordering::Relaxed);
        debug!("{}: {} chars in {} attempt(s)", stage, reply.text.len(), outcome.attempts);
        Ok(reply.text)
    }

    /// Ask for a fresh blueprint from cleaned text.
    ///
    /// A reply that does not parse is returned as
    /// [`Pdf2DeckError::StructuringParse`] with the raw text inside.
    pub async fn generate(
        &self,
        cleaned_text: &str,
        style: &str,
    ) -> Result<Blueprint, Pdf2DeckError> {
        info!("Structuring {} chars of cleaned text", cleaned_text.len());
        let raw = self.call("structure", structure_prompt(cleaned_text), style).await?;
        let blueprint = parse_blueprint(&raw, &self.placeholder_title).inspect_err(|e| {
            warn!("Structuring reply rejected: {}", e.detail);
        })?;
        info!("Blueprint has {} slides", blueprint.len());
        Ok(blueprint)
    }

    /// Ask for a full replacement of `current` following `instruction`.
    ///
    /// `current` is never modified; on any failure the caller still holds
    /// the previous blueprint.
    pub async fn mutate(
        &self,
        current: &Blueprint,
        instruction: &str,
    ) -> Result<Blueprint, Pdf2DeckError> {
        if instruction.trim().is_empty() {
            return Err(Pdf2DeckError::InvalidInput {
                input: "empty mutation instruction".into(),
            });
        }
        let json = current.to_json()?;
        let raw = self
            .call("mutate", mutate_prompt(&json, instruction.trim()), &self.style)
            .await?;
        let blueprint = parse_blueprint(&raw, &self.placeholder_title).inspect_err(|e| {
            warn!("Mutation reply rejected, blueprint unchanged: {}", e.detail);
        })?;
        info!("Mutation applied: {} → {} slides", current.len(), blueprint.len());
        Ok(blueprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RemoteReply;
    use crate::retry::RemoteError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const PH: &str = "Untitled Slide";

    #[test]
    fn parses_plain_and_fenced_arrays() {
        let raw = r#"[{"title":"Intro","content":["a","b"]},{"title":"End","content":[]}]"#;
        let bp = parse_blueprint(raw, PH).unwrap();
        assert_eq!(bp.len(), 2);
        assert_eq!(bp.slides[0], Slide::new("Intro", vec!["a".into(), "b".into()]));

        let fenced = format!("```json\n{raw}\n```");
        assert_eq!(parse_blueprint(&fenced, PH).unwrap(), bp);
    }

    #[test]
    fn missing_title_and_content_get_defaults() {
        let bp = parse_blueprint(r#"[{"content":["x"]},{"title":"  ","content":null},{"title":"T"}]"#, PH)
            .unwrap();
        assert_eq!(bp.slides[0].title, PH);
        assert_eq!(bp.slides[1].title, PH);
        assert!(bp.slides[1].content.is_empty());
        assert!(bp.slides[2].content.is_empty());
    }

    #[test]
    fn wrong_shapes_are_rejected_with_raw_kept() {
        for raw in [
            "Sure! Here are your slides:",
            r#"{"title":"A","content":[]}"#,
            "[]",
            "[null]",
            r#"[{"title":5,"content":[]}]"#,
            r#"[{"title":"A","content":"one string"}]"#,
            r#"[{"title":"A","content":[null]}]"#,
            r#"[{"title":"A","content":[1,2]}]"#,
            r#"[{"title":"A","content":["ok"]}"#,
            "",
        ] {
            let err = parse_blueprint(raw, PH).unwrap_err();
            assert_eq!(err.raw, raw, "raw text must be preserved");
            assert!(!err.detail.is_empty());
        }
    }

    #[test]
    fn serialises_as_bare_array() {
        let bp = Blueprint::new(vec![Slide::new("A", vec!["p".into()])]);
        assert_eq!(bp.to_json().unwrap(), r#"[{"title":"A","content":["p"]}]"#);
        let back = Blueprint::from_json(&bp.to_json_pretty().unwrap(), PH).unwrap();
        assert_eq!(back, bp);
    }

    struct Fixed {
        reply: &'static str,
        requests: Mutex<Vec<RemoteRequest>>,
    }

    #[async_trait]
    impl RemoteModel for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(&self, request: RemoteRequest) -> Result<RemoteReply, RemoteError> {
            self.requests.lock().unwrap().push(request);
            Ok(RemoteReply {
                text: self.reply.to_string(),
                input_tokens: 7,
                output_tokens: 3,
            })
        }
    }

    fn store(reply: &'static str) -> (BlueprintStore, Arc<Fixed>) {
        let model = Arc::new(Fixed {
            reply,
            requests: Mutex::new(Vec::new()),
        });
        let store = BlueprintStore::new(model.clone(), &PipelineConfig::default());
        (store, model)
    }

    #[tokio::test]
    async fn generate_sends_style_and_counts_tokens() {
        let (store, model) = store(r#"[{"title":"Cells","content":["Membrane"]}]"#);
        let bp = store.generate("# Cells\nMembrane", "Be brief").await.unwrap();
        assert_eq!(bp.slides[0].title, "Cells");
        assert_eq!(store.usage(), (7, 3));

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests[0].system.as_deref(), Some("Be brief"));
        assert!(requests[0].expect_json);
        assert_eq!(requests[0].temperature, 0.0);
    }

    #[tokio::test]
    async fn generate_reports_parse_error() {
        let (store, _) = store("I cannot do that.");
        match store.generate("text", "style").await {
            Err(Pdf2DeckError::StructuringParse(e)) => assert_eq!(e.raw, "I cannot do that."),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mutate_sends_current_json_and_leaves_input_untouched() {
        let (store, model) = store(r#"[{"title":"A","content":["one"]},{"title":"Summary","content":[]}]"#);
        let current = Blueprint::new(vec![Slide::new("A", vec!["one".into()])]);
        let snapshot = current.clone();

        let next = store.mutate(&current, "add a summary slide").await.unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(current, snapshot);

        let requests = model.requests.lock().unwrap();
        assert!(requests[0].prompt.contains(r#"[{"title":"A","content":["one"]}]"#));
        assert!(requests[0].prompt.contains("add a summary slide"));
    }

    #[tokio::test]
    async fn blank_instruction_is_rejected_without_a_call() {
        let (store, model) = store("[]");
        let err = store.mutate(&Blueprint::default(), "   ").await.unwrap_err();
        assert!(matches!(err, Pdf2DeckError::InvalidInput { .. }));
        assert!(model.requests.lock().unwrap().is_empty());
    }
}
