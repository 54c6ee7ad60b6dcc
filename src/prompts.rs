//! Prompt templates for every remote call the pipeline makes.
//!
//! Keeping them here means a prompt change is a one-file edit, and unit tests
//! can inspect the rendered text without a model. Behaviour that depends on
//! the prompt (chunk-position-aware framing) is driven by [`CleaningPrompt`],
//! a plain struct, so it is testable on its own.

/// Instruction sent with every page image to the remote vision model.
pub const VISION_OCR_PROMPT: &str = "Extract ALL text accurately. Preserve formatting, steps, \
bullet points, equations, indentation, tables, and line breaks. Do NOT summarize. \
Return ONLY the raw text.";

/// Default system instruction for structuring and mutation.
///
/// Used when [`crate::config::PipelineConfig::style_instruction`] is `None`.
pub const DEFAULT_STYLE_INSTRUCTION: &str = r#"You are an expert presentation designer.
Turn study material into clear, well-organised slides.

Rules:
- One idea per slide; split long sections across several slides.
- Slide titles are short (at most 8 words) and descriptive.
- Bullet points are concise, factual, and keep every technical detail
  (numbers, formulas, names, steps) from the source.
- Keep the order of the source material.
- Never invent facts that are not in the source.
- Output strict JSON only."#;

/// Line present in every chunk prompt except the first.
pub const SKIP_INTRO_INSTRUCTION: &str =
    "- This is NOT Part 1: skip the general introduction of the document.";

/// Line present in every chunk prompt except the last.
pub const SKIP_CONCLUSION_INSTRUCTION: &str =
    "- This is NOT the last Part: skip the concluding summary of the document.";

/// Position of one chunk inside the document; renders its cleaning prompt.
///
/// Only the first chunk may keep a document introduction and only the last
/// may keep a conclusion, so that concatenated chunks do not repeat framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleaningPrompt {
    /// 1-based.
    pub chunk_index: usize,
    pub total_chunks: usize,
}

impl CleaningPrompt {
    pub fn new(chunk_index: usize, total_chunks: usize) -> Self {
        Self {
            chunk_index,
            total_chunks,
        }
    }

    pub fn is_first(&self) -> bool {
        self.chunk_index <= 1
    }

    pub fn is_last(&self) -> bool {
        self.chunk_index >= self.total_chunks
    }

    /// Full prompt for `raw_text`.
    pub fn render(&self, raw_text: &str) -> String {
        let mut rules = Vec::with_capacity(6);
        if !self.is_first() {
            rules.push(SKIP_INTRO_INSTRUCTION);
        }
        if !self.is_last() {
            rules.push(SKIP_CONCLUSION_INSTRUCTION);
        }
        rules.push("- Fix OCR errors and preserve ALL technical details and bullet points.");
        rules.push("- Maintain Markdown structure (# for topics, ## for sections).");
        rules.push("- Lines starting with [OCR ERROR] mark unreadable pages: keep them as they are.");

        format!(
            "You are a professional text cleaner. This is PART {i} of {n} of a larger study document.\n\
             \n\
             STRICT INSTRUCTIONS:\n\
             {rules}\n\
             \n\
             OCR Text from Part {i}:\n\
             {raw_text}\n\
             \n\
             Return ONLY the cleaned Markdown.",
            i = self.chunk_index,
            n = self.total_chunks,
            rules = rules.join("\n"),
        )
    }
}

/// Prompt asking for a fresh blueprint from cleaned text.
pub fn structure_prompt(cleaned_text: &str) -> String {
    format!(
        r#"You must generate a presentation structure in STRICT JSON ONLY.

CLEANED_TEXT:
"""{cleaned_text}"""

TASK:
- Convert the cleaned text into a slide-by-slide structure.
- Create clear slide titles.
- Add bullet points.
- NO explanations.
- NO text outside JSON.
- JSON must be an array of objects with exactly these keys:
[
  {{
    "title": "...",
    "content": ["...", "..."]
  }}
]"#
    )
}

/// Prompt asking for a complete replacement of `current_json`.
pub fn mutate_prompt(current_json: &str, instruction: &str) -> String {
    format!(
        r#"Return ONLY valid JSON.

CURRENT_JSON:
"""{current_json}"""

USER_INSTRUCTION:
"""{instruction}"""

TASK:
- Modify the JSON according to the instruction.
- Return the COMPLETE updated array, not only the changed slides.
- Keep the same shape: [{{"title": "...", "content": ["..."]}}].
- Do not add text outside JSON."#
    )
}
