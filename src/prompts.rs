//! Prompt templates for every model-facing agent.
//!
//! Templates are pairs of system/user text with `{{key}}` placeholders that
//! resolve against a JSON context. Dotted keys (`chapter.summary`) walk nested
//! objects, arrays render as bullet lists and missing keys render empty.
//!
//! Built-in templates can be overridden per name by placing
//! `<name>.system.md` and/or `<name>.user.md` in an override directory.

use crate::errors::PromptError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

/// Template names used by the built-in agents.
pub mod names {
    pub const GENERATE: &str = "generate";
    pub const JUDGE: &str = "judge";
    pub const SYNTHESIZE: &str = "synthesize";
    pub const SYNTHESIS_ANALYZE: &str = "synthesis_analyze";
    pub const SYNTHESIS_EXECUTE: &str = "synthesis_execute";
    pub const CORRECT: &str = "correct";
    pub const RETAKE: &str = "retake";
    pub const PERSONA_EVALUATE: &str = "persona_evaluate";
    pub const EXTRACT_STATE: &str = "extract_state";
    pub const REPETITION_CHECK: &str = "repetition_check";

    pub const ALL: [&str; 10] = [
        GENERATE,
        JUDGE,
        SYNTHESIZE,
        SYNTHESIS_ANALYZE,
        SYNTHESIS_EXECUTE,
        CORRECT,
        RETAKE,
        PERSONA_EVALUATE,
        EXTRACT_STATE,
        REPETITION_CHECK,
    ];
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("placeholder regex is valid")
});

/// A rendered system/user prompt pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

/// Renders a named template against a context object.
pub trait PromptRenderer: Send + Sync {
    fn render(&self, name: &str, context: &Value) -> Result<RenderedPrompt, PromptError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Template {
    system: String,
    user: String,
}

/// The default renderer: built-in templates plus optional file overrides.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    templates: HashMap<String, Template>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateRenderer {
    pub fn builtin() -> Self {
        let templates = names::ALL
            .iter()
            .map(|name| {
                let (system, user) = builtin_template(name);
                (
                    name.to_string(),
                    Template {
                        system: system.to_string(),
                        user: user.to_string(),
                    },
                )
            })
            .collect();
        Self { templates }
    }

    /// Replace built-in template halves with files found in `dir`.
    pub fn with_overrides(mut self, dir: &Path) -> Result<Self, PromptError> {
        for name in names::ALL {
            let Some(template) = self.templates.get_mut(name) else {
                continue;
            };
            for (suffix, slot) in [
                ("system", &mut template.system),
                ("user", &mut template.user),
            ] {
                let path = dir.join(format!("{}.{}.md", name, suffix));
                if path.exists() {
                    *slot = std::fs::read_to_string(&path)
                        .map_err(|source| PromptError::OverrideReadFailed { path, source })?;
                }
            }
        }
        Ok(self)
    }

    /// Register or replace a template.
    pub fn with_template(mut self, name: &str, system: &str, user: &str) -> Self {
        self.templates.insert(
            name.to_string(),
            Template {
                system: system.to_string(),
                user: user.to_string(),
            },
        );
        self
    }
}

impl PromptRenderer for TemplateRenderer {
    fn render(&self, name: &str, context: &Value) -> Result<RenderedPrompt, PromptError> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| PromptError::UnknownTemplate(name.to_string()))?;
        Ok(RenderedPrompt {
            system: substitute(&template.system, context),
            user: substitute(&template.user, context),
        })
    }
}

fn substitute(template: &str, context: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            lookup(context, &caps[1]).map(render_value).unwrap_or_default()
        })
        .into_owned()
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(context, |value, key| value.get(key))
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => format!("- {}", s),
                other => format!("- {}", other),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => serde_json::to_string_pretty(value).unwrap_or_default(),
        other => other.to_string(),
    }
}

fn builtin_template(name: &str) -> (&'static str, &'static str) {
    match name {
        names::GENERATE => (
            "You are a novelist writing one scene of a longer work.\n\
             Style: {{style}}\n\
             Write only the prose of the scene. No headings, no commentary.",
            "{{prompt}}",
        ),
        names::JUDGE => (
            "You are a strict literary judge comparing two drafts of the same scene.\n\
             Score each draft from 0.0 to 1.0 on: style, compliance, voice_accuracy, \
             originality, structure, amplitude, agency, stakes, overall.\n\
             Respond with ONLY a JSON object:\n\
             {\"winner\": \"A|B\", \"reasoning\": \"...\", \
             \"scores\": {\"A\": {...}, \"B\": {...}}, \
             \"praised_excerpts\": {\"A\": [\"...\"], \"B\": [\"...\"]}, \
             \"weaknesses\": {\"A\": [\"...\"], \"B\": [\"...\"]}, \
             \"axis_comments\": {\"style\": \"...\"}, \
             \"section_analysis\": [{\"section\": \"opening\", \"winner\": \"A\", \"note\": \"...\"}]}\n\
             There is no draw: pick A or B.",
            "## Draft A\n{{text_a}}\n\n## Draft B\n{{text_b}}",
        ),
        names::SYNTHESIZE => (
            "You are an editor refining a winning draft.\n\
             Keep the champion's structure, plot beats and narrative voice. \
             Keep its length within 10%. Weave in the qualities of the praised \
             excerpts from the other drafts without copying them verbatim.\n\
             Output only the revised prose.",
            "## Champion draft\n{{champion_text}}\n\n\
             ## Praised excerpts from other drafts\n{{excerpts}}\n\n\
             ## Judge notes\n{{reasoning}}",
        ),
        names::SYNTHESIS_ANALYZE => (
            "You are an editor planning a revision of a winning draft.\n\
             Respond with ONLY a JSON object:\n\
             {\"champion_assessment\": \"...\", \"preserve_elements\": [\"...\"], \
             \"actions\": [{\"section\": \"...\", \"type\": \"expression|pacing|detail|dialogue\", \
             \"description\": \"...\", \"source\": \"writer id\", \"priority\": 1}], \
             \"structural_changes\": [\"...\"], \
             \"expression_sources\": [{\"writer_id\": \"...\", \"expressions\": [\"...\"], \"context\": \"...\"}]}",
            "## Champion ({{champion_id}})\n{{champion_text}}\n\n\
             ## Praised excerpts by writer\n{{excerpts}}\n\n\
             ## Weaknesses noted by the judge\n{{weaknesses}}",
        ),
        names::SYNTHESIS_EXECUTE => (
            "You are an editor executing a revision plan on a draft.\n\
             Never change anything listed under Preserve. Apply the actions in \
             priority order. Keep length within 10%. Output only the revised prose.",
            "## Draft\n{{champion_text}}\n\n## Preserve\n{{preserve_elements}}\n\n\
             ## Actions\n{{actions}}\n\n## Structural changes\n{{structural_changes}}",
        ),
        names::CORRECT => (
            "You are a copy editor fixing rule violations in a scene.\n\
             Change only what is needed to resolve each violation. Keep voice, \
             plot and length. Output only the corrected prose.",
            "## Text\n{{text}}\n\n## Violations\n{{violations}}\n\n\
             ## Previous chapter summary\n{{previous_summary}}",
        ),
        names::RETAKE => (
            "You are a novelist rewriting a scene that readers found weak.\n\
             Address the feedback directly. Keep the plot beats and narrative \
             voice. Output only the rewritten prose.",
            "## Current scene\n{{text}}\n\n## Feedback\n{{feedback}}",
        ),
        names::PERSONA_EVALUATE => (
            "You are {{persona_name}}: {{persona_description}}\n\
             Rate the scene from 0.0 to 1.0 on: {{categories}}.\n\
             Respond with ONLY a JSON object:\n\
             {\"scores\": {\"<category>\": 0.0}, \"strengths\": [\"...\"], \
             \"weaknesses\": [\"...\"], \"suggestion\": \"...\"}",
            "{{text}}",
        ),
        names::EXTRACT_STATE => (
            "You track continuity for a serialized novel.\n\
             Re-list EVERY tracked character, not only those who changed.\n\
             Respond with ONLY a JSON object:\n\
             {\"character_states\": [{\"character_name\": \"...\", \"emotional_state\": \"...\", \
             \"knowledge_gained\": [\"...\"], \"relationship_changes\": [\"...\"], \
             \"physical_state\": \"...\"}], \"motif_occurrences\": {\"motif\": 1}, \
             \"variation_hint\": \"...\", \"summary\": \"...\", \
             \"dominant_tone\": \"...\", \"peak_intensity\": 0.0}",
            "## Chapter {{chapter_index}}\n{{text}}\n\n## Known motifs\n{{known_motifs}}\n\n\
             ## Characters tracked so far\n{{known_characters}}",
        ),
        names::REPETITION_CHECK => (
            "You detect repetition across chapters of a novel: reused imagery, \
             recycled phrasing, re-explained facts.\n\
             Respond with ONLY a JSON object:\n\
             {\"violations\": [{\"quote\": \"exact text from the new chapter\", \
             \"reason\": \"...\", \"severity\": \"warning|error\"}]}",
            "## Earlier chapters\n{{previous_summaries}}\n\n\
             ## Previous chapter text\n{{previous_text}}\n\n## New chapter\n{{text}}",
        ),
        _ => ("", ""),
    }
}
