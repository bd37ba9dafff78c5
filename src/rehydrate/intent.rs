//! Intent classification
//!
//! Rule-based weighted pattern scoring over the query text. Built-in
//! intents cover the common assistant workloads; deployments contribute
//! extra tags (with their keyword lists) through configuration. The
//! classifier is pure and fast; an ML classifier can replace it behind the
//! same signature.

use std::collections::HashMap;

/// A query intent tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Intent {
    /// Programming assistance
    CodeAssist,
    /// Research and fact-finding
    Research,
    /// Meeting preparation
    MeetingPrep,
    /// Drafting and editing prose
    Writing,
    /// Data or situation analysis
    Analysis,
    /// Anything else
    General,
    /// Deployment-specific tag from configuration
    Custom(String),
}

impl Intent {
    /// Stable tag string (used in cache keys and override tables)
    pub fn as_str(&self) -> &str {
        match self {
            Intent::CodeAssist => "code-assist",
            Intent::Research => "research",
            Intent::MeetingPrep => "meeting-prep",
            Intent::Writing => "writing",
            Intent::Analysis => "analysis",
            Intent::General => "general",
            Intent::Custom(tag) => tag,
        }
    }

    /// Parse a tag string back into an intent
    pub fn from_tag(tag: &str) -> Intent {
        match tag {
            "code-assist" => Intent::CodeAssist,
            "research" => Intent::Research,
            "meeting-prep" => Intent::MeetingPrep,
            "writing" => Intent::Writing,
            "analysis" => Intent::Analysis,
            "general" => Intent::General,
            other => Intent::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weighted keyword classifier
pub struct IntentClassifier {
    /// intent → (keyword, weight) table
    tables: Vec<(Intent, Vec<(&'static str, f32)>)>,
    /// Extra tags from configuration, each with unit-weight keywords
    extra: Vec<(Intent, Vec<String>)>,
}

impl IntentClassifier {
    /// Built-in tables plus configuration-supplied tags
    pub fn new(extra_intents: &HashMap<String, Vec<String>>) -> Self {
        let tables = vec![
            (
                Intent::CodeAssist,
                vec![
                    ("code", 2.0),
                    ("function", 1.5),
                    ("bug", 2.0),
                    ("error", 1.5),
                    ("compile", 2.0),
                    ("implement", 1.5),
                    ("refactor", 2.0),
                    ("api", 1.0),
                    ("test", 1.0),
                    ("debug", 2.0),
                ],
            ),
            (
                Intent::Research,
                vec![
                    ("research", 2.0),
                    ("paper", 1.5),
                    ("study", 1.5),
                    ("compare", 1.5),
                    ("sources", 1.5),
                    ("literature", 2.0),
                    ("survey", 1.5),
                    ("recommend", 1.0),
                ],
            ),
            (
                Intent::MeetingPrep,
                vec![
                    ("meeting", 2.0),
                    ("agenda", 2.0),
                    ("standup", 2.0),
                    ("prep", 1.5),
                    ("attendees", 1.5),
                    ("minutes", 1.5),
                ],
            ),
            (
                Intent::Writing,
                vec![
                    ("write", 2.0),
                    ("draft", 2.0),
                    ("essay", 2.0),
                    ("blog", 1.5),
                    ("rewrite", 1.5),
                    ("tone", 1.0),
                    ("paragraph", 1.5),
                ],
            ),
            (
                Intent::Analysis,
                vec![
                    ("analyze", 2.0),
                    ("analysis", 2.0),
                    ("trend", 1.5),
                    ("metrics", 1.5),
                    ("data", 1.0),
                    ("breakdown", 1.5),
                ],
            ),
        ];
        let extra = extra_intents
            .iter()
            .map(|(tag, keywords)| (Intent::Custom(tag.clone()), keywords.clone()))
            .collect();
        Self { tables, extra }
    }

    /// Classify a query; `General` when nothing scores
    pub fn classify(&self, query: &str) -> Intent {
        let lowered = query.to_lowercase();
        let mut best = Intent::General;
        let mut best_score = 0.0f32;

        for (intent, keywords) in &self.tables {
            let score: f32 = keywords
                .iter()
                .filter(|(keyword, _)| lowered.contains(keyword))
                .map(|(_, weight)| weight)
                .sum();
            if score > best_score {
                best_score = score;
                best = intent.clone();
            }
        }
        for (intent, keywords) in &self.extra {
            let score = keywords
                .iter()
                .filter(|keyword| lowered.contains(keyword.as_str()))
                .count() as f32;
            if score > best_score {
                best_score = score;
                best = intent.clone();
            }
        }
        best
    }
}
