//! Request analysis: turn raw request text into a set of discrete signals.
//!
//! Every rule is independent and non-exclusive. Detection is a pure
//! function of `(text, context, thresholds)`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EscalationConfig;

static COMPLEX_KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(analy[sz]\w*|refactor\w*|optimi[sz]\w*|debug\w*|architect\w*|design\w*|implement\w*|migrat\w*|investigat\w*|restructur\w*|rewrit\w*|integrat\w*|benchmark\w*|profil\w*|audit\w*|diagnos\w*)\b",
    )
    .expect("COMPLEX_KEYWORD_RE regex should compile")
});

static EDIT_VERB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(edit\w*|modif\w*|fix|fixe[sd]|fixing|updat\w*|chang\w*|add|adds|added|adding|remov\w*|delet\w*|renam\w*|replac\w*|writ\w*|wrote|creat\w*|implement\w*)\b",
    )
    .expect("EDIT_VERB_RE regex should compile")
});

static REFACTOR_VERB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(refactor\w*|restructur\w*|rewrit\w*|rearchitect\w*)\b")
        .expect("REFACTOR_VERB_RE regex should compile")
});

static SEQUENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(first|then|finally|afterwards|after that|subsequently)\b")
        .expect("SEQUENCE_RE regex should compile")
});

static CLAUSE_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\band\b|[,;]|\.\s").expect("CLAUSE_SPLIT_RE regex should compile")
});

static FILE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b[\w\-/]+\.(rs|py|js|ts|tsx|jsx|go|java|kt|c|h|cc|cpp|hpp|cs|rb|php|swift|md|toml|json|ya?ml|txt|sh|html|css|sql|lock|cfg|ini|xml|csv)\b",
    )
    .expect("FILE_NAME_RE regex should compile")
});

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s"'(`])(?:\.{1,2}/|~/|/)[\w.\-]+(?:/[\w.\-]*)*"#)
        .expect("PATH_RE regex should compile")
});

static INLINE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`[^`\n]+`").expect("INLINE_CODE_RE regex should compile")
});

const INTERROGATIVES: &[&str] = &[
    "what", "who", "whom", "whose", "where", "when", "why", "how", "which", "is", "are", "was",
    "were", "can", "could", "does", "do", "did", "should", "would", "will", "may",
];

/// Verbs that open an imperative clause.
const ACTION_VERBS: &[&str] = &[
    "add", "analyze", "build", "change", "check", "create", "debug", "delete", "deploy",
    "document", "edit", "find", "fix", "implement", "install", "migrate", "modify", "move",
    "optimize", "refactor", "remove", "rename", "replace", "restructure", "rewrite", "run",
    "test", "update", "write",
];

/// One observed property of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    SimpleQuestion,
    LongPrompt,
    ComplexKeywords,
    FileReferences,
    EditIntent,
    RefactorIntent,
    MultiStepIntent,
    CodeBlocks,
    RepoContext,
    /// A previous attempt failed. Set by the pipeline, never by text.
    ToolFailure,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SimpleQuestion => "simple_question",
            Self::LongPrompt => "long_prompt",
            Self::ComplexKeywords => "complex_keywords",
            Self::FileReferences => "file_references",
            Self::EditIntent => "edit_intent",
            Self::RefactorIntent => "refactor_intent",
            Self::MultiStepIntent => "multi_step_intent",
            Self::CodeBlocks => "code_blocks",
            Self::RepoContext => "repo_context",
            Self::ToolFailure => "tool_failure",
        };
        f.write_str(name)
    }
}

/// Ordered so iteration and serialization are deterministic.
pub type SignalSet = BTreeSet<Signal>;

/// Side information about where a request is being handled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    /// The workspace is under version control.
    pub is_repo: bool,
    pub workspace: Option<String>,
    /// A previous attempt at this request failed.
    pub failure_occurred: bool,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl RequestContext {
    pub fn repo(workspace: impl Into<String>) -> Self {
        Self {
            is_repo: true,
            workspace: Some(workspace.into()),
            ..Default::default()
        }
    }

    pub fn with_failure(mut self) -> Self {
        self.failure_occurred = true;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SignalDetector {
    long_prompt_threshold: usize,
    complex_keyword_threshold: usize,
    simple_question_max_words: usize,
}

impl Default for SignalDetector {
    fn default() -> Self {
        Self::from_config(&EscalationConfig::default())
    }
}

impl SignalDetector {
    pub fn from_config(config: &EscalationConfig) -> Self {
        Self {
            long_prompt_threshold: config.long_prompt_threshold,
            complex_keyword_threshold: config.complex_keyword_threshold.max(1),
            simple_question_max_words: config.simple_question_max_words,
        }
    }

    pub fn detect(&self, request: &str, context: &RequestContext) -> SignalSet {
        let mut signals = SignalSet::new();
        let text = request.trim();
        let word_count = text.split_whitespace().count();

        let has_edit = EDIT_VERB_RE.is_match(text);
        let has_refactor = REFACTOR_VERB_RE.is_match(text);

        if word_count > self.long_prompt_threshold {
            signals.insert(Signal::LongPrompt);
        }
        if COMPLEX_KEYWORD_RE.find_iter(text).count() >= self.complex_keyword_threshold {
            signals.insert(Signal::ComplexKeywords);
        }
        if FILE_NAME_RE.is_match(text) || PATH_RE.is_match(text) {
            signals.insert(Signal::FileReferences);
        }
        if has_edit || has_refactor {
            signals.insert(Signal::EditIntent);
        }
        if has_refactor {
            signals.insert(Signal::RefactorIntent);
        }
        if is_multi_step(text) {
            signals.insert(Signal::MultiStepIntent);
        }
        if text.contains("```") || INLINE_CODE_RE.is_match(text) {
            signals.insert(Signal::CodeBlocks);
        }
        if word_count > 0
            && word_count <= self.simple_question_max_words
            && !has_edit
            && !has_refactor
            && is_interrogative(text)
        {
            signals.insert(Signal::SimpleQuestion);
        }
        if context.is_repo {
            signals.insert(Signal::RepoContext);
        }
        if context.failure_occurred {
            signals.insert(Signal::ToolFailure);
        }

        signals
    }
}

fn first_word_lower(text: &str) -> Option<String> {
    text.split_whitespace().next().map(|w| {
        w.trim_matches(|c: char| !c.is_alphanumeric())
            .to_ascii_lowercase()
    })
}

fn is_interrogative(text: &str) -> bool {
    if text.ends_with('?') {
        return true;
    }
    first_word_lower(text).is_some_and(|w| INTERROGATIVES.contains(&w.as_str()))
}

fn is_multi_step(text: &str) -> bool {
    if SEQUENCE_RE.is_match(text) {
        return true;
    }
    if text.matches('?').count() >= 2 {
        return true;
    }
    let imperative_clauses = CLAUSE_SPLIT_RE
        .split(text)
        .filter_map(first_word_lower)
        .filter(|w| ACTION_VERBS.contains(&w.as_str()))
        .count();
    imperative_clauses >= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(text: &str) -> SignalSet {
        SignalDetector::default().detect(text, &RequestContext::default())
    }

    #[test]
    fn test_simple_question() {
        let signals = detect("What is the capital of France?");
        assert_eq!(signals, SignalSet::from([Signal::SimpleQuestion]));
    }

    #[test]
    fn test_question_with_change_verb_is_not_simple() {
        let signals = detect("Can you fix the login bug?");
        assert!(!signals.contains(&Signal::SimpleQuestion));
        assert!(signals.contains(&Signal::EditIntent));
    }

    #[test]
    fn test_refactor_sets_edit_refactor_and_multistep() {
        let signals = detect("Refactor the auth module and add tests");
        assert!(signals.contains(&Signal::RefactorIntent));
        assert!(signals.contains(&Signal::EditIntent));
        assert!(signals.contains(&Signal::MultiStepIntent));
    }

    #[test]
    fn test_sequencing_words_and_double_questions() {
        assert!(detect("First read the docs, then summarize them").contains(&Signal::MultiStepIntent));
        assert!(detect("Why does it fail? Where is it configured?").contains(&Signal::MultiStepIntent));
        assert!(!detect("Summarize the README").contains(&Signal::MultiStepIntent));
    }

    #[test]
    fn test_file_references() {
        assert!(detect("Look at src/main.rs").contains(&Signal::FileReferences));
        assert!(detect("open ./scripts/deploy").contains(&Signal::FileReferences));
        assert!(detect("check Cargo.toml please").contains(&Signal::FileReferences));
        assert!(!detect("tell me a joke").contains(&Signal::FileReferences));
    }

    #[test]
    fn test_code_blocks() {
        assert!(detect("What does `Vec::drain` do?").contains(&Signal::CodeBlocks));
        assert!(detect("explain\n```\nfn main() {}\n```").contains(&Signal::CodeBlocks));
    }

    #[test]
    fn test_long_prompt_and_complex_keywords() {
        let config = EscalationConfig {
            long_prompt_threshold: 5,
            ..Default::default()
        };
        let detector = SignalDetector::from_config(&config);
        let signals = detector.detect(
            "please analyze the slow path and optimize it for throughput",
            &RequestContext::default(),
        );
        assert!(signals.contains(&Signal::LongPrompt));
        assert!(signals.contains(&Signal::ComplexKeywords));
    }

    #[test]
    fn test_context_flags() {
        let ctx = RequestContext::repo("/work").with_failure();
        let signals = SignalDetector::default().detect("hello", &ctx);
        assert!(signals.contains(&Signal::RepoContext));
        assert!(signals.contains(&Signal::ToolFailure));
    }

    #[test]
    fn test_detection_is_deterministic() {
        let text = "Update config.toml then restart the service";
        assert_eq!(detect(text), detect(text));
    }
}
