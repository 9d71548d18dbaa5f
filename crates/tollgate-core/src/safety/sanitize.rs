//! Prompt sanitization: structural well-formedness of the task text.

use regex::Regex;

use super::{compile, AdmissionCheck};
use crate::domain::{GatewayError, Role};

const DIRECTIVE_PATTERNS: &[(&str, &str)] = &[
    ("role_prefix", r"(?im)^\s*(system|assistant|developer)\s*:"),
    ("chat_template_token", r"(?i)<\|?\s*/?\s*(im_start|im_end|system|endoftext)\s*\|?>"),
    ("instruction_block", r"(?i)\[/?(inst|sys)\]|<<\s*/?sys\s*>>"),
    (
        "override_instructions",
        r"(?i)\b(ignore|disregard|forget|override)\s+(all\s+|any\s+|the\s+)?(previous|prior|above|earlier|system)\s+(instructions?|directives?|rules|prompts?)",
    ),
    (
        "mode_switch",
        r"(?i)\byou\s+are\s+now\s+(in\s+)?(developer|dan|jailbreak|unrestricted|god)\b",
    ),
];

fn is_invisible_format(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' | '\u{FEFF}')
}

pub struct PromptSanitizer {
    max_chars: usize,
    directives: Vec<(&'static str, Regex)>,
}

impl PromptSanitizer {
    pub fn new(max_chars: usize) -> Result<Self, GatewayError> {
        let directives = DIRECTIVE_PATTERNS
            .iter()
            .map(|(name, pattern)| Ok((*name, compile(name, pattern)?)))
            .collect::<Result<Vec<_>, GatewayError>>()?;
        Ok(Self {
            max_chars,
            directives,
        })
    }

    fn problems(&self, text: &str) -> Vec<String> {
        let mut problems = Vec::new();

        if text.trim().is_empty() {
            problems.push("empty task text".to_string());
            return problems;
        }

        let len = text.chars().count();
        if len > self.max_chars {
            problems.push(format!("text is {len} chars, limit is {}", self.max_chars));
        }

        if let Some(c) = text
            .chars()
            .find(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            problems.push(format!("control character U+{:04X}", c as u32));
        }
        if let Some(c) = text.chars().find(|c| is_invisible_format(*c)) {
            problems.push(format!("invisible formatting character U+{:04X}", c as u32));
        }

        if text.matches("```").count() % 2 != 0 {
            problems.push("unbalanced code fence".to_string());
        }

        let hits: Vec<&str> = self
            .directives
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(name, _)| *name)
            .collect();
        if !hits.is_empty() {
            problems.push(format!("embedded system directive ({})", hits.join(", ")));
        }

        problems
    }
}

impl AdmissionCheck for PromptSanitizer {
    fn name(&self) -> &'static str {
        "prompt_sanitization"
    }

    fn check(&self, description: &str, _role: Role) -> Result<(), String> {
        let problems = self.problems(description);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}
