use regex::{Regex, RegexBuilder};
use relay_core::{DedupRule, RuleKind};
use tracing::warn;

/// An identifier pulled out of a message, with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub identifier: String,
    pub rule: DedupRule,
}

#[derive(Debug, Clone)]
enum Matcher {
    Pattern(Regex),
    Keyword { keyword: String, pattern: Regex },
}

/// A dedup rule ready to run. Regex rules that fail to compile have already
/// been downgraded to keyword matching on their literal text.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: DedupRule,
    matcher: Matcher,
}

impl CompiledRule {
    pub fn compile(rule: &DedupRule) -> Option<Self> {
        let trimmed = rule.pattern.trim();
        if trimmed.is_empty() {
            warn!(kind = ?rule.kind, "skipping dedup rule with empty pattern");
            return None;
        }

        if rule.kind == RuleKind::Regex {
            match RegexBuilder::new(trimmed).case_insensitive(true).build() {
                Ok(pattern) => {
                    return Some(Self {
                        rule: rule.clone(),
                        matcher: Matcher::Pattern(pattern),
                    })
                }
                Err(err) => {
                    warn!(
                        pattern = trimmed,
                        error = %err,
                        "dedup regex does not compile; matching it as a keyword"
                    );
                }
            }
        }

        match keyword_pattern(trimmed) {
            Ok(pattern) => Some(Self {
                rule: rule.clone(),
                matcher: Matcher::Keyword {
                    keyword: trimmed.to_owned(),
                    pattern,
                },
            }),
            Err(err) => {
                warn!(pattern = trimmed, error = %err, "skipping malformed dedup rule");
                None
            }
        }
    }

    pub fn rule(&self) -> &DedupRule {
        &self.rule
    }

    fn find(&self, text: &str) -> Option<String> {
        match &self.matcher {
            Matcher::Pattern(pattern) => {
                let captures = pattern.captures(text)?;
                let matched = captures.get(1).or_else(|| captures.get(0))?;
                non_empty(matched.as_str())
            }
            Matcher::Keyword { keyword, pattern } => {
                let value = non_empty(pattern.captures(text)?.get(1)?.as_str())?;
                (!value.eq_ignore_ascii_case(keyword)).then_some(value)
            }
        }
    }
}

fn keyword_pattern(keyword: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(keyword);
    let source = if keyword.ends_with(':') {
        format!(r"{escaped}\s*(\S+)")
    } else {
        format!(r"{escaped}\s*:?\s*(\S+)")
    };
    RegexBuilder::new(&source).case_insensitive(true).build()
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_owned())
}

/// Compiles rules in order, dropping the ones that cannot be used.
pub fn compile_rules(rules: &[DedupRule]) -> Vec<CompiledRule> {
    rules.iter().filter_map(CompiledRule::compile).collect()
}

/// Runs the rules in order against `subject` and `body` joined by a single
/// space. The first rule yielding a usable value wins.
pub fn extract(subject: &str, body: &str, rules: &[CompiledRule]) -> Option<Extraction> {
    let text = format!("{subject} {body}");
    rules.iter().find_map(|rule| {
        rule.find(&text).map(|identifier| Extraction {
            identifier,
            rule: rule.rule.clone(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(subject: &str, body: &str, rules: &[DedupRule]) -> Option<Extraction> {
        extract(subject, body, &compile_rules(rules))
    }

    #[test]
    fn keyword_rule_extracts_value_after_colon() {
        let found = run("Router down", "MAC: AABBCCDDEEFF", &[DedupRule::keyword("MAC:")])
            .expect("identifier");

        assert_eq!(found.identifier, "AABBCCDDEEFF");
        assert_eq!(found.rule, DedupRule::keyword("MAC:"));
    }

    #[test]
    fn keyword_without_colon_accepts_optional_separator() {
        let rules = [DedupRule::keyword("OS")];

        assert_eq!(
            run("", "os 4411 opened", &rules).map(|found| found.identifier),
            Some("4411".to_owned())
        );
        assert_eq!(
            run("", "OS: 4412", &rules).map(|found| found.identifier),
            Some("4412".to_owned())
        );
    }

    #[test]
    fn keyword_rejects_value_equal_to_keyword() {
        assert!(run("MAC: mac:", "", &[DedupRule::keyword("MAC:")]).is_none());
    }

    #[test]
    fn regex_uses_first_capture_group_case_insensitively() {
        let rules = [DedupRule::regex(r"order\s*#(\d+)")];
        let found = run("ORDER #8812", "", &rules).expect("identifier");

        assert_eq!(found.identifier, "8812");
    }

    #[test]
    fn regex_without_group_yields_whole_match() {
        let found = run("", "ref WO-2201 attached", &[DedupRule::regex(r"wo-\d+")])
            .expect("identifier");

        assert_eq!(found.identifier, "WO-2201");
    }

    #[test]
    fn subject_and_body_are_joined_by_a_space() {
        let found = run("serial", "XY99", &[DedupRule::regex(r"serial (\w+)")])
            .expect("identifier");

        assert_eq!(found.identifier, "XY99");
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = [
            DedupRule::keyword("UUID:"),
            DedupRule::keyword("MAC:"),
            DedupRule::keyword("SERIAL:"),
        ];
        let found = run("", "SERIAL: S1 MAC: M1", &rules).expect("identifier");

        assert_eq!(found.identifier, "M1");
    }

    #[test]
    fn malformed_regex_falls_back_to_keyword_matching() {
        let rules = [DedupRule::regex("ID(")];
        let compiled = compile_rules(&rules);

        assert_eq!(compiled.len(), 1);
        assert_eq!(
            extract("", "ID( 77", &compiled).map(|found| found.identifier),
            Some("77".to_owned())
        );
    }

    #[test]
    fn empty_rules_are_skipped_and_nothing_found_is_none() {
        let rules = [DedupRule::keyword("  "), DedupRule::keyword("MAC:")];

        assert_eq!(compile_rules(&rules).len(), 1);
        assert!(run("hello", "no identifiers here", &rules).is_none());
    }
}
