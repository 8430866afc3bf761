//! Transition trigger evaluation.
//!
//! Regex triggers are matched against chat text here. Timed triggers are
//! only surfaced as data; polling them against the turn counter is left to
//! the caller driving the story.
use regex::{Regex, RegexBuilder};
use rustc_hash::FxHashMap;

use crate::schema::story::{Transition, TransitionTrigger, TriggerPattern};

/// A transition whose trigger matched, with the pattern that matched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMatch {
    pub transition_id: String,
    pub to: String,
    pub pattern: String,
}

/// A turn-count trigger, exposed for polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedTransition {
    pub transition_id: String,
    pub to: String,
    pub within_turns: u32,
}

impl TimedTransition {
    /// True once the checkpoint has been active for `within_turns` turns.
    pub fn is_due(&self, checkpoint_turn_count: u32) -> bool {
        checkpoint_turn_count >= self.within_turns
    }
}

/// Collect the timed triggers among `transitions`.
pub fn timed_transitions<'a, I>(transitions: I) -> Vec<TimedTransition>
where
    I: IntoIterator<Item = &'a Transition>,
{
    transitions
        .into_iter()
        .filter_map(|t| match t.trigger {
            TransitionTrigger::Timed { within_turns } => Some(TimedTransition {
                transition_id: t.id.clone(),
                to: t.to.clone(),
                within_turns,
            }),
            TransitionTrigger::Regex { .. } => None,
        })
        .collect()
}

/// Compile a pattern with JavaScript-style flags.
///
/// `g`, `y`, `d` and `v` have no meaning for a single test and are ignored.
pub fn compile_pattern(pattern: &TriggerPattern) -> Result<Regex, regex::Error> {
    let mut builder = RegexBuilder::new(&pattern.pattern);
    for flag in pattern.flags.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            'u' => {
                builder.unicode(true);
            }
            _ => {}
        }
    }
    builder.build()
}

/// Matches chat text against regex triggers, compiling each distinct
/// pattern once. Patterns that fail to compile are remembered and never
/// match.
#[derive(Debug, Default)]
pub struct TriggerEvaluator {
    compiled: FxHashMap<TriggerPattern, Option<Regex>>,
}

impl TriggerEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn regex_for(&mut self, pattern: &TriggerPattern) -> Option<&Regex> {
        self.compiled
            .entry(pattern.clone())
            .or_insert_with(|| match compile_pattern(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!(
                        pattern = %pattern.pattern,
                        flags = %pattern.flags,
                        error = %e,
                        "invalid trigger pattern; treating as non-matching"
                    );
                    None
                }
            })
            .as_ref()
    }

    /// Every transition whose regex trigger matches `text`, in the order
    /// given, each paired with its first matching pattern.
    pub fn evaluate<'a, I>(&mut self, text: &str, transitions: I) -> Vec<TriggerMatch>
    where
        I: IntoIterator<Item = &'a Transition>,
    {
        let mut matches = Vec::new();
        for transition in transitions {
            let TransitionTrigger::Regex { patterns, .. } = &transition.trigger else {
                continue;
            };
            let hit = patterns.iter().find(|pattern| {
                self.regex_for(pattern)
                    .map(|regex| regex.is_match(text))
                    .unwrap_or(false)
            });
            if let Some(pattern) = hit {
                tracing::debug!(
                    transition = %transition.id,
                    pattern = %pattern.pattern,
                    "transition trigger matched"
                );
                matches.push(TriggerMatch {
                    transition_id: transition.id.clone(),
                    to: transition.to.clone(),
                    pattern: pattern.pattern.clone(),
                });
            }
        }
        matches
    }

    /// Number of distinct patterns seen so far, including invalid ones.
    pub fn cached_patterns(&self) -> usize {
        self.compiled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regex_transition(id: &str, patterns: &[TriggerPattern]) -> Transition {
        Transition {
            id: id.to_string(),
            from: "a".to_string(),
            to: format!("{id}_target"),
            trigger: TransitionTrigger::Regex {
                patterns: patterns.to_vec(),
                condition: String::new(),
            },
            label: None,
            description: None,
        }
    }

    fn timed_transition(id: &str, within_turns: u32) -> Transition {
        Transition {
            id: id.to_string(),
            from: "a".to_string(),
            to: "b".to_string(),
            trigger: TransitionTrigger::Timed { within_turns },
            label: None,
            description: None,
        }
    }

    #[test]
    fn returns_all_matches_in_order() {
        let transitions = vec![
            regex_transition("door", &[TriggerPattern::new("door", "")]),
            regex_transition("window", &[TriggerPattern::new("window", "")]),
            regex_transition("open", &[TriggerPattern::new("open", "")]),
        ];
        let mut evaluator = TriggerEvaluator::new();
        let found = evaluator.evaluate("I open the door", &transitions);
        let ids: Vec<_> = found.iter().map(|m| m.transition_id.as_str()).collect();
        assert_eq!(ids, vec!["door", "open"]);
        assert_eq!(found[0].to, "door_target");
    }

    #[test]
    fn reports_matching_pattern() {
        let transitions = vec![regex_transition(
            "leave",
            &[TriggerPattern::new("exit", ""), TriggerPattern::new("leave", "")],
        )];
        let found = TriggerEvaluator::new().evaluate("we leave now", &transitions);
        assert_eq!(found[0].pattern, "leave");
    }

    #[test]
    fn flags_are_honoured() {
        let transitions = vec![
            regex_transition("ci", &[TriggerPattern::new("^dragon$", "im")]),
            regex_transition("cs", &[TriggerPattern::new("DRAGON", "")]),
        ];
        let found = TriggerEvaluator::new().evaluate("a line\nDragon\nend", &transitions);
        let ids: Vec<_> = found.iter().map(|m| m.transition_id.as_str()).collect();
        assert_eq!(ids, vec!["ci"]);
    }

    #[test]
    fn bad_pattern_does_not_block_others() {
        let transitions = vec![regex_transition(
            "mixed",
            &[TriggerPattern::new("(unclosed", ""), TriggerPattern::new("sword", "")],
        )];
        let mut evaluator = TriggerEvaluator::new();
        let found = evaluator.evaluate("draw the sword", &transitions);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pattern, "sword");
        assert_eq!(evaluator.cached_patterns(), 2);
    }

    #[test]
    fn patterns_compile_once() {
        let transitions = vec![
            regex_transition("one", &[TriggerPattern::new("bell", "i")]),
            regex_transition("two", &[TriggerPattern::new("bell", "i")]),
        ];
        let mut evaluator = TriggerEvaluator::new();
        evaluator.evaluate("Bell", &transitions);
        evaluator.evaluate("no match", &transitions);
        assert_eq!(evaluator.cached_patterns(), 1);
    }

    #[test]
    fn timed_triggers_are_not_text_matched() {
        let transitions = vec![timed_transition("wait", 3)];
        assert!(TriggerEvaluator::new().evaluate("anything", &transitions).is_empty());

        let timed = timed_transitions(&transitions);
        assert_eq!(timed.len(), 1);
        assert!(!timed[0].is_due(2));
        assert!(timed[0].is_due(3));
    }
}
