use super::instructions::{ImmediateKind, InstructionId, InstructionInfo, StackEffect};
use crate::Error;
use std::collections::{HashMap, VecDeque};

/// Where a replacement instruction takes one of its immediates from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImmediateSource {
    /// Copy immediate `immediate` of pattern instruction `instruction`
    Pattern { instruction: usize, immediate: usize },

    /// Literal value
    Value(i32),
}

/// Shorthand for [`ImmediateSource::Pattern`]
pub fn from_pattern(instruction: usize, immediate: usize) -> ImmediateSource {
    ImmediateSource::Pattern {
        instruction,
        immediate,
    }
}

/// Peephole rule: when the most recently emitted instructions are `pattern` (and the equality
/// constraints between their immediates hold), replace them with `replacement`
///
/// Instructions are referred to by name and resolved when the model is built.
#[derive(Clone, Debug)]
pub struct RewriteRule {
    pub name: String,
    pub pattern: Vec<String>,
    pub equalities: Vec<((usize, usize), (usize, usize))>,
    pub replacement: Vec<(String, Vec<ImmediateSource>)>,
}

impl RewriteRule {
    pub fn new(name: impl Into<String>) -> RewriteRule {
        RewriteRule {
            name: name.into(),
            pattern: vec![],
            equalities: vec![],
            replacement: vec![],
        }
    }

    pub fn pattern(mut self, instructions: &[&str]) -> RewriteRule {
        self.pattern
            .extend(instructions.iter().map(|name| name.to_string()));
        self
    }

    /// Require immediate `left.1` of pattern instruction `left.0` to equal `right.1` of `right.0`
    pub fn equal(mut self, left: (usize, usize), right: (usize, usize)) -> RewriteRule {
        self.equalities.push((left, right));
        self
    }

    pub fn replace(mut self, instruction: &str, immediates: Vec<ImmediateSource>) -> RewriteRule {
        self.replacement.push((instruction.to_owned(), immediates));
        self
    }
}

/// Rule with instructions resolved to ids
#[derive(Clone, Debug)]
pub(crate) struct ResolvedRule {
    pub name: String,
    pub pattern: Vec<InstructionId>,
    pub equalities: Vec<((usize, usize), (usize, usize))>,
    pub replacement: Vec<(InstructionId, Vec<ImmediateSource>)>,
}

impl ResolvedRule {
    pub fn resolve(
        rule: &RewriteRule,
        instructions: &[InstructionInfo],
        names: &HashMap<String, InstructionId>,
    ) -> Result<ResolvedRule, Error> {
        let invalid =
            |message: String| Error::InvalidModel(format!("rule {}: {}", rule.name, message));
        let lookup = |name: &str| {
            names
                .get(name)
                .copied()
                .ok_or_else(|| invalid(format!("unknown instruction {}", name)))
        };

        if rule.pattern.is_empty() {
            return Err(invalid(String::from("empty pattern")));
        }
        let pattern = rule
            .pattern
            .iter()
            .map(|name| lookup(name))
            .collect::<Result<Vec<_>, _>>()?;
        let info = move |id: InstructionId| &instructions[id.0 as usize];
        let last = pattern.len() - 1;

        for (index, id) in pattern.iter().enumerate() {
            if index != last && info(*id).branch_target_index().is_some() {
                return Err(invalid(format!(
                    "{} has a branch target but is not the last pattern instruction",
                    info(*id).name
                )));
            }
        }

        let immediate_kind = |instruction: usize, immediate: usize| {
            pattern
                .get(instruction)
                .and_then(|id| info(*id).immediates.get(immediate))
                .copied()
                .ok_or_else(|| {
                    invalid(format!(
                        "pattern immediate ({}, {}) does not exist",
                        instruction, immediate
                    ))
                })
        };
        for (left, right) in &rule.equalities {
            immediate_kind(left.0, left.1)?;
            immediate_kind(right.0, right.1)?;
        }

        let mut replacement = vec![];
        let mut carried_target = None;
        for (position, (name, sources)) in rule.replacement.iter().enumerate() {
            let id = lookup(name)?;
            let expected = &info(id).immediates;
            if expected.len() != sources.len() {
                return Err(invalid(format!(
                    "{} takes {} immediate(s) but {} were given",
                    name,
                    expected.len(),
                    sources.len()
                )));
            }
            for (kind, source) in expected.iter().zip(sources) {
                let source_kind = match source {
                    ImmediateSource::Pattern {
                        instruction,
                        immediate,
                    } => Some(immediate_kind(*instruction, *immediate)?),
                    ImmediateSource::Value(_) => None,
                };
                let carries_target = source_kind == Some(ImmediateKind::BranchTarget);
                if carries_target != (*kind == ImmediateKind::BranchTarget) {
                    return Err(invalid(format!(
                        "branch targets can only be copied into branch targets ({})",
                        name
                    )));
                }
                if carries_target {
                    if carried_target.is_some() {
                        return Err(invalid(String::from("branch target carried more than once")));
                    }
                    carried_target = Some(position);
                }
            }
            replacement.push((id, sources.clone()));
        }

        if info(pattern[last]).branch_target_index().is_some()
            && carried_target != Some(replacement.len().wrapping_sub(1))
        {
            return Err(invalid(String::from(
                "branch target must be carried by the last replacement instruction",
            )));
        }

        let fixed_effect = |ids: &mut dyn Iterator<Item = InstructionId>| {
            ids.map(|id| match info(id).stack_effect {
                StackEffect::Fixed(effect) => Some(effect),
                StackEffect::Collect => None,
            })
            .sum::<Option<i32>>()
        };
        let before = fixed_effect(&mut pattern.iter().copied());
        let after = fixed_effect(&mut replacement.iter().map(|(id, _)| *id));
        if let (Some(before), Some(after)) = (before, after) {
            if before != after {
                return Err(invalid(format!(
                    "stack effect changes from {} to {}",
                    before, after
                )));
            }
        }

        Ok(ResolvedRule {
            name: rule.name.clone(),
            pattern,
            equalities: rule.equalities.clone(),
            replacement,
        })
    }
}

/// Automaton over emitted opcodes, flattened into a dense `state x opcode` table
///
/// The automaton is the Aho-Corasick machine of all rule patterns: a state is accepting when a
/// pattern is a suffix of the opcodes seen so far. Every pattern that is a suffix is a candidate,
/// longest first, so a shorter rule still applies when a longer one's constraints fail.
#[derive(Clone, Debug)]
pub(crate) struct RewriteDfa {
    opcode_count: usize,
    transitions: Vec<u32>,
    accepting: Vec<Vec<usize>>,
}

impl RewriteDfa {
    pub const START: u32 = 0;

    pub fn build(rules: &[ResolvedRule], opcode_count: usize) -> Result<RewriteDfa, Error> {
        let mut children: Vec<HashMap<u16, u32>> = vec![HashMap::new()];
        let mut output: Vec<Option<usize>> = vec![None];

        for (rule_index, rule) in rules.iter().enumerate() {
            let mut state = 0;
            for opcode in &rule.pattern {
                let next = children.len() as u32;
                state = *children[state].entry(opcode.0).or_insert(next) as usize;
                if state == children.len() {
                    children.push(HashMap::new());
                    output.push(None);
                }
            }
            if let Some(other) = output[state] {
                return Err(Error::InvalidModel(format!(
                    "rules {} and {} have the same pattern",
                    rules[other].name, rule.name
                )));
            }
            output[state] = Some(rule_index);
        }

        let state_count = children.len();
        let mut transitions = vec![0u32; state_count * opcode_count];
        let mut fail = vec![0u32; state_count];
        let mut queue = VecDeque::new();

        for opcode in 0..opcode_count {
            if let Some(child) = children[0].get(&(opcode as u16)) {
                transitions[opcode] = *child;
                queue.push_back(*child);
            }
        }

        // Breadth first, so the fallback of a state is always finished before the state
        let mut accepting: Vec<Vec<usize>> = output
            .iter()
            .map(|rule| rule.iter().copied().collect())
            .collect();
        while let Some(state) = queue.pop_front() {
            let state = state as usize;
            let fallback = fail[state] as usize;
            let inherited = accepting[fallback].clone();
            accepting[state].extend(inherited);
            for opcode in 0..opcode_count {
                let through_fallback = transitions[fallback * opcode_count + opcode];
                match children[state].get(&(opcode as u16)) {
                    Some(child) => {
                        fail[*child as usize] = through_fallback;
                        transitions[state * opcode_count + opcode] = *child;
                        queue.push_back(*child);
                    }
                    None => transitions[state * opcode_count + opcode] = through_fallback,
                }
            }
        }

        Ok(RewriteDfa {
            opcode_count,
            transitions,
            accepting,
        })
    }

    pub fn next(&self, state: u32, opcode: InstructionId) -> u32 {
        self.transitions[state as usize * self.opcode_count + opcode.0 as usize]
    }

    /// Rules matched when the automaton is in this state, longest pattern first
    pub fn accepting(&self, state: u32) -> &[usize] {
        &self.accepting[state as usize]
    }

    pub fn state_count(&self) -> usize {
        self.accepting.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rule(name: &str, pattern: &[u16]) -> ResolvedRule {
        ResolvedRule {
            name: name.to_owned(),
            pattern: pattern.iter().map(|id| InstructionId(*id)).collect(),
            equalities: vec![],
            replacement: vec![],
        }
    }

    /// Longest match after each opcode
    fn run(dfa: &RewriteDfa, opcodes: &[u16]) -> Vec<Option<usize>> {
        let mut state = RewriteDfa::START;
        opcodes
            .iter()
            .map(|opcode| {
                state = dfa.next(state, InstructionId(*opcode));
                dfa.accepting(state).first().copied()
            })
            .collect()
    }

    #[test]
    fn matches_patterns_as_suffixes() {
        let dfa = RewriteDfa::build(&[rule("ab", &[0, 1]), rule("bc", &[1, 2])], 4).unwrap();
        assert_eq!(
            run(&dfa, &[3, 0, 1, 2, 0, 0, 1]),
            vec![None, None, Some(0), Some(1), None, None, Some(0)]
        );
    }

    #[test]
    fn falls_back_to_shorter_patterns() {
        let dfa =
            RewriteDfa::build(&[rule("abcd", &[0, 1, 2, 3]), rule("cd", &[2, 3])], 5).unwrap();
        assert_eq!(
            run(&dfa, &[0, 1, 2, 4, 2, 3]),
            vec![None, None, None, None, None, Some(1)]
        );
        assert_eq!(run(&dfa, &[0, 1, 2, 3]), vec![None, None, None, Some(0)]);
    }

    #[test]
    fn suffix_rule_is_reported_inside_longer_path() {
        let dfa = RewriteDfa::build(&[rule("abc", &[0, 1, 2]), rule("b", &[1])], 3).unwrap();
        assert_eq!(run(&dfa, &[0, 1, 2]), vec![None, Some(1), Some(0)]);
    }

    #[test]
    fn shorter_suffix_rules_stay_candidates() {
        let dfa = RewriteDfa::build(
            &[rule("abc", &[0, 1, 2]), rule("c", &[2]), rule("bc", &[1, 2])],
            3,
        )
        .unwrap();
        let mut state = RewriteDfa::START;
        for opcode in [0, 1, 2] {
            state = dfa.next(state, InstructionId(opcode));
        }
        assert_eq!(dfa.accepting(state), &[0, 2, 1]);
        assert!(dfa.accepting(RewriteDfa::START).is_empty());
    }

    #[test]
    fn duplicate_patterns_are_rejected() {
        let result = RewriteDfa::build(&[rule("x", &[0, 1]), rule("y", &[0, 1])], 2);
        assert!(matches!(result, Err(Error::InvalidModel(_))));
    }
}
