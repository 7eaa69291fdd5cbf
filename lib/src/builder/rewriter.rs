use super::operation_stack::OperationData;
use super::state::{BuilderState, Emitted};
use crate::model::{ImmediateSource, InstructionId, Model, RewriteDfa};
use crate::Error;

/// Rewrites triggered while emitting a replacement may themselves trigger rewrites, up to this
/// nesting depth
const MAX_REWRITE_DEPTH: u32 = 8;

impl BuilderState {
    /// Advance the rewrite automaton over a freshly emitted instruction, applying the first
    /// matched rule whose constraints hold
    pub(super) fn step_rewriter(
        &mut self,
        model: &Model,
        opcode: InstructionId,
    ) -> Result<Option<Emitted>, Error> {
        let dfa = match model.rewrite_dfa() {
            Some(dfa) => dfa,
            None => return Ok(None),
        };
        let cursor = match self.rewrite.as_mut() {
            Some(cursor) => cursor,
            None => return Ok(None),
        };

        cursor.state = dfa.next(cursor.state, opcode);
        if cursor.depth >= MAX_REWRITE_DEPTH {
            return Ok(None);
        }
        let state = cursor.state;
        for rule in dfa.accepting(state) {
            if let Some(rewritten) = self.apply_rewrite(model, dfa, *rule)? {
                return Ok(Some(rewritten));
            }
        }
        Ok(None)
    }

    /// Replace the instructions matched by a rule with its replacement
    ///
    /// The matched instructions are the suffix of what was emitted since the leader bci. If any of
    /// the rule's constraints fail, nothing changes. Otherwise the bytecode is truncated to the
    /// start of the match, the automaton is replayed over the untouched instructions since the
    /// leader, and the replacement is emitted (possibly triggering further rewrites).
    fn apply_rewrite(
        &mut self,
        model: &Model,
        dfa: &RewriteDfa,
        rule_index: usize,
    ) -> Result<Option<Emitted>, Error> {
        let rule = &model.rules()[rule_index];
        let leader = match &self.rewrite {
            Some(cursor) => cursor.leader_bci,
            None => return Ok(None),
        };
        let end = self.bytecode.bci();
        let window = self
            .bytecode
            .scan(leader, end, |id| model.info(id).length());

        if window.len() < rule.pattern.len() {
            debug_assert!(false, "rewrite matched across the leader bci");
            return Ok(None);
        }
        let untouched = window.len() - rule.pattern.len();
        let matched = &window[untouched..];
        if !matched
            .iter()
            .map(|(_, id)| *id)
            .eq(rule.pattern.iter().copied())
        {
            debug_assert!(false, "rewrite pattern does not match the emitted instructions");
            return Ok(None);
        }

        let immediates: Vec<Vec<i32>> = matched
            .iter()
            .map(|(bci, id)| self.bytecode.read_immediates(*bci, model.info(*id)))
            .collect();
        for (left, right) in &rule.equalities {
            if immediates[left.0][left.1] != immediates[right.0][right.1] {
                return Ok(None);
            }
        }

        let start = matched[0].0;
        log::debug!(
            "Applying rewrite {} to bytecode [{}, {})",
            rule.name,
            start,
            end
        );

        // Ranges starting inside the replaced instructions now start at the replacement
        self.locals.clamp_starts(start, end);
        self.source_info.clamp_starts(start, end);
        for sp in 0..self.operations.len() {
            if let Some(entry) = self.operations.get_mut(sp) {
                if let OperationData::SourceSection(section) = &mut entry.data {
                    if section.start_bci > start && section.start_bci <= end {
                        section.start_bci = start;
                    }
                }
            }
        }

        let removed: i32 = matched
            .iter()
            .zip(&immediates)
            .map(|((_, id), values)| model.info(*id).stack_effect_of(values))
            .sum();
        self.current_stack_height -= removed;
        self.bytecode.set_bci(start);

        let mut state = RewriteDfa::START;
        for (_, id) in &window[..untouched] {
            state = dfa.next(state, *id);
        }
        if let Some(cursor) = self.rewrite.as_mut() {
            cursor.state = state;
            cursor.depth += 1;
        }

        let mut result = Emitted {
            bci: start,
            branch_site: None,
        };
        for (id, sources) in &rule.replacement {
            let values: Vec<i32> = sources
                .iter()
                .map(|source| match source {
                    ImmediateSource::Pattern {
                        instruction,
                        immediate,
                    } => immediates[*instruction][*immediate],
                    ImmediateSource::Value(value) => *value,
                })
                .collect();
            if let Some(emitted) = self.emit_instruction(model, *id, &values)? {
                if emitted.branch_site.is_some() {
                    result.branch_site = emitted.branch_site;
                }
            }
        }

        if let Some(cursor) = self.rewrite.as_mut() {
            cursor.depth -= 1;
        }
        Ok(Some(result))
    }
}
