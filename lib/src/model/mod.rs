//! Interpreter models
//!
//! A [`Model`] is the static description of a bytecode interpreter: which operations the parser
//! may call, which instructions they lower to (with which immediates), which tags exist, and
//! which peephole rewrites apply. The builder, serializer, and disassembler are all
//! parameterized over a model.

mod instructions;
mod operations;
mod rewrite;

pub use instructions::*;
pub use operations::*;
pub use rewrite::{from_pattern, ImmediateSource, RewriteRule};

pub(crate) use rewrite::{ResolvedRule, RewriteDfa};

use crate::Error;
use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    /// Optional builder features
    pub struct Features: u32 {
        /// Locals are scoped to the block declaring them and reuse frame slots
        const BLOCK_SCOPING = 0b00001;

        /// `Tag` operations emit instrumentation hooks
        const TAGS = 0b00010;

        /// Custom yield operations are allowed
        const YIELD = 0b00100;

        /// Rewrite rules are applied while emitting
        const REWRITING = 0b01000;

        /// Source sections are recorded in a source info table
        const SOURCE_INFO = 0b10000;
    }
}

/// Set of tags, as a bitmask over the tags of a model (in declaration order)
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TagMask(pub u32);

impl TagMask {
    pub const NONE: TagMask = TagMask(0);
    pub const ALL: TagMask = TagMask(u32::MAX);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: TagMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: TagMask) -> TagMask {
        TagMask(self.0 | other.0)
    }
}

/// Maximum number of tags in a model
pub const MAX_TAGS: usize = 32;

/// Validated interpreter description
#[derive(Clone, Debug)]
pub struct Model {
    name: String,
    features: Features,
    tags: Vec<String>,
    operations: Vec<OperationInfo>,
    instructions: Vec<InstructionInfo>,
    customs: Vec<CustomOperationInfo>,
    short_circuits: Vec<ShortCircuitInfo>,
    rules: Vec<ResolvedRule>,
    dfa: Option<RewriteDfa>,
    operation_names: HashMap<String, OperationId>,
    instruction_names: HashMap<String, InstructionId>,
}

impl Model {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Mask of the named tags
    pub fn tag_mask(&self, names: &[&str]) -> Result<TagMask, Error> {
        let mut mask = TagMask::NONE;
        for name in names {
            let index = self
                .tags
                .iter()
                .position(|tag| tag == name)
                .ok_or_else(|| Error::IllegalArgument(format!("unknown tag {}", name)))?;
            mask = mask.union(TagMask(1 << index));
        }
        Ok(mask)
    }

    /// Mask of every tag declared in the model
    pub fn all_tags(&self) -> TagMask {
        match self.tags.len() {
            MAX_TAGS => TagMask::ALL,
            count => TagMask((1u32 << count) - 1),
        }
    }

    pub fn operations(&self) -> &[OperationInfo] {
        &self.operations
    }

    pub fn operation(&self, id: OperationId) -> Option<&OperationInfo> {
        self.operations.get(id.0 as usize)
    }

    pub fn operation_id(&self, name: &str) -> Option<OperationId> {
        self.operation_names.get(name).copied()
    }

    pub fn instructions(&self) -> &[InstructionInfo] {
        &self.instructions
    }

    pub fn instruction(&self, id: InstructionId) -> Option<&InstructionInfo> {
        self.instructions.get(id.0 as usize)
    }

    pub fn instruction_id(&self, name: &str) -> Option<InstructionId> {
        self.instruction_names.get(name).copied()
    }

    /// Description of an instruction the model itself handed out
    pub(crate) fn info(&self, id: InstructionId) -> &InstructionInfo {
        &self.instructions[id.0 as usize]
    }

    pub(crate) fn custom(&self, index: usize) -> &CustomOperationInfo {
        &self.customs[index]
    }

    pub(crate) fn short_circuit(&self, index: usize) -> &ShortCircuitInfo {
        &self.short_circuits[index]
    }

    pub(crate) fn rules(&self) -> &[ResolvedRule] {
        &self.rules
    }

    /// Automaton driving the rewriter (only when rewriting is enabled and there are rules)
    pub(crate) fn rewrite_dfa(&self) -> Option<&RewriteDfa> {
        self.dfa.as_ref()
    }

    /// Number of instrumentation operations (bits of `BuilderConfig::instrumentations`)
    pub fn instrumentation_count(&self) -> u32 {
        self.customs
            .iter()
            .filter(|custom| custom.instrumentation_index.is_some())
            .count() as u32
    }
}

/// Collects the pieces of a [`Model`] and validates them together
pub struct ModelBuilder {
    name: String,
    features: Features,
    tags: Vec<String>,
    customs: Vec<CustomOperation>,
    short_circuits: Vec<ShortCircuitOperation>,
    instructions: Vec<(String, Vec<ImmediateKind>, i32)>,
    rules: Vec<RewriteRule>,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> ModelBuilder {
        ModelBuilder {
            name: name.into(),
            features: Features::empty(),
            tags: vec![],
            customs: vec![],
            short_circuits: vec![],
            instructions: vec![],
            rules: vec![],
        }
    }

    pub fn features(mut self, features: Features) -> ModelBuilder {
        self.features = features;
        self
    }

    pub fn tag(mut self, name: impl Into<String>) -> ModelBuilder {
        self.tags.push(name.into());
        self
    }

    pub fn custom(mut self, operation: CustomOperation) -> ModelBuilder {
        self.customs.push(operation);
        self
    }

    pub fn short_circuit(mut self, operation: ShortCircuitOperation) -> ModelBuilder {
        self.short_circuits.push(operation);
        self
    }

    /// Declare an extra instruction, usually the target of a rewrite rule
    pub fn instruction(
        mut self,
        name: impl Into<String>,
        immediates: &[ImmediateKind],
        stack_effect: i32,
    ) -> ModelBuilder {
        self.instructions
            .push((name.into(), immediates.to_vec(), stack_effect));
        self
    }

    pub fn rewrite(mut self, rule: RewriteRule) -> ModelBuilder {
        self.rules.push(rule);
        self
    }

    pub fn build(self) -> Result<Model, Error> {
        let features = self.features;

        if self.tags.len() > MAX_TAGS {
            return Err(Error::InvalidModel(format!(
                "{} tags declared, at most {} are supported",
                self.tags.len(),
                MAX_TAGS
            )));
        }
        if !self.tags.is_empty() && !features.contains(Features::TAGS) {
            return Err(Error::InvalidModel(String::from(
                "tags declared but the model does not enable tags",
            )));
        }
        for (index, tag) in self.tags.iter().enumerate() {
            if self.tags[..index].contains(tag) {
                return Err(Error::InvalidModel(format!("duplicate tag {}", tag)));
            }
        }
        if !self.rules.is_empty() && !features.contains(Features::REWRITING) {
            return Err(Error::InvalidModel(String::from(
                "rewrite rules declared but the model does not enable rewriting",
            )));
        }

        let mut operations: Vec<OperationInfo> = OperationKind::BUILTINS
            .iter()
            .enumerate()
            .map(|(index, kind)| OperationInfo::builtin(*kind, OperationId(index as u16)))
            .collect();
        let mut instructions = instructions::builtin_instructions();

        // Custom operations
        let mut customs = vec![];
        let mut instrumentation_count = 0;
        for declaration in self.customs {
            validate_custom(&declaration, features)?;

            let mut immediates = vec![];
            for constant in declaration
                .begin_constants
                .iter()
                .chain(&declaration.end_constants)
            {
                if let Some(kinds) = constant.immediates() {
                    immediates.extend_from_slice(kinds);
                }
            }
            immediates.push(ImmediateKind::Node);
            if declaration.kind == CustomKind::Yield {
                immediates.push(ImmediateKind::Continuation);
            }
            let stack_effect =
                declaration.returns_value as i32 - declaration.operands.len() as i32;
            let instruction = InstructionId(instructions.len() as u16);
            instructions.push(InstructionInfo::new(
                instruction,
                format!("c.{}", declaration.name),
                immediates,
                StackEffect::Fixed(stack_effect),
            ));

            let instrumentation_index = if declaration.kind == CustomKind::Instrumentation {
                instrumentation_count += 1;
                Some(instrumentation_count - 1)
            } else {
                None
            };
            let op_kind = match declaration.kind {
                CustomKind::Regular => OperationKind::Custom,
                CustomKind::Yield => OperationKind::CustomYield,
                CustomKind::Instrumentation => OperationKind::CustomInstrumentation,
            };
            operations.push(OperationInfo {
                id: OperationId(operations.len() as u16),
                name: declaration.name.clone(),
                kind: op_kind,
                begin_arguments: declaration.begin_constants.clone(),
                end_arguments: declaration.end_constants.clone(),
                is_leaf: declaration.is_leaf(),
                custom_index: Some(customs.len()),
            });
            customs.push(CustomOperationInfo {
                declaration,
                instruction,
                instrumentation_index,
            });
        }
        if instrumentation_count > 32 {
            return Err(Error::InvalidModel(String::from(
                "at most 32 instrumentation operations are supported",
            )));
        }

        // Short circuit operations
        let mut short_circuits = vec![];
        for declaration in self.short_circuits {
            let converter = match &declaration.converter {
                None => None,
                Some(name) => {
                    let custom = customs
                        .iter()
                        .find(|custom| &custom.declaration.name == name)
                        .ok_or_else(|| {
                            Error::InvalidModel(format!(
                                "converter {} of {} is not a custom operation",
                                name, declaration.name
                            ))
                        })?;
                    let converter = &custom.declaration;
                    if converter.kind != CustomKind::Regular
                        || converter.operands.len() != 1
                        || converter.variadic
                        || !converter.returns_value
                        || !converter.begin_constants.is_empty()
                        || !converter.end_constants.is_empty()
                    {
                        return Err(Error::InvalidModel(format!(
                            "converter {} must take exactly one operand and produce a value",
                            name
                        )));
                    }
                    Some(custom.instruction)
                }
            };
            let stack_effect = if converter.is_some() && !declaration.returns_converted {
                -2
            } else {
                -1
            };
            let instruction = InstructionId(instructions.len() as u16);
            instructions.push(InstructionInfo::new(
                instruction,
                format!("sc.{}", declaration.name),
                vec![ImmediateKind::BranchTarget, ImmediateKind::BranchProfile],
                StackEffect::Fixed(stack_effect),
            ));
            operations.push(OperationInfo {
                id: OperationId(operations.len() as u16),
                name: declaration.name.clone(),
                kind: OperationKind::CustomShortCircuit,
                begin_arguments: vec![],
                end_arguments: vec![],
                is_leaf: false,
                custom_index: Some(short_circuits.len()),
            });
            short_circuits.push(ShortCircuitInfo {
                declaration,
                instruction,
                converter,
            });
        }

        // Superinstructions
        for (name, immediates, stack_effect) in self.instructions {
            let id = InstructionId(instructions.len() as u16);
            instructions.push(InstructionInfo::new(
                id,
                name,
                immediates,
                StackEffect::Fixed(stack_effect),
            ));
        }

        if operations.len() > (i16::MAX as usize >> 1) {
            return Err(Error::InvalidModel(format!(
                "{} operations do not fit the serialized encoding",
                operations.len()
            )));
        }
        if instructions.len() > u16::MAX as usize {
            return Err(Error::InvalidModel(format!(
                "{} instructions do not fit in an opcode",
                instructions.len()
            )));
        }

        let mut operation_names = HashMap::new();
        for operation in &operations {
            if operation_names
                .insert(operation.name.clone(), operation.id)
                .is_some()
            {
                return Err(Error::InvalidModel(format!(
                    "duplicate operation {}",
                    operation.name
                )));
            }
        }
        let mut instruction_names = HashMap::new();
        for instruction in &instructions {
            if instruction_names
                .insert(instruction.name.clone(), instruction.id)
                .is_some()
            {
                return Err(Error::InvalidModel(format!(
                    "duplicate instruction {}",
                    instruction.name
                )));
            }
        }

        let rules = self
            .rules
            .iter()
            .map(|rule| ResolvedRule::resolve(rule, &instructions, &instruction_names))
            .collect::<Result<Vec<_>, _>>()?;
        let dfa = if rules.is_empty() {
            None
        } else {
            let dfa = RewriteDfa::build(&rules, instructions.len())?;
            log::debug!(
                "Rewrite automaton for {} has {} states over {} rules",
                self.name,
                dfa.state_count(),
                rules.len()
            );
            Some(dfa)
        };

        Ok(Model {
            name: self.name,
            features,
            tags: self.tags,
            operations,
            instructions,
            customs,
            short_circuits,
            rules,
            dfa,
            operation_names,
            instruction_names,
        })
    }
}

fn validate_custom(declaration: &CustomOperation, features: Features) -> Result<(), Error> {
    let invalid = |message: &str| {
        Err(Error::InvalidModel(format!(
            "custom operation {}: {}",
            declaration.name, message
        )))
    };

    if declaration.variadic && declaration.operands.is_empty() {
        return invalid("a variadic operation needs at least one operand");
    }
    for constant in declaration
        .begin_constants
        .iter()
        .chain(&declaration.end_constants)
    {
        if constant.immediates().is_none() {
            return invalid("labels, tags, and finally generators cannot be constant operands");
        }
    }
    match declaration.kind {
        CustomKind::Regular => Ok(()),
        CustomKind::Yield if !features.contains(Features::YIELD) => {
            invalid("yields require the model to enable yield")
        }
        CustomKind::Yield if !declaration.returns_value => {
            invalid("yields must produce the resumed value")
        }
        CustomKind::Yield => Ok(()),
        CustomKind::Instrumentation => {
            let transparent = match declaration.operands.as_slice() {
                [] => !declaration.returns_value,
                [OperandKind::Value] => declaration.returns_value && !declaration.variadic,
                _ => false,
            };
            if transparent {
                Ok(())
            } else {
                invalid("instrumentations take no operand and produce nothing, or pass one value through")
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn custom_operations_get_instructions() {
        let model = ModelBuilder::new("Test")
            .features(Features::YIELD)
            .custom(
                CustomOperation::new("Add")
                    .operands(2)
                    .returns_value()
                    .begin_constants(&[ArgumentKind::Constant]),
            )
            .custom(
                CustomOperation::new("Suspend")
                    .kind(CustomKind::Yield)
                    .operands(1)
                    .returns_value(),
            )
            .build()
            .unwrap();

        let add = model.operation_id("Add").unwrap();
        assert_eq!(add, OperationId(OperationKind::BUILTINS.len() as u16));
        let add_instruction = model.instruction(model.instruction_id("c.Add").unwrap()).unwrap();
        assert_eq!(
            add_instruction.immediates,
            vec![ImmediateKind::Constant, ImmediateKind::Node]
        );
        assert_eq!(add_instruction.stack_effect, StackEffect::Fixed(-1));

        let suspend = model.instruction(model.instruction_id("c.Suspend").unwrap()).unwrap();
        assert_eq!(
            suspend.immediates,
            vec![ImmediateKind::Node, ImmediateKind::Continuation]
        );
    }

    #[test]
    fn yield_requires_feature() {
        let result = ModelBuilder::new("Test")
            .custom(
                CustomOperation::new("Suspend")
                    .kind(CustomKind::Yield)
                    .operands(1)
                    .returns_value(),
            )
            .build();
        assert!(matches!(result, Err(Error::InvalidModel(_))));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = ModelBuilder::new("Test")
            .custom(CustomOperation::new("Block"))
            .build();
        assert!(matches!(result, Err(Error::InvalidModel(_))));
    }

    #[test]
    fn tag_masks() {
        let model = ModelBuilder::new("Test")
            .features(Features::TAGS)
            .tag("Statement")
            .tag("Expression")
            .build()
            .unwrap();
        assert_eq!(model.tag_mask(&["Expression"]).unwrap(), TagMask(0b10));
        assert_eq!(model.all_tags(), TagMask(0b11));
        assert!(matches!(
            model.tag_mask(&["Call"]),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn rules_carrying_branch_targets_are_validated() {
        let base = || {
            ModelBuilder::new("Test")
                .features(Features::REWRITING)
                .custom(CustomOperation::new("Less").operands(2).returns_value())
                .instruction(
                    "c.Less$BranchFalse",
                    &[
                        ImmediateKind::Node,
                        ImmediateKind::BranchTarget,
                        ImmediateKind::BranchProfile,
                    ],
                    -2,
                )
        };

        let good = base()
            .rewrite(
                RewriteRule::new("fuse")
                    .pattern(&["c.Less", "branch.false"])
                    .replace(
                        "c.Less$BranchFalse",
                        vec![from_pattern(0, 0), from_pattern(1, 0), from_pattern(1, 1)],
                    ),
            )
            .build();
        assert!(good.is_ok());

        let dropped_target = base()
            .rewrite(
                RewriteRule::new("fuse")
                    .pattern(&["c.Less", "branch.false"])
                    .replace(
                        "c.Less$BranchFalse",
                        vec![
                            from_pattern(0, 0),
                            ImmediateSource::Value(0),
                            from_pattern(1, 1),
                        ],
                    ),
            )
            .build();
        assert!(matches!(dropped_target, Err(Error::InvalidModel(_))));

        let target_not_last = base()
            .rewrite(
                RewriteRule::new("bad")
                    .pattern(&["branch.false", "pop"])
                    .replace("pop", vec![]),
            )
            .build();
        assert!(matches!(target_not_last, Err(Error::InvalidModel(_))));
    }
}
