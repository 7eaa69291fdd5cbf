//! A small sample language
//!
//! The model has arithmetic and comparison operations, a variadic call, two short circuits, a
//! yield, a tracing instrumentation, statement and expression tags, and a few peephole rules.
//! [`program`] drives a builder through every kind of operation the model supports; the command
//! line tool and the tests use it as a realistic parse.

use crate::builder::{finally_generator, Argument, OperationBuilder};
use crate::model::{
    from_pattern, ArgumentKind, CustomKind, CustomOperation, Features, ImmediateKind, Model,
    ModelBuilder, OperandKind, RewriteRule, ShortCircuitOperation,
};
use crate::{Constant, Error};

pub const STATEMENT_TAG: &str = "StatementTag";
pub const EXPRESSION_TAG: &str = "ExpressionTag";

/// Name of the fused compare-and-branch instruction
pub const LESS_THAN_BRANCH: &str = "c.LessThan$BranchFalse";

pub fn model() -> Result<Model, Error> {
    ModelBuilder::new("Sample")
        .features(Features::all())
        .tag(STATEMENT_TAG)
        .tag(EXPRESSION_TAG)
        .custom(CustomOperation::new("Add").operands(2).returns_value())
        .custom(CustomOperation::new("LessThan").operands(2).returns_value())
        .custom(CustomOperation::new("ToBoolean").operands(1).returns_value())
        .custom(
            CustomOperation::new("Invoke")
                .operand(OperandKind::Value)
                .operand(OperandKind::Value)
                .variadic()
                .returns_value(),
        )
        .custom(CustomOperation::new("Print").operand(OperandKind::VoidAllowed))
        .custom(
            CustomOperation::new("AddConstant")
                .operands(1)
                .returns_value()
                .begin_constants(&[ArgumentKind::Constant]),
        )
        .custom(CustomOperation::new("MaterializeFrame").returns_value())
        .custom(CustomOperation::new("Reset").begin_constants(&[ArgumentKind::LocalArray]))
        .custom(
            CustomOperation::new("Suspend")
                .kind(CustomKind::Yield)
                .operands(1)
                .returns_value(),
        )
        .custom(
            CustomOperation::new("Trace")
                .kind(CustomKind::Instrumentation)
                .operands(1)
                .returns_value(),
        )
        .short_circuit(ShortCircuitOperation::and("ScAnd").converter("ToBoolean"))
        .short_circuit(
            ShortCircuitOperation::or("ScOr")
                .converter("ToBoolean")
                .returns_converted(),
        )
        .instruction(
            LESS_THAN_BRANCH,
            &[
                ImmediateKind::Node,
                ImmediateKind::BranchTarget,
                ImmediateKind::BranchProfile,
            ],
            -2,
        )
        .rewrite(
            RewriteRule::new("fuse-compare-branch")
                .pattern(&["c.LessThan", "branch.false"])
                .replace(
                    LESS_THAN_BRANCH,
                    vec![from_pattern(0, 0), from_pattern(1, 0), from_pattern(1, 1)],
                ),
        )
        .rewrite(
            RewriteRule::new("drop-unused-constant")
                .pattern(&["load.constant", "pop"]),
        )
        .rewrite(
            RewriteRule::new("store-then-load")
                .pattern(&["store.local", "load.local"])
                .equal((0, 0), (1, 0))
                .equal((0, 1), (1, 1))
                .replace("dup", vec![])
                .replace("store.local", vec![from_pattern(0, 0), from_pattern(0, 1)]),
        )
        .build()
}

fn print_constant(builder: &mut dyn OperationBuilder, value: Constant) -> Result<(), Error> {
    builder.begin_custom("Print", vec![])?;
    builder.emit_load_constant(value)?;
    builder.end_custom("Print", vec![])
}

/// Parse of the sample program
///
/// ```text
/// source "sample.sl" {
///   def main(n, flag) {
///     var total = 0; var i = 0;
///     while (i < n) { #statement total = total + i; i = i + 1; }
///     if (n && flag) print(total) else print(trace(null));
///     if (n || flag) { goto done; }
///     print(n ? 1 : 2);
///   done:
///     try { print("try") } catch (e) { print(e) }
///     try { if (flag) return total; print("body") } finally { print("finally") }
///     try { print(1) } catch (e) { print(e) } otherwise { print("otherwise") }
///     print(yield total);
///     reset(total, i);
///     print(invoke(def (frame) { frame.total = 5; frame.total }, n, n, n, n, n, n, n, n, n));
///     clear i;
///     return total;
///   }
/// }
/// ```
pub fn program(builder: &mut dyn OperationBuilder) -> Result<(), Error> {
    let statement = builder.model().tag_mask(&[STATEMENT_TAG])?;
    let expression = builder.model().tag_mask(&[EXPRESSION_TAG])?;

    builder.begin_root()?;
    builder.begin_source(Constant::string("sample.sl"))?;
    builder.begin_source_section(0, 420)?;
    builder.begin_block()?;

    let total = builder.create_local(Some(Constant::string("total")), None)?;
    let i = builder.create_local(Some(Constant::string("i")), Some(Constant::Integer(1)))?;
    let done = builder.create_label()?;

    for local in [total, i] {
        builder.begin_store_local(local)?;
        builder.emit_load_constant(Constant::Integer(0))?;
        builder.end_store_local()?;
    }

    // while (i < n) { total = total + i; i = i + 1; }
    builder.begin_while()?;
    builder.begin_custom("LessThan", vec![])?;
    builder.emit_load_local(i)?;
    builder.emit_load_argument(0)?;
    builder.end_custom("LessThan", vec![])?;
    builder.begin_block()?;
    builder.begin_tag(statement)?;
    builder.begin_store_local(total)?;
    builder.begin_custom("Add", vec![])?;
    builder.emit_load_local(total)?;
    builder.emit_load_local(i)?;
    builder.end_custom("Add", vec![])?;
    builder.end_store_local()?;
    builder.end_tag(statement)?;
    builder.begin_store_local(i)?;
    builder.begin_custom("AddConstant", vec![Argument::Constant(Constant::Integer(1))])?;
    builder.emit_load_local(i)?;
    builder.end_custom("AddConstant", vec![])?;
    builder.end_store_local()?;
    builder.end_block()?;
    builder.end_while()?;

    // if (n && flag) print(total) else print(trace(null))
    builder.begin_if_then_else()?;
    builder.begin_custom("ScAnd", vec![])?;
    builder.emit_load_argument(0)?;
    builder.emit_load_argument(1)?;
    builder.end_custom("ScAnd", vec![])?;
    builder.begin_custom("Print", vec![])?;
    builder.emit_load_local(total)?;
    builder.end_custom("Print", vec![])?;
    builder.begin_custom("Print", vec![])?;
    builder.begin_custom("Trace", vec![])?;
    builder.emit_load_null()?;
    builder.end_custom("Trace", vec![])?;
    builder.end_custom("Print", vec![])?;
    builder.end_if_then_else()?;

    // if (n || flag) { goto done; }
    builder.begin_if_then()?;
    builder.begin_custom("ScOr", vec![])?;
    builder.emit_load_argument(0)?;
    builder.emit_load_argument(1)?;
    builder.end_custom("ScOr", vec![])?;
    builder.begin_block()?;
    builder.emit_branch(done)?;
    builder.end_block()?;
    builder.end_if_then()?;

    // print(n ? 1 : 2)
    builder.begin_source_section_prefix(200)?;
    builder.begin_custom("Print", vec![])?;
    builder.begin_tag(expression)?;
    builder.begin_conditional()?;
    builder.emit_load_argument(0)?;
    builder.emit_load_constant(Constant::Integer(1))?;
    builder.emit_load_constant(Constant::Integer(2))?;
    builder.end_conditional()?;
    builder.end_tag(expression)?;
    builder.end_custom("Print", vec![])?;
    builder.end_source_section_prefix(16)?;

    builder.emit_label(done)?;
    try_operations(builder, total)?;

    // print(yield total)
    builder.begin_custom("Print", vec![])?;
    builder.begin_custom("Suspend", vec![])?;
    builder.emit_load_local(total)?;
    builder.end_custom("Suspend", vec![])?;
    builder.end_custom("Print", vec![])?;

    builder.emit_custom("Reset", vec![Argument::LocalArray(vec![total, i])])?;

    // print(invoke(<nested root>, n x 9))
    builder.begin_custom("Print", vec![])?;
    builder.begin_custom("Invoke", vec![])?;
    let callee = nested_root(builder, total)?;
    builder.emit_load_constant(Constant::Root(callee))?;
    for _ in 0..9 {
        builder.emit_load_argument(0)?;
    }
    builder.end_custom("Invoke", vec![])?;
    builder.end_custom("Print", vec![])?;

    builder.emit_clear_local(i)?;
    builder.begin_return()?;
    builder.emit_load_local(total)?;
    builder.end_return()?;

    builder.end_block()?;
    builder.end_source_section()?;
    builder.end_source()?;
    builder.end_root()?;
    Ok(())
}

fn try_operations(
    builder: &mut dyn OperationBuilder,
    total: crate::builder::BytecodeLocal,
) -> Result<(), Error> {
    // try { print("try") } catch (e) { print(e) }
    builder.begin_try_catch()?;
    print_constant(builder, Constant::string("try"))?;
    builder.begin_custom("Print", vec![])?;
    builder.emit_load_exception()?;
    builder.end_custom("Print", vec![])?;
    builder.end_try_catch()?;

    // try { if (flag) return total; print("body") } finally { print("finally") }
    builder.begin_try_finally(finally_generator(|builder| {
        print_constant(builder, Constant::string("finally"))
    }))?;
    builder.begin_block()?;
    builder.begin_if_then()?;
    builder.emit_load_argument(1)?;
    builder.begin_return()?;
    builder.emit_load_local(total)?;
    builder.end_return()?;
    builder.end_if_then()?;
    print_constant(builder, Constant::string("body"))?;
    builder.end_block()?;
    builder.end_try_finally()?;

    // try { print(1) } catch (e) { print(e) } otherwise { print("otherwise") }
    builder.begin_try_catch_otherwise(finally_generator(|builder| {
        print_constant(builder, Constant::string("otherwise"))
    }))?;
    print_constant(builder, Constant::Integer(1))?;
    builder.begin_custom("Print", vec![])?;
    builder.emit_load_exception()?;
    builder.end_custom("Print", vec![])?;
    builder.end_try_catch_otherwise()
}

/// `def (frame) { frame.total = 5; frame.total }`, reaching into the enclosing root's frame
fn nested_root(
    builder: &mut dyn OperationBuilder,
    total: crate::builder::BytecodeLocal,
) -> Result<crate::RootId, Error> {
    builder.begin_root()?;
    builder.begin_store_local_materialized(total)?;
    builder.emit_custom("MaterializeFrame", vec![])?;
    builder.emit_load_constant(Constant::Integer(5))?;
    builder.end_store_local_materialized()?;
    builder.begin_load_local_materialized(total)?;
    builder.emit_custom("MaterializeFrame", vec![])?;
    builder.end_load_local_materialized()?;
    builder.end_root()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builder::{Builder, StatePool};
    use crate::BuilderConfig;

    #[test]
    fn sample_model_is_valid() {
        let model = model().unwrap();
        assert_eq!(model.instrumentation_count(), 1);
        assert!(model.instruction_id(LESS_THAN_BRANCH).is_some());
        assert!(model.operation_id("ScOr").is_some());
    }

    #[test]
    fn sample_program_builds() {
        let model = model().unwrap();
        let mut pool = StatePool::default();
        let mut builder = Builder::new(&model, BuilderConfig::default(), &mut pool);
        program(&mut builder).unwrap();
        assert_eq!(builder.root_count(), 2);
        let nodes = builder.finish().unwrap();

        assert_eq!(nodes.roots.len(), 2);
        assert_eq!(nodes.sources, vec![Constant::string("sample.sl")]);
        let main = &nodes.roots[0];
        assert_eq!(main.continuation_entries().len(), 1);
        assert!(!main.handler_entries().is_empty());

        let fused = model.instruction_id(LESS_THAN_BRANCH).unwrap();
        let instructions = main.instructions(&model).unwrap();
        assert!(instructions.iter().any(|instruction| instruction.id == fused));
        assert!(main.disassemble(&model).unwrap().contains(LESS_THAN_BRANCH));
    }
}
