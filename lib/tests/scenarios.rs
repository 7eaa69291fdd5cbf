mod harness;

use bcasm::builder::HandlerKind;
use bcasm::model::{
    from_pattern, CustomKind, CustomOperation, ImmediateKind, OperandKind, RewriteRule,
};
use bcasm::program::{HandlerInfo, LocalInfo};
use bcasm::*;
use harness::{bcis_of, build, listing, op};

fn model(features: Features) -> Model {
    ModelBuilder::new("Test")
        .features(features)
        .custom(CustomOperation::new("Print").operands(1))
        .custom(CustomOperation::new("LessThan").operands(2).returns_value())
        .custom(
            CustomOperation::new("Invoke")
                .operand(OperandKind::Value)
                .operand(OperandKind::Value)
                .variadic()
                .returns_value(),
        )
        .custom(
            CustomOperation::new("Trace")
                .kind(CustomKind::Instrumentation)
                .operands(1)
                .returns_value(),
        )
        .build()
        .unwrap()
}

fn print_constant(builder: &mut dyn OperationBuilder, value: &str) -> Result<(), Error> {
    builder.begin_custom("Print", vec![])?;
    builder.emit_load_constant(Constant::string(value))?;
    builder.end_custom("Print", vec![])
}

fn is_illegal_state(result: Result<(), Error>) -> bool {
    matches!(result, Err(Error::IllegalState { .. }))
}

#[test]
fn store_then_return_local() {
    let model = model(Features::BLOCK_SCOPING);
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        b.begin_block()?;
        let local = b.create_local(None, None)?;
        b.begin_store_local(local)?;
        b.emit_load_constant(Constant::Integer(42))?;
        b.end_store_local()?;
        b.begin_return()?;
        b.emit_load_local(local)?;
        b.end_return()?;
        b.end_block()?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();

    let root = &nodes.roots[0];
    assert_eq!(
        listing(&model, root),
        vec![
            op("load.constant", &[0]),
            op("store.local", &[0, 0]),
            op("load.local", &[0, 0]),
            op("return", &[]),
        ]
    );
    // The implicit return of the root is dead after the explicit one
    assert_eq!(root.bytecode.len(), 20);
    assert_eq!(root.max_stack_height, 1);
    assert_eq!(
        root.local_entries(),
        vec![LocalInfo {
            start_bci: 0,
            end_bci: 20,
            local_index: 0,
            frame_index: 0,
            name: -1,
            info: -1,
        }]
    );
}

#[test]
fn dead_code_after_branch_is_dropped() {
    let model = model(Features::empty());
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        let label = b.create_label()?;
        b.emit_branch(label)?;
        b.emit_load_constant(Constant::string("dead"))?;
        b.emit_label(label)?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();

    let root = &nodes.roots[0];
    assert_eq!(
        listing(&model, root),
        vec![op("branch", &[6]), op("load.null", &[]), op("return", &[])]
    );
    // Dead constants still take their pool slot
    assert_eq!(root.constants, vec![Constant::string("dead")]);
}

#[test]
fn try_finally_copies_handler() {
    let model = model(Features::empty());
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        b.begin_try_finally(finally_generator(|b| print_constant(b, "finally")))?;
        b.begin_custom("Print", vec![])?;
        b.emit_load_argument(0)?;
        b.end_custom("Print", vec![])?;
        b.end_try_finally()?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();

    let root = &nodes.roots[0];
    assert_eq!(
        listing(&model, root),
        vec![
            op("load.argument", &[0]),
            op("c.Print", &[0]),
            op("load.constant", &[0]),
            op("c.Print", &[1]),
            op("branch", &[42]),
            op("load.constant", &[0]),
            op("c.Print", &[2]),
            op("throw", &[]),
            op("load.null", &[]),
            op("return", &[]),
        ]
    );
    assert_eq!(
        root.handler_entries(),
        vec![HandlerInfo {
            start_bci: 0,
            end_bci: 10,
            kind: HandlerKind::Custom,
            handler: 28,
            stack_height: 0,
        }]
    );
    assert_eq!(root.constants, vec![Constant::string("finally")]);
    assert_eq!(root.num_nodes, 3);
}

#[test]
fn nested_block_locals_get_later_slots() {
    let model = model(Features::BLOCK_SCOPING);
    let mut slots = None;
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        b.begin_block()?;
        let outer = b.create_local(None, None)?;
        b.begin_store_local(outer)?;
        b.emit_load_argument(0)?;
        b.end_store_local()?;

        b.begin_block()?;
        let inner = b.create_local(None, None)?;
        b.begin_store_local(inner)?;
        b.emit_load_local(outer)?;
        b.end_store_local()?;
        b.end_block()?;

        b.emit_load_local(outer)?;
        b.end_block()?;
        b.end_root()?;
        slots = Some((outer.frame_index(), inner.frame_index()));
        Ok(())
    })
    .unwrap();

    let (outer, inner) = slots.unwrap();
    assert!(inner > outer);
    let root = &nodes.roots[0];
    assert_eq!(root.max_locals, 2);
    assert_eq!(root.num_locals, 2);
    let ranges: Vec<(i32, i32)> = root
        .local_entries()
        .iter()
        .map(|entry| (entry.start_bci, entry.end_bci))
        .collect();
    assert_eq!(ranges, vec![(0, 28), (10, 22)]);
}

#[test]
fn forward_branches_to_one_label() {
    let model = model(Features::empty());
    for count in [0, 1, 2, 5] {
        let nodes = build(&model, BuilderConfig::minimal(), |b| {
            b.begin_root()?;
            let label = b.create_label()?;
            for _ in 0..count {
                b.begin_if_then()?;
                b.emit_load_argument(0)?;
                b.emit_branch(label)?;
                b.end_if_then()?;
            }
            b.emit_label(label)?;
            b.end_root()?;
            Ok(())
        })
        .unwrap();

        let label_bci = 20 * count;
        let mut expected = vec![];
        for index in 0..count {
            expected.push(op("load.argument", &[0]));
            expected.push(op("branch.false", &[20 * index + 20, index]));
            expected.push(op("branch", &[label_bci]));
        }
        expected.push(op("load.null", &[]));
        expected.push(op("return", &[]));

        let root = &nodes.roots[0];
        assert_eq!(listing(&model, root), expected, "{} branches", count);
        assert_eq!(root.num_branch_profiles, count as u32);
    }
}

#[test]
fn arms_that_both_return_end_reachability() {
    let model = model(Features::empty());
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        b.begin_if_then_else()?;
        b.emit_load_argument(0)?;
        b.begin_return()?;
        b.emit_load_constant(Constant::Integer(1))?;
        b.end_return()?;
        b.begin_return()?;
        b.emit_load_constant(Constant::Integer(2))?;
        b.end_return()?;
        b.end_if_then_else()?;
        b.emit_load_constant(Constant::Integer(3))?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();

    let root = &nodes.roots[0];
    assert_eq!(
        listing(&model, root),
        vec![
            op("load.argument", &[0]),
            op("branch.false", &[22, 0]),
            op("load.constant", &[0]),
            op("return", &[]),
            op("load.constant", &[1]),
            op("return", &[]),
        ]
    );
    assert_eq!(
        root.constants,
        vec![Constant::Integer(1), Constant::Integer(2), Constant::Integer(3)]
    );
}

#[test]
fn early_exits_split_protected_ranges() {
    let model = model(Features::empty());
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        b.begin_block()?;
        let done = b.create_label()?;
        b.begin_try_catch()?;
        b.begin_block()?;
        b.begin_if_then()?;
        b.emit_load_argument(0)?;
        b.emit_branch(done)?;
        b.end_if_then()?;
        b.begin_custom("Print", vec![])?;
        b.emit_load_argument(1)?;
        b.end_custom("Print", vec![])?;
        b.end_block()?;
        b.begin_custom("Print", vec![])?;
        b.emit_load_exception()?;
        b.end_custom("Print", vec![])?;
        b.end_try_catch()?;
        b.emit_label(done)?;
        b.end_block()?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();

    let root = &nodes.roots[0];
    assert_eq!(
        listing(&model, root),
        vec![
            op("load.argument", &[0]),
            op("branch.false", &[20, 0]),
            op("branch", &[48]),
            op("load.argument", &[1]),
            op("c.Print", &[0]),
            op("branch", &[48]),
            op("load.exception", &[0]),
            op("c.Print", &[1]),
            op("pop", &[]),
            op("load.null", &[]),
            op("return", &[]),
        ]
    );
    let handler = |start_bci, end_bci| HandlerInfo {
        start_bci,
        end_bci,
        kind: HandlerKind::Custom,
        handler: 36,
        stack_height: 0,
    };
    // The branch out of the try body is not protected
    assert_eq!(root.handler_entries(), vec![handler(0, 14), handler(20, 30)]);
}

#[test]
fn return_runs_finally_handler_inline() {
    let model = model(Features::empty());
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        b.begin_try_finally(finally_generator(|b| print_constant(b, "f")))?;
        b.begin_return()?;
        b.emit_load_argument(0)?;
        b.end_return()?;
        b.end_try_finally()?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();

    let root = &nodes.roots[0];
    assert_eq!(
        listing(&model, root),
        vec![
            op("load.argument", &[0]),
            op("load.constant", &[0]),
            op("c.Print", &[0]),
            op("return", &[]),
            op("load.constant", &[0]),
            op("c.Print", &[1]),
            op("throw", &[]),
        ]
    );
    assert_eq!(
        root.handler_entries(),
        vec![HandlerInfo {
            start_bci: 0,
            end_bci: 4,
            kind: HandlerKind::Custom,
            handler: 18,
            stack_height: 0,
        }]
    );
}

#[test]
fn branch_out_of_scope_clears_locals() {
    let model = model(Features::BLOCK_SCOPING);
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        b.begin_block()?;
        let done = b.create_label()?;
        b.begin_block()?;
        let local = b.create_local(Some(Constant::string("x")), None)?;
        b.begin_store_local(local)?;
        b.emit_load_argument(0)?;
        b.end_store_local()?;
        b.emit_branch(done)?;
        b.end_block()?;
        b.emit_label(done)?;
        b.end_block()?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();

    let root = &nodes.roots[0];
    assert_eq!(
        listing(&model, root),
        vec![
            op("load.argument", &[0]),
            op("store.local", &[0, 0]),
            op("clear.local", &[0]),
            op("branch", &[20]),
            op("load.null", &[]),
            op("return", &[]),
        ]
    );
    let first = root.local_entries()[0];
    assert_eq!((first.start_bci, first.end_bci, first.name), (0, 10, 0));
}

#[test]
fn branch_out_of_an_operand_keeps_outer_operands() {
    let model = model(Features::empty());
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        let done = b.create_label()?;
        b.begin_custom("LessThan", vec![])?;
        b.emit_load_constant(Constant::Integer(1))?;
        b.begin_block()?;
        b.emit_branch(done)?;
        b.emit_load_constant(Constant::Integer(2))?;
        b.end_block()?;
        b.end_custom("LessThan", vec![])?;
        b.emit_label(done)?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();

    let root = &nodes.roots[0];
    assert_eq!(
        listing(&model, root),
        vec![
            op("load.constant", &[0]),
            op("pop", &[]),
            op("branch", &[14]),
            op("load.null", &[]),
            op("return", &[]),
        ]
    );
    // The dead operand still counts towards the height
    assert_eq!(root.max_stack_height, 2);
    assert_eq!(root.constants, vec![Constant::Integer(1), Constant::Integer(2)]);
}

#[test]
fn branch_out_of_a_catch_clause() {
    let model = model(Features::empty());
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        let done = b.create_label()?;
        b.begin_try_catch()?;
        b.emit_load_null()?;
        b.begin_block()?;
        b.emit_branch(done)?;
        b.end_block()?;
        b.end_try_catch()?;
        b.emit_label(done)?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();

    let root = &nodes.roots[0];
    assert_eq!(
        listing(&model, root),
        vec![
            op("load.null", &[]),
            op("pop", &[]),
            op("branch", &[18]),
            op("pop", &[]),
            op("branch", &[18]),
            op("load.null", &[]),
            op("return", &[]),
        ]
    );
    assert_eq!(root.max_stack_height, 1);
    assert_eq!(
        root.handler_entries(),
        vec![HandlerInfo {
            start_bci: 0,
            end_bci: 4,
            kind: HandlerKind::Custom,
            handler: 10,
            stack_height: 0,
        }]
    );
}

#[test]
fn locals_are_unusable_outside_their_block() {
    let model = model(Features::BLOCK_SCOPING);
    let result = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        b.begin_block()?;
        let local = b.create_local(None, None)?;
        b.end_block()?;
        b.emit_load_local(local)?;
        b.end_root()?;
        Ok(())
    });
    assert!(result.is_err());
}

#[test]
fn variadic_operands_are_grouped() {
    let model = model(Features::empty());
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        b.begin_return()?;
        b.begin_custom("Invoke", vec![])?;
        b.emit_load_argument(0)?;
        for value in 0..9 {
            b.emit_load_constant(Constant::Integer(value))?;
        }
        b.end_custom("Invoke", vec![])?;
        b.end_return()?;

        b.begin_custom("Print", vec![])?;
        b.begin_custom("Invoke", vec![])?;
        b.emit_load_argument(0)?;
        b.end_custom("Invoke", vec![])?;
        b.end_custom("Print", vec![])?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();

    let root = &nodes.roots[0];
    let mut expected = vec![op("load.argument", &[0])];
    for index in 0..8 {
        expected.push(op("load.constant", &[index]));
    }
    expected.extend(vec![
        op("load.variadic", &[8]),
        op("load.constant", &[8]),
        op("load.variadic", &[1]),
        op("merge.variadic", &[2]),
        op("c.Invoke", &[0]),
        op("return", &[]),
    ]);
    assert_eq!(listing(&model, root), expected);
    assert_eq!(root.max_stack_height, 9);

    // Operations after the return are dead, but the nodes of dead code are not allocated either
    assert_eq!(root.num_nodes, 1);
}

#[test]
fn zero_variadic_operands_still_collect() {
    let model = model(Features::empty());
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        b.begin_custom("Invoke", vec![])?;
        b.emit_load_argument(0)?;
        b.end_custom("Invoke", vec![])?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();

    assert_eq!(
        listing(&model, &nodes.roots[0]),
        vec![
            op("load.argument", &[0]),
            op("load.variadic", &[0]),
            op("c.Invoke", &[0]),
            op("return", &[]),
        ]
    );
}

#[test]
fn disabled_instrumentation_is_transparent() {
    let model = model(Features::empty());
    let parse = |b: &mut dyn OperationBuilder| -> Result<(), Error> {
        b.begin_root()?;
        b.begin_custom("Trace", vec![])?;
        b.emit_load_argument(0)?;
        b.end_custom("Trace", vec![])?;
        b.end_root()?;
        Ok(())
    };

    let plain = build(&model, BuilderConfig::minimal(), parse).unwrap();
    assert_eq!(
        listing(&model, &plain.roots[0]),
        vec![op("load.argument", &[0]), op("return", &[])]
    );

    let traced = build(&model, BuilderConfig::default(), parse).unwrap();
    assert_eq!(
        listing(&model, &traced.roots[0]),
        vec![op("load.argument", &[0]), op("c.Trace", &[0]), op("return", &[])]
    );
}

#[test]
fn instrumented_tags_get_exceptional_handlers() {
    let model = ModelBuilder::new("Tagged")
        .features(Features::TAGS)
        .tag("Expression")
        .build()
        .unwrap();
    let tags = model.tag_mask(&["Expression"]).unwrap();
    let parse = |b: &mut dyn OperationBuilder| -> Result<(), Error> {
        b.begin_root()?;
        b.begin_tag(tags)?;
        b.emit_load_argument(0)?;
        b.end_tag(tags)?;
        b.end_root()?;
        Ok(())
    };

    let nodes = build(&model, BuilderConfig::default(), parse).unwrap();
    let root = &nodes.roots[0];
    assert_eq!(
        listing(&model, root),
        vec![
            op("tag.enter", &[0]),
            op("load.argument", &[0]),
            op("tag.leave", &[0]),
            op("return", &[]),
        ]
    );
    assert_eq!(
        root.handler_entries(),
        vec![HandlerInfo {
            start_bci: 6,
            end_bci: 10,
            kind: HandlerKind::TagExceptional,
            handler: 0,
            stack_height: 0,
        }]
    );

    let nodes = build(&model, BuilderConfig::minimal(), parse).unwrap();
    assert_eq!(
        listing(&model, &nodes.roots[0]),
        vec![op("load.argument", &[0]), op("return", &[])]
    );
}

#[test]
fn store_then_load_is_rewritten() {
    let model = ModelBuilder::new("Rewriting")
        .features(Features::REWRITING)
        .rewrite(
            RewriteRule::new("store-then-load")
                .pattern(&["store.local", "load.local"])
                .equal((0, 0), (1, 0))
                .equal((0, 1), (1, 1))
                .replace("dup", vec![])
                .replace("store.local", vec![from_pattern(0, 0), from_pattern(0, 1)]),
        )
        .build()
        .unwrap();

    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        let local = b.create_local(None, None)?;
        b.begin_store_local(local)?;
        b.emit_load_argument(0)?;
        b.end_store_local()?;
        b.begin_return()?;
        b.emit_load_local(local)?;
        b.end_return()?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();
    assert_eq!(
        listing(&model, &nodes.roots[0]),
        vec![
            op("load.argument", &[0]),
            op("dup", &[]),
            op("store.local", &[0, 0]),
            op("return", &[]),
        ]
    );

    // A label between the two instructions is a leader, so nothing gets rewritten
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        b.begin_block()?;
        let local = b.create_local(None, None)?;
        let label = b.create_label()?;
        b.begin_store_local(local)?;
        b.emit_load_argument(0)?;
        b.end_store_local()?;
        b.emit_label(label)?;
        b.begin_return()?;
        b.emit_load_local(local)?;
        b.end_return()?;
        b.end_block()?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();
    assert_eq!(
        listing(&model, &nodes.roots[0]),
        vec![
            op("load.argument", &[0]),
            op("store.local", &[0, 0]),
            op("load.local", &[0, 0]),
            op("return", &[]),
        ]
    );
}

#[test]
fn shorter_rule_applies_when_longer_constraints_fail() {
    let model = ModelBuilder::new("Rewriting")
        .features(Features::REWRITING)
        .instruction("load.local.fast", &[ImmediateKind::FrameIndex], 1)
        .rewrite(
            RewriteRule::new("store-then-load")
                .pattern(&["store.local", "load.local"])
                .equal((0, 0), (1, 0))
                .equal((0, 1), (1, 1))
                .replace("dup", vec![])
                .replace("store.local", vec![from_pattern(0, 0), from_pattern(0, 1)]),
        )
        .rewrite(
            RewriteRule::new("fast-load")
                .pattern(&["load.local"])
                .replace("load.local.fast", vec![from_pattern(0, 0)]),
        )
        .build()
        .unwrap();

    let store_then_load = |same: bool| {
        build(&model, BuilderConfig::minimal(), move |b| {
            b.begin_root()?;
            let stored = b.create_local(None, None)?;
            let other = b.create_local(None, None)?;
            b.begin_store_local(stored)?;
            b.emit_load_argument(0)?;
            b.end_store_local()?;
            b.begin_return()?;
            b.emit_load_local(if same { stored } else { other })?;
            b.end_return()?;
            b.end_root()?;
            Ok(())
        })
        .unwrap()
    };

    assert_eq!(
        listing(&model, &store_then_load(false).roots[0]),
        vec![
            op("load.argument", &[0]),
            op("store.local", &[0, 0]),
            op("load.local.fast", &[1]),
            op("return", &[]),
        ]
    );
    assert_eq!(
        listing(&model, &store_then_load(true).roots[0]),
        vec![
            op("load.argument", &[0]),
            op("dup", &[]),
            op("store.local", &[0, 0]),
            op("return", &[]),
        ]
    );
}

#[test]
fn fused_compare_and_branch_keeps_its_target() {
    let model = sample::model().unwrap();
    let nodes = build(&model, BuilderConfig::minimal(), |b| {
        b.begin_root()?;
        b.begin_if_then()?;
        b.begin_custom("LessThan", vec![])?;
        b.emit_load_argument(0)?;
        b.emit_load_argument(1)?;
        b.end_custom("LessThan", vec![])?;
        b.begin_custom("Print", vec![])?;
        b.emit_load_argument(0)?;
        b.end_custom("Print", vec![])?;
        b.end_if_then()?;
        b.end_root()?;
        Ok(())
    })
    .unwrap();

    let root = &nodes.roots[0];
    assert_eq!(
        listing(&model, root),
        vec![
            op("load.argument", &[0]),
            op("load.argument", &[1]),
            op(sample::LESS_THAN_BRANCH, &[0, 32, 0]),
            op("load.argument", &[0]),
            op("c.Print", &[1]),
            op("load.null", &[]),
            op("return", &[]),
        ]
    );
    assert!(bcis_of(&model, root, "branch.false").is_empty());
}

#[test]
fn misuse_is_reported_with_the_operation_stack() {
    let model = model(Features::empty());
    let mut pool = StatePool::default();

    let mut builder = Builder::new(&model, BuilderConfig::minimal(), &mut pool);
    builder.begin_root().unwrap();
    builder.begin_block().unwrap();
    match builder.end_while() {
        Err(Error::IllegalState {
            operation_stack, ..
        }) => assert_eq!(operation_stack, "Root[0] > Block[0]"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(builder.finish(), Err(Error::IllegalState { .. })));

    let mut builder = Builder::new(&model, BuilderConfig::minimal(), &mut pool);
    builder.begin_root().unwrap();
    assert!(is_illegal_state(builder.emit_load_exception()));

    let mut builder = Builder::new(&model, BuilderConfig::minimal(), &mut pool);
    builder.begin_root().unwrap();
    let label = builder.create_label().unwrap();
    builder.emit_label(label).unwrap();
    assert!(is_illegal_state(builder.emit_label(label)));
    assert!(is_illegal_state(builder.emit_branch(label)));

    let mut builder = Builder::new(&model, BuilderConfig::minimal(), &mut pool);
    builder.begin_root().unwrap();
    let label = builder.create_label().unwrap();
    builder.emit_branch(label).unwrap();
    assert!(matches!(builder.end_root(), Err(Error::IllegalState { .. })));

    let mut builder = Builder::new(&model, BuilderConfig::minimal(), &mut pool);
    assert!(is_illegal_state(builder.emit_load_null()));
}
