mod harness;

use bcasm::serialize::{deserialize, serialize};
use bcasm::*;
use harness::Recorder;

fn direct(model: &Model, config: &BuilderConfig) -> (BytecodeNodes, Vec<String>) {
    let mut pool = config.pool();
    let mut recorder = Recorder::new(Builder::new(model, config.clone(), &mut pool));
    sample::program(&mut recorder).unwrap();
    let calls = recorder.calls;
    (recorder.inner.finish().unwrap(), calls)
}

fn replayed(model: &Model, config: &BuilderConfig, stream: &[u8]) -> (BytecodeNodes, Vec<String>) {
    let mut pool = config.pool();
    let mut recorder = Recorder::new(Builder::new(model, config.clone(), &mut pool));
    deserialize(stream, &mut recorder).unwrap();
    let calls = recorder.calls;
    (recorder.inner.finish().unwrap(), calls)
}

#[test]
fn replaying_the_sample_matches_building_it() {
    let model = sample::model().unwrap();
    let stream = serialize(&model, vec![], sample::program).unwrap();

    for config in [BuilderConfig::default(), BuilderConfig::minimal()] {
        let (expected_nodes, expected_calls) = direct(&model, &config);
        let (nodes, calls) = replayed(&model, &config, &stream);
        assert_eq!(calls, expected_calls);
        assert_eq!(nodes, expected_nodes);
    }
}

#[test]
fn nested_root_constants_are_remapped() {
    let model = sample::model().unwrap();
    let stream = serialize(&model, vec![], sample::program).unwrap();
    let (nodes, _) = replayed(&model, &BuilderConfig::default(), &stream);

    // The nested root ends first, but it was begun second
    let nested = RootId {
        context: 0,
        index: 1,
    };
    assert!(nodes.root(nested).is_some());
    assert!(nodes.roots[0].constants.contains(&Constant::Root(nested)));
}

#[test]
fn serialized_streams_are_deterministic() {
    let model = sample::model().unwrap();
    let first = serialize(&model, vec![], sample::program).unwrap();
    let second = serialize(&model, vec![], sample::program).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        &first[first.len() - 2..],
        &bcasm::serialize::CODE_END.to_be_bytes()[..]
    );
}

#[test]
fn truncated_streams_are_rejected() {
    let model = sample::model().unwrap();
    let stream = serialize(&model, vec![], sample::program).unwrap();

    let mut pool = StatePool::default();
    let mut builder = Builder::new(&model, BuilderConfig::default(), &mut pool);
    assert!(deserialize(&stream[..stream.len() / 2], &mut builder).is_err());
}
