//! Property tests: cache/log equivalence and commit graph acyclicity

use entvc_core::{
    CacheReadPolicy, ChangeSets, Clock, CommitGraph, Engine, EngineConfig, EngineError, EntityKey,
    EntitySchema, NewChange, ResolvedEntity, SqliteBackend, StateMaterializer, schema,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Upsert { version: usize, entity: usize, value: u8 },
    Delete { version: usize, entity: usize },
    Commit { version: usize },
    Fork { version: usize },
    Merge { source: usize, target: usize },
    Inherit { version: usize, parent: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..4usize, 0..5usize, 0..3u8)
            .prop_map(|(version, entity, value)| Op::Upsert { version, entity, value }),
        1 => (0..4usize, 0..5usize).prop_map(|(version, entity)| Op::Delete { version, entity }),
        3 => (0..4usize).prop_map(|version| Op::Commit { version }),
        1 => (0..4usize).prop_map(|version| Op::Fork { version }),
        1 => (0..4usize, 0..4usize).prop_map(|(source, target)| Op::Merge { source, target }),
        1 => (0..4usize, 0..4usize).prop_map(|(version, parent)| Op::Inherit { version, parent }),
    ]
}

fn key(entity: usize) -> EntityKey {
    EntityKey::new(format!("e{entity}"), "f", "doc")
}

/// Apply operations, skipping the ones that are invalid in the current state
fn play(engine: &mut Engine, ops: &[Op]) -> Vec<String> {
    let mut versions = vec![engine.active_version_id().to_string()];
    let pick = |versions: &[String], i: usize| versions[i % versions.len()].clone();

    for op in ops {
        match op {
            Op::Upsert { version, entity, value } => {
                let v = pick(&versions, *version);
                let content = format!("{{\"value\":{value}}}");
                engine
                    .append(&v, &NewChange::upsert(key(*entity), "1", "p", content))
                    .unwrap();
            }
            Op::Delete { version, entity } => {
                let v = pick(&versions, *version);
                engine
                    .append(&v, &NewChange::tombstone(key(*entity), "1", "p"))
                    .unwrap();
            }
            Op::Commit { version } => {
                engine.commit(&pick(&versions, *version)).unwrap();
            }
            Op::Fork { version } => {
                let name = format!("v{}", versions.len());
                let forked = engine.fork(&pick(&versions, *version), &name).unwrap();
                versions.push(forked.id);
            }
            Op::Merge { source, target } => {
                let (s, t) = (pick(&versions, *source), pick(&versions, *target));
                if s == t {
                    continue;
                }
                let merge = engine.merge(&s, &t).unwrap();
                if merge.is_clean() {
                    engine.commit_merge(&merge, &[]).unwrap();
                }
            }
            Op::Inherit { version, parent } => {
                let (v, p) = (pick(&versions, *version), pick(&versions, *parent));
                match engine.set_inheritance(&v, Some(&p)) {
                    Ok(()) | Err(EngineError::CyclicGraph { .. }) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        }
    }
    versions
}

fn config(policy: CacheReadPolicy) -> EngineConfig {
    EngineConfig {
        cache_read_policy: policy,
        ..EngineConfig::deterministic(17)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_rebuilt_cache_matches_log(ops in prop::collection::vec(op(), 1..40)) {
        let mut engine = Engine::open_in_memory(config(CacheReadPolicy::RebuildBeforeRead)).unwrap();
        engine.register_schema(&EntitySchema::new("doc", "1")).unwrap();
        let versions = play(&mut engine, &ops);

        for version in &versions {
            engine.rebuild(version).unwrap();
            for entity in 0..5 {
                let cached = engine.resolve(version, &key(entity)).unwrap();
                let direct = StateMaterializer::new(engine.backend())
                    .resolve_direct(version, &key(entity))
                    .unwrap();
                prop_assert_eq!(cached, direct);
            }
            engine.verify_cache(version).unwrap();
        }
    }

    #[test]
    fn prop_read_policies_agree(ops in prop::collection::vec(op(), 1..40)) {
        let mut eager = Engine::open_in_memory(config(CacheReadPolicy::RebuildBeforeRead)).unwrap();
        let mut lazy = Engine::open_in_memory(config(CacheReadPolicy::DirectLogFallback)).unwrap();
        for engine in [&mut eager, &mut lazy] {
            engine.register_schema(&EntitySchema::new("doc", "1")).unwrap();
        }
        let versions = play(&mut eager, &ops);
        play(&mut lazy, &ops);

        for version in &versions {
            let a: Vec<ResolvedEntity> = (0..5).map(|e| eager.resolve(version, &key(e)).unwrap()).collect();
            let b: Vec<ResolvedEntity> = (0..5).map(|e| lazy.resolve(version, &key(e)).unwrap()).collect();
            prop_assert_eq!(a, b);
            prop_assert_eq!(eager.state(version).unwrap(), lazy.state(version).unwrap());
        }
    }

    #[test]
    fn prop_commit_graph_stays_acyclic(
        parent_picks in prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..3), 1..24)
    ) {
        let backend = SqliteBackend::open_in_memory().unwrap();
        schema::install(&backend).unwrap();
        let mut clock = Clock::deterministic(99);
        let graph = CommitGraph::new(&backend);
        let mut commits: Vec<String> = Vec::new();

        for picks in &parent_picks {
            let parents: Vec<String> = if commits.is_empty() {
                Vec::new()
            } else {
                picks.iter().map(|i| i.get(&commits).clone()).collect()
            };
            let cs = ChangeSets::new(&backend).create(&mut clock).unwrap();
            commits.push(graph.create_commit(&mut clock, &cs, &parents).unwrap().id);
        }

        for commit in &commits {
            let ancestors: Vec<String> = graph.ancestors(commit).collect::<Result<_, _>>().unwrap();
            prop_assert!(!ancestors.contains(commit));
            for ancestor in &ancestors {
                let closes_cycle = graph.link(commit, ancestor);
                let is_cycle_error = matches!(closes_cycle, Err(EngineError::CyclicGraph { .. }));
                prop_assert!(is_cycle_error);
            }
        }
    }
}
