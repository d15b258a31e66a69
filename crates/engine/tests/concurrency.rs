//! Concurrent access to one engine: parallel writers on a shared session,
//! writers across sessions, and readers racing writers.

use gibram_engine::engine::{Engine, EngineConfig};
use gibram_engine::ops::LoggedOp;
use gibram_engine::query::{QuerySpec, SearchKind};
use gibram_index::IndexKind;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn engine() -> Arc<Engine> {
    Arc::new(Engine::new(EngineConfig {
        dimension: 4,
        index_kind: IndexKind::Hnsw,
        sweep_interval: Duration::from_secs(3600),
    }))
}

#[test]
fn parallel_writers_one_session() {
    let engine = engine();
    let threads: Vec<_> = (0..8)
        .map(|t| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                let mut ids = Vec::new();
                for i in 0..50 {
                    let id = engine
                        .execute(LoggedOp::AddEntity {
                            session: "shared".into(),
                            external_id: String::new(),
                            title: format!("entity-{t}-{i}"),
                            entity_type: "t".into(),
                            description: String::new(),
                            embedding: Some(vec![t as f32, i as f32, 1.0, 0.0]),
                        })
                        .unwrap()
                        .id();
                    ids.push(id);
                }
                ids
            })
        })
        .collect();

    let mut all_ids = Vec::new();
    for thread in threads {
        all_ids.extend(thread.join().unwrap());
    }

    // Every allocation unique, every record present and indexed.
    let unique: HashSet<u64> = all_ids.iter().copied().collect();
    assert_eq!(unique.len(), 400);
    assert_eq!(*all_ids.iter().max().unwrap(), 400);

    let counts = engine.session("shared").unwrap().counts();
    assert_eq!(counts.entities, 400);
    assert_eq!(counts.indexed_vectors, 400);
}

#[test]
fn parallel_writers_separate_sessions() {
    let engine = engine();
    let threads: Vec<_> = (0..4)
        .map(|t| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for i in 0..30 {
                    engine
                        .execute(LoggedOp::AddEntity {
                            session: format!("session-{t}"),
                            external_id: String::new(),
                            title: format!("entity-{i}"),
                            entity_type: "t".into(),
                            description: String::new(),
                            embedding: None,
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let info = engine.info();
    assert_eq!(info.sessions, 4);
    assert_eq!(info.counts.entities, 120);
    // Sessions allocate independently: each starts at 1.
    for t in 0..4 {
        let session = engine.session(&format!("session-{t}")).unwrap();
        assert!(session.get_entity(1).is_some());
        assert!(session.get_entity(30).is_some());
    }
}

#[test]
fn readers_race_writers() {
    let engine = engine();
    engine
        .execute(LoggedOp::AddEntity {
            session: "s".into(),
            external_id: String::new(),
            title: "seed".into(),
            entity_type: "t".into(),
            description: String::new(),
            embedding: Some(vec![1.0, 0.0, 0.0, 0.0]),
        })
        .unwrap();

    let writer = {
        let engine = engine.clone();
        std::thread::spawn(move || {
            for i in 0..100 {
                engine
                    .execute(LoggedOp::AddEntity {
                        session: "s".into(),
                        external_id: String::new(),
                        title: format!("entity-{i}"),
                        entity_type: "t".into(),
                        description: String::new(),
                        embedding: Some(vec![1.0, i as f32 / 100.0, 0.0, 0.0]),
                    })
                    .unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let result = engine
                        .query(
                            "s",
                            QuerySpec {
                                vector: vec![1.0, 0.0, 0.0, 0.0],
                                search_types: vec![SearchKind::Entity],
                                top_k: 5,
                                k_hops: 1,
                                ..Default::default()
                            },
                        )
                        .unwrap();
                    // The seed entity is always present and always findable.
                    assert!(!result.entities.is_empty());
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(engine.session("s").unwrap().counts().entities, 101);
}

#[test]
fn sweeper_does_not_drop_live_sessions() {
    let engine = engine();
    engine
        .execute(LoggedOp::AddEntity {
            session: "live".into(),
            external_id: String::new(),
            title: "a".into(),
            entity_type: "t".into(),
            description: String::new(),
            embedding: None,
        })
        .unwrap();
    engine
        .execute(LoggedOp::SetSessionTtl {
            session: "live".into(),
            ttl_secs: 0,
            idle_ttl_secs: 60,
        })
        .unwrap();

    assert_eq!(engine.sweep_expired(), 0);
    assert!(engine.session("live").is_ok());
}
