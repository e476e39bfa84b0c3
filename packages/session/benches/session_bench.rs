use arbor_session::{Credentials, Session, SessionConfig};
use arbor_spi::{ItemId, MemoryStore, PropertyType, StaticRegistry, Value};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn open(store: &MemoryStore) -> Session {
    Session::open(
        store.clone(),
        Arc::new(StaticRegistry::with_defaults()),
        Credentials::new("bench"),
        SessionConfig::default(),
    )
    .unwrap()
}

fn build_subtree(session: &mut Session, parent: &ItemId, width: usize) {
    for i in 0..width {
        let child = session
            .create_node(parent, format!("n{}", i), None)
            .unwrap()
            .id()
            .clone();
        session
            .create_property(&child, "title", Value::from(format!("title {}", i)))
            .unwrap();
    }
}

fn submit_many_nodes(c: &mut Criterion) {
    let store = MemoryStore::new("nt:unstructured");

    c.bench_function("submit_100_nodes", |b| {
        b.iter(|| {
            let mut session = open(&store);
            let root = session.root().clone();
            build_subtree(&mut session, black_box(&root), 100);
            session.change_log().len()
        })
    });
}

fn discard_many_nodes(c: &mut Criterion) {
    let store = MemoryStore::new("nt:unstructured");

    c.bench_function("discard_100_nodes", |b| {
        b.iter(|| {
            let mut session = open(&store);
            let root = session.root().clone();
            build_subtree(&mut session, &root, 100);
            session.discard().unwrap();
        })
    });
}

fn save_many_nodes(c: &mut Criterion) {
    c.bench_function("save_100_nodes", |b| {
        b.iter(|| {
            let store = MemoryStore::new("nt:unstructured");
            let mut session = open(&store);
            let root = session.root().clone();
            build_subtree(&mut session, &root, 100);
            black_box(session.save().unwrap())
        })
    });
}

fn add_then_remove_collapses(c: &mut Criterion) {
    let store = MemoryStore::new("nt:unstructured");

    c.bench_function("add_then_remove_collapses", |b| {
        b.iter(|| {
            let mut session = open(&store);
            let root = session.root().clone();
            let scratch = session.create_node(&root, "scratch", None).unwrap().id().clone();
            build_subtree(&mut session, &scratch, 50);
            session.remove(black_box(&scratch)).unwrap();
            session.change_log().len()
        })
    });
}

fn overwrite_values(c: &mut Criterion) {
    let store = MemoryStore::new("nt:unstructured");
    let root = ItemId::new("root");
    let p = store
        .add_property(&root, "counter", PropertyType::Long, vec![Value::from(0_i64)])
        .unwrap();

    c.bench_function("overwrite_value_1000_times", |b| {
        b.iter(|| {
            let mut session = open(&store);
            for i in 0..1000_i64 {
                session.set_value(&p, Value::from(i)).unwrap();
            }
            session.change_log().len()
        })
    });
}

fn refresh_loaded_tree(c: &mut Criterion) {
    let store = MemoryStore::new("nt:unstructured");
    let root = ItemId::new("root");
    let children: Vec<ItemId> = (0..100)
        .map(|i| store.add_node(&root, format!("n{}", i), "nt:unstructured").unwrap())
        .collect();

    let mut session = open(&store);
    for child in &children {
        session.node(child).unwrap();
    }

    c.bench_function("refresh_all_100_unchanged", |b| {
        b.iter(|| session.refresh_all().unwrap())
    });
}

criterion_group!(
    benches,
    submit_many_nodes,
    discard_many_nodes,
    save_many_nodes,
    add_then_remove_collapses,
    overwrite_values,
    refresh_loaded_tree
);
criterion_main!(benches);
