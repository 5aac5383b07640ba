//! End-to-end scenario tests running the whole stack (parser, executor,
//! catalog, VM, lock table, engine open/close) the way a real client would,
//! rather than exercising one module in isolation.

use std::sync::Arc;
use std::sync::Barrier;
use std::thread;

use ferrodb::catalog::Value;
use ferrodb::execution::{Executor, QueryResult};
use ferrodb::index::Index;
use ferrodb::parser::parse;
use ferrodb::{Engine, EngineConfig, EngineError};

fn open(dir: &tempfile::TempDir) -> Engine {
    let prefix = dir.path().join("t").to_str().unwrap().to_string();
    Engine::open(EngineConfig::new(prefix)).unwrap()
}

fn exec(ex: &mut Executor, sql: &str) -> ferrodb::Result<QueryResult> {
    ex.execute(parse(sql).unwrap())
}

#[test]
fn create_insert_select_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let mut ex = Executor::new(engine.catalog.clone(), engine.vm.clone(), &engine.config);

    exec(&mut ex, "create table users (id int64 name string) index id").unwrap();
    exec(&mut ex, "insert into users values 1, 'alice'").unwrap();
    exec(&mut ex, "insert into users values 2, 'bob'").unwrap();
    exec(&mut ex, "insert into users values 3, 'carol'").unwrap();

    match exec(&mut ex, "select * from users where id > 1").unwrap() {
        QueryResult::Rows(rows) => {
            assert_eq!(rows.len(), 2);
            let names: Vec<String> = rows
                .iter()
                .map(|r| match &r[1] {
                    Value::Str(s) => s.clone(),
                    other => panic!("expected string, got {other:?}"),
                })
                .collect();
            assert!(names.contains(&"bob".to_string()));
            assert!(names.contains(&"carol".to_string()));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    exec(&mut ex, "update users set name = 'alicia' where id = 1").unwrap();
    match exec(&mut ex, "select * from users where id = 1").unwrap() {
        QueryResult::Rows(rows) => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0][1], Value::Str("alicia".to_string()));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let affected = exec(&mut ex, "delete from users where id = 2").unwrap();
    assert!(matches!(affected, QueryResult::Affected(1)));
    match exec(&mut ex, "select * from users where id = 2").unwrap() {
        QueryResult::Rows(rows) => assert!(rows.is_empty()),
        other => panic!("unexpected result: {other:?}"),
    }

    engine.close().unwrap();
}

#[test]
fn repeatable_read_hides_concurrent_commit() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let mut setup_ex = Executor::new(engine.catalog.clone(), engine.vm.clone(), &engine.config);
    exec(&mut setup_ex, "create table t (id int64 v int64) index id").unwrap();
    exec(&mut setup_ex, "insert into t values 1, 10").unwrap();

    let mut rr = Executor::new(engine.catalog.clone(), engine.vm.clone(), &engine.config);
    exec(&mut rr, "begin repeatable read").unwrap();
    match exec(&mut rr, "select * from t where id = 1").unwrap() {
        QueryResult::Rows(rows) => assert_eq!(rows[0][1], Value::Int64(10)),
        other => panic!("unexpected result: {other:?}"),
    }

    let mut writer = Executor::new(engine.catalog.clone(), engine.vm.clone(), &engine.config);
    exec(&mut writer, "update t set v = 99 where id = 1").unwrap();

    // rr's snapshot predates the writer's commit, so the update stays hidden.
    match exec(&mut rr, "select * from t where id = 1").unwrap() {
        QueryResult::Rows(rows) => assert_eq!(rows[0][1], Value::Int64(10)),
        other => panic!("unexpected result: {other:?}"),
    }
    exec(&mut rr, "commit").unwrap();

    match exec(&mut setup_ex, "select * from t where id = 1").unwrap() {
        QueryResult::Rows(rows) => assert_eq!(rows[0][1], Value::Int64(99)),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn version_skip_aborts_repeatable_read_update() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let mut setup_ex = Executor::new(engine.catalog.clone(), engine.vm.clone(), &engine.config);
    exec(&mut setup_ex, "create table t (id int64 v int64) index id").unwrap();
    exec(&mut setup_ex, "insert into t values 1, 10").unwrap();

    let mut rr = Executor::new(engine.catalog.clone(), engine.vm.clone(), &engine.config);
    exec(&mut rr, "begin repeatable read").unwrap();
    exec(&mut rr, "select * from t where id = 1").unwrap();

    let mut writer = Executor::new(engine.catalog.clone(), engine.vm.clone(), &engine.config);
    exec(&mut writer, "update t set v = 99 where id = 1").unwrap();

    match exec(&mut rr, "update t set v = 55 where id = 1") {
        Err(EngineError::ConcurrentUpdate) => {}
        other => panic!("expected ConcurrentUpdate, got {other:?}"),
    }
}

#[test]
fn two_writers_deadlock_and_one_is_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let mut setup_ex = Executor::new(engine.catalog.clone(), engine.vm.clone(), &engine.config);
    exec(&mut setup_ex, "create table t (id int64 v int64) index id").unwrap();
    exec(&mut setup_ex, "insert into t values 1, 10").unwrap();
    exec(&mut setup_ex, "insert into t values 2, 20").unwrap();

    let barrier = Arc::new(Barrier::new(2));

    let catalog_a = engine.catalog.clone();
    let vm_a = engine.vm.clone();
    let config_a = engine.config.clone();
    let barrier_a = barrier.clone();
    let a = thread::spawn(move || {
        let mut ex = Executor::new(catalog_a, vm_a, &config_a);
        exec(&mut ex, "begin").unwrap();
        exec(&mut ex, "update t set v = 11 where id = 1").unwrap();
        barrier_a.wait();
        let result = exec(&mut ex, "update t set v = 21 where id = 2");
        let _ = exec(&mut ex, "commit");
        result
    });

    let catalog_b = engine.catalog.clone();
    let vm_b = engine.vm.clone();
    let config_b = engine.config.clone();
    let barrier_b = barrier.clone();
    let b = thread::spawn(move || {
        let mut ex = Executor::new(catalog_b, vm_b, &config_b);
        exec(&mut ex, "begin").unwrap();
        exec(&mut ex, "update t set v = 22 where id = 2").unwrap();
        barrier_b.wait();
        let result = exec(&mut ex, "update t set v = 12 where id = 1");
        let _ = exec(&mut ex, "commit");
        result
    });

    let result_a = a.join().unwrap();
    let result_b = b.join().unwrap();

    let errored = [&result_a, &result_b]
        .into_iter()
        .filter(|r| matches!(r, Err(EngineError::ConcurrentUpdate)))
        .count();
    assert_eq!(errored, 1, "exactly one writer should be rolled back by deadlock detection");
}

#[test]
fn crash_recovery_drops_uncommitted_row_keeps_committed_one() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("t").to_str().unwrap().to_string();
    let config = EngineConfig::new(prefix);

    {
        let engine = Engine::open(config.clone()).unwrap();
        let mut ex = Executor::new(engine.catalog.clone(), engine.vm.clone(), &engine.config);
        exec(&mut ex, "create table t (id int64 v int64) index id").unwrap();
        exec(&mut ex, "insert into t values 1, 10").unwrap();

        exec(&mut ex, "begin").unwrap();
        exec(&mut ex, "insert into t values 2, 20").unwrap();
        // No commit: dropping `engine` without calling `close()` simulates a
        // crash, leaving page one's validity marker stale.
    }

    let engine = Engine::open(config).unwrap();
    let mut ex = Executor::new(engine.catalog.clone(), engine.vm.clone(), &engine.config);
    match exec(&mut ex, "select * from t").unwrap() {
        QueryResult::Rows(rows) => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0][0], Value::Int64(1));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    engine.close().unwrap();
}

#[test]
fn b_tree_index_holds_ten_thousand_keys_in_random_order() {
    use ferrodb::common::Uid;
    use ferrodb::dm::Dm;
    use ferrodb::storage::{page, Pager};
    use ferrodb::wal::Wal;
    use rand::seq::SliceRandom;

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("idx.db");
    let log = dir.path().join("idx.log");
    let pager = Arc::new(Pager::create(db.to_str().unwrap(), 0).unwrap());
    let wal = Arc::new(Wal::create(log.to_str().unwrap()).unwrap());
    pager.new_page(&page::new_page_one_raw()).unwrap();
    let dm = Arc::new(Dm::new(Arc::clone(&pager), wal, 0).unwrap());
    let (index, _boot_uid) = Index::create(dm, pager).unwrap();

    const N: i64 = 10_000;
    let mut keys: Vec<i64> = (0..N).collect();
    keys.shuffle(&mut rand::rng());
    for &k in &keys {
        index.insert(k, k as Uid).unwrap();
    }

    let found = index.search_range(0, N - 1).unwrap();
    assert_eq!(found.len(), N as usize);
    assert_eq!(found, (0..N).map(|k| k as Uid).collect::<Vec<_>>());

    assert_eq!(index.search(12345).unwrap(), vec![12345u64]);
    assert!(index.search(N + 1).unwrap().is_empty());
}
