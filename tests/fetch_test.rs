//! Integration tests for the row helpers.

mod common;

use common::{ScriptedEngine, database};
use serde_json::json;
use sqlscope::{Context, DbError, Scope, Value};
use std::collections::HashMap;
use std::sync::Arc;

const USERS: &str = "select id, name from users order by id";

fn scripted_users() -> Arc<ScriptedEngine> {
    let engine = ScriptedEngine::new();
    engine.script_rows(
        USERS,
        &["id", "name"],
        vec![
            vec![Value::Int(1), Value::from("ann")],
            vec![Value::Int(2), Value::from("bob")],
            vec![Value::Int(3), Value::Null],
        ],
    );
    engine
}

#[tokio::test]
async fn test_for_each_visits_every_row() {
    let engine = scripted_users();
    let db = database(&engine).await;

    let mut ids = Vec::new();
    let visited = db
        .fetch(&Context::new(), USERS, &[])
        .for_each(|row| {
            ids.push(row.try_get::<i64>(0)?);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(visited, 3);
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_for_each_stops_on_reader_error() {
    let engine = scripted_users();
    let db = database(&engine).await;

    let err = db
        .fetch(&Context::new(), USERS, &[])
        .for_each(|row| row.try_get::<String>(1).map(|_| ()))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Decode { .. }));
}

#[tokio::test]
async fn test_one_returns_first_accepted_row() {
    let engine = scripted_users();
    let db = database(&engine).await;
    let ctx = Context::new();

    let name: String = db
        .fetch(&ctx, USERS, &[])
        .one(|row| {
            let id: i64 = row.try_get(0)?;
            (id > 1).then(|| row.try_get_named("name")).transpose()
        })
        .await
        .unwrap();
    assert_eq!(name, "bob");

    let err = db
        .fetch(&ctx, USERS, &[])
        .one(|row| Ok(row.try_get::<i64>(0).ok().filter(|id| *id > 10)))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NoRows));
}

#[tokio::test]
async fn test_all_skips_rejected_rows() {
    let engine = scripted_users();
    let db = database(&engine).await;

    let names: Vec<String> = db
        .fetch(&Context::new(), USERS, &[])
        .all(|row| row.try_get::<Option<String>>(1))
        .await
        .unwrap();

    assert_eq!(names, vec!["ann", "bob"]);
}

#[tokio::test]
async fn test_map_and_dictionary() {
    let engine = scripted_users();
    let db = database(&engine).await;
    let ctx = Context::new();

    let by_name: HashMap<String, i64> = db
        .fetch(&ctx, USERS, &[])
        .map(|row| {
            let name: Option<String> = row.try_get(1)?;
            let id: i64 = row.try_get(0)?;
            Ok(name.map(|n| (n, id)))
        })
        .await
        .unwrap();
    assert_eq!(by_name.len(), 2);
    assert_eq!(by_name["bob"], 2);

    let dictionary: HashMap<i64, Option<String>> =
        db.fetch(&ctx, USERS, &[]).dictionary().await.unwrap();
    assert_eq!(dictionary.len(), 3);
    assert_eq!(dictionary[&1], Some("ann".to_string()));
    assert_eq!(dictionary[&3], None);
}

#[tokio::test]
async fn test_dictionary_needs_two_columns() {
    let engine = ScriptedEngine::new();
    engine.script_rows("select id from users", &["id"], vec![vec![Value::Int(1)]]);
    let db = database(&engine).await;

    let err = db
        .fetch(&Context::new(), "select id from users", &[])
        .dictionary::<i64, i64>()
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
}

#[tokio::test]
async fn test_dictionary_checks_columns_of_empty_result() {
    let engine = ScriptedEngine::new();
    engine.script_rows("select id from users where false", &["id"], Vec::new());
    let db = database(&engine).await;
    let ctx = Context::new();

    let err = db
        .fetch(&ctx, "select id from users where false", &[])
        .dictionary::<i64, i64>()
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));

    engine.script_rows("select id, name from users where false", &["id", "name"], Vec::new());
    let empty: HashMap<i64, String> = db
        .fetch(&ctx, "select id, name from users where false", &[])
        .dictionary()
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_json_maps() {
    let engine = scripted_users();
    let db = database(&engine).await;
    let ctx = Context::new();

    let first = db.fetch(&ctx, USERS, &[]).json_map().await.unwrap();
    assert_eq!(serde_json::Value::Object(first), json!({"id": 1, "name": "ann"}));

    let all = db.fetch(&ctx, USERS, &[]).json_maps().await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[2]["name"], serde_json::Value::Null);

    let err = db
        .fetch(&ctx, "select id from users where false", &[])
        .json_map()
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NoRows));
}

#[tokio::test]
async fn test_fetch_inside_transaction_uses_transaction() {
    let engine = scripted_users();
    let db = database(&engine).await;
    let scope = &db;

    let count = db
        .transact(&Context::new(), |ctx| async move {
            scope.fetch(&ctx, USERS, &[]).for_each(|_| Ok(())).await
        })
        .await
        .unwrap();

    assert_eq!(count, 3);
    assert_eq!(engine.journal()[1], format!("query tx_1: {USERS}"));
}
