//! Storage quota tests through the mediated context API.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use serde_json::json;

use dplug_core::{AuditAction, HostConfig, PluginCode, PluginRegistry};
use dplug_protocol::HostCall;
use dplug_testing::{manifest, MockBehavior, MockExecutorFactory, MockPlugin};

fn code() -> PluginCode {
    PluginCode::Source("// plugin body".into())
}

fn registry_with(factory: &Arc<MockExecutorFactory>) -> PluginRegistry {
    PluginRegistry::with_factory(HostConfig::for_testing(), factory.clone())
}

const TINY_STORE: &str = r#"{"storage":{"local":true,"size":48}}"#;

#[tokio::test]
async fn over_quota_write_is_rejected_and_prior_value_survives() {
    let factory = Arc::new(MockExecutorFactory::new());
    factory.register(
        "squirrel",
        MockPlugin::new()
            .with_export(
                "stashSmall",
                MockBehavior::HostCalls(vec![HostCall::StorageSet {
                    key: "nut".into(),
                    value: json!("acorn"),
                }]),
            )
            .with_export(
                "stashHuge",
                MockBehavior::HostCalls(vec![HostCall::StorageSet {
                    key: "nut".into(),
                    value: json!("x".repeat(100)),
                }]),
            )
            .with_export(
                "peek",
                MockBehavior::HostCalls(vec![HostCall::StorageGet { key: "nut".into() }]),
            ),
    );
    let registry = registry_with(&factory);
    registry
        .register_plugin(
            manifest("squirrel")
                .export("stashSmall")
                .export("stashHuge")
                .export("peek")
                .permissions(TINY_STORE)
                .build(),
            code(),
        )
        .await
        .unwrap();
    registry.load_plugin("squirrel").await.unwrap();

    let small = registry
        .call_plugin("squirrel", "stashSmall", vec![])
        .await
        .unwrap();
    assert_eq!(small[0]["ok"], true);

    let huge = registry
        .call_plugin("squirrel", "stashHuge", vec![])
        .await
        .unwrap();
    let message = huge[0]["err"].as_str().unwrap();
    assert!(message.contains("storage quota exceeded"), "got: {message}");

    // The rejected write mutated nothing.
    let peek = registry.call_plugin("squirrel", "peek", vec![]).await.unwrap();
    assert_eq!(peek[0]["ok"], "acorn");

    // Quota rejections are audited.
    let rejections: Vec<_> = registry
        .get_audit_log(Some("squirrel"))
        .await
        .into_iter()
        .filter(|entry| entry.action == AuditAction::StorageRejected)
        .collect();
    assert_eq!(rejections.len(), 1);
}

#[tokio::test]
async fn rejected_write_to_a_fresh_key_reads_back_as_null() {
    let factory = Arc::new(MockExecutorFactory::new());
    factory.register(
        "greedy",
        MockPlugin::new().with_export(
            "grabThenPeek",
            MockBehavior::HostCalls(vec![
                HostCall::StorageSet {
                    key: "pile".into(),
                    value: json!("y".repeat(100)),
                },
                HostCall::StorageGet { key: "pile".into() },
            ]),
        ),
    );
    let registry = registry_with(&factory);
    registry
        .register_plugin(
            manifest("greedy")
                .export("grabThenPeek")
                .permissions(TINY_STORE)
                .build(),
            code(),
        )
        .await
        .unwrap();
    registry.load_plugin("greedy").await.unwrap();

    let outcome = registry
        .call_plugin("greedy", "grabThenPeek", vec![])
        .await
        .unwrap();
    assert!(outcome[0].get("err").is_some());
    assert_eq!(outcome[1]["ok"], serde_json::Value::Null);
}

#[tokio::test]
async fn storage_contents_survive_an_unload_reload_cycle() {
    let factory = Arc::new(MockExecutorFactory::new());
    factory.register(
        "elephant",
        MockPlugin::new()
            .with_export(
                "remember",
                MockBehavior::HostCalls(vec![HostCall::StorageSet {
                    key: "fact".into(),
                    value: json!("never forgets"),
                }]),
            )
            .with_export(
                "recall",
                MockBehavior::HostCalls(vec![HostCall::StorageGet { key: "fact".into() }]),
            ),
    );
    let registry = registry_with(&factory);
    registry
        .register_plugin(
            manifest("elephant")
                .export("remember")
                .export("recall")
                .permissions(r#"{"storage":{"local":true}}"#)
                .build(),
            code(),
        )
        .await
        .unwrap();
    registry.load_plugin("elephant").await.unwrap();
    registry
        .call_plugin("elephant", "remember", vec![])
        .await
        .unwrap();

    registry.unload_plugin("elephant").await.unwrap();
    registry.load_plugin("elephant").await.unwrap();

    let recalled = registry.call_plugin("elephant", "recall", vec![]).await.unwrap();
    assert_eq!(recalled[0]["ok"], "never forgets");
}

#[tokio::test]
async fn clear_and_delete_are_scoped_to_the_plugin() {
    let factory = Arc::new(MockExecutorFactory::new());
    factory.register(
        "tidy",
        MockPlugin::new()
            .with_export(
                "fill",
                MockBehavior::HostCalls(vec![
                    HostCall::StorageSet {
                        key: "a".into(),
                        value: json!(1),
                    },
                    HostCall::StorageSet {
                        key: "b".into(),
                        value: json!(2),
                    },
                ]),
            )
            .with_export(
                "cleanup",
                MockBehavior::HostCalls(vec![
                    HostCall::StorageDelete { key: "a".into() },
                    HostCall::StorageClear,
                    HostCall::StorageGet { key: "b".into() },
                ]),
            ),
    );
    let registry = registry_with(&factory);
    registry
        .register_plugin(
            manifest("tidy")
                .export("fill")
                .export("cleanup")
                .permissions(r#"{"storage":{"local":true}}"#)
                .build(),
            code(),
        )
        .await
        .unwrap();
    registry.load_plugin("tidy").await.unwrap();
    registry.call_plugin("tidy", "fill", vec![]).await.unwrap();

    let outcome = registry.call_plugin("tidy", "cleanup", vec![]).await.unwrap();
    assert_eq!(outcome[0]["ok"], true); // delete found the key
    assert_eq!(outcome[1]["ok"], true); // clear succeeded
    assert_eq!(outcome[2]["ok"], serde_json::Value::Null); // everything gone
}
