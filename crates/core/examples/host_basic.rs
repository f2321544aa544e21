//! Basic plugin host walkthrough.
//!
//! Registers a scripted plugin, loads it, calls an exported method through
//! the isolation boundary and dumps the audit trail.
//!
//! Run with: `cargo run -p dplug-core --example host_basic`

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use serde_json::json;

use dplug_core::{HookName, HostConfig, PluginCode, PluginRegistry};
use dplug_testing::{manifest, MockBehavior, MockExecutorFactory, MockPlugin};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let factory = Arc::new(MockExecutorFactory::new());
    factory.register(
        "weather",
        MockPlugin::new()
            .with_export("getForecast", MockBehavior::Return(json!("sunny, 22°C")))
            .with_hook(HookName::OnLoad, MockBehavior::Return(json!(null))),
    );

    let registry = PluginRegistry::with_factory(HostConfig::default(), factory);
    let mut events = registry.subscribe();

    registry
        .register_plugin(
            manifest("weather")
                .export("getForecast")
                .hook(HookName::OnLoad)
                .permissions(r#"{"network":["example.com"],"storage":{"local":true}}"#)
                .build(),
            PluginCode::Source("// entry point".into()),
        )
        .await
        .unwrap();
    registry.load_plugin("weather").await.unwrap();
    println!("event: {:?}", events.recv().await.unwrap());

    let forecast = registry
        .call_plugin("weather", "getForecast", vec![])
        .await
        .unwrap();
    println!("forecast: {forecast}");

    for plugin in registry.get_all_plugins().await {
        println!(
            "{} v{} [{}] load_time={}ms calls={}",
            plugin.id, plugin.version, plugin.status, plugin.metrics.load_time_ms, plugin.metrics.api_calls
        );
    }

    for entry in registry.get_audit_log(Some("weather")).await {
        println!("audit: {:?} {}", entry.action, entry.details);
    }

    registry.destroy().await;
}
