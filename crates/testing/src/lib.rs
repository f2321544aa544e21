// Allow unwrap in testing utilities - test code should panic on errors
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! # dplug Testing Utilities
//!
//! This crate provides testing utilities for dplug hosts:
//!
//! - **MockExecutorFactory / MockPlugin**: scripted plugin behaviors that
//!   exercise the full isolation boundary (channels, broker, mediated host
//!   calls) without a real engine
//! - **manifest builder**: terse construction of [`PluginManifest`]s
//!
//! ```rust,ignore
//! use dplug_testing::{manifest, MockBehavior, MockExecutorFactory, MockPlugin};
//!
//! let factory = Arc::new(MockExecutorFactory::new());
//! factory.register(
//!     "weather",
//!     MockPlugin::new().with_export("getForecast", MockBehavior::Return(json!("sunny"))),
//! );
//! let registry = PluginRegistry::with_factory(HostConfig::for_testing(), factory);
//! ```

mod manifest_builder;
mod mock_executor;

pub use manifest_builder::{manifest, ManifestBuilder};
pub use mock_executor::{MockBehavior, MockExecutorFactory, MockPlugin};
