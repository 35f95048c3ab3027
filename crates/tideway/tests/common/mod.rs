// Copyright (C) 2025 Tideway Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tideway E2E tests.
//!
//! Every test gets its own SQLite database in a temp directory and an engine
//! with fast poll intervals, so the suite runs hermetically and quickly.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tideway::store::SqliteStore;
use tideway::{Engine, EngineConfig, RunStatus};

/// Route engine logs through RUST_LOG when set; safe to call repeatedly.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test context owning the engine, its store, and the backing temp dir.
pub struct TestContext {
    pub engine: Engine,
    pub store: Arc<SqliteStore>,
    _dir: tempfile::TempDir,
}

impl TestContext {
    /// Engine over a fresh SQLite database with test-friendly intervals.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Like [`TestContext::new`] but with a config tweak applied first.
    pub async fn with_config(tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Arc::new(
            SqliteStore::from_path(dir.path().join("tideway-test.db"))
                .await
                .expect("create sqlite store"),
        );

        let mut config = EngineConfig {
            queue_poll_interval: Duration::from_millis(50),
            event_poll_interval: Duration::from_millis(100),
            ..EngineConfig::default()
        };
        tweak(&mut config);

        let engine = Engine::new(store.clone(), config);
        Self {
            engine,
            store,
            _dir: dir,
        }
    }

    /// Poll until the run's persisted status matches, or panic after 5s.
    pub async fn wait_for_status(&self, run_id: &str, expected: RunStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(row) = self.engine.get_run(run_id).await
                && row.status == expected.as_str()
            {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("run '{}' never reached status '{}'", run_id, expected.as_str());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until the run exists and is non-terminal, or panic after 5s.
    pub async fn wait_until_running(&self, run_id: &str) {
        self.wait_for_status(run_id, RunStatus::Pending).await;
    }
}
