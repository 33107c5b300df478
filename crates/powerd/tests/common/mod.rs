//! Shared fixture: a daemon over a temp dir with every system seam faked.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use power_common::{FakeCommandRunner, FakeProcessTable, Layout};
use powerd::config::Config;
use powerd::server::{router, AppState};
use powerd::update::FakeScriptFetcher;
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub const UPDATE_SCRIPT: &[u8] = b"#!/bin/bash\necho 'Candle: updating'\n";

pub struct Fixture {
    pub dir: TempDir,
    pub layout: Layout,
    pub runner: FakeCommandRunner,
    pub table: Arc<FakeProcessTable>,
    pub fetcher: FakeScriptFetcher,
    pub state: Arc<AppState>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let layout = Layout::rooted(dir.path());
        for d in [
            &layout.boot_dir,
            &layout.addon_dir,
            &layout.data_dir,
            &layout.base_dir.join("config"),
        ] {
            fs::create_dir_all(d).unwrap();
        }
        for (script, body) in [
            (layout.factory_reset_script(), "#!/bin/bash\n# factory reset\n"),
            (layout.manual_update_script(), "#!/bin/bash\n# manual update\n"),
            (layout.restore_backup_script(), "#!/bin/bash\n# restore\n"),
        ] {
            fs::write(script, body).unwrap();
        }
        fs::write(layout.base_dir.join("config/db.sqlite3"), b"SQLite format 3").unwrap();

        let mut config = Config::default();
        config.paths = layout.clone();
        config.daemon.reboot_grace_secs = 0;
        adjust(&mut config);

        let runner = FakeCommandRunner::new();
        let table = Arc::new(FakeProcessTable::new());
        let fetcher = FakeScriptFetcher::serving(UPDATE_SCRIPT);
        let state = Arc::new(AppState::new(
            config,
            Arc::new(runner.clone()),
            table.clone(),
            Arc::new(fetcher.clone()),
        ));

        Self {
            dir,
            layout,
            runner,
            table,
            fetcher,
            state,
        }
    }

    /// A second daemon over the same directories, as after a restart
    pub fn restarted(&self) -> Arc<AppState> {
        Arc::new(AppState::new(
            self.state.config.clone(),
            Arc::new(self.runner.clone()),
            self.table.clone(),
            Arc::new(self.fetcher.clone()),
        ))
    }
}

/// Send `body` to `path` with `method`, return status and parsed JSON
pub async fn request(state: &Arc<AppState>, method: &str, path: &str, body: &str) -> (StatusCode, Value) {
    let response = router(Arc::clone(state))
        .oneshot(
            Request::builder()
                .method(method)
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

pub async fn post(state: &Arc<AppState>, path: &str, body: Value) -> (StatusCode, Value) {
    request(state, "POST", path, &body.to_string()).await
}
