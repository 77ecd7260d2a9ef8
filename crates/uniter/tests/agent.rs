//! End-to-end tests: a real agent running shell hooks against `MemoryState`.
//!
//! Every hook appends `name [remote-unit] [relation-id]` to `<data>/trace`.
//! A hook fails while `<data>/fail-<name>` exists and blocks while
//! `<data>/block-<name>` exists.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use uniter::{Agent, AgentConfig, Exit};
use uniter_charm::{sha256_hex, BundleBuilder, MemoryFetcher};
use uniter_core::{AssignedCharm, Life, RelationId, ResolvedMode, UnitName, UnitStatus};
use uniter_state::{CharmInfo, MemoryState, StateStore};

/// How long to wait for the agent to reach an expected state.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Polling interval while waiting.
const POLL: Duration = Duration::from_millis(20);

const HOOKS: &[&str] = &[
    "install",
    "start",
    "config-changed",
    "upgrade-charm",
    "stop",
    "my-relation-joined",
    "my-relation-changed",
    "my-relation-departed",
    "my-relation-broken",
];

const HOOK_SCRIPT: &str = r#"#!/bin/sh
name="$(basename "$0")"
data="$JUJU_CHARM_DIR/.."
set -- "$name" $JUJU_REMOTE_UNIT $JUJU_RELATION_ID
echo "$*" >> "$data/trace"
while [ -e "$data/block-$name" ]; do sleep 0.05; done
[ ! -e "$data/fail-$name" ]
"#;

fn unit(name: &str) -> UnitName {
    name.parse().unwrap()
}

fn rel() -> RelationId {
    "my:0".parse().unwrap()
}

// =============================================================================
// Test Context
// =============================================================================

struct Context {
    dir: TempDir,
    store: Arc<MemoryState>,
    fetcher: Arc<MemoryFetcher>,
    unit: UnitName,
}

impl Context {
    /// Unit `u/0` assigned revision 0 with config version 1, plus two peers.
    fn new() -> Self {
        let ctx = Self {
            dir: TempDir::new().unwrap(),
            store: Arc::new(MemoryState::new()),
            fetcher: Arc::new(MemoryFetcher::new()),
            unit: unit("u/0"),
        };
        fs::create_dir_all(ctx.data_dir()).unwrap();
        ctx.add_charm(0, &[("data", "v0\n")]);
        ctx.store.add_unit(&ctx.unit, AssignedCharm::new(0));
        ctx.store.add_unit(&unit("u/1"), AssignedCharm::new(0));
        ctx.store.add_unit(&unit("u/2"), AssignedCharm::new(0));
        ctx.store.set_config_version(&ctx.unit, 1);
        ctx
    }

    fn data_dir(&self) -> PathBuf {
        self.dir.path().join("agent")
    }

    fn charm_file(&self, path: &str) -> PathBuf {
        self.data_dir().join("charm").join(path)
    }

    fn add_charm(&self, revision: u64, files: &[(&str, &str)]) {
        let mut builder = BundleBuilder::new();
        for hook in HOOKS {
            builder = builder.executable(&format!("hooks/{hook}"), HOOK_SCRIPT);
        }
        for (path, content) in files {
            builder = builder.file(path, *content);
        }
        let bundle = builder.build();
        let url = format!("http://charms.test/dummy-{revision}.tar.gz");
        self.store.add_charm(CharmInfo {
            revision,
            url: url.clone(),
            sha256: sha256_hex(&bundle),
        });
        self.fetcher.insert(url, bundle);
    }

    fn config(&self) -> AgentConfig {
        let mut config = AgentConfig::new(self.data_dir(), self.unit.clone());
        config.hook_kill_grace_seconds = 1;
        config.fetch_backoff_initial_ms = 10;
        config.fetch_backoff_max_ms = 50;
        config.ping_interval_seconds = 1;
        config
    }

    async fn start(&self) -> Agent {
        Agent::start(self.config(), self.store.clone(), self.fetcher.clone())
            .await
            .unwrap()
    }

    fn set_marker(&self, kind: &str, hook: &str, on: bool) {
        let path = self.data_dir().join(format!("{kind}-{hook}"));
        if on {
            fs::write(path, "").unwrap();
        } else {
            fs::remove_file(path).unwrap();
        }
    }

    fn fail(&self, hook: &str, on: bool) {
        self.set_marker("fail", hook, on);
    }

    fn block(&self, hook: &str, on: bool) {
        self.set_marker("block", hook, on);
    }

    fn trace(&self) -> Vec<String> {
        fs::read_to_string(self.data_dir().join("trace"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn status(&self) -> UnitStatus {
        self.store.unit_record(&self.unit).unwrap().status
    }

    async fn wait_for(&self, what: &str, mut done: impl FnMut(&Self) -> bool) {
        let result = timeout(WAIT_TIMEOUT, async {
            while !done(self) {
                sleep(POLL).await;
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "timed out waiting for {what}; trace {:?}, status {:?}",
            self.trace(),
            self.store.unit_record(&self.unit).map(|r| r.status)
        );
    }

    async fn wait_trace(&self, expected: &[&str]) {
        self.wait_for(&format!("trace {expected:?}"), |ctx| ctx.trace() == expected)
            .await;
    }

    async fn wait_status(&self, status: UnitStatus) {
        let what = format!("status {status:?}");
        self.wait_for(&what, move |ctx| ctx.status() == status).await;
    }

    /// Add `my:0` between the unit and its peers, and put peers in scope.
    async fn relate(&self, peers: &[&str]) {
        let units = [self.unit.clone(), unit("u/1"), unit("u/2")];
        self.store.add_relation(&rel(), &units);
        for peer in peers {
            self.store.enter_scope(&rel(), &unit(peer)).await.unwrap();
        }
    }

    fn in_scope(&self, name: &str) -> bool {
        self.store
            .relation(&rel())
            .is_some_and(|r| r.members.contains_key(&unit(name)))
    }
}

async fn finish(agent: Agent) -> Exit {
    timeout(WAIT_TIMEOUT, agent.wait())
        .await
        .expect("agent did not exit")
        .unwrap()
}

const STARTUP: &[&str] = &["install", "start", "config-changed"];

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn startup_happy_path() {
    let ctx = Context::new();
    let agent = ctx.start().await;

    ctx.wait_trace(STARTUP).await;
    ctx.wait_status(UnitStatus::Started).await;
    let record = ctx.store.unit_record(&ctx.unit).unwrap();
    assert_eq!(record.charm_revision, Some(0));
    assert_eq!(fs::read_to_string(ctx.charm_file("data")).unwrap(), "v0\n");

    ctx.store.set_config_version(&ctx.unit, 2);
    ctx.wait_trace(&["install", "start", "config-changed", "config-changed"])
        .await;

    assert_eq!(agent.stop_and_wait().await.unwrap(), Exit::Stopped);
    assert!(ctx.store.last_ping(&ctx.unit).is_some());
}

#[tokio::test]
async fn restart_runs_config_changed_once() {
    let ctx = Context::new();
    let agent = ctx.start().await;
    ctx.wait_trace(STARTUP).await;
    ctx.wait_status(UnitStatus::Started).await;
    agent.stop_and_wait().await.unwrap();

    let agent = ctx.start().await;
    ctx.wait_trace(&["install", "start", "config-changed", "config-changed"])
        .await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(ctx.trace().len(), 4);
    agent.stop_and_wait().await.unwrap();
}

#[tokio::test]
async fn download_is_retried() {
    let ctx = Context::new();
    ctx.fetcher.fail_next(2);
    let agent = ctx.start().await;

    ctx.wait_trace(STARTUP).await;
    assert_eq!(ctx.fetcher.fetches(), 3);
    agent.stop_and_wait().await.unwrap();
}

#[tokio::test]
async fn missing_bundle_is_fatal() {
    let ctx = Context::new();
    ctx.store.add_charm(CharmInfo {
        revision: 7,
        url: "http://charms.test/missing.tar.gz".into(),
        sha256: "00".repeat(32),
    });
    ctx.store
        .set_assigned_charm(&ctx.unit, AssignedCharm::new(7))
        .unwrap();

    let agent = ctx.start().await;
    let err = timeout(WAIT_TIMEOUT, agent.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert!(
        err.to_string().contains("failed to download charm"),
        "{err}"
    );
    assert!(ctx.trace().is_empty());
}

#[tokio::test]
async fn unknown_unit_fails_to_start() {
    let ctx = Context::new();
    let mut config = ctx.config();
    config.unit = unit("ghost/3");

    let err = Agent::start(config, ctx.store.clone(), ctx.fetcher.clone())
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "failed to initialize uniter for unit \"ghost/3\": unit \"ghost/3\" not found"
    );
}

#[tokio::test]
async fn insane_charm_path_fails_to_start() {
    let ctx = Context::new();
    fs::write(ctx.data_dir().join("charm"), "not a directory").unwrap();

    let err = Agent::start(ctx.config(), ctx.store.clone(), ctx.fetcher.clone())
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(
        message.starts_with("failed to initialize uniter for unit \"u/0\": charm deployment failed:"),
        "{message}"
    );
    assert!(message.ends_with("is not a directory"), "{message}");
}

// =============================================================================
// Hook Errors
// =============================================================================

#[tokio::test]
async fn install_failure_resolved_without_hooks() {
    let ctx = Context::new();
    ctx.fail("install", true);
    let agent = ctx.start().await;

    ctx.wait_trace(&["install"]).await;
    ctx.wait_status(UnitStatus::Error("install".into())).await;

    ctx.store
        .set_resolved(&ctx.unit, ResolvedMode::NoHooks)
        .unwrap();
    ctx.wait_trace(STARTUP).await;
    ctx.wait_status(UnitStatus::Started).await;
    assert_eq!(
        ctx.store.unit_record(&ctx.unit).unwrap().resolved,
        ResolvedMode::None
    );
    agent.stop_and_wait().await.unwrap();
}

#[tokio::test]
async fn install_failure_resolved_with_retry() {
    let ctx = Context::new();
    ctx.fail("install", true);
    let agent = ctx.start().await;
    ctx.wait_trace(&["install"]).await;
    ctx.wait_status(UnitStatus::Error("install".into())).await;

    ctx.store
        .set_resolved(&ctx.unit, ResolvedMode::RetryHooks)
        .unwrap();
    ctx.wait_trace(&["install", "install"]).await;
    ctx.wait_status(UnitStatus::Error("install".into())).await;

    // One request, one retry.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(ctx.trace(), ["install", "install"]);

    ctx.fail("install", false);
    ctx.store
        .set_resolved(&ctx.unit, ResolvedMode::RetryHooks)
        .unwrap();
    ctx.wait_trace(&["install", "install", "install", "start", "config-changed"])
        .await;
    ctx.wait_status(UnitStatus::Started).await;
    agent.stop_and_wait().await.unwrap();
}

#[tokio::test]
async fn failed_hook_survives_restart_without_rerun() {
    let ctx = Context::new();
    ctx.fail("start", true);
    let agent = ctx.start().await;
    ctx.wait_trace(&["install", "start"]).await;
    ctx.wait_status(UnitStatus::Error("start".into())).await;
    agent.stop_and_wait().await.unwrap();

    let agent = ctx.start().await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(ctx.trace(), ["install", "start"]);
    assert_eq!(ctx.status(), UnitStatus::Error("start".into()));

    ctx.fail("start", false);
    ctx.store
        .set_resolved(&ctx.unit, ResolvedMode::RetryHooks)
        .unwrap();
    ctx.wait_trace(&["install", "start", "start", "config-changed"])
        .await;
    agent.stop_and_wait().await.unwrap();
}

#[tokio::test]
async fn interrupted_hook_is_rerun_after_restart() {
    let ctx = Context::new();
    ctx.block("install", true);
    let agent = ctx.start().await;
    ctx.wait_trace(&["install"]).await;

    // Stopping kills the blocked hook; its outcome is unknown.
    assert_eq!(
        timeout(WAIT_TIMEOUT, agent.stop_and_wait())
            .await
            .unwrap()
            .unwrap(),
        Exit::Stopped
    );

    ctx.block("install", false);
    let agent = ctx.start().await;
    ctx.wait_trace(&["install", "install", "start", "config-changed"])
        .await;
    agent.stop_and_wait().await.unwrap();
}

// =============================================================================
// Upgrades
// =============================================================================

#[tokio::test]
async fn steady_state_upgrade() {
    let ctx = Context::new();
    ctx.add_charm(1, &[("data", "v1\n")]);
    let agent = ctx.start().await;
    ctx.wait_trace(STARTUP).await;
    ctx.wait_status(UnitStatus::Started).await;

    ctx.store
        .set_assigned_charm(&ctx.unit, AssignedCharm::new(1))
        .unwrap();
    ctx.wait_trace(&[
        "install",
        "start",
        "config-changed",
        "upgrade-charm",
        "config-changed",
    ])
    .await;
    assert_eq!(
        ctx.store.unit_record(&ctx.unit).unwrap().charm_revision,
        Some(1)
    );
    assert_eq!(fs::read_to_string(ctx.charm_file("data")).unwrap(), "v1\n");
    agent.stop_and_wait().await.unwrap();
}

#[tokio::test]
async fn upgrade_conflict_forced_resolve() {
    let ctx = Context::new();
    ctx.add_charm(1, &[("data", "v1\n"), ("v1-only", "1\n")]);
    ctx.add_charm(2, &[("data", "v2\n"), ("v2-only", "2\n")]);
    let agent = ctx.start().await;
    ctx.wait_trace(STARTUP).await;
    ctx.wait_status(UnitStatus::Started).await;

    fs::write(ctx.charm_file("data"), "user edit\n").unwrap();
    fs::write(ctx.charm_file("user-file"), "mine\n").unwrap();
    ctx.store
        .set_assigned_charm(&ctx.unit, AssignedCharm::new(1))
        .unwrap();
    ctx.wait_status(UnitStatus::Error(UnitStatus::UPGRADE_FAILED.into()))
        .await;
    assert!(ctx.charm_file(".version-control/conflicted").exists());
    assert_eq!(
        ctx.store.unit_record(&ctx.unit).unwrap().charm_revision,
        Some(0)
    );

    ctx.store
        .set_assigned_charm(&ctx.unit, AssignedCharm::forced(2))
        .unwrap();
    ctx.wait_trace(&[
        "install",
        "start",
        "config-changed",
        "upgrade-charm",
        "config-changed",
    ])
    .await;
    ctx.wait_status(UnitStatus::Started).await;

    assert_eq!(fs::read_to_string(ctx.charm_file("data")).unwrap(), "v2\n");
    assert!(ctx.charm_file("v2-only").exists());
    assert!(!ctx.charm_file("v1-only").exists());
    assert_eq!(
        fs::read_to_string(ctx.charm_file("user-file")).unwrap(),
        "mine\n"
    );
    assert!(!ctx.charm_file(".version-control/conflicted").exists());
    assert_eq!(
        ctx.store.unit_record(&ctx.unit).unwrap().charm_revision,
        Some(2)
    );
    agent.stop_and_wait().await.unwrap();
}

#[tokio::test]
async fn upgrade_conflict_resolved_by_operator() {
    let ctx = Context::new();
    ctx.add_charm(1, &[("data", "v1\n")]);
    let agent = ctx.start().await;
    ctx.wait_trace(STARTUP).await;
    ctx.wait_status(UnitStatus::Started).await;

    fs::write(ctx.charm_file("data"), "user edit\n").unwrap();
    ctx.store
        .set_assigned_charm(&ctx.unit, AssignedCharm::new(1))
        .unwrap();
    ctx.wait_status(UnitStatus::Error(UnitStatus::UPGRADE_FAILED.into()))
        .await;

    // A conflicted upgrade survives a restart.
    agent.stop_and_wait().await.unwrap();
    let agent = ctx.start().await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(ctx.trace(), STARTUP);

    fs::write(ctx.charm_file("data"), "merged by hand\n").unwrap();
    ctx.store
        .set_resolved(&ctx.unit, ResolvedMode::NoHooks)
        .unwrap();
    ctx.wait_trace(&[
        "install",
        "start",
        "config-changed",
        "upgrade-charm",
        "config-changed",
    ])
    .await;
    ctx.wait_status(UnitStatus::Started).await;
    assert_eq!(
        fs::read_to_string(ctx.charm_file("data")).unwrap(),
        "merged by hand\n"
    );
    assert_eq!(
        ctx.store.unit_record(&ctx.unit).unwrap().charm_revision,
        Some(1)
    );
    agent.stop_and_wait().await.unwrap();
}

// =============================================================================
// Relations
// =============================================================================

#[tokio::test]
async fn relation_lifecycle() {
    let ctx = Context::new();
    let agent = ctx.start().await;
    ctx.wait_trace(STARTUP).await;

    let mut expected = STARTUP.to_vec();
    ctx.relate(&["u/1"]).await;
    expected.extend(["my-relation-joined u/1 my:0", "my-relation-changed u/1 my:0"]);
    ctx.wait_trace(&expected).await;
    assert!(ctx.in_scope("u/0"));

    ctx.store.enter_scope(&rel(), &unit("u/2")).await.unwrap();
    expected.extend(["my-relation-joined u/2 my:0", "my-relation-changed u/2 my:0"]);
    ctx.wait_trace(&expected).await;

    ctx.store.change_settings(&rel(), &unit("u/1")).unwrap();
    expected.push("my-relation-changed u/1 my:0");
    ctx.wait_trace(&expected).await;

    ctx.store.leave_scope(&rel(), &unit("u/2")).await.unwrap();
    expected.push("my-relation-departed u/2 my:0");
    ctx.wait_trace(&expected).await;

    ctx.store.set_relation_dying(&rel()).unwrap();
    expected.extend(["my-relation-departed u/1 my:0", "my-relation-broken my:0"]);
    ctx.wait_trace(&expected).await;
    ctx.wait_for("scope left", |ctx| !ctx.in_scope("u/0")).await;

    agent.stop_and_wait().await.unwrap();
}

#[tokio::test]
async fn interrupted_relation_hook_runs_once_after_restart() {
    let ctx = Context::new();
    let agent = ctx.start().await;
    ctx.wait_trace(STARTUP).await;

    ctx.block("my-relation-changed", true);
    ctx.relate(&["u/1"]).await;
    let mut expected = STARTUP.to_vec();
    expected.extend(["my-relation-joined u/1 my:0", "my-relation-changed u/1 my:0"]);
    ctx.wait_trace(&expected).await;
    agent.stop_and_wait().await.unwrap();

    ctx.block("my-relation-changed", false);
    let agent = ctx.start().await;
    expected.extend(["config-changed", "my-relation-changed u/1 my:0"]);
    ctx.wait_trace(&expected).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(ctx.trace(), expected);
    agent.stop_and_wait().await.unwrap();
}

// =============================================================================
// Death
// =============================================================================

#[tokio::test]
async fn dying_unit_departs_relations_and_stops() {
    let ctx = Context::new();
    let agent = ctx.start().await;
    ctx.wait_trace(STARTUP).await;
    ctx.relate(&["u/1"]).await;
    let mut expected = STARTUP.to_vec();
    expected.extend(["my-relation-joined u/1 my:0", "my-relation-changed u/1 my:0"]);
    ctx.wait_trace(&expected).await;

    ctx.store.set_unit_life(&ctx.unit, Life::Dying).unwrap();
    assert_eq!(finish(agent).await, Exit::Dead);

    expected.extend([
        "my-relation-departed u/1 my:0",
        "my-relation-broken my:0",
        "stop",
    ]);
    assert_eq!(ctx.trace(), expected);
    let record = ctx.store.unit_record(&ctx.unit).unwrap();
    assert_eq!(record.life, Life::Dead);
    assert_eq!(record.status, UnitStatus::Stopped);

    // The relation itself lives on without us.
    let relation = ctx.store.relation(&rel()).unwrap();
    assert_eq!(relation.life, Life::Alive);
    assert!(!ctx.in_scope("u/0"));
    assert!(ctx.in_scope("u/1"));
}

#[tokio::test]
async fn dying_service_stops_unit() {
    let ctx = Context::new();
    let agent = ctx.start().await;
    ctx.wait_trace(STARTUP).await;
    ctx.relate(&["u/1"]).await;
    let mut expected = STARTUP.to_vec();
    expected.extend(["my-relation-joined u/1 my:0", "my-relation-changed u/1 my:0"]);
    ctx.wait_trace(&expected).await;

    ctx.store.set_service_life(ctx.unit.service(), Life::Dying);
    assert_eq!(finish(agent).await, Exit::Dead);

    expected.extend([
        "my-relation-departed u/1 my:0",
        "my-relation-broken my:0",
        "stop",
    ]);
    assert_eq!(ctx.trace(), expected);
    let record = ctx.store.unit_record(&ctx.unit).unwrap();
    assert_eq!(record.life, Life::Dead);
    assert_eq!(record.status, UnitStatus::Stopped);
    assert!(!ctx.in_scope("u/0"));
}

#[tokio::test]
async fn dying_unit_waits_for_hook_error() {
    let ctx = Context::new();
    ctx.fail("start", true);
    let agent = ctx.start().await;
    ctx.wait_trace(&["install", "start"]).await;
    ctx.wait_status(UnitStatus::Error("start".into())).await;

    ctx.store.set_unit_life(&ctx.unit, Life::Dying).unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(ctx.trace(), ["install", "start"]);
    assert!(!agent.is_finished());

    ctx.fail("start", false);
    ctx.store
        .set_resolved(&ctx.unit, ResolvedMode::RetryHooks)
        .unwrap();
    assert_eq!(finish(agent).await, Exit::Dead);
    assert_eq!(ctx.trace(), ["install", "start", "start", "config-changed", "stop"]);
}

#[tokio::test]
async fn dead_unit_exits_without_hooks() {
    let ctx = Context::new();
    let agent = ctx.start().await;
    ctx.wait_trace(STARTUP).await;
    ctx.relate(&["u/1"]).await;
    let mut expected = STARTUP.to_vec();
    expected.extend(["my-relation-joined u/1 my:0", "my-relation-changed u/1 my:0"]);
    ctx.wait_trace(&expected).await;

    ctx.store.set_unit_life(&ctx.unit, Life::Dead).unwrap();
    assert_eq!(finish(agent).await, Exit::Dead);
    assert_eq!(ctx.trace(), expected);
    assert!(!ctx.in_scope("u/0"));
}

#[tokio::test]
async fn removed_unit_is_an_error() {
    let ctx = Context::new();
    let agent = ctx.start().await;
    ctx.wait_trace(STARTUP).await;

    ctx.store.remove_unit(&ctx.unit);
    let err = timeout(WAIT_TIMEOUT, agent.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.to_string(), "unit \"u/0\" not found");
}
