//! End-to-end tests of the Me subsystem.
//!
//! Every test runs several complete backends in one process. Devices talk
//! through a shared [`Hub`], which the tests partition and heal to model
//! network failures. Timers are shortened so that elections, init-me-info
//! rounds and oplog anti-entropy finish within a few hundred milliseconds.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p kith-integration-tests -- --ignored
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kith_me::master_oplog::MasterOp;
use kith_me::{Backend, MeConfig, MyNode, Services};
use kith_transport::Hub;
use kith_types::{EntityId, ListOrder, NodeId, Status};

/// How long a scenario step may take before the test gives up.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(15);

const POLL: Duration = Duration::from_millis(25);

/// Log to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A directory removed on drop.
#[derive(Debug)]
pub struct TempDir(PathBuf);

impl TempDir {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(format!("kith-it-{name}-{}", kith_types::Id::random().to_hex()));
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Settings with every period shortened for tests.
pub fn fast_config(dir: &Path, name: &str) -> MeConfig {
    let mut config = MeConfig::new(dir);
    config.node_name = name.to_string();
    config.name = name.to_string();
    config.raft_tick_ms = 10;
    config.lead_retry_ms = 50;
    config.lead_attempts = 100;
    config.init_me_info_ms = 100;
    config.join_sync_ms = 100;
    config.oplog_sync_ms = 200;
    config.pending_sync_ms = 100;
    config
}

/// One device: a started backend and its data directory.
pub struct Device {
    pub name: String,
    pub backend: Arc<Backend>,
    pub node_id: NodeId,
    pub config: MeConfig,
    _dir: TempDir,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Start a device on `hub` with a fresh data directory.
    ///
    /// The device creates its own identity; use [`Device::wait_alive`]
    /// before driving it.
    pub fn start(hub: &Arc<Hub>, name: &str) -> kith_me::Result<Self> {
        let dir = TempDir::new(name)?;
        let config = fast_config(dir.path(), name);
        let node_id = Backend::load_node_id(&config)?;
        let (endpoint, incoming) = hub.connect(node_id);
        let backend = Backend::new(config.clone(), Arc::new(endpoint), incoming, Services::memory())?;
        backend.start()?;
        Ok(Self {
            name: name.to_string(),
            backend,
            node_id,
            config,
            _dir: dir,
        })
    }

    /// Id of the current identity, if one is running.
    pub fn id(&self) -> Option<EntityId> {
        self.backend.me().ok().map(|me| me.id())
    }

    pub fn status(&self) -> Option<Status> {
        self.backend.me().ok().map(|me| me.status())
    }

    /// Wait until the current identity is alive.
    pub async fn wait_alive(&self) -> bool {
        wait_until(|| self.status() == Some(Status::Alive)).await
    }

    /// Wait until the current identity is `id` and alive.
    pub async fn wait_alive_as(&self, id: EntityId) -> bool {
        wait_until(|| self.id() == Some(id) && self.status() == Some(Status::Alive)).await
    }

    /// Device record of `node` as seen by the current identity.
    pub fn my_node(&self, node: &NodeId) -> Option<MyNode> {
        self.backend.me().ok().and_then(|me| me.my_node(node))
    }

    /// Node ids of the devices recorded for the current identity, sorted.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .backend
            .get_my_nodes()
            .unwrap_or_default()
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        ids.sort();
        ids
    }

    /// Newest raft index with a master oplog.
    pub fn newest_master_index(&self) -> Option<u64> {
        self.backend
            .get_my_master_oplog_list(None, 1, ListOrder::Desc)
            .ok()
            .and_then(|logs| logs.first().and_then(|log| log.id.master_index()))
    }

    /// Whether a master oplog of kind `op` was written.
    pub fn has_master_op(&self, op: MasterOp) -> bool {
        self.backend
            .get_my_master_oplog_list(None, 100, ListOrder::Asc)
            .is_ok_and(|logs| logs.iter().any(|log| log.op == op))
    }

    pub fn stop(&self) {
        self.backend.stop();
    }
}

/// Poll `check` until it holds or [`STEP_TIMEOUT`] runs out.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    check()
}

/// Poll an async `check` until it holds or [`STEP_TIMEOUT`] runs out.
pub async fn wait_until_async<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(POLL).await;
    }
    check().await
}

/// Bring `guest` into the identity of `host` and wait until it is alive there.
pub async fn pair(host: &Device, guest: &Device) -> kith_me::Result<bool> {
    let id = host.id().ok_or_else(|| kith_me::MeError::InvalidMe(format!("{} has no identity", host.name)))?;
    let url = host.backend.show_me_url()?;
    guest.backend.join_me(&url, &host.backend.show_validate_key())?;
    let joined = guest.wait_alive_as(id).await
        && wait_until(|| host.my_node(&guest.node_id).is_some_and(|n| n.status >= Status::Sync)).await;
    Ok(joined)
}
