//! etcd backend.
//!
//! Records are JSON values under [`EtcdConfig::key_prefix`]. Restricted
//! upserts and TAS read the current value, then write it back in a `Txn`
//! guarded by the key's `mod_revision` (or `create_revision == 0` for a new
//! key), retrying when another writer got there first. Cascading deletes
//! remove the parent key and the child prefix in one `Txn`.

mod keys;
mod lock;
mod paging;

pub use lock::EtcdLockProvider;

use std::collections::HashMap;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions, GetResponse, KeyValue,
    TlsOptions, Txn, TxnOp, TxnOpResponse,
};
use parking_lot::RwLock;
use pcs_model::{
    truncate_to_micros, Location, PowerCapOperation, PowerCapTask, PowerStatus,
    PowerStatusComponent, Transition, TransitionTask,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::keys::Keys;
use self::paging::{check_op_count, join, split, StoredTransition};
use crate::config::EtcdConfig;
use crate::error::{validate_xname, StorageError};
use crate::traits::{logger_span, StorageProvider};

/// Read-modify-write rounds before giving up with [`StorageError::ConflictRetry`].
const MAX_CAS_ATTEMPTS: usize = 10;

/// Connect and check the cluster answers, retrying `retry_count` times.
pub(crate) async fn connect(
    config: &EtcdConfig,
    span: &tracing::Span,
) -> Result<Client, StorageError> {
    let mut options = ConnectOptions::new().with_connect_timeout(config.connect_timeout);
    if let (Some(user), Some(password)) = (&config.username, &config.password) {
        options = options.with_user(user.clone(), password.clone());
    }
    if !config.insecure {
        options = options.with_tls(TlsOptions::new());
    }

    let attempts = config.retry_count.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = async {
            let mut client = Client::connect(&config.endpoints, Some(options.clone())).await?;
            client.status().await?;
            Ok::<_, etcd_client::Error>(client)
        }
        .await;
        match result {
            Ok(client) => {
                info!(parent: span, attempt, endpoints = ?config.endpoints, "connected to etcd");
                return Ok(client);
            }
            Err(e) if attempt >= attempts => {
                return Err(StorageError::BackendUnavailable {
                    backend: "etcd",
                    attempts: attempt,
                    source: e.into(),
                });
            }
            Err(e) => {
                warn!(parent: span, attempt, error = %e, wait = ?config.retry_wait, "etcd connection failed, retrying");
                tokio::time::sleep(config.retry_wait).await;
            }
        }
    }
}

fn decode<T: DeserializeOwned>(kv: &KeyValue) -> Result<T, StorageError> {
    serde_json::from_slice(kv.value()).map_err(|e| {
        StorageError::encoding(format!("decode {}", String::from_utf8_lossy(kv.key())), e)
    })
}

fn decode_all<T: DeserializeOwned>(resp: &GetResponse) -> Result<Vec<T>, StorageError> {
    resp.kvs().iter().map(decode).collect()
}

fn with_prefix() -> Option<GetOptions> {
    Some(GetOptions::new().with_prefix())
}

fn delete_prefix() -> Option<DeleteOptions> {
    Some(DeleteOptions::new().with_prefix())
}

/// The `Get` results of a read-only `Txn`, in request order.
fn get_responses(ops: Vec<TxnOpResponse>) -> Vec<GetResponse> {
    ops.into_iter()
        .filter_map(|op| match op {
            TxnOpResponse::Get(resp) => Some(resp),
            _ => None,
        })
        .collect()
}

#[derive(Serialize, Deserialize)]
struct MasterRecord {
    #[serde(with = "time::serde::rfc3339")]
    last_updated: OffsetDateTime,
}

struct Connected {
    client: Client,
    span: tracing::Span,
}

/// [`StorageProvider`] over an etcd v3 cluster.
pub struct EtcdStorage {
    config: EtcdConfig,
    keys: Keys,
    inner: RwLock<Option<Connected>>,
}

impl EtcdStorage {
    pub fn new(config: EtcdConfig) -> Self {
        let keys = Keys::new(&config.key_prefix);
        Self {
            config,
            keys,
            inner: RwLock::new(None),
        }
    }

    fn client(&self) -> Result<Client, StorageError> {
        self.inner
            .read()
            .as_ref()
            .map(|c| c.client.clone())
            .ok_or(StorageError::NotInitialized)
    }

    fn span(&self) -> tracing::Span {
        self.inner
            .read()
            .as_ref()
            .map_or_else(tracing::Span::none, |c| c.span.clone())
    }

    fn encode<T: Serialize>(&self, key: &str, value: &T) -> Result<Vec<u8>, StorageError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StorageError::encoding(format!("encode {key}"), e))?;
        if bytes.len() > self.config.max_value_bytes {
            return Err(StorageError::ConflictRetry {
                key: key.to_string(),
                reason: format!(
                    "encoded value is {} bytes, limit is {}",
                    bytes.len(),
                    self.config.max_value_bytes
                ),
            });
        }
        Ok(bytes)
    }

    /// The decoded value at `key` and its `mod_revision`.
    async fn get_one<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(T, i64)>, StorageError> {
        let mut client = self.client()?;
        let resp = client
            .get(key, None)
            .await
            .map_err(|e| StorageError::transaction(format!("get {key}"), e))?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some((decode(kv)?, kv.mod_revision()))),
            None => Ok(None),
        }
    }

    async fn get_prefix<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StorageError> {
        let mut client = self.client()?;
        let resp = client
            .get(prefix, with_prefix())
            .await
            .map_err(|e| StorageError::transaction(format!("get {prefix}*"), e))?;
        decode_all(&resp)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut client = self.client()?;
        let resp = client
            .get(key, Some(GetOptions::new().with_count_only()))
            .await
            .map_err(|e| StorageError::transaction(format!("get {key}"), e))?;
        Ok(resp.count() > 0)
    }

    async fn txn(&self, context: &str, txn: Txn) -> Result<etcd_client::TxnResponse, StorageError> {
        let mut client = self.client()?;
        client
            .txn(txn)
            .await
            .map_err(|e| StorageError::transaction(context.to_string(), e))
    }

    /// Insert `record`, or fold it into the stored value with `merge`.
    ///
    /// With a `parent`, the write only happens while the parent key exists;
    /// a missing parent is [`StorageError::NotFound`].
    async fn upsert<T>(
        &self,
        key: String,
        record: &T,
        merge: fn(&mut T, &T),
        parent: Option<(String, &'static str, Uuid)>,
    ) -> Result<(), StorageError>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (value, guard) = match self.get_one::<T>(&key).await? {
                Some((mut existing, revision)) => {
                    merge(&mut existing, record);
                    (
                        self.encode(&key, &existing)?,
                        Compare::mod_revision(key.as_str(), CompareOp::Equal, revision),
                    )
                }
                None => (
                    self.encode(&key, record)?,
                    Compare::create_revision(key.as_str(), CompareOp::Equal, 0),
                ),
            };
            let mut compares = vec![guard];
            if let Some((parent_key, ..)) = &parent {
                compares.push(Compare::version(parent_key.as_str(), CompareOp::Greater, 0));
            }

            let txn = Txn::new()
                .when(compares)
                .and_then(vec![TxnOp::put(key.as_str(), value, None)]);
            if self.txn(&format!("store {key}"), txn).await?.succeeded() {
                return Ok(());
            }
            if let Some((parent_key, kind, id)) = &parent {
                if !self.exists(parent_key).await? {
                    return Err(StorageError::not_found(kind, id));
                }
            }
            debug!(parent: &self.span(), %key, "concurrent write, retrying upsert");
        }
        Err(StorageError::ConflictRetry {
            key,
            reason: format!("value changed underneath {MAX_CAS_ATTEMPTS} consecutive writes"),
        })
    }

    /// The stored record, its revision and the overflow pages, read atomically.
    async fn read_transition(
        &self,
        id: Uuid,
    ) -> Result<Option<(StoredTransition, Vec<Vec<Location>>)>, StorageError> {
        let txn = Txn::new().and_then(vec![
            TxnOp::get(self.keys.transition(id), None),
            TxnOp::get(self.keys.transition_pages(id), with_prefix()),
        ]);
        let resp = self.txn(&format!("get transition {id}"), txn).await?;
        let gets = get_responses(resp.op_responses());
        let [head, pages] = gets.as_slice() else {
            return Err(StorageError::transaction(
                format!("get transition {id}"),
                "unexpected transaction response shape",
            ));
        };
        let Some(kv) = head.kvs().first() else {
            return Ok(None);
        };
        Ok(Some((decode(kv)?, decode_all(pages)?)))
    }
}

#[async_trait]
impl StorageProvider for EtcdStorage {
    async fn init(&self, logger: Option<tracing::Span>) -> Result<(), StorageError> {
        let span = logger_span(logger, "etcd");
        let client = connect(&self.config, &span).await?;
        *self.inner.write() = Some(Connected { client, span });
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut client = self.client()?;
        client
            .status()
            .await
            .map_err(|e| StorageError::transaction("ping etcd", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let connected = self.inner.write().take().ok_or(StorageError::NotInitialized)?;
        debug!(parent: &connected.span, "closed etcd client");
        Ok(())
    }

    // ── Power status ─────────────────────────────────────────────────────────

    async fn get_power_status_master(&self) -> Result<OffsetDateTime, StorageError> {
        self.get_one::<MasterRecord>(&self.keys.power_status_master())
            .await?
            .map(|(master, _)| master.last_updated)
            .ok_or_else(|| StorageError::not_found("power status master", "singleton"))
    }

    async fn store_power_status_master(
        &self,
        last_updated: OffsetDateTime,
    ) -> Result<(), StorageError> {
        let key = self.keys.power_status_master();
        let last_updated = truncate_to_micros(last_updated);
        let value = self.encode(&key, &MasterRecord { last_updated })?;
        let mut client = self.client()?;
        client
            .put(key, value, None)
            .await
            .map_err(|e| StorageError::transaction("store power status master", e))?;
        Ok(())
    }

    async fn tas_power_status_master(
        &self,
        new: OffsetDateTime,
        expected: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        let key = self.keys.power_status_master();
        let (new, expected) = (truncate_to_micros(new), truncate_to_micros(expected));
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (current, revision) = self
                .get_one::<MasterRecord>(&key)
                .await?
                .ok_or_else(|| StorageError::not_found("power status master", "singleton"))?;
            if current.last_updated != expected {
                return Ok(false);
            }
            let value = self.encode(&key, &MasterRecord { last_updated: new })?;
            let txn = Txn::new()
                .when(vec![Compare::mod_revision(key.as_str(), CompareOp::Equal, revision)])
                .and_then(vec![TxnOp::put(key.as_str(), value, None)]);
            if self.txn("test-and-set power status master", txn).await?.succeeded() {
                return Ok(true);
            }
        }
        Err(StorageError::ConflictRetry {
            key,
            reason: format!("value changed underneath {MAX_CAS_ATTEMPTS} consecutive writes"),
        })
    }

    async fn store_power_status(
        &self,
        component: PowerStatusComponent,
    ) -> Result<(), StorageError> {
        validate_xname(&component.xname)?;
        let component = component.at_storage_precision();
        let key = self.keys.power_status(&component.xname);
        let value = self.encode(&key, &component)?;
        let mut client = self.client()?;
        client.put(key, value, None).await.map_err(|e| {
            StorageError::transaction(format!("store power status {}", component.xname), e)
        })?;
        Ok(())
    }

    async fn get_power_status(&self, xname: &str) -> Result<PowerStatusComponent, StorageError> {
        validate_xname(xname)?;
        self.get_one::<PowerStatusComponent>(&self.keys.power_status(xname))
            .await?
            .map(|(component, _)| component)
            .ok_or_else(|| StorageError::not_found("power status component", xname))
    }

    async fn delete_power_status(&self, xname: &str) -> Result<(), StorageError> {
        validate_xname(xname)?;
        let mut client = self.client()?;
        client
            .delete(self.keys.power_status(xname), None)
            .await
            .map_err(|e| StorageError::transaction(format!("delete power status {xname}"), e))?;
        Ok(())
    }

    async fn get_all_power_status(&self) -> Result<PowerStatus, StorageError> {
        Ok(PowerStatus {
            status: self.get_prefix(&self.keys.power_status_prefix("")).await?,
        })
    }

    async fn get_power_status_hierarchy(&self, xname: &str) -> Result<PowerStatus, StorageError> {
        validate_xname(xname)?;
        Ok(PowerStatus {
            status: self.get_prefix(&self.keys.power_status_prefix(xname)).await?,
        })
    }

    // ── Power capping ────────────────────────────────────────────────────────

    async fn store_power_cap_task(&self, task: PowerCapTask) -> Result<(), StorageError> {
        let task = task.at_storage_precision();
        let key = self.keys.power_cap_task(task.task_id);
        self.upsert(key, &task, PowerCapTask::apply_update, None).await
    }

    async fn store_power_cap_operation(&self, op: PowerCapOperation) -> Result<(), StorageError> {
        let key = self.keys.power_cap_op(op.task_id, op.operation_id);
        let parent = (self.keys.power_cap_task(op.task_id), "power cap task", op.task_id);
        self.upsert(key, &op, PowerCapOperation::apply_update, Some(parent))
            .await
    }

    async fn get_power_cap_task(&self, task_id: Uuid) -> Result<PowerCapTask, StorageError> {
        self.get_one::<PowerCapTask>(&self.keys.power_cap_task(task_id))
            .await?
            .map(|(task, _)| task)
            .ok_or_else(|| StorageError::not_found("power cap task", task_id))
    }

    async fn get_power_cap_operation(
        &self,
        task_id: Uuid,
        operation_id: Uuid,
    ) -> Result<PowerCapOperation, StorageError> {
        self.get_one::<PowerCapOperation>(&self.keys.power_cap_op(task_id, operation_id))
            .await?
            .map(|(op, _)| op)
            .ok_or_else(|| StorageError::not_found("power cap operation", operation_id))
    }

    async fn get_all_power_cap_operations_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<PowerCapOperation>, StorageError> {
        self.get_prefix(&self.keys.power_cap_ops(task_id)).await
    }

    async fn get_all_power_cap_tasks(&self) -> Result<Vec<PowerCapTask>, StorageError> {
        self.get_prefix(&self.keys.power_cap_tasks()).await
    }

    async fn delete_power_cap_task(&self, task_id: Uuid) -> Result<(), StorageError> {
        let txn = Txn::new().and_then(vec![
            TxnOp::delete(self.keys.power_cap_task(task_id), None),
            TxnOp::delete(self.keys.power_cap_ops(task_id), delete_prefix()),
        ]);
        self.txn(&format!("delete power cap task {task_id}"), txn)
            .await?;
        Ok(())
    }

    async fn delete_power_cap_operation(
        &self,
        task_id: Uuid,
        operation_id: Uuid,
    ) -> Result<(), StorageError> {
        let mut client = self.client()?;
        client
            .delete(self.keys.power_cap_op(task_id, operation_id), None)
            .await
            .map_err(|e| {
                StorageError::transaction(format!("delete power cap operation {operation_id}"), e)
            })?;
        Ok(())
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    async fn store_transition(&self, transition: Transition) -> Result<(), StorageError> {
        let transition = transition.at_storage_precision();
        let id = transition.transition_id;
        let key = self.keys.transition(id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let txn = match self.get_one::<StoredTransition>(&key).await? {
                Some((mut stored, revision)) => {
                    // Only the record key changes; locations live on unchanged pages.
                    stored.transition.apply_update(&transition);
                    let value = self.encode(&key, &stored)?;
                    Txn::new()
                        .when(vec![Compare::mod_revision(key.as_str(), CompareOp::Equal, revision)])
                        .and_then(vec![TxnOp::put(key.as_str(), value, None)])
                }
                None => {
                    let paged = split(&transition, self.config.page_size);
                    check_op_count(&key, 1 + paged.overflow.len())?;
                    let mut puts = vec![TxnOp::put(key.as_str(), self.encode(&key, &paged.head)?, None)];
                    for (n, page) in paged.overflow.iter().enumerate() {
                        let page_key = self.keys.transition_page(id, n + 1);
                        let value = self.encode(&page_key, page)?;
                        puts.push(TxnOp::put(page_key, value, None));
                    }
                    Txn::new()
                        .when(vec![Compare::create_revision(key.as_str(), CompareOp::Equal, 0)])
                        .and_then(puts)
                }
            };
            if self.txn(&format!("store transition {id}"), txn).await?.succeeded() {
                return Ok(());
            }
            debug!(parent: &self.span(), transition = %id, "concurrent write, retrying store");
        }
        Err(StorageError::ConflictRetry {
            key,
            reason: format!("value changed underneath {MAX_CAS_ATTEMPTS} consecutive writes"),
        })
    }

    async fn store_transition_task(&self, task: TransitionTask) -> Result<(), StorageError> {
        let key = self.keys.transition_task(task.transition_id, task.task_id);
        self.upsert(key, &task, TransitionTask::apply_update, None).await
    }

    async fn get_transition(
        &self,
        transition_id: Uuid,
    ) -> Result<(Transition, Transition), StorageError> {
        let (stored, pages) = self
            .read_transition(transition_id)
            .await?
            .ok_or_else(|| StorageError::not_found("transition", transition_id))?;
        let full = join(&stored, pages)?;
        Ok((full, stored.transition))
    }

    async fn get_transition_task(
        &self,
        transition_id: Uuid,
        task_id: Uuid,
    ) -> Result<TransitionTask, StorageError> {
        self.get_one::<TransitionTask>(&self.keys.transition_task(transition_id, task_id))
            .await?
            .map(|(task, _)| task)
            .ok_or_else(|| StorageError::not_found("transition task", task_id))
    }

    async fn get_all_tasks_for_transition(
        &self,
        transition_id: Uuid,
    ) -> Result<Vec<TransitionTask>, StorageError> {
        self.get_prefix(&self.keys.transition_tasks(transition_id))
            .await
    }

    async fn get_all_transitions(&self) -> Result<Vec<Transition>, StorageError> {
        let txn = Txn::new().and_then(vec![
            TxnOp::get(self.keys.transitions(), with_prefix()),
            TxnOp::get(self.keys.all_transition_pages(), with_prefix()),
        ]);
        let resp = self.txn("get all transitions", txn).await?;
        let gets = get_responses(resp.op_responses());
        let [heads, pages] = gets.as_slice() else {
            return Err(StorageError::transaction(
                "get all transitions",
                "unexpected transaction response shape",
            ));
        };

        // Range results are sorted by key, so each owner's pages arrive in order.
        let mut pages_by_owner: HashMap<Uuid, Vec<Vec<Location>>> = HashMap::new();
        for kv in pages.kvs() {
            let key = String::from_utf8_lossy(kv.key());
            if let Some(owner) = self.keys.page_owner(&key) {
                pages_by_owner.entry(owner).or_default().push(decode(kv)?);
            }
        }

        heads
            .kvs()
            .iter()
            .map(|kv| {
                let stored: StoredTransition = decode(kv)?;
                let pages = pages_by_owner
                    .remove(&stored.transition.transition_id)
                    .unwrap_or_default();
                join(&stored, pages)
            })
            .collect()
    }

    async fn delete_transition(&self, transition_id: Uuid) -> Result<(), StorageError> {
        let txn = Txn::new().and_then(vec![
            TxnOp::delete(self.keys.transition(transition_id), None),
            TxnOp::delete(self.keys.transition_pages(transition_id), delete_prefix()),
            TxnOp::delete(self.keys.transition_tasks(transition_id), delete_prefix()),
        ]);
        self.txn(&format!("delete transition {transition_id}"), txn)
            .await?;
        Ok(())
    }

    async fn delete_transition_task(
        &self,
        transition_id: Uuid,
        task_id: Uuid,
    ) -> Result<(), StorageError> {
        let mut client = self.client()?;
        client
            .delete(self.keys.transition_task(transition_id, task_id), None)
            .await
            .map_err(|e| StorageError::transaction(format!("delete transition task {task_id}"), e))?;
        Ok(())
    }

    async fn tas_transition(
        &self,
        new: Transition,
        expected: Transition,
    ) -> Result<bool, StorageError> {
        let (new, expected) = (new.at_storage_precision(), expected.at_storage_precision());
        let id = new.transition_id;
        let key = self.keys.transition(id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut stored, revision) = self
                .get_one::<StoredTransition>(&key)
                .await?
                .ok_or_else(|| StorageError::not_found("transition", id))?;
            if !expected.matches_ignoring_location(&stored.transition) {
                return Ok(false);
            }
            stored.transition.apply_update(&new);
            let value = self.encode(&key, &stored)?;
            let txn = Txn::new()
                .when(vec![Compare::mod_revision(key.as_str(), CompareOp::Equal, revision)])
                .and_then(vec![TxnOp::put(key.as_str(), value, None)]);
            if self.txn(&format!("test-and-set transition {id}"), txn).await?.succeeded() {
                return Ok(true);
            }
            debug!(parent: &self.span(), transition = %id, "record moved during test-and-set, re-reading");
        }
        Err(StorageError::ConflictRetry {
            key,
            reason: format!("value changed underneath {MAX_CAS_ATTEMPTS} consecutive writes"),
        })
    }
}
