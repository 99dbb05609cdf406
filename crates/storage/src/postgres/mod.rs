//! PostgreSQL backend.
//!
//! The schema is created outside this crate; `tests/fixtures/postgres_schema.sql`
//! holds the layout these queries expect. Restricted upserts are expressed
//! as `ON CONFLICT ... DO UPDATE` clauses naming only the mutable columns,
//! and TAS runs `SELECT ... FOR UPDATE` in one transaction.

mod lock;
mod rows;

pub use lock::{lock_ids, AdvisoryLock, PostgresLockProvider};

use async_trait::async_trait;
use parking_lot::RwLock;
use pcs_model::{
    truncate_to_micros, ModelError, PowerCapOperation, PowerCapTask, PowerStatus,
    PowerStatusComponent, Transition, TransitionTask,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::rows::{
    PowerCapOperationRow, PowerCapTaskRow, PowerStatusRow, TransitionRow, TransitionTaskRow,
};
use crate::config::PostgresConfig;
use crate::error::{validate_xname, StorageError};
use crate::traits::{logger_span, StorageProvider};

const POWER_STATUS_COLUMNS: &str =
    "xname, power_state, management_state, supported_power_transitions, error, last_updated";

const TRANSITION_COLUMNS: &str = "id, operation, task_deadline, create_time, last_active_time, \
     automatic_expiration_time, location, status, task_ids";

const TASK_COLUMNS: &str = "id, transition_id, operation, state, xname, reservation_key, \
     deputy_key, status, status_desc, error";

const POWER_CAP_TASK_COLUMNS: &str = "id, type, snapshot_parameters, patch_parameters, \
     task_create_time, automatic_expiration_time, task_status, operation_ids, is_compressed, \
     task_counts, components";

const POWER_CAP_OP_COLUMNS: &str = "id, power_cap_task_id, type, status, component";

fn connect_options(config: &PostgresConfig) -> Result<PgConnectOptions, StorageError> {
    // A URL carries its own sslmode; `insecure` only applies to the field form.
    if let Some(url) = &config.conn_str {
        return url
            .parse::<PgConnectOptions>()
            .map_err(|e| StorageError::BackendUnavailable {
                backend: "postgres",
                attempts: 0,
                source: e.into(),
            });
    }
    let ssl_mode = if config.insecure {
        PgSslMode::Disable
    } else {
        PgSslMode::VerifyFull
    };
    Ok(PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.dbname)
        .ssl_mode(ssl_mode))
}

/// Open a pool, retrying `retry_count` times `retry_wait` apart.
pub(crate) async fn connect(
    config: &PostgresConfig,
    span: &tracing::Span,
) -> Result<PgPool, StorageError> {
    let options = connect_options(config)?;
    let attempts = config.retry_count.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options.clone())
            .await;
        match result {
            Ok(pool) => {
                info!(parent: span, attempt, "connected to postgres");
                return Ok(pool);
            }
            Err(e) if attempt >= attempts => {
                return Err(StorageError::BackendUnavailable {
                    backend: "postgres",
                    attempts: attempt,
                    source: e.into(),
                });
            }
            Err(e) => {
                warn!(parent: span, attempt, error = %e, wait = ?config.retry_wait, "postgres connection failed, retrying");
                tokio::time::sleep(config.retry_wait).await;
            }
        }
    }
}

fn decode<R, T>(row: R, kind: &'static str, id: impl ToString) -> Result<T, StorageError>
where
    T: TryFrom<R, Error = ModelError>,
{
    T::try_from(row)
        .map_err(|e| StorageError::transaction(format!("decode {kind} {}", id.to_string()), e))
}

fn decode_all<R, T>(rows: Vec<R>, kind: &'static str) -> Result<Vec<T>, StorageError>
where
    T: TryFrom<R, Error = ModelError>,
{
    rows.into_iter()
        .map(|row| T::try_from(row).map_err(|e| StorageError::transaction(format!("decode {kind}"), e)))
        .collect()
}

struct Connected {
    pool: PgPool,
    span: tracing::Span,
}

/// [`StorageProvider`] over a PostgreSQL connection pool.
pub struct PostgresStorage {
    config: PostgresConfig,
    inner: RwLock<Option<Connected>>,
}

impl PostgresStorage {
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(None),
        }
    }

    fn pool(&self) -> Result<PgPool, StorageError> {
        self.inner
            .read()
            .as_ref()
            .map(|c| c.pool.clone())
            .ok_or(StorageError::NotInitialized)
    }

    fn span(&self) -> tracing::Span {
        self.inner
            .read()
            .as_ref()
            .map_or_else(tracing::Span::none, |c| c.span.clone())
    }
}

#[async_trait]
impl StorageProvider for PostgresStorage {
    async fn init(&self, logger: Option<tracing::Span>) -> Result<(), StorageError> {
        let span = logger_span(logger, "postgres");
        let pool = connect(&self.config, &span).await?;
        let previous = self.inner.write().replace(Connected { pool, span });
        if let Some(previous) = previous {
            previous.pool.close().await;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let pool = self.pool()?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| StorageError::transaction("ping postgres", e))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let connected = self.inner.write().take().ok_or(StorageError::NotInitialized)?;
        connected.pool.close().await;
        debug!(parent: &connected.span, "closed postgres pool");
        Ok(())
    }

    // ── Power status ─────────────────────────────────────────────────────────

    async fn get_power_status_master(&self) -> Result<OffsetDateTime, StorageError> {
        let pool = self.pool()?;
        sqlx::query_scalar::<_, OffsetDateTime>(
            "SELECT last_updated FROM power_status_master WHERE id",
        )
        .fetch_optional(&pool)
        .await
        .map_err(|e| StorageError::transaction("get power status master", e))?
        .ok_or_else(|| StorageError::not_found("power status master", "singleton"))
    }

    async fn store_power_status_master(
        &self,
        last_updated: OffsetDateTime,
    ) -> Result<(), StorageError> {
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO power_status_master (id, last_updated) VALUES (TRUE, $1) \
             ON CONFLICT (id) DO UPDATE SET last_updated = EXCLUDED.last_updated",
        )
        .bind(truncate_to_micros(last_updated))
        .execute(&pool)
        .await
        .map_err(|e| StorageError::transaction("store power status master", e))?;
        Ok(())
    }

    async fn tas_power_status_master(
        &self,
        new: OffsetDateTime,
        expected: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        let pool = self.pool()?;
        let fail = |e: sqlx::Error| StorageError::transaction("test-and-set power status master", e);
        let mut tx = pool.begin().await.map_err(fail)?;

        let current = sqlx::query_scalar::<_, OffsetDateTime>(
            "SELECT last_updated FROM power_status_master WHERE id FOR UPDATE",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(fail)?;
        let Some(current) = current else {
            tx.rollback().await.map_err(fail)?;
            return Err(StorageError::not_found("power status master", "singleton"));
        };
        if current != truncate_to_micros(expected) {
            tx.rollback().await.map_err(fail)?;
            return Ok(false);
        }

        sqlx::query("UPDATE power_status_master SET last_updated = $1 WHERE id")
            .bind(truncate_to_micros(new))
            .execute(&mut *tx)
            .await
            .map_err(fail)?;
        tx.commit().await.map_err(fail)?;
        Ok(true)
    }

    async fn store_power_status(
        &self,
        component: PowerStatusComponent,
    ) -> Result<(), StorageError> {
        validate_xname(&component.xname)?;
        let component = component.at_storage_precision();
        let pool = self.pool()?;
        sqlx::query(&format!(
            "INSERT INTO power_status_component ({POWER_STATUS_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (xname) DO UPDATE SET \
             power_state = EXCLUDED.power_state, \
             management_state = EXCLUDED.management_state, \
             supported_power_transitions = EXCLUDED.supported_power_transitions, \
             error = EXCLUDED.error, \
             last_updated = EXCLUDED.last_updated"
        ))
        .bind(&component.xname)
        .bind(component.power_state.as_str())
        .bind(component.management_state.as_str())
        .bind(&component.supported_power_transitions)
        .bind(&component.error)
        .bind(component.last_updated)
        .execute(&pool)
        .await
        .map_err(|e| {
            StorageError::transaction(format!("store power status {}", component.xname), e)
        })?;
        Ok(())
    }

    async fn get_power_status(&self, xname: &str) -> Result<PowerStatusComponent, StorageError> {
        validate_xname(xname)?;
        let pool = self.pool()?;
        let row = sqlx::query_as::<_, PowerStatusRow>(&format!(
            "SELECT {POWER_STATUS_COLUMNS} FROM power_status_component WHERE xname = $1"
        ))
        .bind(xname)
        .fetch_optional(&pool)
        .await
        .map_err(|e| StorageError::transaction(format!("get power status {xname}"), e))?
        .ok_or_else(|| StorageError::not_found("power status component", xname))?;
        decode(row, "power status component", xname)
    }

    async fn delete_power_status(&self, xname: &str) -> Result<(), StorageError> {
        validate_xname(xname)?;
        let pool = self.pool()?;
        sqlx::query("DELETE FROM power_status_component WHERE xname = $1")
            .bind(xname)
            .execute(&pool)
            .await
            .map_err(|e| StorageError::transaction(format!("delete power status {xname}"), e))?;
        Ok(())
    }

    async fn get_all_power_status(&self) -> Result<PowerStatus, StorageError> {
        let pool = self.pool()?;
        let rows = sqlx::query_as::<_, PowerStatusRow>(&format!(
            "SELECT {POWER_STATUS_COLUMNS} FROM power_status_component ORDER BY xname"
        ))
        .fetch_all(&pool)
        .await
        .map_err(|e| StorageError::transaction("get all power status", e))?;
        Ok(PowerStatus {
            status: decode_all(rows, "power status component")?,
        })
    }

    async fn get_power_status_hierarchy(&self, xname: &str) -> Result<PowerStatus, StorageError> {
        // Valid xnames contain no LIKE metacharacters.
        validate_xname(xname)?;
        let pool = self.pool()?;
        let rows = sqlx::query_as::<_, PowerStatusRow>(&format!(
            "SELECT {POWER_STATUS_COLUMNS} FROM power_status_component \
             WHERE xname LIKE $1 || '%' ORDER BY xname"
        ))
        .bind(xname)
        .fetch_all(&pool)
        .await
        .map_err(|e| StorageError::transaction(format!("get power status hierarchy {xname}"), e))?;
        Ok(PowerStatus {
            status: decode_all(rows, "power status component")?,
        })
    }

    // ── Power capping ────────────────────────────────────────────────────────

    async fn store_power_cap_task(&self, task: PowerCapTask) -> Result<(), StorageError> {
        let task = task.at_storage_precision();
        let pool = self.pool()?;
        sqlx::query(&format!(
            "INSERT INTO power_cap_tasks ({POWER_CAP_TASK_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (id) DO UPDATE SET \
             task_status = EXCLUDED.task_status, \
             operation_ids = EXCLUDED.operation_ids, \
             is_compressed = EXCLUDED.is_compressed, \
             task_counts = EXCLUDED.task_counts, \
             components = EXCLUDED.components"
        ))
        .bind(task.task_id)
        .bind(task.task_type.as_str())
        .bind(task.snapshot_parameters.as_ref().map(Json))
        .bind(task.patch_parameters.as_ref().map(Json))
        .bind(task.task_create_time)
        .bind(task.automatic_expiration_time)
        .bind(task.task_status.as_str())
        .bind(&task.operation_ids)
        .bind(task.is_compressed)
        .bind(Json(&task.task_counts))
        .bind(Json(&task.components))
        .execute(&pool)
        .await
        .map_err(|e| StorageError::transaction(format!("store power cap task {}", task.task_id), e))?;
        Ok(())
    }

    async fn store_power_cap_operation(&self, op: PowerCapOperation) -> Result<(), StorageError> {
        let pool = self.pool()?;
        let result = sqlx::query(&format!(
            "INSERT INTO power_cap_operations ({POWER_CAP_OP_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET \
             status = EXCLUDED.status, \
             component = EXCLUDED.component"
        ))
        .bind(op.operation_id)
        .bind(op.task_id)
        .bind(&op.op_type)
        .bind(op.status.as_str())
        .bind(Json(&op.component))
        .execute(&pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Err(StorageError::not_found("power cap task", op.task_id))
            }
            Err(e) => Err(StorageError::transaction(
                format!("store power cap operation {}", op.operation_id),
                e,
            )),
        }
    }

    async fn get_power_cap_task(&self, task_id: Uuid) -> Result<PowerCapTask, StorageError> {
        let pool = self.pool()?;
        let row = sqlx::query_as::<_, PowerCapTaskRow>(&format!(
            "SELECT {POWER_CAP_TASK_COLUMNS} FROM power_cap_tasks WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| StorageError::transaction(format!("get power cap task {task_id}"), e))?
        .ok_or_else(|| StorageError::not_found("power cap task", task_id))?;
        decode(row, "power cap task", task_id)
    }

    async fn get_power_cap_operation(
        &self,
        task_id: Uuid,
        operation_id: Uuid,
    ) -> Result<PowerCapOperation, StorageError> {
        let pool = self.pool()?;
        let row = sqlx::query_as::<_, PowerCapOperationRow>(&format!(
            "SELECT {POWER_CAP_OP_COLUMNS} FROM power_cap_operations \
             WHERE id = $1 AND power_cap_task_id = $2"
        ))
        .bind(operation_id)
        .bind(task_id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            StorageError::transaction(format!("get power cap operation {operation_id}"), e)
        })?
        .ok_or_else(|| StorageError::not_found("power cap operation", operation_id))?;
        decode(row, "power cap operation", operation_id)
    }

    async fn get_all_power_cap_operations_for_task(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<PowerCapOperation>, StorageError> {
        let pool = self.pool()?;
        let rows = sqlx::query_as::<_, PowerCapOperationRow>(&format!(
            "SELECT {POWER_CAP_OP_COLUMNS} FROM power_cap_operations \
             WHERE power_cap_task_id = $1 ORDER BY id"
        ))
        .bind(task_id)
        .fetch_all(&pool)
        .await
        .map_err(|e| {
            StorageError::transaction(format!("get power cap operations for task {task_id}"), e)
        })?;
        decode_all(rows, "power cap operation")
    }

    async fn get_all_power_cap_tasks(&self) -> Result<Vec<PowerCapTask>, StorageError> {
        let pool = self.pool()?;
        let rows = sqlx::query_as::<_, PowerCapTaskRow>(&format!(
            "SELECT {POWER_CAP_TASK_COLUMNS} FROM power_cap_tasks ORDER BY task_create_time"
        ))
        .fetch_all(&pool)
        .await
        .map_err(|e| StorageError::transaction("get all power cap tasks", e))?;
        decode_all(rows, "power cap task")
    }

    async fn delete_power_cap_task(&self, task_id: Uuid) -> Result<(), StorageError> {
        let pool = self.pool()?;
        let fail = |e: sqlx::Error| StorageError::transaction(format!("delete power cap task {task_id}"), e);
        let mut tx = pool.begin().await.map_err(fail)?;
        sqlx::query("DELETE FROM power_cap_operations WHERE power_cap_task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(fail)?;
        sqlx::query("DELETE FROM power_cap_tasks WHERE id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(fail)?;
        tx.commit().await.map_err(fail)?;
        Ok(())
    }

    async fn delete_power_cap_operation(
        &self,
        task_id: Uuid,
        operation_id: Uuid,
    ) -> Result<(), StorageError> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM power_cap_operations WHERE id = $1 AND power_cap_task_id = $2")
            .bind(operation_id)
            .bind(task_id)
            .execute(&pool)
            .await
            .map_err(|e| {
                StorageError::transaction(format!("delete power cap operation {operation_id}"), e)
            })?;
        Ok(())
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    async fn store_transition(&self, transition: Transition) -> Result<(), StorageError> {
        let transition = transition.at_storage_precision();
        let pool = self.pool()?;
        sqlx::query(&format!(
            "INSERT INTO transitions ({TRANSITION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET \
             status = EXCLUDED.status, \
             last_active_time = EXCLUDED.last_active_time"
        ))
        .bind(transition.transition_id)
        .bind(transition.operation.as_str())
        .bind(transition.task_deadline)
        .bind(transition.create_time)
        .bind(transition.last_active_time)
        .bind(transition.automatic_expiration_time)
        .bind(Json(&transition.location))
        .bind(transition.status.as_str())
        .bind(&transition.task_ids)
        .execute(&pool)
        .await
        .map_err(|e| {
            StorageError::transaction(format!("store transition {}", transition.transition_id), e)
        })?;
        Ok(())
    }

    async fn store_transition_task(&self, task: TransitionTask) -> Result<(), StorageError> {
        let pool = self.pool()?;
        sqlx::query(&format!(
            "INSERT INTO transition_tasks ({TASK_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (id) DO UPDATE SET \
             state = EXCLUDED.state, \
             status = EXCLUDED.status, \
             status_desc = EXCLUDED.status_desc, \
             error = EXCLUDED.error"
        ))
        .bind(task.task_id)
        .bind(task.transition_id)
        .bind(task.operation.as_str())
        .bind(task.state.as_str())
        .bind(&task.xname)
        .bind(&task.reservation_key)
        .bind(&task.deputy_key)
        .bind(task.status.as_str())
        .bind(&task.status_desc)
        .bind(&task.error)
        .execute(&pool)
        .await
        .map_err(|e| StorageError::transaction(format!("store transition task {}", task.task_id), e))?;
        Ok(())
    }

    async fn get_transition(
        &self,
        transition_id: Uuid,
    ) -> Result<(Transition, Transition), StorageError> {
        let pool = self.pool()?;
        let row = sqlx::query_as::<_, TransitionRow>(&format!(
            "SELECT {TRANSITION_COLUMNS} FROM transitions WHERE id = $1"
        ))
        .bind(transition_id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| StorageError::transaction(format!("get transition {transition_id}"), e))?
        .ok_or_else(|| StorageError::not_found("transition", transition_id))?;
        let transition: Transition = decode(row, "transition", transition_id)?;
        Ok((transition.clone(), transition))
    }

    async fn get_transition_task(
        &self,
        transition_id: Uuid,
        task_id: Uuid,
    ) -> Result<TransitionTask, StorageError> {
        let pool = self.pool()?;
        let row = sqlx::query_as::<_, TransitionTaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM transition_tasks WHERE id = $1 AND transition_id = $2"
        ))
        .bind(task_id)
        .bind(transition_id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| StorageError::transaction(format!("get transition task {task_id}"), e))?
        .ok_or_else(|| StorageError::not_found("transition task", task_id))?;
        decode(row, "transition task", task_id)
    }

    async fn get_all_tasks_for_transition(
        &self,
        transition_id: Uuid,
    ) -> Result<Vec<TransitionTask>, StorageError> {
        let pool = self.pool()?;
        let rows = sqlx::query_as::<_, TransitionTaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM transition_tasks WHERE transition_id = $1 ORDER BY id"
        ))
        .bind(transition_id)
        .fetch_all(&pool)
        .await
        .map_err(|e| {
            StorageError::transaction(format!("get tasks for transition {transition_id}"), e)
        })?;
        decode_all(rows, "transition task")
    }

    async fn get_all_transitions(&self) -> Result<Vec<Transition>, StorageError> {
        let pool = self.pool()?;
        let rows = sqlx::query_as::<_, TransitionRow>(&format!(
            "SELECT {TRANSITION_COLUMNS} FROM transitions ORDER BY create_time"
        ))
        .fetch_all(&pool)
        .await
        .map_err(|e| StorageError::transaction("get all transitions", e))?;
        decode_all(rows, "transition")
    }

    async fn delete_transition(&self, transition_id: Uuid) -> Result<(), StorageError> {
        let pool = self.pool()?;
        let fail =
            |e: sqlx::Error| StorageError::transaction(format!("delete transition {transition_id}"), e);
        let mut tx = pool.begin().await.map_err(fail)?;
        sqlx::query("DELETE FROM transition_tasks WHERE transition_id = $1")
            .bind(transition_id)
            .execute(&mut *tx)
            .await
            .map_err(fail)?;
        sqlx::query("DELETE FROM transitions WHERE id = $1")
            .bind(transition_id)
            .execute(&mut *tx)
            .await
            .map_err(fail)?;
        tx.commit().await.map_err(fail)?;
        Ok(())
    }

    async fn delete_transition_task(
        &self,
        transition_id: Uuid,
        task_id: Uuid,
    ) -> Result<(), StorageError> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM transition_tasks WHERE id = $1 AND transition_id = $2")
            .bind(task_id)
            .bind(transition_id)
            .execute(&pool)
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
        let pool = self.pool()?;
        let id = new.transition_id;
        let fail = |e: sqlx::Error| StorageError::transaction(format!("test-and-set transition {id}"), e);
        let mut tx = pool.begin().await.map_err(fail)?;

        let row = sqlx::query_as::<_, TransitionRow>(&format!(
            "SELECT {TRANSITION_COLUMNS} FROM transitions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(fail)?;
        let Some(row) = row else {
            tx.rollback().await.map_err(fail)?;
            return Err(StorageError::not_found("transition", id));
        };
        let current: Transition = decode(row, "transition", id)?;
        if !expected.matches_ignoring_location(&current) {
            tx.rollback().await.map_err(fail)?;
            debug!(parent: &self.span(), transition = %id, "transition changed, test-and-set lost");
            return Ok(false);
        }

        sqlx::query("UPDATE transitions SET status = $2, last_active_time = $3 WHERE id = $1")
            .bind(id)
            .bind(new.status.as_str())
            .bind(new.last_active_time)
            .execute(&mut *tx)
            .await
            .map_err(fail)?;
        tx.commit().await.map_err(fail)?;
        Ok(true)
    }
}
