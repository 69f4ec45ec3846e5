use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{
    check_transition, generate_code, transition_payload, ActivationStore, SessionStore,
    CODE_ATTEMPTS,
};
use crate::error::SubbotError;
use crate::models::{
    AuthMethod, ChallengeUpdate, EventFilter, EventKind, EventLogEntry, GlobalActivationState,
    GroupActivationOverride, NewEvent, NewSession, SessionRecord, SessionStatus, StatusUpdate,
};

const SESSION_COLUMNS: &str = "id, code, owner_identifier, owner_display_name, method, status, \
     qr_payload, pairing_code, auth_data_path, created_at, last_heartbeat_at, connected_at, \
     is_active, message_count, metadata";

/// Raw `subbots` row; enum columns are stored as text.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: i64,
    code: String,
    owner_identifier: String,
    owner_display_name: Option<String>,
    method: String,
    status: String,
    qr_payload: Option<String>,
    pairing_code: Option<String>,
    auth_data_path: Option<String>,
    created_at: DateTime<Utc>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    connected_at: Option<DateTime<Utc>>,
    is_active: bool,
    message_count: i64,
    metadata: serde_json::Value,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = SubbotError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(SessionRecord {
            id: row.id,
            code: row.code,
            owner_identifier: row.owner_identifier,
            owner_display_name: row.owner_display_name,
            method: row.method.parse()?,
            status: row.status.parse()?,
            qr_payload: row.qr_payload,
            pairing_code: row.pairing_code,
            auth_data_path: row.auth_data_path,
            created_at: row.created_at,
            last_heartbeat_at: row.last_heartbeat_at,
            connected_at: row.connected_at,
            is_active: row.is_active,
            message_count: row.message_count,
            metadata: row.metadata,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    code: String,
    event_kind: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EventLogEntry {
    type Error = SubbotError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(EventLogEntry {
            id: row.id,
            code: row.code,
            event_kind: row.event_kind.parse()?,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    group_identifier: String,
    is_active: bool,
    updated_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<GroupRow> for GroupActivationOverride {
    fn from(row: GroupRow) -> Self {
        GroupActivationOverride {
            group_identifier: row.group_identifier,
            is_active: row.is_active,
            updated_by: row.updated_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn into_records(rows: Vec<SessionRow>) -> Result<Vec<SessionRecord>, SubbotError> {
    rows.into_iter().map(SessionRecord::try_from).collect()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Written after the record's transaction commits; failures only warn.
    async fn log_best_effort(&self, event: NewEvent) {
        let code = event.code.clone();
        if let Err(e) = self.append_event(event).await {
            tracing::warn!(code = %code, error = %e, "Event log append failed; record write kept");
        }
    }

    fn not_found(code: &str) -> SubbotError {
        SubbotError::Conflict(format!("session {} not found", code))
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn create(&self, new: NewSession) -> Result<SessionRecord, SubbotError> {
        for attempt in 1..=CODE_ATTEMPTS {
            let code = generate_code();
            let result = sqlx::query_as::<_, SessionRow>(&format!(
                r#"
                INSERT INTO subbots (code, owner_identifier, owner_display_name, method, status, metadata)
                VALUES ($1, $2, $3, $4, 'pending', $5)
                RETURNING {}
                "#,
                SESSION_COLUMNS
            ))
            .bind(&code)
            .bind(&new.owner_identifier)
            .bind(&new.owner_display_name)
            .bind(new.method.as_str())
            .bind(&new.metadata)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => {
                    let record = SessionRecord::try_from(row)?;
                    let payload = serde_json::json!({
                        "owner": record.owner_identifier,
                        "method": record.method.as_str(),
                    });
                    self.log_best_effort(NewEvent::new(&record.code, EventKind::Created, payload))
                        .await;
                    return Ok(record);
                }
                Err(e) if is_unique_violation(&e) => {
                    tracing::debug!(attempt, code = %code, "Session code collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SubbotError::Conflict(
            "could not allocate a unique session code".to_string(),
        ))
    }

    async fn get(&self, code: &str) -> Result<Option<SessionRecord>, SubbotError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM subbots WHERE code = $1",
            SESSION_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SessionRecord::try_from).transpose()
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<SessionRecord>, SubbotError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM subbots WHERE owner_identifier = $1 ORDER BY id",
            SESSION_COLUMNS
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    async fn list_all(&self) -> Result<Vec<SessionRecord>, SubbotError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM subbots ORDER BY id",
            SESSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    async fn list_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<SessionRecord>, SubbotError> {
        let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM subbots WHERE status = ANY($1) ORDER BY id",
            SESSION_COLUMNS
        ))
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    async fn list_recoverable(&self) -> Result<Vec<SessionRecord>, SubbotError> {
        let names: Vec<&str> = SessionStatus::RECOVERABLE.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM subbots WHERE is_active = TRUE OR status = ANY($1) ORDER BY id",
            SESSION_COLUMNS
        ))
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    async fn update_status(
        &self,
        code: &str,
        update: StatusUpdate,
    ) -> Result<SessionRecord, SubbotError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM subbots WHERE code = $1 FOR UPDATE")
                .bind(code)
                .fetch_optional(&mut *tx)
                .await?;
        let from: SessionStatus = match current {
            Some((status,)) => status.parse()?,
            None => return Err(Self::not_found(code)),
        };
        check_transition(code, from, update.status)?;

        let connected = update.status == SessionStatus::Connected;
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            UPDATE subbots
            SET status = $2,
                is_active = $3,
                connected_at = CASE WHEN $3 THEN NOW() ELSE connected_at END,
                last_heartbeat_at = CASE WHEN $3 THEN GREATEST(COALESCE(last_heartbeat_at, NOW()), NOW())
                                         ELSE last_heartbeat_at END,
                auth_data_path = COALESCE($4, auth_data_path),
                qr_payload = CASE WHEN $5 THEN NULL ELSE qr_payload END,
                pairing_code = CASE WHEN $5 THEN NULL ELSE pairing_code END
            WHERE code = $1
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(code)
        .bind(update.status.as_str())
        .bind(connected)
        .bind(&update.credential)
        .bind(update.clear_challenge)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Self::not_found(code))?;

        tx.commit().await?;

        let record = SessionRecord::try_from(row)?;
        let payload = transition_payload(from, &update);
        self.log_best_effort(NewEvent::new(code, EventKind::Transition, payload))
            .await;
        Ok(record)
    }

    async fn reactivate(
        &self,
        code: &str,
        method: AuthMethod,
        actor: &str,
    ) -> Result<SessionRecord, SubbotError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM subbots WHERE code = $1 FOR UPDATE")
                .bind(code)
                .fetch_optional(&mut *tx)
                .await?;
        let from: SessionStatus = match current {
            Some((status,)) => status.parse()?,
            None => return Err(Self::not_found(code)),
        };
        if !from.is_terminal() {
            return Err(SubbotError::InvalidTransition {
                code: code.to_string(),
                from,
                to: SessionStatus::Pending,
            });
        }

        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            UPDATE subbots
            SET status = 'pending', is_active = FALSE, method = $2,
                qr_payload = NULL, pairing_code = NULL, auth_data_path = NULL
            WHERE code = $1
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(code)
        .bind(method.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let payload = serde_json::json!({
            "from": from.as_str(),
            "method": method.as_str(),
            "actor": actor,
        });
        self.log_best_effort(NewEvent::new(code, EventKind::Reactivated, payload))
            .await;
        SessionRecord::try_from(row)
    }

    async fn update_challenge(
        &self,
        code: &str,
        challenge: ChallengeUpdate,
    ) -> Result<(), SubbotError> {
        let result = sqlx::query(
            r#"
            UPDATE subbots
            SET qr_payload = COALESCE($2, qr_payload),
                pairing_code = COALESCE($3, pairing_code)
            WHERE code = $1
            "#,
        )
        .bind(code)
        .bind(&challenge.qr_payload)
        .bind(&challenge.pairing_code)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Self::not_found(code));
        }
        Ok(())
    }

    async fn update_credentials(&self, code: &str, credential: &str) -> Result<(), SubbotError> {
        let result = sqlx::query("UPDATE subbots SET auth_data_path = $2 WHERE code = $1")
            .bind(code)
            .bind(credential)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Self::not_found(code));
        }
        Ok(())
    }

    async fn record_heartbeat(&self, code: &str, at: DateTime<Utc>) -> Result<bool, SubbotError> {
        let result = sqlx::query(
            r#"
            UPDATE subbots
            SET last_heartbeat_at = GREATEST(COALESCE(last_heartbeat_at, $2), $2)
            WHERE code = $1 AND status = 'connected'
            "#,
        )
        .bind(code)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_message_count(&self, code: &str) -> Result<i64, SubbotError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE subbots SET message_count = message_count + 1 WHERE code = $1 RETURNING message_count",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(count,)| count).ok_or_else(|| Self::not_found(code))
    }

    async fn delete(&self, code: &str) -> Result<bool, SubbotError> {
        let result = sqlx::query("DELETE FROM subbots WHERE code = $1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_event(&self, event: NewEvent) -> Result<EventLogEntry, SubbotError> {
        let row = sqlx::query_as::<_, EventRow>(
            r#"
            INSERT INTO subbot_events (code, event_kind, payload)
            VALUES ($1, $2, $3)
            RETURNING id, code, event_kind, payload, created_at
            "#,
        )
        .bind(&event.code)
        .bind(event.event_kind.as_str())
        .bind(&event.payload)
        .fetch_one(&self.pool)
        .await?;
        EventLogEntry::try_from(row)
    }

    async fn query_events(&self, filter: &EventFilter) -> Result<Vec<EventLogEntry>, SubbotError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, code, event_kind, payload, created_at
            FROM subbot_events
            WHERE ($1::text IS NULL OR code = $1)
              AND ($2::text IS NULL OR event_kind = $2)
            ORDER BY id DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(&filter.code)
        .bind(filter.event_kind.map(|k| k.as_str()))
        .bind(i64::from(filter.effective_limit()))
        .bind(i64::from(filter.effective_offset()))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventLogEntry::try_from).collect()
    }

    async fn health_check(&self) -> Result<String, SubbotError> {
        Ok(crate::db::health_check(&self.pool).await?)
    }
}

#[async_trait]
impl ActivationStore for PgStore {
    async fn global_state(&self) -> Result<GlobalActivationState, SubbotError> {
        let row: Option<(bool, Option<String>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT is_on, last_changed_by, last_changed_at FROM bot_global_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some((is_on, last_changed_by, last_changed_at)) => GlobalActivationState {
                is_on,
                last_changed_by,
                last_changed_at,
            },
            None => GlobalActivationState::default(),
        })
    }

    async fn set_global_state(
        &self,
        is_on: bool,
        actor: &str,
    ) -> Result<GlobalActivationState, SubbotError> {
        let (is_on, last_changed_by, last_changed_at): (bool, Option<String>, DateTime<Utc>) =
            sqlx::query_as(
                r#"
                INSERT INTO bot_global_state (id, is_on, last_changed_by, last_changed_at)
                VALUES (1, $1, $2, NOW())
                ON CONFLICT (id) DO UPDATE
                SET is_on = EXCLUDED.is_on,
                    last_changed_by = EXCLUDED.last_changed_by,
                    last_changed_at = EXCLUDED.last_changed_at
                RETURNING is_on, last_changed_by, last_changed_at
                "#,
            )
            .bind(is_on)
            .bind(actor)
            .fetch_one(&self.pool)
            .await?;
        Ok(GlobalActivationState {
            is_on,
            last_changed_by,
            last_changed_at,
        })
    }

    async fn group_state(
        &self,
        group_identifier: &str,
    ) -> Result<Option<GroupActivationOverride>, SubbotError> {
        let row = sqlx::query_as::<_, GroupRow>(
            r#"
            SELECT group_identifier, is_active, updated_by, created_at, updated_at
            FROM group_activation
            WHERE group_identifier = $1
            "#,
        )
        .bind(group_identifier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(GroupActivationOverride::from))
    }

    async fn set_group_state(
        &self,
        group_identifier: &str,
        is_active: bool,
        actor: &str,
    ) -> Result<GroupActivationOverride, SubbotError> {
        let row = sqlx::query_as::<_, GroupRow>(
            r#"
            INSERT INTO group_activation (group_identifier, is_active, updated_by)
            VALUES ($1, $2, $3)
            ON CONFLICT (group_identifier) DO UPDATE
            SET is_active = EXCLUDED.is_active,
                updated_by = EXCLUDED.updated_by,
                updated_at = NOW()
            RETURNING group_identifier, is_active, updated_by, created_at, updated_at
            "#,
        )
        .bind(group_identifier)
        .bind(is_active)
        .bind(actor)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }
}
