// src/storage/postgres.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::warn;

use crate::domain::{
    BusinessDomainId, ConnectorMessageId, EvidenceType, LinkPartnerName, Message,
    MessageConfirmation, MessageContent, MessageDetails, MessageDirection, MessageError,
    MessageTarget, RejectionReason, StatusUpdate, TransportId, TransportState, TransportStep,
};
use crate::routing::{RoutingRule, RuleSource};

use super::traits::{MessageErrorRecord, Storage};
use super::unit_of_work::{StagedWrites, UnitOfWork};

const MESSAGE_COLUMNS: &str = r#"
    connector_message_id, tenant, direction, ebms_message_id, backend_message_id,
    conversation_id, details, document_name, document, transported_confirmations,
    delivered_to_gateway, delivered_to_backend, confirmed, rejected
"#;

type PgTransaction = Transaction<'static, Postgres>;

/// Database transaction of a unit of work, taken when it finishes.
struct PgUnit {
    tx: Arc<Mutex<Option<PgTransaction>>>,
}

#[async_trait]
impl StagedWrites for PgUnit {
    async fn commit(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.tx.lock().await.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.tx.lock().await.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Transaction a call runs in: the one of the current unit of work, or
/// its own.
enum Conn {
    Own(PgTransaction),
    Joined(OwnedMappedMutexGuard<Option<PgTransaction>, PgTransaction>),
}

impl Conn {
    fn tx(&mut self) -> &mut PgTransaction {
        match self {
            Conn::Own(tx) => tx,
            Conn::Joined(tx) => &mut **tx,
        }
    }

    /// Commit a transaction of its own; a joined one commits with its unit.
    async fn finish(self) -> anyhow::Result<()> {
        if let Conn::Own(tx) = self {
            tx.commit().await?;
        }
        Ok(())
    }
}

/// PostgreSQL implementation of the Storage trait.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgresStore instance with a connection pool.
    pub async fn connect(
        database_url: &str,
        min_connections: u32,
        max_connections: u32,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn conn(&self) -> anyhow::Result<Conn> {
        match UnitOfWork::with_current(|unit: &PgUnit| unit.tx.clone()) {
            Some(slot) => {
                let tx = OwnedMutexGuard::try_map(slot.lock_owned().await, |tx| tx.as_mut())
                    .map_err(|_| anyhow::anyhow!("unit of work already finished"))?;
                Ok(Conn::Joined(tx))
            }
            None => Ok(Conn::Own(self.pool.begin().await?)),
        }
    }

    async fn load_confirmations(
        tx: &mut Transaction<'_, Postgres>,
        id: &str,
    ) -> anyhow::Result<Vec<MessageConfirmation>> {
        let rows = sqlx::query(
            r#"
            SELECT evidence_type, evidence, rejection_reason,
                   transported_to_gateway, transported_to_backend
            FROM dc_message_confirmation
            WHERE connector_message_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(id)
        .fetch_all(&mut **tx)
        .await?;

        rows.into_iter().map(|row| confirmation_from_row(&row)).collect()
    }

    async fn load_messages(
        tx: &mut Transaction<'_, Postgres>,
        rows: Vec<PgRow>,
    ) -> anyhow::Result<Vec<Message>> {
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let mut message = message_from_row(&row)?;
            message.related_confirmations =
                Self::load_confirmations(tx, message.connector_message_id.as_str()).await?;
            messages.push(message);
        }
        Ok(messages)
    }

    async fn find_one(
        &self,
        condition: &str,
        tenant: &BusinessDomainId,
        id: &str,
        direction: MessageDirection,
    ) -> anyhow::Result<Option<Message>> {
        let mut conn = self.conn().await?;

        let sql = format!(
            "SELECT {} FROM dc_message WHERE tenant = $1 AND {} = $2 AND direction = $3 \
             ORDER BY created_at DESC LIMIT 1",
            MESSAGE_COLUMNS, condition
        );
        let rows = sqlx::query(&sql)
            .bind(tenant.as_str())
            .bind(id)
            .bind(direction.as_str())
            .fetch_all(&mut **conn.tx())
            .await?;

        let message = Self::load_messages(conn.tx(), rows).await?.into_iter().next();
        conn.finish().await?;
        Ok(message)
    }

    async fn upsert_confirmation(
        tx: &mut Transaction<'_, Postgres>,
        id: &str,
        confirmation: &MessageConfirmation,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dc_message_confirmation (
                connector_message_id, evidence_type, evidence, rejection_reason,
                transported_to_gateway, transported_to_backend
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (connector_message_id, evidence_type)
            DO UPDATE SET
                evidence = EXCLUDED.evidence,
                rejection_reason = EXCLUDED.rejection_reason,
                transported_to_gateway = EXCLUDED.transported_to_gateway,
                transported_to_backend = EXCLUDED.transported_to_backend
            "#,
        )
        .bind(id)
        .bind(confirmation.evidence_type.as_str())
        .bind(&confirmation.evidence)
        .bind(confirmation.rejection_reason.map(|r| r.as_str()))
        .bind(confirmation.transported_to_gateway)
        .bind(confirmation.transported_to_backend)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn update_message_column(
        &self,
        id: &ConnectorMessageId,
        column: &str,
        value: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let sql = format!(
            "UPDATE dc_message SET {} = $2, updated_at = now() WHERE connector_message_id = $1",
            column
        );
        let result = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(value)
            .execute(&mut **conn.tx())
            .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("no message stored with id {}", id);
        }
        conn.finish().await?;
        Ok(())
    }

    async fn insert_statuses(
        tx: &mut Transaction<'_, Postgres>,
        step: &TransportStep,
    ) -> anyhow::Result<()> {
        for (seq, status) in step.status_history.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO dc_transport_step_status (transport_id, seq, state, text, created)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (transport_id, seq) DO NOTHING
                "#,
            )
            .bind(step.transport_id.as_str())
            .bind(seq as i32)
            .bind(status.state.as_str())
            .bind(&status.text)
            .bind(status.created)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn load_step(
        tx: &mut Transaction<'_, Postgres>,
        row: &PgRow,
    ) -> anyhow::Result<TransportStep> {
        let transport_id: String = row.get("transport_id");
        let snapshot: Option<serde_json::Value> = row.get("transported_message");

        // An unreadable snapshot still leaves the step usable for status bookkeeping.
        let transported_message = match snapshot.map(serde_json::from_value::<Message>) {
            Some(Ok(message)) => Some(message),
            Some(Err(e)) => {
                warn!(transport_id = %transport_id, error = %e, "Unreadable transported message");
                None
            }
            None => None,
        };

        let status_history = sqlx::query(
            r#"
            SELECT state, text, created
            FROM dc_transport_step_status
            WHERE transport_id = $1
            ORDER BY seq
            "#,
        )
        .bind(&transport_id)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(|row| {
            let state: String = row.get("state");
            let state = TransportState::from_str(&state)
                .ok_or_else(|| anyhow::anyhow!("unknown transport state {}", state))?;
            Ok(StatusUpdate {
                created: row.get("created"),
                state,
                text: row.get("text"),
            })
        })
        .collect::<anyhow::Result<_>>()?;

        let attempt: i32 = row.get("attempt");

        Ok(TransportStep {
            transport_id: TransportId::new(transport_id),
            connector_message_id: ConnectorMessageId::new(row.get::<String, _>("connector_message_id")),
            link_partner_name: LinkPartnerName::new(row.get::<String, _>("link_partner_name")),
            attempt: attempt as u32,
            created: row.get("created"),
            transported_message,
            remote_message_id: row.get("remote_message_id"),
            transport_system_message_id: row.get("transport_system_message_id"),
            status_history,
            final_state_reached: row.get("final_state_reached"),
        })
    }
}

fn message_from_row(row: &PgRow) -> anyhow::Result<Message> {
    let details: serde_json::Value = row.get("details");
    let mut details: MessageDetails = serde_json::from_value(details)?;

    // Columns updated in place take precedence over the details document.
    details.ebms_message_id = row.get("ebms_message_id");
    details.backend_message_id = row.get("backend_message_id");
    details.delivered_to_gateway = row.get("delivered_to_gateway");
    details.delivered_to_backend = row.get("delivered_to_backend");
    details.confirmed = row.get("confirmed");
    details.rejected = row.get("rejected");

    let document_name: Option<String> = row.get("document_name");
    let document: Option<Vec<u8>> = row.get("document");
    let content = document_name.map(|name| MessageContent::new(name, document.unwrap_or_default()));

    let transported: serde_json::Value = row.get("transported_confirmations");

    Ok(Message {
        connector_message_id: ConnectorMessageId::new(row.get::<String, _>("connector_message_id")),
        tenant: BusinessDomainId::new(row.get::<String, _>("tenant")),
        details,
        content,
        transported_confirmations: serde_json::from_value(transported)?,
        related_confirmations: Vec::new(),
    })
}

fn confirmation_from_row(row: &PgRow) -> anyhow::Result<MessageConfirmation> {
    let evidence_type: String = row.get("evidence_type");
    let evidence_type = EvidenceType::from_str(&evidence_type)
        .ok_or_else(|| anyhow::anyhow!("unknown evidence type {}", evidence_type))?;
    let reason: Option<String> = row.get("rejection_reason");

    Ok(MessageConfirmation {
        evidence_type,
        rejection_reason: reason.as_deref().and_then(RejectionReason::from_str),
        evidence: row.get("evidence"),
        transported_to_gateway: row.get("transported_to_gateway"),
        transported_to_backend: row.get("transported_to_backend"),
    })
}

fn target_column(target: MessageTarget, gateway: &'static str, backend: &'static str) -> &'static str {
    match target {
        MessageTarget::Gateway => gateway,
        MessageTarget::Backend => backend,
    }
}

#[async_trait]
impl Storage for PostgresStore {
    async fn begin(&self) -> anyhow::Result<UnitOfWork> {
        let tx = self.pool.begin().await?;
        Ok(UnitOfWork::new(Arc::new(PgUnit {
            tx: Arc::new(Mutex::new(Some(tx))),
        })))
    }

    async fn persist_message(&self, message: &Message) -> anyhow::Result<()> {
        let details = serde_json::to_value(&message.details)?;
        let transported = serde_json::to_value(&message.transported_confirmations)?;
        let id = message.connector_message_id.as_str();

        let mut conn = self.conn().await?;

        sqlx::query(
            r#"
            INSERT INTO dc_message (
                connector_message_id, tenant, direction, ebms_message_id, backend_message_id,
                conversation_id, details, document_name, document, transported_confirmations,
                delivered_to_gateway, delivered_to_backend, confirmed, rejected
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (connector_message_id)
            DO UPDATE SET
                tenant = EXCLUDED.tenant,
                direction = EXCLUDED.direction,
                ebms_message_id = EXCLUDED.ebms_message_id,
                backend_message_id = EXCLUDED.backend_message_id,
                conversation_id = EXCLUDED.conversation_id,
                details = EXCLUDED.details,
                document_name = EXCLUDED.document_name,
                document = EXCLUDED.document,
                transported_confirmations = EXCLUDED.transported_confirmations,
                delivered_to_gateway = EXCLUDED.delivered_to_gateway,
                delivered_to_backend = EXCLUDED.delivered_to_backend,
                confirmed = EXCLUDED.confirmed,
                rejected = EXCLUDED.rejected,
                updated_at = now()
            "#,
        )
        .bind(id)
        .bind(message.tenant.as_str())
        .bind(message.direction().as_str())
        .bind(&message.details.ebms_message_id)
        .bind(&message.details.backend_message_id)
        .bind(&message.details.conversation_id)
        .bind(details)
        .bind(message.content.as_ref().map(|c| c.document_name.as_str()))
        .bind(message.content.as_ref().map(|c| c.document.as_slice()))
        .bind(transported)
        .bind(message.details.delivered_to_gateway)
        .bind(message.details.delivered_to_backend)
        .bind(message.details.confirmed)
        .bind(message.details.rejected)
        .execute(&mut **conn.tx())
        .await?;

        for confirmation in &message.related_confirmations {
            Self::upsert_confirmation(conn.tx(), id, confirmation).await?;
        }

        conn.finish().await?;
        Ok(())
    }

    async fn get_message(&self, id: &ConnectorMessageId) -> anyhow::Result<Option<Message>> {
        let mut conn = self.conn().await?;

        let sql = format!(
            "SELECT {} FROM dc_message WHERE connector_message_id = $1",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(id.as_str()).fetch_all(&mut **conn.tx()).await?;

        let message = Self::load_messages(conn.tx(), rows).await?.into_iter().next();
        conn.finish().await?;
        Ok(message)
    }

    async fn find_message_by_ebms_id(
        &self,
        tenant: &BusinessDomainId,
        ebms_id: &str,
        direction: MessageDirection,
    ) -> anyhow::Result<Option<Message>> {
        self.find_one("ebms_message_id", tenant, ebms_id, direction).await
    }

    async fn find_message_by_backend_id(
        &self,
        tenant: &BusinessDomainId,
        backend_id: &str,
        direction: MessageDirection,
    ) -> anyhow::Result<Option<Message>> {
        self.find_one("backend_message_id", tenant, backend_id, direction).await
    }

    async fn find_messages_by_conversation_id(
        &self,
        tenant: &BusinessDomainId,
        conversation_id: &str,
    ) -> anyhow::Result<Vec<Message>> {
        let mut conn = self.conn().await?;

        let sql = format!(
            "SELECT {} FROM dc_message WHERE tenant = $1 AND conversation_id = $2 ORDER BY created_at",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(tenant.as_str())
            .bind(conversation_id)
            .fetch_all(&mut **conn.tx())
            .await?;

        let messages = Self::load_messages(conn.tx(), rows).await?;
        conn.finish().await?;
        Ok(messages)
    }

    async fn set_remote_message_id(
        &self,
        id: &ConnectorMessageId,
        target: MessageTarget,
        remote_id: &str,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let column = target_column(target, "ebms_message_id", "backend_message_id");
        let sql = format!(
            "UPDATE dc_message SET {} = $2, updated_at = now() WHERE connector_message_id = $1",
            column
        );
        let result = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(remote_id)
            .execute(&mut **conn.tx())
            .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("no message stored with id {}", id);
        }
        conn.finish().await?;
        Ok(())
    }

    async fn set_delivered(
        &self,
        id: &ConnectorMessageId,
        target: MessageTarget,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let column = target_column(target, "delivered_to_gateway", "delivered_to_backend");
        self.update_message_column(id, column, at).await
    }

    async fn confirm_message(&self, id: &ConnectorMessageId, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.update_message_column(id, "confirmed", at).await
    }

    async fn reject_message(&self, id: &ConnectorMessageId, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.update_message_column(id, "rejected", at).await
    }

    async fn clear_message_content(&self, id: &ConnectorMessageId) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            r#"
            UPDATE dc_message
            SET document = CASE WHEN document IS NULL THEN NULL ELSE ''::bytea END,
                updated_at = now()
            WHERE connector_message_id = $1
            "#,
        )
        .bind(id.as_str())
        .execute(&mut **conn.tx())
        .await?;
        conn.finish().await?;
        Ok(())
    }

    async fn find_messages_awaiting_evidence(
        &self,
        tenant: &BusinessDomainId,
        min_priority: u8,
    ) -> anyhow::Result<Vec<Message>> {
        let excluded: Vec<String> = EvidenceType::ALL
            .iter()
            .filter(|t| t.priority() >= min_priority)
            .map(|t| t.as_str().to_string())
            .collect();

        let mut conn = self.conn().await?;

        let sql = format!(
            r#"
            SELECT {} FROM dc_message m
            WHERE m.tenant = $1
              AND m.direction = $2
              AND m.document_name IS NOT NULL
              AND m.delivered_to_gateway IS NOT NULL
              AND m.confirmed IS NULL
              AND m.rejected IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM dc_message_confirmation c
                  WHERE c.connector_message_id = m.connector_message_id
                    AND c.evidence_type = ANY($3)
              )
            ORDER BY m.delivered_to_gateway
            "#,
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(tenant.as_str())
            .bind(MessageDirection::BackendToGateway.as_str())
            .bind(excluded)
            .fetch_all(&mut **conn.tx())
            .await?;

        let messages = Self::load_messages(conn.tx(), rows).await?;
        conn.finish().await?;
        Ok(messages)
    }

    async fn add_related_confirmation(
        &self,
        id: &ConnectorMessageId,
        confirmation: &MessageConfirmation,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        Self::upsert_confirmation(conn.tx(), id.as_str(), confirmation).await?;
        conn.finish().await?;
        Ok(())
    }

    async fn set_confirmation_transported(
        &self,
        id: &ConnectorMessageId,
        evidence_type: EvidenceType,
        target: MessageTarget,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let column = target_column(target, "transported_to_gateway", "transported_to_backend");
        let sql = format!(
            "UPDATE dc_message_confirmation SET {} = $3 \
             WHERE connector_message_id = $1 AND evidence_type = $2",
            column
        );
        sqlx::query(&sql)
            .bind(id.as_str())
            .bind(evidence_type.as_str())
            .bind(at)
            .execute(&mut **conn.tx())
            .await?;
        conn.finish().await?;
        Ok(())
    }

    async fn create_transport_step(&self, step: &TransportStep) -> anyhow::Result<()> {
        let snapshot = step
            .transported_message
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let mut conn = self.conn().await?;

        sqlx::query(
            r#"
            INSERT INTO dc_transport_step (
                transport_id, connector_message_id, link_partner_name, attempt, created,
                transported_message, remote_message_id, transport_system_message_id,
                final_state_reached
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(step.transport_id.as_str())
        .bind(step.connector_message_id.as_str())
        .bind(step.link_partner_name.as_str())
        .bind(step.attempt as i32)
        .bind(step.created)
        .bind(snapshot)
        .bind(&step.remote_message_id)
        .bind(&step.transport_system_message_id)
        .bind(step.final_state_reached)
        .execute(&mut **conn.tx())
        .await?;

        Self::insert_statuses(conn.tx(), step).await?;

        conn.finish().await?;
        Ok(())
    }

    async fn update_transport_step(&self, step: &TransportStep) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;

        let result = sqlx::query(
            r#"
            UPDATE dc_transport_step
            SET remote_message_id = $2,
                transport_system_message_id = $3,
                final_state_reached = $4
            WHERE transport_id = $1
            "#,
        )
        .bind(step.transport_id.as_str())
        .bind(&step.remote_message_id)
        .bind(&step.transport_system_message_id)
        .bind(step.final_state_reached)
        .execute(&mut **conn.tx())
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("no transport step {}", step.transport_id);
        }

        // History is append-only; existing entries are kept as they are.
        Self::insert_statuses(conn.tx(), step).await?;

        conn.finish().await?;
        Ok(())
    }

    async fn get_transport_step(&self, id: &TransportId) -> anyhow::Result<Option<TransportStep>> {
        let mut conn = self.conn().await?;

        let row = sqlx::query(
            r#"
            SELECT transport_id, connector_message_id, link_partner_name, attempt, created,
                   transported_message, remote_message_id, transport_system_message_id,
                   final_state_reached
            FROM dc_transport_step
            WHERE transport_id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&mut **conn.tx())
        .await?;

        let step = match row {
            Some(row) => Some(Self::load_step(conn.tx(), &row).await?),
            None => None,
        };
        conn.finish().await?;
        Ok(step)
    }

    async fn highest_attempt(
        &self,
        id: &ConnectorMessageId,
        link: &LinkPartnerName,
    ) -> anyhow::Result<u32> {
        let mut conn = self.conn().await?;
        let attempt: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT MAX(attempt)
            FROM dc_transport_step
            WHERE connector_message_id = $1 AND link_partner_name = $2
            "#,
        )
        .bind(id.as_str())
        .bind(link.as_str())
        .fetch_one(&mut **conn.tx())
        .await?;

        conn.finish().await?;
        Ok(attempt.unwrap_or(0) as u32)
    }

    async fn open_transport_steps(&self, link: &LinkPartnerName) -> anyhow::Result<Vec<TransportStep>> {
        let mut conn = self.conn().await?;

        let rows = sqlx::query(
            r#"
            SELECT transport_id, connector_message_id, link_partner_name, attempt, created,
                   transported_message, remote_message_id, transport_system_message_id,
                   final_state_reached
            FROM dc_transport_step
            WHERE link_partner_name = $1 AND final_state_reached IS NULL
            ORDER BY created
            "#,
        )
        .bind(link.as_str())
        .fetch_all(&mut **conn.tx())
        .await?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            steps.push(Self::load_step(conn.tx(), row).await?);
        }
        conn.finish().await?;
        Ok(steps)
    }

    async fn persist_message_error(&self, record: &MessageErrorRecord) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO dc_message_error (
                transport_id, connector_message_id, source, text, details, created
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.transport_id.as_str())
        .bind(record.connector_message_id.as_str())
        .bind(&record.error.source)
        .bind(&record.error.text)
        .bind(&record.error.details)
        .bind(record.created)
        .execute(&mut **conn.tx())
        .await?;
        conn.finish().await?;
        Ok(())
    }

    async fn message_errors(&self, id: &ConnectorMessageId) -> anyhow::Result<Vec<MessageErrorRecord>> {
        let mut conn = self.conn().await?;
        let records = sqlx::query(
            r#"
            SELECT transport_id, connector_message_id, source, text, details, created
            FROM dc_message_error
            WHERE connector_message_id = $1
            ORDER BY id
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&mut **conn.tx())
        .await?
        .into_iter()
        .map(|row| MessageErrorRecord {
            transport_id: TransportId::new(row.get::<String, _>("transport_id")),
            connector_message_id: ConnectorMessageId::new(row.get::<String, _>("connector_message_id")),
            error: MessageError {
                source: row.get("source"),
                text: row.get("text"),
                details: row.get("details"),
            },
            created: row.get("created"),
        })
        .collect();

        conn.finish().await?;
        Ok(records)
    }

    async fn list_routing_rules(&self, tenant: &BusinessDomainId) -> anyhow::Result<Vec<RoutingRule>> {
        let mut conn = self.conn().await?;
        let rows = sqlx::query(
            r#"
            SELECT rule_id, link_partner_name, expression, priority, description
            FROM dc_routing_rule
            WHERE tenant = $1
            ORDER BY updated_at DESC
            "#,
        )
        .bind(tenant.as_str())
        .fetch_all(&mut **conn.tx())
        .await?;
        conn.finish().await?;

        rows.into_iter()
            .map(|row| {
                let rule_id: String = row.get("rule_id");
                let expression: String = row.get("expression");
                let rule = RoutingRule::parse(
                    rule_id.clone(),
                    LinkPartnerName::new(row.get::<String, _>("link_partner_name")),
                    &expression,
                    RuleSource::Durable,
                )
                .map_err(|e| anyhow::anyhow!("stored routing rule {} is malformed: {}", rule_id, e))?;

                let mut rule = rule.with_priority(row.get("priority"));
                rule.description = row.get("description");
                Ok(rule)
            })
            .collect()
    }

    async fn save_routing_rule(&self, tenant: &BusinessDomainId, rule: &RoutingRule) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO dc_routing_rule (
                tenant, rule_id, link_partner_name, expression, priority, description, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (tenant, rule_id)
            DO UPDATE SET
                link_partner_name = EXCLUDED.link_partner_name,
                expression = EXCLUDED.expression,
                priority = EXCLUDED.priority,
                description = EXCLUDED.description,
                updated_at = now()
            "#,
        )
        .bind(tenant.as_str())
        .bind(&rule.id)
        .bind(rule.link_partner_name.as_str())
        .bind(rule.match_expression.to_string())
        .bind(rule.priority)
        .bind(&rule.description)
        .execute(&mut **conn.tx())
        .await?;
        conn.finish().await?;
        Ok(())
    }

    async fn delete_routing_rule(&self, tenant: &BusinessDomainId, rule_id: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM dc_routing_rule
            WHERE tenant = $1 AND rule_id = $2
            "#,
        )
        .bind(tenant.as_str())
        .bind(rule_id)
        .execute(&mut **conn.tx())
        .await?;

        conn.finish().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_default_destination(
        &self,
        tenant: &BusinessDomainId,
    ) -> anyhow::Result<Option<LinkPartnerName>> {
        let mut conn = self.conn().await?;
        let link: Option<String> = sqlx::query_scalar(
            r#"
            SELECT link_partner_name
            FROM dc_default_destination
            WHERE tenant = $1
            "#,
        )
        .bind(tenant.as_str())
        .fetch_optional(&mut **conn.tx())
        .await?;

        conn.finish().await?;
        Ok(link.map(LinkPartnerName::new))
    }

    async fn set_default_destination(
        &self,
        tenant: &BusinessDomainId,
        link: &LinkPartnerName,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO dc_default_destination (tenant, link_partner_name, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (tenant)
            DO UPDATE SET
                link_partner_name = EXCLUDED.link_partner_name,
                updated_at = now()
            "#,
        )
        .bind(tenant.as_str())
        .bind(link.as_str())
        .execute(&mut **conn.tx())
        .await?;
        conn.finish().await?;
        Ok(())
    }
}
