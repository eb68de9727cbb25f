use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{postgres::PgRow, types::Json, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::*;
use super::quota::{ensure_can_serve, QuotaBalance, ReleaseOutcome};
use super::store::{CommitOutcome, QuotaAction, SettlementStore, TransitionCommit};
use crate::error::{AppError, AppResult, QuotaError};

const INTENT_COLUMNS: &str = r#"
    id, amount, currency, fee_rate, fee_amount, total_amount,
    user_wallet_address, lp_wallet_address, designated_lp_address,
    platform, merchant_info, payment_proof, processing_details,
    settlement_tx_hash, blockchain_payment_id,
    status, status_history, expires_at, lock_time, release_time, withdrawal_time,
    created_at, updated_at
"#;

const LP_COLUMNS: &str = r#"
    wallet_address, name, email, total_quota, locked_quota, per_transaction_quota,
    fee_rate, supported_platforms, paypal_email, is_active,
    completed_count, completed_volume, created_at, updated_at
"#;

/// Ledger repository - THE source of truth for all state
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    fn map_intents(rows: Vec<PgRow>) -> AppResult<Vec<PaymentIntent>> {
        rows.iter()
            .map(|row| PaymentIntent::from_row(row).map_err(AppError::from))
            .collect()
    }

    async fn fetch_intent_where(
        &self,
        predicate: &str,
        value: &str,
    ) -> AppResult<Option<PaymentIntent>> {
        let sql = format!(
            "SELECT {} FROM payment_intents WHERE {} = $1 LIMIT 1",
            INTENT_COLUMNS, predicate
        );
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(PaymentIntent::from_row).transpose()?)
    }

    // ========== QUOTA OPERATIONS ==========

    async fn lock_lp_row(
        tx: &mut Transaction<'_, Postgres>,
        wallet_address: &str,
    ) -> AppResult<LiquidityProvider> {
        let sql = format!(
            "SELECT {} FROM liquidity_providers WHERE wallet_address = $1 FOR UPDATE",
            LP_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(wallet_address)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| QuotaError::LpNotFound(wallet_address.to_string()))?;
        Ok(LiquidityProvider::from_row(&row)?)
    }

    async fn lock_quota(
        tx: &mut Transaction<'_, Postgres>,
        intent_id: Uuid,
        platform: Platform,
        lp_wallet_address: &str,
        amount: Decimal,
    ) -> AppResult<()> {
        let lp = Self::lock_lp_row(tx, lp_wallet_address).await?;
        ensure_can_serve(&lp, platform, amount)?;

        let mut balance = QuotaBalance::new(lp.total_quota, lp.locked_quota);
        balance.lock(amount)?;

        sqlx::query(
            r#"
            UPDATE liquidity_providers
            SET locked_quota = $2, updated_at = NOW()
            WHERE wallet_address = $1
            "#,
        )
        .bind(lp_wallet_address)
        .bind(balance.locked)
        .execute(&mut **tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO quota_locks (intent_id, lp_wallet_address, amount, locked_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (intent_id) DO NOTHING
            "#,
        )
        .bind(intent_id)
        .bind(lp_wallet_address)
        .bind(amount)
        .execute(&mut **tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(AppError::Internal(format!(
                "Intent {} already holds a quota lock",
                intent_id
            )));
        }

        debug!("🔒 Locked {} of LP {} for intent {}", amount, lp_wallet_address, intent_id);
        Ok(())
    }

    async fn release_locked_quota(
        tx: &mut Transaction<'_, Postgres>,
        intent_id: Uuid,
    ) -> AppResult<ReleaseOutcome> {
        let lock = sqlx::query(
            r#"
            DELETE FROM quota_locks
            WHERE intent_id = $1
            RETURNING lp_wallet_address, amount
            "#,
        )
        .bind(intent_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(lock) = lock else {
            return Ok(ReleaseOutcome::NoLock);
        };
        let lp_wallet_address: String = lock.try_get("lp_wallet_address")?;
        let amount: Decimal = lock.try_get("amount")?;

        let lp = match Self::lock_lp_row(tx, &lp_wallet_address).await {
            Ok(lp) => lp,
            Err(AppError::Quota(QuotaError::LpNotFound(_))) => {
                return Ok(ReleaseOutcome::Clamped {
                    lp_wallet_address,
                    requested: amount,
                    released: Decimal::ZERO,
                })
            }
            Err(e) => return Err(e),
        };

        let mut balance = QuotaBalance::new(lp.total_quota, lp.locked_quota);
        let released = balance.release(amount);

        sqlx::query(
            r#"
            UPDATE liquidity_providers
            SET locked_quota = $2, updated_at = NOW()
            WHERE wallet_address = $1
            "#,
        )
        .bind(&lp_wallet_address)
        .bind(balance.locked)
        .execute(&mut **tx)
        .await?;

        debug!("🔓 Released {} of LP {} for intent {}", released, lp_wallet_address, intent_id);

        if released < amount {
            Ok(ReleaseOutcome::Clamped {
                lp_wallet_address,
                requested: amount,
                released,
            })
        } else {
            Ok(ReleaseOutcome::Released {
                lp_wallet_address,
                amount: released,
            })
        }
    }

    // ========== TASK POOL ==========

    async fn upsert_task_pool(
        tx: &mut Transaction<'_, Postgres>,
        entry: &TaskPoolEntry,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO task_pool (
                intent_id, status, amount, currency, platform,
                lp_wallet_address, designated_lp_address, active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (intent_id) DO UPDATE SET
                status = EXCLUDED.status,
                lp_wallet_address = EXCLUDED.lp_wallet_address,
                designated_lp_address = EXCLUDED.designated_lp_address,
                active = EXCLUDED.active,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(entry.intent_id)
        .bind(entry.status)
        .bind(entry.amount)
        .bind(&entry.currency)
        .bind(entry.platform)
        .bind(&entry.lp_wallet_address)
        .bind(&entry.designated_lp_address)
        .bind(entry.active)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SettlementStore for LedgerRepository {
    // ========== INTENT OPERATIONS ==========

    async fn insert_intent(&self, intent: &PaymentIntent) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;

        sqlx::query(
            r#"
            INSERT INTO payment_intents (
                id, amount, currency, fee_rate, fee_amount, total_amount,
                user_wallet_address, lp_wallet_address, designated_lp_address,
                platform, merchant_info, payment_proof, processing_details,
                settlement_tx_hash, blockchain_payment_id,
                status, status_history, expires_at, lock_time, release_time, withdrawal_time,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23)
            "#,
        )
        .bind(intent.id)
        .bind(intent.amount)
        .bind(&intent.currency)
        .bind(intent.fee_rate)
        .bind(intent.fee_amount)
        .bind(intent.total_amount)
        .bind(&intent.user_wallet_address)
        .bind(&intent.lp_wallet_address)
        .bind(&intent.designated_lp_address)
        .bind(intent.platform)
        .bind(Json(&intent.merchant_info))
        .bind(intent.payment_proof.as_ref().map(Json))
        .bind(Json(&intent.processing_details))
        .bind(&intent.settlement_tx_hash)
        .bind(&intent.blockchain_payment_id)
        .bind(intent.status)
        .bind(Json(&intent.status_history))
        .bind(intent.expires_at)
        .bind(intent.lock_time)
        .bind(intent.release_time)
        .bind(intent.withdrawal_time)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&mut *tx)
        .await?;

        Self::upsert_task_pool(&mut tx, &TaskPoolEntry::from(intent)).await?;
        tx.commit().await?;

        info!("📝 Payment intent {} persisted", intent.id);
        Ok(())
    }

    async fn get_intent(&self, id: Uuid) -> AppResult<Option<PaymentIntent>> {
        let sql = format!("SELECT {} FROM payment_intents WHERE id = $1", INTENT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(PaymentIntent::from_row).transpose()?)
    }

    async fn find_by_gateway_order(&self, order_id: &str) -> AppResult<Option<PaymentIntent>> {
        self.fetch_intent_where("payment_proof->>'order_id'", order_id)
            .await
    }

    async fn find_by_gateway_capture(
        &self,
        capture_id: &str,
    ) -> AppResult<Option<PaymentIntent>> {
        self.fetch_intent_where("payment_proof->>'capture_id'", capture_id)
            .await
    }

    async fn list_by_status(&self, statuses: &[IntentStatus]) -> AppResult<Vec<PaymentIntent>> {
        let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            "SELECT {} FROM payment_intents WHERE status::text = ANY($1) ORDER BY updated_at ASC",
            INTENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(names)
            .fetch_all(&self.pool)
            .await?;
        Self::map_intents(rows)
    }

    async fn list_user_intents(&self, wallet_address: &str) -> AppResult<Vec<PaymentIntent>> {
        let sql = format!(
            "SELECT {} FROM payment_intents WHERE user_wallet_address = $1 ORDER BY created_at DESC",
            INTENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(wallet_address)
            .fetch_all(&self.pool)
            .await?;
        Self::map_intents(rows)
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> AppResult<CommitOutcome> {
        let mut tx = self.begin_tx().await?;
        let next = &commit.next;

        // Optimistic check: status and history length must be unchanged
        let updated = sqlx::query(
            r#"
            UPDATE payment_intents SET
                lp_wallet_address = $4,
                payment_proof = $5,
                processing_details = $6,
                settlement_tx_hash = $7,
                blockchain_payment_id = $8,
                status = $9,
                status_history = $10,
                expires_at = $11,
                lock_time = $12,
                release_time = $13,
                withdrawal_time = $14,
                updated_at = $15
            WHERE id = $1 AND status = $2 AND jsonb_array_length(status_history) = $3
            "#,
        )
        .bind(next.id)
        .bind(commit.expected_status)
        .bind(commit.expected_history_len as i32)
        .bind(&next.lp_wallet_address)
        .bind(next.payment_proof.as_ref().map(Json))
        .bind(Json(&next.processing_details))
        .bind(&next.settlement_tx_hash)
        .bind(&next.blockchain_payment_id)
        .bind(next.status)
        .bind(Json(&next.status_history))
        .bind(next.expires_at)
        .bind(next.lock_time)
        .bind(next.release_time)
        .bind(next.withdrawal_time)
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            let current = self.get_intent(next.id).await?;
            return Ok(CommitOutcome::Conflict { current });
        }

        let release = match &commit.quota {
            QuotaAction::None => None,
            QuotaAction::Lock {
                lp_wallet_address,
                amount,
            } => {
                Self::lock_quota(&mut tx, next.id, next.platform, lp_wallet_address, *amount)
                    .await?;
                None
            }
            QuotaAction::Release => Some(Self::release_locked_quota(&mut tx, next.id).await?),
        };

        Self::upsert_task_pool(&mut tx, &TaskPoolEntry::from(next)).await?;
        tx.commit().await?;

        Ok(CommitOutcome::Committed {
            intent: commit.next,
            release,
        })
    }

    // ========== LP OPERATIONS ==========

    async fn insert_lp(&self, lp: &LiquidityProvider) -> AppResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO liquidity_providers (
                wallet_address, name, email, total_quota, locked_quota, per_transaction_quota,
                fee_rate, supported_platforms, paypal_email, is_active,
                completed_count, completed_volume, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (wallet_address) DO NOTHING
            "#,
        )
        .bind(&lp.wallet_address)
        .bind(&lp.name)
        .bind(&lp.email)
        .bind(lp.total_quota)
        .bind(lp.locked_quota)
        .bind(lp.per_transaction_quota)
        .bind(lp.fee_rate)
        .bind(Json(&lp.supported_platforms))
        .bind(&lp.paypal_email)
        .bind(lp.is_active)
        .bind(lp.completed_count)
        .bind(lp.completed_volume)
        .bind(lp.created_at)
        .bind(lp.updated_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(QuotaError::AlreadyRegistered(lp.wallet_address.clone()).into());
        }
        Ok(())
    }

    async fn get_lp(&self, wallet_address: &str) -> AppResult<Option<LiquidityProvider>> {
        let sql = format!(
            "SELECT {} FROM liquidity_providers WHERE wallet_address = $1",
            LP_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(wallet_address)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(LiquidityProvider::from_row).transpose()?)
    }

    async fn list_active_lps(&self) -> AppResult<Vec<LiquidityProvider>> {
        let sql = format!(
            "SELECT {} FROM liquidity_providers WHERE is_active ORDER BY fee_rate ASC",
            LP_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| LiquidityProvider::from_row(row).map_err(AppError::from))
            .collect()
    }

    async fn update_lp_quota(
        &self,
        wallet_address: &str,
        total_quota: Decimal,
        per_transaction_quota: Decimal,
    ) -> AppResult<LiquidityProvider> {
        let mut tx = self.begin_tx().await?;
        let mut lp = Self::lock_lp_row(&mut tx, wallet_address).await?;

        let mut balance = QuotaBalance::new(lp.total_quota, lp.locked_quota);
        balance.resize(total_quota)?;

        sqlx::query(
            r#"
            UPDATE liquidity_providers
            SET total_quota = $2, per_transaction_quota = $3, updated_at = NOW()
            WHERE wallet_address = $1
            "#,
        )
        .bind(wallet_address)
        .bind(balance.total)
        .bind(per_transaction_quota)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        lp.total_quota = balance.total;
        lp.per_transaction_quota = per_transaction_quota;
        lp.updated_at = Utc::now();
        Ok(lp)
    }

    async fn record_lp_completion(&self, wallet_address: &str, amount: Decimal) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE liquidity_providers
            SET completed_count = completed_count + 1,
                completed_volume = completed_volume + $2,
                updated_at = NOW()
            WHERE wallet_address = $1
            "#,
        )
        .bind(wallet_address)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========== QUOTA LEDGER ==========

    async fn list_quota_locks(&self) -> AppResult<Vec<QuotaLock>> {
        let locks = sqlx::query_as::<_, QuotaLock>(
            r#"
            SELECT intent_id, lp_wallet_address, amount, locked_at
            FROM quota_locks
            ORDER BY locked_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(locks)
    }

    async fn release_orphaned_lock(&self, intent_id: Uuid) -> AppResult<Option<ReleaseOutcome>> {
        let mut tx = self.begin_tx().await?;

        // The intent row lock orders this release against any transition of it
        let status: Option<IntentStatus> = sqlx::query_scalar(
            "SELECT status FROM payment_intents WHERE id = $1 FOR UPDATE",
        )
        .bind(intent_id)
        .fetch_optional(&mut *tx)
        .await?;
        if status.map_or(false, |status| status.holds_quota()) {
            tx.rollback().await?;
            return Ok(None);
        }

        let outcome = Self::release_locked_quota(&mut tx, intent_id).await?;
        tx.commit().await?;
        Ok(Some(outcome))
    }

    // ========== TASK POOL ==========

    async fn query_task_pool(&self, filter: &TaskPoolFilter) -> AppResult<Vec<TaskPoolEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT intent_id, status, amount, currency, platform,
                   lp_wallet_address, designated_lp_address, active, created_at, updated_at
            FROM task_pool
            WHERE (
                    status = 'created'
                    OR (
                        $1::text IS NOT NULL
                        AND lp_wallet_address = $1
                        AND status IN ('claimed', 'processing', 'paid', 'confirmed', 'settled')
                    )
                  )
              AND (active OR status = 'settled')
              AND ($2::payment_platform IS NULL OR platform = $2)
              AND ($3::numeric IS NULL OR amount >= $3)
              AND ($4::numeric IS NULL OR amount <= $4)
            ORDER BY created_at DESC
            "#,
        )
        .bind(&filter.wallet_address)
        .bind(filter.platform)
        .bind(filter.min_amount)
        .bind(filter.max_amount)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| TaskPoolEntry::from_row(row).map_err(AppError::from))
            .collect()
    }

    async fn rebuild_task_pool(&self) -> AppResult<usize> {
        let sql = format!("SELECT {} FROM payment_intents", INTENT_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let intents = Self::map_intents(rows)?;

        let mut tx = self.begin_tx().await?;
        sqlx::query("DELETE FROM task_pool").execute(&mut *tx).await?;
        for intent in &intents {
            Self::upsert_task_pool(&mut tx, &TaskPoolEntry::from(intent)).await?;
        }
        tx.commit().await?;

        Ok(intents.len())
    }

    // ========== AUDIT ==========

    async fn log_audit_event(
        &self,
        intent_id: Option<Uuid>,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, intent_id, event_type, details, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(intent_id)
        .bind(event_type)
        .bind(Json(details))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit_events(&self, intent_id: Uuid) -> AppResult<Vec<AuditLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, intent_id, event_type, details, created_at
            FROM audit_logs
            WHERE intent_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(intent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| AuditLog::from_row(row).map_err(AppError::from))
            .collect()
    }
}
