//! PostgreSQL adapter for the persistence gateway

use async_trait::async_trait;
use sqlx::{FromRow, PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Store, WEBHOOK_PROCESSING_TIMEOUT_MINUTES};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    normalize_email, BillingPeriod, CheckoutRefs, CheckoutSessionState, CheckoutSettlement,
    CreditUsage, Customer, CustomerProfile, GuardedAppend, Invoice, InvoiceRecorded,
    InvoiceStatus, InvoiceUpsert, MarkerConflict, NewCheckoutSession, NewCreditUsage,
    NewRefreshToken, NewSubscription, Plan, PlanSpec, RefreshTokenRecord, RotationOutcome,
    SettlementOutcome, SignupVerification, Subscription, SubscriptionPatch, User, WebhookClaim,
    WebhookEventRecord, WebhookEventStatus,
};

/// Persistence gateway backed by a PostgreSQL pool
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
}

// =============================================================================
// Row types for tables with enum-valued columns
// =============================================================================

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
    status: String,
    is_active: Option<bool>,
    period_start: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
    external_subscription_id: Option<String>,
    external_customer_id: Option<String>,
    credit_initial: i32,
    credit_used: i32,
    canceled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            is_active: row.is_active.unwrap_or(false),
            period_start: row.period_start,
            period_end: row.period_end,
            external_subscription_id: row.external_subscription_id,
            external_customer_id: row.external_customer_id,
            credit_initial: row.credit_initial,
            credit_used: row.credit_used,
            canceled_at: row.canceled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CheckoutRow {
    session_id: String,
    email: String,
    plan_code: String,
    currency: String,
    status: String,
    user_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    plan_id: Option<Uuid>,
    last_error: Option<String>,
    consumed_at: Option<OffsetDateTime>,
    completed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<CheckoutRow> for CheckoutSessionState {
    type Error = StoreError;

    fn try_from(row: CheckoutRow) -> Result<Self, Self::Error> {
        Ok(CheckoutSessionState {
            session_id: row.session_id,
            email: row.email,
            plan_code: row.plan_code,
            currency: row.currency,
            status: row.status.parse()?,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            plan_id: row.plan_id,
            last_error: row.last_error,
            consumed_at: row.consumed_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct InvoiceRow {
    id: Uuid,
    external_invoice_id: String,
    user_id: Uuid,
    subscription_id: Option<Uuid>,
    plan_id: Option<Uuid>,
    external_payment_intent_id: Option<String>,
    amount_due_cents: i64,
    amount_paid_cents: i64,
    currency: String,
    status: String,
    hosted_invoice_url: Option<String>,
    invoice_pdf: Option<String>,
    period_start: Option<OffsetDateTime>,
    period_end: Option<OffsetDateTime>,
    issued_at: Option<OffsetDateTime>,
    spend_recorded: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = StoreError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Invoice {
            id: row.id,
            external_invoice_id: row.external_invoice_id,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            plan_id: row.plan_id,
            external_payment_intent_id: row.external_payment_intent_id,
            amount_due_cents: row.amount_due_cents,
            amount_paid_cents: row.amount_paid_cents,
            currency: row.currency,
            status: row.status.parse()?,
            hosted_invoice_url: row.hosted_invoice_url,
            invoice_pdf: row.invoice_pdf,
            period_start: row.period_start,
            period_end: row.period_end,
            issued_at: row.issued_at,
            spend_recorded: row.spend_recorded,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct WebhookEventRow {
    event_id: String,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    error_message: Option<String>,
    attempts: i32,
    received_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

impl TryFrom<WebhookEventRow> for WebhookEventRecord {
    type Error = StoreError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEventRecord {
            event_id: row.event_id,
            event_type: row.event_type,
            payload: row.payload,
            status: row.status.parse()?,
            error_message: row.error_message,
            attempts: row.attempts,
            received_at: row.received_at,
            processed_at: row.processed_at,
        })
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

// =============================================================================
// Statements shared by standalone calls and larger transactions
// =============================================================================

async fn insert_subscription(
    conn: &mut PgConnection,
    new: &NewSubscription,
) -> StoreResult<Subscription> {
    let now = OffsetDateTime::now_utc();

    // Serialize activations per user so the partial unique index never trips
    sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(new.user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("user {}", new.user_id)))?;

    let period = if new.is_active {
        Some(new.period.unwrap_or_else(|| BillingPeriod::starting_at(now)))
    } else {
        new.period
    };

    if new.is_active {
        let retired = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = CASE
                    WHEN status IN ('canceled', 'expired', 'incomplete_expired') THEN status
                    ELSE 'canceled'
                END,
                is_active = NULL,
                period_end = $2,
                canceled_at = COALESCE(canceled_at, $2),
                updated_at = NOW()
            WHERE user_id = $1 AND is_active
            "#,
        )
        .bind(new.user_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        if retired.rows_affected() > 0 {
            tracing::info!(
                user_id = %new.user_id,
                "Previous current subscription retired before activation"
            );
        }
    }

    let row: SubscriptionRow = sqlx::query_as(
        r#"
        INSERT INTO subscriptions (
            id, user_id, plan_id, status, is_active, period_start, period_end,
            external_subscription_id, external_customer_id, credit_initial
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.user_id)
    .bind(new.plan_id)
    .bind(new.status.as_str())
    .bind(new.is_active.then_some(true))
    .bind(period.map(|p| p.start))
    .bind(period.map(|p| p.end))
    .bind(new.external_subscription_id.as_deref())
    .bind(new.external_customer_id.as_deref())
    .bind(new.credit_initial)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Conflict(format!("user {} already has a current subscription", new.user_id))
        } else {
            StoreError::Database(e)
        }
    })?;

    row.try_into()
}

async fn upsert_customer_row(
    conn: &mut PgConnection,
    user_id: Uuid,
    profile: &CustomerProfile,
) -> StoreResult<Customer> {
    let customer: Customer = sqlx::query_as(
        r#"
        INSERT INTO customers (
            id, user_id, external_customer_id, first_name, last_name, phone,
            address_line1, address_line2, postal_code, city, country
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (user_id) DO UPDATE SET
            external_customer_id = COALESCE(EXCLUDED.external_customer_id, customers.external_customer_id),
            first_name = COALESCE(EXCLUDED.first_name, customers.first_name),
            last_name = COALESCE(EXCLUDED.last_name, customers.last_name),
            phone = COALESCE(EXCLUDED.phone, customers.phone),
            address_line1 = COALESCE(EXCLUDED.address_line1, customers.address_line1),
            address_line2 = COALESCE(EXCLUDED.address_line2, customers.address_line2),
            postal_code = COALESCE(EXCLUDED.postal_code, customers.postal_code),
            city = COALESCE(EXCLUDED.city, customers.city),
            country = COALESCE(EXCLUDED.country, customers.country),
            updated_at = NOW()
        RETURNING id, user_id, external_customer_id, first_name, last_name, phone,
                  address_line1, address_line2, postal_code, city, country,
                  total_spent_cents, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(profile.external_customer_id.as_deref())
    .bind(profile.first_name.as_deref())
    .bind(profile.last_name.as_deref())
    .bind(profile.phone.as_deref())
    .bind(profile.address_line1.as_deref())
    .bind(profile.address_line2.as_deref())
    .bind(profile.postal_code.as_deref())
    .bind(profile.city.as_deref())
    .bind(profile.country.as_deref())
    .fetch_one(&mut *conn)
    .await?;

    Ok(customer)
}

async fn select_checkout(
    conn: &mut PgConnection,
    session_id: &str,
) -> StoreResult<Option<CheckoutSessionState>> {
    let row: Option<CheckoutRow> =
        sqlx::query_as("SELECT * FROM checkout_sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&mut *conn)
            .await?;
    row.map(TryInto::try_into).transpose()
}

async fn insert_usage_row(
    conn: &mut PgConnection,
    usage: &NewCreditUsage,
) -> StoreResult<CreditUsage> {
    let inserted: Option<CreditUsage> = sqlx::query_as(
        r#"
        INSERT INTO credit_usage (id, subscription_id, used, reason, request_ref)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (subscription_id, request_ref) WHERE request_ref IS NOT NULL DO NOTHING
        RETURNING id, subscription_id, used, reason, request_ref, occurred_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(usage.subscription_id)
    .bind(usage.used)
    .bind(&usage.reason)
    .bind(usage.request_ref.as_deref())
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = inserted {
        return Ok(row);
    }

    // Same request reference already recorded
    let existing: CreditUsage = sqlx::query_as(
        r#"
        SELECT id, subscription_id, used, reason, request_ref, occurred_at
        FROM credit_usage
        WHERE subscription_id = $1 AND request_ref = $2
        "#,
    )
    .bind(usage.subscription_id)
    .bind(usage.request_ref.as_deref())
    .fetch_one(&mut *conn)
    .await?;

    Ok(existing)
}

async fn sum_usage(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    since: OffsetDateTime,
) -> StoreResult<i64> {
    let (used,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(used), 0)::BIGINT
        FROM credit_usage
        WHERE subscription_id = $1 AND occurred_at > $2
        "#,
    )
    .bind(subscription_id)
    .bind(since)
    .fetch_one(&mut *conn)
    .await?;
    Ok(used)
}

#[async_trait]
impl Store for PgStore {
    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, password_hash, created_at, updated_at FROM users WHERE email = $1",
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, password_hash, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn save_verified_signup(&self, email: &str, password_hash: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO signup_verifications (email, password_hash, verified_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (email) DO UPDATE SET
                password_hash = EXCLUDED.password_hash,
                verified_at = NOW()
            WHERE NOT signup_verifications.account_created
            "#,
        )
        .bind(normalize_email(email))
        .bind(password_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_verified_signup(&self, email: &str) -> StoreResult<Option<SignupVerification>> {
        let signup = sqlx::query_as::<_, SignupVerification>(
            r#"
            SELECT email, password_hash, verified_at, account_created
            FROM signup_verifications
            WHERE email = $1
            "#,
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;
        Ok(signup)
    }

    async fn discard_unverified_signup(&self, email: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM signup_verifications WHERE email = $1 AND NOT account_created",
        )
        .bind(normalize_email(email))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_plan_by_code(&self, code: &str) -> StoreResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(
            r#"
            SELECT id, code, name, price_cents, currency, billing_interval,
                   daily_credit_quota, external_price_id, is_archived, created_at, updated_at
            FROM plans WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn get_plan(&self, id: Uuid) -> StoreResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(
            r#"
            SELECT id, code, name, price_cents, currency, billing_interval,
                   daily_credit_quota, external_price_id, is_archived, created_at, updated_at
            FROM plans WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn upsert_plan(&self, spec: &PlanSpec) -> StoreResult<Plan> {
        let plan = sqlx::query_as::<_, Plan>(
            r#"
            INSERT INTO plans (
                id, code, name, price_cents, currency, billing_interval,
                daily_credit_quota, external_price_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (code) DO UPDATE SET
                name = EXCLUDED.name,
                price_cents = EXCLUDED.price_cents,
                currency = EXCLUDED.currency,
                billing_interval = EXCLUDED.billing_interval,
                daily_credit_quota = EXCLUDED.daily_credit_quota,
                external_price_id = COALESCE(EXCLUDED.external_price_id, plans.external_price_id),
                updated_at = NOW()
            RETURNING id, code, name, price_cents, currency, billing_interval,
                      daily_credit_quota, external_price_id, is_archived, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&spec.code)
        .bind(&spec.name)
        .bind(spec.price_cents)
        .bind(&spec.currency)
        .bind(&spec.billing_interval)
        .bind(spec.daily_credit_quota)
        .bind(spec.external_price_id.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn create_subscription(&self, new: &NewSubscription) -> StoreResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        let subscription = insert_subscription(&mut tx, new).await?;
        tx.commit().await?;
        Ok(subscription)
    }

    async fn update_subscription(
        &self,
        id: Uuid,
        patch: &SubscriptionPatch,
    ) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            UPDATE subscriptions SET
                status = COALESCE($2, status),
                is_active = CASE WHEN $3 THEN NULL ELSE is_active END,
                external_subscription_id = COALESCE($4, external_subscription_id),
                external_customer_id = COALESCE($5, external_customer_id),
                period_start = COALESCE($6, period_start),
                period_end = COALESCE($7, period_end),
                canceled_at = COALESCE($8, canceled_at),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.clears_marker())
        .bind(patch.external_subscription_id.as_deref())
        .bind(patch.external_customer_id.as_deref())
        .bind(patch.period_start)
        .bind(patch.period_end)
        .bind(patch.canceled_at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn current_subscription(&self, user_id: Uuid) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE user_id = $1 AND is_active LIMIT 1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE external_subscription_id = $1
            ORDER BY is_active IS NULL, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_subscription_by_external_customer(
        &self,
        external_customer_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE external_customer_id = $1
            ORDER BY is_active IS NULL, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(external_customer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn append_usage(&self, usage: &NewCreditUsage) -> StoreResult<CreditUsage> {
        let mut conn = self.pool.acquire().await?;
        insert_usage_row(&mut conn, usage).await
    }

    async fn append_usage_guarded(
        &self,
        usage: &NewCreditUsage,
        quota: i64,
        since: OffsetDateTime,
    ) -> StoreResult<GuardedAppend> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the subscription serializes concurrent consumers
        sqlx::query("SELECT id FROM subscriptions WHERE id = $1 FOR UPDATE")
            .bind(usage.subscription_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                StoreError::NotFound(format!("subscription {}", usage.subscription_id))
            })?;

        if let Some(request_ref) = usage.request_ref.as_deref() {
            let existing: Option<CreditUsage> = sqlx::query_as(
                r#"
                SELECT id, subscription_id, used, reason, request_ref, occurred_at
                FROM credit_usage
                WHERE subscription_id = $1 AND request_ref = $2
                "#,
            )
            .bind(usage.subscription_id)
            .bind(request_ref)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                tx.commit().await?;
                return Ok(GuardedAppend::Appended(row));
            }
        }

        let used = sum_usage(&mut tx, usage.subscription_id, since).await?;
        if used + i64::from(usage.used) > quota {
            tx.rollback().await?;
            return Ok(GuardedAppend::Rejected { used });
        }

        let row = insert_usage_row(&mut tx, usage).await?;
        tx.commit().await?;
        Ok(GuardedAppend::Appended(row))
    }

    async fn sum_usage_since(
        &self,
        subscription_id: Uuid,
        since: OffsetDateTime,
    ) -> StoreResult<i64> {
        let mut conn = self.pool.acquire().await?;
        sum_usage(&mut conn, subscription_id, since).await
    }

    async fn list_usage(&self, subscription_id: Uuid, limit: i64) -> StoreResult<Vec<CreditUsage>> {
        let rows = sqlx::query_as::<_, CreditUsage>(
            r#"
            SELECT id, subscription_id, used, reason, request_ref, occurred_at
            FROM credit_usage
            WHERE subscription_id = $1
            ORDER BY occurred_at DESC
            LIMIT $2
            "#,
        )
        .bind(subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_refresh_token(
        &self,
        token: &NewRefreshToken,
    ) -> StoreResult<RefreshTokenRecord> {
        let record = sqlx::query_as::<_, RefreshTokenRecord>(
            r#"
            INSERT INTO refresh_tokens (jti, user_id, expires_at, ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&token.jti)
        .bind(token.user_id)
        .bind(token.expires_at)
        .bind(token.ip_address.as_deref())
        .bind(token.user_agent.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn find_refresh_token(&self, jti: &str) -> StoreResult<Option<RefreshTokenRecord>> {
        let record =
            sqlx::query_as::<_, RefreshTokenRecord>("SELECT * FROM refresh_tokens WHERE jti = $1")
                .bind(jti)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn rotate_refresh_token(
        &self,
        old_jti: &str,
        next: &NewRefreshToken,
    ) -> StoreResult<RotationOutcome> {
        let mut tx = self.pool.begin().await?;

        // A concurrent rotation blocks here and then sees the revoked row
        let current = sqlx::query_as::<_, RefreshTokenRecord>(
            "SELECT * FROM refresh_tokens WHERE jti = $1 FOR UPDATE",
        )
        .bind(old_jti)
        .fetch_optional(&mut *tx)
        .await?;

        let current = match current {
            None => return Ok(RotationOutcome::NotFound),
            Some(record) if record.is_revoked() => {
                return Ok(RotationOutcome::AlreadyRevoked(record))
            }
            Some(record) => record,
        };

        let child = sqlx::query_as::<_, RefreshTokenRecord>(
            r#"
            INSERT INTO refresh_tokens (jti, user_id, expires_at, ip_address, user_agent, parent_jti)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&next.jti)
        .bind(next.user_id)
        .bind(next.expires_at)
        .bind(next.ip_address.as_deref())
        .bind(next.user_agent.as_deref())
        .bind(&current.jti)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = NOW(), revocation_reason = 'rotated', replaced_by = $2
            WHERE jti = $1
            "#,
        )
        .bind(&current.jti)
        .bind(&child.jti)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RotationOutcome::Rotated(child))
    }

    async fn revoke_refresh_chain(&self, jti: &str, reason: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            WITH RECURSIVE chain AS (
                SELECT jti FROM refresh_tokens WHERE jti = $1
                UNION ALL
                SELECT r.jti FROM refresh_tokens r JOIN chain c ON r.parent_jti = c.jti
            )
            UPDATE refresh_tokens
            SET revoked_at = NOW(), revocation_reason = $2
            WHERE jti IN (SELECT jti FROM chain) AND revoked_at IS NULL
            "#,
        )
        .bind(jti)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_all_refresh_tokens(&self, user_id: Uuid, reason: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked_at = NOW(), revocation_reason = $2
            WHERE user_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn checkout_get_or_create(
        &self,
        new: &NewCheckoutSession,
    ) -> StoreResult<CheckoutSessionState> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO checkout_sessions (session_id, email, plan_code, currency)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(&new.session_id)
        .bind(normalize_email(&new.email))
        .bind(&new.plan_code)
        .bind(&new.currency)
        .execute(&mut *conn)
        .await?;

        select_checkout(&mut conn, &new.session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("checkout session {}", new.session_id)))
    }

    async fn checkout_get(&self, session_id: &str) -> StoreResult<Option<CheckoutSessionState>> {
        let mut conn = self.pool.acquire().await?;
        select_checkout(&mut conn, session_id).await
    }

    async fn checkout_complete(
        &self,
        session_id: &str,
        refs: &CheckoutRefs,
    ) -> StoreResult<Option<CheckoutSessionState>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            r#"
            UPDATE checkout_sessions
            SET status = 'completed', user_id = $2, subscription_id = $3, plan_id = $4,
                completed_at = NOW(), updated_at = NOW()
            WHERE session_id = $1 AND status = 'pending'
            "#,
        )
        .bind(session_id)
        .bind(refs.user_id)
        .bind(refs.subscription_id)
        .bind(refs.plan_id)
        .execute(&mut *conn)
        .await?;

        select_checkout(&mut conn, session_id).await
    }

    async fn checkout_fail(
        &self,
        session_id: &str,
        reason: &str,
    ) -> StoreResult<Option<CheckoutSessionState>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            r#"
            UPDATE checkout_sessions
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE session_id = $1 AND status = 'pending'
            "#,
        )
        .bind(session_id)
        .bind(reason)
        .execute(&mut *conn)
        .await?;

        select_checkout(&mut conn, session_id).await
    }

    async fn checkout_mark_consumed(&self, session_id: &str) -> StoreResult<bool> {
        let claimed = sqlx::query(
            r#"
            UPDATE checkout_sessions
            SET consumed_at = NOW(), updated_at = NOW()
            WHERE session_id = $1 AND status = 'completed' AND consumed_at IS NULL
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(claimed.rows_affected() == 1)
    }

    async fn checkout_delete_pending(
        &self,
        session_id: &str,
    ) -> StoreResult<Option<CheckoutSessionState>> {
        let row: Option<CheckoutRow> = sqlx::query_as(
            "DELETE FROM checkout_sessions WHERE session_id = $1 AND status = 'pending' RETURNING *",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn checkout_expire_stale(
        &self,
        older_than: OffsetDateTime,
        reason: &str,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE checkout_sessions
            SET status = 'failed', last_error = $2, updated_at = NOW()
            WHERE status = 'pending' AND created_at < $1
            "#,
        )
        .bind(older_than)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn settle_checkout(
        &self,
        settlement: &CheckoutSettlement,
    ) -> StoreResult<SettlementOutcome> {
        let mut tx = self.pool.begin().await?;
        let session = &settlement.session;

        sqlx::query(
            r#"
            INSERT INTO checkout_sessions (session_id, email, plan_code, currency)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(&session.session_id)
        .bind(normalize_email(&session.email))
        .bind(&session.plan_code)
        .bind(&session.currency)
        .execute(&mut *tx)
        .await?;

        // Redeliveries of the same session queue up behind this lock
        let locked: CheckoutRow =
            sqlx::query_as("SELECT * FROM checkout_sessions WHERE session_id = $1 FOR UPDATE")
                .bind(&session.session_id)
                .fetch_one(&mut *tx)
                .await?;
        let state: CheckoutSessionState = locked.try_into()?;

        if state.status.is_terminal() {
            tx.commit().await?;
            return Ok(SettlementOutcome::AlreadyTerminal(state));
        }

        let email = normalize_email(&state.email);
        let existing = sqlx::query_as::<_, User>(
            "SELECT id, email, password_hash, created_at, updated_at FROM users WHERE email = $1",
        )
        .bind(&email)
        .fetch_optional(&mut *tx)
        .await?;

        let user = match existing {
            Some(user) => user,
            None => {
                let signup = sqlx::query_as::<_, SignupVerification>(
                    r#"
                    SELECT email, password_hash, verified_at, account_created
                    FROM signup_verifications
                    WHERE email = $1 AND verified_at IS NOT NULL
                    FOR UPDATE
                    "#,
                )
                .bind(&email)
                .fetch_optional(&mut *tx)
                .await?;

                let Some(signup) = signup else {
                    // Keep the pending row so the session can be retried later
                    tx.commit().await?;
                    return Ok(SettlementOutcome::NoVerifiedSignup);
                };

                let user = sqlx::query_as::<_, User>(
                    r#"
                    INSERT INTO users (id, email, password_hash)
                    VALUES ($1, $2, $3)
                    RETURNING id, email, password_hash, created_at, updated_at
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(&email)
                .bind(&signup.password_hash)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        StoreError::Conflict(format!("user {email} created concurrently"))
                    } else {
                        StoreError::Database(e)
                    }
                })?;

                sqlx::query(
                    "UPDATE signup_verifications SET account_created = TRUE WHERE email = $1",
                )
                .bind(&email)
                .execute(&mut *tx)
                .await?;

                tracing::info!(user_id = %user.id, "Account created from verified signup");
                user
            }
        };

        upsert_customer_row(&mut tx, user.id, &settlement.profile).await?;

        let subscription = insert_subscription(
            &mut tx,
            &NewSubscription {
                user_id: user.id,
                plan_id: settlement.plan_id,
                is_active: true,
                status: crate::models::SubscriptionStatus::Active,
                credit_initial: settlement.credit_initial,
                period: settlement.period,
                external_subscription_id: settlement.external_subscription_id.clone(),
                external_customer_id: settlement.external_customer_id.clone(),
            },
        )
        .await?;

        let completed: CheckoutRow = sqlx::query_as(
            r#"
            UPDATE checkout_sessions
            SET status = 'completed', user_id = $2, subscription_id = $3, plan_id = $4,
                completed_at = NOW(), updated_at = NOW()
            WHERE session_id = $1
            RETURNING *
            "#,
        )
        .bind(&session.session_id)
        .bind(user.id)
        .bind(subscription.id)
        .bind(settlement.plan_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SettlementOutcome::Completed(completed.try_into()?))
    }

    async fn upsert_customer(
        &self,
        user_id: Uuid,
        profile: &CustomerProfile,
    ) -> StoreResult<Customer> {
        let mut conn = self.pool.acquire().await?;
        upsert_customer_row(&mut conn, user_id, profile).await
    }

    async fn find_customer_by_user(&self, user_id: Uuid) -> StoreResult<Option<Customer>> {
        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT id, user_id, external_customer_id, first_name, last_name, phone,
                   address_line1, address_line2, postal_code, city, country,
                   total_spent_cents, created_at, updated_at
            FROM customers WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(customer)
    }

    async fn find_customer_by_external_id(
        &self,
        external_customer_id: &str,
    ) -> StoreResult<Option<Customer>> {
        let customer = sqlx::query_as::<_, Customer>(
            r#"
            SELECT id, user_id, external_customer_id, first_name, last_name, phone,
                   address_line1, address_line2, postal_code, city, country,
                   total_spent_cents, created_at, updated_at
            FROM customers WHERE external_customer_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(external_customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(customer)
    }

    async fn record_invoice(&self, invoice: &InvoiceUpsert) -> StoreResult<InvoiceRecorded> {
        let mut tx = self.pool.begin().await?;

        // A paid invoice never goes back to unpaid on a late or replayed failure
        let row: InvoiceRow = sqlx::query_as(
            r#"
            INSERT INTO invoices (
                id, external_invoice_id, user_id, subscription_id, plan_id,
                external_payment_intent_id, amount_due_cents, amount_paid_cents, currency,
                status, hosted_invoice_url, invoice_pdf, period_start, period_end, issued_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (external_invoice_id) DO UPDATE SET
                subscription_id = COALESCE(EXCLUDED.subscription_id, invoices.subscription_id),
                plan_id = COALESCE(EXCLUDED.plan_id, invoices.plan_id),
                external_payment_intent_id = COALESCE(EXCLUDED.external_payment_intent_id, invoices.external_payment_intent_id),
                amount_due_cents = EXCLUDED.amount_due_cents,
                amount_paid_cents = GREATEST(EXCLUDED.amount_paid_cents, invoices.amount_paid_cents),
                currency = EXCLUDED.currency,
                status = CASE WHEN invoices.status = 'paid' THEN 'paid' ELSE EXCLUDED.status END,
                hosted_invoice_url = COALESCE(EXCLUDED.hosted_invoice_url, invoices.hosted_invoice_url),
                invoice_pdf = COALESCE(EXCLUDED.invoice_pdf, invoices.invoice_pdf),
                period_start = COALESCE(EXCLUDED.period_start, invoices.period_start),
                period_end = COALESCE(EXCLUDED.period_end, invoices.period_end),
                issued_at = COALESCE(EXCLUDED.issued_at, invoices.issued_at),
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&invoice.external_invoice_id)
        .bind(invoice.user_id)
        .bind(invoice.subscription_id)
        .bind(invoice.plan_id)
        .bind(invoice.external_payment_intent_id.as_deref())
        .bind(invoice.amount_due_cents)
        .bind(invoice.amount_paid_cents)
        .bind(&invoice.currency)
        .bind(invoice.status.as_str())
        .bind(invoice.hosted_invoice_url.as_deref())
        .bind(invoice.invoice_pdf.as_deref())
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.issued_at)
        .fetch_one(&mut *tx)
        .await?;

        let mut stored: Invoice = row.try_into()?;
        let mut spend_added = false;

        if stored.status == InvoiceStatus::Paid && !stored.spend_recorded {
            let claimed: Option<(i64,)> = sqlx::query_as(
                r#"
                UPDATE invoices SET spend_recorded = TRUE
                WHERE id = $1 AND status = 'paid' AND NOT spend_recorded
                RETURNING amount_paid_cents
                "#,
            )
            .bind(stored.id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((amount,)) = claimed {
                sqlx::query(
                    r#"
                    INSERT INTO customers (id, user_id, total_spent_cents)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (user_id) DO UPDATE SET
                        total_spent_cents = customers.total_spent_cents + EXCLUDED.total_spent_cents,
                        updated_at = NOW()
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(stored.user_id)
                .bind(amount)
                .execute(&mut *tx)
                .await?;

                stored.spend_recorded = true;
                spend_added = true;
            }
        }

        tx.commit().await?;
        Ok(InvoiceRecorded {
            invoice: stored,
            spend_added,
        })
    }

    async fn find_invoice(&self, external_invoice_id: &str) -> StoreResult<Option<Invoice>> {
        let row: Option<InvoiceRow> =
            sqlx::query_as("SELECT * FROM invoices WHERE external_invoice_id = $1")
                .bind(external_invoice_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<WebhookClaim> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (event_id, event_type, payload, status)
            VALUES ($1, $2, $3, 'processing')
            ON CONFLICT (event_id) DO UPDATE SET
                status = 'processing',
                attempts = webhook_events.attempts + 1,
                processing_started_at = NOW(),
                error_message = NULL
            WHERE webhook_events.status = 'failed'
               OR (webhook_events.status = 'processing'
                   AND webhook_events.processing_started_at < NOW() - make_interval(mins => $4))
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .bind(WEBHOOK_PROCESSING_TIMEOUT_MINUTES as i32)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(WebhookClaim::Claimed);
        }

        let (status,): (String,) =
            sqlx::query_as("SELECT status FROM webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(WebhookClaim::Duplicate(status.parse()?))
    }

    async fn finish_webhook_event(&self, event_id: &str, error: Option<&str>) -> StoreResult<()> {
        let status = if error.is_some() {
            WebhookEventStatus::Failed
        } else {
            WebhookEventStatus::Processed
        };

        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, error_message = $3, processed_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_webhook_event(&self, event_id: &str) -> StoreResult<Option<WebhookEventRecord>> {
        let row: Option<WebhookEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, payload, status, error_message, attempts,
                   received_at, processed_at
            FROM webhook_events WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_failed_webhook_events(
        &self,
        limit: i64,
    ) -> StoreResult<Vec<WebhookEventRecord>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, payload, status, error_message, attempts,
                   received_at, processed_at
            FROM webhook_events
            WHERE status = 'failed'
            ORDER BY received_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_marker_conflicts(&self) -> StoreResult<Vec<MarkerConflict>> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*)
            FROM subscriptions
            WHERE is_active
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, active_count)| MarkerConflict {
                user_id,
                active_count,
            })
            .collect())
    }

    async fn find_completed_checkouts_without_subscription(&self) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT session_id FROM checkout_sessions
            WHERE status = 'completed' AND subscription_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn find_current_subscriptions_on_archived_plans(&self) -> StoreResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT s.id FROM subscriptions s
            JOIN plans p ON p.id = s.plan_id
            WHERE s.is_active AND p.is_archived
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
