//! PostgreSQL-backed [`CollectionsStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{
    Customer, EscalationAlert, Mandate, MandateStatus, PaymentInstance, PaymentStatus, PeriodKey,
    SubjectType, Subscription, SubscriptionStatus,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{webhook_lease_cutoff, CollectionsStore, WebhookClaim};

const CUSTOMER_COLUMNS: &str =
    "customer_id, legal_name, email, country, gateway_customer_id, created_utc, updated_utc";

const MANDATE_COLUMNS: &str = "mandate_id, customer_id, contract_id, gateway_mandate_id, reference, scheme, status, status_reason, expires_on, created_utc, updated_utc, cancelled_utc";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, mandate_id, contract_id, amount, currency, cadence, anchor_day, starts_on, status, created_utc, updated_utc, cancelled_utc";

const PAYMENT_COLUMNS: &str = "payment_id, subscription_id, period_key, amount, currency, due_date, notify_by, status, gateway_payment_id, last_error, return_code, notify_attempts, notified_utc, submitted_utc, created_utc, updated_utc, version";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn db_error(operation: &str, e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return AppError::Conflict(anyhow::anyhow!("{}: {}", operation, db.message()));
        }
    }
    AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", operation, e))
}

fn parse<T: FromStr<Err = String>>(value: String) -> Result<T, AppError> {
    value
        .parse()
        .map_err(|e: String| AppError::DatabaseError(anyhow::anyhow!("Corrupt row: {}", e)))
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T, AppError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read {}: {}", name, e)))
}

fn customer_from_row(row: &PgRow) -> Result<Customer, AppError> {
    Ok(Customer {
        customer_id: col(row, "customer_id")?,
        legal_name: col(row, "legal_name")?,
        email: col(row, "email")?,
        country: col(row, "country")?,
        gateway_customer_id: col(row, "gateway_customer_id")?,
        created_utc: col(row, "created_utc")?,
        updated_utc: col(row, "updated_utc")?,
    })
}

fn mandate_from_row(row: &PgRow) -> Result<Mandate, AppError> {
    Ok(Mandate {
        mandate_id: col(row, "mandate_id")?,
        customer_id: col(row, "customer_id")?,
        contract_id: col(row, "contract_id")?,
        gateway_mandate_id: col(row, "gateway_mandate_id")?,
        reference: col(row, "reference")?,
        scheme: parse(col(row, "scheme")?)?,
        status: parse(col(row, "status")?)?,
        status_reason: col(row, "status_reason")?,
        expires_on: col(row, "expires_on")?,
        created_utc: col(row, "created_utc")?,
        updated_utc: col(row, "updated_utc")?,
        cancelled_utc: col(row, "cancelled_utc")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, AppError> {
    let anchor_day: i32 = col(row, "anchor_day")?;
    Ok(Subscription {
        subscription_id: col(row, "subscription_id")?,
        mandate_id: col(row, "mandate_id")?,
        contract_id: col(row, "contract_id")?,
        amount: col(row, "amount")?,
        currency: col(row, "currency")?,
        cadence: parse(col(row, "cadence")?)?,
        anchor_day: u32::try_from(anchor_day)
            .map_err(|_| AppError::DatabaseError(anyhow::anyhow!("Corrupt anchor day")))?,
        starts_on: col(row, "starts_on")?,
        status: parse(col(row, "status")?)?,
        created_utc: col(row, "created_utc")?,
        updated_utc: col(row, "updated_utc")?,
        cancelled_utc: col(row, "cancelled_utc")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<PaymentInstance, AppError> {
    let period_key: String = col(row, "period_key")?;
    Ok(PaymentInstance {
        payment_id: col(row, "payment_id")?,
        subscription_id: col(row, "subscription_id")?,
        period_key: period_key
            .parse()
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Corrupt row: {}", e)))?,
        amount: col(row, "amount")?,
        currency: col(row, "currency")?,
        due_date: col(row, "due_date")?,
        notify_by: col(row, "notify_by")?,
        status: parse(col(row, "status")?)?,
        gateway_payment_id: col(row, "gateway_payment_id")?,
        last_error: col(row, "last_error")?,
        return_code: col(row, "return_code")?,
        notify_attempts: col(row, "notify_attempts")?,
        notified_utc: col(row, "notified_utc")?,
        submitted_utc: col(row, "submitted_utc")?,
        created_utc: col(row, "created_utc")?,
        updated_utc: col(row, "updated_utc")?,
        version: col(row, "version")?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<EscalationAlert, AppError> {
    Ok(EscalationAlert {
        alert_id: col(row, "alert_id")?,
        subject_id: col(row, "subject_id")?,
        subject_type: parse(col(row, "subject_type")?)?,
        stage: parse(col(row, "stage")?)?,
        sent_utc: col(row, "sent_utc")?,
    })
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "collections-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_optional<T>(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        map: fn(&PgRow) -> Result<T, AppError>,
    ) -> Result<Option<T>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error(operation, e))?;
        timer.observe_duration();
        row.as_ref().map(map).transpose()
    }

    async fn fetch_all<T>(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        map: fn(&PgRow) -> Result<T, AppError>,
    ) -> Result<Vec<T>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error(operation, e))?;
        timer.observe_duration();
        rows.iter().map(map).collect()
    }

    async fn execute(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| db_error(operation, e))?;
        timer.observe_duration();
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CollectionsStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        self.execute("health_check", sqlx::query("SELECT 1"))
            .await
            .map(|_| ())
    }

    // =========================================================================
    // Customer Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_customer(&self, customer_id: Uuid) -> Result<Option<Customer>, AppError> {
        let sql = format!("SELECT {} FROM customers WHERE customer_id = $1", CUSTOMER_COLUMNS);
        self.fetch_optional("get_customer", sqlx::query(&sql).bind(customer_id), customer_from_row)
            .await
    }

    #[instrument(skip(self, customer), fields(customer_id = %customer.customer_id))]
    async fn upsert_customer(&self, customer: &Customer) -> Result<Customer, AppError> {
        let sql = format!(
            r#"
            INSERT INTO customers (customer_id, legal_name, email, country, gateway_customer_id, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (customer_id) DO UPDATE SET
                email = EXCLUDED.email,
                gateway_customer_id = COALESCE(EXCLUDED.gateway_customer_id, customers.gateway_customer_id),
                updated_utc = EXCLUDED.updated_utc
            RETURNING {}
            "#,
            CUSTOMER_COLUMNS
        );
        let query = sqlx::query(&sql)
            .bind(customer.customer_id)
            .bind(&customer.legal_name)
            .bind(&customer.email)
            .bind(&customer.country)
            .bind(&customer.gateway_customer_id)
            .bind(customer.created_utc)
            .bind(customer.updated_utc);
        self.fetch_optional("upsert_customer", query, customer_from_row)
            .await?
            .ok_or_else(|| AppError::DatabaseError(anyhow::anyhow!("Customer upsert returned no row")))
    }

    // =========================================================================
    // Mandate Operations
    // =========================================================================

    #[instrument(skip(self, mandate), fields(mandate_id = %mandate.mandate_id))]
    async fn insert_mandate(&self, mandate: &Mandate) -> Result<(), AppError> {
        let query = sqlx::query(
            r#"
            INSERT INTO mandates (mandate_id, customer_id, contract_id, gateway_mandate_id, reference, scheme, status, status_reason, expires_on, created_utc, updated_utc, cancelled_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(mandate.mandate_id)
        .bind(mandate.customer_id)
        .bind(mandate.contract_id)
        .bind(&mandate.gateway_mandate_id)
        .bind(&mandate.reference)
        .bind(mandate.scheme.as_str())
        .bind(mandate.status.as_str())
        .bind(&mandate.status_reason)
        .bind(mandate.expires_on)
        .bind(mandate.created_utc)
        .bind(mandate.updated_utc)
        .bind(mandate.cancelled_utc);
        self.execute("insert_mandate", query).await?;
        info!(mandate_id = %mandate.mandate_id, status = %mandate.status, "Mandate stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_mandate(&self, mandate_id: Uuid) -> Result<Option<Mandate>, AppError> {
        let sql = format!("SELECT {} FROM mandates WHERE mandate_id = $1", MANDATE_COLUMNS);
        self.fetch_optional("get_mandate", sqlx::query(&sql).bind(mandate_id), mandate_from_row)
            .await
    }

    #[instrument(skip(self))]
    async fn find_mandate_by_gateway_id(
        &self,
        gateway_mandate_id: &str,
    ) -> Result<Option<Mandate>, AppError> {
        let sql = format!(
            "SELECT {} FROM mandates WHERE gateway_mandate_id = $1",
            MANDATE_COLUMNS
        );
        self.fetch_optional(
            "find_mandate_by_gateway_id",
            sqlx::query(&sql).bind(gateway_mandate_id),
            mandate_from_row,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn mandates_for_contract(
        &self,
        customer_id: Uuid,
        contract_id: Uuid,
    ) -> Result<Vec<Mandate>, AppError> {
        let sql = format!(
            "SELECT {} FROM mandates WHERE customer_id = $1 AND contract_id = $2 ORDER BY created_utc",
            MANDATE_COLUMNS
        );
        self.fetch_all(
            "mandates_for_contract",
            sqlx::query(&sql).bind(customer_id).bind(contract_id),
            mandate_from_row,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_mandates(&self, status: MandateStatus) -> Result<Vec<Mandate>, AppError> {
        let sql = format!(
            "SELECT {} FROM mandates WHERE status = $1 ORDER BY created_utc",
            MANDATE_COLUMNS
        );
        self.fetch_all(
            "list_mandates",
            sqlx::query(&sql).bind(status.as_str()),
            mandate_from_row,
        )
        .await
    }

    #[instrument(skip(self, mandate), fields(mandate_id = %mandate.mandate_id, expected = %expected, status = %mandate.status))]
    async fn update_mandate(
        &self,
        mandate: &Mandate,
        expected: MandateStatus,
    ) -> Result<bool, AppError> {
        let query = sqlx::query(
            r#"
            UPDATE mandates
            SET status = $3, status_reason = $4, updated_utc = $5, cancelled_utc = $6
            WHERE mandate_id = $1 AND status = $2
            "#,
        )
        .bind(mandate.mandate_id)
        .bind(expected.as_str())
        .bind(mandate.status.as_str())
        .bind(&mandate.status_reason)
        .bind(mandate.updated_utc)
        .bind(mandate.cancelled_utc);
        Ok(self.execute("update_mandate", query).await? == 1)
    }

    // =========================================================================
    // Subscription Operations
    // =========================================================================

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), AppError> {
        let query = sqlx::query(
            r#"
            INSERT INTO subscriptions (subscription_id, mandate_id, contract_id, amount, currency, cadence, anchor_day, starts_on, status, created_utc, updated_utc, cancelled_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(subscription.mandate_id)
        .bind(subscription.contract_id)
        .bind(subscription.amount)
        .bind(&subscription.currency)
        .bind(subscription.cadence.as_str())
        .bind(subscription.anchor_day as i32)
        .bind(subscription.starts_on)
        .bind(subscription.status.as_str())
        .bind(subscription.created_utc)
        .bind(subscription.updated_utc)
        .bind(subscription.cancelled_utc);
        self.execute("insert_subscription", query).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_optional(
            "get_subscription",
            sqlx::query(&sql).bind(subscription_id),
            subscription_from_row,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn subscription_for_contract(
        &self,
        contract_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE contract_id = $1 AND status <> 'cancelled'",
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_optional(
            "subscription_for_contract",
            sqlx::query(&sql).bind(contract_id),
            subscription_from_row,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn subscriptions_for_mandate(
        &self,
        mandate_id: Uuid,
    ) -> Result<Vec<Subscription>, AppError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE mandate_id = $1 ORDER BY created_utc",
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_all(
            "subscriptions_for_mandate",
            sqlx::query(&sql).bind(mandate_id),
            subscription_from_row,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_subscriptions(
        &self,
        status: SubscriptionStatus,
    ) -> Result<Vec<Subscription>, AppError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE status = $1 ORDER BY created_utc",
            SUBSCRIPTION_COLUMNS
        );
        self.fetch_all(
            "list_subscriptions",
            sqlx::query(&sql).bind(status.as_str()),
            subscription_from_row,
        )
        .await
    }

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id, expected = %expected))]
    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected: SubscriptionStatus,
    ) -> Result<bool, AppError> {
        let query = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $3, amount = $4, updated_utc = $5, cancelled_utc = $6
            WHERE subscription_id = $1 AND status = $2
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(expected.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.amount)
        .bind(subscription.updated_utc)
        .bind(subscription.cancelled_utc);
        Ok(self.execute("update_subscription", query).await? == 1)
    }

    // =========================================================================
    // Payment Instance Operations
    // =========================================================================

    #[instrument(skip(self, payment), fields(subscription_id = %payment.subscription_id, period = %payment.period_key))]
    async fn insert_payment_if_absent(
        &self,
        payment: &PaymentInstance,
    ) -> Result<(PaymentInstance, bool), AppError> {
        let sql = format!(
            r#"
            INSERT INTO payment_instances ({cols})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (subscription_id, period_key) DO NOTHING
            RETURNING {cols}
            "#,
            cols = PAYMENT_COLUMNS
        );
        let query = sqlx::query(&sql)
            .bind(payment.payment_id)
            .bind(payment.subscription_id)
            .bind(payment.period_key.to_string())
            .bind(payment.amount)
            .bind(&payment.currency)
            .bind(payment.due_date)
            .bind(payment.notify_by)
            .bind(payment.status.as_str())
            .bind(&payment.gateway_payment_id)
            .bind(&payment.last_error)
            .bind(&payment.return_code)
            .bind(payment.notify_attempts)
            .bind(payment.notified_utc)
            .bind(payment.submitted_utc)
            .bind(payment.created_utc)
            .bind(payment.updated_utc)
            .bind(payment.version);

        if let Some(created) = self
            .fetch_optional("insert_payment", query, payment_from_row)
            .await?
        {
            return Ok((created, true));
        }

        let existing = self
            .payment_for_period(payment.subscription_id, payment.period_key)
            .await?
            .ok_or_else(|| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Payment for {} vanished after conflict",
                    payment.period_key
                ))
            })?;
        Ok((existing, false))
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<PaymentInstance>, AppError> {
        let sql = format!(
            "SELECT {} FROM payment_instances WHERE payment_id = $1",
            PAYMENT_COLUMNS
        );
        self.fetch_optional("get_payment", sqlx::query(&sql).bind(payment_id), payment_from_row)
            .await
    }

    #[instrument(skip(self))]
    async fn find_payment_by_gateway_id(
        &self,
        gateway_payment_id: &str,
    ) -> Result<Option<PaymentInstance>, AppError> {
        let sql = format!(
            "SELECT {} FROM payment_instances WHERE gateway_payment_id = $1",
            PAYMENT_COLUMNS
        );
        self.fetch_optional(
            "find_payment_by_gateway_id",
            sqlx::query(&sql).bind(gateway_payment_id),
            payment_from_row,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn payment_for_period(
        &self,
        subscription_id: Uuid,
        period_key: PeriodKey,
    ) -> Result<Option<PaymentInstance>, AppError> {
        let sql = format!(
            "SELECT {} FROM payment_instances WHERE subscription_id = $1 AND period_key = $2",
            PAYMENT_COLUMNS
        );
        self.fetch_optional(
            "payment_for_period",
            sqlx::query(&sql)
                .bind(subscription_id)
                .bind(period_key.to_string()),
            payment_from_row,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_payments(
        &self,
        status: PaymentStatus,
    ) -> Result<Vec<PaymentInstance>, AppError> {
        let sql = format!(
            "SELECT {} FROM payment_instances WHERE status = $1 ORDER BY due_date, created_utc",
            PAYMENT_COLUMNS
        );
        self.fetch_all(
            "list_payments",
            sqlx::query(&sql).bind(status.as_str()),
            payment_from_row,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn payments_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<PaymentInstance>, AppError> {
        let sql = format!(
            "SELECT {} FROM payment_instances WHERE subscription_id = $1 ORDER BY period_key",
            PAYMENT_COLUMNS
        );
        self.fetch_all(
            "payments_for_subscription",
            sqlx::query(&sql).bind(subscription_id),
            payment_from_row,
        )
        .await
    }

    #[instrument(skip(self, payment), fields(payment_id = %payment.payment_id, expected = %expected, status = %payment.status))]
    async fn update_payment(
        &self,
        payment: &PaymentInstance,
        expected: PaymentStatus,
    ) -> Result<bool, AppError> {
        let query = sqlx::query(
            r#"
            UPDATE payment_instances
            SET status = $3, amount = $4, gateway_payment_id = $5, last_error = $6,
                return_code = $7, notify_attempts = $8, notified_utc = $9,
                submitted_utc = $10, updated_utc = $11, version = version + 1
            WHERE payment_id = $1 AND status = $2 AND version = $12
            "#,
        )
        .bind(payment.payment_id)
        .bind(expected.as_str())
        .bind(payment.status.as_str())
        .bind(payment.amount)
        .bind(&payment.gateway_payment_id)
        .bind(&payment.last_error)
        .bind(&payment.return_code)
        .bind(payment.notify_attempts)
        .bind(payment.notified_utc)
        .bind(payment.submitted_utc)
        .bind(payment.updated_utc)
        .bind(payment.version);
        Ok(self.execute("update_payment", query).await? == 1)
    }

    // =========================================================================
    // Escalation Alert Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn latest_alert(
        &self,
        subject_type: SubjectType,
        subject_id: Uuid,
    ) -> Result<Option<EscalationAlert>, AppError> {
        let query = sqlx::query(
            r#"
            SELECT alert_id, subject_id, subject_type, stage, sent_utc
            FROM escalation_alerts
            WHERE subject_type = $1 AND subject_id = $2
            ORDER BY sent_utc DESC
            LIMIT 1
            "#,
        )
        .bind(subject_type.as_str())
        .bind(subject_id);
        self.fetch_optional("latest_alert", query, alert_from_row).await
    }

    #[instrument(skip(self, alert), fields(subject_id = %alert.subject_id, stage = %alert.stage))]
    async fn insert_alert(&self, alert: &EscalationAlert) -> Result<(), AppError> {
        let query = sqlx::query(
            r#"
            INSERT INTO escalation_alerts (alert_id, subject_id, subject_type, stage, sent_utc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(alert.alert_id)
        .bind(alert.subject_id)
        .bind(alert.subject_type.as_str())
        .bind(alert.stage.as_str())
        .bind(alert.sent_utc);
        self.execute("insert_alert", query).await?;
        Ok(())
    }

    // =========================================================================
    // Webhook Deduplication
    // =========================================================================

    #[instrument(skip(self))]
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<WebhookClaim, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_webhook_event"])
            .start_timer();

        // Failed deliveries and abandoned claims may be taken over
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (event_id, event_type, status, received_utc, claimed_utc)
            VALUES ($1, $2, 'processing', $3, $3)
            ON CONFLICT (event_id) DO UPDATE SET
                status = 'processing',
                error = NULL,
                claimed_utc = EXCLUDED.claimed_utc
            WHERE webhook_events.status = 'failed'
               OR (webhook_events.status = 'processing' AND webhook_events.claimed_utc < $4)
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(now)
        .bind(webhook_lease_cutoff(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("claim webhook event", e))?;

        if claimed.is_some() {
            timer.observe_duration();
            return Ok(WebhookClaim::Claimed);
        }

        let (status,): (String,) =
            sqlx::query_as("SELECT status FROM webhook_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_error("read webhook event", e))?;

        timer.observe_duration();
        Ok(if status == "processed" {
            WebhookClaim::Processed
        } else {
            WebhookClaim::InProgress
        })
    }

    #[instrument(skip(self))]
    async fn complete_webhook_event(
        &self,
        event_id: &str,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let status = if error.is_some() { "failed" } else { "processed" };
        let completed_utc: DateTime<Utc> = Utc::now();
        let query = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, error = $3, completed_utc = $4
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(status)
        .bind(error)
        .bind(completed_utc);
        self.execute("complete_webhook_event", query).await?;
        Ok(())
    }
}
