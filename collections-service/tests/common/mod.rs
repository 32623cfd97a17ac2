//! Test helpers for collections-service integration tests.
//!
//! The engine runs against the in-memory store and scripted fakes for the
//! gateway, notification service and contract service. Time is always passed
//! in explicitly.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use collections_service::config::CollectionPolicy;
use collections_service::engine::{CollectionsEngine, EngineContext, WebhookReport};
use collections_service::models::{
    BankDetails, Customer, DirectDebitScheme, Mandate, PaymentInstance, Subscription,
};
use collections_service::services::{
    CollectionsStore, ContractActivation, ContractError, ContractService, EndingContract,
    GatewayError, GatewayEvent, MemoryStore, NewGatewayMandate, NewGatewayPayment,
    NotificationRequest, Notifier, NotifyError, PayerProfile, PaymentGateway, WebhookEnvelope,
};
use rust_decimal::Decimal;
use service_core::retry::RetryConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const SEPA_IBAN: &str = "DE89 3704 0044 0532 0130 00";
pub const BACS_IBAN: &str = "GB82 WEST 1234 5698 7654 32";
pub const BAD_CHECKSUM_IBAN: &str = "DE89 3704 0044 0532 0130 01";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// 09:00 UTC on the given day.
pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 9, 0, 0).unwrap()
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

// =========================================================================
// Gateway
// =========================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    CreateCustomer(Uuid),
    CreateMandate { iban: String, reference: String },
    CreatePayment { idempotency_key: String, amount: Decimal },
    CancelMandate(String),
}

#[derive(Default)]
struct GatewayState {
    calls: Vec<GatewayCall>,
    mandate_results: VecDeque<Result<String, GatewayError>>,
    payment_results: VecDeque<Result<String, GatewayError>>,
    payments_by_key: HashMap<String, String>,
    sequence: u32,
}

/// Gateway fake. Succeeds with generated ids unless a result was queued.
/// Payments are idempotent by key like the real provider.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
}

impl FakeGateway {
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn payment_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::CreatePayment { .. }))
            .count()
    }

    pub fn cancel_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::CancelMandate(_)))
            .count()
    }

    pub fn queue_mandate_result(&self, result: Result<String, GatewayError>) {
        self.state.lock().unwrap().mandate_results.push_back(result);
    }

    pub fn queue_payment_result(&self, result: Result<String, GatewayError>) {
        self.state.lock().unwrap().payment_results.push_back(result);
    }

    fn next_id(state: &mut GatewayState, prefix: &str) -> String {
        state.sequence += 1;
        format!("{}{:04}", prefix, state.sequence)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_customer(&self, customer: &Customer) -> Result<String, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(GatewayCall::CreateCustomer(customer.customer_id));
        Ok(Self::next_id(&mut state, "CU"))
    }

    async fn create_mandate(&self, request: &NewGatewayMandate) -> Result<String, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(GatewayCall::CreateMandate {
            iban: request.iban.clone(),
            reference: request.reference.clone(),
        });
        match state.mandate_results.pop_front() {
            Some(result) => result,
            None => Ok(Self::next_id(&mut state, "MD")),
        }
    }

    async fn create_payment(&self, request: &NewGatewayPayment) -> Result<String, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(GatewayCall::CreatePayment {
            idempotency_key: request.idempotency_key.clone(),
            amount: request.amount,
        });
        if let Some(result) = state.payment_results.pop_front() {
            if let Ok(id) = &result {
                state
                    .payments_by_key
                    .insert(request.idempotency_key.clone(), id.clone());
            }
            return result;
        }
        if let Some(existing) = state.payments_by_key.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }
        let id = Self::next_id(&mut state, "PM");
        state
            .payments_by_key
            .insert(request.idempotency_key.clone(), id.clone());
        Ok(id)
    }

    async fn cancel_mandate(&self, gateway_mandate_id: &str) -> Result<(), GatewayError> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(GatewayCall::CancelMandate(gateway_mandate_id.to_string()));
        Ok(())
    }
}

// =========================================================================
// Notification service
// =========================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotificationRequest>>,
    failures_left: Mutex<u32>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_with_template(&self, template: &str) -> usize {
        self.sent()
            .iter()
            .filter(|r| r.template.as_str() == template)
            .count()
    }

    /// Fail the next `n` sends with a transient error.
    pub fn fail_next(&self, n: u32) {
        *self.failures_left.lock().unwrap() = n;
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        {
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(NotifyError::Unavailable("smtp relay down".to_string()));
            }
        }
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }
}

// =========================================================================
// Contract service
// =========================================================================

#[derive(Default)]
pub struct FakeContractService {
    pub needing_mandate: Mutex<Vec<ContractActivation>>,
    pub ending: Mutex<Vec<EndingContract>>,
    pub first_payments: Mutex<Vec<Uuid>>,
}

impl FakeContractService {
    pub fn first_payments(&self) -> Vec<Uuid> {
        self.first_payments.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContractService for FakeContractService {
    async fn active_contracts_needing_mandate(
        &self,
    ) -> Result<Vec<ContractActivation>, ContractError> {
        Ok(self.needing_mandate.lock().unwrap().clone())
    }

    async fn first_payment_confirmed(&self, contract_id: Uuid) -> Result<(), ContractError> {
        self.first_payments.lock().unwrap().push(contract_id);
        Ok(())
    }

    async fn contracts_ending_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<EndingContract>, ContractError> {
        Ok(self
            .ending
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.ends_on >= from && c.ends_on <= to)
            .cloned()
            .collect())
    }
}

// =========================================================================
// Harness
// =========================================================================

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub contracts: Arc<FakeContractService>,
    pub ctx: EngineContext,
    pub engine: CollectionsEngine,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_policy(CollectionPolicy::default())
    }

    pub fn with_policy(policy: CollectionPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let contracts = Arc::new(FakeContractService::default());

        let ctx = EngineContext {
            store: store.clone(),
            gateway: gateway.clone(),
            notifier: notifier.clone(),
            contracts: contracts.clone(),
            policy,
            retry: RetryConfig {
                attempt_timeout: Duration::from_secs(2),
                ..RetryConfig::no_retry()
            },
        };

        Self {
            engine: CollectionsEngine::new(ctx.clone()),
            store,
            gateway,
            notifier,
            contracts,
            ctx,
        }
    }

    /// A SEPA contract activation for a fresh payer and contract.
    pub fn activation(&self, anchor_day: u32, starts_on: NaiveDate) -> ContractActivation {
        ContractActivation {
            contract_id: Uuid::new_v4(),
            payer: PayerProfile {
                customer_id: Uuid::new_v4(),
                legal_name: "Anna Schmidt".to_string(),
                email: "anna.schmidt@example.com".to_string(),
                country: "DE".to_string(),
            },
            bank_details: BankDetails {
                account_holder: "Anna Schmidt".to_string(),
                iban: SEPA_IBAN.to_string(),
                scheme: DirectDebitScheme::SepaCore,
            },
            amount: Decimal::new(95000, 2),
            currency: None,
            anchor_day,
            starts_on,
            mandate_expires_on: None,
        }
    }

    /// Activate a contract and have the gateway approve its mandate.
    pub async fn active_subscription(
        &self,
        anchor_day: u32,
        now: DateTime<Utc>,
    ) -> (Subscription, Mandate) {
        let activation = self.activation(anchor_day, date(2026, 1, 1));
        self.activate(&activation, now).await
    }

    pub async fn activate(
        &self,
        activation: &ContractActivation,
        now: DateTime<Utc>,
    ) -> (Subscription, Mandate) {
        let subscription = self.engine.lifecycle.activate(activation, now).await.unwrap();
        let mandate = self.engine.mandates.get(subscription.mandate_id).await.unwrap();
        self.engine
            .mandates
            .on_mandate_activated(&mandate.gateway_mandate_id, now)
            .await
            .unwrap();
        let mandate = self.engine.mandates.get(subscription.mandate_id).await.unwrap();
        (subscription, mandate)
    }

    pub async fn payments(&self, subscription_id: Uuid) -> Vec<PaymentInstance> {
        self.store
            .payments_for_subscription(subscription_id)
            .await
            .unwrap()
    }

    pub async fn subscription(&self, subscription_id: Uuid) -> Subscription {
        self.store
            .get_subscription(subscription_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn mandate(&self, mandate_id: Uuid) -> Mandate {
        self.engine.mandates.get(mandate_id).await.unwrap()
    }

    pub async fn payment(&self, payment_id: Uuid) -> PaymentInstance {
        self.store.get_payment(payment_id).await.unwrap().unwrap()
    }

    /// Anchor-28 SEPA subscription driven through schedule, notify and submit
    /// for the November 2026 period.
    pub async fn submitted_payment(&self) -> (Subscription, Mandate, PaymentInstance) {
        let (subscription, mandate) = self.active_subscription(28, at(2026, 11, 2)).await;
        self.engine.scheduler.run(at(2026, 11, 2)).await.unwrap();
        self.engine.compliance.run(at(2026, 11, 10)).await.unwrap();
        self.engine
            .payments
            .run_submissions(at(2026, 11, 23))
            .await
            .unwrap();
        let payment = self.payments(subscription.subscription_id).await.remove(0);
        (subscription, mandate, payment)
    }

    /// Deliver a single-event webhook batch.
    pub async fn deliver(
        &self,
        event_id: &str,
        event_type: &str,
        resource_id: &str,
        reason_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> WebhookReport {
        let batch = envelope(vec![event(event_id, event_type, resource_id, reason_code)]);
        self.engine.process_webhook(&batch, now).await.unwrap()
    }
}

pub fn event(
    id: &str,
    event_type: &str,
    resource_id: &str,
    reason_code: Option<&str>,
) -> GatewayEvent {
    GatewayEvent {
        id: id.to_string(),
        event_type: event_type.to_string(),
        resource_id: resource_id.to_string(),
        reason_code: reason_code.map(str::to_string),
        description: None,
        created_at: None,
    }
}

pub fn envelope(events: Vec<GatewayEvent>) -> WebhookEnvelope {
    WebhookEnvelope { events }
}
