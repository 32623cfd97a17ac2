//! Services module for collections-service: persistence and the external
//! collaborators (gateway, notification delivery, contract service).

pub mod contracts;
pub mod database;
pub mod gateway;
pub mod memory;
pub mod metrics;
pub mod notification;
pub mod store;

pub use contracts::{
    ContractActivation, ContractError, ContractService, EndingContract, HttpContractService,
    PayerProfile,
};
pub use database::Database;
pub use gateway::{
    GatewayError, GatewayEvent, GatewayEventKind, HttpGateway, NewGatewayMandate,
    NewGatewayPayment, PaymentGateway, RetryingGateway, WebhookEnvelope,
};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use notification::{
    HttpNotifier, NotificationRequest, Notifier, NotifyError, RetryingNotifier, TemplateKind,
};
pub use store::{CollectionsStore, WebhookClaim, WEBHOOK_CLAIM_LEASE_SECS};
