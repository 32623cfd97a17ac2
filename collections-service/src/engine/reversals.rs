//! Mandate consequences of returned and failed collections.

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use super::{EngineContext, MandateRegistry};
use crate::error::CollectionsError;
use crate::models::{classify_return, PaymentInstance, ReturnClass};

pub struct ReversalHandler {
    ctx: EngineContext,
    mandates: MandateRegistry,
}

impl ReversalHandler {
    pub fn new(ctx: EngineContext, mandates: MandateRegistry) -> Self {
        Self { ctx, mandates }
    }

    /// Classify `return_code` under the mandate's scheme and act on it.
    ///
    /// The instance itself is already terminal; nothing here re-submits the
    /// period. Dunning picks up the unpaid instance.
    #[instrument(skip(self, payment), fields(payment_id = %payment.payment_id))]
    pub async fn handle_return(
        &self,
        payment: &PaymentInstance,
        return_code: &str,
        now: DateTime<Utc>,
    ) -> Result<ReturnClass, CollectionsError> {
        let subscription = self
            .ctx
            .store
            .get_subscription(payment.subscription_id)
            .await?
            .ok_or_else(|| CollectionsError::not_found("subscription", payment.subscription_id))?;
        let mandate = self.mandates.get(subscription.mandate_id).await?;
        let class = classify_return(mandate.scheme, return_code);

        info!(
            mandate_id = %mandate.mandate_id,
            scheme = mandate.scheme.as_str(),
            return_code,
            class = class.as_str(),
            "Classified return"
        );

        let reason = format!("return code {}", return_code.trim());
        let result = match class {
            ReturnClass::MandateFatal => self
                .mandates
                .cancel(mandate.mandate_id, &reason, now)
                .await
                .map(|_| ()),
            ReturnClass::SuspendMandate => self
                .mandates
                .suspend(mandate.mandate_id, &reason, now)
                .await
                .map(|_| ()),
            ReturnClass::Transient => Ok(()),
        };

        match result {
            Ok(()) => Ok(class),
            // Mandate already past the state this return would move it to.
            Err(CollectionsError::IllegalTransition(e)) => {
                warn!(mandate_id = %mandate.mandate_id, error = %e, "Return left mandate unchanged");
                Ok(class)
            }
            Err(e) => Err(e),
        }
    }
}
