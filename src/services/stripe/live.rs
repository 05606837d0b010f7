use super::{
    CheckoutLineItem, CheckoutMode, CheckoutSession, CreateCheckoutSessionRequest, StripeEvent,
    StripeService, StripeServiceError, SubscriptionInfo,
};
use async_trait::async_trait;

pub struct LiveStripeService {
    client: stripe::Client,
    webhook_secret: String,
}

impl LiveStripeService {
    pub fn new(secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        let client = stripe::Client::new(secret_key);
        Self {
            client,
            webhook_secret: webhook_secret.into(),
        }
    }

    pub fn from_settings(settings: &crate::config::StripeSettings) -> Self {
        Self::new(settings.secret_key.clone(), settings.webhook_secret.clone())
    }
}

fn map_mode(mode: CheckoutMode) -> stripe::CheckoutSessionMode {
    match mode {
        CheckoutMode::Payment => stripe::CheckoutSessionMode::Payment,
        CheckoutMode::Subscription => stripe::CheckoutSessionMode::Subscription,
    }
}

fn map_line_items(items: &[CheckoutLineItem]) -> Vec<stripe::CreateCheckoutSessionLineItems> {
    items
        .iter()
        .map(|li| stripe::CreateCheckoutSessionLineItems {
            price: Some(li.price.clone()),
            quantity: Some(li.quantity),
            ..Default::default()
        })
        .collect()
}

fn subscription_interval(sub: &stripe::Subscription) -> Option<String> {
    sub.items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .and_then(|price| price.recurring.as_ref())
        .map(|recurring| recurring.interval.to_string())
}

#[async_trait]
impl StripeService for LiveStripeService {
    async fn create_checkout_session(
        &self,
        req: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeServiceError> {
        let mut params = stripe::CreateCheckoutSession::new();
        params.mode = Some(map_mode(req.mode));
        params.success_url = Some(&req.success_url);
        params.cancel_url = Some(&req.cancel_url);
        if let Some(ref id) = req.client_reference_id {
            params.client_reference_id = Some(id);
        }
        if let Some(ref customer) = req.customer {
            let cid = customer
                .parse::<stripe::CustomerId>()
                .map_err(|e| StripeServiceError::Other(e.to_string()))?;
            params.customer = Some(cid);
        }
        if let Some(ref meta) = req.metadata {
            let mut m = std::collections::HashMap::new();
            for (k, v) in meta.iter() {
                m.insert(k.clone(), v.clone());
            }
            params.metadata = Some(m);
        }
        if !req.line_items.is_empty() {
            params.line_items = Some(map_line_items(&req.line_items));
        }

        let session = stripe::CheckoutSession::create(&self.client, params).await?;
        Ok(CheckoutSession {
            id: session.id.to_string(),
            url: session.url.clone(),
        })
    }

    async fn create_customer(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> Result<String, StripeServiceError> {
        let mut params = stripe::CreateCustomer::new();
        params.email = Some(email);
        if let Some(name) = name {
            params.name = Some(name);
        }
        let customer = stripe::Customer::create(&self.client, params).await?;
        Ok(customer.id.to_string())
    }

    async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, StripeServiceError> {
        let cid = customer_id
            .parse::<stripe::CustomerId>()
            .map_err(|e| StripeServiceError::Other(e.to_string()))?;
        let mut params = stripe::CreateBillingPortalSession::new(cid);
        params.return_url = Some(return_url);
        let session = stripe::BillingPortalSession::create(&self.client, params).await?;
        Ok(session.url)
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError> {
        let payload_str =
            std::str::from_utf8(payload).map_err(|e| StripeServiceError::Serde(e.to_string()))?;
        let event =
            stripe::Webhook::construct_event(payload_str, signature_header, &self.webhook_secret)?;
        let payload =
            serde_json::to_value(&event).map_err(|e| StripeServiceError::Serde(e.to_string()))?;
        Ok(StripeEvent {
            id: event.id.to_string(),
            r#type: event.type_.to_string(),
            payload,
        })
    }

    async fn get_active_subscription_for_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<SubscriptionInfo>, StripeServiceError> {
        let cust_id = customer_id
            .parse::<stripe::CustomerId>()
            .map_err(|e| StripeServiceError::Other(e.to_string()))?;

        let mut list_params = stripe::ListSubscriptions::new();
        list_params.customer = Some(cust_id);
        list_params.limit = Some(10);

        let subs = stripe::Subscription::list(&self.client, &list_params).await?;
        for sub in subs.data.into_iter() {
            let is_active_like = matches!(
                sub.status,
                stripe::SubscriptionStatus::Active | stripe::SubscriptionStatus::Trialing
            );
            if !is_active_like {
                continue;
            }

            let info = SubscriptionInfo {
                id: sub.id.to_string(),
                status: sub.status.to_string(),
                interval: subscription_interval(&sub),
                current_period_end: sub.current_period_end,
                cancel_at_period_end: sub.cancel_at_period_end,
            };
            return Ok(Some(info));
        }

        Ok(None)
    }
}
