//! Order ledger
//!
//! Creates pending purchase attempts and promotes them to completed once the
//! processor confirms payment. Two purchase paths exist:
//!
//! - **Payment links** (`starter`, `professional`): the user is redirected to a
//!   hosted payment page with the order's correlation id attached as
//!   `client_reference_id`. The processor echoes it back on
//!   `checkout.session.completed`.
//! - **Team seats**: a one-off payment attempt is created directly and the
//!   order id travels in the attempt's metadata. An attempt that still waits
//!   for a payment method is amended in place when the seat count changes.

use std::collections::HashMap;
use std::sync::Arc;

use rewritely_shared::{BillingPeriod, OrderStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::{CheckoutCatalog, TeamPricing};
use crate::error::{BillingError, BillingResult};
use crate::models::{NewOrder, Order, OrderCompletion, ProcessorRefs};
use crate::processor::{PaymentIntentRequest, PaymentProcessor};
use crate::store::BillingStore;

/// Result of starting a payment-link checkout
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub correlation_id: String,
    /// Payment-initiation target carrying the correlation id
    pub url: String,
}

/// Request to start or amend a seat-based payment
#[derive(Debug, Clone, Deserialize)]
pub struct TeamPaymentRequest {
    #[serde(skip)]
    pub user_id: Uuid,
    pub seat_count: u32,
    pub billing_period: BillingPeriod,
    /// Pending order whose payment attempt may be reused
    #[serde(default)]
    pub order_id: Option<Uuid>,
    #[serde(default)]
    pub receipt_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamPaymentResponse {
    pub client_secret: String,
    pub order_id: Uuid,
    pub unit_amount_cents: i64,
    pub total_amount_cents: i64,
    pub client_reference_id: String,
}

pub struct OrderService {
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
    catalog: CheckoutCatalog,
    team: TeamPricing,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
        catalog: CheckoutCatalog,
        team: TeamPricing,
    ) -> Self {
        Self {
            store,
            processor,
            catalog,
            team,
        }
    }

    pub fn team_pricing(&self) -> &TeamPricing {
        &self.team
    }

    // =========================================================================
    // Payment-link checkout
    // =========================================================================

    /// Create a pending order and return the payment link carrying its
    /// correlation id.
    ///
    /// `seat_count` is only meaningful for the team plan, which is sold through
    /// [`OrderService::create_team_payment`] instead.
    pub async fn create_order(
        &self,
        user_id: Uuid,
        plan_id: &str,
        billing_period: BillingPeriod,
        seat_count: Option<u32>,
    ) -> BillingResult<CheckoutResponse> {
        if plan_id == self.team.plan_id {
            if let Some(seats) = seat_count {
                if seats < self.team.min_seats {
                    return Err(BillingError::SeatMinimum {
                        plan_id: plan_id.to_string(),
                        minimum: self.team.min_seats,
                    });
                }
            }
            return Err(BillingError::InvalidInput(
                "The team plan is purchased through the team payment flow".to_string(),
            ));
        }

        if self.store.get_plan(plan_id).await?.is_none() {
            return Err(BillingError::InvalidInput(format!("Unknown plan '{}'", plan_id)));
        }

        let link = self.catalog.link(plan_id, billing_period).ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "Plan '{}' is not offered with {} billing",
                plan_id, billing_period
            ))
        })?;

        let correlation_id = Uuid::new_v4().to_string();
        let mut url = link.clone();
        url.query_pairs_mut()
            .append_pair("client_reference_id", &correlation_id);

        let order = self
            .store
            .insert_order(NewOrder {
                user_id,
                plan_id: plan_id.to_string(),
                billing_period,
                correlation_id: correlation_id.clone(),
                payment_link_url: Some(link.to_string()),
                seat_count: None,
                unit_amount_cents: None,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            order_id = %order.id,
            plan_id = %plan_id,
            billing_period = %billing_period,
            "Created pending order"
        );

        Ok(CheckoutResponse {
            order_id: order.id,
            correlation_id,
            url: url.to_string(),
        })
    }

    // =========================================================================
    // Team seat payments
    // =========================================================================

    /// Start a seat-based payment, or amend the attempt of an earlier pending
    /// order while it still accepts a payment method.
    pub async fn create_team_payment(
        &self,
        request: TeamPaymentRequest,
    ) -> BillingResult<TeamPaymentResponse> {
        if request.seat_count < self.team.min_seats {
            return Err(BillingError::SeatMinimum {
                plan_id: self.team.plan_id.clone(),
                minimum: self.team.min_seats,
            });
        }

        let seat_count = i32::try_from(request.seat_count)
            .map_err(|_| BillingError::InvalidInput("Seat count too large".to_string()))?;
        let unit_amount_cents = self.team.unit_amount_cents(request.billing_period);
        let total_amount_cents = unit_amount_cents
            .checked_mul(i64::from(seat_count))
            .ok_or_else(|| BillingError::InvalidInput("Seat count too large".to_string()))?;

        if let Some(order) = self.reusable_team_order(&request).await? {
            if let Some(response) = self
                .amend_team_payment(&order, &request, seat_count, unit_amount_cents, total_amount_cents)
                .await?
            {
                return Ok(response);
            }
        }

        let correlation_id = Uuid::new_v4().to_string();
        let order = self
            .store
            .insert_order(NewOrder {
                user_id: request.user_id,
                plan_id: self.team.plan_id.clone(),
                billing_period: request.billing_period,
                correlation_id: correlation_id.clone(),
                payment_link_url: None,
                seat_count: Some(seat_count),
                unit_amount_cents: Some(unit_amount_cents),
            })
            .await?;

        let intent = self
            .processor
            .create_payment_intent(PaymentIntentRequest {
                amount_cents: total_amount_cents,
                currency: self.team.currency.clone(),
                receipt_email: request.receipt_email.clone(),
                metadata: self.team_metadata(&order, seat_count, unit_amount_cents),
            })
            .await?;

        self.store
            .update_order_payment(order.id, &intent.id, seat_count, unit_amount_cents)
            .await?;

        let client_secret = intent.client_secret.ok_or_else(|| {
            BillingError::Internal("Payment attempt has no client secret".to_string())
        })?;

        tracing::info!(
            user_id = %request.user_id,
            order_id = %order.id,
            payment_intent_id = %intent.id,
            seat_count = seat_count,
            total_amount_cents = total_amount_cents,
            "Created team payment"
        );

        Ok(TeamPaymentResponse {
            client_secret,
            order_id: order.id,
            unit_amount_cents,
            total_amount_cents,
            client_reference_id: correlation_id,
        })
    }

    /// Pending team order owned by the caller that carries a payment attempt
    async fn reusable_team_order(
        &self,
        request: &TeamPaymentRequest,
    ) -> BillingResult<Option<Order>> {
        let Some(order_id) = request.order_id else {
            return Ok(None);
        };

        let Some(order) = self.store.find_order_by_id(order_id).await? else {
            tracing::debug!(order_id = %order_id, "Requested order not found, creating new one");
            return Ok(None);
        };

        let reusable = order.user_id == request.user_id
            && order.plan_id == self.team.plan_id
            && order.billing_period == request.billing_period
            && order.status == OrderStatus::Pending
            && order.payment_intent_id.is_some();

        Ok(reusable.then_some(order))
    }

    /// Amend the order's payment attempt. `None` when the attempt has moved
    /// past `requires_payment_method` or the processor cannot find or update
    /// it; the caller then starts a new order.
    async fn amend_team_payment(
        &self,
        order: &Order,
        request: &TeamPaymentRequest,
        seat_count: i32,
        unit_amount_cents: i64,
        total_amount_cents: i64,
    ) -> BillingResult<Option<TeamPaymentResponse>> {
        let Some(intent_id) = order.payment_intent_id.as_deref() else {
            return Ok(None);
        };

        let current = match self.processor.retrieve_payment_intent(intent_id).await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(
                    order_id = %order.id,
                    payment_intent_id = %intent_id,
                    error = %e,
                    "Payment attempt lookup failed, starting a new order"
                );
                return Ok(None);
            }
        };
        if !current.accepts_new_payment_method() {
            tracing::info!(
                order_id = %order.id,
                payment_intent_id = %intent_id,
                status = %current.status,
                "Payment attempt no longer amendable, starting a new order"
            );
            return Ok(None);
        }

        let amended = match self
            .processor
            .update_payment_intent(
                intent_id,
                PaymentIntentRequest {
                    amount_cents: total_amount_cents,
                    currency: self.team.currency.clone(),
                    receipt_email: request.receipt_email.clone(),
                    metadata: self.team_metadata(order, seat_count, unit_amount_cents),
                },
            )
            .await
        {
            Ok(amended) => amended,
            Err(e) => {
                tracing::warn!(
                    order_id = %order.id,
                    payment_intent_id = %intent_id,
                    error = %e,
                    "Payment attempt update failed, starting a new order"
                );
                return Ok(None);
            }
        };

        self.store
            .update_order_payment(order.id, &amended.id, seat_count, unit_amount_cents)
            .await?;

        let client_secret = amended
            .client_secret
            .or(current.client_secret)
            .ok_or_else(|| {
                BillingError::Internal("Payment attempt has no client secret".to_string())
            })?;

        tracing::info!(
            order_id = %order.id,
            payment_intent_id = %intent_id,
            seat_count = seat_count,
            "Amended pending team payment"
        );

        Ok(Some(TeamPaymentResponse {
            client_secret,
            order_id: order.id,
            unit_amount_cents,
            total_amount_cents,
            client_reference_id: order.correlation_id.clone(),
        }))
    }

    fn team_metadata(
        &self,
        order: &Order,
        seat_count: i32,
        unit_amount_cents: i64,
    ) -> HashMap<String, String> {
        HashMap::from([
            ("order_id".to_string(), order.id.to_string()),
            ("user_id".to_string(), order.user_id.to_string()),
            ("plan_id".to_string(), order.plan_id.clone()),
            ("billing_period".to_string(), order.billing_period.to_string()),
            ("seat_count".to_string(), seat_count.to_string()),
            ("unit_amount_cents".to_string(), unit_amount_cents.to_string()),
            ("client_reference_id".to_string(), order.correlation_id.clone()),
        ])
    }

    // =========================================================================
    // Completion and lookups
    // =========================================================================

    /// Mark an order completed. Completing an already completed order is a
    /// no-op, which keeps redelivered confirmations harmless.
    pub async fn complete_order(
        &self,
        order_id: Uuid,
        refs: &ProcessorRefs,
        completed_at: OffsetDateTime,
    ) -> BillingResult<OrderCompletion> {
        let completion = self.store.complete_order(order_id, refs, completed_at).await?;

        match &completion {
            OrderCompletion::Completed(order) => tracing::info!(
                order_id = %order.id,
                user_id = %order.user_id,
                plan_id = %order.plan_id,
                "Order completed"
            ),
            OrderCompletion::AlreadyCompleted(order) => tracing::debug!(
                order_id = %order.id,
                "Order already completed, nothing to do"
            ),
            OrderCompletion::NotFound => tracing::warn!(
                order_id = %order_id,
                "Completion for unknown order"
            ),
        }

        Ok(completion)
    }

    pub async fn find_by_id(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        self.store.find_order_by_id(order_id).await
    }

    pub async fn find_by_correlation_id(&self, correlation_id: &str) -> BillingResult<Option<Order>> {
        self.store.find_order_by_correlation_id(correlation_id).await
    }

    /// Newest completed order for a processor subscription
    pub async fn find_latest_completed_by_processor_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Order>> {
        self.store
            .find_latest_completed_order_by_subscription_id(subscription_id)
            .await
    }
}
