//! Gateway event envelope and the object shapes we read from it
//!
//! Event types are Stripe's own `EventType`. Objects keep a lenient local
//! shape with only the fields reconciliation reads: webhook payloads vary by
//! API version (invoices moved the subscription under `parent`), and the
//! full async-stripe structs reject objects missing fields we never use.
//! Objects fetched through the Stripe client are mapped into the same types.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use stripe::EventType;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// String-keyed metadata attached to gateway objects
pub type Metadata = HashMap<String, String>;

/// Metadata key carrying the domain discriminator
pub const METADATA_TYPE_KEY: &str = "type";

/// Billing reason Stripe uses for the invoice raised when a subscription starts
pub const FIRST_INVOICE_BILLING_REASON: &str = "subscription_create";

/// Domain discriminator carried in `metadata.type`
///
/// Closed set of the flows we understand. Anything else lands in
/// `Unrecognized` so new checkout flows are ignored on purpose, not by accident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseType {
    UserSubscription,
    OrgPlatformSubscription,
    CreditInstallment,
    CreditPurchase,
    OrgCreditPurchase,
    Unrecognized(String),
    Untagged,
}

impl PurchaseType {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "user_subscription" => PurchaseType::UserSubscription,
            "org_platform_subscription" => PurchaseType::OrgPlatformSubscription,
            "credit_installment" => PurchaseType::CreditInstallment,
            "credit_purchase" => PurchaseType::CreditPurchase,
            "org_credit_purchase" => PurchaseType::OrgCreditPurchase,
            other => PurchaseType::Unrecognized(other.to_string()),
        }
    }

    pub fn from_metadata(metadata: &Metadata) -> Self {
        metadata
            .get(METADATA_TYPE_KEY)
            .map(|tag| Self::parse(tag))
            .unwrap_or(PurchaseType::Untagged)
    }

    pub fn as_str(&self) -> &str {
        match self {
            PurchaseType::UserSubscription => "user_subscription",
            PurchaseType::OrgPlatformSubscription => "org_platform_subscription",
            PurchaseType::CreditInstallment => "credit_installment",
            PurchaseType::CreditPurchase => "credit_purchase",
            PurchaseType::OrgCreditPurchase => "org_credit_purchase",
            PurchaseType::Unrecognized(tag) => tag,
            PurchaseType::Untagged => "",
        }
    }

    /// One-off credit package purchases that go through reconciliation
    pub fn is_credit_purchase(&self) -> bool {
        matches!(
            self,
            PurchaseType::CreditPurchase | PurchaseType::OrgCreditPurchase
        )
    }
}

/// Read a UUID from metadata, failing with a payload error when absent or malformed
pub fn metadata_uuid(metadata: &Metadata, key: &str) -> BillingResult<Uuid> {
    let raw = metadata
        .get(key)
        .ok_or_else(|| BillingError::GatewayPayload(format!("{} missing from metadata", key)))?;
    Uuid::parse_str(raw)
        .map_err(|e| BillingError::GatewayPayload(format!("Invalid {} in metadata: {}", key, e)))
}

/// Read an optional UUID from metadata (absent is fine, malformed is not)
pub fn metadata_uuid_opt(metadata: &Metadata, key: &str) -> BillingResult<Option<Uuid>> {
    match metadata.get(key).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        Some(raw) => Uuid::parse_str(raw).map(Some).map_err(|e| {
            BillingError::GatewayPayload(format!("Invalid {} in metadata: {}", key, e))
        }),
        None => Ok(None),
    }
}

/// Read an integer from metadata
pub fn metadata_i64(metadata: &Metadata, key: &str) -> BillingResult<i64> {
    metadata
        .get(key)
        .ok_or_else(|| BillingError::GatewayPayload(format!("{} missing from metadata", key)))?
        .parse()
        .map_err(|e| BillingError::GatewayPayload(format!("Invalid {} in metadata: {}", key, e)))
}

fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(id)) => Some(id),
        Some(serde_json::Value::Object(map)) => map
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    })
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn timestamp(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}

/// Checkout payment state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutPaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
    #[default]
    #[serde(other)]
    Unknown,
}

impl CheckoutPaymentStatus {
    pub fn from_gateway(value: &str) -> Self {
        match value {
            "paid" => CheckoutPaymentStatus::Paid,
            "unpaid" => CheckoutPaymentStatus::Unpaid,
            "no_payment_required" => CheckoutPaymentStatus::NoPaymentRequired,
            _ => CheckoutPaymentStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutPaymentStatus::Paid => "paid",
            CheckoutPaymentStatus::Unpaid => "unpaid",
            CheckoutPaymentStatus::NoPaymentRequired => "no_payment_required",
            CheckoutPaymentStatus::Unknown => "unknown",
        }
    }
}

/// Checkout session as seen by reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub payment_status: CheckoutPaymentStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub payment_intent: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
}

impl CheckoutSession {
    pub fn purchase_type(&self) -> PurchaseType {
        PurchaseType::from_metadata(&self.metadata)
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status == CheckoutPaymentStatus::Paid
    }
}

/// Gateway subscription status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
    #[default]
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    pub fn from_gateway(value: &str) -> Self {
        serde_json::from_value(serde_json::Value::String(value.to_string()))
            .unwrap_or(SubscriptionStatus::Unknown)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<Price>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

/// Gateway subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default)]
    pub status: SubscriptionStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
    #[serde(default)]
    pub items: SubscriptionItems,
}

impl Subscription {
    pub fn purchase_type(&self) -> PurchaseType {
        PurchaseType::from_metadata(&self.metadata)
    }

    /// Price of the first subscription item
    pub fn current_price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Period {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub period: Option<Period>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

/// Gateway invoice
///
/// Newer API versions nest the subscription under `parent.subscription_details`,
/// older ones put it at the top level. Both are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub period_end: Option<i64>,
    #[serde(default)]
    pub lines: InvoiceLines,
}

impl Invoice {
    fn parent_details(&self) -> Option<&SubscriptionDetails> {
        self.parent
            .as_ref()
            .and_then(|p| p.subscription_details.as_ref())
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription
            .as_deref()
            .or_else(|| self.parent_details().and_then(|d| d.subscription.as_deref()))
    }

    /// Subscription metadata if the payload carries it inline
    pub fn subscription_metadata(&self) -> Option<&Metadata> {
        self.subscription_details
            .as_ref()
            .or_else(|| self.parent_details())
            .map(|d| &d.metadata)
            .filter(|m| !m.is_empty())
    }

    /// The first invoice is paid as part of checkout and already counted there
    pub fn is_first_invoice(&self) -> bool {
        self.billing_reason.as_deref() == Some(FIRST_INVOICE_BILLING_REASON)
    }

    /// End of the billing period this invoice pays for
    pub fn billing_period_end(&self) -> Option<OffsetDateTime> {
        let line_end = self
            .lines
            .data
            .iter()
            .filter_map(|line| line.period.as_ref().and_then(|p| p.end))
            .max();
        timestamp(line_end.or(self.period_end))
    }
}

/// Raw event envelope as delivered by the webhook
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl EventEnvelope {
    /// Stripe's event type, `None` for types this client version does not know
    pub fn stripe_event_type(&self) -> Option<EventType> {
        serde_json::from_value(serde_json::Value::String(self.event_type.clone())).ok()
    }
}

/// Typed view of the events the router acts on
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    CheckoutSessionCompleted(CheckoutSession),
    SubscriptionUpdated(Subscription),
    SubscriptionDeleted(Subscription),
    InvoicePaid(Invoice),
    InvoicePaymentFailed(Invoice),
    Unhandled(String),
}

impl GatewayEvent {
    pub fn from_envelope(envelope: &EventEnvelope) -> BillingResult<Self> {
        fn object<T: for<'de> Deserialize<'de>>(envelope: &EventEnvelope) -> BillingResult<T> {
            serde_json::from_value(envelope.data.object.clone()).map_err(|e| {
                BillingError::GatewayPayload(format!(
                    "{} object could not be parsed: {}",
                    envelope.event_type, e
                ))
            })
        }

        let Some(event_type) = envelope.stripe_event_type() else {
            return Ok(GatewayEvent::Unhandled(envelope.event_type.clone()));
        };

        Ok(match event_type {
            EventType::CheckoutSessionCompleted => {
                GatewayEvent::CheckoutSessionCompleted(object(envelope)?)
            }
            EventType::CustomerSubscriptionUpdated => {
                GatewayEvent::SubscriptionUpdated(object(envelope)?)
            }
            EventType::CustomerSubscriptionDeleted => {
                GatewayEvent::SubscriptionDeleted(object(envelope)?)
            }
            EventType::InvoicePaid => GatewayEvent::InvoicePaid(object(envelope)?),
            EventType::InvoicePaymentFailed => {
                GatewayEvent::InvoicePaymentFailed(object(envelope)?)
            }
            _ => GatewayEvent::Unhandled(envelope.event_type.clone()),
        })
    }

    pub fn created_at(envelope: &EventEnvelope) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(envelope.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }
}
