//! Billing events
//!
//! [`BillingEvent`] is the provider-neutral shape the webhook handler acts on.
//! [`parse_stripe_event`] translates a (signature-verified) Stripe event body
//! into it. Only the fields the handler needs are read; everything else in
//! the payload is ignored so new Stripe API versions do not break parsing.

use revisume_shared::UserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEvent {
    /// Provider event id, used for replay protection
    pub id: String,
    pub kind: BillingEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum BillingEventKind {
    SubscriptionCheckoutCompleted {
        user_id: UserId,
        customer_id: String,
        subscription_id: String,
        price_id: String,
    },
    PackCheckoutCompleted {
        user_id: UserId,
        customer_id: Option<String>,
        price_id: String,
    },
    InvoicePaid {
        customer_id: Option<String>,
        subscription_id: Option<String>,
    },
    InvoicePaymentFailed {
        customer_id: Option<String>,
        subscription_id: Option<String>,
    },
    SubscriptionUpdated {
        customer_id: Option<String>,
        subscription_id: String,
        price_id: Option<String>,
        status: String,
    },
    SubscriptionDeleted {
        customer_id: Option<String>,
        subscription_id: String,
    },
    /// Recognized envelope, no handler. Acknowledged without side effects.
    Unhandled { provider_type: String },
}

impl BillingEventKind {
    pub fn name(&self) -> &str {
        match self {
            Self::SubscriptionCheckoutCompleted { .. } => "subscription_checkout_completed",
            Self::PackCheckoutCompleted { .. } => "pack_checkout_completed",
            Self::InvoicePaid { .. } => "invoice_paid",
            Self::InvoicePaymentFailed { .. } => "invoice_payment_failed",
            Self::SubscriptionUpdated { .. } => "subscription_updated",
            Self::SubscriptionDeleted { .. } => "subscription_deleted",
            Self::Unhandled { provider_type } => provider_type,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StripeEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: Value,
}

/// Parse a Stripe event body into a [`BillingEvent`].
///
/// Malformed JSON or a missing envelope is an error. Recognized event types
/// whose object lacks something the handler cannot do without (for example a
/// checkout session with no user reference) become
/// [`BillingEventKind::Unhandled`] and are logged.
pub fn parse_stripe_event(payload: &str) -> BillingResult<BillingEvent> {
    let envelope: StripeEnvelope = serde_json::from_str(payload).map_err(|e| {
        tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
        BillingError::InvalidPayload(e.to_string())
    })?;
    let object = &envelope.data.object;

    let kind = match envelope.event_type.as_str() {
        "checkout.session.completed" => parse_checkout_session(&envelope.id, object),
        "invoice.paid" | "invoice.payment_succeeded" => Some(BillingEventKind::InvoicePaid {
            customer_id: expandable_id(object.get("customer")),
            subscription_id: invoice_subscription_id(object),
        }),
        "invoice.payment_failed" => Some(BillingEventKind::InvoicePaymentFailed {
            customer_id: expandable_id(object.get("customer")),
            subscription_id: invoice_subscription_id(object),
        }),
        "customer.subscription.updated" => {
            string_field(object, "id").map(|subscription_id| BillingEventKind::SubscriptionUpdated {
                customer_id: expandable_id(object.get("customer")),
                subscription_id,
                price_id: first_item_price(object.get("items")),
                status: string_field(object, "status").unwrap_or_default(),
            })
        }
        "customer.subscription.deleted" => {
            string_field(object, "id").map(|subscription_id| BillingEventKind::SubscriptionDeleted {
                customer_id: expandable_id(object.get("customer")),
                subscription_id,
            })
        }
        _ => None,
    };

    let kind = kind.unwrap_or_else(|| BillingEventKind::Unhandled {
        provider_type: envelope.event_type.clone(),
    });

    Ok(BillingEvent {
        id: envelope.id,
        kind,
    })
}

fn parse_checkout_session(event_id: &str, session: &Value) -> Option<BillingEventKind> {
    let user_id = string_field(session, "client_reference_id")
        .or_else(|| session.pointer("/metadata/user_id").and_then(as_string))
        .and_then(|raw| raw.parse::<UserId>().ok());
    let Some(user_id) = user_id else {
        tracing::warn!(
            event_id = %event_id,
            "Checkout session without a user reference; ignoring"
        );
        return None;
    };

    let price_id = session
        .pointer("/metadata/price_id")
        .and_then(as_string)
        .or_else(|| first_item_price(session.get("line_items")));
    let Some(price_id) = price_id else {
        tracing::warn!(
            event_id = %event_id,
            user_id = %user_id,
            "Checkout session without a price; ignoring"
        );
        return None;
    };
    let customer_id = expandable_id(session.get("customer"));

    match string_field(session, "mode").as_deref() {
        Some("subscription") => {
            let subscription_id = expandable_id(session.get("subscription"));
            match (customer_id, subscription_id) {
                (Some(customer_id), Some(subscription_id)) => {
                    Some(BillingEventKind::SubscriptionCheckoutCompleted {
                        user_id,
                        customer_id,
                        subscription_id,
                        price_id,
                    })
                }
                _ => {
                    tracing::warn!(
                        event_id = %event_id,
                        user_id = %user_id,
                        "Subscription checkout without customer or subscription id; ignoring"
                    );
                    None
                }
            }
        }
        Some("payment") => Some(BillingEventKind::PackCheckoutCompleted {
            user_id,
            customer_id,
            price_id,
        }),
        other => {
            tracing::info!(event_id = %event_id, mode = ?other, "Unsupported checkout mode");
            None
        }
    }
}

/// Newer API versions move the subscription under `parent.subscription_details`.
fn invoice_subscription_id(invoice: &Value) -> Option<String> {
    expandable_id(invoice.get("subscription")).or_else(|| {
        expandable_id(invoice.pointer("/parent/subscription_details/subscription"))
    })
}

/// Price of the first entry of a Stripe list (`{"data": [{"price": ...}]}`).
fn first_item_price(list: Option<&Value>) -> Option<String> {
    list?
        .get("data")?
        .as_array()?
        .first()
        .and_then(|item| expandable_id(item.get("price")))
}

/// An expandable field is either the bare id or the expanded object.
fn expandable_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(object) => object.get("id").and_then(as_string),
        _ => None,
    }
}

fn string_field(object: &Value, key: &str) -> Option<String> {
    object.get(key).and_then(as_string)
}

fn as_string(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str, object: Value) -> String {
        json!({
            "id": "evt_123",
            "object": "event",
            "type": event_type,
            "api_version": "2024-06-20",
            "data": { "object": object },
        })
        .to_string()
    }

    #[test]
    fn test_subscription_checkout() {
        let payload = envelope(
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "mode": "subscription",
                "client_reference_id": "999",
                "customer": "cus_A",
                "subscription": "sub_A",
                "metadata": { "price_id": "price_starter" },
            }),
        );
        let event = parse_stripe_event(&payload).unwrap();
        assert_eq!(event.id, "evt_123");
        assert_eq!(
            event.kind,
            BillingEventKind::SubscriptionCheckoutCompleted {
                user_id: UserId(999),
                customer_id: "cus_A".to_string(),
                subscription_id: "sub_A".to_string(),
                price_id: "price_starter".to_string(),
            }
        );
    }

    #[test]
    fn test_pack_checkout_uses_expanded_line_items() {
        let payload = envelope(
            "checkout.session.completed",
            json!({
                "id": "cs_2",
                "mode": "payment",
                "client_reference_id": "42",
                "customer": { "id": "cus_B", "object": "customer" },
                "line_items": { "data": [ { "price": { "id": "price_pack" }, "quantity": 1 } ] },
            }),
        );
        let event = parse_stripe_event(&payload).unwrap();
        assert_eq!(
            event.kind,
            BillingEventKind::PackCheckoutCompleted {
                user_id: UserId(42),
                customer_id: Some("cus_B".to_string()),
                price_id: "price_pack".to_string(),
            }
        );
    }

    #[test]
    fn test_checkout_without_user_is_unhandled() {
        let payload = envelope(
            "checkout.session.completed",
            json!({ "id": "cs_3", "mode": "payment", "metadata": { "price_id": "price_pack" } }),
        );
        let event = parse_stripe_event(&payload).unwrap();
        assert_eq!(event.kind.name(), "checkout.session.completed");
    }

    #[test]
    fn test_invoice_subscription_from_parent() {
        let payload = envelope(
            "invoice.payment_failed",
            json!({
                "id": "in_1",
                "customer": "cus_X",
                "parent": { "subscription_details": { "subscription": "sub_X" } },
            }),
        );
        let event = parse_stripe_event(&payload).unwrap();
        assert_eq!(
            event.kind,
            BillingEventKind::InvoicePaymentFailed {
                customer_id: Some("cus_X".to_string()),
                subscription_id: Some("sub_X".to_string()),
            }
        );
    }

    #[test]
    fn test_payment_succeeded_alias() {
        let payload = envelope(
            "invoice.payment_succeeded",
            json!({ "id": "in_2", "customer": "cus_X", "subscription": "sub_X" }),
        );
        assert_eq!(parse_stripe_event(&payload).unwrap().kind.name(), "invoice_paid");
    }

    #[test]
    fn test_subscription_updated_reads_first_item_price() {
        let payload = envelope(
            "customer.subscription.updated",
            json!({
                "id": "sub_X",
                "customer": "cus_X",
                "status": "active",
                "items": { "data": [ { "price": { "id": "price_pro" } } ] },
            }),
        );
        let event = parse_stripe_event(&payload).unwrap();
        assert_eq!(
            event.kind,
            BillingEventKind::SubscriptionUpdated {
                customer_id: Some("cus_X".to_string()),
                subscription_id: "sub_X".to_string(),
                price_id: Some("price_pro".to_string()),
                status: "active".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_type_is_unhandled() {
        let payload = envelope("customer.created", json!({ "id": "cus_1" }));
        let event = parse_stripe_event(&payload).unwrap();
        assert_eq!(
            event.kind,
            BillingEventKind::Unhandled {
                provider_type: "customer.created".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            parse_stripe_event("{not json"),
            Err(BillingError::InvalidPayload(_))
        ));
        assert!(matches!(
            parse_stripe_event(r#"{"id": "evt_1"}"#),
            Err(BillingError::InvalidPayload(_))
        ));
    }
}
