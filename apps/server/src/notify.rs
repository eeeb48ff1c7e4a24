//! Notification dispatch boundary.
//!
//! The booking flow emits structured `trigger + context` events; a
//! separate notification service owns template rendering and the
//! multi-provider delivery fallback (mail API, SMTP, internal inbox).
//! Dispatch is fire-and-forget: a failed delivery never fails the
//! business operation that triggered it.

use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub enum NotificationTrigger {
    BookingConfirmed,
    SwishPaymentPending,
    PaymentConfirmed,
    PaymentRejected,
    BookingCancelled,
}

impl NotificationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationTrigger::BookingConfirmed => "booking_confirmed",
            NotificationTrigger::SwishPaymentPending => "swish_payment_pending",
            NotificationTrigger::PaymentConfirmed => "payment_confirmed",
            NotificationTrigger::PaymentRejected => "payment_rejected",
            NotificationTrigger::BookingCancelled => "booking_cancelled",
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    http: reqwest::Client,
    endpoint: Option<String>,
}

impl Notifier {
    /// `endpoint` is the internal notification service URL. When unset,
    /// events degrade to structured log records.
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }

    pub async fn dispatch(&self, trigger: NotificationTrigger, context: Value) {
        let Some(endpoint) = &self.endpoint else {
            tracing::info!(
                trigger = trigger.as_str(),
                %context,
                "notification (no dispatch endpoint configured)"
            );
            return;
        };

        let body = serde_json::json!({
            "trigger": trigger.as_str(),
            "context": context,
        });

        if let Err(e) = self.http.post(endpoint).json(&body).send().await {
            tracing::error!(
                trigger = trigger.as_str(),
                "notification dispatch failed: {}",
                e
            );
        }
    }
}
