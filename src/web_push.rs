use web_push::{
    VapidSignatureBuilder,
    WebPushMessageBuilder,
    ContentEncoding,
    SubscriptionInfo,
    IsahcWebPushClient,
    WebPushClient,
    WebPushError,
};
use async_trait::async_trait;
use log::{error, info, debug};
use thiserror::Error;
use crate::config::Settings;
use crate::subscription::PushSubscription;

#[derive(Debug, Error)]
pub enum PushError {
    /// The push service no longer knows the endpoint; the subscription is dead.
    #[error("push endpoint is gone")]
    EndpointGone,
    #[error("failed to build push message: {0}")]
    Build(String),
    #[error("push service rejected the message: {0}")]
    Delivery(String),
}

/// The push-delivery primitive: encrypts and posts one payload to one
/// subscription.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn deliver(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError>;
}

pub struct WebPushSender {
    vapid_private_key: String,
    vapid_subject: String,
    client: IsahcWebPushClient,
}

impl WebPushSender {
    pub fn new(settings: &Settings) -> Result<Self, PushError> {
        let client = IsahcWebPushClient::new().map_err(|e| PushError::Build(e.to_string()))?;
        Ok(Self {
            vapid_private_key: settings.vapid_private_key.clone(),
            vapid_subject: settings.vapid_subject.clone(),
            client,
        })
    }
}

#[async_trait]
impl PushSender for WebPushSender {
    async fn deliver(&self, subscription: &PushSubscription, payload: &[u8]) -> Result<(), PushError> {
        let normalized = subscription.normalized();

        let subscription_info = SubscriptionInfo::new(
            &normalized.endpoint,
            &normalized.keys.p256dh,
            &normalized.keys.auth,
        );

        debug!("Creating VAPID signature builder");
        let mut sig_builder = VapidSignatureBuilder::from_base64(
            &self.vapid_private_key,
            base64::URL_SAFE_NO_PAD,
            &subscription_info,
        ).map_err(|e| PushError::Build(e.to_string()))?;
        sig_builder.add_claim("sub", self.vapid_subject.as_str());

        let signature = sig_builder.build().map_err(|e| {
            error!("Failed to build VAPID signature: {}", e);
            PushError::Build(e.to_string())
        })?;

        let mut builder = WebPushMessageBuilder::new(&subscription_info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(signature);

        let message = builder.build().map_err(|e| {
            error!("Failed to build web push message: {}", e);
            PushError::Build(e.to_string())
        })?;

        debug!("Sending push notification to endpoint: {}", subscription.endpoint);
        match self.client.send(message).await {
            Ok(()) => {
                info!("Web push notification sent successfully");
                Ok(())
            }
            Err(e) => {
                info!("Failed to send push notification: {}", e);
                if matches!(e, WebPushError::EndpointNotValid | WebPushError::EndpointNotFound) {
                    Err(PushError::EndpointGone)
                } else {
                    Err(PushError::Delivery(e.to_string()))
                }
            }
        }
    }
}
