//! WhatsApp Cloud API plumbing for PneuZap.
//!
//! Pure I/O: the webhook payload model, signature verification and the
//! outbound/media client. Conversation logic lives in `pz-app`.

mod signature;
mod traits;
mod types;
mod webhook;
mod whatsapp;

pub use signature::{SIGNATURE_HEADER, sign_payload, verify_signature};
pub use traits::{MediaSource, MessagingProvider};
pub use types::{MediaId, OutboundImage, PhoneNumber, SendReceipt, WaMessageId};
pub use webhook::{
    InboundContent, InboundUnit, StatusUpdate, WHATSAPP_BUSINESS_ACCOUNT, WebhookEvent,
    WebhookPayload,
};
pub use whatsapp::{MAX_MEDIA_BYTES, WhatsAppCloudClient};
