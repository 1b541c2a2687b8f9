//! Domain logic of the six queues. Each processor is a thin object over the
//! store seams plus whatever external provider the queue talks to.

pub mod alerts;
pub mod billing;
pub mod calendar;
pub mod content;
pub mod email;
pub mod repurpose;

pub use alerts::AlertsProcessor;
pub use billing::BillingRenewalsProcessor;
pub use calendar::CalendarTickProcessor;
pub use content::{ContentRenderProcessor, GenerationProvider, RenderedAsset, RestGenerationProvider};
pub use email::{EmailProvider, EmailSendProcessor, RestEmailProvider};
pub use repurpose::RepurposeProcessor;
