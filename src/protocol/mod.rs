//! Wire format of the request/response envelopes and the correlation
//! identity that binds them.
//!
//! Both envelopes travel as JSON text bodies. Field names are camelCase so
//! that dispatchers and workers written against the same queues in other
//! runtimes can interoperate.
mod correlation;
mod message;

pub use correlation::{CorrelationId, Identity, RunId};
pub use message::{DispatchOutput, RequestEnvelope, ResponseEnvelope};
