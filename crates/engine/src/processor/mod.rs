//! Command processing
//!
//! ```text
//! command ──▶ HandlerRegistry ──▶ handler(ProcessingContext)
//!                                   │
//!                                   ├─▶ EngineState mutations
//!                                   ├─▶ follow-up events / rejection
//!                                   └─▶ ResponseWriter (at most one response)
//! ```
//!
//! Handlers run synchronously, perform no I/O, and read "now" from the
//! command's timestamp. Replaying the same commands therefore yields the same
//! state and the same follow-up records.

mod context;
mod registry;
mod response;
mod state;
mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{ProcessingContext, ProcessingResult};
pub use registry::{CommandHandler, HandlerRegistry, RegistryError};
pub use response::{Response, ResponseWriter};
pub use state::{partition_of, EngineState, MAX_PARTITION_ID};
pub use stream::StreamProcessor;
