//! Conversation-level components of the voice pipeline: session state,
//! end-of-turn arbitration, phrase chunking, output filters, and the
//! per-turn orchestrator.

pub mod endpointing;
pub mod filters;
pub mod phrase;
pub mod pipeline;
pub mod session;
