//! The composition root: the one place process-level concerns (config
//! loading, tracing setup, picking a provider and a memory backing) get
//! wired into a single `AgentContext`. Every Agent API call a binary built
//! on top of this crate makes goes through the `Arc<AgentContext>` this
//! module hands back — no global state lives anywhere in the core crates.

pub mod wiring;

pub use wiring::{build_context, build_gateway, init_tracing};
