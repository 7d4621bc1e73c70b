#![forbid(unsafe_code)]

//! # squad-harness
//!
//! Turns a squad's problem statement and backlog into a structure proposal: personas,
//! roles, phases, governance and a readiness call. A model drafts the proposal, the
//! harness splits it into typed suggestions, and each suggestion is approved or
//! rejected on its own. Approval writes the suggestion into the squad's records
//! exactly once.

pub mod config;
pub mod gateway;
pub mod http;
pub mod prompts;
pub mod structure;
pub mod template;

pub use config::Config;
pub use gateway::{GenerateRequest, GenerateResponse, ModelError, ModelGateway, OpenRouterAdapter};
pub use structure::store::SquadStore;
pub use structure::{DecidedSuggestion, GeneratedProposal, ServiceError, StructureService};
