//! Execution fabric for the content pipeline orchestrator.
//!
//! The crate is organised leaf-first: [`rate_limiter`] and [`priority_queue`]
//! gate [`connection_pool`] acquisition; [`circuit_breaker`] and
//! [`cost_ledger`] are composed by [`llm_fabric`] into the single `generate`
//! call every pipeline stage goes through. [`trend_store`], [`hash_index`]
//! and [`manifest_store`] are the three persisted stores; [`state_machine`]
//! is their sole mutator for manifests and owns retry/stale/dead-letter
//! accounting via [`error_classifier`]. [`progress_tracker`] and
//! [`ingress_watcher`] bookend [`pipeline_driver`], which composes
//! everything above per project. [`transducers`] holds the SEO/Shorts/voice
//! trait seams the driver calls into; [`collaborators`] holds the external
//! LLM/trend/audio contracts. [`model`] is the shared data model.

pub mod circuit_breaker;
pub mod collaborators;
pub mod connection_pool;
pub mod cost_ledger;
pub mod error;
pub mod error_classifier;
pub mod hash_index;
pub mod ingress_watcher;
pub mod llm_fabric;
pub mod manifest_store;
pub mod model;
pub mod pipeline_driver;
pub mod priority_queue;
pub mod progress_tracker;
pub mod rate_limiter;
pub mod state_machine;
pub mod transducers;
pub mod trend_store;

#[cfg(test)]
pub(crate) mod test_support;
