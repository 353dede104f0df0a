//! Continuous-compliance Check Evaluation Kernel.
//!
//! This crate implements the provider-agnostic core of a continuous-
//! compliance engine: a declarative Check data model, a field-path mini-
//! language and comparison engine for extracting and judging values out of
//! a dynamically-compiled resource graph, a sandboxed custom-predicate
//! runner, result persistence with history, and a self-improving Check
//! generator driven by an LLM collaborator.
//!
//! The module is bundled inside the `compliance-kernel` wheel and imported
//! as:
//! ```python
//! from compliance_check_engine import CheckEngine, EngineConfig
//! ```
//!
//! Provider SDK calls, LLM transport, and persistence backends are
//! collaborator interfaces (`ConnectorService`, `LLMClient`, `Store`) that
//! live outside this crate's Python surface — see `connector`, `llm`, and
//! `store` for the Rust-side contracts an embedding host implements.

#![allow(clippy::useless_conversion)]

pub mod cache;
pub mod check;
pub mod comparison;
pub mod config;
pub mod connector;
pub mod field_path;
pub mod generator;
pub mod llm;
pub mod orchestrator;
pub mod pyo3_bindings;
pub mod resource;
pub mod sandbox;
pub mod schema;
pub mod store;
pub mod types;

use pyo3::prelude::*;

/// The Python module exposed by this crate.
///
/// Importable as: `from compliance_check_engine import CheckEngine`
#[pymodule]
fn compliance_check_engine(m: &Bound<'_, PyModule>) -> PyResult<()> {
    pyo3_log::init();

    pyo3_bindings::register_module(m)?;

    Ok(())
}
