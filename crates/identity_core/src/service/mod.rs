//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate the reconciliation pipeline into use-case level APIs.
//! - Keep transport/CLI layers decoupled from storage details.

pub mod identity_service;
