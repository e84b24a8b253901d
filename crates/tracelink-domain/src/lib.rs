//! Domain types shared across all Tracelink services.
//!
//! This crate contains only pure types with no framework dependencies.
//! Import in `usecase/` and `domain/` layers; `infra/` maps them to rows and
//! stream fields.

pub mod event;
pub mod id;
pub mod outbox;
