//! IR Transformations for Quill
//!
//! This crate contains transformation passes that run on the HIR:
//! - Closure conversion (lambdas into first-order objects)
//! - Lambda interface synthesis (`FnN`/`FnVoidN`)

pub mod closure;
pub mod interfaces;

// Re-export main transformation entry points
pub use closure::convert_closures;
pub use interfaces::InterfaceRegistry;
