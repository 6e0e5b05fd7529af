//! Type identity shared between the runtime provider and the heap.
//!
//! The heap walker never parses assembly metadata itself. The only piece it carries around
//! is the [`token::Token`] a method table reports for its type definition, which together
//! with the owning module identifies the type.

/// Metadata token type carried by method tables
pub mod token;
