//! Semantic analysis of parsed rules documents
//!
//! Resolution runs in two phases. [`resolve`] is pure and synchronous: it
//! checks every reference against the schema, works out which resources are
//! static and collects the terminology questions the document raises.
//! [`run_terminology_checks`] then asks those questions of a
//! [`TerminologyValidator`](crate::terminology::TerminologyValidator) and its
//! outcome is merged back with [`Resolution::apply`]. Keeping the network
//! phase separate lets the language server run it without holding a lock.

pub mod resolver;
pub mod resource_graph;
pub mod validation;

pub use resolver::{Resolution, ResolvedDocument, resolve};
pub use resource_graph::{Instantiation, ResourceGraph};
pub use validation::{
    AttributeCheck, TerminologyCheck, TerminologyMode, TerminologyOutcome, ValueShape,
    run_terminology_checks,
};
