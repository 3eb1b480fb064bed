//! Workflow definition documents for Stepflow pipelines.
//!
//! A definition is `{ agent: {...}, nodes: [...] }` in JSON or YAML. This crate
//! only deserializes it into the raw document model ([`WorkflowDefinition`],
//! [`NodeDefinition`], [`FieldDefinition`], ...); checking that the steps form
//! a valid graph happens when the pipeline compiles the document.
//!
//! # Example
//! ```
//! let yaml = r#"
//! agent:
//!   id: demo
//! nodes:
//!   - id: greet
//!     type: sdk
//! "#;
//! let def = stepflow_definition::parse(yaml).unwrap();
//! assert_eq!(def.agent.id.as_deref(), Some("demo"));
//! assert_eq!(def.nodes[0].node_type, "sdk");
//! ```

pub mod ast;
mod parser;

pub use ast::*;
pub use parser::{load, parse, parse_json, parse_yaml, DefinitionSource};
