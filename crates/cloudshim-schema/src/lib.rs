//! Cloudshim Schema - JSON-Schema normalization
//!
//! The cloud backend accepts a restricted JSON-Schema dialect for tool
//! parameters: no references, no unions, no `additionalProperties`. This crate
//! rewrites arbitrary tool schemas into that dialect:
//! - `$ref` into `$defs` / `definitions` is inlined
//! - `anyOf` / `oneOf` collapse to one branch (or a flattened object)
//! - `allOf` branches are merged
//! - unsupported keywords are stripped

mod node;
mod normalize;

pub use node::{SchemaNode, UnionKeyword};
pub use normalize::{normalize, STRIPPED_KEYWORDS};
