//! Template graph
//!
//! Two-layer template model: canonical ("ideal") templates shared by all
//! projects and project-level ("custom") templates derived from them.
//!
//! - [`classifier`]: assigns parsed source sections to custom nodes
//! - [`resolver`]: walks mapping rules to find the sources feeding a node
//! - [`tree`]: nested structure views and template maintenance

pub mod classifier;
pub mod resolver;
pub mod tree;

pub use classifier::{Classification, SectionClassifier};
pub use resolver::{GraphResolver, MappingRule};
pub use tree::{TemplateService, TreeNode};
