//! Defines `DatasetNode`, a named handle to one dataset in the relationship graph.

use crate::store::Dataset;
use std::sync::Arc;

/// A node of the relationship graph.
///
/// The node never owns its data exclusively: the `Arc` is shared with the caller and
/// with every graph produced by `replace_node`, so graphs stay cheap to clone.
#[derive(Debug, Clone)]
pub struct DatasetNode {
    /// The name used in dotted references (`name.variable`) and relationship strings.
    pub name: String,
    pub data: Arc<Dataset>,
}

impl DatasetNode {
    pub fn new(name: &str, data: Arc<Dataset>) -> Self {
        Self { name: name.to_string(), data }
    }
}
