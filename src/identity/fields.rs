//! Field specification tree: which backend keys to set and how to resolve them.

use anyhow::{Result, bail};
use std::collections::BTreeMap;
use std::fmt;

use super::pool::{Category, Generator};

/// How a single configuration key gets its value.
#[derive(Clone)]
pub enum FieldLeaf {
    /// Fixed value.
    Literal(String),
    /// Attribute of the profile selected for `category` in the current run.
    Pool { category: Category, attribute: String },
    /// Fresh value on every resolution, never shared between fields.
    Generator(Generator),
}

impl FieldLeaf {
    pub fn literal(value: &str) -> Self {
        FieldLeaf::Literal(value.to_string())
    }

    pub fn pool(category: Category, attribute: &str) -> Self {
        FieldLeaf::Pool {
            category,
            attribute: attribute.to_string(),
        }
    }
}

impl fmt::Debug for FieldLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldLeaf::Literal(s) => f.debug_tuple("Literal").field(s).finish(),
            FieldLeaf::Pool {
                category,
                attribute,
            } => write!(f, "Pool({}.{})", category, attribute),
            FieldLeaf::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FieldNode {
    Branch(BTreeMap<String, FieldNode>),
    Leaf(FieldLeaf),
}

/// Hierarchical map from slash-separated key path to leaf.
#[derive(Debug, Clone, Default)]
pub struct FieldTree {
    root: BTreeMap<String, FieldNode>,
}

impl FieldTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a leaf at `path` (segments separated by `/`), creating branches
    /// as needed. Empty segments and leaf/branch collisions are rejected.
    pub fn insert(&mut self, path: &str, leaf: FieldLeaf) -> Result<()> {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            bail!("Field path '{}' contains an empty segment", path);
        }

        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => bail!("Field path cannot be empty"),
        };

        let mut level = &mut self.root;
        for segment in parents {
            let node = level
                .entry(segment.to_string())
                .or_insert_with(|| FieldNode::Branch(BTreeMap::new()));
            level = match node {
                FieldNode::Branch(children) => children,
                FieldNode::Leaf(_) => {
                    bail!("Field path '{}' descends through leaf '{}'", path, segment)
                }
            };
        }

        if level.contains_key(*last) {
            bail!("Field path '{}' is already defined", path);
        }
        level.insert(last.to_string(), FieldNode::Leaf(leaf));
        Ok(())
    }

    /// Builder form of [`FieldTree::insert`] for a group of leaves under a common prefix.
    pub fn with_group(mut self, prefix: &str, leaves: Vec<(&str, FieldLeaf)>) -> Result<Self> {
        for (key, leaf) in leaves {
            self.insert(&format!("{}/{}", prefix, key), leaf)?;
        }
        Ok(self)
    }

    /// All leaves with their full paths, in a stable order.
    pub fn leaves(&self) -> Vec<(String, &FieldLeaf)> {
        fn walk<'a>(
            prefix: &str,
            level: &'a BTreeMap<String, FieldNode>,
            out: &mut Vec<(String, &'a FieldLeaf)>,
        ) {
            for (segment, node) in level {
                let path = if prefix.is_empty() {
                    segment.clone()
                } else {
                    format!("{}/{}", prefix, segment)
                };
                match node {
                    FieldNode::Branch(children) => walk(&path, children, out),
                    FieldNode::Leaf(leaf) => out.push((path, leaf)),
                }
            }
        }

        let mut out = Vec::new();
        walk("", &self.root, &mut out);
        out
    }

    pub fn len(&self) -> usize {
        self.leaves().len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}
