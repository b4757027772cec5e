//! Identity pool: plausible hardware profiles grouped by category.
//!
//! The pool is immutable once built. It is either assembled in code or loaded
//! from a TOML file where each category is an array of profile tables:
//!
//! ```toml
//! [[system]]
//! vendor = "Dell Inc."
//! product = "OptiPlex 755"
//! serial = { random = "serial", length = 7 }
//! uuid = { random = "uuid" }
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::random;
use crate::error::ProvisionError;

/// Hardware identity category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Bios,
    System,
    Board,
    Chassis,
    Harddisk,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Bios,
        Category::System,
        Category::Board,
        Category::Chassis,
        Category::Harddisk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Bios => "bios",
            Category::System => "system",
            Category::Board => "board",
            Category::Chassis => "chassis",
            Category::Harddisk => "harddisk",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s.to_lowercase())
            .ok_or_else(|| {
                format!(
                    "Unknown identity category '{}'. Valid categories: bios, system, board, chassis, harddisk",
                    s
                )
            })
    }
}

/// Zero-argument value generator, invoked every time a value is resolved.
pub type Generator = Arc<dyn Fn() -> String + Send + Sync>;

/// Attribute value inside a profile record.
#[derive(Clone)]
pub enum AttrValue {
    Literal(String),
    Generated(Generator),
}

impl AttrValue {
    pub fn resolve(&self) -> String {
        match self {
            AttrValue::Literal(s) => s.clone(),
            AttrValue::Generated(generate) => generate(),
        }
    }
}

impl fmt::Debug for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Literal(s) => f.debug_tuple("Literal").field(s).finish(),
            AttrValue::Generated(_) => f.write_str("Generated(..)"),
        }
    }
}

/// One plausible hardware unit within a category.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    attrs: HashMap<String, AttrValue>,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a literal attribute.
    pub fn with(mut self, attr: &str, value: &str) -> Self {
        self.attrs
            .insert(attr.to_string(), AttrValue::Literal(value.to_string()));
        self
    }

    /// Add an attribute whose value is generated on each resolution.
    pub fn with_generator(mut self, attr: &str, generator: Generator) -> Self {
        self.attrs
            .insert(attr.to_string(), AttrValue::Generated(generator));
        self
    }

    pub fn get(&self, attr: &str) -> Option<&AttrValue> {
        self.attrs.get(attr)
    }
}

/// Catalog of profiles per category. Empty by default.
#[derive(Debug, Clone, Default)]
pub struct IdentityPool {
    categories: HashMap<Category, Vec<Profile>>,
}

impl IdentityPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, category: Category, profile: Profile) -> Self {
        self.categories.entry(category).or_default().push(profile);
        self
    }

    pub fn profiles(&self, category: Category) -> &[Profile] {
        self.categories
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.categories.values().all(Vec::is_empty)
    }

    /// Load a pool file, or return an empty pool when no path is configured.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::new()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read identity pool: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid identity pool: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: HashMap<String, Vec<HashMap<String, RawAttr>>> =
            toml::from_str(content).map_err(|e| ProvisionError::MalformedPool(e.to_string()))?;

        let mut pool = IdentityPool::new();
        for (category_name, profiles) in raw {
            let category: Category = category_name
                .parse()
                .map_err(ProvisionError::MalformedPool)?;

            for raw_profile in profiles {
                let mut profile = Profile::new();
                for (attr, value) in raw_profile {
                    let value = value.into_attr_value().map_err(|e| {
                        ProvisionError::MalformedPool(format!("{}.{}: {}", category, attr, e))
                    })?;
                    profile.attrs.insert(attr, value);
                }
                pool = pool.with_profile(category, profile);
            }
        }

        Ok(pool)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAttr {
    Literal(String),
    Generator(GeneratorSpec),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GeneratorSpec {
    random: String,
    length: Option<usize>,
    min: Option<usize>,
    max: Option<usize>,
}

impl RawAttr {
    fn into_attr_value(self) -> std::result::Result<AttrValue, String> {
        match self {
            RawAttr::Literal(s) => Ok(AttrValue::Literal(s)),
            RawAttr::Generator(spec) => spec.into_generator().map(AttrValue::Generated),
        }
    }
}

impl GeneratorSpec {
    fn into_generator(self) -> std::result::Result<Generator, String> {
        let generator: Generator = match self.random.as_str() {
            "serial" => {
                let length = self.length;
                Arc::new(move || random::random_serial(length))
            }
            "uuid" => Arc::new(random::random_uuid),
            "date" => Arc::new(random::random_bios_date),
            "string" => {
                let min = self.min.or(self.length).unwrap_or(8);
                let max = self.max;
                if max.is_some_and(|max| max < min) {
                    return Err(format!("max ({:?}) is smaller than min ({})", max, min));
                }
                Arc::new(move || random::random_string(min, max))
            }
            other => {
                return Err(format!(
                    "unknown generator '{}'. Valid generators: serial, uuid, date, string",
                    other
                ));
            }
        };
        Ok(generator)
    }
}
