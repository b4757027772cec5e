//! Hardware identity randomization.
//!
//! A [`Randomizer`] walks a [`FieldTree`], resolves every leaf against an
//! [`IdentityPool`], and writes the result through a [`VmBackend`].
//!
//! Pool references within one category share a single randomly chosen
//! profile per run, so vendor, product and serial always describe the same
//! fabricated unit. Generator leaves are resolved independently every time.

pub mod fields;
pub mod pool;
pub mod random;

pub use fields::{FieldLeaf, FieldNode, FieldTree};
pub use pool::{AttrValue, Category, Generator, IdentityPool, Profile};

use anyhow::{Context, Result};
use rand::Rng;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::backend::VmBackend;

/// Value written when a category has no profiles, or a profile lacks the attribute.
pub const OEM_PLACEHOLDER: &str = "To be filled by O.E.M.";

/// A key/value pair ready to hand to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedField {
    pub key: String,
    pub value: String,
}

/// Per-run memo of which profile each category resolved to.
///
/// `None` records a category with no profiles so it is not re-checked.
struct SelectionCache<'p> {
    picks: HashMap<Category, Option<&'p Profile>>,
}

impl<'p> SelectionCache<'p> {
    fn new() -> Self {
        Self {
            picks: HashMap::new(),
        }
    }

    fn select<R: Rng + ?Sized>(
        &mut self,
        pool: &'p IdentityPool,
        category: Category,
        rng: &mut R,
    ) -> Option<&'p Profile> {
        *self.picks.entry(category).or_insert_with(|| {
            let profiles = pool.profiles(category);
            if profiles.is_empty() {
                None
            } else {
                Some(&profiles[rng.random_range(0..profiles.len())])
            }
        })
    }
}

/// Applies a field tree against a pool.
pub struct Randomizer<'a> {
    pool: &'a IdentityPool,
    fields: &'a FieldTree,
}

impl<'a> Randomizer<'a> {
    pub fn new(pool: &'a IdentityPool, fields: &'a FieldTree) -> Self {
        Self { pool, fields }
    }

    /// Resolve every leaf once. Each call is an independent run with its own
    /// selection cache.
    pub fn resolve(&self) -> Vec<ResolvedField> {
        let mut rng = rand::rng();
        let mut cache = SelectionCache::new();

        self.fields
            .leaves()
            .into_iter()
            .map(|(key, leaf)| {
                let value = match leaf {
                    FieldLeaf::Literal(value) => value.clone(),
                    FieldLeaf::Pool {
                        category,
                        attribute,
                    } => match cache.select(self.pool, *category, &mut rng) {
                        None => OEM_PLACEHOLDER.to_string(),
                        Some(profile) => match profile.get(attribute) {
                            Some(value) => value.resolve(),
                            None => {
                                warn!(
                                    "Selected {} profile has no '{}' attribute; using placeholder",
                                    category, attribute
                                );
                                OEM_PLACEHOLDER.to_string()
                            }
                        },
                    },
                    FieldLeaf::Generator(generate) => generate(),
                };
                ResolvedField { key, value }
            })
            .collect()
    }

    /// Resolve and apply every field through the backend. Diagnostics the
    /// backend returns are reported but not treated as failures.
    pub async fn apply(&self, backend: &mut dyn VmBackend) -> Result<Vec<ResolvedField>> {
        let resolved = self.resolve();

        for field in &resolved {
            info!("Setting {} to {:?}", field.key, field.value);
            let diagnostic = backend
                .set_field(&field.key, &field.value)
                .await
                .with_context(|| format!("Failed to set field {}", field.key))?;
            if let Some(text) = diagnostic {
                debug!("{}: {}", field.key, text);
                println!("{}", text);
            }
        }

        Ok(resolved)
    }
}
