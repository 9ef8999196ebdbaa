use std::collections::HashSet;

use rand::Rng;

use crate::error::AppError;

/// Alphabet for generated slugs. Lowercase-only keeps generated codes safe
/// from case-folding proxies and copy-paste mangling.
const GENERATED_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Path segments that can never be slugs because they collide with the
/// application's own route space (or with routes the dashboard in front of
/// this service serves).
const DEFAULT_RESERVED: &[&str] = &[
    "about", "account", "admin", "api", "app", "assets", "billing", "blog",
    "dashboard", "docs", "health", "help", "links", "login", "logout",
    "pricing", "privacy", "r", "register", "settings", "signup", "static",
    "support", "terms", "webhook",
];

/// Slug shape rules plus the reserved-word set, passed in rather than read
/// from globals so tests can substitute alternate policies.
#[derive(Debug, Clone)]
pub struct SlugPolicy {
    /// Length of generated slugs.
    pub generated_len: usize,
    /// Inclusive length bounds for user-supplied slugs.
    pub custom_min: usize,
    pub custom_max: usize,
    pub reserved: HashSet<String>,
}

impl Default for SlugPolicy {
    fn default() -> Self {
        Self {
            generated_len: 7,
            custom_min: 3,
            custom_max: 30,
            reserved: DEFAULT_RESERVED.iter().map(|s| (*s).to_owned()).collect(),
        }
    }
}

impl SlugPolicy {
    /// Generate a random slug over `[a-z0-9]`.
    ///
    /// `thread_rng` is a CSPRNG and `gen_range` rejection-samples, so the
    /// draw is uniform over the alphabet with no modulo bias. Redraws if the
    /// result happens to land in the reserved set; uniqueness against
    /// existing links is NOT checked here — the UNIQUE constraint on
    /// `links.slug` is the authority for that.
    pub fn generate(&self) -> String {
        loop {
            let slug: String = {
                let mut rng = rand::thread_rng();
                (0..self.generated_len)
                    .map(|_| GENERATED_ALPHABET[rng.gen_range(0..GENERATED_ALPHABET.len())] as char)
                    .collect()
            };
            if !self.reserved.contains(&slug) {
                return slug;
            }
        }
    }

    /// Validate a user-supplied slug: length within bounds, shape
    /// `[a-z0-9-]+`, and not reserved. Collisions with existing slugs are
    /// surfaced later as a 409 by the unique constraint, never pre-checked.
    pub fn validate_custom(&self, slug: &str) -> Result<(), AppError> {
        if slug.len() < self.custom_min || slug.len() > self.custom_max {
            return Err(AppError::Validation(format!(
                "slug must be between {} and {} characters",
                self.custom_min, self.custom_max
            )));
        }
        if !slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(AppError::Validation(
                "slug may only contain lowercase letters, digits, and hyphens".into(),
            ));
        }
        if self.reserved.contains(slug) {
            return Err(AppError::Validation(format!("slug \"{slug}\" is reserved")));
        }
        Ok(())
    }
}
