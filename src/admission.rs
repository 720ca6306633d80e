//! Admission checks for intents, run before they are persisted.

use tracing::info;

use crate::error::ValidationError;
use crate::names::NameValidator;
use crate::resources::RewriteIntent;
use crate::rule::RewriteRule;

/// Rejects intents whose mapping could never become a valid rule.
#[derive(Debug, Clone, Copy)]
pub struct IntentAdmission {
    validator: NameValidator,
}

impl Default for IntentAdmission {
    fn default() -> Self {
        Self {
            validator: NameValidator::strict(),
        }
    }
}

impl IntentAdmission {
    /// Admission with a custom validator.
    pub fn new(validator: NameValidator) -> Self {
        Self { validator }
    }

    /// Validate a new intent.
    pub fn validate_create(&self, intent: &RewriteIntent) -> Result<(), ValidationError> {
        info!(name = %intent.meta.name, "validate create");
        self.validate(intent)
    }

    /// Validate a changed intent.
    pub fn validate_update(&self, _old: &RewriteIntent, intent: &RewriteIntent) -> Result<(), ValidationError> {
        info!(name = %intent.meta.name, "validate update");
        self.validate(intent)
    }

    /// Deletion is always admitted.
    pub fn validate_delete(&self, intent: &RewriteIntent) -> Result<(), ValidationError> {
        info!(name = %intent.meta.name, "validate delete");
        Ok(())
    }

    fn validate(&self, intent: &RewriteIntent) -> Result<(), ValidationError> {
        let owner = intent.meta.key().to_string();
        RewriteRule::new(&self.validator, owner, &intent.spec.from, &intent.spec.to).map(|_| ())
    }
}
