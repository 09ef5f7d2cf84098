//! Gallery store seam: per-identity enrolled reference images.
//!
//! The verifier reads through [`GalleryStore::list_references`] only.
//! Enrollment goes through [`GalleryStore::add_reference`], which enforces
//! exact-content deduplication and defers the replace/skip choice to a
//! [`DuplicatePolicy`] supplied by the caller.

use crate::types::{Identity, IdentityId, ReferenceTemplate};
use chrono::Utc;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity {0} does not exist")]
    UnknownIdentity(IdentityId),
    #[error("reference {reference_id} not found for identity {identity}")]
    ReferenceNotFound { identity: IdentityId, reference_id: i64 },
    #[error("invalid identity name '{name}': {message}")]
    InvalidName { name: String, message: String },
    #[error("invalid email address '{0}'")]
    InvalidEmail(String),
    #[error("email address '{0}' is already enrolled")]
    DuplicateEmail(String),
    #[error("gallery backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Caller's answer when an exact duplicate is already enrolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateAction {
    /// Remove the existing template and enroll the new bytes.
    Replace,
    /// Keep the existing template; enroll nothing.
    Skip,
}

/// Decides what happens to a byte-identical re-enrollment.
pub trait DuplicatePolicy {
    fn resolve(&mut self, identity: IdentityId, existing: &ReferenceTemplate) -> DuplicateAction;
}

impl<F> DuplicatePolicy for F
where
    F: FnMut(IdentityId, &ReferenceTemplate) -> DuplicateAction,
{
    fn resolve(&mut self, identity: IdentityId, existing: &ReferenceTemplate) -> DuplicateAction {
        self(identity, existing)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReplace;

impl DuplicatePolicy for AlwaysReplace {
    fn resolve(&mut self, _identity: IdentityId, _existing: &ReferenceTemplate) -> DuplicateAction {
        DuplicateAction::Replace
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSkip;

impl DuplicatePolicy for AlwaysSkip {
    fn resolve(&mut self, _identity: IdentityId, _existing: &ReferenceTemplate) -> DuplicateAction {
        DuplicateAction::Skip
    }
}

/// Result of one `add_reference` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted { id: i64 },
    Replaced { removed: i64, inserted: i64 },
    Skipped { existing: i64 },
}

pub trait GalleryStore {
    fn identity_exists(&self, identity: IdentityId) -> Result<bool, StoreError>;

    /// All templates of `identity` in enrollment order. Empty is not an error.
    fn list_references(&self, identity: IdentityId) -> Result<Vec<ReferenceTemplate>, StoreError>;

    /// Enroll `image`, consulting `policy` when identical bytes already exist.
    fn add_reference(
        &mut self,
        identity: IdentityId,
        image: &[u8],
        policy: &mut dyn DuplicatePolicy,
    ) -> Result<AddOutcome, StoreError>;

    fn remove_reference(&mut self, identity: IdentityId, reference_id: i64) -> Result<(), StoreError>;
}

/// Validate an identity display name: non-empty after trimming, no control characters.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = |message: &str| StoreError::InvalidName {
        name: name.to_string(),
        message: message.to_string(),
    };
    if name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid("name must not contain control characters"));
    }
    Ok(())
}

/// Validate an email address shape: `local@label.rest`.
///
/// Local part: `[A-Za-z0-9_.+-]+`. First domain label: `[A-Za-z0-9-]+`.
/// Remainder after the first dot: `[A-Za-z0-9-.]+`.
pub fn validate_email(email: &str) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidEmail(email.to_string());

    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    let (label, rest) = domain.split_once('.').ok_or_else(invalid)?;

    let local_ok = !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '+' | '-'));
    let label_ok = !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    let rest_ok = !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.'));

    if local_ok && label_ok && rest_ok {
        Ok(())
    } else {
        Err(invalid())
    }
}

/// Map-backed gallery for tests and embedding in other tools.
#[derive(Debug, Default)]
pub struct InMemoryGallery {
    identities: BTreeMap<IdentityId, Identity>,
    references: Vec<ReferenceTemplate>,
    next_identity: i64,
    next_reference: i64,
}

impl InMemoryGallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_identity(&mut self, name: &str, email: &str) -> Result<IdentityId, StoreError> {
        validate_name(name)?;
        validate_email(email)?;
        if self.identities.values().any(|i| i.email == email) {
            return Err(StoreError::DuplicateEmail(email.to_string()));
        }

        self.next_identity += 1;
        let id = IdentityId(self.next_identity);
        self.identities.insert(
            id,
            Identity {
                id,
                name: name.trim().to_string(),
                email: email.to_string(),
            },
        );
        Ok(id)
    }

    pub fn list_identities(&self) -> Vec<Identity> {
        self.identities.values().cloned().collect()
    }

    /// Remove an identity together with all of its templates.
    pub fn remove_identity(&mut self, identity: IdentityId) -> Result<(), StoreError> {
        if self.identities.remove(&identity).is_none() {
            return Err(StoreError::UnknownIdentity(identity));
        }
        self.references.retain(|r| r.identity != identity);
        Ok(())
    }

    fn insert(&mut self, identity: IdentityId, image: &[u8]) -> i64 {
        self.next_reference += 1;
        self.references.push(ReferenceTemplate {
            id: self.next_reference,
            identity,
            image: image.to_vec(),
            enrolled_at: Utc::now(),
        });
        self.next_reference
    }

    fn ensure_identity(&self, identity: IdentityId) -> Result<(), StoreError> {
        if self.identities.contains_key(&identity) {
            Ok(())
        } else {
            Err(StoreError::UnknownIdentity(identity))
        }
    }
}

impl GalleryStore for InMemoryGallery {
    fn identity_exists(&self, identity: IdentityId) -> Result<bool, StoreError> {
        Ok(self.identities.contains_key(&identity))
    }

    fn list_references(&self, identity: IdentityId) -> Result<Vec<ReferenceTemplate>, StoreError> {
        self.ensure_identity(identity)?;
        Ok(self
            .references
            .iter()
            .filter(|r| r.identity == identity)
            .cloned()
            .collect())
    }

    fn add_reference(
        &mut self,
        identity: IdentityId,
        image: &[u8],
        policy: &mut dyn DuplicatePolicy,
    ) -> Result<AddOutcome, StoreError> {
        self.ensure_identity(identity)?;

        let existing = self
            .references
            .iter()
            .find(|r| r.identity == identity && r.image == image)
            .cloned();

        match existing {
            None => Ok(AddOutcome::Inserted { id: self.insert(identity, image) }),
            Some(existing) => match policy.resolve(identity, &existing) {
                DuplicateAction::Skip => Ok(AddOutcome::Skipped { existing: existing.id }),
                DuplicateAction::Replace => {
                    self.references.retain(|r| r.id != existing.id);
                    let inserted = self.insert(identity, image);
                    Ok(AddOutcome::Replaced { removed: existing.id, inserted })
                }
            },
        }
    }

    fn remove_reference(&mut self, identity: IdentityId, reference_id: i64) -> Result<(), StoreError> {
        self.ensure_identity(identity)?;
        let before = self.references.len();
        self.references
            .retain(|r| !(r.identity == identity && r.id == reference_id));
        if self.references.len() == before {
            return Err(StoreError::ReferenceNotFound { identity, reference_id });
        }
        Ok(())
    }
}
