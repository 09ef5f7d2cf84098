//! signet-store — SQLite gallery of enrolled signature references.
//!
//! Raw image bytes are stored per identity. A SHA-256 digest column narrows
//! the duplicate lookup; equality is always confirmed on the full bytes.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use sha2::{Digest, Sha256};
use signet_core::gallery::{validate_email, validate_name};
use signet_core::{
    AddOutcome, DuplicateAction, DuplicatePolicy, GalleryStore, Identity, IdentityId,
    ReferenceTemplate, StoreError,
};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    name  TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS reference_templates (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    image       BLOB NOT NULL,
    digest      BLOB NOT NULL,
    enrolled_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reference_templates_digest
    ON reference_templates(identity_id, digest);
";

fn backend<E>(err: E) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StoreError::Backend(Box::new(err))
}

fn digest(image: &[u8]) -> Vec<u8> {
    Sha256::digest(image).to_vec()
}

/// Row shape before the timestamp is parsed.
struct RawTemplate {
    id: i64,
    identity: i64,
    image: Vec<u8>,
    enrolled_at: String,
}

impl RawTemplate {
    fn into_template(self) -> Result<ReferenceTemplate, StoreError> {
        let enrolled_at = DateTime::parse_from_rfc3339(&self.enrolled_at)
            .map_err(backend)?
            .with_timezone(&Utc);
        Ok(ReferenceTemplate {
            id: self.id,
            identity: IdentityId(self.identity),
            image: self.image,
            enrolled_at,
        })
    }
}

fn identity_exists(conn: &Connection, identity: IdentityId) -> Result<bool, StoreError> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM identities WHERE id = ?1)",
        params![identity.0],
        |row| row.get(0),
    )
    .map_err(backend)
}

fn insert_template(tx: &Transaction<'_>, identity: IdentityId, image: &[u8]) -> Result<i64, StoreError> {
    tx.execute(
        "INSERT INTO reference_templates (identity_id, image, digest, enrolled_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![identity.0, image, digest(image), Utc::now().to_rfc3339()],
    )
    .map_err(backend)?;
    Ok(tx.last_insert_rowid())
}

pub struct SqliteGallery {
    conn: Connection,
}

impl SqliteGallery {
    /// Open (or create) the gallery database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(backend)?;
            }
        }
        let conn = Connection::open(path).map_err(backend)?;
        tracing::info!(path = %path.display(), "opened signature gallery");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON").map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self { conn })
    }

    pub fn add_identity(&mut self, name: &str, email: &str) -> Result<IdentityId, StoreError> {
        validate_name(name)?;
        validate_email(email)?;

        let taken: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM identities WHERE email = ?1)",
                params![email],
                |row| row.get(0),
            )
            .map_err(backend)?;
        if taken {
            return Err(StoreError::DuplicateEmail(email.to_string()));
        }

        self.conn
            .execute(
                "INSERT INTO identities (name, email) VALUES (?1, ?2)",
                params![name.trim(), email],
            )
            .map_err(backend)?;
        let id = IdentityId(self.conn.last_insert_rowid());
        tracing::info!(identity = %id, email, "identity added");
        Ok(id)
    }

    pub fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, email FROM identities ORDER BY id")
            .map_err(backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Identity {
                    id: IdentityId(row.get(0)?),
                    name: row.get(1)?,
                    email: row.get(2)?,
                })
            })
            .map_err(backend)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(backend)
    }

    /// Look up an identity by email address.
    pub fn find_identity(&self, email: &str) -> Result<Option<Identity>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, name, email FROM identities WHERE email = ?1",
                params![email],
                |row| {
                    Ok(Identity {
                        id: IdentityId(row.get(0)?),
                        name: row.get(1)?,
                        email: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(backend)
    }

    /// Delete an identity; its templates go with it.
    pub fn remove_identity(&mut self, identity: IdentityId) -> Result<(), StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM identities WHERE id = ?1", params![identity.0])
            .map_err(backend)?;
        if removed == 0 {
            return Err(StoreError::UnknownIdentity(identity));
        }
        tracing::info!(identity = %identity, "identity removed");
        Ok(())
    }
}

impl GalleryStore for SqliteGallery {
    fn identity_exists(&self, identity: IdentityId) -> Result<bool, StoreError> {
        identity_exists(&self.conn, identity)
    }

    fn list_references(&self, identity: IdentityId) -> Result<Vec<ReferenceTemplate>, StoreError> {
        if !identity_exists(&self.conn, identity)? {
            return Err(StoreError::UnknownIdentity(identity));
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, identity_id, image, enrolled_at FROM reference_templates
                 WHERE identity_id = ?1 ORDER BY id",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![identity.0], |row| {
                Ok(RawTemplate {
                    id: row.get(0)?,
                    identity: row.get(1)?,
                    image: row.get(2)?,
                    enrolled_at: row.get(3)?,
                })
            })
            .map_err(backend)?;

        let mut templates = Vec::new();
        for row in rows {
            templates.push(row.map_err(backend)?.into_template()?);
        }
        Ok(templates)
    }

    fn add_reference(
        &mut self,
        identity: IdentityId,
        image: &[u8],
        policy: &mut dyn DuplicatePolicy,
    ) -> Result<AddOutcome, StoreError> {
        let tx = self.conn.transaction().map_err(backend)?;
        if !identity_exists(&tx, identity)? {
            return Err(StoreError::UnknownIdentity(identity));
        }

        let candidates = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, identity_id, image, enrolled_at FROM reference_templates
                     WHERE identity_id = ?1 AND digest = ?2 ORDER BY id",
                )
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![identity.0, digest(image)], |row| {
                    Ok(RawTemplate {
                        id: row.get(0)?,
                        identity: row.get(1)?,
                        image: row.get(2)?,
                        enrolled_at: row.get(3)?,
                    })
                })
                .map_err(backend)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(backend)?
        };

        let existing = match candidates.into_iter().find(|raw| raw.image == image) {
            Some(raw) => Some(raw.into_template()?),
            None => None,
        };

        let outcome = match existing {
            None => AddOutcome::Inserted {
                id: insert_template(&tx, identity, image)?,
            },
            Some(existing) => match policy.resolve(identity, &existing) {
                DuplicateAction::Skip => AddOutcome::Skipped { existing: existing.id },
                DuplicateAction::Replace => {
                    tx.execute(
                        "DELETE FROM reference_templates WHERE id = ?1",
                        params![existing.id],
                    )
                    .map_err(backend)?;
                    let inserted = insert_template(&tx, identity, image)?;
                    AddOutcome::Replaced {
                        removed: existing.id,
                        inserted,
                    }
                }
            },
        };

        tx.commit().map_err(backend)?;
        tracing::info!(identity = %identity, bytes = image.len(), ?outcome, "reference enrollment");
        Ok(outcome)
    }

    fn remove_reference(&mut self, identity: IdentityId, reference_id: i64) -> Result<(), StoreError> {
        if !identity_exists(&self.conn, identity)? {
            return Err(StoreError::UnknownIdentity(identity));
        }
        let removed = self
            .conn
            .execute(
                "DELETE FROM reference_templates WHERE id = ?1 AND identity_id = ?2",
                params![reference_id, identity.0],
            )
            .map_err(backend)?;
        if removed == 0 {
            return Err(StoreError::ReferenceNotFound {
                identity,
                reference_id,
            });
        }
        tracing::info!(identity = %identity, reference_id, "reference removed");
        Ok(())
    }
}
