//! Contact store contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide the storage operations consumed by identity reconciliation.
//! - Provide an atomic unit-of-work scope for read-decide-write sequences.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - Query results are ordered by `created_at ASC, id ASC`.
//! - Write paths validate precedence/link pairing before SQL mutations.
//! - Read paths reject invalid persisted state instead of masking it.
//! - Lock contention (`SQLITE_BUSY`/`SQLITE_LOCKED`) surfaces as
//!   `RepoError::Conflict`, never as a plain database error.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::contact::{validate_link, Contact, ContactId, ContactValidationError, LinkPrecedence};
use rusqlite::{params, Connection, ErrorCode, Row, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};

const CONTACT_SELECT_SQL: &str = "SELECT
    id,
    email,
    phone_number,
    link_precedence,
    linked_id,
    created_at,
    updated_at
FROM contacts";

const CONTACT_COLUMNS: [&str; 7] = [
    "id",
    "email",
    "phone_number",
    "link_precedence",
    "linked_id",
    "created_at",
    "updated_at",
];

pub type RepoResult<T> = Result<T, RepoError>;

/// Error for contact persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Validation(ContactValidationError),
    Db(DbError),
    NotFound(ContactId),
    /// Concurrent writer held the database or changed the rows being mutated.
    Conflict(String),
    InvalidData(String),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "contact not found: {id}"),
            Self::Conflict(details) => write!(f, "concurrent modification: {details}"),
            Self::InvalidData(message) => write!(f, "invalid persisted contact data: {message}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "contact store requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "contact store requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "contact store requires column `{column}` in table `{table}`"
            ),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ContactValidationError> for RepoError {
    fn from(value: ContactValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Sqlite(err) => err.into(),
            other => Self::Db(other),
        }
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        if is_lock_contention(&value) {
            return Self::Conflict(value.to_string());
        }
        Self::Db(DbError::Sqlite(value))
    }
}

/// Storage operations consumed by the reconciliation pipeline.
pub trait ContactRepository {
    /// Returns contacts whose email equals `email` or whose phone equals
    /// `phone_number`. Absent arguments never match.
    fn find_by_identifiers(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> RepoResult<Vec<Contact>>;
    /// Returns the record `primary_id` plus every record linked to it.
    fn find_by_cluster_root(&self, primary_id: ContactId) -> RepoResult<Vec<Contact>>;
    /// Inserts a contact; storage assigns `id` and timestamps.
    fn create_contact(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> RepoResult<Contact>;
    /// Rewrites precedence and link of one contact.
    fn update_precedence_and_link(
        &self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> RepoResult<()>;
}

/// Store exposing an atomic scope over `ContactRepository` operations.
pub trait ContactStore {
    /// Runs `work` in one isolated unit: committed when it returns `Ok`,
    /// rolled back when it returns `Err`.
    fn run_atomic<T, F>(&self, work: F) -> RepoResult<T>
    where
        F: FnOnce(&dyn ContactRepository) -> RepoResult<T>;
}

/// SQLite-backed contact store.
pub struct SqliteContactStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteContactStore<'conn> {
    /// Constructs a store from a migrated/ready connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_contact_connection_ready(conn)?;
        Ok(Self { conn })
    }
}

impl ContactStore for SqliteContactStore<'_> {
    fn run_atomic<T, F>(&self, work: F) -> RepoResult<T>
    where
        F: FnOnce(&dyn ContactRepository) -> RepoResult<T>,
    {
        // IMMEDIATE takes the write lock up front so every reconciliation on
        // this database file is serialized.
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let scoped = SqliteContactStore { conn: &tx };
        let output = work(&scoped)?;
        tx.commit()?;
        Ok(output)
    }
}

impl ContactRepository for SqliteContactStore<'_> {
    fn find_by_identifiers(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> RepoResult<Vec<Contact>> {
        if email.is_none() && phone_number.is_none() {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(&format!(
            "{CONTACT_SELECT_SQL}
             WHERE (?1 IS NOT NULL AND email = ?1)
                OR (?2 IS NOT NULL AND phone_number = ?2)
             ORDER BY created_at ASC, id ASC;"
        ))?;
        let mut rows = stmt.query(params![email, phone_number])?;
        let mut contacts = Vec::new();
        while let Some(row) = rows.next()? {
            contacts.push(parse_contact_row(row)?);
        }
        Ok(contacts)
    }

    fn find_by_cluster_root(&self, primary_id: ContactId) -> RepoResult<Vec<Contact>> {
        let mut stmt = self.conn.prepare(&format!(
            "{CONTACT_SELECT_SQL}
             WHERE id = ?1 OR linked_id = ?1
             ORDER BY created_at ASC, id ASC;"
        ))?;
        let mut rows = stmt.query([primary_id])?;
        let mut contacts = Vec::new();
        while let Some(row) = rows.next()? {
            contacts.push(parse_contact_row(row)?);
        }
        Ok(contacts)
    }

    fn create_contact(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> RepoResult<Contact> {
        if email.is_none() && phone_number.is_none() {
            return Err(RepoError::Validation(
                ContactValidationError::MissingIdentifiers,
            ));
        }
        validate_link(precedence, linked_id)?;

        self.conn.execute(
            "INSERT INTO contacts (
                email,
                phone_number,
                link_precedence,
                linked_id
            ) VALUES (?1, ?2, ?3, ?4);",
            params![email, phone_number, precedence.as_str(), linked_id],
        )?;

        let id = self.conn.last_insert_rowid();
        load_required_contact(self.conn, id)
    }

    fn update_precedence_and_link(
        &self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> RepoResult<()> {
        validate_link(precedence, linked_id)?;
        if linked_id == Some(id) {
            return Err(RepoError::Validation(ContactValidationError::SelfLink(id)));
        }

        let changed = self.conn.execute(
            "UPDATE contacts
             SET
                link_precedence = ?2,
                linked_id = ?3,
                updated_at = CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)
             WHERE id = ?1;",
            params![id, precedence.as_str(), linked_id],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(id));
        }

        Ok(())
    }
}

fn load_required_contact(conn: &Connection, id: ContactId) -> RepoResult<Contact> {
    let mut stmt = conn.prepare(&format!("{CONTACT_SELECT_SQL} WHERE id = ?1;"))?;
    let mut rows = stmt.query([id])?;
    if let Some(row) = rows.next()? {
        return parse_contact_row(row);
    }
    Err(RepoError::NotFound(id))
}

fn parse_contact_row(row: &Row<'_>) -> RepoResult<Contact> {
    let id: ContactId = row.get("id")?;

    let precedence_text: String = row.get("link_precedence")?;
    let link_precedence = LinkPrecedence::parse(&precedence_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid link precedence `{precedence_text}` in contacts.link_precedence"
        ))
    })?;

    let contact = Contact {
        id,
        email: row.get("email")?,
        phone_number: row.get("phone_number")?,
        link_precedence,
        linked_id: row.get("linked_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    };
    contact
        .validate()
        .map_err(|err| RepoError::InvalidData(format!("contact {id}: {err}")))?;
    Ok(contact)
}

fn is_lock_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn ensure_contact_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    if !table_exists(conn, "contacts")? {
        return Err(RepoError::MissingRequiredTable("contacts"));
    }

    for column in CONTACT_COLUMNS {
        if !table_has_column(conn, "contacts", column)? {
            return Err(RepoError::MissingRequiredColumn {
                table: "contacts",
                column,
            });
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> RepoResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}
