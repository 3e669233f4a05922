use identity_core::db::open_db_in_memory;
use identity_core::reconcile::mutator;
use identity_core::reconcile::resolver::{Cluster, Decision};
use identity_core::{
    Contact, ContactId, ContactRepository, ContactStore, DecisionKind, IdentifyRequest,
    IdentityConfig, IdentityError, IdentityService, Identifiers, LinkPrecedence, RepoError,
    RepoResult, SqliteContactStore,
};
use rusqlite::Connection;
use std::cell::Cell;

fn service(conn: &Connection) -> IdentityService<SqliteContactStore<'_>> {
    IdentityService::new(SqliteContactStore::try_new(conn).unwrap())
}

fn contact_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM contacts;", [], |row| row.get(0))
        .unwrap()
}

fn primary_count(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM contacts WHERE link_precedence = 'primary';",
        [],
        |row| row.get(0),
    )
    .unwrap()
}

fn link_of(conn: &Connection, id: i64) -> (String, Option<i64>) {
    conn.query_row(
        "SELECT link_precedence, linked_id FROM contacts WHERE id = ?1;",
        [id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .unwrap()
}

fn set_created_at(conn: &Connection, id: i64, created_at: i64) {
    conn.execute(
        "UPDATE contacts SET created_at = ?2 WHERE id = ?1;",
        [id, created_at],
    )
    .unwrap();
}

#[test]
fn walkthrough_creates_attaches_and_merges() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let first = service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap();
    let p1 = first.primary_contact_id;
    assert_eq!(first.emails, vec!["a@x.com"]);
    assert_eq!(first.phone_numbers, vec!["111"]);
    assert!(first.secondary_contact_ids.is_empty());

    let second = service
        .resolve_identity(Some("a@x.com"), Some("222"))
        .unwrap();
    assert_eq!(second.primary_contact_id, p1);
    assert_eq!(second.emails, vec!["a@x.com"]);
    assert_eq!(second.phone_numbers, vec!["111", "222"]);
    assert_eq!(second.secondary_contact_ids.len(), 1);
    let s1 = second.secondary_contact_ids[0];

    let third = service
        .resolve_identity(Some("b@y.com"), Some("333"))
        .unwrap();
    let p2 = third.primary_contact_id;
    assert_ne!(p2, p1);
    assert!(third.secondary_contact_ids.is_empty());

    let merged = service
        .resolve_identity(Some("a@x.com"), Some("333"))
        .unwrap();
    assert_eq!(merged.primary_contact_id, p1);
    assert_eq!(merged.emails, vec!["a@x.com", "b@y.com"]);
    assert_eq!(merged.phone_numbers, vec!["111", "222", "333"]);
    assert_eq!(merged.secondary_contact_ids, vec![s1, p2]);

    assert_eq!(link_of(&conn, p2), ("secondary".to_string(), Some(p1)));
    assert_eq!(contact_count(&conn), 3);
    assert_eq!(primary_count(&conn), 1);
}

#[test]
fn unseen_pair_creates_single_primary() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let view = service
        .resolve_identity(Some("new@x.com"), Some("555"))
        .unwrap();
    assert_eq!(view.emails, vec!["new@x.com"]);
    assert_eq!(view.phone_numbers, vec!["555"]);
    assert!(view.secondary_contact_ids.is_empty());
    assert_eq!(contact_count(&conn), 1);
    assert_eq!(primary_count(&conn), 1);
}

#[test]
fn single_identifier_creates_primary_with_null_counterpart() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let view = service.resolve_identity(None, Some("555")).unwrap();
    assert!(view.emails.is_empty());
    assert_eq!(view.phone_numbers, vec!["555"]);
}

#[test]
fn repeated_submission_is_idempotent() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let first = service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap();
    for _ in 0..5 {
        let again = service
            .resolve_identity(Some("a@x.com"), Some("111"))
            .unwrap();
        assert_eq!(again, first);
    }
    assert_eq!(contact_count(&conn), 1);
}

#[test]
fn known_email_without_phone_never_creates_record() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let created = service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap();
    let view = service.resolve_identity(Some("a@x.com"), None).unwrap();
    assert_eq!(view, created);

    let view = service.resolve_identity(None, Some("111")).unwrap();
    assert_eq!(view, created);
    assert_eq!(contact_count(&conn), 1);
}

#[test]
fn values_recorded_on_different_members_do_not_create_record() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap();
    service
        .resolve_identity(Some("second@x.com"), Some("111"))
        .unwrap();
    assert_eq!(contact_count(&conn), 2);

    let identifiers = Identifiers::new(Some("second@x.com"), Some("111")).unwrap();
    let resolution = service.resolve(&identifiers).unwrap();
    assert_eq!(resolution.decision, DecisionKind::Existing);
    assert!(resolution.outcome.is_noop());

    let identifiers = Identifiers::new(Some("a@x.com"), Some("111")).unwrap();
    assert_eq!(
        service.resolve(&identifiers).unwrap().decision,
        DecisionKind::Existing
    );
    assert_eq!(contact_count(&conn), 2);
}

#[test]
fn new_phone_for_known_email_attaches_secondary() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let before = service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap();
    let identifiers = Identifiers::new(Some("a@x.com"), Some("999")).unwrap();
    let resolution = service.resolve(&identifiers).unwrap();

    assert_eq!(resolution.decision, DecisionKind::Attach);
    let created = resolution.outcome.created.unwrap();
    assert_eq!(created.link_precedence, LinkPrecedence::Secondary);
    assert_eq!(created.linked_id, Some(before.primary_contact_id));
    assert_eq!(created.email.as_deref(), Some("a@x.com"));
    assert_eq!(created.phone_number.as_deref(), Some("999"));
    assert_eq!(resolution.view.phone_numbers, vec!["111", "999"]);
    assert_eq!(
        resolution.view.secondary_contact_ids.len(),
        before.secondary_contact_ids.len() + 1
    );
}

#[test]
fn merge_flattens_secondaries_of_demoted_primary() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let p1 = service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap()
        .primary_contact_id;
    let p2 = service
        .resolve_identity(Some("b@y.com"), Some("333"))
        .unwrap()
        .primary_contact_id;
    let s2 = service
        .resolve_identity(Some("b2@y.com"), Some("333"))
        .unwrap()
        .secondary_contact_ids[0];
    assert_eq!(link_of(&conn, s2), ("secondary".to_string(), Some(p2)));

    // Bridge through the secondary's email so the absorbed cluster is
    // reached via a non-primary record.
    let identifiers = Identifiers::new(Some("b2@y.com"), Some("111")).unwrap();
    let resolution = service.resolve(&identifiers).unwrap();

    assert_eq!(resolution.decision, DecisionKind::Merge);
    assert_eq!(resolution.outcome.demoted, vec![p2]);
    assert_eq!(resolution.outcome.relinked, vec![s2]);
    assert!(resolution.outcome.created.is_none());
    assert_eq!(link_of(&conn, p2), ("secondary".to_string(), Some(p1)));
    assert_eq!(link_of(&conn, s2), ("secondary".to_string(), Some(p1)));

    let view = resolution.view;
    assert_eq!(view.primary_contact_id, p1);
    assert_eq!(view.emails, vec!["a@x.com", "b@y.com", "b2@y.com"]);
    assert_eq!(view.phone_numbers, vec!["111", "333"]);
    assert_eq!(view.secondary_contact_ids, vec![p2, s2]);

    let chained: i64 = conn
        .query_row(
            "SELECT COUNT(*)
             FROM contacts child
             INNER JOIN contacts parent ON parent.id = child.linked_id
             WHERE parent.link_precedence = 'secondary';",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(chained, 0);
}

#[test]
fn repeated_bridging_submission_merges_once() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap();
    service
        .resolve_identity(Some("b@y.com"), Some("333"))
        .unwrap();

    let merged = service
        .resolve_identity(Some("a@x.com"), Some("333"))
        .unwrap();
    let identifiers = Identifiers::new(Some("a@x.com"), Some("333")).unwrap();
    let again = service.resolve(&identifiers).unwrap();

    assert_eq!(again.decision, DecisionKind::Existing);
    assert!(again.outcome.is_noop());
    assert_eq!(again.view, merged);
    assert_eq!(contact_count(&conn), 2);
    assert_eq!(primary_count(&conn), 1);
}

#[test]
fn merge_survivor_is_earliest_created_not_lowest_id() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let p1 = service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap()
        .primary_contact_id;
    let p2 = service
        .resolve_identity(Some("b@y.com"), Some("333"))
        .unwrap()
        .primary_contact_id;
    set_created_at(&conn, p1, 2_000);
    set_created_at(&conn, p2, 1_000);

    let view = service
        .resolve_identity(Some("a@x.com"), Some("333"))
        .unwrap();
    assert_eq!(view.primary_contact_id, p2);
    assert_eq!(view.emails, vec!["b@y.com", "a@x.com"]);
    assert_eq!(link_of(&conn, p1), ("secondary".to_string(), Some(p2)));
}

#[test]
fn merge_tie_on_created_at_keeps_lower_id() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let p1 = service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap()
        .primary_contact_id;
    let p2 = service
        .resolve_identity(Some("b@y.com"), Some("333"))
        .unwrap()
        .primary_contact_id;
    set_created_at(&conn, p1, 5_000);
    set_created_at(&conn, p2, 5_000);

    let view = service
        .resolve_identity(Some("b@y.com"), Some("111"))
        .unwrap();
    assert_eq!(view.primary_contact_id, p1.min(p2));
}

#[test]
fn missing_identifiers_are_rejected_before_storage_access() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let err = service.resolve_identity(None, None).unwrap_err();
    assert!(matches!(err, IdentityError::InvalidInput(_)));
    assert!(err.is_client_error());

    let err = service.resolve_identity(Some(" "), Some("")).unwrap_err();
    assert!(matches!(err, IdentityError::InvalidInput(_)));
    assert_eq!(contact_count(&conn), 0);
}

#[test]
fn identify_handles_json_body_and_envelope() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let request: IdentifyRequest =
        serde_json::from_str(r#"{"email": "a@x.com", "phoneNumber": 111}"#).unwrap();
    let response = service.identify(&request).unwrap();
    let value = serde_json::to_value(&response).unwrap();

    assert_eq!(
        value["contact"]["primaryContactId"],
        response.contact.primary_contact_id
    );
    assert_eq!(value["contact"]["emails"][0], "a@x.com");
    assert_eq!(value["contact"]["phoneNumbers"][0], "111");
    assert!(value["contact"]["secondaryContactIds"]
        .as_array()
        .unwrap()
        .is_empty());

    let empty: IdentifyRequest = serde_json::from_str("{}").unwrap();
    assert!(matches!(
        service.identify(&empty),
        Err(IdentityError::InvalidInput(_))
    ));
}

#[test]
fn cluster_view_accepts_secondary_ids_and_reports_unknown_ids() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap();
    let view = service
        .resolve_identity(Some("a@x.com"), Some("222"))
        .unwrap();

    assert_eq!(service.cluster_view(view.primary_contact_id).unwrap(), view);
    assert_eq!(
        service.cluster_view(view.secondary_contact_ids[0]).unwrap(),
        view
    );
    assert!(matches!(
        service.cluster_view(4242),
        Err(IdentityError::NotFound(4242))
    ));
}

/// Store that injects `Conflict` after the work ran, forcing a rollback.
struct ConflictingStore<'a> {
    inner: SqliteContactStore<'a>,
    conflicts_left: &'a Cell<u32>,
    attempts: &'a Cell<u32>,
}

impl ContactStore for ConflictingStore<'_> {
    fn run_atomic<T, F>(&self, work: F) -> RepoResult<T>
    where
        F: FnOnce(&dyn ContactRepository) -> RepoResult<T>,
    {
        self.attempts.set(self.attempts.get() + 1);
        self.inner.run_atomic(|repo| {
            let output = work(repo)?;
            if self.conflicts_left.get() > 0 {
                self.conflicts_left.set(self.conflicts_left.get() - 1);
                return Err(RepoError::Conflict("injected".to_string()));
            }
            Ok(output)
        })
    }
}

#[test]
fn conflicts_are_retried_until_success() {
    let conn = open_db_in_memory().unwrap();
    let conflicts_left = Cell::new(2);
    let attempts = Cell::new(0);
    let store = ConflictingStore {
        inner: SqliteContactStore::try_new(&conn).unwrap(),
        conflicts_left: &conflicts_left,
        attempts: &attempts,
    };
    let service = IdentityService::new(store);

    let view = service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap();
    assert_eq!(attempts.get(), 3);
    assert!(view.secondary_contact_ids.is_empty());
    assert_eq!(contact_count(&conn), 1);
}

#[test]
fn exhausted_retries_surface_conflict_without_writes() {
    let conn = open_db_in_memory().unwrap();
    let conflicts_left = Cell::new(u32::MAX);
    let attempts = Cell::new(0);
    let store = ConflictingStore {
        inner: SqliteContactStore::try_new(&conn).unwrap(),
        conflicts_left: &conflicts_left,
        attempts: &attempts,
    };
    let config = IdentityConfig {
        max_attempts: 2,
        ..IdentityConfig::default()
    };
    let service = IdentityService::with_config(store, &config);

    let err = service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap_err();
    assert!(matches!(err, IdentityError::ConflictRetry { attempts: 2 }));
    assert!(err.is_transient());
    assert_eq!(attempts.get(), 2);
    assert_eq!(contact_count(&conn), 0);
}

fn two_primaries(conn: &Connection) -> (ContactId, ContactId) {
    let service = service(conn);
    let p1 = service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap()
        .primary_contact_id;
    let p2 = service
        .resolve_identity(Some("b@y.com"), Some("333"))
        .unwrap()
        .primary_contact_id;
    (p1, p2)
}

#[test]
fn merge_with_grown_absorbed_cluster_conflicts_and_rolls_back() {
    let conn = open_db_in_memory().unwrap();
    let (p1, p2) = two_primaries(&conn);
    let store = SqliteContactStore::try_new(&conn).unwrap();
    let identifiers = Identifiers::new(Some("a@x.com"), Some("333")).unwrap();

    let err = store
        .run_atomic(|repo| {
            let snapshot = Cluster::load(repo, p2)?;
            repo.create_contact(
                Some("late@y.com"),
                None,
                LinkPrecedence::Secondary,
                Some(p2),
            )?;
            let decision = Decision::Merge {
                survivor_id: p1,
                absorbed: vec![snapshot],
            };
            mutator::apply(repo, decision, &identifiers)
        })
        .unwrap_err();

    assert!(matches!(err, RepoError::Conflict(_)));
    assert_eq!(contact_count(&conn), 2);
    assert_eq!(link_of(&conn, p2), ("primary".to_string(), None));
}

#[test]
fn merge_with_demoted_absorbed_root_conflicts_and_rolls_back() {
    let conn = open_db_in_memory().unwrap();
    let (p1, p2) = two_primaries(&conn);
    let store = SqliteContactStore::try_new(&conn).unwrap();
    let identifiers = Identifiers::new(Some("a@x.com"), Some("333")).unwrap();

    let err = store
        .run_atomic(|repo| {
            let snapshot = Cluster::load(repo, p2)?;
            repo.update_precedence_and_link(p2, LinkPrecedence::Secondary, Some(p1))?;
            let decision = Decision::Merge {
                survivor_id: p1,
                absorbed: vec![snapshot],
            };
            mutator::apply(repo, decision, &identifiers)
        })
        .unwrap_err();

    assert!(matches!(err, RepoError::Conflict(_)));
    assert_eq!(link_of(&conn, p2), ("primary".to_string(), None));
    assert_eq!(primary_count(&conn), 2);
}

/// Repository that grows `drift_root`'s cluster right after the resolver
/// first reads it, so the mutator sees a different membership.
struct DriftingRepo<'a> {
    inner: &'a dyn ContactRepository,
    drift_root: ContactId,
    drifted: Cell<bool>,
}

impl ContactRepository for DriftingRepo<'_> {
    fn find_by_identifiers(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> RepoResult<Vec<Contact>> {
        self.inner.find_by_identifiers(email, phone_number)
    }

    fn find_by_cluster_root(&self, primary_id: ContactId) -> RepoResult<Vec<Contact>> {
        let rows = self.inner.find_by_cluster_root(primary_id)?;
        if primary_id == self.drift_root && !self.drifted.get() {
            self.drifted.set(true);
            self.inner.create_contact(
                Some("late@y.com"),
                None,
                LinkPrecedence::Secondary,
                Some(primary_id),
            )?;
        }
        Ok(rows)
    }

    fn create_contact(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> RepoResult<Contact> {
        self.inner
            .create_contact(email, phone_number, precedence, linked_id)
    }

    fn update_precedence_and_link(
        &self,
        id: ContactId,
        precedence: LinkPrecedence,
        linked_id: Option<ContactId>,
    ) -> RepoResult<()> {
        self.inner
            .update_precedence_and_link(id, precedence, linked_id)
    }
}

struct DriftingStore<'a> {
    inner: SqliteContactStore<'a>,
    drift_root: ContactId,
    attempts: &'a Cell<u32>,
}

impl ContactStore for DriftingStore<'_> {
    fn run_atomic<T, F>(&self, work: F) -> RepoResult<T>
    where
        F: FnOnce(&dyn ContactRepository) -> RepoResult<T>,
    {
        self.attempts.set(self.attempts.get() + 1);
        self.inner.run_atomic(|repo| {
            let drifting = DriftingRepo {
                inner: repo,
                drift_root: self.drift_root,
                drifted: Cell::new(false),
            };
            work(&drifting)
        })
    }
}

#[test]
fn stale_merge_is_retried_then_surfaces_conflict_without_writes() {
    let conn = open_db_in_memory().unwrap();
    let (p1, p2) = two_primaries(&conn);
    let attempts = Cell::new(0);
    let store = DriftingStore {
        inner: SqliteContactStore::try_new(&conn).unwrap(),
        drift_root: p2,
        attempts: &attempts,
    };
    let service = IdentityService::new(store);

    let err = service
        .resolve_identity(Some("a@x.com"), Some("333"))
        .unwrap_err();

    assert!(matches!(err, IdentityError::ConflictRetry { attempts: 3 }));
    assert_eq!(attempts.get(), 3);
    assert_eq!(contact_count(&conn), 2);
    assert_eq!(primary_count(&conn), 2);
    assert_eq!(link_of(&conn, p1), ("primary".to_string(), None));
    assert_eq!(link_of(&conn, p2), ("primary".to_string(), None));
}

#[test]
fn chained_secondary_surfaces_inconsistent_state_without_retry() {
    let conn = open_db_in_memory().unwrap();
    let seeded = service(&conn);
    seeded
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap();
    let s1 = seeded
        .resolve_identity(Some("a@x.com"), Some("222"))
        .unwrap()
        .secondary_contact_ids[0];
    conn.execute(
        "INSERT INTO contacts (email, link_precedence, linked_id)
         VALUES ('c@z.com', 'secondary', ?1);",
        [s1],
    )
    .unwrap();

    let conflicts_left = Cell::new(0);
    let attempts = Cell::new(0);
    let service = IdentityService::new(ConflictingStore {
        inner: SqliteContactStore::try_new(&conn).unwrap(),
        conflicts_left: &conflicts_left,
        attempts: &attempts,
    });

    let err = service.resolve_identity(Some("c@z.com"), None).unwrap_err();
    assert!(matches!(err, IdentityError::InconsistentState(_)));
    assert!(!err.is_transient());
    assert!(!err.is_client_error());
    assert_eq!(attempts.get(), 1);
    assert_eq!(contact_count(&conn), 3);
}

#[test]
fn store_failure_surfaces_storage_unavailable_without_retry() {
    let conn = open_db_in_memory().unwrap();
    let conflicts_left = Cell::new(0);
    let attempts = Cell::new(0);
    let service = IdentityService::new(ConflictingStore {
        inner: SqliteContactStore::try_new(&conn).unwrap(),
        conflicts_left: &conflicts_left,
        attempts: &attempts,
    });
    conn.execute("DROP TABLE contacts;", []).unwrap();

    let err = service
        .resolve_identity(Some("a@x.com"), Some("111"))
        .unwrap_err();
    assert!(matches!(err, IdentityError::StorageUnavailable(_)));
    assert!(!err.is_transient());
    assert_eq!(attempts.get(), 1);
}
