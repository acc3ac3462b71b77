//! End-to-end scenarios over a real on-disk cupboard.

use cupboard_core::{
    with_cupboard, Clause, Cupboard, CupboardConfig, CupboardError, FieldIndex, InstanceOptions,
    QueryOptions, Record, RetrieveOptions, RetryOptions, Shape, ShelfOptions, TxnOptions, Value,
};
use cupboard_store::StoreError;
use std::time::Duration;
use tempfile::tempdir;

fn book_shape() -> Shape {
    Shape::new("book")
        .field("title", FieldIndex::Any)
        .field("isbn", FieldIndex::Unique)
        .field("year", FieldIndex::None)
}

fn add_book(cb: &Cupboard, title: &str, isbn: &str, year: i64) -> Record {
    cb.make_instance(
        &book_shape(),
        [
            ("title", Value::from(title)),
            ("isbn", Value::from(isbn)),
            ("year", Value::from(year)),
        ],
        &InstanceOptions::default(),
        None,
    )
    .unwrap()
}

fn isbns(records: &[Record]) -> Vec<String> {
    let mut isbns: Vec<String> = records
        .iter()
        .map(|r| match r.get("isbn") {
            Some(Value::Text(s)) => s.clone(),
            other => panic!("unexpected isbn {other:?}"),
        })
        .collect();
    isbns.sort();
    isbns
}

#[test]
fn empty_directory_reopens_with_default_shelf() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("c1");

    let cb = Cupboard::open(&dir, CupboardConfig::default()).unwrap();
    assert_eq!(cb.list_shelves().unwrap(), vec!["_default"]);
    cb.close().unwrap();

    let cb = Cupboard::open(&dir, CupboardConfig::default()).unwrap();
    assert_eq!(cb.list_shelves().unwrap(), vec!["_default"]);
    cb.close().unwrap();
}

#[test]
fn retrieve_by_unique_and_any_index() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    add_book(&cb, "A", "1", 2000);
    add_book(&cb, "B", "2", 2001);
    add_book(&cb, "A", "3", 2002);

    // Unique index: exactly the second record.
    let hit = cb
        .retrieve_one("isbn", &Value::from("2"), &RetrieveOptions::default(), None)
        .unwrap()
        .unwrap();
    assert_eq!(hit.get("title"), Some(&Value::from("B")));

    // Any index: first and third, order unspecified.
    let hits: Vec<Record> = cb
        .retrieve("title", &Value::from("A"), &RetrieveOptions::default(), None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(isbns(&hits), vec!["1", "3"]);

    // Unindexed field.
    let err = cb
        .retrieve("year", &Value::from(2000i64), &RetrieveOptions::default(), None)
        .unwrap_err();
    assert!(matches!(err, CupboardError::UnindexedField { .. }));

    cb.close().unwrap();
}

#[test]
fn natural_join_query_over_equality_clauses() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    add_book(&cb, "A", "1", 2000);
    add_book(&cb, "B", "2", 2001);
    add_book(&cb, "A", "3", 2002);

    // `year` is not declared indexed; the query engine establishes its
    // index on demand and populates it from the shelf.
    let hits = cb
        .query(
            &[Clause::eq("title", "A"), Clause::eq("year", 2002i64)],
            &QueryOptions::default(),
            None,
        )
        .unwrap();
    assert_eq!(isbns(&hits), vec!["3"]);
    cb.close().unwrap();
}

#[test]
fn natural_join_equals_intersection_of_retrievals() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    let shape = Shape::new("book")
        .field("title", FieldIndex::Any)
        .field("year", FieldIndex::Any);
    for (title, year) in [("A", 2000i64), ("A", 2001), ("B", 2001), ("A", 2001)] {
        cb.make_instance(
            &shape,
            [("title", Value::from(title)), ("year", Value::from(year))],
            &InstanceOptions::default(),
            None,
        )
        .unwrap();
    }

    let joined = cb
        .query(
            &[Clause::eq("title", "A"), Clause::eq("year", 2001i64)],
            &QueryOptions::default(),
            None,
        )
        .unwrap();

    let by_title: Vec<Record> = cb
        .retrieve("title", &Value::from("A"), &RetrieveOptions::default(), None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    let intersection: Vec<&Record> = by_title
        .iter()
        .filter(|r| r.get("year") == Some(&Value::from(2001i64)))
        .collect();

    let mut joined_keys: Vec<_> = joined.iter().map(Record::primary_key).collect();
    let mut expected_keys: Vec<_> = intersection.iter().map(|r| r.primary_key()).collect();
    joined_keys.sort();
    expected_keys.sort();
    assert_eq!(joined_keys, expected_keys);
    assert_eq!(joined.len(), 2);
    cb.close().unwrap();
}

#[test]
fn range_join_query_over_range_clause() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    let shape = Shape::new("book")
        .field("isbn", FieldIndex::Unique)
        .field("year", FieldIndex::Any);
    for (isbn, year) in [("1", 2000i64), ("2", 2001), ("3", 2002)] {
        cb.make_instance(
            &shape,
            [("isbn", Value::from(isbn)), ("year", Value::from(year))],
            &InstanceOptions::default(),
            None,
        )
        .unwrap();
    }

    let hits = cb
        .query(
            &[Clause::ge("year", 2001i64)],
            &QueryOptions::default(),
            None,
        )
        .unwrap();
    assert_eq!(isbns(&hits), vec!["2", "3"]);

    // Every returned record satisfies every clause.
    let hits = cb
        .query(
            &[Clause::ge("year", 2000i64), Clause::lt("year", 2002i64)],
            &QueryOptions::default(),
            None,
        )
        .unwrap();
    assert_eq!(isbns(&hits), vec!["1", "2"]);

    // Limit caps materialization.
    let hits = cb
        .query(
            &[Clause::ge("year", 2000i64)],
            &QueryOptions::new().limit(2),
            None,
        )
        .unwrap();
    assert_eq!(hits.len(), 2);

    cb.close().unwrap();
}

#[test]
fn custom_predicate_forces_range_join() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    let shape = Shape::new("book").field("year", FieldIndex::Any);
    for year in [2000i64, 2001, 2002, 2003] {
        cb.make_instance(
            &shape,
            [("year", Value::from(year))],
            &InstanceOptions::default(),
            None,
        )
        .unwrap();
    }

    let odd_years = cb
        .query(
            &[Clause::custom("year", 0i64, |candidate, _| {
                matches!(candidate, Value::Int(y) if y % 2 == 1)
            })],
            &QueryOptions::default(),
            None,
        )
        .unwrap();
    let mut years: Vec<i64> = odd_years
        .iter()
        .map(|r| match r.get("year") {
            Some(Value::Int(y)) => *y,
            other => panic!("unexpected year {other:?}"),
        })
        .collect();
    years.sort_unstable();
    assert_eq!(years, vec![2001, 2003]);
    cb.close().unwrap();
}

#[test]
fn deadlock_retry_succeeds_on_third_attempt() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    let mut attempts = 0;
    let record = cb
        .with_txn(
            &RetryOptions::new()
                .max_attempts(3)
                .retry_delay(Duration::from_millis(10)),
            |txn| {
                attempts += 1;
                let mut record = cb.make_instance(
                    &book_shape(),
                    [("title", Value::from("T")), ("isbn", Value::from("9"))],
                    &InstanceOptions::new().save(false),
                    None,
                )?;
                cb.save(&mut record, &Default::default(), Some(txn))?;
                if attempts <= 2 {
                    return Err(CupboardError::from(StoreError::Deadlock { holder: 0 }));
                }
                Ok(record)
            },
        )
        .unwrap();

    assert_eq!(attempts, 3);
    // Exactly the third attempt's record is present.
    let hit = cb
        .retrieve_one("isbn", &Value::from("9"), &RetrieveOptions::default(), None)
        .unwrap()
        .unwrap();
    assert_eq!(hit.primary_key(), record.primary_key());
    assert_eq!(cb.env().active_transaction_count(), 0);
    cb.close().unwrap();
}

#[test]
fn deadlock_retry_exhaustion_persists_nothing() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    let mut attempts = 0;
    let result: Result<(), CupboardError> = cb.with_txn(
        &RetryOptions::new()
            .max_attempts(2)
            .retry_delay(Duration::from_millis(10)),
        |txn| {
            attempts += 1;
            let mut record = cb.make_instance(
                &book_shape(),
                [("isbn", Value::from("X"))],
                &InstanceOptions::new().save(false),
                None,
            )?;
            cb.save(&mut record, &Default::default(), Some(txn))?;
            Err(CupboardError::from(StoreError::Deadlock { holder: 0 }))
        },
    );

    assert_eq!(attempts, 2);
    match result {
        Err(CupboardError::RetriesExhausted { attempts }) => {
            assert_eq!(attempts, 2);
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert!(cb
        .retrieve_one("isbn", &Value::from("X"), &RetrieveOptions::default(), None)
        .unwrap()
        .is_none());
    cb.close().unwrap();
}

#[test]
fn genuine_lock_conflict_retries_until_holder_commits() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    let mut record = add_book(&cb, "A", "1", 2000);

    // A transaction holds the record's write lock.
    let mut holder = cb.begin(&TxnOptions::default()).unwrap();
    cb.assoc(
        &mut record.clone(),
        [("year", Value::from(2001i64))],
        Some(&mut holder),
    )
    .unwrap();

    // A conflicting update deadlocks; after the holder commits, the retry
    // succeeds.
    let mut attempts = 0;
    cb.with_txn(
        &RetryOptions::new()
            .max_attempts(5)
            .retry_delay(Duration::from_millis(5)),
        |txn| {
            attempts += 1;
            if attempts == 2 {
                cb.commit(&mut holder)?;
            }
            cb.assoc(&mut record, [("year", Value::from(2002i64))], Some(txn))
        },
    )
    .unwrap();

    assert!(attempts >= 2);
    let hit = cb
        .retrieve_one("isbn", &Value::from("1"), &RetrieveOptions::default(), None)
        .unwrap()
        .unwrap();
    assert_eq!(hit.get("year"), Some(&Value::from(2002i64)));
    cb.close().unwrap();
}

#[test]
fn remove_shelf_deletes_databases_and_catalog_entries() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    let shape = Shape::new("item")
        .field("i1", FieldIndex::Unique)
        .field("i2", FieldIndex::Any);
    cb.make_instance(
        &shape,
        [("i1", Value::from("a")), ("i2", Value::from("b"))],
        &InstanceOptions::new().shelf("s1"),
        None,
    )
    .unwrap();

    let names = cb.env().database_names().unwrap();
    assert!(names.contains(&"s1".to_string()));
    assert!(names.contains(&"s1:i1".to_string()));
    assert!(names.contains(&"s1:i2".to_string()));

    cb.remove_shelf("s1").unwrap();

    let names = cb.env().database_names().unwrap();
    assert!(!names.iter().any(|n| n == "s1" || n.starts_with("s1:")));
    assert!(!cb.list_shelves().unwrap().contains(&"s1".to_string()));
    cb.close().unwrap();
}

#[test]
fn indices_reopen_with_stored_duplicates_setting() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("cb");

    {
        let cb = Cupboard::open(&dir, CupboardConfig::default()).unwrap();
        add_book(&cb, "A", "1", 2000);
        cb.close().unwrap();
    }

    let cb = Cupboard::open(&dir, CupboardConfig::default()).unwrap();
    let shelf = cb.get_shelf("_default", &ShelfOptions::default()).unwrap();
    assert_eq!(shelf.index_kind("isbn"), Some(FieldIndex::Unique));
    assert_eq!(shelf.index_kind("title"), Some(FieldIndex::Any));

    // The reopened indices serve lookups without any new save.
    let hit = cb
        .retrieve_one("isbn", &Value::from("1"), &RetrieveOptions::default(), None)
        .unwrap();
    assert!(hit.is_some());
    cb.close().unwrap();
}

#[test]
fn primary_key_stable_across_assoc_and_dissoc() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    let mut record = add_book(&cb, "A", "1", 2000);
    let pk = record.primary_key();

    cb.assoc(
        &mut record,
        [("year", Value::from(2005i64)), ("pages", Value::from(300i64))],
        None,
    )
    .unwrap();
    assert_eq!(record.primary_key(), pk);

    cb.dissoc(&mut record, &["pages"], None).unwrap();
    assert_eq!(record.primary_key(), pk);

    // The update happened in place: still a single record under the isbn.
    let hit = cb
        .retrieve_one("isbn", &Value::from("1"), &RetrieveOptions::default(), None)
        .unwrap()
        .unwrap();
    assert_eq!(hit.primary_key(), pk);
    assert_eq!(hit.get("year"), Some(&Value::from(2005i64)));
    assert!(hit.get("pages").is_none());
    cb.close().unwrap();
}

#[test]
fn delete_removes_record_and_index_entries() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    let record = add_book(&cb, "A", "1", 2000);
    cb.delete(&record, None).unwrap();

    assert!(cb
        .retrieve_one("isbn", &Value::from("1"), &RetrieveOptions::default(), None)
        .unwrap()
        .is_none());
    let by_title: Vec<Record> = cb
        .retrieve("title", &Value::from("A"), &RetrieveOptions::default(), None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(by_title.is_empty());

    // Deleting again reports a storage failure.
    assert!(cb.delete(&record, None).is_err());
    cb.close().unwrap();
}

#[test]
fn unique_index_rejects_second_record_with_same_value() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    add_book(&cb, "A", "1", 2000);
    let result = cb.make_instance(
        &book_shape(),
        [("title", Value::from("B")), ("isbn", Value::from("1"))],
        &InstanceOptions::default(),
        None,
    );
    assert!(matches!(
        result,
        Err(CupboardError::Storage(StoreError::UniqueConstraint { .. }))
    ));
    cb.close().unwrap();
}

#[test]
fn abandoned_stream_leaks_no_cursors() {
    let temp = tempdir().unwrap();
    let cb = Cupboard::open(&temp.path().join("cb"), CupboardConfig::default()).unwrap();

    for i in 0..10i64 {
        add_book(&cb, "A", &format!("{i}"), 2000 + i);
    }

    {
        let mut stream = cb
            .retrieve("title", &Value::from("A"), &RetrieveOptions::default(), None)
            .unwrap();
        // Consume a single record, then abandon the stream.
        let _ = stream.next();
        assert!(cb.env().open_cursor_count() > 0);
    }
    assert_eq!(cb.env().open_cursor_count(), 0);

    // The eager query driver also ends with every cursor closed.
    cb.query(
        &[Clause::ge("isbn", "0")],
        &QueryOptions::new().limit(3),
        None,
    )
    .unwrap();
    assert_eq!(cb.env().open_cursor_count(), 0);
    cb.close().unwrap();
}

#[test]
fn failed_open_releases_environment_lock() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("cb");

    {
        let cb = Cupboard::open(&dir, CupboardConfig::default()).unwrap();
        add_book(&cb, "A", "1", 2000);
        cb.close().unwrap();
    }

    // Corrupt the default shelf's data file so bootstrap fails after the
    // environment and catalog have opened.
    let corrupt_target = std::fs::read_dir(&dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name == "db-000002.dat")
        })
        .expect("default shelf data file");
    std::fs::write(&corrupt_target, b"garbage").unwrap();

    let result = Cupboard::open(&dir, CupboardConfig::default());
    assert!(result.is_err());

    // Teardown must have closed everything, including the LOCK file:
    // otherwise this second attempt would fail with EnvironmentLocked
    // instead of the same corruption error.
    let result = Cupboard::open(&dir, CupboardConfig::default());
    assert!(matches!(
        result,
        Err(CupboardError::Storage(StoreError::InvalidFormat { .. }))
    ));

    // Removing the corrupt file makes the cupboard usable again.
    std::fs::remove_file(&corrupt_target).unwrap();
    let cb = Cupboard::open(&dir, CupboardConfig::default()).unwrap();
    cb.close().unwrap();
}

#[test]
fn scoped_cupboard_saves_and_reopens() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("cb");

    with_cupboard(&dir, CupboardConfig::default(), |cb| {
        add_book(cb, "A", "1", 2000);
        Ok(())
    })
    .unwrap();

    with_cupboard(&dir, CupboardConfig::default(), |cb| {
        let hit = cb
            .retrieve_one("isbn", &Value::from("1"), &RetrieveOptions::default(), None)?
            .expect("record survives reopen");
        assert_eq!(hit.get("title"), Some(&Value::from("A")));
        Ok(())
    })
    .unwrap();
}
