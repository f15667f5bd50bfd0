//! Integration tests for the ORM execution pipeline.
//!
//! These tests run querysets and instance lifecycle operations against a
//! real in-memory SQLite database and check the rows and instances that
//! come back.

use std::sync::Arc;

use futures::TryStreamExt;
use relata::prelude::*;
use relata_test::TestDatabase;

// ── Test schema ───────────────────────────────────────────────────────

fn library() -> Arc<ModelRegistry> {
    ModelRegistryBuilder::new(&Settings::default())
        .register(
            ModelDefinition::new("Author")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("name", 100)),
        )
        .register(
            ModelDefinition::new("Book")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("title", 200))
                .field(FieldDef::integer("year"))
                .field(FieldDef::string("genre", 50).default("Fiction"))
                .foreign_key(ForeignKey::new("author", "Author").related_name("books").nullable()),
        )
        .register(
            ModelDefinition::new("Product")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("name", 100)),
        )
        .build()
        .unwrap()
}

async fn setup() -> (Arc<ModelRegistry>, TestDatabase) {
    let registry = library();
    let db = TestDatabase::new().unwrap();
    db.create_tables(&registry).await.unwrap();
    (registry, db)
}

async fn seed_books(registry: &Arc<ModelRegistry>, db: &TestDatabase) -> Instance {
    let author = registry
        .objects("Author")
        .unwrap()
        .create(db, values! { "name" => "Hemingway" })
        .await
        .unwrap();
    let books = registry.objects("Book").unwrap();
    for (title, year) in [("The Sun Also Rises", 1926), ("A Farewell to Arms", 1929), ("The Old Man and the Sea", 1952)] {
        books
            .create(db, values! { "title" => title, "year" => year, "author" => &author })
            .await
            .unwrap();
    }
    author
}

fn titles(items: &[Instance]) -> Vec<String> {
    items
        .iter()
        .map(|b| b.get("title").unwrap().as_str().unwrap().to_string())
        .collect()
}

// ── Schema ────────────────────────────────────────────────────────────

#[test]
fn test_two_primary_key_fields_are_rejected() {
    let result = ModelRegistryBuilder::new(&Settings::default())
        .register(
            ModelDefinition::new("Broken")
                .field(FieldDef::integer("a").primary_key())
                .field(FieldDef::integer("b").primary_key()),
        )
        .build();
    assert!(matches!(result, Err(RelataError::Definition(_))));
}

#[test]
fn test_missing_primary_key_is_rejected() {
    let result = ModelRegistryBuilder::new(&Settings::default())
        .register(ModelDefinition::new("Broken").field(FieldDef::integer("a")))
        .build();
    assert!(matches!(result, Err(RelataError::Definition(_))));
}

#[tokio::test]
async fn test_configured_from_toml() {
    let settings = settings_loader::from_toml_str(
        r#"
        bulk_batch_size = 2

        [databases.default]
        engine = "relata.backends.sqlite"
        name = ":memory:"
        options = {}
        "#,
    )
    .unwrap();
    let registry = ModelRegistryBuilder::new(&settings)
        .register(
            ModelDefinition::new("Note")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("body", 50)),
        )
        .build()
        .unwrap();
    assert_eq!(registry.settings().bulk_batch_size, 2);

    let db = SqliteBackend::from_settings(&settings).unwrap();
    for schema in registry.models() {
        for sql in TestDatabase::create_table_sql(&schema).unwrap() {
            db.execute(&sql, &[]).await.unwrap();
        }
    }
    let notes = registry.objects("Note").unwrap();
    notes.create(&db, values! { "body" => "hello" }).await.unwrap();
    assert_eq!(notes.count(&db).await.unwrap(), 1);
}

// ── Filtering ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_contains_escapes_wildcards() {
    let (registry, db) = setup().await;
    let products = registry.objects("Product").unwrap();
    for name in ["100%-Cotton", "Cotton-100%-Egyptian", "Cotton-100%", "T-Shirt"] {
        products.create(&db, values! { "name" => name }).await.unwrap();
    }

    let found = products.filter(Q::kw("name__contains", "%")).all(&db).await.unwrap();
    assert_eq!(found.len(), 3);

    let underscore = products.filter(Q::kw("name__contains", "_")).count(&db, true).await.unwrap();
    assert_eq!(underscore, 0);
}

#[tokio::test]
async fn test_filter_across_foreign_key() {
    let (registry, db) = setup().await;
    seed_books(&registry, &db).await;
    let books = registry.objects("Book").unwrap();

    let found = books
        .filter(Q::kw("author__name__istartswith", "heming") & Q::kw("year__lt", 1930))
        .all(&db)
        .await
        .unwrap();
    assert_eq!(titles(&found), vec!["The Sun Also Rises", "A Farewell to Arms"]);

    let none = books.filter(Q::kw("author__name", "Tolstoy")).exists(&db).await.unwrap();
    assert!(!none);
}

#[tokio::test]
async fn test_or_and_not_trees() {
    let (registry, db) = setup().await;
    seed_books(&registry, &db).await;
    let books = registry.objects("Book").unwrap();

    let q = Q::kw("year", 1952) | Q::kw("title__endswith", "Arms");
    assert_eq!(books.filter(q).count(&db, true).await.unwrap(), 2);

    let excluded = books.exclude(Q::kw("year__gte", 1929)).all(&db).await.unwrap();
    assert_eq!(titles(&excluded), vec!["The Sun Also Rises"]);

    let negated = books.filter(!Q::kw("year__in", [1926, 1929])).all(&db).await.unwrap();
    assert_eq!(titles(&negated), vec!["The Old Man and the Sea"]);
}

#[tokio::test]
async fn test_reverse_filter_returns_each_parent_once() {
    let (registry, db) = setup().await;
    seed_books(&registry, &db).await;
    let authors = registry.objects("Author").unwrap();

    let found = authors.filter(Q::kw("books__year__gt", 1900)).all(&db).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(authors.filter(Q::kw("books__year__gt", 1960)).count(&db, true).await.unwrap(), 0);
}

// ── Ordering and windows ──────────────────────────────────────────────

#[tokio::test]
async fn test_pagination_pages_are_disjoint_and_ordered() {
    let (registry, db) = setup().await;
    let products = registry.objects("Product").unwrap();
    for i in 0..20 {
        products.create(&db, values! { "name" => i.to_string() }).await.unwrap();
    }

    let names = |items: Vec<Instance>| -> Vec<String> {
        items
            .iter()
            .map(|p| p.get("name").unwrap().as_str().unwrap().to_string())
            .collect()
    };
    let page1 = products.all().paginate(1, 5).unwrap().all(&db).await.unwrap();
    let page2 = products.all().paginate(2, 5).unwrap().all(&db).await.unwrap();
    assert_eq!(names(page1), vec!["0", "1", "2", "3", "4"]);
    assert_eq!(names(page2), vec!["5", "6", "7", "8", "9"]);

    assert!(products.all().paginate(0, 5).is_err());
}

#[tokio::test]
async fn test_order_by_first_last_and_slices() {
    let (registry, db) = setup().await;
    seed_books(&registry, &db).await;
    let books = registry.objects("Book").unwrap();

    let newest = books.all().order_by(&["-year"]).first(&db).await.unwrap().unwrap();
    assert_eq!(newest.get("year").unwrap(), Value::Int(1952));

    let oldest = books.all().order_by(&["-year"]).last(&db).await.unwrap().unwrap();
    assert_eq!(oldest.get("year").unwrap(), Value::Int(1926));

    let middle = books.all().order_by(&["year"]).slice(1, 2).unwrap().all(&db).await.unwrap();
    assert_eq!(titles(&middle), vec!["A Farewell to Arms"]);

    assert!(matches!(books.all().subscript(-1_i64), Err(RelataError::Value(_))));
}

#[tokio::test]
async fn test_iterate_streams_every_row() {
    let settings = Settings {
        iterate_chunk_size: 2,
        ..Settings::default()
    };
    let registry = ModelRegistryBuilder::new(&settings)
        .register(
            ModelDefinition::new("Product")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("name", 100)),
        )
        .build()
        .unwrap();
    let db = TestDatabase::new().unwrap();
    db.create_tables(&registry).await.unwrap();
    let products = registry.objects("Product").unwrap();
    for i in 0..5 {
        products.create(&db, values! { "name" => format!("p{i}") }).await.unwrap();
    }

    db.reset_query_count();
    let streamed: Vec<Instance> = products.all().iterate(&db).unwrap().try_collect().await.unwrap();
    assert_eq!(streamed.len(), 5);
    // Chunks of 2, 2, 1: the short chunk ends the stream.
    assert_eq!(db.query_count(), 3);

    let prefetching = products.all().prefetch_related(&["nothing"]);
    assert!(matches!(prefetching.iterate(&db), Err(RelataError::QueryDefinition(_))));
}

// ── Terminals ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_cardinality_errors() {
    let (registry, db) = setup().await;
    seed_books(&registry, &db).await;
    let books = registry.objects("Book").unwrap();

    let missing = books.get(&db, Q::kw("title", "Ulysses")).await;
    assert!(matches!(missing, Err(RelataError::NoMatch(_))));

    let several = books.get(&db, Q::kw("title__startswith", "The")).await;
    assert!(matches!(several, Err(RelataError::MultipleMatches(_))));

    let one = books.get(&db, Q::kw("year", 1929)).await.unwrap();
    assert_eq!(one.get("title").unwrap(), Value::from("A Farewell to Arms"));
    assert!(books.filter(Q::kw("year", 1)).get_or_none(&db).await.unwrap().is_none());
}

#[tokio::test]
async fn test_aggregates_and_type_guard() {
    let (registry, db) = setup().await;
    let books = registry.objects("Book").unwrap();
    for (title, year) in [("We", 1920), ("Brave New World", 1930), ("The Prophet", 1923)] {
        books.create(&db, values! { "title" => title, "year" => year }).await.unwrap();
    }

    let total = books.all().sum(&db, &["year"]).await.unwrap();
    assert_eq!(total.as_scalar(), Some(&Value::Int(5773)));

    let bad = books.all().sum(&db, &["title"]).await;
    assert!(matches!(bad, Err(RelataError::QueryDefinition(_))));

    let bounds = books.all().min(&db, &["year", "title"]).await.unwrap();
    assert_eq!(bounds.get("year"), Some(&Value::Int(1920)));
    assert_eq!(bounds.get("title"), Some(&Value::from("Brave New World")));
}

#[tokio::test]
async fn test_values_returns_raw_rows() {
    let (registry, db) = setup().await;
    seed_books(&registry, &db).await;
    let rows = registry
        .objects("Book")
        .unwrap()
        .all()
        .order_by(&["year"])
        .values(&db, &["title", "author__name"])
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].get::<String>("title").unwrap(), "The Sun Also Rises");
    assert_eq!(rows[0].get::<String>("author__name").unwrap(), "Hemingway");
}

#[tokio::test]
async fn test_none_and_empty_window_skip_the_database() {
    let (registry, db) = setup().await;
    let books = registry.objects("Book").unwrap();
    db.reset_query_count();
    assert!(books.none().all(&db).await.unwrap().is_empty());
    assert_eq!(books.all().limit(0).count(&db, true).await.unwrap(), 0);
    assert_eq!(db.query_count(), 0);
}

// ── Queryset mutation ─────────────────────────────────────────────────

#[tokio::test]
async fn test_unfiltered_update_is_guarded() {
    let (registry, db) = setup().await;
    seed_books(&registry, &db).await;
    let books = registry.objects("Book").unwrap();

    let refused = books.all().update(&db, values! { "genre" => "Historic" }, false).await;
    assert!(matches!(refused, Err(RelataError::QueryDefinition(_))));

    let changed = books.all().update(&db, values! { "genre" => "Historic" }, true).await.unwrap();
    assert_eq!(changed, 3);
    assert_eq!(books.filter(Q::kw("genre", "Historic")).count(&db, true).await.unwrap(), 3);

    let novellas = books.filter(Q::kw("year", 1952));
    let changed = novellas.update(&db, values! { "genre" => "Novella" }, false).await.unwrap();
    assert_eq!(changed, 1);
}

#[tokio::test]
async fn test_delete_through_related_filter() {
    let (registry, db) = setup().await;
    seed_books(&registry, &db).await;
    let books = registry.objects("Book").unwrap();

    assert!(books.all().delete(&db, false).await.is_err());
    let removed = books
        .filter(Q::kw("author__name", "Hemingway") & Q::kw("year__gt", 1927))
        .delete(&db, false)
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(books.count(&db).await.unwrap(), 1);
}

// ── Instance lifecycle ────────────────────────────────────────────────

#[tokio::test]
async fn test_dirty_state_transitions() {
    let (registry, db) = setup().await;
    let books = registry.objects("Book").unwrap();

    let book = books.instance(values! { "title" => "Dune", "year" => 1965 }).unwrap();
    assert!(!book.is_saved());
    assert_eq!(book.state(), InstanceState::Transient);

    book.save(&db).await.unwrap();
    assert!(book.is_saved());
    assert_eq!(book.pk(), Value::Int(1));
    assert_eq!(book.get("genre").unwrap(), Value::from("Fiction"));

    book.set("year", 1966).unwrap();
    assert!(!book.is_saved());
    assert_eq!(book.dirty_fields(), vec!["year".to_string()]);

    book.update(&db, values! {}).await.unwrap();
    assert!(book.is_saved());

    let reloaded = books.get(&db, Q::kw("id", 1)).await.unwrap();
    assert_eq!(reloaded.get("year").unwrap(), Value::Int(1966));

    book.delete(&db).await.unwrap();
    assert_eq!(book.state(), InstanceState::Deleted);
    assert_eq!(books.count(&db).await.unwrap(), 0);
    assert!(matches!(book.update(&db, values! {}).await, Err(RelataError::ModelPersistence(_))));
}

#[tokio::test]
async fn test_save_validates_before_sql() {
    let (registry, db) = setup().await;
    let books = registry.objects("Book").unwrap();
    let book = books.instance(values! { "title" => "Untitled" }).unwrap();

    db.reset_query_count();
    assert!(matches!(book.save(&db).await, Err(RelataError::Validation(_))));
    assert_eq!(db.query_count(), 0);

    assert!(matches!(
        books.instance(values! { "nope" => 1 }),
        Err(RelataError::Model(_))
    ));
}

#[tokio::test]
async fn test_unsaved_related_instance_blocks_save() {
    let (registry, db) = setup().await;
    let author = registry
        .objects("Author")
        .unwrap()
        .instance(values! { "name" => "Nobody" })
        .unwrap();
    let book = registry
        .objects("Book")
        .unwrap()
        .instance(values! { "title" => "Ghost", "year" => 2000, "author" => &author })
        .unwrap();
    assert!(matches!(book.save(&db).await, Err(RelataError::ModelPersistence(_))));
}

#[tokio::test]
async fn test_load_refreshes_columns() {
    let (registry, db) = setup().await;
    seed_books(&registry, &db).await;
    let books = registry.objects("Book").unwrap();
    let book = books.get(&db, Q::kw("year", 1926)).await.unwrap();

    books
        .filter(Q::kw("id", book.pk()))
        .update(&db, values! { "title" => "Fiesta" }, false)
        .await
        .unwrap();
    assert_eq!(book.get("title").unwrap(), Value::from("The Sun Also Rises"));

    book.load(&db).await.unwrap();
    assert_eq!(book.get("title").unwrap(), Value::from("Fiesta"));
    assert!(book.is_saved());
}

// ── Bulk operations ───────────────────────────────────────────────────

#[tokio::test]
async fn test_bulk_create_assigns_keys_in_order() {
    let (registry, db) = setup().await;
    let products = registry.objects("Product").unwrap();
    let items: Vec<Instance> = (0..5)
        .map(|i| products.instance(values! { "name" => format!("item-{i}") }).unwrap())
        .collect();

    db.reset_query_count();
    products
        .bulk_create(&db, &items, &BulkCreateOptions { batch_size: Some(2) })
        .await
        .unwrap();
    assert_eq!(db.query_count(), 3);

    let keys: Vec<Value> = items.iter().map(Instance::pk).collect();
    assert_eq!(keys, (1..=5).map(Value::Int).collect::<Vec<_>>());
    assert!(items.iter().all(Instance::is_saved));

    let again = products.bulk_create(&db, &items[..1], &BulkCreateOptions::default()).await;
    assert!(matches!(again, Err(RelataError::ModelPersistence(_))));
}

#[tokio::test]
async fn test_bulk_update_writes_each_row() {
    let (registry, db) = setup().await;
    seed_books(&registry, &db).await;
    let books = registry.objects("Book").unwrap();
    let loaded = books.all().all(&db).await.unwrap();
    for (i, book) in loaded.iter().enumerate() {
        book.set("genre", format!("genre-{i}")).unwrap();
    }

    let changed = books
        .bulk_update(&db, &loaded, &["genre"], &BulkUpdateOptions::default())
        .await
        .unwrap();
    assert_eq!(changed, 3);

    let rows = books.all().values(&db, &["genre"]).await.unwrap();
    let genres: Vec<String> = rows.iter().map(|r| r.get("genre").unwrap()).collect();
    assert_eq!(genres, vec!["genre-0", "genre-1", "genre-2"]);
    assert!(books
        .bulk_update(&db, &loaded, &["id"], &BulkUpdateOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn test_bulk_update_rejects_unloaded_fields() {
    let (registry, db) = setup().await;
    seed_books(&registry, &db).await;
    let books = registry.objects("Book").unwrap();
    let before = books.all().values(&db, &["genre"]).await.unwrap();

    let partial = books.all().fields(&["id", "title"]).all(&db).await.unwrap();
    let result = books
        .bulk_update(&db, &partial, &["genre"], &BulkUpdateOptions::default())
        .await;
    assert!(matches!(result, Err(RelataError::ModelPersistence(_))));
    assert_eq!(books.all().values(&db, &["genre"]).await.unwrap(), before);

    for book in &partial {
        book.set("title", "Renamed").unwrap();
    }
    let changed = books
        .bulk_update(&db, &partial, &["title"], &BulkUpdateOptions::default())
        .await
        .unwrap();
    assert_eq!(changed, 3);
    assert_eq!(books.all().values(&db, &["genre"]).await.unwrap(), before);
}

#[tokio::test]
async fn test_get_or_create_and_update_or_create() {
    let (registry, db) = setup().await;
    let books = registry.objects("Book").unwrap();

    let (first, created) = books
        .get_or_create(&db, values! { "title" => "Emma" }, values! { "year" => 1815 })
        .await
        .unwrap();
    assert!(created);
    let (second, created) = books
        .get_or_create(&db, values! { "title" => "Emma" }, values! { "year" => 1900 })
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(first.pk(), second.pk());
    assert_eq!(second.get("year").unwrap(), Value::Int(1815));

    let (updated, created) = books
        .update_or_create(&db, values! { "title" => "Emma" }, values! { "year" => 1816 })
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(updated.get("year").unwrap(), Value::Int(1816));
    assert_eq!(books.count(&db).await.unwrap(), 1);
}

#[tokio::test]
async fn test_atomic_rolls_back_on_error() {
    let (registry, db) = setup().await;
    let products = registry.objects("Product").unwrap();

    let result: RelataResult<()> = atomic(&db, |txn| {
        let products = products.clone();
        async move {
            products.create(&*txn, values! { "name" => "kept?" }).await?;
            Err(RelataError::Database("boom".to_string()))
        }
    })
    .await;
    assert!(result.is_err());
    assert_eq!(products.count(&db).await.unwrap(), 0);
}
