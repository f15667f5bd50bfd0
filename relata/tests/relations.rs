//! Integration tests for relation loading and relation managers.

use std::sync::Arc;

use relata::prelude::*;
use relata_test::{assert_num_queries, TestDatabase};

fn club() -> Arc<ModelRegistry> {
    ModelRegistryBuilder::new(&Settings::default())
        .register(
            ModelDefinition::new("Team")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("name", 50)),
        )
        .register(
            ModelDefinition::new("Player")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("name", 50))
                .foreign_key(ForeignKey::new("team", "Team").related_name("players").nullable()),
        )
        .register(
            ModelDefinition::new("Coach")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("name", 50))
                .foreign_key(ForeignKey::new("team", "Team").related_name("coaches")),
        )
        .register(
            ModelDefinition::new("Student")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("name", 50))
                .many_to_many(ManyToMany::new("courses", "Course").related_name("students")),
        )
        .register(
            ModelDefinition::new("Course")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("title", 50)),
        )
        .build()
        .unwrap()
}

async fn setup() -> (Arc<ModelRegistry>, TestDatabase) {
    let registry = club();
    let db = TestDatabase::new().unwrap();
    db.create_tables(&registry).await.unwrap();
    (registry, db)
}

fn names(items: &[Instance], field: &str) -> Vec<String> {
    let mut out: Vec<String> = items
        .iter()
        .map(|i| i.get(field).unwrap().as_str().unwrap().to_string())
        .collect();
    out.sort();
    out
}

async fn team_with_players(registry: &Arc<ModelRegistry>, db: &TestDatabase) -> Instance {
    let team = registry
        .objects("Team")
        .unwrap()
        .create(db, values! { "name" => "Rovers" })
        .await
        .unwrap();
    let players = registry.objects("Player").unwrap();
    for name in ["Ann", "Bo", "Cy"] {
        players
            .create(db, values! { "name" => name, "team" => &team })
            .await
            .unwrap();
    }
    team
}

// ── Loading ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_select_related_to_many_deduplicates_parents() {
    let (registry, db) = setup().await;
    team_with_players(&registry, &db).await;

    let teams = registry
        .objects("Team")
        .unwrap()
        .all()
        .select_related(&["players"])
        .all(&db)
        .await
        .unwrap();
    assert_eq!(teams.len(), 1);
    assert_eq!(teams[0].related_many("players").unwrap().len(), 3);
    assert_eq!(names(&teams[0].related_many("players").unwrap(), "name"), vec!["Ann", "Bo", "Cy"]);
}

#[tokio::test]
async fn test_select_related_foreign_key_in_one_query() {
    let (registry, db) = setup().await;
    team_with_players(&registry, &db).await;
    let players = registry.objects("Player").unwrap();

    assert_num_queries(&db, 1, || async {
        let loaded = players.all().select_related(&["team"]).all(&db).await.unwrap();
        assert_eq!(loaded.len(), 3);
        for player in &loaded {
            let team = player.related("team").unwrap().unwrap();
            assert_eq!(team.get("name").unwrap(), Value::from("Rovers"));
            assert!(team.is_loaded());
        }
    })
    .await;
}

#[tokio::test]
async fn test_unloaded_foreign_key_is_a_placeholder() {
    let (registry, db) = setup().await;
    let team = team_with_players(&registry, &db).await;

    let player = registry.objects("Player").unwrap().all().first(&db).await.unwrap().unwrap();
    let placeholder = player.related("team").unwrap().unwrap();
    assert_eq!(placeholder.pk(), team.pk());
    assert!(!placeholder.is_loaded());

    placeholder.load(&db).await.unwrap();
    assert!(placeholder.is_loaded());
    assert_eq!(placeholder.get("name").unwrap(), Value::from("Rovers"));
}

#[tokio::test]
async fn test_prefetch_related_uses_one_query_per_level() {
    let (registry, db) = setup().await;
    team_with_players(&registry, &db).await;
    let teams = registry.objects("Team").unwrap();
    teams.create(&db, values! { "name" => "Empty" }).await.unwrap();

    assert_num_queries(&db, 2, || async {
        let loaded = teams
            .all()
            .order_by(&["name"])
            .prefetch_related(&["players"])
            .all(&db)
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].related_many("players").unwrap().is_empty());
        assert!(loaded[0].is_relation_loaded("players"));
        assert_eq!(loaded[1].related_many("players").unwrap().len(), 3);
    })
    .await;
}

#[tokio::test]
async fn test_prefetch_many_to_many() {
    let (registry, db) = setup().await;
    let student = registry
        .objects("Student")
        .unwrap()
        .create(&db, values! { "name" => "Dee" })
        .await
        .unwrap();
    let courses = registry.objects("Course").unwrap();
    let algebra = courses.create(&db, values! { "title" => "Algebra" }).await.unwrap();
    let botany = courses.create(&db, values! { "title" => "Botany" }).await.unwrap();
    student.relation("courses").unwrap().add(&db, &[algebra, botany]).await.unwrap();

    let loaded = registry
        .objects("Student")
        .unwrap()
        .all()
        .prefetch_related(&["courses"])
        .get(&db)
        .await
        .unwrap();
    assert_eq!(names(&loaded.related_many("courses").unwrap(), "title"), vec!["Algebra", "Botany"]);

    let reverse = courses
        .filter(Q::kw("students__name", "Dee"))
        .order_by(&["title"])
        .all(&db)
        .await
        .unwrap();
    assert_eq!(reverse.len(), 2);
}

fn in_order(items: &[Instance], field: &str) -> Vec<String> {
    items
        .iter()
        .map(|i| i.get(field).unwrap().as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_order_by_loaded_collection_field() {
    let (registry, db) = setup().await;
    team_with_players(&registry, &db).await;
    let teams = registry.objects("Team").unwrap();

    let prefetched = teams
        .all()
        .order_by(&["-players__name"])
        .prefetch_related(&["players"])
        .get(&db)
        .await
        .unwrap();
    assert_eq!(in_order(&prefetched.related_many("players").unwrap(), "name"), vec!["Cy", "Bo", "Ann"]);

    let joined = teams
        .all()
        .order_by(&["-players__name"])
        .select_related(&["players"])
        .get(&db)
        .await
        .unwrap();
    assert_eq!(in_order(&joined.related_many("players").unwrap(), "name"), vec!["Cy", "Bo", "Ann"]);

    let unloaded = teams.all().order_by(&["players__name"]).all(&db).await;
    assert!(matches!(unloaded, Err(RelataError::QueryDefinition(_))));
}

async fn staff() -> (Arc<ModelRegistry>, TestDatabase) {
    let registry = ModelRegistryBuilder::new(&Settings::default())
        .register(
            ModelDefinition::new("Employee")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("name", 50))
                .foreign_key(ForeignKey::new("manager", "Employee").related_name("reports").nullable()),
        )
        .build()
        .unwrap();
    let db = TestDatabase::new().unwrap();
    db.create_tables(&registry).await.unwrap();

    let employees = registry.objects("Employee").unwrap();
    let boss = employees.create(&db, values! { "name" => "Boss" }).await.unwrap();
    for name in ["Ann", "Bo"] {
        employees
            .create(&db, values! { "name" => name, "manager" => &boss })
            .await
            .unwrap();
    }
    (registry, db)
}

#[tokio::test]
async fn test_select_related_self_reference_keeps_every_root() {
    let (registry, db) = staff().await;
    let employees = registry.objects("Employee").unwrap();

    let newest_first = employees
        .all()
        .order_by(&["-id"])
        .select_related(&["manager"])
        .all(&db)
        .await
        .unwrap();
    assert_eq!(in_order(&newest_first, "name"), vec!["Bo", "Ann", "Boss"]);
    let boss = newest_first[0].related("manager").unwrap().unwrap();
    assert_eq!(boss, newest_first[2]);

    let with_reports = employees
        .all()
        .order_by(&["id"])
        .select_related(&["reports"])
        .all(&db)
        .await
        .unwrap();
    assert_eq!(in_order(&with_reports, "name"), vec!["Boss", "Ann", "Bo"]);
    assert_eq!(with_reports[0].related_many("reports").unwrap().len(), 2);
    assert!(with_reports[1].related_many("reports").unwrap().is_empty());
}

// ── Relation managers ─────────────────────────────────────────────────

#[tokio::test]
async fn test_reverse_add_and_remove() {
    let (registry, db) = setup().await;
    let team = team_with_players(&registry, &db).await;
    let players = registry.objects("Player").unwrap();
    let free_agent = players.create(&db, values! { "name" => "Dot" }).await.unwrap();

    let roster = team.relation("players").unwrap();
    roster.add(&db, &[free_agent.clone()]).await.unwrap();
    assert_eq!(free_agent.related("team").unwrap().unwrap().pk(), team.pk());
    assert_eq!(roster.all(&db).await.unwrap().len(), 4);

    roster.remove(&db, &[free_agent.clone()]).await.unwrap();
    assert_eq!(free_agent.get("team").unwrap(), Value::Null);
    let unattached = players.filter(Q::kw("team__isnull", true)).count(&db, true).await.unwrap();
    assert_eq!(unattached, 1);
}

#[tokio::test]
async fn test_reverse_add_moves_child_between_loaded_owners() {
    let (registry, db) = setup().await;
    team_with_players(&registry, &db).await;
    let teams = registry.objects("Team").unwrap();
    teams.create(&db, values! { "name" => "United" }).await.unwrap();

    let loaded = teams
        .all()
        .order_by(&["name"])
        .prefetch_related(&["players"])
        .all(&db)
        .await
        .unwrap();
    let (rovers, united) = (&loaded[0], &loaded[1]);
    let moving = rovers.related_many("players").unwrap().remove(0);

    united.relation("players").unwrap().add(&db, &[moving.clone()]).await.unwrap();
    assert_eq!(rovers.related_many("players").unwrap().len(), 2);
    assert!(!rovers.related_many("players").unwrap().contains(&moving));
    assert_eq!(united.related_many("players").unwrap(), vec![moving.clone()]);
    assert_eq!(moving.related("team").unwrap().as_ref(), Some(united));
    assert_eq!(rovers.relation("players").unwrap().all(&db).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_reverse_clear_updates_loaded_collection() {
    let (registry, db) = setup().await;
    team_with_players(&registry, &db).await;

    let team = registry
        .objects("Team")
        .unwrap()
        .all()
        .prefetch_related(&["players"])
        .get(&db)
        .await
        .unwrap();
    assert_eq!(team.related_many("players").unwrap().len(), 3);

    team.relation("players").unwrap().clear(&db).await.unwrap();
    assert!(team.related_many("players").unwrap().is_empty());
    assert!(team.is_saved());
    assert_eq!(team.relation("players").unwrap().all(&db).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_non_nullable_reverse_remove_fails() {
    let (registry, db) = setup().await;
    let team = team_with_players(&registry, &db).await;
    let coach = registry
        .objects("Coach")
        .unwrap()
        .create(&db, values! { "name" => "Eve", "team" => &team })
        .await
        .unwrap();

    let staff = team.relation("coaches").unwrap();
    let result = staff.remove(&db, &[coach]).await;
    assert!(matches!(result, Err(RelataError::RelationshipInstance(_))));
    assert!(matches!(staff.clear(&db).await, Err(RelataError::RelationshipInstance(_))));
}

#[tokio::test]
async fn test_many_to_many_add_is_idempotent() {
    let (registry, db) = setup().await;
    let student = registry
        .objects("Student")
        .unwrap()
        .create(&db, values! { "name" => "Fay" })
        .await
        .unwrap();
    let course = registry
        .objects("Course")
        .unwrap()
        .create(&db, values! { "title" => "Chemistry" })
        .await
        .unwrap();

    let enrolled = student.relation("courses").unwrap();
    enrolled.add(&db, &[course.clone()]).await.unwrap();
    enrolled.add(&db, &[course.clone()]).await.unwrap();
    assert_eq!(enrolled.all(&db).await.unwrap().len(), 1);

    let roster = course.relation("students").unwrap().all(&db).await.unwrap();
    assert_eq!(names(&roster, "name"), vec!["Fay"]);

    enrolled.remove(&db, &[course.clone()]).await.unwrap();
    assert!(enrolled.all(&db).await.unwrap().is_empty());

    enrolled.add(&db, &[course]).await.unwrap();
    enrolled.clear(&db).await.unwrap();
    assert!(enrolled.all(&db).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_relation_manager_errors() {
    let (registry, db) = setup().await;
    let team = registry
        .objects("Team")
        .unwrap()
        .instance(values! { "name" => "Unsaved" })
        .unwrap();
    let player = registry
        .objects("Player")
        .unwrap()
        .create(&db, values! { "name" => "Gus" })
        .await
        .unwrap();

    assert!(matches!(team.relation("nope"), Err(RelataError::Model(_))));
    assert!(matches!(player.relation("team"), Err(RelataError::RelationshipInstance(_))));
    let unsaved_add = team.relation("players").unwrap().add(&db, &[player]).await;
    assert!(matches!(unsaved_add, Err(RelataError::RelationshipInstance(_))));
}

#[tokio::test]
async fn test_delete_clears_holders() {
    let (registry, db) = setup().await;
    team_with_players(&registry, &db).await;
    let team = registry
        .objects("Team")
        .unwrap()
        .all()
        .prefetch_related(&["players"])
        .get(&db)
        .await
        .unwrap();
    let first = team.related_many("players").unwrap().remove(0);

    first.delete(&db).await.unwrap();
    assert_eq!(team.related_many("players").unwrap().len(), 2);
}
