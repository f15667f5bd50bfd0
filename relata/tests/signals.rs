//! Integration tests for lifecycle signals emitted by instance and relation
//! operations.

use std::sync::Arc;

use parking_lot::Mutex;
use relata::db::signals;
use relata::prelude::*;
use relata_test::TestDatabase;

fn shop() -> Arc<ModelRegistry> {
    ModelRegistryBuilder::new(&Settings::default())
        .register(
            ModelDefinition::new("Order")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("status", 20).default("new"))
                .many_to_many(ManyToMany::new("items", "Item")),
        )
        .register(
            ModelDefinition::new("Item")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("sku", 20)),
        )
        .register(
            ModelDefinition::new("Audit")
                .field(FieldDef::integer("id").primary_key().autoincrement())
                .field(FieldDef::string("action", 30)),
        )
        .build()
        .unwrap()
}

async fn setup() -> (Arc<ModelRegistry>, TestDatabase) {
    let registry = shop();
    let db = TestDatabase::new().unwrap();
    db.create_tables(&registry).await.unwrap();
    (registry, db)
}

fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    (Arc::clone(&log), log)
}

#[tokio::test]
async fn test_save_receivers_write_in_order() {
    let (registry, db) = setup().await;

    for (kind, action) in [(SignalKind::PreSave, "PRE_SAVE"), (SignalKind::PostSave, "POST_SAVE")] {
        let audit_db = db.clone();
        signals::connect(&registry, &["Order"], kind, action, move |_args| {
            let audit_db = audit_db.clone();
            async move {
                audit_db
                    .execute("INSERT INTO \"audits\" (\"action\") VALUES (?)", &[Value::from(action)])
                    .await?;
                Ok(())
            }
        })
        .unwrap();
    }

    registry.objects("Order").unwrap().create(&db, values! {}).await.unwrap();

    let rows = registry
        .objects("Audit")
        .unwrap()
        .all()
        .values(&db, &["action"])
        .await
        .unwrap();
    let actions: Vec<String> = rows.iter().map(|r| r.get("action").unwrap()).collect();
    assert_eq!(actions, vec!["PRE_SAVE", "POST_SAVE"]);
}

#[tokio::test]
async fn test_failing_pre_save_aborts_insert() {
    let (registry, db) = setup().await;
    signals::pre_save(&registry, &["Order"], "reject", |_args| async {
        Err(RelataError::Validation(relata::core::ValidationError::new("closed", "closed")))
    })
    .unwrap();

    let orders = registry.objects("Order").unwrap();
    let result = orders.create(&db, values! {}).await;
    assert!(matches!(result, Err(RelataError::Validation(_))));
    assert_eq!(orders.count(&db).await.unwrap(), 0);
}

#[tokio::test]
async fn test_pre_update_changes_are_saved() {
    let (registry, db) = setup().await;
    signals::pre_update(&registry, &["Order"], "stamp", |args| async move {
        if let Some(order) = args.instance {
            order.set("status", "touched")?;
        }
        Ok(())
    })
    .unwrap();

    let orders = registry.objects("Order").unwrap();
    let order = orders.create(&db, values! {}).await.unwrap();
    assert_eq!(order.get("status").unwrap(), Value::from("new"));

    order.update(&db, values! {}).await.unwrap();
    let reloaded = orders.get(&db, Q::kw("id", order.pk())).await.unwrap();
    assert_eq!(reloaded.get("status").unwrap(), Value::from("touched"));
}

#[tokio::test]
async fn test_delete_signals_see_the_instance() {
    let (registry, db) = setup().await;
    let (log, seen) = recorder();
    for (uid, kind) in [("pre", SignalKind::PreDelete), ("post", SignalKind::PostDelete)] {
        let log = Arc::clone(&log);
        signals::connect(&registry, &["Order"], kind.clone(), uid, move |args| {
            let log = Arc::clone(&log);
            let kind = kind.clone();
            async move {
                let pk = args.instance.map(|i| i.pk()).unwrap_or(Value::Null);
                log.lock().push(format!("{kind}:{pk}"));
                Ok(())
            }
        })
        .unwrap();
    }

    let order = registry.objects("Order").unwrap().create(&db, values! {}).await.unwrap();
    order.delete(&db).await.unwrap();
    assert_eq!(*seen.lock(), vec!["pre_delete:1".to_string(), "post_delete:1".to_string()]);
}

#[tokio::test]
async fn test_relation_signals_carry_members() {
    let (registry, db) = setup().await;
    let (log, seen) = recorder();
    for (uid, kind) in [
        ("add", SignalKind::PostRelationAdd),
        ("remove", SignalKind::PostRelationRemove),
    ] {
        let log = Arc::clone(&log);
        signals::connect(&registry, &["Order"], kind.clone(), uid, move |args| {
            let log = Arc::clone(&log);
            let kind = kind.clone();
            async move {
                let clear = args.context.get("clear").is_some();
                log.lock().push(format!(
                    "{kind}:{}:{}:{}",
                    args.relation.unwrap_or_default(),
                    args.related.len(),
                    clear
                ));
                Ok(())
            }
        })
        .unwrap();
    }

    let order = registry.objects("Order").unwrap().create(&db, values! {}).await.unwrap();
    let items = registry.objects("Item").unwrap();
    let a = items.create(&db, values! { "sku" => "A" }).await.unwrap();
    let b = items.create(&db, values! { "sku" => "B" }).await.unwrap();

    let basket = order.relation("items").unwrap();
    basket.add(&db, &[a.clone(), b]).await.unwrap();
    basket.remove(&db, &[a]).await.unwrap();
    basket.clear(&db).await.unwrap();

    assert_eq!(
        *seen.lock(),
        vec![
            "post_relation_add:items:2:false".to_string(),
            "post_relation_remove:items:1:false".to_string(),
            "post_relation_remove:items:0:true".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_bulk_post_update_fires_once() {
    let (registry, db) = setup().await;
    let (log, seen) = recorder();
    signals::bulk_post_update(&registry, &["Item"], "bulk", move |args| {
        let log = Arc::clone(&log);
        async move {
            let operation = args.context.get("operation").and_then(|v| v.as_str()).unwrap_or("");
            log.lock().push(format!("{operation}:{}", args.instances.len()));
            Ok(())
        }
    })
    .unwrap();

    let items = registry.objects("Item").unwrap();
    let batch: Vec<Instance> = ["x", "y", "z"]
        .iter()
        .map(|sku| items.instance(values! { "sku" => *sku }).unwrap())
        .collect();
    items
        .bulk_create(&db, &batch, &BulkCreateOptions { batch_size: Some(1) })
        .await
        .unwrap();
    for item in &batch {
        item.set("sku", "w").unwrap();
    }
    items
        .bulk_update(&db, &batch, &["sku"], &BulkUpdateOptions::default())
        .await
        .unwrap();

    assert_eq!(*seen.lock(), vec!["create:3".to_string(), "update:3".to_string()]);
}

#[tokio::test]
async fn test_disconnected_receiver_is_silent() {
    let (registry, db) = setup().await;
    let (log, seen) = recorder();
    signals::post_save(&registry, &["Item"], "count", move |_args| {
        let log = Arc::clone(&log);
        async move {
            log.lock().push("saved".to_string());
            Ok(())
        }
    })
    .unwrap();

    let items = registry.objects("Item").unwrap();
    items.create(&db, values! { "sku" => "1" }).await.unwrap();
    assert!(signals::disconnect(&registry, &["Item"], &SignalKind::PostSave, "count").unwrap());
    items.create(&db, values! { "sku" => "2" }).await.unwrap();
    assert_eq!(seen.lock().len(), 1);
}
