//! Lifecycle signal payloads and receiver registration.
//!
//! Every model schema owns a [`SignalTable`](relata_signals::SignalTable) of
//! [`SignalArgs`]. The functions here connect one receiver to one or more
//! models by name:
//!
//! ```
//! use relata_core::Settings;
//! use relata_db::fields::FieldDef;
//! use relata_db::schema::{ModelDefinition, ModelRegistryBuilder};
//! use relata_db::signals;
//!
//! let registry = ModelRegistryBuilder::new(&Settings::default())
//!     .register(ModelDefinition::new("Book").field(FieldDef::integer("id").primary_key()))
//!     .build()
//!     .unwrap();
//!
//! signals::pre_save(&registry, &["Book"], "audit", |args| async move {
//!     tracing::info!(model = args.sender.name(), "saving");
//!     Ok(())
//! })
//! .unwrap();
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use relata_core::{RelataError, RelataResult};
use relata_signals::{receiver, SignalKind};

use crate::instance::Instance;
use crate::schema::{ModelRegistry, ModelSchema};

/// The keyword set passed to every receiver.
///
/// Fields that do not apply to an event are empty. `context` carries
/// event-specific extras such as the updated field names.
#[derive(Debug, Clone)]
pub struct SignalArgs {
    /// The model emitting the event.
    pub sender: Arc<ModelSchema>,
    /// The instance the event is about.
    pub instance: Option<Instance>,
    /// All instances touched, for bulk events.
    pub instances: Vec<Instance>,
    /// Related instances, for relation add/remove events.
    pub related: Vec<Instance>,
    /// The relation name, for relation add/remove events.
    pub relation: Option<String>,
    /// Event-specific extras.
    pub context: HashMap<String, serde_json::Value>,
}

impl SignalArgs {
    /// Creates a payload for `sender` with nothing else set.
    pub fn new(sender: &Arc<ModelSchema>) -> Self {
        Self {
            sender: Arc::clone(sender),
            instance: None,
            instances: Vec::new(),
            related: Vec::new(),
            relation: None,
            context: HashMap::new(),
        }
    }

    /// Creates a payload about one instance.
    pub fn for_instance(instance: &Instance) -> Self {
        let mut args = Self::new(instance.schema());
        args.instance = Some(instance.clone());
        args
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Sends `args` on the sender's signal for `kind` and waits for every receiver.
pub(crate) async fn emit(kind: SignalKind, args: SignalArgs) -> RelataResult<()> {
    let sender = Arc::clone(&args.sender);
    tracing::trace!(model = sender.name(), signal = %kind, "emit");
    sender.signals().send(&kind, args).await
}

fn senders(registry: &ModelRegistry, models: &[&str]) -> RelataResult<Vec<Arc<ModelSchema>>> {
    if models.is_empty() {
        return Err(RelataError::SignalDefinition(
            "a receiver must be connected to at least one model".to_string(),
        ));
    }
    models
        .iter()
        .map(|name| {
            registry.get(name).map_err(|_| {
                RelataError::SignalDefinition(format!("cannot connect to unknown model '{name}'"))
            })
        })
        .collect()
}

/// Connects `f` to the `kind` signal of every model in `models`.
///
/// Connecting again under the same `dispatch_uid` replaces the receiver.
pub fn connect<F, Fut>(
    registry: &ModelRegistry,
    models: &[&str],
    kind: SignalKind,
    dispatch_uid: &str,
    f: F,
) -> RelataResult<()>
where
    F: Fn(SignalArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RelataResult<()>> + Send + 'static,
{
    let schemas = senders(registry, models)?;
    let shared = receiver(f);
    for schema in schemas {
        schema.signals().signal(&kind).connect(dispatch_uid, Arc::clone(&shared))?;
    }
    Ok(())
}

/// Disconnects `dispatch_uid` from the `kind` signal of every model in
/// `models`. Returns `true` if any receiver was removed.
pub fn disconnect(registry: &ModelRegistry, models: &[&str], kind: &SignalKind, dispatch_uid: &str) -> RelataResult<bool> {
    let mut removed = false;
    for schema in senders(registry, models)? {
        removed |= schema.signals().disconnect(kind, dispatch_uid);
    }
    Ok(removed)
}

/// Sends a custom event on `model`.
pub async fn send_custom(registry: &ModelRegistry, model: &str, name: &str, args: SignalArgs) -> RelataResult<()> {
    let kind = SignalKind::custom(name)?;
    let schema = registry.get(model)?;
    if schema.name() != args.sender.name() {
        return Err(RelataError::SignalDefinition(format!(
            "payload sender {} does not match model {model}",
            args.sender.name()
        )));
    }
    emit(kind, args).await
}

macro_rules! registration_fns {
    ($($(#[$doc:meta])* $name:ident => $kind:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name<F, Fut>(
                registry: &ModelRegistry,
                models: &[&str],
                dispatch_uid: &str,
                f: F,
            ) -> RelataResult<()>
            where
                F: Fn(SignalArgs) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = RelataResult<()>> + Send + 'static,
            {
                connect(registry, models, SignalKind::$kind, dispatch_uid, f)
            }
        )*
    };
}

registration_fns! {
    /// Runs before an instance is inserted.
    pre_save => PreSave,
    /// Runs after an instance is inserted.
    post_save => PostSave,
    /// Runs before an instance is updated; field changes made here are saved.
    pre_update => PreUpdate,
    /// Runs after an instance is updated.
    post_update => PostUpdate,
    /// Runs before an instance is deleted.
    pre_delete => PreDelete,
    /// Runs after an instance is deleted.
    post_delete => PostDelete,
    /// Runs before rows join a to-many relation.
    pre_relation_add => PreRelationAdd,
    /// Runs after rows join a to-many relation.
    post_relation_add => PostRelationAdd,
    /// Runs before rows leave a to-many relation.
    pre_relation_remove => PreRelationRemove,
    /// Runs after rows leave a to-many relation.
    post_relation_remove => PostRelationRemove,
    /// Runs once per bulk update with every updated instance.
    bulk_post_update => BulkPostUpdate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldDef;
    use crate::schema::{ModelDefinition, ModelRegistryBuilder};
    use relata_core::Settings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> Arc<ModelRegistry> {
        ModelRegistryBuilder::new(&Settings::default())
            .register(ModelDefinition::new("Album").field(FieldDef::integer("id").primary_key()))
            .register(ModelDefinition::new("Track").field(FieldDef::integer("id").primary_key()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_to_several_models() {
        let registry = registry();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        post_save(&registry, &["Album", "Track"], "count", move |_args| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        for model in ["Album", "Track"] {
            let schema = registry.get(model).unwrap();
            emit(SignalKind::PostSave, SignalArgs::new(&schema)).await.unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(disconnect(&registry, &["Album"], &SignalKind::PostSave, "count").unwrap());
        assert_eq!(registry.get("Album").unwrap().signals().receiver_count(&SignalKind::PostSave), 0);
        assert_eq!(registry.get("Track").unwrap().signals().receiver_count(&SignalKind::PostSave), 1);
    }

    #[test]
    fn test_registration_errors() {
        let registry = registry();
        let noop = |_args: SignalArgs| async { Ok(()) };
        assert!(matches!(
            pre_save(&registry, &["Nope"], "x", noop),
            Err(RelataError::SignalDefinition(_))
        ));
        assert!(matches!(
            pre_save(&registry, &[], "x", noop),
            Err(RelataError::SignalDefinition(_))
        ));
        assert!(matches!(
            pre_save(&registry, &["Album"], "", noop),
            Err(RelataError::SignalDefinition(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_signal() {
        let registry = registry();
        let schema = registry.get("Album").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        connect(&registry, &["Album"], SignalKind::custom("published").unwrap(), "p", move |args| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(args.context["edition"], 2);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        send_custom(&registry, "Album", "published", SignalArgs::new(&schema).with("edition", 2))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(send_custom(&registry, "Album", "post_save", SignalArgs::new(&schema)).await.is_err());
    }
}
