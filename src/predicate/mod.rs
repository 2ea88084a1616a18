//! Boolean filters applied to watch events before they reach a handler.
//!
//! Predicates compose as logical AND: an event is forwarded only when every
//! predicate registered on the watch accepts it. All methods default to
//! accepting, so a predicate only overrides the event kinds it cares about.

use kube::Resource;

/// Filter over the four watch event kinds
pub trait Predicate<K>: Send + Sync {
    /// Whether a create event should be processed
    fn create(&self, _obj: &K) -> bool {
        true
    }

    /// Whether an update event should be processed
    fn update(&self, _old: &K, _new: &K) -> bool {
        true
    }

    /// Whether a delete event should be processed
    fn delete(&self, _obj: &K) -> bool {
        true
    }

    /// Whether a generic event should be processed
    fn generic(&self, _obj: &K) -> bool {
        true
    }
}

/// Predicate assembled from optional closures, one per event kind
pub struct PredicateFuncs<K> {
    /// Filter for create events
    pub create_fn: Option<Box<dyn Fn(&K) -> bool + Send + Sync>>,
    /// Filter for update events, receiving (old, new)
    pub update_fn: Option<Box<dyn Fn(&K, &K) -> bool + Send + Sync>>,
    /// Filter for delete events
    pub delete_fn: Option<Box<dyn Fn(&K) -> bool + Send + Sync>>,
    /// Filter for generic events
    pub generic_fn: Option<Box<dyn Fn(&K) -> bool + Send + Sync>>,
}

impl<K> Default for PredicateFuncs<K> {
    fn default() -> Self {
        Self {
            create_fn: None,
            update_fn: None,
            delete_fn: None,
            generic_fn: None,
        }
    }
}

impl<K> Predicate<K> for PredicateFuncs<K> {
    fn create(&self, obj: &K) -> bool {
        self.create_fn.as_ref().map_or(true, |f| f(obj))
    }

    fn update(&self, old: &K, new: &K) -> bool {
        self.update_fn.as_ref().map_or(true, |f| f(old, new))
    }

    fn delete(&self, obj: &K) -> bool {
        self.delete_fn.as_ref().map_or(true, |f| f(obj))
    }

    fn generic(&self, obj: &K) -> bool {
        self.generic_fn.as_ref().map_or(true, |f| f(obj))
    }
}

/// Accepts objects whose namespace matches one of the configured names.
///
/// `"*"` matches every namespace; comparison is case-insensitive.
pub struct NamespacePredicate {
    namespaces: Vec<String>,
}

impl NamespacePredicate {
    /// Build a predicate from the allowed namespaces
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
        }
    }

    fn matches(&self, namespace: &str) -> bool {
        self.namespaces
            .iter()
            .any(|ns| ns == "*" || ns.eq_ignore_ascii_case(namespace))
    }
}

impl<K: Resource> Predicate<K> for NamespacePredicate {
    fn create(&self, obj: &K) -> bool {
        self.matches(obj.meta().namespace.as_deref().unwrap_or_default())
    }

    fn update(&self, _old: &K, new: &K) -> bool {
        self.matches(new.meta().namespace.as_deref().unwrap_or_default())
    }

    fn delete(&self, obj: &K) -> bool {
        self.matches(obj.meta().namespace.as_deref().unwrap_or_default())
    }

    fn generic(&self, obj: &K) -> bool {
        self.matches(obj.meta().namespace.as_deref().unwrap_or_default())
    }
}

/// Accepts objects that carry every one of the configured label keys
pub struct LabelKeyPredicate {
    keys: Vec<String>,
}

impl LabelKeyPredicate {
    /// Build a predicate from the required label keys
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    fn matches<K: Resource>(&self, obj: &K) -> bool {
        let Some(labels) = obj.meta().labels.as_ref() else {
            return false;
        };
        if labels.is_empty() {
            return false;
        }
        self.keys.iter().all(|key| labels.contains_key(key))
    }
}

impl<K: Resource> Predicate<K> for LabelKeyPredicate {
    fn create(&self, obj: &K) -> bool {
        self.matches(obj)
    }

    fn update(&self, _old: &K, new: &K) -> bool {
        self.matches(new)
    }

    fn delete(&self, obj: &K) -> bool {
        self.matches(obj)
    }

    fn generic(&self, obj: &K) -> bool {
        self.matches(obj)
    }
}

/// Accepts updates only when `metadata.generation` changed.
///
/// Create, delete, and generic events pass through untouched.
#[derive(Default)]
pub struct GenerationChangedPredicate;

impl<K: Resource> Predicate<K> for GenerationChangedPredicate {
    fn update(&self, old: &K, new: &K) -> bool {
        old.meta().generation != new.meta().generation
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    use super::*;

    fn object(namespace: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("obj".to_string()),
                namespace: Some(namespace.to_string()),
                labels: if labels.is_empty() {
                    None
                } else {
                    Some(
                        labels
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    )
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn namespace_predicate_filters_by_namespace() {
        let pred = NamespacePredicate::new(["ns1"]);
        assert!(pred.create(&object("ns1", &[])));
        assert!(!pred.create(&object("ns2", &[])));

        // Case-insensitive match, wildcard accepts everything.
        assert!(pred.delete(&object("NS1", &[])));
        let wildcard = NamespacePredicate::new(["*"]);
        assert!(wildcard.create(&object("anything", &[])));
    }

    #[test]
    fn label_key_predicate_requires_every_key() {
        let pred = LabelKeyPredicate::new(["team"]);
        assert!(pred.create(&object("ns1", &[("team", "x")])));
        assert!(!pred.create(&object("ns1", &[])));
        assert!(!pred.create(&object("ns1", &[("owner", "x")])));

        let both = LabelKeyPredicate::new(["team", "owner"]);
        assert!(!both.create(&object("ns1", &[("team", "x")])));
        assert!(both.create(&object("ns1", &[("team", "x"), ("owner", "y")])));
    }

    #[test]
    fn composed_predicates_are_a_logical_and() {
        let ns = NamespacePredicate::new(["ns1", "*"]);
        let labels = LabelKeyPredicate::new(["team"]);
        let preds: Vec<&dyn Predicate<ConfigMap>> = vec![&ns, &labels];

        let pass = object("ns1", &[("team", "x")]);
        let wrong_ns = object("ns2", &[("team", "x")]);
        let no_label = object("ns1", &[]);

        assert!(preds.iter().all(|p| p.create(&pass)));
        // "*" is in the namespace list, so the namespace predicate accepts
        // ns2; the composition still hinges on the label predicate.
        assert!(preds.iter().all(|p| p.create(&wrong_ns)));
        assert!(!preds.iter().all(|p| p.create(&no_label)));

        let strict_ns = NamespacePredicate::new(["ns1"]);
        let strict: Vec<&dyn Predicate<ConfigMap>> = vec![&strict_ns, &labels];
        assert!(!strict.iter().all(|p| p.create(&wrong_ns)));
    }

    #[test]
    fn generation_predicate_passes_only_changed_generations() {
        let pred = GenerationChangedPredicate;
        let mut old = object("ns1", &[]);
        let mut new = object("ns1", &[]);
        old.metadata.generation = Some(1);
        new.metadata.generation = Some(1);
        assert!(!pred.update(&old, &new));

        new.metadata.generation = Some(2);
        assert!(pred.update(&old, &new));

        // Non-update events are untouched.
        assert!(pred.create(&new));
        assert!(pred.delete(&new));
    }

    #[test]
    fn predicate_funcs_default_to_accepting() {
        let funcs = PredicateFuncs::<ConfigMap>::default();
        let obj = object("ns1", &[]);
        assert!(funcs.create(&obj));
        assert!(funcs.update(&obj, &obj));
        assert!(funcs.delete(&obj));
        assert!(funcs.generic(&obj));

        let only_names = PredicateFuncs::<ConfigMap> {
            create_fn: Some(Box::new(|obj: &ConfigMap| {
                obj.metadata.name.as_deref() == Some("wanted")
            })),
            ..Default::default()
        };
        assert!(!only_names.create(&obj));
        assert!(only_names.update(&obj, &obj));
    }
}
