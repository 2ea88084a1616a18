//! Small helpers for object finalizers.

use kube::ResourceExt;

/// Whether `obj` carries `finalizer`
pub fn has_finalizer<K: ResourceExt>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Add `finalizer` to `obj` if absent. Returns true when the object changed.
pub fn add_finalizer<K: ResourceExt>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.finalizers_mut().push(finalizer.to_string());
    true
}

/// Remove every occurrence of `finalizer` from `obj`, keeping the order of
/// the rest. Returns true when the object changed.
pub fn remove_finalizer<K: ResourceExt>(obj: &mut K, finalizer: &str) -> bool {
    let finalizers = obj.finalizers_mut();
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}
