//! Cluster descriptors and the sources that produce the desired fleet.
//!
//! A [`ConfigurationSource`] answers one question: which clusters should be
//! live right now, and how do we reach them. The fleet supervisor polls the
//! source and reconciles its client map against the answer. Three reference
//! sources are provided: ConfigMaps carrying kubeconfigs, a directory of
//! kubeconfig files, and a cluster-gateway custom resource.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ApiResource, DynamicObject, ListParams};
use kube::core::GroupVersionKind;
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::{Error, Result};

/// ConfigMap key holding the kubeconfig payload by default
pub const DEFAULT_DATA_KEY: &str = "kubeconfig.yaml";

/// ConfigMap key gating inclusion by default
pub const DEFAULT_STATUS_KEY: &str = "status";

const LIST_TIMEOUT: Duration = Duration::from_secs(5);

const GATEWAY_GROUP: &str = "cluster.core.oam.dev";
const GATEWAY_VERSION: &str = "v1alpha1";
const GATEWAY_KIND: &str = "ClusterGateway";
const GATEWAY_PLURAL: &str = "clustergateways";

/// Where a cluster's kubeconfig comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubeconfigSource {
    /// Kubeconfig YAML carried inline
    Raw(String),
    /// Path to a kubeconfig file; an empty path resolves through the
    /// standard inference chain (environment, `~/.kube/config`, in-cluster)
    File(PathBuf),
    /// The service-account configuration of the pod we run in
    InCluster,
}

/// Immutable identity of a target cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescriptor {
    /// Unique name within one fleet supervisor
    pub name: String,
    /// Kubeconfig source
    pub source: KubeconfigSource,
    /// Optional named context within the kubeconfig
    pub context: Option<String>,
}

impl ClusterDescriptor {
    /// Descriptor with no context override
    pub fn new(name: impl Into<String>, source: KubeconfigSource) -> Self {
        Self {
            name: name.into(),
            source,
            context: None,
        }
    }

    /// Set the kubeconfig context to use
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Descriptor resolving through the standard local inference chain
    pub fn default_local(name: impl Into<String>) -> Self {
        Self::new(name, KubeconfigSource::File(PathBuf::new()))
    }

    /// Whether two descriptors point at the same cluster configuration.
    ///
    /// The name is deliberately excluded: a descriptor whose source or
    /// context changed is a different cluster even under the same name.
    pub fn same_target(&self, other: &Self) -> bool {
        self.source == other.source && self.context == other.context
    }
}

/// Post-filter applied to the descriptors a source produced
pub type DescriptorFilter = Arc<dyn Fn(&ClusterDescriptor) -> bool + Send + Sync>;

/// Producer of the current desired set of cluster descriptors
#[async_trait]
pub trait ConfigurationSource: Send + Sync {
    /// The full desired set at this moment
    async fn get_all(&self) -> Result<Vec<ClusterDescriptor>>;
}

fn apply_filter(
    list: Vec<ClusterDescriptor>,
    filter: Option<&DescriptorFilter>,
) -> Vec<ClusterDescriptor> {
    match filter {
        Some(filter) => list.into_iter().filter(|d| filter(d)).collect(),
        None => list,
    }
}

/// Desired set from ConfigMaps in one namespace.
///
/// A ConfigMap is included iff `data[data_key]` is non-empty and
/// `data[status_key]` is absent or equals "true" case-insensitively. The
/// ConfigMap's name becomes the cluster name and the payload is carried as
/// a raw kubeconfig.
pub struct ConfigMapSource {
    client: kube::Client,
    namespace: String,
    labels: BTreeMap<String, String>,
    data_key: String,
    status_key: String,
    filter: Option<DescriptorFilter>,
}

impl ConfigMapSource {
    /// Source listing ConfigMaps in `namespace` with the default keys
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            data_key: DEFAULT_DATA_KEY.to_string(),
            status_key: DEFAULT_STATUS_KEY.to_string(),
            filter: None,
        }
    }

    /// Restrict the listing to ConfigMaps carrying these labels
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Override the data key holding the kubeconfig
    pub fn with_data_key(mut self, key: impl Into<String>) -> Self {
        self.data_key = key.into();
        self
    }

    /// Override the status key gating inclusion
    pub fn with_status_key(mut self, key: impl Into<String>) -> Self {
        self.status_key = key.into();
        self
    }

    /// Attach a post-filter
    pub fn with_filter(mut self, filter: DescriptorFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    fn selector(&self) -> String {
        self.labels
            .iter()
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[async_trait]
impl ConfigurationSource for ConfigMapSource {
    async fn get_all(&self) -> Result<Vec<ClusterDescriptor>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut params = ListParams::default();
        let selector = self.selector();
        if !selector.is_empty() {
            params = params.labels(&selector);
        }

        let list = tokio::time::timeout(LIST_TIMEOUT, api.list(&params))
            .await
            .map_err(|_| Error::Timeout {
                op: "list cluster configmaps",
                after: LIST_TIMEOUT,
            })?
            .map_err(|err| {
                Error::configuration(format!(
                    "list cluster configmaps in namespace {} with labels {:?} failed: {err}",
                    self.namespace, self.labels,
                ))
            })?;

        let list = list
            .items
            .into_iter()
            .filter_map(|cm| configmap_to_descriptor(cm, &self.data_key, &self.status_key))
            .collect();
        Ok(apply_filter(list, self.filter.as_ref()))
    }
}

fn configmap_to_descriptor(
    cm: ConfigMap,
    data_key: &str,
    status_key: &str,
) -> Option<ClusterDescriptor> {
    let name = cm.name_any();
    let data = cm.data.unwrap_or_default();
    let kubeconfig = data.get(data_key)?;
    if kubeconfig.is_empty() {
        return None;
    }
    // A missing status key means the cluster should connect; any value other
    // than "true" means it should not.
    if let Some(status) = data.get(status_key) {
        if !status.eq_ignore_ascii_case("true") {
            debug!(cluster = %name, status = %status, "skipping cluster configmap with disabled status");
            return None;
        }
    }
    Some(ClusterDescriptor::new(
        name,
        KubeconfigSource::Raw(kubeconfig.clone()),
    ))
}

/// Whether a directory source carries file paths or file contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
    /// Emit descriptors pointing at the file path
    FilePath,
    /// Read each file and emit its content as a raw kubeconfig
    RawContent,
}

/// Desired set from kubeconfig files in one directory
pub struct PathSource {
    dir: PathBuf,
    suffix: String,
    mode: PathMode,
    filter: Option<DescriptorFilter>,
}

impl std::fmt::Debug for PathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathSource")
            .field("dir", &self.dir)
            .field("suffix", &self.suffix)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl PathSource {
    /// Source over files in `dir` whose names end with `suffix`
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>, mode: PathMode) -> Result<Self> {
        let dir = dir.into();
        let meta = std::fs::metadata(&dir).map_err(|err| {
            Error::configuration(format!("{} does not exist: {err}", dir.display()))
        })?;
        if !meta.is_dir() {
            return Err(Error::configuration(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        Ok(Self {
            dir,
            suffix: suffix.into(),
            mode,
            filter: None,
        })
    }

    /// Attach a post-filter
    pub fn with_filter(mut self, filter: DescriptorFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[async_trait]
impl ConfigurationSource for PathSource {
    async fn get_all(&self) -> Result<Vec<ClusterDescriptor>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|err| {
            Error::configuration(format!("open {} failed: {err}", self.dir.display()))
        })?;

        let mut list = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !file_name.ends_with(&self.suffix) {
                continue;
            }
            let path = self.dir.join(&file_name);
            let source = match self.mode {
                PathMode::FilePath => KubeconfigSource::File(path),
                PathMode::RawContent => {
                    let content = std::fs::read_to_string(&path).map_err(|err| {
                        Error::configuration(format!("read {} failed: {err}", path.display()))
                    })?;
                    KubeconfigSource::Raw(content)
                }
            };
            list.push(ClusterDescriptor::new(file_name, source));
        }
        Ok(apply_filter(list, self.filter.as_ref()))
    }
}

/// Desired set from a cluster-gateway custom resource.
///
/// Every gateway object contributes one descriptor that reuses the base
/// descriptor's kubeconfig source and context under the gateway's name;
/// requests then travel through the gateway's proxy path.
pub struct GatewaySource {
    client: kube::Client,
    base: ClusterDescriptor,
    filter: Option<DescriptorFilter>,
}

impl GatewaySource {
    /// Source listing gateway objects through `client`
    pub fn new(client: kube::Client, base: ClusterDescriptor) -> Self {
        Self {
            client,
            base,
            filter: None,
        }
    }

    /// Attach a post-filter
    pub fn with_filter(mut self, filter: DescriptorFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[async_trait]
impl ConfigurationSource for GatewaySource {
    async fn get_all(&self) -> Result<Vec<ClusterDescriptor>> {
        let gvk = GroupVersionKind::gvk(GATEWAY_GROUP, GATEWAY_VERSION, GATEWAY_KIND);
        let resource = ApiResource::from_gvk_with_plural(&gvk, GATEWAY_PLURAL);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);

        let list = tokio::time::timeout(LIST_TIMEOUT, api.list(&ListParams::default()))
            .await
            .map_err(|_| Error::Timeout {
                op: "list cluster gateways",
                after: LIST_TIMEOUT,
            })??;

        let list = list
            .items
            .into_iter()
            .map(|gateway| ClusterDescriptor {
                name: gateway.name_any(),
                source: self.base.source.clone(),
                context: self.base.context.clone(),
            })
            .collect();
        Ok(apply_filter(list, self.filter.as_ref()))
    }
}

/// Closure-backed source, convenient for tests and embedders with bespoke
/// inventory systems
pub struct FnSource {
    get: Box<dyn Fn() -> Result<Vec<ClusterDescriptor>> + Send + Sync>,
}

impl FnSource {
    /// Wrap a closure producing the desired set
    pub fn new(get: impl Fn() -> Result<Vec<ClusterDescriptor>> + Send + Sync + 'static) -> Self {
        Self { get: Box::new(get) }
    }
}

#[async_trait]
impl ConfigurationSource for FnSource {
    async fn get_all(&self) -> Result<Vec<ClusterDescriptor>> {
        (self.get)()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn descriptor_target_equality_ignores_the_name() {
        let a = ClusterDescriptor::new("a", KubeconfigSource::Raw("cfg".into()));
        let renamed = ClusterDescriptor::new("b", KubeconfigSource::Raw("cfg".into()));
        assert!(a.same_target(&renamed));

        let other_payload = ClusterDescriptor::new("a", KubeconfigSource::Raw("other".into()));
        assert!(!a.same_target(&other_payload));

        let other_context = ClusterDescriptor::new("a", KubeconfigSource::Raw("cfg".into()))
            .with_context("admin");
        assert!(!a.same_target(&other_context));

        let other_kind =
            ClusterDescriptor::new("a", KubeconfigSource::File(PathBuf::from("cfg")));
        assert!(!a.same_target(&other_kind));
    }

    #[test]
    fn configmap_inclusion_rules() {
        use k8s_openapi::api::core::v1::ConfigMap;
        use kube::api::ObjectMeta;

        fn cm(name: &str, data: &[(&str, &str)]) -> ConfigMap {
            ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                data: Some(
                    data.iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            }
        }

        // data key present, no status key: included.
        let d = configmap_to_descriptor(cm("a", &[("kubeconfig.yaml", "cfg")]), "kubeconfig.yaml", "status");
        assert_eq!(d.unwrap().name, "a");

        // status true (any case): included.
        let d = configmap_to_descriptor(
            cm("b", &[("kubeconfig.yaml", "cfg"), ("status", "TRUE")]),
            "kubeconfig.yaml",
            "status",
        );
        assert!(d.is_some());

        // status not true: skipped.
        let d = configmap_to_descriptor(
            cm("c", &[("kubeconfig.yaml", "cfg"), ("status", "false")]),
            "kubeconfig.yaml",
            "status",
        );
        assert!(d.is_none());

        // missing or empty data key: skipped.
        assert!(configmap_to_descriptor(cm("d", &[("status", "true")]), "kubeconfig.yaml", "status").is_none());
        assert!(configmap_to_descriptor(cm("e", &[("kubeconfig.yaml", "")]), "kubeconfig.yaml", "status").is_none());
    }

    #[test]
    fn configmap_selector_joins_labels() {
        // Selector assembly is pure; exercised without a cluster.
        let labels: BTreeMap<String, String> = [
            ("owner".to_string(), "fleet".to_string()),
            ("tier".to_string(), "edge".to_string()),
            (String::new(), "dropped".to_string()),
        ]
        .into();
        let source = ConfigMapSource {
            client: unreachable_client(),
            namespace: "fleet-system".into(),
            labels,
            data_key: DEFAULT_DATA_KEY.into(),
            status_key: DEFAULT_STATUS_KEY.into(),
            filter: None,
        };
        assert_eq!(source.selector(), "owner=fleet,tier=edge");
    }

    // A client value for constructing sources in tests that never issue
    // requests.
    fn unreachable_client() -> kube::Client {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        kube::Client::try_from(config).unwrap()
    }

    #[tokio::test]
    async fn path_source_lists_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in [
            ("edge-1.yaml", "kubeconfig-one"),
            ("edge-2.yaml", "kubeconfig-two"),
            ("notes.txt", "not a kubeconfig"),
        ] {
            let mut f = std::fs::File::create(dir.path().join(name)).unwrap();
            f.write_all(content.as_bytes()).unwrap();
        }

        let source = PathSource::new(dir.path(), ".yaml", PathMode::RawContent).unwrap();
        let mut list = source.get_all().await.unwrap();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "edge-1.yaml");
        assert_eq!(list[0].source, KubeconfigSource::Raw("kubeconfig-one".into()));

        let source = PathSource::new(dir.path(), ".yaml", PathMode::FilePath).unwrap();
        let list = source.get_all().await.unwrap();
        assert!(list
            .iter()
            .all(|d| matches!(&d.source, KubeconfigSource::File(p) if p.starts_with(dir.path()))));
    }

    #[test]
    fn path_source_rejects_missing_or_non_directories() {
        assert!(PathSource::new("/definitely/not/here", ".yaml", PathMode::FilePath).is_err());

        let file = tempfile::NamedTempFile::new().unwrap();
        let err = PathSource::new(file.path(), ".yaml", PathMode::FilePath).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[tokio::test]
    async fn filters_drop_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.yaml"), "cfg").unwrap();
        std::fs::write(dir.path().join("drop.yaml"), "cfg").unwrap();

        let source = PathSource::new(dir.path(), ".yaml", PathMode::FilePath)
            .unwrap()
            .with_filter(Arc::new(|d| d.name.starts_with("keep")));
        let list = source.get_all().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "keep.yaml");
    }

    #[tokio::test]
    async fn fn_source_delegates() {
        let source = FnSource::new(|| {
            Ok(vec![ClusterDescriptor::default_local("meta")])
        });
        let list = source.get_all().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "meta");
    }
}
