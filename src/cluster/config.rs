//! Resolution of a [`ClusterDescriptor`] into a `kube::Config`.

use std::path::Path;
use std::sync::Arc;

use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::configuration::{ClusterDescriptor, KubeconfigSource};
use crate::{Error, Result};

/// Mutator applied to the resolved `kube::Config` before the client is built
pub type ConfigMutator = Arc<dyn Fn(&mut kube::Config) + Send + Sync>;

pub(crate) async fn build_kube_config(
    descriptor: &ClusterDescriptor,
    mutators: &[ConfigMutator],
) -> Result<kube::Config> {
    let options = KubeConfigOptions {
        context: descriptor.context.clone(),
        ..Default::default()
    };

    let mut config = match &descriptor.source {
        KubeconfigSource::Raw(yaml) => from_raw(yaml, &options).await?,
        KubeconfigSource::File(path) if path.as_os_str().is_empty() => {
            from_default_chain(&options).await?
        }
        KubeconfigSource::File(path) => from_file(path, &options).await?,
        KubeconfigSource::InCluster => kube::Config::incluster()
            .map_err(|err| Error::kubeconfig(format!("in-cluster config failed: {err}")))?,
    };

    for mutate in mutators {
        mutate(&mut config);
    }
    Ok(config)
}

async fn from_raw(yaml: &str, options: &KubeConfigOptions) -> Result<kube::Config> {
    if yaml.is_empty() {
        return Err(Error::kubeconfig("kubeconfig is empty"));
    }
    let kubeconfig = Kubeconfig::from_yaml(yaml)
        .map_err(|err| Error::kubeconfig(format!("failed to load kubeconfig: {err}")))?;
    kube::Config::from_custom_kubeconfig(kubeconfig, options)
        .await
        .map_err(|err| Error::kubeconfig(format!("failed to build client config: {err}")))
}

async fn from_file(path: &Path, options: &KubeConfigOptions) -> Result<kube::Config> {
    let meta = std::fs::metadata(path).map_err(|err| {
        Error::kubeconfig(format!("kubeconfig {} not readable: {err}", path.display()))
    })?;
    if meta.len() == 0 {
        return Err(Error::kubeconfig(format!(
            "kubeconfig {} is empty",
            path.display()
        )));
    }
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|err| Error::kubeconfig(format!("failed to load kubeconfig: {err}")))?;
    kube::Config::from_custom_kubeconfig(kubeconfig, options)
        .await
        .map_err(|err| Error::kubeconfig(format!("failed to build client config: {err}")))
}

/// Local kubeconfig first (honoring `KUBECONFIG` and `~/.kube/config`), then
/// the in-cluster service account.
async fn from_default_chain(options: &KubeConfigOptions) -> Result<kube::Config> {
    match kube::Config::from_kubeconfig(options).await {
        Ok(config) => Ok(config),
        Err(kubeconfig_err) => kube::Config::incluster().map_err(|incluster_err| {
            Error::kubeconfig(format!(
                "no usable kubeconfig ({kubeconfig_err}) and not in cluster ({incluster_err})"
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const MINIMAL_KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
  - name: test
    cluster:
      server: https://127.0.0.1:6443
contexts:
  - name: test
    context:
      cluster: test
      user: test
current-context: test
users:
  - name: test
    user:
      token: secret
"#;

    #[tokio::test]
    async fn raw_kubeconfig_resolves() {
        let descriptor = ClusterDescriptor::new(
            "raw",
            KubeconfigSource::Raw(MINIMAL_KUBECONFIG.to_string()),
        );
        let config = build_kube_config(&descriptor, &[]).await.unwrap();
        assert!(config
            .cluster_url
            .to_string()
            .starts_with("https://127.0.0.1:6443"));
    }

    #[tokio::test]
    async fn empty_raw_kubeconfig_errors() {
        let descriptor = ClusterDescriptor::new("raw", KubeconfigSource::Raw(String::new()));
        let err = build_kube_config(&descriptor, &[]).await.unwrap_err();
        assert!(err.to_string().contains("kubeconfig is empty"));
    }

    #[tokio::test]
    async fn file_kubeconfig_resolves_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL_KUBECONFIG.as_bytes()).unwrap();

        let descriptor = ClusterDescriptor::new(
            "file",
            KubeconfigSource::File(file.path().to_path_buf()),
        );
        let config = build_kube_config(&descriptor, &[]).await.unwrap();
        assert!(config
            .cluster_url
            .to_string()
            .starts_with("https://127.0.0.1:6443"));

        // Empty files are rejected before parsing.
        let empty = tempfile::NamedTempFile::new().unwrap();
        let descriptor =
            ClusterDescriptor::new("file", KubeconfigSource::File(empty.path().to_path_buf()));
        let err = build_kube_config(&descriptor, &[]).await.unwrap_err();
        assert!(err.to_string().contains("is empty"));

        let descriptor = ClusterDescriptor::new(
            "file",
            KubeconfigSource::File("/definitely/not/here".into()),
        );
        assert!(build_kube_config(&descriptor, &[]).await.is_err());
    }

    #[tokio::test]
    async fn unknown_context_errors() {
        let descriptor = ClusterDescriptor::new(
            "raw",
            KubeconfigSource::Raw(MINIMAL_KUBECONFIG.to_string()),
        )
        .with_context("missing-context");
        assert!(build_kube_config(&descriptor, &[]).await.is_err());
    }

    #[tokio::test]
    async fn mutators_run_in_order() {
        let descriptor = ClusterDescriptor::new(
            "raw",
            KubeconfigSource::Raw(MINIMAL_KUBECONFIG.to_string()),
        );
        let mutators: Vec<ConfigMutator> = vec![
            Arc::new(|config: &mut kube::Config| {
                config.default_namespace = "first".to_string();
            }),
            Arc::new(|config: &mut kube::Config| {
                config.default_namespace = "second".to_string();
            }),
        ];
        let config = build_kube_config(&descriptor, &mutators).await.unwrap();
        assert_eq!(config.default_namespace, "second");
    }
}
