//! Serving-certificate issuance and distribution for admission webhooks.
//!
//! Two issuance flows produce a [`CertBundle`]: fully self-signed
//! ([`issue_self_signed`]) and cluster-issued through the CSR API
//! ([`issue_with_csr`]). The bundle can be persisted for a webhook server
//! and its CA injected into webhook configurations.

mod csr;
mod selfsigned;

pub use csr::issue_with_csr;
pub use selfsigned::{issue_self_signed, CertOptions, SelfSigner};

use std::path::Path;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration, WebhookClientConfig,
};
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use tracing::info;

use crate::cluster::ClusterClient;
use crate::{Error, Result};

/// Certificate file name within a serving directory
pub const TLS_CERT_FILE: &str = "tls.crt";

/// Key file name within a serving directory
pub const TLS_KEY_FILE: &str = "tls.key";

/// PEM material for one webhook serving identity
#[derive(Debug, Clone)]
pub struct CertBundle {
    /// CA certificate clients use to verify the server
    pub ca_bundle: Vec<u8>,
    /// Serving certificate
    pub tls_cert: Vec<u8>,
    /// Serving private key
    pub tls_key: Vec<u8>,
}

impl CertBundle {
    /// Write `tls.crt` and `tls.key` into `dir`, creating the directory
    /// (mode 0755) if needed; files are written with mode 0644.
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            set_mode(dir, 0o755)?;
        }

        let cert_path = dir.join(TLS_CERT_FILE);
        std::fs::write(&cert_path, &self.tls_cert)?;
        set_mode(&cert_path, 0o644)?;

        let key_path = dir.join(TLS_KEY_FILE);
        std::fs::write(&key_path, &self.tls_key)?;
        set_mode(&key_path, 0o644)?;
        Ok(())
    }

    /// Set this bundle's CA on every matching webhook of a
    /// MutatingWebhookConfiguration.
    ///
    /// A webhook matches when its client config has no service reference or
    /// the reference equals (`svc_namespace`, `svc_name`). Zero matches is
    /// an error.
    pub async fn inject_into_mutating_webhook(
        &self,
        client: &ClusterClient,
        name: &str,
        svc_name: &str,
        svc_namespace: &str,
    ) -> Result<()> {
        let api: Api<MutatingWebhookConfiguration> = Api::all(client.kube_client().clone());
        let mut config = client
            .bounded("get mutating webhook configuration", api.get(name))
            .await?;

        let changed =
            inject_into_mutating_config(&mut config, &self.ca_bundle, name, svc_name, svc_namespace)?;

        client
            .bounded(
                "update mutating webhook configuration",
                api.replace(name, &PostParams::default(), &config),
            )
            .await?;
        info!(configuration = %name, updated = changed, "updated mutating webhook caBundle");
        Ok(())
    }

    /// Set this bundle's CA on every matching webhook of a
    /// ValidatingWebhookConfiguration; same matching rules as the mutating
    /// variant.
    pub async fn inject_into_validating_webhook(
        &self,
        client: &ClusterClient,
        name: &str,
        svc_name: &str,
        svc_namespace: &str,
    ) -> Result<()> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(client.kube_client().clone());
        let mut config = client
            .bounded("get validating webhook configuration", api.get(name))
            .await?;

        let changed = inject_into_validating_config(
            &mut config,
            &self.ca_bundle,
            name,
            svc_name,
            svc_namespace,
        )?;

        client
            .bounded(
                "update validating webhook configuration",
                api.replace(name, &PostParams::default(), &config),
            )
            .await?;
        info!(configuration = %name, updated = changed, "updated validating webhook caBundle");
        Ok(())
    }
}

/// Set `ca_bundle` on every matching webhook of an in-memory
/// MutatingWebhookConfiguration; errors when nothing matches.
fn inject_into_mutating_config(
    config: &mut MutatingWebhookConfiguration,
    ca_bundle: &[u8],
    name: &str,
    svc_name: &str,
    svc_namespace: &str,
) -> Result<usize> {
    let changed = set_matching_ca_bundles(
        config
            .webhooks
            .iter_mut()
            .flatten()
            .map(|webhook| &mut webhook.client_config),
        ca_bundle,
        svc_namespace,
        svc_name,
    );
    if changed == 0 {
        return Err(Error::NoMatchingWebhook(format!(
            "no webhook in MutatingWebhookConfiguration {name} matches service {svc_namespace}/{svc_name}"
        )));
    }
    Ok(changed)
}

/// Set `ca_bundle` on every matching webhook of an in-memory
/// ValidatingWebhookConfiguration; errors when nothing matches.
fn inject_into_validating_config(
    config: &mut ValidatingWebhookConfiguration,
    ca_bundle: &[u8],
    name: &str,
    svc_name: &str,
    svc_namespace: &str,
) -> Result<usize> {
    let changed = set_matching_ca_bundles(
        config
            .webhooks
            .iter_mut()
            .flatten()
            .map(|webhook| &mut webhook.client_config),
        ca_bundle,
        svc_namespace,
        svc_name,
    );
    if changed == 0 {
        return Err(Error::NoMatchingWebhook(format!(
            "no webhook in ValidatingWebhookConfiguration {name} matches service {svc_namespace}/{svc_name}"
        )));
    }
    Ok(changed)
}

/// Apply the matching rule over the webhooks' client configs and set the CA
/// bundle on each hit; returns how many webhooks changed.
fn set_matching_ca_bundles<'a>(
    client_configs: impl Iterator<Item = &'a mut WebhookClientConfig>,
    ca_bundle: &[u8],
    svc_namespace: &str,
    svc_name: &str,
) -> usize {
    let mut changed = 0usize;
    for client_config in client_configs {
        let service = client_config
            .service
            .as_ref()
            .map(|s| (s.namespace.as_str(), s.name.as_str()));
        if service_matches(service, svc_namespace, svc_name) {
            client_config.ca_bundle = Some(ByteString(ca_bundle.to_vec()));
            changed += 1;
        }
    }
    changed
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Matching rule shared by both webhook configuration kinds: a webhook with
/// no service reference always matches, otherwise namespace and name must
/// both equal the serving service.
fn service_matches(
    service: Option<(&str, &str)>,
    svc_namespace: &str,
    svc_name: &str,
) -> bool {
    match service {
        None => true,
        Some((namespace, name)) => namespace == svc_namespace && name == svc_name,
    }
}
