//! Cluster-issued serving certificates through the CSR API.
//!
//! Flow: generate a serving key and CSR locally, submit a
//! CertificateSigningRequest under the kubelet-serving signer, append the
//! approval condition, then watch the object until the API server populates
//! `status.certificate` or reports a terminal failure. The whole wait is
//! bounded by a 20 second budget.

use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
    CertificateSigningRequestStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, error};

use super::selfsigned::{CertOptions, SelfSigner};
use super::CertBundle;
use crate::cluster::ClusterClient;
use crate::{Error, Result};

const CSR_NAME_PREFIX: &str = "webhook-csr-";
const SIGNER_NAME: &str = "kubernetes.io/kubelet-serving";
const CONTROLLER_NAME: &str = "FlotillaAuthentication";

const APPROVED_CONDITION: &str = "Approved";
const FAILED_CONDITION: &str = "Failed";

const READ_CERTIFICATE_BUDGET: Duration = Duration::from_secs(20);

/// Default CA path mounted into every pod by the service account admission
/// controller
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Issue a serving certificate for `svc_opts` signed by the cluster.
///
/// Requires create/get/watch on certificatesigningrequests, update on their
/// approval subresource, and approve on the kubelet-serving signer.
pub async fn issue_with_csr(client: &ClusterClient, svc_opts: &CertOptions) -> Result<CertBundle> {
    let ca_bundle = read_ca_bundle(client.kube_config())?;

    let signer = SelfSigner::new()?;
    let csr_pem = signer.gen_csr(svc_opts)?;

    let api: Api<CertificateSigningRequest> = Api::all(client.kube_client().clone());
    let name = submit_csr(client, &api, &csr_pem).await?;
    approve_csr(client, &api, &name).await?;
    let tls_cert = read_signed_certificate(&api, &name).await?;

    Ok(CertBundle {
        ca_bundle,
        tls_cert,
        tls_key: signer.private_key_pem().as_bytes().to_vec(),
    })
}

async fn submit_csr(
    client: &ClusterClient,
    api: &Api<CertificateSigningRequest>,
    csr_pem: &str,
) -> Result<String> {
    let name = build_csr_name();
    let csr = CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(csr_pem.as_bytes().to_vec()),
            signer_name: SIGNER_NAME.to_string(),
            usages: Some(vec![
                "digital signature".to_string(),
                "key encipherment".to_string(),
                "server auth".to_string(),
            ]),
            ..Default::default()
        },
        status: None,
    };

    client
        .bounded("create CSR", api.create(&PostParams::default(), &csr))
        .await
        .map_err(|err| {
            error!(name = %name, error = %err, "create CSR failed");
            err
        })?;
    debug!(name = %name, "create CSR success");
    Ok(name)
}

async fn approve_csr(
    client: &ClusterClient,
    api: &Api<CertificateSigningRequest>,
    name: &str,
) -> Result<()> {
    let mut csr = client.bounded("get CSR", api.get(name)).await?;

    let status = csr.status.get_or_insert_with(Default::default);
    status
        .conditions
        .get_or_insert_with(Vec::new)
        .push(CertificateSigningRequestCondition {
            type_: APPROVED_CONDITION.to_string(),
            status: "True".to_string(),
            reason: Some(format!("{CONTROLLER_NAME}Approve")),
            message: Some(format!(
                "This CSR was approved by {CONTROLLER_NAME} certificate approve."
            )),
            last_update_time: Some(Time(chrono::Utc::now())),
            last_transition_time: None,
        });

    client
        .bounded(
            "approve CSR",
            api.patch_approval(name, &PatchParams::default(), &Patch::Merge(&csr)),
        )
        .await
        .map_err(|err| {
            error!(name = %name, error = %err, "approve CSR failed");
            err
        })?;
    debug!(name = %name, "approve CSR success");
    Ok(())
}

/// Watch the CSR until `status.certificate` is populated or a Failed
/// condition appears, bounded by [`READ_CERTIFICATE_BUDGET`].
async fn read_signed_certificate(
    api: &Api<CertificateSigningRequest>,
    name: &str,
) -> Result<Vec<u8>> {
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let mut stream = Box::pin(watcher(api.clone(), config));

    let wait = async {
        while let Some(event) = stream.next().await {
            let csr = match event {
                Ok(Event::Apply(csr)) | Ok(Event::InitApply(csr)) => csr,
                Ok(_) => continue,
                Err(err) => {
                    debug!(name = %name, error = %err, "CSR watch error, retrying");
                    continue;
                }
            };
            let Some(status) = csr.status.as_ref() else { continue };

            match certificate_outcome(status) {
                Some(Ok(certificate)) => return Ok(certificate),
                Some(Err(err)) => {
                    error!(name = %name, error = %err, "CSR signing failed");
                    return Err(err);
                }
                None => {}
            }
        }
        Err(Error::CsrFailed(format!(
            "watch for {name} ended before a certificate was issued"
        )))
    };

    tokio::time::timeout(READ_CERTIFICATE_BUDGET, wait)
        .await
        .map_err(|_| Error::Timeout {
            op: "read signed certificate",
            after: READ_CERTIFICATE_BUDGET,
        })?
}

/// What an observed CSR status means for the waiter: the signed certificate,
/// a terminal failure, or `None` to keep watching.
///
/// A populated certificate wins over a Failed condition.
fn certificate_outcome(status: &CertificateSigningRequestStatus) -> Option<Result<Vec<u8>>> {
    if let Some(certificate) = &status.certificate {
        return Some(decode_certificate(certificate));
    }
    status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|condition| condition.type_ == FAILED_CONDITION)
        .map(|condition| {
            Err(Error::CsrFailed(
                condition.message.clone().unwrap_or_default(),
            ))
        })
}

fn decode_certificate(certificate: &ByteString) -> Result<Vec<u8>> {
    let block = pem::parse(&certificate.0)
        .map_err(|err| Error::pki(format!("invalid PEM encoded certificate: {err}")))?;
    Ok(pem::encode(&pem::Pem::new("CERTIFICATE", block.contents().to_vec())).into_bytes())
}

/// CA bundle for clients of the serving certificate: the connection's root
/// certificates, falling back to the mounted service-account CA.
pub(crate) fn read_ca_bundle(config: &kube::Config) -> Result<Vec<u8>> {
    if let Some(chain) = config.root_cert.as_ref().filter(|chain| !chain.is_empty()) {
        let mut bundle = String::new();
        for der in chain {
            bundle.push_str(&pem::encode(&pem::Pem::new("CERTIFICATE", der.clone())));
        }
        return Ok(bundle.into_bytes());
    }

    let path = std::path::Path::new(SERVICE_ACCOUNT_CA_PATH);
    if path.exists() {
        return Ok(std::fs::read(path)?);
    }

    Err(Error::pki(
        "CA bundle not found in client configuration or service account",
    ))
}

fn build_csr_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{CSR_NAME_PREFIX}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(type_: &str, message: &str) -> CertificateSigningRequestCondition {
        CertificateSigningRequestCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            reason: None,
            message: Some(message.to_string()),
            last_update_time: None,
            last_transition_time: None,
        }
    }

    fn status(
        certificate: Option<ByteString>,
        conditions: Vec<CertificateSigningRequestCondition>,
    ) -> CertificateSigningRequestStatus {
        CertificateSigningRequestStatus {
            certificate,
            conditions: if conditions.is_empty() {
                None
            } else {
                Some(conditions)
            },
        }
    }

    fn signed_cert_pem() -> String {
        let mut signer = SelfSigner::new().unwrap();
        signer.gen_cert(&CertOptions::new("csr-test")).unwrap()
    }

    #[test]
    fn outcome_returns_the_certificate_once_populated() {
        let cert_pem = signed_cert_pem();
        let status = status(
            Some(ByteString(cert_pem.into_bytes())),
            vec![condition(APPROVED_CONDITION, "approved")],
        );

        let outcome = certificate_outcome(&status).expect("certificate is terminal");
        let decoded = String::from_utf8(outcome.unwrap()).unwrap();
        assert!(decoded.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn outcome_surfaces_a_failed_condition() {
        let status = status(
            None,
            vec![
                condition(APPROVED_CONDITION, "approved"),
                condition(FAILED_CONDITION, "signer rejected the request"),
            ],
        );

        let err = certificate_outcome(&status)
            .expect("failure is terminal")
            .unwrap_err();
        assert!(matches!(err, Error::CsrFailed(_)));
        assert!(err.to_string().contains("signer rejected the request"));
    }

    #[test]
    fn outcome_keeps_waiting_until_a_terminal_state() {
        // No status content yet.
        assert!(certificate_outcome(&status(None, Vec::new())).is_none());

        // Approval alone is not terminal; the signer has not answered.
        let approved = status(None, vec![condition(APPROVED_CONDITION, "approved")]);
        assert!(certificate_outcome(&approved).is_none());
    }

    #[test]
    fn outcome_prefers_the_certificate_over_a_failed_condition() {
        let cert_pem = signed_cert_pem();
        let status = status(
            Some(ByteString(cert_pem.into_bytes())),
            vec![condition(FAILED_CONDITION, "stale failure")],
        );

        let outcome = certificate_outcome(&status).expect("certificate is terminal");
        assert!(outcome.is_ok());
    }

    #[test]
    fn outcome_rejects_a_non_pem_certificate() {
        let status = status(Some(ByteString(b"not pem".to_vec())), Vec::new());
        let err = certificate_outcome(&status)
            .expect("a populated certificate is terminal")
            .unwrap_err();
        assert!(err.to_string().contains("invalid PEM"));
    }

    #[test]
    fn csr_names_are_prefixed_and_random() {
        let a = build_csr_name();
        let b = build_csr_name();
        assert!(a.starts_with(CSR_NAME_PREFIX));
        assert_eq!(a.len(), CSR_NAME_PREFIX.len() + 8);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn decode_certificate_normalizes_pem() {
        let mut signer = SelfSigner::new().unwrap();
        let cert_pem = signer.gen_cert(&CertOptions::new("test")).unwrap();

        let decoded = decode_certificate(&ByteString(cert_pem.clone().into_bytes())).unwrap();
        let decoded = String::from_utf8(decoded).unwrap();
        assert!(decoded.contains("BEGIN CERTIFICATE"));

        let err = decode_certificate(&ByteString(b"not pem".to_vec())).unwrap_err();
        assert!(err.to_string().contains("invalid PEM"));
    }

    #[test]
    fn ca_bundle_prefers_the_connection_roots() {
        let mut signer = SelfSigner::new().unwrap();
        let ca_pem = signer.gen_cert(&CertOptions::new("root")).unwrap();
        let der = pem::parse(&ca_pem).unwrap().contents().to_vec();

        let mut config = kube::Config::new("https://127.0.0.1:6443".parse().unwrap());
        config.root_cert = Some(vec![der]);

        let bundle = read_ca_bundle(&config).unwrap();
        let text = String::from_utf8(bundle).unwrap();
        assert!(text.contains("BEGIN CERTIFICATE"));
    }
}
