//! Kubernetes client helpers: context-scoped clients, error classification,
//! and connectivity probes.

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Read the kubeconfig from an explicit path or the kube defaults
pub fn read_kubeconfig(kubeconfig: Option<&Path>) -> Result<Kubeconfig, Error> {
    match kubeconfig {
        Some(path) => Kubeconfig::read_from(path).map_err(|e| {
            Error::kubeconfig(
                "-",
                format!("failed to read kubeconfig {}: {}", path.display(), e),
            )
        }),
        None => Kubeconfig::read()
            .map_err(|e| Error::kubeconfig("-", format!("failed to read kubeconfig: {}", e))),
    }
}

/// Names of every context in the kubeconfig
pub fn list_contexts(kubeconfig: Option<&Path>) -> Result<Vec<String>, Error> {
    let kc = read_kubeconfig(kubeconfig)?;
    Ok(kc.contexts.into_iter().map(|c| c.name).collect())
}

/// The kubeconfig's active context, if one is set
pub fn current_context(kubeconfig: Option<&Path>) -> Result<Option<String>, Error> {
    Ok(read_kubeconfig(kubeconfig)?.current_context)
}

/// Create a kube client for a named context with default timeouts
pub async fn create_client_for_context(
    kubeconfig: Option<&Path>,
    context: &str,
) -> Result<Client, Error> {
    create_client_with_timeout(
        kubeconfig,
        context,
        DEFAULT_CONNECT_TIMEOUT,
        DEFAULT_READ_TIMEOUT,
    )
    .await
}

/// Create a kube client for a named context with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    context: &str,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let kc = read_kubeconfig(kubeconfig)?;
    if !kc.contexts.iter().any(|c| c.name == context) {
        return Err(Error::kubeconfig(context, "context not found in kubeconfig"));
    }

    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let mut config = Config::from_custom_kubeconfig(kc, &options)
        .await
        .map_err(|e| Error::kubeconfig(context, format!("failed to load kubeconfig: {}", e)))?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);

    debug!(context = %context, cluster_url = %config.cluster_url, "Created kube client");
    Client::try_from(config)
        .map_err(|e| Error::kubeconfig(context, format!("failed to create client: {}", e)))
}

/// Check the API server answers a version request
pub async fn probe(client: &Client) -> Result<(), Error> {
    client.apiserver_version().await?;
    Ok(())
}

/// True for failures to reach the API server at all
///
/// Client-side failures (auth, TLS setup, request building, decoding) are
/// not transport errors and would fail the same way on retry.
pub fn is_transport_error(err: &kube::Error) -> bool {
    matches!(
        err,
        kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::ReadEvents(_)
    )
}

/// True for status codes that indicate a transient server-side condition
pub fn is_transient_status(code: u16) -> bool {
    matches!(code, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Which write produced an error, to tell 409 AlreadyExists from 409 Conflict
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    /// Read of an object
    Read,
    /// Create of a new object
    Create,
    /// Resource-version-checked replace
    Replace,
    /// Delete of an object
    Delete,
}

/// Classify a kube error raised against a namespaced object
///
/// - 404 becomes `NotFound`
/// - 409 becomes `AlreadyExists` on create and `Conflict` otherwise
/// - 408/429/5xx and transport failures become `TransientStore`
/// - any other status becomes `Store` with its status code
/// - client-side failures become `Request`
pub fn classify_error(
    err: kube::Error,
    op: StoreOp,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Error {
    match err {
        kube::Error::Api(ae) => classify_status(ae.code, &ae.message, op, kind, namespace, name),
        e if is_transport_error(&e) => Error::transient(namespace, name, e.to_string()),
        other => Error::request(namespace, name, other.to_string()),
    }
}

/// Classify an HTTP status code returned against a namespaced object
pub fn classify_status(
    code: u16,
    message: &str,
    op: StoreOp,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Error {
    match code {
        404 => Error::not_found(kind, namespace, name),
        409 if op == StoreOp::Create => Error::already_exists(kind, namespace, name),
        409 => Error::conflict(kind, namespace, name),
        c if is_transient_status(c) => Error::transient(namespace, name, format!("{c}: {message}")),
        c => Error::store(namespace, name, c, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify_error(api_error(404), StoreOp::Read, "Lease", "ns1", "l");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_409_depends_on_operation() {
        let create = classify_error(api_error(409), StoreOp::Create, "Lease", "ns1", "l");
        assert!(create.is_already_exists());

        let replace = classify_error(api_error(409), StoreOp::Replace, "Lease", "ns1", "l");
        assert!(replace.is_conflict());
    }

    #[test]
    fn test_classify_transient_codes() {
        for code in [429, 500, 502, 503, 504] {
            let err = classify_error(api_error(code), StoreOp::Read, "Lease", "ns1", "l");
            assert!(err.is_retryable(), "code {code} should be transient");
        }
    }

    #[test]
    fn test_classify_permanent_codes() {
        let err = classify_error(api_error(403), StoreOp::Read, "ConfigMap", "ns1", "cfg");
        match err {
            Error::Store { code, .. } => assert_eq!(code, 403),
            other => panic!("expected Store, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_transport_failure_is_transient() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = classify_error(
            kube::Error::Service(Box::new(refused)),
            StoreOp::Read,
            "Lease",
            "ns1",
            "l",
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_client_side_failure_is_permanent() {
        let err = classify_error(
            kube::Error::TlsRequired,
            StoreOp::Replace,
            "ConfigMap",
            "ns1",
            "cfg",
        );
        assert!(!err.is_retryable());
        assert!(matches!(err, Error::Request { ref namespace, ref name, .. } if namespace == "ns1" && name == "cfg"));
    }
}
