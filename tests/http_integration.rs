//! Integration tests for the Compute client using wiremock
//!
//! These tests drive the provisioning core through the real HTTP client
//! against mocked endpoints, checking URLs per scope, status handling and
//! operation polling.

use psc_demo::gcp::auth::GcpCredentials;
use psc_demo::gcp::client::GcpClient;
use psc_demo::provision::api::ComputeApi;
use psc_demo::provision::checker::{self, Presence};
use psc_demo::provision::reconcile::{Change, Probe, Reconcile};
use psc_demo::provision::{
    BackoffPolicy, EnsureOutcome, Poller, ProvisionError, Provisioner, ReconcileOutcome, RemovalOutcome,
    ResourceDescriptor, ResourceKind, ResourceRef,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{bearer_token, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PROJECT: &str = "test-project";
const BASE: &str = "/compute/v1/projects/test-project";

fn client(server: &MockServer) -> GcpClient {
    GcpClient::with_credentials(GcpCredentials::fixed("test-token"), PROJECT)
        .unwrap()
        .with_endpoint(&server.uri())
        .unwrap()
}

fn provisioner(server: &MockServer) -> Provisioner {
    let fast = Poller::new(BackoffPolicy {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(40),
        multiplier: 2,
    })
    .with_deadline(Duration::from_secs(5));
    Provisioner::new(Arc::new(client(server))).with_poller(fast)
}

fn not_found() -> ResponseTemplate {
    ResponseTemplate::new(404).set_body_json(json!({
        "error": {
            "code": 404,
            "message": "The resource was not found",
            "errors": [{ "reason": "notFound", "message": "The resource was not found" }]
        }
    }))
}

fn operation(name: &str, status: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "kind": "compute#operation",
        "name": name,
        "status": status,
    }))
}

mod existence_tests {
    use super::*;

    #[tokio::test]
    async fn test_404_is_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/global/networks/net-a")))
            .and(bearer_token("test-token"))
            .respond_with(not_found())
            .mount(&server)
            .await;

        let api = client(&server);
        let presence = checker::exists(&api, &ResourceRef::global(ResourceKind::Network, "net-a"))
            .await
            .unwrap();
        assert_eq!(presence, Presence::Absent);
    }

    #[tokio::test]
    async fn test_200_is_present_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/regions/us-central1/subnetworks/sub-a")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "sub-a",
                "ipCidrRange": "10.1.0.0/24"
            })))
            .mount(&server)
            .await;

        let api = client(&server);
        let subnet = ResourceRef::regional(ResourceKind::Subnetwork, "sub-a", "us-central1");
        match checker::exists(&api, &subnet).await.unwrap() {
            Presence::Present(body) => assert_eq!(body["ipCidrRange"], "10.1.0.0/24"),
            Presence::Absent => panic!("expected the subnet to be present"),
        }
    }

    #[tokio::test]
    async fn test_403_never_inserts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/global/networks/net-a")))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {
                    "code": 403,
                    "message": "Required 'compute.networks.get' permission",
                    "errors": [{ "reason": "forbidden" }]
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{BASE}/global/networks")))
            .respond_with(operation("op-never", "RUNNING"))
            .expect(0)
            .mount(&server)
            .await;

        let p = provisioner(&server);
        let descriptor = ResourceDescriptor::new(
            ResourceRef::global(ResourceKind::Network, "net-a"),
            json!({ "autoCreateSubnetworks": false }),
        );
        let err = p.ensure(&descriptor).await.unwrap_err();

        assert!(matches!(err, ProvisionError::AmbiguousExists { .. }));
        assert_eq!(err.remote_detail().unwrap()["error"]["code"], 403);
    }
}

mod create_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_polls_global_operation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/global/networks/net-a")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{BASE}/global/networks")))
            .and(body_partial_json(json!({ "name": "net-a", "autoCreateSubnetworks": false })))
            .respond_with(operation("op-1", "PENDING"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/global/operations/op-1")))
            .respond_with(operation("op-1", "DONE"))
            .mount(&server)
            .await;

        let p = provisioner(&server);
        let descriptor = ResourceDescriptor::new(
            ResourceRef::global(ResourceKind::Network, "net-a"),
            json!({ "autoCreateSubnetworks": false }),
        );
        assert_eq!(p.ensure(&descriptor).await.unwrap(), EnsureOutcome::Created);

        let requests = server.received_requests().await.unwrap();
        let insert = requests
            .iter()
            .find(|r| r.method.as_str() == "POST")
            .expect("insert request");
        let request_id = insert
            .url
            .query_pairs()
            .find(|(k, _)| k == "requestId")
            .map(|(_, v)| v.to_string())
            .expect("requestId query parameter");
        assert!(uuid::Uuid::parse_str(&request_id).is_ok());
    }

    #[tokio::test]
    async fn test_regional_insert_polls_regional_operation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/regions/us-central1/subnetworks/sub-a")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{BASE}/regions/us-central1/subnetworks")))
            .respond_with(operation("op-2", "RUNNING"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/regions/us-central1/operations/op-2")))
            .respond_with(operation("op-2", "DONE"))
            .expect(1)
            .mount(&server)
            .await;

        let p = provisioner(&server);
        let descriptor = ResourceDescriptor::new(
            ResourceRef::regional(ResourceKind::Subnetwork, "sub-a", "us-central1"),
            json!({ "ipCidrRange": "10.1.0.0/24" }),
        );
        assert_eq!(p.ensure(&descriptor).await.unwrap(), EnsureOutcome::Created);
    }

    #[tokio::test]
    async fn test_zonal_insert_polls_zonal_operation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/zones/us-central1-a/instances/vm-a")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{BASE}/zones/us-central1-a/instances")))
            .respond_with(operation("op-3", "RUNNING"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/zones/us-central1-a/operations/op-3")))
            .respond_with(operation("op-3", "DONE"))
            .expect(1)
            .mount(&server)
            .await;

        let p = provisioner(&server);
        let descriptor = ResourceDescriptor::new(
            ResourceRef::zonal(ResourceKind::Instance, "vm-a", "us-central1-a"),
            json!({ "machineType": "zones/us-central1-a/machineTypes/e2-micro" }),
        );
        assert_eq!(p.ensure(&descriptor).await.unwrap(), EnsureOutcome::Created);
    }

    #[tokio::test]
    async fn test_operation_error_is_reported_verbatim() {
        let server = MockServer::start().await;
        let error = json!({
            "errors": [{
                "code": "QUOTA_EXCEEDED",
                "message": "Quota 'NETWORKS' exceeded. Limit: 5.0 globally."
            }]
        });
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/global/networks/net-a")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{BASE}/global/networks")))
            .respond_with(operation("op-4", "RUNNING"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/global/operations/op-4")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "op-4",
                "status": "DONE",
                "error": error
            })))
            .mount(&server)
            .await;

        let p = provisioner(&server);
        let descriptor = ResourceDescriptor::new(ResourceRef::global(ResourceKind::Network, "net-a"), json!({}));
        match p.ensure(&descriptor).await.unwrap_err() {
            ProvisionError::OperationFailed { operation, detail, .. } => {
                assert_eq!(operation, "op-4");
                assert_eq!(detail, error);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_409_on_insert_is_already_present() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/global/firewalls/fw-a")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{BASE}/global/firewalls")))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error": {
                    "code": 409,
                    "message": "The resource 'projects/test-project/global/firewalls/fw-a' already exists",
                    "errors": [{ "reason": "alreadyExists" }]
                }
            })))
            .mount(&server)
            .await;

        let p = provisioner(&server);
        let descriptor = ResourceDescriptor::new(ResourceRef::global(ResourceKind::Firewall, "fw-a"), json!({}));
        assert_eq!(p.ensure(&descriptor).await.unwrap(), EnsureOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn test_submit_rejection_keeps_remote_detail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/global/networks/net-a")))
            .respond_with(not_found())
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{BASE}/global/networks")))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "code": 400,
                    "message": "Invalid value for field 'resource.name'",
                    "errors": [{ "reason": "invalid" }]
                }
            })))
            .mount(&server)
            .await;

        let p = provisioner(&server);
        let descriptor = ResourceDescriptor::new(ResourceRef::global(ResourceKind::Network, "net-a"), json!({}));
        let err = p.ensure(&descriptor).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Submit { .. }));
        assert_eq!(
            err.remote_detail().unwrap()["error"]["message"],
            "Invalid value for field 'resource.name'"
        );
    }
}

mod mutation_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_then_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/regions/us-central1/addresses/ip-a")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "ip-a" })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{BASE}/regions/us-central1/addresses/ip-a")))
            .respond_with(operation("op-5", "RUNNING"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/regions/us-central1/operations/op-5")))
            .respond_with(operation("op-5", "DONE"))
            .mount(&server)
            .await;

        let p = provisioner(&server);
        let address = ResourceRef::regional(ResourceKind::Address, "ip-a", "us-central1");
        assert_eq!(p.ensure_absent(&address).await.unwrap(), RemovalOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_patch_carries_fingerprint() {
        let server = MockServer::start().await;
        let backend = ResourceRef::regional(ResourceKind::BackendService, "bs-a", "us-central1");
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/regions/us-central1/backendServices/bs-a")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "bs-a",
                "fingerprint": "fp-1",
                "backends": []
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(format!("{BASE}/regions/us-central1/backendServices/bs-a")))
            .and(body_partial_json(json!({ "fingerprint": "fp-1" })))
            .respond_with(operation("op-6", "RUNNING"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{BASE}/regions/us-central1/operations/op-6")))
            .respond_with(operation("op-6", "DONE"))
            .mount(&server)
            .await;

        let step = Reconcile::new(
            backend,
            Probe::Get,
            Change::Patch,
            |current| current["backends"].as_array().is_some_and(|b| !b.is_empty()),
            |current| {
                json!({
                    "fingerprint": current["fingerprint"].clone(),
                    "backends": [{ "group": "projects/test-project/zones/us-central1-a/instanceGroups/ig" }]
                })
            },
        );

        let p = provisioner(&server);
        assert_eq!(p.reconcile(&step).await.unwrap(), ReconcileOutcome::Updated);
    }

    #[tokio::test]
    async fn test_invoke_posts_to_verb() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{BASE}/regions/us-central1/backendServices/bs-a/getHealth")))
            .and(body_partial_json(json!({ "group": "ig-link" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "healthStatus": [{ "instance": "vm-a", "healthState": "HEALTHY" }]
            })))
            .mount(&server)
            .await;

        let api = client(&server);
        let backend = ResourceRef::regional(ResourceKind::BackendService, "bs-a", "us-central1");
        let health = api
            .invoke(&backend, "getHealth", &json!({ "group": "ig-link" }))
            .await
            .unwrap();
        assert_eq!(health["healthStatus"][0]["healthState"], "HEALTHY");
    }
}
