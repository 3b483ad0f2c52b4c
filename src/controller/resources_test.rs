//! Unit tests for Kubernetes resource builders and convergers.
//!
//! Run with: `cargo test resources_test`

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::batch::v1::Job;
    use k8s_openapi::api::core::v1::{
        Container, PersistentVolumeClaim, PersistentVolumeClaimSpec, Secret, Service, ServiceSpec,
        VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    use crate::config::OperatorConfig;
    use crate::controller::resources::*;
    use crate::controller::testing::{joiner_store, object_store, FakeStore};
    use crate::controller::ResourceStore;
    use crate::error::Error;
    use crate::rgw::stable_hash;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn env_names(container: &Container) -> Vec<String> {
        container
            .env
            .as_ref()
            .map(|env| env.iter().map(|e| e.name.clone()).collect())
            .unwrap_or_default()
    }

    fn service_port(service: &Service) -> i32 {
        service.spec.as_ref().unwrap().ports.as_ref().unwrap()[0].port
    }

    fn live_service(store: &FakeStore, port: i32, cluster_ip: &str) {
        let obj = object_store("ns", "store");
        let mut service = build_service(&obj, &OperatorConfig::default());
        let spec = service.spec.as_mut().unwrap();
        spec.cluster_ip = Some(cluster_ip.to_string());
        spec.ports.as_mut().unwrap()[0].port = port;
        service
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("team".to_string(), "storage".to_string());
        store.insert(service);
    }

    // -----------------------------------------------------------------------
    // Naming
    // -----------------------------------------------------------------------

    #[test]
    fn test_names_are_scoped_by_identity() {
        let obj = object_store("tenant-a", "photos");
        assert_eq!(instance_name(&obj), "rgw-photos-tenant-a");
        assert_eq!(zone_name(&obj), "photos-tenant-a");
        assert_eq!(zone_job_name(&obj), "rgw-photos-tenant-a-zone-join");
        assert_eq!(realm_token_secret_name(&obj), "photos-realm-token");
        assert_eq!(label_selector(&obj), "object_store=photos");
        assert_eq!(
            standard_labels(&obj),
            BTreeMap::from([("object_store".to_string(), "photos".to_string())])
        );
    }

    #[test]
    fn test_owner_reference_points_at_object_store() {
        let obj = object_store("ns", "store");
        let owner = owner_reference(&obj);
        assert_eq!(owner.kind, "ObjectStore");
        assert_eq!(owner.api_version, "object.rgw-standalone.io/v1alpha1");
        assert_eq!(owner.uid, "store-uid");
        assert_eq!(owner.controller, Some(true));
    }

    // -----------------------------------------------------------------------
    // PVC
    // -----------------------------------------------------------------------

    #[test]
    fn test_pvc_from_template_forces_single_writer_filesystem() {
        let mut obj = object_store("ns", "store");
        obj.spec.volume_claim_template = Some(PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteMany".to_string()]),
                storage_class_name: Some("fast".to_string()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity("5Gi".to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        let pvc = build_pvc(&obj, &OperatorConfig::default());
        let spec = pvc.spec.unwrap();
        assert_eq!(pvc.metadata.name.as_deref(), Some("rgw-store-ns"));
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
        assert_eq!(spec.volume_mode.as_deref(), Some("Filesystem"));
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
        assert_eq!(
            spec.resources.unwrap().requests.unwrap()["storage"],
            Quantity("5Gi".to_string())
        );
    }

    #[test]
    fn test_pvc_without_template_uses_default_size() {
        let obj = object_store("ns", "store");
        let config = OperatorConfig {
            default_volume_size: "3Gi".to_string(),
            ..Default::default()
        };
        let spec = build_pvc(&obj, &config).spec.unwrap();
        assert_eq!(
            spec.resources.unwrap().requests.unwrap()["storage"],
            Quantity("3Gi".to_string())
        );
    }

    #[tokio::test]
    async fn test_existing_pvc_spec_is_left_alone() {
        let store = FakeStore::new();
        let obj = object_store("ns", "store");
        let mut live = build_pvc(&obj, &OperatorConfig::default());
        live.spec.as_mut().unwrap().storage_class_name = Some("bound-class".to_string());
        live.metadata.labels = None;
        store.insert(live);

        let op = ensure_pvc(&store, &obj, &OperatorConfig::default()).await.unwrap();
        assert_eq!(op, Operation::Updated);

        let pvc: PersistentVolumeClaim = store.object("ns", "rgw-store-ns").unwrap();
        assert_eq!(
            pvc.spec.unwrap().storage_class_name.as_deref(),
            Some("bound-class")
        );
        assert_eq!(pvc.metadata.labels, Some(standard_labels(&obj)));
    }

    // -----------------------------------------------------------------------
    // Service
    // -----------------------------------------------------------------------

    #[test]
    fn test_service_port_mapping() {
        let config = OperatorConfig::default();
        for (spec_port, expected) in [
            (None, 8080),
            (Some(0), 8080),
            (Some(1), 1),
            (Some(80), 80),
            (Some(9000), 9000),
            (Some(65535), 65535),
        ] {
            let mut obj = object_store("ns", "store");
            obj.spec.gateway.port = spec_port;
            let service = build_service(&obj, &config);
            let port = &service.spec.as_ref().unwrap().ports.as_ref().unwrap()[0];

            assert_eq!(port.port, expected, "spec port {spec_port:?}");
            assert_eq!(port.target_port, Some(IntOrString::Int(7480)));
            assert_eq!(port.name.as_deref(), Some("http"));
            assert_eq!(port.protocol.as_deref(), Some("TCP"));
        }
    }

    #[test]
    fn test_service_endpoint_prefers_cluster_ip() {
        let obj = object_store("ns", "store");
        let mut service = build_service(&obj, &OperatorConfig::default());
        assert_eq!(
            service_endpoint(&service, 8080),
            "http://rgw-store-ns.ns.svc:8080"
        );

        service.spec.as_mut().unwrap().cluster_ip = Some("10.96.0.12".to_string());
        assert_eq!(service_endpoint(&service, 8080), "http://10.96.0.12:8080");
    }

    #[tokio::test]
    async fn test_service_update_preserves_cluster_ip_and_foreign_labels() {
        let store = FakeStore::new();
        live_service(&store, 9999, "10.96.0.12");
        let obj = object_store("ns", "store");

        let endpoint = ensure_service(&store, &obj, &OperatorConfig::default())
            .await
            .unwrap();

        assert_eq!(endpoint, "http://10.96.0.12:8080");
        let service: Service = store.object("ns", "rgw-store-ns").unwrap();
        assert_eq!(service_port(&service), 8080);
        assert_eq!(
            service.spec.unwrap().cluster_ip.as_deref(),
            Some("10.96.0.12")
        );
        assert_eq!(
            service.metadata.labels.unwrap().get("team").map(String::as_str),
            Some("storage")
        );
    }

    #[tokio::test]
    async fn test_create_race_is_success() {
        let store = FakeStore::new();
        live_service(&store, 8080, "10.96.0.7");
        // the first read misses the object another writer just created
        store.fail_once("get Service", 404, "NotFound");

        let endpoint = ensure_service(&store, &object_store("ns", "store"), &OperatorConfig::default())
            .await
            .unwrap();

        assert_eq!(endpoint, "http://10.96.0.7:8080");
        assert_eq!(store.count_calls("create Service"), 1);
        assert_eq!(store.count_calls("replace Service"), 0);
    }

    #[tokio::test]
    async fn test_update_conflict_is_propagated() {
        let store = FakeStore::new();
        live_service(&store, 9999, "10.96.0.12");
        store.fail_on("replace Service", 409, "Conflict");

        let err = ensure_service(&store, &object_store("ns", "store"), &OperatorConfig::default())
            .await
            .unwrap_err();

        match err {
            Error::KubeError(e) => assert!(crate::error::is_conflict(&e)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_replace_is_rejected_by_store() {
        let store = FakeStore::new();
        live_service(&store, 9999, "10.96.0.12");

        let mut stale: Service = store.object("ns", "rgw-store-ns").unwrap();
        stale.metadata.resource_version = Some("0".to_string());
        stale.spec = Some(ServiceSpec::default());

        let err = store.replace("ns", "rgw-store-ns", &stale).await.unwrap_err();
        assert!(crate::error::is_conflict(&err));
    }

    // -----------------------------------------------------------------------
    // Deployment
    // -----------------------------------------------------------------------

    #[test]
    fn test_standalone_pod_template() {
        let obj = object_store("ns", "store");
        let config = OperatorConfig::default();
        let deployment = build_deployment(&obj, &config, None, "http://10.0.0.1:8080");
        let spec = deployment.spec.unwrap();
        let pod = spec.template.spec.unwrap();

        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.selector.match_labels, Some(standard_labels(&obj)));
        assert_eq!(
            spec.template.metadata.unwrap().labels,
            Some(standard_labels(&obj))
        );

        let security = pod.security_context.unwrap();
        assert_eq!(security.run_as_user, Some(167));
        assert_eq!(security.run_as_group, Some(167));
        assert_eq!(security.fs_group, Some(167));

        let init = pod.init_containers.unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, CHOWN_CONTAINER);
        assert_eq!(
            init[0].args.as_ref().unwrap(),
            &vec![
                "--verbose".to_string(),
                "--recursive".to_string(),
                "ceph:ceph".to_string(),
                "/var/lib/ceph/radosgw/data".to_string(),
            ]
        );
        let init_security = init[0].security_context.as_ref().unwrap();
        assert_eq!(init_security.privileged, Some(true));
        assert_eq!(init_security.run_as_user, Some(0));

        assert_eq!(pod.containers.len(), 1);
        let gateway = &pod.containers[0];
        assert_eq!(gateway.name, "rgw");
        assert_eq!(gateway.command, Some(vec!["radosgw-sqlite".to_string()]));
        assert_eq!(gateway.ports.as_ref().unwrap()[0].container_port, 7480);
        assert_eq!(
            env_names(gateway),
            vec![
                "CONTAINER_IMAGE",
                "POD_NAME",
                "POD_NAMESPACE",
                "NODE_NAME",
                "CEPH_LIB",
                "CEPH_ARGS"
            ]
        );

        let volume = &pod.volumes.unwrap()[0];
        assert_eq!(volume.name, DATA_VOLUME);
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "rgw-store-ns"
        );
    }

    #[test]
    fn test_gateway_identity_is_stable_across_builds() {
        let obj = object_store("ns", "store");
        let config = OperatorConfig::default();
        let args = |d: Deployment| d.spec.unwrap().template.spec.unwrap().containers[0]
            .args
            .clone()
            .unwrap();

        let first = args(build_deployment(&obj, &config, None, "http://a:1"));
        let second = args(build_deployment(&obj, &config, None, "http://a:1"));
        assert_eq!(first, second);
        assert!(first.contains(&format!("--id={}", stable_hash("rgw-store-ns"))));
        assert!(first.contains(&"--host=$(POD_NAME)".to_string()));
    }

    #[test]
    fn test_joiner_gets_zone_create_init_container() {
        let obj = joiner_store("ns", "site-b", "site-a-realm-token");
        let config = OperatorConfig::default();
        let deployment = build_deployment(
            &obj,
            &config,
            Some("site-a-realm-token"),
            "http://10.0.0.2:8080",
        );
        let init = deployment
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .init_containers
            .unwrap();

        assert_eq!(init.len(), 2);
        let zone = &init[1];
        assert_eq!(zone.name, ZONE_CONTAINER);
        assert_eq!(zone.command, Some(vec!["rgwam-sqlite".to_string()]));
        assert_eq!(
            zone.args.as_ref().unwrap(),
            &vec![
                "zone".to_string(),
                "create".to_string(),
                "--zone=site-b-ns".to_string(),
                "--realm-token=$(REALM_TOKEN)".to_string(),
                "--endpoints=http://10.0.0.2:8080".to_string(),
            ]
        );

        let token_env = zone
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == REALM_TOKEN_ENV)
            .unwrap();
        assert!(token_env.value.is_none());
        let secret_ref = token_env
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(secret_ref.name.as_deref(), Some("site-a-realm-token"));
        assert_eq!(secret_ref.key, "token");
    }

    #[tokio::test]
    async fn test_deployment_converges_once() {
        let store = FakeStore::new();
        let obj = object_store("ns", "store");
        let config = OperatorConfig::default();

        let first = ensure_deployment(&store, &obj, &config, None, "http://a:1")
            .await
            .unwrap();
        let second = ensure_deployment(&store, &obj, &config, None, "http://a:1")
            .await
            .unwrap();
        let third = ensure_deployment(&store, &obj, &config, None, "http://b:2")
            .await
            .unwrap();

        assert_eq!(first, Operation::Created);
        assert_eq!(second, Operation::Unchanged);
        // the endpoint only matters to joiners
        assert_eq!(third, Operation::Unchanged);
        assert_eq!(store.count_calls("replace Deployment"), 0);
    }

    #[tokio::test]
    async fn test_image_change_updates_deployment() {
        let store = FakeStore::new();
        let mut obj = object_store("ns", "store");
        let config = OperatorConfig::default();
        ensure_deployment(&store, &obj, &config, None, "http://a:1")
            .await
            .unwrap();

        obj.spec.image = "quay.io/ceph/ceph:rgw-sqlite-v2".to_string();
        let op = ensure_deployment(&store, &obj, &config, None, "http://a:1")
            .await
            .unwrap();

        assert_eq!(op, Operation::Updated);
        let live: Deployment = store.object("ns", "rgw-store-ns").unwrap();
        let pod = live.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("quay.io/ceph/ceph:rgw-sqlite-v2")
        );
    }

    // -----------------------------------------------------------------------
    // Zone join Job and realm token Secret
    // -----------------------------------------------------------------------

    #[test]
    fn test_zone_job_pods_are_not_gateway_pods() {
        let obj = joiner_store("ns", "site-b", "token-secret");
        let job = build_zone_job(&obj, &OperatorConfig::default(), "token-secret", "http://x:1");
        let spec = job.spec.unwrap();
        let labels = spec.template.metadata.unwrap().labels.unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("rgw-site-b-ns-zone-join"));
        assert_eq!(labels.get("app").map(String::as_str), Some(ZONE_JOB_APP));
        assert!(!labels.contains_key(OWNER_LABEL));
        assert_eq!(spec.backoff_limit, Some(600));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));
        assert_eq!(pod.containers[0].name, ZONE_JOB_APP);
        assert!(env_names(&pod.containers[0]).contains(&REALM_TOKEN_ENV.to_string()));
    }

    #[tokio::test]
    async fn test_delete_zone_job_tolerates_absence() {
        let store = FakeStore::new();
        let obj = joiner_store("ns", "site-b", "token-secret");
        assert!(delete_zone_job(&store, &obj).await.is_ok());

        store.insert(build_zone_job(&obj, &OperatorConfig::default(), "token-secret", "http://x:1"));
        assert!(delete_zone_job(&store, &obj).await.is_ok());
        assert!(store.object::<Job>("ns", "rgw-site-b-ns-zone-join").is_none());
    }

    #[tokio::test]
    async fn test_realm_token_secret_is_created_once() {
        let store = FakeStore::new();
        let obj = object_store("ns", "site-a");

        create_realm_token_secret(&store, &obj, "dG9rZW4=").await.unwrap();
        create_realm_token_secret(&store, &obj, "b3RoZXI=").await.unwrap();

        let secret: Secret = store.object("ns", "site-a-realm-token").unwrap();
        assert_eq!(secret.data.unwrap()["token"].0, b"dG9rZW4=".to_vec());
        assert_eq!(
            secret.metadata.owner_references.unwrap()[0].uid,
            "site-a-uid"
        );
    }
}
