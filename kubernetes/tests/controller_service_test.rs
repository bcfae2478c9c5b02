use std::sync::Arc;

use common::{cleanup_kind, setup_kind};

use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::{
    api::{DeleteParams, PostParams},
    Api, Client, ResourceExt,
};
use kubevip_ipam::manager::PoolRegistry;
use kubevip_kubernetes::{
    config::DEFAULT_LOAD_BALANCER_CLASS,
    context::State,
    controller::reconciler::service_watcher::{
        reconciler, LoadBalancerContext, IMPLEMENTATION_LABEL_KEY, IMPLEMENTATION_LABEL_VALUE,
        LOADBALANCER_IPS_ANNOTATION,
    },
    fixture::{
        reconciler::{test_config_map, test_svc},
        test_trace,
    },
};

mod common;

#[tokio::test]
#[ignore = "use kind cluster"]
async fn integration_test_service_watcher() {
    tracing::info!("Setting up a kind cluster");
    setup_kind();

    test_trace().await;

    tracing::info!("Getting kube client");
    let client = Client::try_default().await.unwrap();
    let registry = Arc::new(PoolRegistry::new());
    let ctx = State::default().to_context_with(
        client.clone(),
        30,
        LoadBalancerContext {
            registry: registry.clone(),
            config_map: "kubevip".to_string(),
            config_namespace: "kube-system".to_string(),
            load_balancer_class: DEFAULT_LOAD_BALANCER_CLASS.to_string(),
        },
    );

    tracing::info!("Creating the IPAM ConfigMap");
    let cm_api = Api::<ConfigMap>::namespaced(client.clone(), "kube-system");
    let cm = test_config_map(&[("cidr-global", "10.0.0.0/24")]);
    cm_api.create(&PostParams::default(), &cm).await.unwrap();

    tracing::info!("Creating a LoadBalancer Service");
    let svc_api = Api::<Service>::namespaced(client.clone(), "default");
    let mut svc = test_svc();
    svc.metadata.finalizers = None;
    svc_api.create(&PostParams::default(), &svc).await.unwrap();

    tracing::info!("Reconciling the Service to attach the finalizer");
    let applied = svc_api.get(&svc.name_any()).await.unwrap();
    reconciler(Arc::new(applied), ctx.clone()).await.unwrap();

    tracing::info!("Reconciling the Service to allocate an address");
    let applied = svc_api.get(&svc.name_any()).await.unwrap();
    reconciler(Arc::new(applied), ctx.clone()).await.unwrap();

    let reconciled = svc_api.get(&svc.name_any()).await.unwrap();
    assert_eq!(
        reconciled.annotations().get(LOADBALANCER_IPS_ANNOTATION),
        Some(&"10.0.0.1".to_string())
    );
    assert_eq!(
        reconciled.labels().get(IMPLEMENTATION_LABEL_KEY),
        Some(&IMPLEMENTATION_LABEL_VALUE.to_string())
    );
    assert_eq!(
        reconciled.spec.as_ref().unwrap().load_balancer_ip,
        Some("10.0.0.1".to_string())
    );

    tracing::info!("Reconciling again must not write");
    reconciler(Arc::new(reconciled.clone()), ctx.clone())
        .await
        .unwrap();
    let unchanged = svc_api.get(&reconciled.name_any()).await.unwrap();
    assert_eq!(
        unchanged.metadata.resource_version,
        reconciled.metadata.resource_version
    );

    tracing::info!("Cleaning up the Service");
    svc_api
        .delete(&reconciled.name_any(), &DeleteParams::default())
        .await
        .unwrap();

    cleanup_kind();
}
