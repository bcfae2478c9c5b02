pub mod reconciler {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec};
    use kube::core::ObjectMeta;

    use crate::controller::reconciler::service_watcher::{
        IMPLEMENTATION_LABEL_KEY, IMPLEMENTATION_LABEL_VALUE, LOADBALANCER_IPS_ANNOTATION,
        SERVICE_FINALIZER,
    };
    use crate::config::DEFAULT_LOAD_BALANCER_CLASS;

    pub fn test_config_map(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("kubevip".to_string()),
                namespace: Some("kube-system".to_string()),
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

    pub fn test_svc() -> Service {
        test_svc_with_ports("test-svc", &[80])
    }

    pub fn test_svc_with_ports(name: &str, ports: &[i32]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                finalizers: Some(vec![SERVICE_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                load_balancer_class: Some(DEFAULT_LOAD_BALANCER_CLASS.to_string()),
                ports: Some(
                    ports
                        .iter()
                        .map(|p| ServicePort {
                            port: *p,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// A service that already carries an allocation: labelled as
    /// controller owned and annotated with its addresses.
    pub fn test_svc_with_allocation(name: &str, addrs: &str, ports: &[i32]) -> Service {
        let mut svc = test_svc_with_ports(name, ports);
        svc.metadata.labels = Some(BTreeMap::from([(
            IMPLEMENTATION_LABEL_KEY.to_string(),
            IMPLEMENTATION_LABEL_VALUE.to_string(),
        )]));
        svc.metadata.annotations = Some(BTreeMap::from([(
            LOADBALANCER_IPS_ANNOTATION.to_string(),
            addrs.to_string(),
        )]));
        svc
    }

    pub fn test_svc_dual_stack(policy: &str, families: &[&str]) -> Service {
        let mut svc = test_svc();
        if let Some(spec) = svc.spec.as_mut() {
            spec.ip_family_policy = Some(policy.to_string());
            spec.ip_families = Some(families.iter().map(|f| f.to_string()).collect());
        }
        svc
    }
}

pub async fn test_trace() {
    kubevip_trace::init::prepare_tracing(kubevip_trace::init::TraceConfig {
        level: "info".to_string(),
        format: String::new(),
        file: None,
    })
    .await;
}
