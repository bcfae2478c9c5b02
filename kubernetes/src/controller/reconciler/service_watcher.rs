use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    api::{ListParams, PostParams},
    core::ObjectMeta,
    runtime::{
        controller::Action,
        events::{Event, EventType},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector, watcher, Controller, WatchStreamExt,
    },
    Api, Client, ResourceExt,
};

use kubevip_ipam::manager::PoolRegistry;

use crate::{
    context::{error_policy, ContextWith, Ctx, State},
    controller::error::Error,
    controller::reconciler::discovery,
    util::{get_namespace, retry_on_conflict},
};

// Annotation carrying the allocated addresses, plural for dual-stack.
// Example: kube-vip.io/loadbalancerIPs: 10.1.2.3,fd00::100
pub const LOADBALANCER_IPS_ANNOTATION: &str = "kube-vip.io/loadbalancerIPs";

// Annotation advertising the resolved service interface.
pub const SERVICE_INTERFACE_ANNOTATION: &str = "kube-vip.io/serviceInterface";

// Label marking a service as owned by this controller.
pub const IMPLEMENTATION_LABEL_KEY: &str = "implementation";
pub const IMPLEMENTATION_LABEL_VALUE: &str = "kube-vip";

// Label written by older releases, removed during migration.
pub const LEGACY_IPAM_ADDRESS_LABEL_KEY: &str = "ipam-address";

pub const SERVICE_FINALIZER: &str = "service.kubernetes.io/load-balancer-cleanup";

/// Shared state of the load balancer class controller.
#[derive(Debug, Clone)]
pub struct LoadBalancerContext {
    pub registry: Arc<PoolRegistry>,
    pub config_map: String,
    pub config_namespace: String,
    pub load_balancer_class: String,
}

#[tracing::instrument(skip_all, fields(trace_id))]
pub async fn reconciler(
    svc: Arc<Service>,
    ctx: Arc<ContextWith<LoadBalancerContext>>,
) -> Result<Action, Error> {
    if !wants_load_balancer(&svc, &ctx.component.load_balancer_class) {
        return Ok(Action::await_change());
    }

    let _timer = ctx.metrics().count_and_measure(svc.as_ref());

    let ns = get_namespace::<Service>(&svc).map_err(Error::KubeLibrary)?;
    let services = Api::<Service>::namespaced(ctx.client().clone(), &ns);

    let fin = finalizer(&services, SERVICE_FINALIZER, svc.clone(), |event| async {
        match event {
            FinalizerEvent::Apply(svc) => reconcile(&services, &svc, ctx.clone()).await,
            FinalizerEvent::Cleanup(svc) => cleanup(&services, &svc, ctx.clone()).await,
        }
    });

    match AssertUnwindSafe(fin).catch_unwind().await {
        Ok(res) => {
            let res = res.map_err(|e| Error::Finalizer(Box::new(e)));
            if let Err(e) = res.as_ref() {
                report_sync_error(&ctx, svc.as_ref(), e).await;
            }
            res
        }
        Err(payload) => {
            // The key is dropped; the next service event re-enqueues it.
            tracing::error!(
                name = svc.name_any(),
                namespace = ns,
                panic = panic_message(payload.as_ref()),
                "Recovered from a panicking reconcile"
            );
            Ok(Action::await_change())
        }
    }
}

#[tracing::instrument(skip_all)]
async fn reconcile(
    api: &Api<Service>,
    svc: &Service,
    ctx: Arc<ContextWith<LoadBalancerContext>>,
) -> Result<Action, Error> {
    let ns = get_namespace::<Service>(svc).map_err(Error::KubeLibrary)?;

    tracing::info!(name = svc.name_any(), namespace = ns, "Reconcile Service");

    let legacy_ip = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.load_balancer_ip.clone())
        .unwrap_or_default();
    let annotated = svc
        .annotations()
        .get(LOADBALANCER_IPS_ANNOTATION)
        .cloned()
        .unwrap_or_default();

    // Legacy services carry the address in spec.loadBalancerIP only.
    // Copy it into the annotation and drop the old label.
    if !legacy_ip.is_empty() && annotated.is_empty() {
        tracing::warn!(
            name = svc.name_any(),
            namespace = ns,
            "spec.loadBalancerIP is defined but the loadbalancerIPs annotation is not, migrating the legacy service"
        );
        let name = svc.name_any();
        retry_on_conflict(|| {
            let api = api.clone();
            let name = name.clone();
            let ip = legacy_ip.clone();
            async move {
                let mut recent = api.get(&name).await?;
                recent
                    .annotations_mut()
                    .insert(LOADBALANCER_IPS_ANNOTATION.to_string(), ip);
                if let Some(labels) = recent.metadata.labels.as_mut() {
                    labels.remove(LEGACY_IPAM_ADDRESS_LABEL_KEY);
                }
                api.replace(&name, &PostParams::default(), &recent).await
            }
        })
        .await
        .map_err(Error::Kube)?;
        return Ok(Action::await_change());
    }

    // A service with a populated annotation keeps its addresses; it only
    // needs the ownership label so it is visible in in-use scans.
    if !annotated.is_empty() {
        if svc.labels().get(IMPLEMENTATION_LABEL_KEY).map(String::as_str)
            != Some(IMPLEMENTATION_LABEL_VALUE)
        {
            tracing::info!(
                name = svc.name_any(),
                namespace = ns,
                addresses = annotated,
                "Service carries pre-defined addresses"
            );
            let name = svc.name_any();
            retry_on_conflict(|| {
                let api = api.clone();
                let name = name.clone();
                async move {
                    let mut recent = api.get(&name).await?;
                    recent.labels_mut().insert(
                        IMPLEMENTATION_LABEL_KEY.to_string(),
                        IMPLEMENTATION_LABEL_VALUE.to_string(),
                    );
                    api.replace(&name, &PostParams::default(), &recent).await
                }
            })
            .await
            .map_err(Error::Kube)?;
        }
        return Ok(Action::await_change());
    }

    publish_event(
        &ctx,
        svc,
        EventType::Normal,
        "EnsuringLoadBalancer",
        "Ensuring load balancer",
    )
    .await;

    // The configuration document is authoritative input; create an empty
    // one when it is missing and carry on.
    let config_maps =
        Api::<ConfigMap>::namespaced(ctx.client().clone(), &ctx.component.config_namespace);
    let cm = match config_maps
        .get_opt(&ctx.component.config_map)
        .await
        .map_err(Error::Kube)?
    {
        Some(cm) => cm,
        None => {
            tracing::warn!(
                name = ctx.component.config_map,
                namespace = ctx.component.config_namespace,
                "Unable to retrieve the IPAM ConfigMap, creating an empty one"
            );
            let cm = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(ctx.component.config_map.clone()),
                    namespace: Some(ctx.component.config_namespace.clone()),
                    ..Default::default()
                },
                ..Default::default()
            };
            config_maps
                .create(&PostParams::default(), &cm)
                .await
                .map_err(Error::Kube)?
        }
    };

    let selection = match discovery::discover_pool(&cm, &ns, &ctx.component.config_map) {
        Ok(selection) => selection,
        Err(Error::NoPool) => {
            // A missing pool is a configuration fault; wait for the
            // document to change instead of looping tightly.
            tracing::warn!(
                name = svc.name_any(),
                namespace = ns,
                "No address pool is declared for this namespace"
            );
            return Ok(Action::requeue(Duration::from_secs(ctx.interval())));
        }
        Err(e) => return Err(e),
    };

    // Collect the owned services the pool is scoped over.
    let scope = if selection.global {
        Api::<Service>::all(ctx.client().clone())
    } else {
        Api::<Service>::namespaced(ctx.client().clone(), &ns)
    };
    let params = ListParams::default().labels(&format!(
        "{IMPLEMENTATION_LABEL_KEY}={IMPLEMENTATION_LABEL_VALUE}"
    ));
    let owned = scope.list(&params).await.map_err(Error::Kube)?;

    let (in_use, port_map) =
        discovery::map_implemented_services(&owned.items, selection.allow_share)?;
    let preferred_v4 = if selection.allow_share {
        discovery::discover_shared_vip(svc, &port_map)
    } else {
        None
    };

    let alloc_config = discovery::allocation_config(&cm);
    let ip_families = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ip_families.clone())
        .unwrap_or_default();
    let vips = {
        let mut registry = ctx
            .component
            .registry
            .inner
            .lock()
            .map_err(|_| Error::FailedToGetLock)?;
        discovery::discover_vips(
            &mut registry,
            &ns,
            &selection.pool,
            preferred_v4,
            &in_use,
            &alloc_config,
            svc.spec
                .as_ref()
                .and_then(|spec| spec.ip_family_policy.as_deref()),
            &ip_families,
        )?
    };

    let interface = if vips.is_empty() {
        None
    } else {
        discovery::discover_interface(&cm, &ns)
    };

    let first = vips.split(',').next().unwrap_or_default().to_string();
    let name = svc.name_any();
    tracing::info!(
        name = name,
        namespace = ns,
        addresses = vips,
        interface = interface.clone().unwrap_or_default(),
        "Updating the service with load balancer addresses"
    );
    retry_on_conflict(|| {
        let api = api.clone();
        let name = name.clone();
        let vips = vips.clone();
        let first = first.clone();
        let interface = interface.clone();
        async move {
            let mut recent = api.get(&name).await?;
            recent.labels_mut().insert(
                IMPLEMENTATION_LABEL_KEY.to_string(),
                IMPLEMENTATION_LABEL_VALUE.to_string(),
            );
            recent
                .annotations_mut()
                .insert(LOADBALANCER_IPS_ANNOTATION.to_string(), vips);
            if let Some(interface) = interface {
                recent
                    .annotations_mut()
                    .insert(SERVICE_INTERFACE_ANNOTATION.to_string(), interface);
            }
            // Kept until every consumer recognizes the annotation.
            if let Some(spec) = recent.spec.as_mut() {
                spec.load_balancer_ip = Some(first);
            }
            api.replace(&name, &PostParams::default(), &recent).await
        }
    })
    .await
    .map_err(Error::Kube)?;

    publish_event(
        &ctx,
        svc,
        EventType::Normal,
        "EnsuredLoadBalancer",
        "Ensured load balancer",
    )
    .await;

    Ok(Action::await_change())
}

#[tracing::instrument(skip_all)]
async fn cleanup(
    _api: &Api<Service>,
    svc: &Service,
    ctx: Arc<ContextWith<LoadBalancerContext>>,
) -> Result<Action, Error> {
    let ns = get_namespace::<Service>(svc).map_err(Error::KubeLibrary)?;
    tracing::info!(name = svc.name_any(), namespace = ns, "Cleanup Service");

    // Addresses are released by their disappearance from the
    // annotation-derived in-use set; dropping the finalizer is the only
    // terminal action.
    publish_event(
        &ctx,
        svc,
        EventType::Normal,
        "LoadBalancerDeleted",
        "Deleted load balancer",
    )
    .await;

    Ok(Action::await_change())
}

pub async fn run(state: State, interval: u64, component: LoadBalancerContext) {
    let client = Client::try_default()
        .await
        .expect("Failed to create kube client");

    let services = Api::<Service>::all(client.clone());

    tracing::info!(
        class = component.load_balancer_class,
        "Start Service watcher"
    );

    let (reader, writer) = reflector::store::<Service>();
    let stream = reflector::reflector(
        writer,
        watcher::watcher(services, watcher::Config::default().any_semantic()).default_backoff(),
    )
    .applied_objects()
    .predicate_filter(load_balancer_attributes);

    Controller::for_stream(stream, reader)
        .shutdown_on_signal()
        .run(
            reconciler,
            error_policy::<Service, Error, ContextWith<LoadBalancerContext>>,
            state.to_context_with(client, interval, component),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

/// Only services of type LoadBalancer whose class matches exactly are
/// handled; everything else belongs to the in-tree controller.
pub fn wants_load_balancer(svc: &Service, load_balancer_class: &str) -> bool {
    match svc.spec.as_ref() {
        Some(spec) => {
            spec.type_.as_deref() == Some("LoadBalancer")
                && spec.load_balancer_class.as_deref() == Some(load_balancer_class)
        }
        None => false,
    }
}

pub fn needs_cleanup(svc: &Service) -> bool {
    svc.finalizers().iter().any(|f| f == SERVICE_FINALIZER)
        && svc.metadata.deletion_timestamp.is_some()
}

/// Watch predicate over the attributes a load balancer cares about.
/// Events that do not change this hash are not enqueued. Deletions are
/// absorbed here as well: the tombstone still carries the finalizer, so
/// the needs-cleanup transition changes the hash.
pub fn load_balancer_attributes(svc: &Service) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(spec) = svc.spec.as_ref() {
        if let Some(ports) = spec.ports.as_ref() {
            for port in ports.iter() {
                port.name.hash(&mut hasher);
                port.protocol.hash(&mut hasher);
                port.port.hash(&mut hasher);
                port.node_port.hash(&mut hasher);
                match port.target_port.as_ref() {
                    Some(IntOrString::Int(i)) => i.hash(&mut hasher),
                    Some(IntOrString::String(s)) => s.hash(&mut hasher),
                    None => 0u8.hash(&mut hasher),
                }
                port.app_protocol.hash(&mut hasher);
            }
        }
        spec.session_affinity.hash(&mut hasher);
        spec.session_affinity_config
            .as_ref()
            .and_then(|c| c.client_ip.as_ref())
            .and_then(|c| c.timeout_seconds)
            .hash(&mut hasher);
        spec.load_balancer_source_ranges.hash(&mut hasher);
        spec.external_ips.hash(&mut hasher);
        spec.external_traffic_policy.hash(&mut hasher);
        spec.health_check_node_port.hash(&mut hasher);
        spec.load_balancer_ip.hash(&mut hasher);
        // Families can be added or removed but never reordered, so the
        // cardinality is enough.
        spec.ip_families.as_ref().map(|f| f.len()).hash(&mut hasher);
    }
    svc.metadata.annotations.hash(&mut hasher);
    svc.metadata.uid.hash(&mut hasher);
    needs_cleanup(svc).hash(&mut hasher);
    Some(hasher.finish())
}

async fn publish_event(
    ctx: &Arc<ContextWith<LoadBalancerContext>>,
    svc: &Service,
    type_: EventType,
    reason: &str,
    note: &str,
) {
    let recorder = ctx
        .diagnostics()
        .read()
        .await
        .recorder(ctx.client().clone(), svc);
    if let Err(e) = recorder
        .publish(Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: reason.to_string(),
            secondary: None,
        })
        .await
    {
        tracing::warn!(error = ?e, reason, "Failed to publish an event");
    }
}

async fn report_sync_error(
    ctx: &Arc<ContextWith<LoadBalancerContext>>,
    svc: &Service,
    error: &Error,
) {
    publish_event(
        ctx,
        svc,
        EventType::Warning,
        "SyncLoadBalancerFailed",
        &format!("Error syncing load balancer: {error}"),
    )
    .await;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use rstest::rstest;

    use crate::config::DEFAULT_LOAD_BALANCER_CLASS;
    use crate::fixture::reconciler::{test_svc, test_svc_with_ports};

    #[rstest(
        mutate,
        class,
        expected,
        case(None, DEFAULT_LOAD_BALANCER_CLASS, true),
        case(None, "acme.io/other-class", false),
        case(
            Some(Box::new(|svc: &mut Service| {
                svc.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_string());
            }) as Box<dyn Fn(&mut Service)>),
            DEFAULT_LOAD_BALANCER_CLASS,
            false,
        ),
        case(
            Some(Box::new(|svc: &mut Service| {
                svc.spec.as_mut().unwrap().load_balancer_class = None;
            }) as Box<dyn Fn(&mut Service)>),
            DEFAULT_LOAD_BALANCER_CLASS,
            false,
        ),
        case(
            Some(Box::new(|svc: &mut Service| {
                svc.spec = None;
            }) as Box<dyn Fn(&mut Service)>),
            DEFAULT_LOAD_BALANCER_CLASS,
            false,
        ),
    )]
    fn works_wants_load_balancer(
        mutate: Option<Box<dyn Fn(&mut Service)>>,
        class: &str,
        expected: bool,
    ) {
        let mut svc = test_svc();
        if let Some(mutate) = mutate {
            mutate(&mut svc);
        }
        assert_eq!(wants_load_balancer(&svc, class), expected);
    }

    #[test]
    fn works_needs_cleanup() {
        let mut svc = test_svc();
        assert!(!needs_cleanup(&svc));

        svc.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(needs_cleanup(&svc));

        svc.metadata.finalizers = None;
        assert!(!needs_cleanup(&svc));
    }

    #[test]
    fn works_load_balancer_attributes_is_stable() {
        let svc = test_svc();
        assert_eq!(
            load_balancer_attributes(&svc),
            load_balancer_attributes(&svc.clone())
        );
    }

    #[rstest(
        mutate,
        case(Box::new(|svc: &mut Service| {
            svc.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].port = 443;
        }) as Box<dyn Fn(&mut Service)>),
        case(Box::new(|svc: &mut Service| {
            svc.metadata.annotations = Some(std::collections::BTreeMap::from([(
                LOADBALANCER_IPS_ANNOTATION.to_string(),
                "10.0.0.1".to_string(),
            )]));
        }) as Box<dyn Fn(&mut Service)>),
        case(Box::new(|svc: &mut Service| {
            svc.spec.as_mut().unwrap().external_traffic_policy = Some("Local".to_string());
        }) as Box<dyn Fn(&mut Service)>),
        case(Box::new(|svc: &mut Service| {
            svc.metadata.uid = Some("d9e1e43f".to_string());
        }) as Box<dyn Fn(&mut Service)>),
        case(Box::new(|svc: &mut Service| {
            svc.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }) as Box<dyn Fn(&mut Service)>),
        case(Box::new(|svc: &mut Service| {
            svc.spec.as_mut().unwrap().ip_families =
                Some(vec!["IPv4".to_string(), "IPv6".to_string()]);
        }) as Box<dyn Fn(&mut Service)>),
    )]
    fn works_load_balancer_attributes_changes(mutate: Box<dyn Fn(&mut Service)>) {
        let svc = test_svc();
        let mut changed = svc.clone();
        mutate(&mut changed);
        assert_ne!(
            load_balancer_attributes(&svc),
            load_balancer_attributes(&changed)
        );
    }

    #[test]
    fn works_load_balancer_attributes_ignores_status() {
        let svc = test_svc_with_ports("test-svc", &[80, 443]);
        let mut changed = svc.clone();
        changed.status = Some(Default::default());
        changed.metadata.resource_version = Some("12345".to_string());
        assert_eq!(
            load_balancer_attributes(&svc),
            load_balancer_attributes(&changed)
        );
    }
}
