use std::{future::Future, time::Duration};

use kube::{Resource, ResourceExt};

use super::error::Error;

const CONFLICT_RETRY_STEPS: usize = 5;
const CONFLICT_RETRY_BASE: Duration = Duration::from_millis(10);

pub fn get_namespace<T: Resource<DynamicType = ()>>(resource: &T) -> Result<String, Error> {
    resource.namespace().ok_or(Error::GetNamespace)
}

/// Run a read-modify-write operation against the apiserver, retrying on
/// optimistic concurrency conflicts with bounded exponential backoff.
/// The closure must re-fetch the object so every attempt works on a
/// fresh resource version.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut delay = CONFLICT_RETRY_BASE;
    for _ in 1..CONFLICT_RETRY_STEPS {
        match op().await {
            Err(kube::Error::Api(e)) if e.code == 409 => {
                tracing::info!(reason = e.reason, "Conflict on write, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
    op().await
}
