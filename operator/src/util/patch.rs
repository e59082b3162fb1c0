use super::{retry::retry_conflict, Error, MANAGER_NAME};
use kube::{
    api::{Patch, PatchParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;

/// Computes a JSON Patch between `instance` and the result of applying `f`
/// to a clone of it, then applies it with server-side-apply semantics.
/// Generalized to the whole object rather than just a status subresource,
/// since taints/labels/cordon live on `.spec`/`.metadata`.
pub async fn patch_object<T>(client: Client, instance: &T, f: impl FnOnce(&mut T)) -> Result<T, Error>
where
    T: Clone + Resource + Serialize + DeserializeOwned + Debug + Resource<Scope = kube::core::ClusterResourceScope>,
    <T as Resource>::DynamicType: Default,
{
    retry_conflict(|| async {
        let api: Api<T> = Api::all(client.clone());
        let current = api.get(&instance.name_any()).await?;
        let mut modified = current.clone();
        f(&mut modified);
        let patch = json_patch::diff(
            &serde_json::to_value(&current)?,
            &serde_json::to_value(&modified)?,
        );
        let patched = api
            .patch(
                &instance.name_any(),
                &PatchParams::apply(MANAGER_NAME),
                &Patch::Json::<T>(patch),
            )
            .await?;
        Ok(patched)
    })
    .await
}
