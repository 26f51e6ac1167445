//! Typed access to the cluster state the controllers read and write.
//!
//! Engines are generic over [`ObjectStore`] so they can be driven by a live
//! [`kube::Client`] or by the in-memory store of the test fixtures.

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    api::{ListParams, Patch, PatchParams},
    Api, Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, Result};

/// A namespaced object the store can read and write
pub trait Object:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

/// A cluster-scoped object the store can read
pub trait ClusterObject:
    Resource<Scope = ClusterResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K>;

    async fn list<K: Object>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>>;

    async fn get_cluster<K: ClusterObject>(&self, name: &str) -> Result<K>;

    async fn list_cluster<K: ClusterObject>(&self) -> Result<Vec<K>>;

    /// Apply a json merge patch to the object
    async fn merge_patch<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// Apply a json merge patch to the status subresource
    async fn merge_patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    async fn get_opt<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        match self.get(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn not_found<K: Resource<DynamicType = ()>>(name: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        },
        e => Error::KubeError(e),
    }
}

#[async_trait]
impl ObjectStore for Client {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K> {
        let api: Api<K> = Api::namespaced(self.clone(), namespace);
        api.get(name).await.map_err(|e| not_found::<K>(name, e))
    }

    async fn list<K: Object>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let api: Api<K> = Api::namespaced(self.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&params).await?.items)
    }

    async fn get_cluster<K: ClusterObject>(&self, name: &str) -> Result<K> {
        let api: Api<K> = Api::all(self.clone());
        api.get(name).await.map_err(|e| not_found::<K>(name, e))
    }

    async fn list_cluster<K: ClusterObject>(&self) -> Result<Vec<K>> {
        let api: Api<K> = Api::all(self.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn merge_patch<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| not_found::<K>(name, e))?;
        Ok(())
    }

    async fn merge_patch_status<K: Object>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.clone(), namespace);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| not_found::<K>(name, e))?;
        Ok(())
    }
}
