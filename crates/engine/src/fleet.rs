//! Cluster membership and server maintenance.
//!
//! A cluster owns its member list; each server keeps a back-reference in
//! `cluster_id`. Every operation here updates both sides. The cluster is
//! written first, re-read and re-applied when its version moves, and the
//! server back-references follow. A failed server write rolls the
//! membership change back.

use std::sync::Arc;

use strata_core::{Cluster, ClusterMember, DomainError, Repository, Server, Versioned};
use strata_storage::EntityStore;
use tracing::{debug, info, warn};

use crate::playbook::ServerListPolicy;

/// Bounded optimistic retries for membership writes.
const MAX_MEMBERSHIP_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct Fleet {
    servers: Repository<Server>,
    clusters: Repository<Cluster>,
}

impl Fleet {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            servers: Repository::new(store.clone()),
            clusters: Repository::new(store),
        }
    }

    pub fn servers(&self) -> &Repository<Server> {
        &self.servers
    }

    pub fn clusters(&self) -> &Repository<Cluster> {
        &self.clusters
    }

    /// Live servers for `ids`, in the given order. Any id that is missing or
    /// deleted fails the whole lookup.
    pub async fn load_servers(&self, ids: &[String]) -> Result<Vec<Versioned<Server>>, DomainError> {
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self.servers.find_live(id).await? {
                Some(server) => found.push(server),
                None => missing.push(id.clone()),
            }
        }
        if missing.is_empty() {
            Ok(found)
        } else {
            Err(DomainError::UnknownServers(missing))
        }
    }

    pub async fn live_cluster(&self, id: &str) -> Result<Versioned<Cluster>, DomainError> {
        self.clusters
            .find_live(id)
            .await?
            .ok_or_else(|| DomainError::UnknownCluster(id.to_string()))
    }

    pub async fn create_cluster(
        &self,
        name: &str,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Cluster>, DomainError> {
        let cluster = self
            .clusters
            .create(strata_core::new_id(), Cluster::new(name), initiator_id)
            .await?;
        info!(cluster_id = %cluster.id, name, "cluster created");
        Ok(cluster)
    }

    /// Rename a cluster. Membership only changes through playbook runs.
    pub async fn update_cluster(
        &self,
        edited: &Versioned<Cluster>,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Cluster>, DomainError> {
        let current = self.clusters.get(&edited.id).await?;
        if !current
            .data
            .server_ids()
            .eq(edited.data.server_ids())
        {
            return Err(DomainError::CannotUpdateImmutableField("members".into()));
        }
        let saved = self.clusters.save(edited, initiator_id).await?;
        info!(
            cluster_id = %saved.id,
            version = saved.version,
            initiator = initiator_id.unwrap_or("-"),
            "cluster updated"
        );
        Ok(saved)
    }

    pub async fn delete_cluster(
        &self,
        id: &str,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Cluster>, DomainError> {
        let current = self.clusters.get(id).await?;
        if !current.data.members.is_empty() {
            warn!(cluster_id = id, "cannot delete cluster with servers");
            return Err(DomainError::CannotDeleteClusterWithServers(id.to_string()));
        }
        let deleted = self.clusters.delete(&current, initiator_id).await?;
        info!(cluster_id = id, "cluster deleted");
        Ok(deleted)
    }

    /// Attach servers to a cluster. Servers already in another cluster are
    /// refused as a group; nothing is attached in that case.
    ///
    /// The cluster is saved first, then each server's back-reference. If a
    /// server cannot be attached, the servers this call added are detached
    /// again and the error is returned.
    pub async fn add_servers(
        &self,
        cluster_id: &str,
        server_ids: &[String],
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Cluster>, DomainError> {
        self.live_cluster(cluster_id).await?;
        let servers = self.load_servers(server_ids).await?;
        ServerListPolicy::NotInOtherCluster.check(cluster_id, &servers)?;

        let (saved, added) = self
            .mutate_cluster(cluster_id, initiator_id, |cluster| {
                let added: Vec<String> = servers
                    .iter()
                    .filter(|server| !cluster.contains(&server.id))
                    .map(|server| server.id.clone())
                    .collect();
                cluster.add_servers(&servers);
                Ok(added)
            })
            .await?;

        for (done, server) in servers.iter().enumerate() {
            if let Err(err) = self.attach_server(&server.id, cluster_id, initiator_id).await {
                warn!(
                    cluster_id,
                    server_id = %server.id,
                    error = %err,
                    "cannot attach server; rolling back"
                );
                self.undo_attach(cluster_id, &added, &servers[..done], initiator_id)
                    .await;
                return Err(err);
            }
        }
        info!(
            cluster_id,
            servers = ?server_ids,
            version = saved.version,
            "servers added to cluster"
        );
        Ok(saved)
    }

    /// Detach members from a cluster. Ids that are not members are refused.
    /// Servers deleted in the meantime are only dropped from the list.
    ///
    /// The cluster is saved first, then each server's back-reference is
    /// cleared. Members whose server could not be cleared are restored.
    pub async fn remove_servers(
        &self,
        cluster_id: &str,
        server_ids: &[String],
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Cluster>, DomainError> {
        let ids: Vec<&str> = server_ids.iter().map(String::as_str).collect();
        let (saved, removed) = self
            .mutate_cluster(cluster_id, initiator_id, |cluster| {
                let strangers: Vec<String> = ids
                    .iter()
                    .filter(|id| !cluster.contains(id))
                    .map(|id| id.to_string())
                    .collect();
                if !strangers.is_empty() {
                    return Err(DomainError::PolicyViolation {
                        policy: ServerListPolicy::InThisCluster.to_string(),
                        servers: strangers,
                    });
                }
                let removed: Vec<ClusterMember> = cluster
                    .members
                    .iter()
                    .filter(|member| ids.contains(&member.server_id.as_str()))
                    .cloned()
                    .collect();
                cluster.remove_servers(&ids);
                Ok(removed)
            })
            .await?;

        for (done, id) in ids.iter().enumerate() {
            if let Err(err) = self.detach_server(id, cluster_id, initiator_id).await {
                warn!(cluster_id, server_id = id, error = %err, "cannot detach server; rolling back");
                let pending = &ids[done..];
                let restore: Vec<&ClusterMember> = removed
                    .iter()
                    .filter(|member| pending.contains(&member.server_id.as_str()))
                    .collect();
                let restored = self
                    .mutate_cluster(cluster_id, initiator_id, |cluster| {
                        for member in &restore {
                            if !cluster.contains(&member.server_id) {
                                cluster.members.push((*member).clone());
                            }
                        }
                        Ok(())
                    })
                    .await;
                if let Err(undo) = restored {
                    warn!(cluster_id, error = %undo, "cannot restore cluster members");
                }
                return Err(err);
            }
        }
        info!(
            cluster_id,
            servers = ?server_ids,
            version = saved.version,
            "servers removed from cluster"
        );
        Ok(saved)
    }

    /// Read-modify-write of a live cluster with optimistic retry. `apply`
    /// sees the freshest state on every attempt and may refuse by returning
    /// an error.
    async fn mutate_cluster<T, F>(
        &self,
        cluster_id: &str,
        initiator_id: Option<&str>,
        mut apply: F,
    ) -> Result<(Versioned<Cluster>, T), DomainError>
    where
        F: FnMut(&mut Cluster) -> Result<T, DomainError> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            let mut next = self.live_cluster(cluster_id).await?;
            let out = apply(&mut next.data)?;
            match self.clusters.save(&next, initiator_id).await {
                Ok(saved) => return Ok((saved, out)),
                Err(err @ DomainError::OutdatedVersion { .. })
                    if attempt < MAX_MEMBERSHIP_ATTEMPTS =>
                {
                    debug!(cluster_id, attempt, error = %err, "cluster changed concurrently");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Point a server's back-reference at `cluster_id`. A server that has
    /// meanwhile joined another cluster is refused.
    async fn attach_server(
        &self,
        server_id: &str,
        cluster_id: &str,
        initiator_id: Option<&str>,
    ) -> Result<(), DomainError> {
        let mut attempt = 1;
        loop {
            let mut server = self.servers.get(server_id).await?;
            match server.data.cluster_id.as_deref() {
                Some(current) if current == cluster_id => return Ok(()),
                Some(_) => {
                    return Err(DomainError::PolicyViolation {
                        policy: ServerListPolicy::NotInOtherCluster.to_string(),
                        servers: vec![server_id.to_string()],
                    })
                }
                None => {}
            }
            server.data.cluster_id = Some(cluster_id.to_string());
            match self.servers.save(&server, initiator_id).await {
                Ok(_) => return Ok(()),
                Err(err @ DomainError::OutdatedVersion { .. })
                    if attempt < MAX_MEMBERSHIP_ATTEMPTS =>
                {
                    debug!(server_id, attempt, error = %err, "server changed concurrently");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Clear a server's back-reference if it still points at `cluster_id`.
    /// Deleted servers are skipped.
    async fn detach_server(
        &self,
        server_id: &str,
        cluster_id: &str,
        initiator_id: Option<&str>,
    ) -> Result<(), DomainError> {
        let mut attempt = 1;
        loop {
            let Some(mut server) = self.servers.find_live(server_id).await? else {
                return Ok(());
            };
            if server.data.cluster_id.as_deref() != Some(cluster_id) {
                return Ok(());
            }
            server.data.cluster_id = None;
            match self.servers.save(&server, initiator_id).await {
                Ok(_) => return Ok(()),
                Err(err @ DomainError::OutdatedVersion { .. })
                    if attempt < MAX_MEMBERSHIP_ATTEMPTS =>
                {
                    debug!(server_id, attempt, error = %err, "server changed concurrently");
                    attempt += 1;
                }
                Err(DomainError::CannotUpdateDeletedModel { .. }) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Best-effort reversal of a partially applied `add_servers`.
    async fn undo_attach(
        &self,
        cluster_id: &str,
        added: &[String],
        attached: &[Versioned<Server>],
        initiator_id: Option<&str>,
    ) {
        for server in attached.iter().filter(|server| added.contains(&server.id)) {
            if let Err(err) = self.detach_server(&server.id, cluster_id, initiator_id).await {
                warn!(cluster_id, server_id = %server.id, error = %err, "cannot detach server");
            }
        }
        let ids: Vec<&str> = added.iter().map(String::as_str).collect();
        let undone = self
            .mutate_cluster(cluster_id, initiator_id, |cluster| {
                cluster.remove_servers(&ids);
                Ok(())
            })
            .await;
        if let Err(err) = undone {
            warn!(cluster_id, error = %err, "cannot remove servers from cluster");
        }
    }

    /// Update a server. Only `name` may change; facts, addresses and
    /// membership are owned by discovery and cluster operations. The
    /// owning cluster's member snapshot is refreshed afterwards.
    pub async fn update_server(
        &self,
        edited: &Versioned<Server>,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Server>, DomainError> {
        let current = self.servers.get(&edited.id).await?;
        if let Some(field) = changed_server_field(&current.data, &edited.data) {
            return Err(DomainError::CannotUpdateImmutableField(field.to_string()));
        }
        let saved = match self.servers.save(edited, initiator_id).await {
            Ok(saved) => saved,
            Err(err @ DomainError::CannotUpdateDeletedModel { .. }) => {
                warn!(server_id = %edited.id, "cannot update deleted server");
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        if let Some(cluster_id) = &saved.data.cluster_id {
            if let Some(mut cluster) = self.clusters.find_live(cluster_id).await? {
                cluster.data.update_servers(std::slice::from_ref(&saved));
                self.clusters.save(&cluster, initiator_id).await?;
            }
        }
        info!(
            server_id = %saved.id,
            version = saved.version,
            initiator = initiator_id.unwrap_or("-"),
            "server updated"
        );
        Ok(saved)
    }

    pub async fn delete_server(
        &self,
        id: &str,
        initiator_id: Option<&str>,
    ) -> Result<Versioned<Server>, DomainError> {
        let current = self.servers.get(id).await?;
        if let Some(cluster_id) = &current.data.cluster_id {
            if !current.is_deleted() {
                return Err(DomainError::PolicyViolation {
                    policy: ServerListPolicy::NotInAnyCluster.to_string(),
                    servers: vec![format!("{id} (cluster {cluster_id})")],
                });
            }
        }
        match self.servers.delete(&current, initiator_id).await {
            Ok(deleted) => {
                info!(server_id = id, "server deleted");
                Ok(deleted)
            }
            Err(err) => {
                warn!(server_id = id, error = %err, "cannot delete server");
                Err(err)
            }
        }
    }
}

fn changed_server_field(current: &Server, edited: &Server) -> Option<&'static str> {
    if current.fqdn != edited.fqdn {
        Some("fqdn")
    } else if current.ip != edited.ip {
        Some("ip")
    } else if current.username != edited.username {
        Some("username")
    } else if current.state != edited.state {
        Some("state")
    } else if current.cluster_id != edited.cluster_id {
        Some("cluster_id")
    } else if current.facts != edited.facts {
        Some("facts")
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use async_trait::async_trait;
    use strata_core::Facts;
    use strata_storage::{
        MemoryStore, NewRecord, Page, Pagination, RecordFilter, RecordUpdate, StorageError,
        VersionedRecord,
    };

    /// A concurrent writer, played right before the next save of a model.
    pub(crate) enum Interleaving {
        RenameClusters,
        Claim { server_id: &'static str, cluster_id: String },
        /// Change one field of the record about to be saved.
        Overwrite { field: &'static str, value: serde_json::Value },
    }

    pub(crate) struct InterleavingStore {
        inner: MemoryStore,
        model: &'static str,
        pending: std::sync::Mutex<Option<Interleaving>>,
    }

    impl InterleavingStore {
        pub(crate) fn new(model: &'static str) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                model,
                pending: std::sync::Mutex::new(None),
            })
        }

        pub(crate) fn arm(&self, interleaving: Interleaving) {
            *self.pending.lock().unwrap() = Some(interleaving);
        }

        async fn overwrite(
            &self,
            record: VersionedRecord,
            edit: impl FnOnce(&mut serde_json::Value),
        ) -> Result<(), StorageError> {
            let mut data = record.data;
            edit(&mut data);
            self.inner
                .save(RecordUpdate {
                    model: record.model,
                    id: record.id,
                    expected_version: record.version,
                    initiator_id: Some("other".into()),
                    unique_key: record.unique_key,
                    data,
                })
                .await?;
            Ok(())
        }

        async fn play(
            &self,
            interleaving: Interleaving,
            update: &RecordUpdate,
        ) -> Result<(), StorageError> {
            match interleaving {
                Interleaving::RenameClusters => {
                    let clusters = self.inner.list("cluster", None, Pagination::all()).await?;
                    for cluster in clusters.items {
                        self.overwrite(cluster, |data| data["name"] = "renamed".into())
                            .await?;
                    }
                }
                Interleaving::Claim { server_id, cluster_id } => {
                    if let Some(server) = self.inner.find("server", server_id).await? {
                        self.overwrite(server, |data| data["cluster_id"] = cluster_id.into())
                            .await?;
                    }
                }
                Interleaving::Overwrite { field, value } => {
                    if let Some(record) = self.inner.find(&update.model, &update.id).await? {
                        self.overwrite(record, |data| data[field] = value).await?;
                    }
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EntityStore for InterleavingStore {
        async fn create(&self, record: NewRecord) -> Result<VersionedRecord, StorageError> {
            self.inner.create(record).await
        }

        async fn save(&self, update: RecordUpdate) -> Result<VersionedRecord, StorageError> {
            if update.model == self.model {
                let pending = self.pending.lock().unwrap().take();
                if let Some(interleaving) = pending {
                    self.play(interleaving, &update).await?;
                }
            }
            self.inner.save(update).await
        }

        async fn delete(
            &self,
            model: &str,
            id: &str,
            expected_version: i64,
            initiator_id: Option<&str>,
        ) -> Result<VersionedRecord, StorageError> {
            self.inner.delete(model, id, expected_version, initiator_id).await
        }

        async fn find(&self, model: &str, id: &str) -> Result<Option<VersionedRecord>, StorageError> {
            self.inner.find(model, id).await
        }

        async fn find_version(
            &self,
            model: &str,
            id: &str,
            version: i64,
        ) -> Result<Option<VersionedRecord>, StorageError> {
            self.inner.find_version(model, id, version).await
        }

        async fn list(
            &self,
            model: &str,
            filter: Option<&RecordFilter>,
            pagination: Pagination,
        ) -> Result<Page<VersionedRecord>, StorageError> {
            self.inner.list(model, filter, pagination).await
        }

        async fn list_versions(
            &self,
            model: &str,
            id: &str,
            pagination: Pagination,
        ) -> Result<Page<VersionedRecord>, StorageError> {
            self.inner.list_versions(model, id, pagination).await
        }
    }

    async fn assert_membership_agrees(fleet: &Fleet, cluster_id: &str, members: &[&str]) {
        let cluster = fleet.clusters().get(cluster_id).await.unwrap();
        assert_eq!(cluster.data.name, "renamed");
        assert_eq!(cluster.data.server_ids().collect::<Vec<_>>(), members);
        for server in fleet.servers().list(Pagination::all()).await.unwrap().items {
            let expected = members.contains(&server.id.as_str()).then_some(cluster_id);
            assert_eq!(server.data.cluster_id.as_deref(), expected, "{}", server.id);
        }
    }

    pub(crate) async fn seed_server(fleet: &Fleet, id: &str, ip: &str) -> Versioned<Server> {
        fleet
            .servers()
            .create(
                id.into(),
                Server::discovered(&format!("{id}.example.com"), ip, "ansible", Facts::default()),
                None,
            )
            .await
            .unwrap()
    }

    fn fleet() -> Fleet {
        Fleet::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn add_and_remove_keep_both_sides_in_sync() {
        let fleet = fleet();
        let cluster = fleet.create_cluster("ceph", Some("admin")).await.unwrap();
        seed_server(&fleet, "s1", "10.0.0.1").await;
        seed_server(&fleet, "s2", "10.0.0.2").await;

        let ids = vec!["s1".to_string(), "s2".to_string()];
        let cluster = fleet.add_servers(&cluster.id, &ids, Some("admin")).await.unwrap();
        assert_eq!(cluster.version, 2);
        assert_eq!(cluster.data.server_ids().collect::<Vec<_>>(), ["s1", "s2"]);
        let s1 = fleet.servers().get("s1").await.unwrap();
        assert_eq!(s1.data.cluster_id.as_deref(), Some(cluster.id.as_str()));

        let cluster = fleet
            .remove_servers(&cluster.id, &ids[..1], Some("admin"))
            .await
            .unwrap();
        assert_eq!(cluster.data.server_ids().collect::<Vec<_>>(), ["s2"]);
        assert_eq!(fleet.servers().get("s1").await.unwrap().data.cluster_id, None);
    }

    #[tokio::test]
    async fn server_in_other_cluster_is_refused() {
        let fleet = fleet();
        let a = fleet.create_cluster("a", None).await.unwrap();
        let b = fleet.create_cluster("b", None).await.unwrap();
        seed_server(&fleet, "s1", "10.0.0.1").await;
        seed_server(&fleet, "s2", "10.0.0.2").await;
        fleet.add_servers(&a.id, &["s1".into()], None).await.unwrap();

        let err = fleet
            .add_servers(&b.id, &["s2".into(), "s1".into()], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PolicyViolationError");
        // Nothing was attached.
        assert_eq!(fleet.servers().get("s2").await.unwrap().data.cluster_id, None);
        assert!(fleet.clusters().get(&b.id).await.unwrap().data.members.is_empty());
    }

    #[tokio::test]
    async fn unknown_servers_are_reported() {
        let fleet = fleet();
        let a = fleet.create_cluster("a", None).await.unwrap();
        let err = fleet
            .add_servers(&a.id, &["ghost".into()], None)
            .await
            .unwrap_err();
        assert_eq!(err, DomainError::UnknownServers(vec!["ghost".into()]));
    }

    #[tokio::test]
    async fn cluster_with_members_cannot_be_deleted() {
        let fleet = fleet();
        let a = fleet.create_cluster("a", None).await.unwrap();
        seed_server(&fleet, "s1", "10.0.0.1").await;
        fleet.add_servers(&a.id, &["s1".into()], None).await.unwrap();

        let err = fleet.delete_cluster(&a.id, None).await.unwrap_err();
        assert_eq!(err.kind(), "CannotDeleteClusterWithServers");

        fleet.remove_servers(&a.id, &["s1".into()], None).await.unwrap();
        let deleted = fleet.delete_cluster(&a.id, None).await.unwrap();
        assert!(deleted.is_deleted());

        let err = fleet.delete_cluster(&a.id, None).await.unwrap_err();
        assert_eq!(err.kind(), "CannotUpdateDeletedModel");
    }

    #[tokio::test]
    async fn server_rename_refreshes_cluster_snapshot() {
        let fleet = fleet();
        let a = fleet.create_cluster("a", None).await.unwrap();
        seed_server(&fleet, "s1", "10.0.0.1").await;
        let a = fleet.add_servers(&a.id, &["s1".into()], None).await.unwrap();

        let mut server = fleet.servers().get("s1").await.unwrap();
        server.data.name = "storage-01".into();
        let saved = fleet.update_server(&server, Some("admin")).await.unwrap();
        assert_eq!(saved.data.name, "storage-01");
        assert_eq!(fleet.clusters().get(&a.id).await.unwrap().version, a.version + 1);
    }

    #[tokio::test]
    async fn server_immutable_fields_are_rejected() {
        let fleet = fleet();
        let mut server = seed_server(&fleet, "s1", "10.0.0.1").await;
        server.data.ip = "10.9.9.9".into();
        let err = fleet.update_server(&server, None).await.unwrap_err();
        assert_eq!(err, DomainError::CannotUpdateImmutableField("ip".into()));
    }

    #[tokio::test]
    async fn cluster_members_cannot_be_edited_directly() {
        let fleet = fleet();
        let mut a = fleet.create_cluster("a", None).await.unwrap();
        let server = seed_server(&fleet, "s1", "10.0.0.1").await;
        a.data.add_servers(&[server]);
        let err = fleet.update_cluster(&a, None).await.unwrap_err();
        assert_eq!(err.kind(), "CannotUpdateImmutableField");

        let mut a = fleet.clusters().get(&a.id).await.unwrap();
        a.data.name = "renamed".into();
        assert_eq!(fleet.update_cluster(&a, None).await.unwrap().data.name, "renamed");
    }

    #[tokio::test]
    async fn member_server_cannot_be_deleted() {
        let fleet = fleet();
        let a = fleet.create_cluster("a", None).await.unwrap();
        seed_server(&fleet, "s1", "10.0.0.1").await;
        fleet.add_servers(&a.id, &["s1".into()], None).await.unwrap();
        let err = fleet.delete_server("s1", None).await.unwrap_err();
        assert_eq!(err.kind(), "PolicyViolationError");

        seed_server(&fleet, "s2", "10.0.0.2").await;
        assert!(fleet.delete_server("s2", None).await.unwrap().is_deleted());
    }

    #[tokio::test]
    async fn cluster_renamed_while_servers_are_attached() {
        let store = InterleavingStore::new("server");
        let fleet = Fleet::new(store.clone());
        let a = fleet.create_cluster("a", None).await.unwrap();
        seed_server(&fleet, "s1", "10.0.0.1").await;
        seed_server(&fleet, "s2", "10.0.0.2").await;

        store.arm(Interleaving::RenameClusters);
        fleet
            .add_servers(&a.id, &["s1".into(), "s2".into()], None)
            .await
            .unwrap();
        assert_membership_agrees(&fleet, &a.id, &["s1", "s2"]).await;
    }

    #[tokio::test]
    async fn cluster_renamed_before_membership_save_is_retried() {
        let store = InterleavingStore::new("cluster");
        let fleet = Fleet::new(store.clone());
        let a = fleet.create_cluster("a", None).await.unwrap();
        seed_server(&fleet, "s1", "10.0.0.1").await;
        seed_server(&fleet, "s2", "10.0.0.2").await;

        store.arm(Interleaving::RenameClusters);
        let saved = fleet
            .add_servers(&a.id, &["s1".into(), "s2".into()], None)
            .await
            .unwrap();
        assert_eq!(saved.version, 3);
        assert_membership_agrees(&fleet, &a.id, &["s1", "s2"]).await;

        store.arm(Interleaving::RenameClusters);
        fleet.remove_servers(&a.id, &["s1".into()], None).await.unwrap();
        assert_membership_agrees(&fleet, &a.id, &["s2"]).await;
    }

    #[tokio::test]
    async fn server_claimed_elsewhere_rolls_membership_back() {
        let store = InterleavingStore::new("server");
        let fleet = Fleet::new(store.clone());
        let a = fleet.create_cluster("a", None).await.unwrap();
        let b = fleet.create_cluster("b", None).await.unwrap();
        seed_server(&fleet, "s1", "10.0.0.1").await;
        seed_server(&fleet, "s2", "10.0.0.2").await;

        store.arm(Interleaving::Claim {
            server_id: "s2",
            cluster_id: b.id.clone(),
        });
        let err = fleet
            .add_servers(&a.id, &["s1".into(), "s2".into()], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PolicyViolationError");

        assert!(fleet.clusters().get(&a.id).await.unwrap().data.members.is_empty());
        assert_eq!(fleet.servers().get("s1").await.unwrap().data.cluster_id, None);
        assert_eq!(
            fleet.servers().get("s2").await.unwrap().data.cluster_id.as_deref(),
            Some(b.id.as_str())
        );
    }
}
