//! Ticket storage.
//!
//! Every record is keyed by its ticket id and names its parent through
//! `granted_by`; stores additionally index parent → children so that a
//! ticket-granting ticket's whole subtree can be removed in one step.

use crate::ticket::error::StoreError;
use crate::ticket::types::{ExpirationPolicy, Ticket, TicketKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Result of an atomic create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same id already exists.
    Collision,
    /// The record names a parent that no longer exists.
    ParentMissing,
}

/// Result of an atomic check-and-consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed,
    AlreadyConsumed,
    Missing,
}

/// Persistence seam shared by every ticket component.
///
/// Implementations must make each method linearizable per ticket id, and
/// must make `create` and `revoke_tree` atomic with respect to each other:
/// a child is never attached to a parent that a concurrent revocation has
/// already removed.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Insert a record if its id is free and, when it has a parent, the
    /// parent still exists.
    async fn create(&self, ticket: Ticket) -> Result<InsertOutcome, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Ticket>, StoreError>;

    /// Compare-and-swap the consumed flag of a single-use ticket.
    async fn consume(&self, id: &str) -> Result<ConsumeOutcome, StoreError>;

    /// Remove a record and everything transitively granted under it.
    ///
    /// Returns the removed ids (root first), or `None` when the root does not
    /// exist. All-or-nothing.
    async fn revoke_tree(&self, root_id: &str) -> Result<Option<Vec<String>>, StoreError>;

    /// Drop expired records, returning how many were removed.
    async fn purge_expired(
        &self,
        policy: &ExpirationPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}

/// One session tree: a root ticket and everything granted under it.
struct Tree {
    root: String,
    tickets: HashMap<String, Ticket>,
    children: HashMap<String, Vec<String>>,
}

impl Tree {
    fn new(root: Ticket) -> Self {
        let id = root.id().to_string();
        Self {
            root: id.clone(),
            tickets: HashMap::from([(id, root)]),
            children: HashMap::new(),
        }
    }

    fn is_leaf(&self, id: &str) -> bool {
        self.children.get(id).map_or(true, |c| c.is_empty())
    }

    fn subtree(&self, root_id: &str) -> Vec<String> {
        let mut order = Vec::new();
        let mut pending = vec![root_id.to_string()];
        while let Some(id) = pending.pop() {
            if let Some(children) = self.children.get(&id) {
                pending.extend(children.iter().cloned());
            }
            order.push(id);
        }
        order
    }

    fn remove_subtree(&mut self, root_id: &str) -> Vec<String> {
        let parent = self
            .tickets
            .get(root_id)
            .and_then(|t| t.granted_by())
            .map(str::to_string);
        let removed = self.subtree(root_id);
        for id in &removed {
            self.tickets.remove(id);
            self.children.remove(id);
        }
        if let Some(parent) = parent {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|id| id != root_id);
            }
        }
        removed
    }
}

#[derive(Default)]
struct Directory {
    /// Ticket id to the id of its tree's root.
    roots: HashMap<String, String>,
    trees: HashMap<String, Arc<Mutex<Tree>>>,
}

/// In-process store sharded by session tree.
///
/// Each root ticket (a TGT or a login ticket) owns a tree behind its own
/// lock; every operation on a ticket runs under the lock of the tree holding
/// it, so consumption is linearizable per id and a revocation is one
/// transaction over its tree. The directory lock is only held for id lookups
/// and is never held while a tree lock is awaited.
#[derive(Default)]
pub struct MemoryTicketStore {
    directory: RwLock<Directory>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.directory.read().await.roots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ids of records of one kind.
    pub async fn ids_of_kind(&self, kind: TicketKind) -> Vec<String> {
        let mut ids = Vec::new();
        for tree in self.trees().await {
            let tree = tree.lock().await;
            ids.extend(
                tree.tickets
                    .values()
                    .filter(|t| t.kind() == kind)
                    .map(|t| t.id().to_string()),
            );
        }
        ids
    }

    async fn trees(&self) -> Vec<Arc<Mutex<Tree>>> {
        self.directory.read().await.trees.values().cloned().collect()
    }

    async fn tree_of(&self, id: &str) -> Option<Arc<Mutex<Tree>>> {
        let directory = self.directory.read().await;
        let root = directory.roots.get(id)?;
        directory.trees.get(root).cloned()
    }

    /// Drop removed ids from the directory, and the tree itself when its root
    /// went with them. Called with the tree lock held.
    async fn forget(&self, ids: &[String], root: &str) {
        let mut directory = self.directory.write().await;
        for id in ids {
            directory.roots.remove(id);
        }
        if ids.iter().any(|id| id == root) {
            directory.trees.remove(root);
        }
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn create(&self, ticket: Ticket) -> Result<InsertOutcome, StoreError> {
        let id = ticket.id().to_string();

        let Some(parent) = ticket.granted_by().map(str::to_string) else {
            let mut directory = self.directory.write().await;
            if directory.roots.contains_key(&id) {
                return Ok(InsertOutcome::Collision);
            }
            directory.roots.insert(id.clone(), id.clone());
            directory
                .trees
                .insert(id, Arc::new(Mutex::new(Tree::new(ticket))));
            return Ok(InsertOutcome::Inserted);
        };

        let Some(tree) = self.tree_of(&parent).await else {
            return Ok(InsertOutcome::ParentMissing);
        };
        let mut tree = tree.lock().await;
        // Revoked between the lookup and the lock.
        if !tree.tickets.contains_key(&parent) {
            return Ok(InsertOutcome::ParentMissing);
        }
        {
            let mut directory = self.directory.write().await;
            if directory.roots.contains_key(&id) {
                return Ok(InsertOutcome::Collision);
            }
            directory.roots.insert(id.clone(), tree.root.clone());
        }
        tree.children.entry(parent).or_default().push(id.clone());
        tree.tickets.insert(id, ticket);
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, id: &str) -> Result<Option<Ticket>, StoreError> {
        let Some(tree) = self.tree_of(id).await else {
            return Ok(None);
        };
        let tree = tree.lock().await;
        Ok(tree.tickets.get(id).cloned())
    }

    async fn consume(&self, id: &str) -> Result<ConsumeOutcome, StoreError> {
        let Some(tree) = self.tree_of(id).await else {
            return Ok(ConsumeOutcome::Missing);
        };
        let mut tree = tree.lock().await;
        match tree.tickets.get_mut(id) {
            None => Ok(ConsumeOutcome::Missing),
            Some(ticket) if ticket.is_consumed() => Ok(ConsumeOutcome::AlreadyConsumed),
            Some(ticket) => {
                ticket.mark_consumed();
                Ok(ConsumeOutcome::Consumed)
            }
        }
    }

    async fn revoke_tree(&self, root_id: &str) -> Result<Option<Vec<String>>, StoreError> {
        let Some(tree) = self.tree_of(root_id).await else {
            return Ok(None);
        };
        let mut tree = tree.lock().await;
        if !tree.tickets.contains_key(root_id) {
            return Ok(None);
        }
        let removed = tree.remove_subtree(root_id);
        self.forget(&removed, &tree.root).await;
        Ok(Some(removed))
    }

    async fn purge_expired(
        &self,
        policy: &ExpirationPolicy,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut removed = 0;

        for tree in self.trees().await {
            let mut tree = tree.lock().await;
            let root_id = tree.root.clone();

            // Expired sessions take their whole subtree with them.
            let root_expired = match tree.tickets.get(&root_id) {
                Some(root) => {
                    policy.is_expired(root.kind(), root.issued_at(), now)
                        && (root.kind() == TicketKind::TicketGranting || tree.is_leaf(&root_id))
                }
                None => continue,
            };
            if root_expired {
                let ids = tree.remove_subtree(&root_id);
                self.forget(&ids, &root_id).await;
                removed += ids.len();
                continue;
            }

            // Single-use tickets that earned a PGT stay until their session ends.
            let expired_leaves: Vec<String> = tree
                .tickets
                .values()
                .filter(|t| t.id() != root_id && t.kind().is_single_use())
                .filter(|t| policy.is_expired(t.kind(), t.issued_at(), now))
                .filter(|t| tree.is_leaf(t.id()))
                .map(|t| t.id().to_string())
                .collect();
            let mut ids = Vec::new();
            for leaf in expired_leaves {
                ids.extend(tree.remove_subtree(&leaf));
            }
            if !ids.is_empty() {
                self.forget(&ids, &root_id).await;
                removed += ids.len();
            }
        }

        if removed > 0 {
            debug!("Purged {} expired tickets", removed);
        }
        Ok(removed)
    }
}
