use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

use crate::storage::{FeedRepository, FolderRecord, StoreError};
use crate::util::{clean_label, folder_key, MAX_FOLDER_NAME_CHARS};

/// Folder name to id resolution for one import batch.
///
/// Built from the user's existing folders. Missing folders are created on
/// first request; concurrent requests for the same (case-insensitive) name
/// share one in-flight create instead of racing the uniqueness constraint.
pub struct FolderResolver<'a> {
    repo: &'a dyn FeedRepository,
    user_id: i64,
    known: Mutex<HashMap<String, i64>>,
    pending: Mutex<HashMap<String, Arc<OnceCell<i64>>>>,
}

impl<'a> FolderResolver<'a> {
    pub async fn load(repo: &'a dyn FeedRepository, user_id: i64) -> Result<Self, StoreError> {
        let folders = repo.list_folders_for_user(user_id).await?;
        Ok(Self {
            repo,
            user_id,
            known: Mutex::new(index(&folders)),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Resolves every name to a folder id, creating folders as needed.
    ///
    /// Returns the ids (deduplicated, in request order) and one warning per
    /// name that could not be resolved.
    pub async fn resolve(&self, names: &[String]) -> (Vec<i64>, Vec<String>) {
        let mut ids = Vec::new();
        let mut warnings = Vec::new();

        for name in names {
            let Some(clean) = clean_label(name, MAX_FOLDER_NAME_CHARS) else {
                continue;
            };
            match self.resolve_one(&clean).await {
                Ok(id) if !ids.contains(&id) => ids.push(id),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(user_id = self.user_id, folder = %clean, error = %e, "Could not resolve folder");
                    warnings.push(format!("folder '{clean}' could not be created: {e}"));
                }
            }
        }

        (ids, warnings)
    }

    async fn resolve_one(&self, name: &str) -> Result<i64, StoreError> {
        let key = folder_key(name);
        if let Some(id) = self.lookup(&key) {
            return Ok(id);
        }

        let cell = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(pending.entry(key.clone()).or_default())
        };

        // A failed create leaves the cell empty, so the next caller retries.
        let id = cell
            .get_or_try_init(|| self.create(name, &key))
            .await?;
        Ok(*id)
    }

    async fn create(&self, name: &str, key: &str) -> Result<i64, StoreError> {
        if let Some(id) = self.lookup(key) {
            return Ok(id);
        }

        match self.repo.create_folder(self.user_id, name).await {
            Ok(folder) => {
                self.remember(key, folder.id);
                Ok(folder.id)
            }
            // Created by another request since the batch started
            Err(StoreError::Conflict(_)) => {
                let folders = self.repo.list_folders_for_user(self.user_id).await?;
                let fresh = index(&folders);
                let id = fresh.get(key).copied();
                self.known
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(fresh);
                id.ok_or_else(|| StoreError::Conflict(name.to_owned()))
            }
            Err(e) => Err(e),
        }
    }

    fn lookup(&self, key: &str) -> Option<i64> {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    fn remember(&self, key: &str, id: i64) {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), id);
    }
}

fn index(folders: &[FolderRecord]) -> HashMap<String, i64> {
    folders
        .iter()
        .map(|f| (folder_key(&f.name), f.id))
        .collect()
}
