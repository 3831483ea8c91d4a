//! Pre-build reconciliation: every entry still present when a build starts
//! must refer to CAS data that is actually available, so the build can reuse
//! it without racing against eviction. Entries that reference missing blobs,
//! a different instance name, or a different digest function are removed
//! before `StartBuild` returns.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::cas::client::RECOMMENDED_FIND_MISSING_BATCH;
use crate::cas::{Digest, DigestFunction, DigestSet};
use crate::outputs::{OutputServiceNode, ServiceError};
use crate::vfs::{ChildRemover, InitialNode, PrepopulatedDir};

impl OutputServiceNode {
    /// Issue one FindMissing call for the queued digests and remove every
    /// entry that depends on a digest reported missing.
    async fn find_missing_and_remove(
        &self,
        queue: &mut HashMap<Digest, Vec<ChildRemover>>,
    ) -> Result<(), ServiceError> {
        let digests: DigestSet = queue.keys().cloned().collect();
        let missing = self
            .blobs
            .find_missing(digests)
            .await
            .map_err(|e| ServiceError::storage("failed to find missing blobs", e))?;
        for digest in &missing {
            if let Some(removers) = queue.get(digest) {
                debug!(%digest, "removing entries backed by missing blob");
                for remover in removers {
                    remover.remove().await.map_err(|e| {
                        ServiceError::directory(
                            format!("failed to remove file with digest {digest}"),
                            e,
                        )
                    })?;
                }
            }
        }
        queue.clear();
        Ok(())
    }

    /// Sweep the output path, batching the digest closure of every entry
    /// through FindMissing. Removal failures are sticky: the first one is
    /// remembered and surfaced after the sweep, so one bad entry does not
    /// hide the rest of the reconciliation work.
    pub(crate) async fn filter_missing_children(
        &self,
        root: &Arc<PrepopulatedDir>,
        digest_function: &DigestFunction,
    ) -> Result<(), ServiceError> {
        let entries = root
            .filter_children()
            .await
            .map_err(|e| ServiceError::directory("failed to traverse the output path", e))?;

        let mut queue: HashMap<Digest, Vec<ChildRemover>> = HashMap::new();
        let mut sticky: Option<ServiceError> = None;

        'entries: for entry in entries {
            let digests = match &entry.node {
                InitialNode::Leaf(leaf) => leaf.containing_digests(),
                InitialNode::Directory(fetcher) => match fetcher.containing_digests().await {
                    Ok(digests) => digests,
                    Err(e) if e.is_not_found() => {
                        // The tree manifest itself is gone; drop the whole
                        // subtree and keep sweeping.
                        debug!("removing directory whose manifest disappeared");
                        if let Err(e) = entry.remover.remove().await {
                            sticky.get_or_insert(ServiceError::directory(
                                "failed to remove directory with missing manifest",
                                e,
                            ));
                        }
                        continue;
                    }
                    Err(e) => {
                        return Err(ServiceError::storage(
                            "failed to compute digests underneath directory",
                            e,
                        ));
                    }
                },
            };

            // A build client cannot be expected to copy blobs across
            // namespaces or rehash them, so entries from another instance or
            // digest function are dropped outright.
            for digest in &digests {
                if !digest.uses_function(digest_function) {
                    debug!(%digest, "removing entry with mismatching digest function");
                    if let Err(e) = entry.remover.remove().await {
                        sticky.get_or_insert(ServiceError::directory(
                            format!("failed to remove entry with mismatching digest {digest}"),
                            e,
                        ));
                    }
                    continue 'entries;
                }
            }

            for digest in digests {
                if queue.len() >= RECOMMENDED_FIND_MISSING_BATCH && !queue.contains_key(&digest) {
                    self.find_missing_and_remove(&mut queue).await?;
                }
                queue.entry(digest).or_default().push(entry.remover.clone());
            }
        }

        if let Some(err) = sticky {
            return Err(err);
        }
        if !queue.is_empty() {
            self.find_missing_and_remove(&mut queue).await?;
        }
        Ok(())
    }
}
