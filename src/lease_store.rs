//! Lease Metadata Store
//!
//! One directory per lease under the Kerberos state directory; each service
//! account's ticket is described by an `<account>_metadata` JSON file.
//! Files are written atomically (write-temp + rename) and are the source of
//! truth for what the renewal engine must keep alive.
//!
//! Layout:
//! ```text
//! <krbdir>/
//!   <leaseId>/
//!     <account>_metadata       JSON
//!     <account>.ccache         Kerberos cred cache
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::Result;
use crate::exec::{self, ShellCommand};
use crate::ticket_issuer::KDESTROY;

pub(crate) const METADATA_SUFFIX: &str = "_metadata";

/// On-disk description of one maintained ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct KrbTicketInfo {
    /// Credential cache this ticket is issued into.
    pub krb_file_path: String,
    /// gMSA account name, e.g. `webapp01`.
    pub service_account_name: String,
    /// DNS domain of the account, e.g. `contoso.com`.
    pub domain_name: String,
    /// User the lease was created by in domainless mode; empty otherwise.
    #[serde(default)]
    pub domainless_user: String,
}

#[derive(Debug, Clone)]
pub(crate) struct LeaseStore {
    krb_dir: PathBuf,
}

impl LeaseStore {
    pub(crate) fn new(krb_dir: impl Into<PathBuf>) -> Self {
        Self {
            krb_dir: krb_dir.into(),
        }
    }

    pub(crate) fn lease_dir(&self, lease_id: &str) -> PathBuf {
        self.krb_dir.join(lease_id)
    }

    /// Credential cache path for an account under a lease.
    #[allow(dead_code)]
    pub(crate) fn cred_cache_path(&self, lease_id: &str, account_name: &str) -> PathBuf {
        self.lease_dir(lease_id).join(format!("{}.ccache", account_name))
    }

    /// Records a lease: one metadata file per ticket, written atomically.
    ///
    /// Every externally supplied name is validated before the first
    /// filesystem mutation, so a rejected lease leaves no trace.
    pub(crate) fn put_lease(
        &self,
        lease_id: &str,
        tickets: &[KrbTicketInfo],
    ) -> Result<Vec<PathBuf>> {
        exec::validate_token(lease_id, "lease id")?;
        for ticket in tickets {
            exec::validate_token(&ticket.service_account_name, "account name")?;
        }

        let lease_dir = self.lease_dir(lease_id);
        fs::create_dir_all(&lease_dir)?;

        let mut written = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            let path = lease_dir.join(format!(
                "{}{}",
                ticket.service_account_name, METADATA_SUFFIX
            ));
            write_metadata_atomic(&path, std::slice::from_ref(ticket))?;
            written.push(path);
        }
        info!(lease = lease_id, files = written.len(), "lease metadata recorded");
        Ok(written)
    }

    /// Recursively enumerates every metadata file under the store.
    pub(crate) fn list_metadata_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if self.krb_dir.is_dir() {
            collect_metadata_files(&self.krb_dir, &mut files)?;
        }
        Ok(files)
    }

    /// Destroys every cred cache of a lease and removes its directory.
    ///
    /// Individual `kdestroy` failures are logged and skipped; the lease
    /// directory is removed regardless. Returns the destroyed cache paths.
    /// Calling this for an absent lease is a no-op.
    pub(crate) async fn delete_lease(&self, lease_id: &str) -> Result<Vec<String>> {
        exec::validate_token(lease_id, "lease id")?;

        let lease_dir = self.lease_dir(lease_id);
        let mut destroyed = Vec::new();
        if !lease_dir.is_dir() {
            return Ok(destroyed);
        }

        for entry in fs::read_dir(&lease_dir)? {
            let path = entry?.path();
            if !is_metadata_file(&path) {
                continue;
            }
            let tickets = match read_metadata(&path) {
                Ok(tickets) => tickets,
                Err(err) => {
                    warn!(file = %path.display(), "unreadable metadata during delete: {}", err);
                    continue;
                }
            };
            for ticket in tickets {
                let result = ShellCommand::new(KDESTROY)
                    .env("KRB5CCNAME", &ticket.krb_file_path)
                    .run()
                    .await;
                match result {
                    Ok(output) if output.success() => destroyed.push(ticket.krb_file_path),
                    Ok(output) => warn!(
                        cache = %ticket.krb_file_path,
                        exit = output.exit_code,
                        "kdestroy failed"
                    ),
                    Err(err) => warn!(cache = %ticket.krb_file_path, "kdestroy error: {}", err),
                }
            }
        }

        fs::remove_dir_all(&lease_dir)?;
        info!(lease = lease_id, destroyed = destroyed.len(), "lease deleted");
        Ok(destroyed)
    }
}

/// Reads one metadata file back into its ticket list.
pub(crate) fn read_metadata(path: &Path) -> Result<Vec<KrbTicketInfo>> {
    let contents = fs::read(path)?;
    Ok(serde_json::from_slice(&contents)?)
}

/// Writes `tickets` to `path` via a hidden temp file and rename, so a crash
/// mid-write never leaves a discoverable partial metadata file.
fn write_metadata_atomic(path: &Path, tickets: &[KrbTicketInfo]) -> Result<()> {
    let contents = serde_json::to_vec_pretty(tickets)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name.replace(METADATA_SUFFIX, "meta")));

    fs::write(&temp_path, &contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

fn is_metadata_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .map(|n| n.to_string_lossy().contains(METADATA_SUFFIX))
            .unwrap_or(false)
}

fn collect_metadata_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_metadata_files(&path, files)?;
        } else if is_metadata_file(&path) {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CredError;

    fn ticket(account: &str, dir: &Path) -> KrbTicketInfo {
        KrbTicketInfo {
            krb_file_path: dir.join(format!("{}.ccache", account)).display().to_string(),
            service_account_name: account.to_string(),
            domain_name: "contoso.com".to_string(),
            domainless_user: String::new(),
        }
    }

    #[test]
    fn test_cred_cache_path_layout() {
        let store = LeaseStore::new("/var/gmsa-credd/krbdir");
        assert_eq!(
            store.cred_cache_path("lease-42", "webapp01"),
            PathBuf::from("/var/gmsa-credd/krbdir/lease-42/webapp01.ccache")
        );
    }

    #[test]
    fn test_metadata_round_trip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let tickets = vec![ticket("webapp01", dir.path()), ticket("webapp02", dir.path())];
        let path = dir.path().join("webapp01_metadata");

        write_metadata_atomic(&path, &tickets).unwrap();
        let read_back = read_metadata(&path).unwrap();
        assert_eq!(read_back, tickets);
    }

    #[test]
    fn test_metadata_json_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webapp01_metadata");
        write_metadata_atomic(&path, &[ticket("webapp01", dir.path())]).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        for field in [
            "krb_file_path",
            "service_account_name",
            "domain_name",
            "domainless_user",
        ] {
            assert!(raw.contains(field), "missing field {}", field);
        }
    }

    #[test]
    fn test_put_lease_then_list_finds_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LeaseStore::new(dir.path());

        let written = store
            .put_lease(
                "lease-42",
                &[ticket("webapp01", dir.path()), ticket("webapp02", dir.path())],
            )
            .unwrap();
        assert_eq!(written.len(), 2);

        let mut listed = store.list_metadata_files().unwrap();
        listed.sort();
        let mut expected = written.clone();
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn test_put_lease_rejects_traversal_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = LeaseStore::new(dir.path());

        let err = store
            .put_lease("../../etc", &[ticket("webapp01", dir.path())])
            .unwrap_err();
        assert!(matches!(err, CredError::InvalidArgument(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_put_lease_rejects_bad_account_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = LeaseStore::new(dir.path());
        let mut bad = ticket("webapp01", dir.path());
        bad.service_account_name = "web app".to_string();

        assert!(store.put_lease("lease-42", &[bad]).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_temp_files_are_not_discoverable_as_metadata() {
        // A crash between write-temp and rename must not surface a partial
        // file to the renewal engine.
        let dir = tempfile::tempdir().unwrap();
        let store = LeaseStore::new(dir.path());
        let lease_dir = store.lease_dir("lease-42");
        std::fs::create_dir_all(&lease_dir).unwrap();
        std::fs::write(lease_dir.join(".webapp01meta.tmp"), b"{partial").unwrap();

        assert!(store.list_metadata_files().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_lease_removes_directory_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LeaseStore::new(dir.path());
        store
            .put_lease(
                "lease-42",
                &[ticket("webapp01", dir.path()), ticket("webapp02", dir.path())],
            )
            .unwrap();

        // kdestroy has nothing to destroy for these paths (or is absent);
        // deletion of the lease directory must proceed regardless.
        store.delete_lease("lease-42").await.unwrap();
        assert!(!store.lease_dir("lease-42").exists());

        // Second call: no-op, same on-disk state.
        let again = store.delete_lease("lease-42").await.unwrap();
        assert!(again.is_empty());
        assert!(!store.lease_dir("lease-42").exists());
    }

    #[tokio::test]
    async fn test_delete_lease_rejects_bad_lease_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = LeaseStore::new(dir.path());
        assert!(store.delete_lease("lease;42").await.is_err());
    }
}
