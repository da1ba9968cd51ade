//! System V IPC cleanup.
//!
//! GStreamer pipelines that die without a clean shutdown tend to leave shared
//! memory segments and semaphores behind. The tables under /proc/sysvipc list
//! them; segments nobody is attached to and semaphores owned by the current
//! user are removed with `IPC_RMID`.

use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

/// Kind of System V IPC object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcKind {
    SharedMemory,
    Semaphore,
}

/// One row of /proc/sysvipc/shm or /proc/sysvipc/sem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcResource {
    pub kind: IpcKind,
    pub id: i32,
    pub uid: u32,
    /// Number of attached processes (shared memory only).
    pub attached: Option<u64>,
}

/// Outcome of a purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcPurgeReport {
    pub shm_removed: usize,
    pub sem_removed: usize,
    pub failures: usize,
}

/// Parses /proc/sysvipc/shm content.
pub fn parse_shm_table(content: &str) -> Vec<IpcResource> {
    parse_table(content, IpcKind::SharedMemory, "shmid")
}

/// Parses /proc/sysvipc/sem content.
pub fn parse_sem_table(content: &str) -> Vec<IpcResource> {
    parse_table(content, IpcKind::Semaphore, "semid")
}

fn parse_table(content: &str, kind: IpcKind, id_column: &str) -> Vec<IpcResource> {
    let mut lines = content.lines();
    let header: Vec<&str> = match lines.next() {
        Some(h) => h.split_whitespace().collect(),
        None => return Vec::new(),
    };
    let column = |name: &str| header.iter().position(|c| *c == name);
    let (id_idx, uid_idx) = match (column(id_column), column("uid")) {
        (Some(i), Some(u)) => (i, u),
        _ => {
            warn!("Unrecognised sysvipc header: {:?}", header);
            return Vec::new();
        }
    };
    let nattch_idx = column("nattch");

    lines
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let id = parts.get(id_idx)?.parse().ok()?;
            let uid = parts.get(uid_idx)?.parse().ok()?;
            let attached = nattch_idx.and_then(|i| parts.get(i)?.parse().ok());
            Some(IpcResource {
                kind,
                id,
                uid,
                attached,
            })
        })
        .collect()
}

/// Picks the resources that belong to `uid` and are safe to remove.
pub fn orphaned_for_user(resources: &[IpcResource], uid: u32) -> Vec<IpcResource> {
    resources
        .iter()
        .filter(|r| r.uid == uid)
        .filter(|r| match r.kind {
            IpcKind::SharedMemory => r.attached.unwrap_or(0) == 0,
            IpcKind::Semaphore => true,
        })
        .cloned()
        .collect()
}

/// Removes orphaned shared memory and semaphores owned by `uid`.
///
/// `root` is normally `/proc/sysvipc`. Never fails; every problem is logged
/// and counted in the report.
pub fn purge_orphaned(root: &Path, uid: u32) -> IpcPurgeReport {
    let mut report = IpcPurgeReport::default();

    let tables: [(&str, fn(&str) -> Vec<IpcResource>); 2] =
        [("shm", parse_shm_table), ("sem", parse_sem_table)];

    let mut candidates = Vec::new();
    for (file, parse) in tables {
        match fs::read_to_string(root.join(file)) {
            Ok(content) => candidates.extend(orphaned_for_user(&parse(&content), uid)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} not present, skipping", root.join(file).display());
            }
            Err(e) => {
                warn!("Cannot read {}: {}", root.join(file).display(), e);
                report.failures += 1;
            }
        }
    }

    for resource in candidates {
        match remove(&resource) {
            Ok(()) => {
                debug!("Removed {:?} {}", resource.kind, resource.id);
                match resource.kind {
                    IpcKind::SharedMemory => report.shm_removed += 1,
                    IpcKind::Semaphore => report.sem_removed += 1,
                }
            }
            Err(e) => {
                warn!("Failed to remove {:?} {}: {}", resource.kind, resource.id, e);
                report.failures += 1;
            }
        }
    }

    report
}

#[cfg(target_os = "linux")]
fn remove(resource: &IpcResource) -> io::Result<()> {
    // SAFETY: IPC_RMID takes no buffer for shmctl and no fourth argument for
    // semctl; an invalid id only yields EINVAL/EPERM.
    let rc = unsafe {
        match resource.kind {
            IpcKind::SharedMemory => {
                libc::shmctl(resource.id, libc::IPC_RMID, std::ptr::null_mut())
            }
            IpcKind::Semaphore => libc::semctl(resource.id, 0, libc::IPC_RMID),
        }
    };
    if rc == -1 {
        let err = io::Error::last_os_error();
        // Already removed by someone else
        if err.raw_os_error() == Some(libc::EINVAL) || err.raw_os_error() == Some(libc::EIDRM) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn remove(_resource: &IpcResource) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "sysvipc cleanup is only implemented for Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHM: &str = "       key      shmid perms                  size  cpid  lpid nattch   uid   gid  cuid  cgid      atime      dtime      ctime                   rss                  swap\n\
         0         12  1600                524288  4101  4102      0  1000  1000  1000  1000          0          0 1700000000                     0                     0\n\
         0         13  1600                524288  4101  4102      2  1000  1000  1000  1000          0          0 1700000000                     0                     0\n\
         0         14  1600                524288  4101  4102      0     0     0     0     0          0          0 1700000000                     0                     0\n";

    const SEM: &str = "       key      semid perms      nsems   uid   gid  cuid  cgid      otime      ctime\n\
         0          3   600          1  1000  1000  1000  1000          0 1700000000\n\
         0          4   600          1     0     0     0     0          0 1700000000\n";

    #[test]
    fn test_parse_shm_table() {
        let rows = parse_shm_table(SHM);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id, 12);
        assert_eq!(rows[0].uid, 1000);
        assert_eq!(rows[0].attached, Some(0));
        assert_eq!(rows[1].attached, Some(2));
    }

    #[test]
    fn test_parse_sem_table() {
        let rows = parse_sem_table(SEM);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, IpcKind::Semaphore);
        assert_eq!(rows[0].attached, None);
        assert_eq!(rows[1].uid, 0);
    }

    #[test]
    fn test_orphaned_only_unattached_segments_of_user() {
        let shm = orphaned_for_user(&parse_shm_table(SHM), 1000);
        assert_eq!(shm.iter().map(|r| r.id).collect::<Vec<_>>(), vec![12]);

        let sem = orphaned_for_user(&parse_sem_table(SEM), 1000);
        assert_eq!(sem.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_parse_garbage_is_empty() {
        assert!(parse_shm_table("").is_empty());
        assert!(parse_shm_table("not a header\n1 2 3\n").is_empty());
    }

    #[test]
    fn test_purge_missing_root_is_quiet() {
        let report = purge_orphaned(Path::new("/definitely/not/sysvipc"), 1000);
        assert_eq!(report, IpcPurgeReport::default());
    }
}
