//! On-disk flare contents: create, persist, load and erase the bytes
//! backing a flare, keyed by its hash under the node's hashpath.

use super::types::{Flare, FlareType};
use crate::catalog::{Catalog, FlareRow};
use crate::error::{Error, Result};
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

/// The literal four-byte body a fresh directory flare starts with:
/// `.\0..\0`.
pub const EMPTY_DIRECTORY_BODY: &[u8] = b".\0..\0";

/// Create `flare`'s on-disk contents if absent. Directories get the
/// `.`/`..` seed; char/block/FIFO nodes are created with `mknod(2)`
/// carrying the flare's `rdev`; everything else (regular files,
/// symlinks-as-files) is created empty.
pub fn init(flare: &Flare, hashpath: &Path) -> Result<()> {
    let contents = flare.contents_path(hashpath);
    if contents.exists() {
        return Ok(());
    }
    match flare.ty {
        FlareType::Directory => {
            fs::write(&contents, EMPTY_DIRECTORY_BODY)?;
        }
        FlareType::CharDev | FlareType::BlockDev | FlareType::Fifo => {
            mknod_special(&contents, flare.ty, flare.stat.mode, flare.stat.rdev as u64)?;
        }
        _ => {
            OpenOptions::new().create(true).write(true).mode(flare.stat.mode).open(&contents)?;
        }
    }
    Ok(())
}

fn mknod_special(path: &Path, ty: FlareType, mode: u32, rdev: u64) -> Result<()> {
    let c_path = CString::new(path.as_os_str().to_string_lossy().into_owned())
        .map_err(|_| Error::InvalidArgument("path contains a NUL byte".to_string()))?;
    let full_mode = ty.mode_bits() | (mode & 0o7777);
    let rc = unsafe { libc::mknod(c_path.as_ptr(), full_mode, rdev as libc::dev_t) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Persist `flare`. Creates contents if missing, updates on-disk mode to
/// match, and on `first_time` also writes the catalog metadata row.
pub fn save(flare: &mut Flare, hashpath: &Path, catalog: &Catalog, first_time: bool) -> Result<()> {
    init(flare, hashpath)?;
    let contents = flare.contents_path(hashpath);
    let perms = fs::Permissions::from_mode(flare.stat.mode & 0o7777);
    fs::set_permissions(&contents, perms)?;

    if first_time {
        if flare.commit_path.is_none() {
            flare.commit_path = Some(flare.path.clone());
            flare.commit_time = Some(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            );
        }
        catalog.insert_flare(&FlareRow {
            hash: flare.hash.as_str().to_string(),
            path: flare.path.clone(),
            flare_type: flare.ty as i64,
            uid: flare.stat.uid,
            gid: flare.stat.gid,
            commit_path: flare.commit_path.clone(),
            commit_time: flare.commit_time.map(|t| t as i64),
            commit_url: flare.commit_url.clone(),
        })?;
    }
    Ok(())
}

/// Load `flare`'s size/blocks/blksize from disk, then `(type, commit_*,
/// uid, gid)` from the catalog, upcasting `flare.ty` if it was unknown.
pub fn load(flare: &mut Flare, hashpath: &Path, catalog: &Catalog) -> Result<()> {
    let contents = flare.contents_path(hashpath);
    let meta = fs::metadata(&contents)?;
    flare.stat.size = meta.len();
    flare.stat.blksize = 4096;
    flare.stat.blocks = (meta.len() + 511) / 512;

    if let Some(row) = catalog.load_flare(&flare.binhash)? {
        flare.ty = type_from_catalog(row.flare_type);
        flare.stat.uid = row.uid;
        flare.stat.gid = row.gid;
        flare.commit_path = row.commit_path;
        flare.commit_time = row.commit_time.map(|t| t as u64);
        flare.commit_url = row.commit_url;
        flare.is_upcasted = true;
    }
    Ok(())
}

fn type_from_catalog(v: i64) -> FlareType {
    match v {
        x if x == FlareType::Regular as i64 => FlareType::Regular,
        x if x == FlareType::Directory as i64 => FlareType::Directory,
        x if x == FlareType::Symlink as i64 => FlareType::Symlink,
        x if x == FlareType::CharDev as i64 => FlareType::CharDev,
        x if x == FlareType::BlockDev as i64 => FlareType::BlockDev,
        x if x == FlareType::Fifo as i64 => FlareType::Fifo,
        x if x == FlareType::Socket as i64 => FlareType::Socket,
        _ => FlareType::Unknown,
    }
}

/// Remove `flare` from disk and the catalog. Cache removal is the
/// caller's responsibility (the cache and the store are separate layers).
pub fn erase(flare: &Flare, hashpath: &Path, catalog: &Catalog) -> Result<()> {
    let contents = flare.contents_path(hashpath);
    if contents.exists() {
        fs::remove_file(&contents)?;
    }
    catalog.erase_flare(&flare.binhash)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_directory_body() {
        let dir = tempfile::tempdir().unwrap();
        let mut flare = Flare::new("/d");
        flare.ty = FlareType::Directory;
        flare.stat.mode = 0o40755;
        init(&flare, dir.path()).unwrap();
        let body = fs::read(flare.contents_path(dir.path())).unwrap();
        assert_eq!(body, EMPTY_DIRECTORY_BODY);
    }

    #[test]
    fn save_then_load_roundtrips_catalog_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::in_memory().unwrap();
        let mut flare = Flare::new("/f");
        flare.ty = FlareType::Regular;
        flare.stat.mode = 0o100644;
        flare.stat.uid = 1000;
        flare.stat.gid = 1000;
        save(&mut flare, dir.path(), &catalog, true).unwrap();

        let mut loaded = Flare::new("/f");
        load(&mut loaded, dir.path(), &catalog).unwrap();
        assert_eq!(loaded.ty, FlareType::Regular);
        assert_eq!(loaded.stat.uid, 1000);
        assert!(loaded.is_upcasted);
    }

    #[test]
    fn erase_removes_contents_and_catalog_row() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::in_memory().unwrap();
        let mut flare = Flare::new("/f");
        flare.ty = FlareType::Regular;
        flare.stat.mode = 0o100644;
        save(&mut flare, dir.path(), &catalog, true).unwrap();
        erase(&flare, dir.path(), &catalog).unwrap();
        assert!(!flare.contents_path(dir.path()).exists());
        assert!(catalog.load_flare(&flare.binhash).unwrap().is_none());
    }
}
