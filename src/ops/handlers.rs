//! Local execution of each operation against this node's flare cache and
//! store. Handlers assume they are running on the owner (or redundant
//! owner standing in for it); routing and forwarding live in
//! [`super::dispatch`].

use super::context::NodeContext;
use crate::error::{Error, Result};
use crate::flare::directory;
use crate::flare::store;
use crate::flare::{Access, Flare, FlareType};
use crate::transport::RW_CHUNK;
use crate::wire::WireStat;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn require(denied: Access) -> Result<()> {
    if denied.is_empty() {
        Ok(())
    } else {
        Err(Error::PermissionDenied)
    }
}

pub fn getattr(ctx: &NodeContext, path: &str) -> Result<WireStat> {
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    let flare = entry.read().expect("flare lock poisoned");
    if !flare.contents_path(&ctx.hashpath).exists() {
        return Err(Error::NotFound(path.to_string()));
    }
    let mut stat = flare.stat;
    stat.mode = (flare.ty.mode_bits()) | (flare.stat.mode & 0o7777);
    Ok(stat)
}

pub fn mknod(ctx: &NodeContext, path: &str, mode: u32, rdev: u32, uid: u32, gid: u32) -> Result<WireStat> {
    if mode & libc::S_IFMT == libc::S_IFDIR {
        return Err(Error::InvalidArgument("mknod cannot create a directory".to_string()));
    }
    create_flare(ctx, path, FlareType::from_mode(mode), mode, rdev, uid, gid)
}

pub fn mkdir(ctx: &NodeContext, path: &str, mode: u32, uid: u32, gid: u32) -> Result<WireStat> {
    create_flare(ctx, path, FlareType::Directory, libc::S_IFDIR | (mode & 0o7777), 0, uid, gid)
}

pub fn symlink(ctx: &NodeContext, target: &str, path: &str, uid: u32, gid: u32) -> Result<WireStat> {
    let stat = create_flare(ctx, path, FlareType::Symlink, libc::S_IFLNK | 0o777, 0, uid, gid)?;
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    {
        let flare = entry.read().expect("flare lock poisoned");
        let contents = flare.contents_path(&ctx.hashpath);
        std::fs::write(contents, target.as_bytes())?;
    }
    let mut flare = entry.write().expect("flare lock poisoned");
    flare.stat.size = target.len() as u64;
    Ok(stat)
}

fn create_flare(
    ctx: &NodeContext,
    path: &str,
    ty: FlareType,
    mode: u32,
    rdev: u32,
    uid: u32,
    gid: u32,
) -> Result<WireStat> {
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    let mut flare = entry.write().expect("flare lock poisoned");
    if flare.contents_path(&ctx.hashpath).exists() {
        return Err(Error::AlreadyExists(path.to_string()));
    }
    flare.ty = ty;
    flare.is_upcasted = true;
    flare.stat.mode = mode;
    flare.stat.rdev = rdev as u64;
    flare.stat.uid = uid;
    flare.stat.gid = gid;
    flare.stat.nlink = 1;
    let now = now_secs();
    flare.stat.atime = now;
    flare.stat.ctime = now;
    flare.stat.mtime = now;
    store::save(&mut flare, &ctx.hashpath, &ctx.catalog, true)?;
    Ok(flare.stat)
}

pub fn read(ctx: &NodeContext, path: &str, offset: u64, size: u32, uid: u32, gid: u32) -> Result<Vec<u8>> {
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    let flare = entry.read().expect("flare lock poisoned");
    if flare.is_directory() {
        return Err(Error::IsADirectory(path.to_string()));
    }
    require(crate::flare::check(&flare, uid, gid, Access::READ, &ctx.groups))?;
    let capped = size.min(RW_CHUNK as u32) as usize;
    let contents = flare.contents_path(&ctx.hashpath);
    drop(flare);
    use std::io::{Read as _, Seek as _, SeekFrom};
    let mut f = std::fs::File::open(contents)?;
    f.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; capped];
    let n = f.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

pub fn write(ctx: &NodeContext, path: &str, offset: u64, data: &[u8], uid: u32, gid: u32) -> Result<u32> {
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    let mut flare = entry.write().expect("flare lock poisoned");
    if !flare.is_upcasted {
        flare.ty = FlareType::Regular;
        flare.stat.mode = libc::S_IFREG | 0o644;
        flare.stat.uid = uid;
        flare.stat.gid = gid;
        flare.is_upcasted = true;
        store::save(&mut flare, &ctx.hashpath, &ctx.catalog, true)?;
    }
    require(crate::flare::check(&flare, uid, gid, Access::WRITE, &ctx.groups))?;
    let capped = data.len().min(RW_CHUNK);
    let contents = flare.contents_path(&ctx.hashpath);
    use std::io::{Seek as _, SeekFrom, Write as _};
    let mut f = std::fs::OpenOptions::new().write(true).open(&contents)?;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(&data[..capped])?;
    let new_size = offset + capped as u64;
    if new_size > flare.stat.size {
        flare.stat.size = new_size;
    }
    flare.stat.mtime = now_secs();
    Ok(capped as u32)
}

pub fn unlink(ctx: &NodeContext, path: &str, uid: u32, gid: u32) -> Result<()> {
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    let flare = entry.read().expect("flare lock poisoned");
    if flare.is_directory() {
        return Err(Error::IsADirectory(path.to_string()));
    }
    require(crate::flare::check(&flare, uid, gid, Access::WRITE, &ctx.groups))?;
    store::erase(&flare, &ctx.hashpath, &ctx.catalog)?;
    let binhash = flare.binhash;
    drop(flare);
    ctx.cache.remove(&binhash);
    Ok(())
}

pub fn rmdir(ctx: &NodeContext, path: &str, uid: u32, gid: u32) -> Result<()> {
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    let flare = entry.read().expect("flare lock poisoned");
    if !flare.is_directory() {
        return Err(Error::NotADirectory(path.to_string()));
    }
    require(crate::flare::check(&flare, uid, gid, Access::WRITE, &ctx.groups))?;
    let body = directory::load_body(&flare.contents_path(&ctx.hashpath))?;
    if !directory::is_empty_directory(&body) {
        return Err(Error::NotEmpty(path.to_string()));
    }
    store::erase(&flare, &ctx.hashpath, &ctx.catalog)?;
    let binhash = flare.binhash;
    drop(flare);
    ctx.cache.remove(&binhash);
    Ok(())
}

pub fn readlink(ctx: &NodeContext, path: &str) -> Result<String> {
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    let flare = entry.read().expect("flare lock poisoned");
    if flare.ty != FlareType::Symlink {
        return Err(Error::InvalidArgument(format!("{path} is not a symlink")));
    }
    let bytes = std::fs::read(flare.contents_path(&ctx.hashpath))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn rename(_ctx: &NodeContext, _from: &str, _to: &str) -> Result<()> {
    // MAGMA refuses multi-node rename outright.
    Err(Error::CrossDevice)
}

pub fn chmod(ctx: &NodeContext, path: &str, mode: u32, uid: u32, gid: u32) -> Result<()> {
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    let mut flare = entry.write().expect("flare lock poisoned");
    if uid != 0 && flare.stat.uid != uid {
        return Err(Error::PermissionDenied);
    }
    let _ = gid;
    flare.stat.mode = (flare.stat.mode & libc::S_IFMT) | (mode & 0o7777);
    flare.stat.ctime = now_secs();
    store::save(&mut flare, &ctx.hashpath, &ctx.catalog, false)
}

pub fn chown(ctx: &NodeContext, path: &str, new_uid: u32, new_gid: u32, uid: u32) -> Result<()> {
    if uid != 0 {
        return Err(Error::PermissionDenied);
    }
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    let mut flare = entry.write().expect("flare lock poisoned");
    flare.stat.uid = new_uid;
    flare.stat.gid = new_gid;
    flare.stat.ctime = now_secs();
    store::save(&mut flare, &ctx.hashpath, &ctx.catalog, false)
}

pub fn truncate(ctx: &NodeContext, path: &str, size: u64, uid: u32, gid: u32) -> Result<()> {
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    let mut flare = entry.write().expect("flare lock poisoned");
    if flare.is_directory() {
        return Err(Error::IsADirectory(path.to_string()));
    }
    require(crate::flare::check(&flare, uid, gid, Access::WRITE, &ctx.groups))?;
    let contents = flare.contents_path(&ctx.hashpath);
    let file = std::fs::OpenOptions::new().write(true).open(&contents)?;
    file.set_len(size)?;
    flare.stat.size = size;
    flare.stat.mtime = now_secs();
    Ok(())
}

pub fn utime(ctx: &NodeContext, path: &str, atime: u64, mtime: u64, uid: u32, gid: u32) -> Result<()> {
    let entry = ctx.cache.search_or_create(path, &ctx.hashpath, &ctx.catalog)?;
    let mut flare = entry.write().expect("flare lock poisoned");
    require(crate::flare::check(&flare, uid, gid, Access::WRITE, &ctx.groups))?;
    flare.stat.atime = atime;
    flare.stat.mtime = mtime;
    Ok(())
}

pub struct StatfsResult {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
}

pub fn statfs(ctx: &NodeContext) -> Result<StatfsResult> {
    let vfs = nix::sys::statvfs::statvfs(&ctx.hashpath).map_err(|e| Error::Io(e.into()))?;
    Ok(StatfsResult {
        blocks: vfs.blocks(),
        bfree: vfs.blocks_free(),
        bavail: vfs.blocks_available(),
        files: vfs.files(),
        ffree: vfs.files_free(),
        bsize: vfs.block_size() as u32,
    })
}

/// Insert `name` into the directory at `parent_path`'s contents (the
/// parent-add fan-out common to `mknod` and `mkdir`). Creates the parent
/// directory body if this is the very first insertion on this node.
pub fn add_to_parent(ctx: &NodeContext, parent_path: &str, name: &str) -> Result<()> {
    let entry = ctx.cache.search_or_create(parent_path, &ctx.hashpath, &ctx.catalog)?;
    let mut flare = entry.write().expect("flare lock poisoned");
    if !flare.contents_path(&ctx.hashpath).exists() {
        flare.ty = FlareType::Directory;
        flare.is_upcasted = true;
        flare.stat.mode = libc::S_IFDIR | 0o755;
        store::save(&mut flare, &ctx.hashpath, &ctx.catalog, true)?;
    }
    let contents = flare.contents_path(&ctx.hashpath);
    let mut body = directory::load_body(&contents)?;
    directory::append_entry(&mut body, name);
    directory::save_body(&contents, &body)?;
    flare.stat.size = body.len() as u64;
    Ok(())
}

/// Zero the matching entry out of the parent directory's contents (the
/// remove-side counterpart of [`add_to_parent`]).
pub fn remove_from_parent(ctx: &NodeContext, parent_path: &str, name: &str) -> Result<()> {
    let entry = ctx.cache.search_or_create(parent_path, &ctx.hashpath, &ctx.catalog)?;
    let flare = entry.read().expect("flare lock poisoned");
    let contents = flare.contents_path(&ctx.hashpath);
    drop(flare);
    let mut body = directory::load_body(&contents)?;
    directory::remove_entry(&mut body, name);
    directory::save_body(&contents, &body)
}

/// Seed a brand-new root directory flare: used by bootstrap to create
/// `/` with mode `rwxrwxrwx`.
pub fn init_root(ctx: &NodeContext) -> Result<()> {
    let entry = ctx.cache.search_or_create("/", &ctx.hashpath, &ctx.catalog)?;
    let mut flare = entry.write().expect("flare lock poisoned");
    if flare.contents_path(&ctx.hashpath).exists() {
        return Ok(());
    }
    flare.ty = FlareType::Directory;
    flare.is_upcasted = true;
    flare.stat.mode = libc::S_IFDIR | 0o777;
    flare.stat.nlink = 2;
    store::save(&mut flare, &ctx.hashpath, &ctx.catalog, true)
}
