//! `check`: POSIX permission bits plus a supplementary-group cache.

use super::types::Flare;
use std::collections::HashMap;
use std::sync::Mutex;

bitflags::bitflags! {
    /// Requested operations, and the bitmask `check` returns of the ones
    /// still *not* permitted (zero means fully allowed).
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ    = 0b100;
        const WRITE   = 0b010;
        const EXECUTE = 0b001;
    }
}

/// Caches `getgrouplist`-style supplementary group lookups per uid so a
/// hot path doesn't hit `nix::unistd::getgrouplist` on every request.
#[derive(Default)]
pub struct GroupCache {
    groups: Mutex<HashMap<u32, Vec<u32>>>,
}

impl GroupCache {
    pub fn new() -> GroupCache {
        GroupCache::default()
    }

    /// The uid's primary gid plus supplementary groups, looked up once
    /// per uid and cached thereafter.
    pub fn groups_for(&self, uid: u32) -> Vec<u32> {
        if let Some(hit) = self.groups.lock().expect("group cache poisoned").get(&uid) {
            return hit.clone();
        }
        let looked_up = lookup_supplementary_groups(uid);
        self.groups.lock().expect("group cache poisoned").insert(uid, looked_up.clone());
        looked_up
    }
}

fn lookup_supplementary_groups(uid: u32) -> Vec<u32> {
    let user = match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
        Ok(Some(u)) => u,
        _ => return Vec::new(),
    };
    match nix::unistd::getgrouplist(&std::ffi::CString::new(user.name).unwrap_or_default(), user.gid) {
        Ok(groups) => groups.into_iter().map(|g| g.as_raw()).collect(),
        Err(_) => vec![user.gid.as_raw()],
    }
}

/// Returns the subset of `ops` still not permitted. Root (uid 0) is
/// always fully permitted. Otherwise each requested bit is granted if the
/// owner matches and the owner bit is set, or the group matches (primary
/// or supplementary) and the group bit is set, or the other bit is set.
pub fn check(flare: &Flare, uid: u32, gid: u32, ops: Access, groups: &GroupCache) -> Access {
    if uid == 0 {
        return Access::empty();
    }
    let mode = flare.stat.mode;
    let is_owner = flare.stat.uid == uid;
    let member_groups = groups.groups_for(uid);
    let is_group = flare.stat.gid == gid || member_groups.contains(&flare.stat.gid);

    let mut denied = Access::empty();
    for (bit, owner_shift, group_shift, other_shift) in [
        (Access::READ, 8, 5, 2),
        (Access::WRITE, 7, 4, 1),
        (Access::EXECUTE, 6, 3, 0),
    ] {
        if !ops.contains(bit) {
            continue;
        }
        let owner_ok = is_owner && (mode >> owner_shift) & 1 != 0;
        let group_ok = is_group && (mode >> group_shift) & 1 != 0;
        let other_ok = (mode >> other_shift) & 1 != 0;
        if !(owner_ok || group_ok || other_ok) {
            denied |= bit;
        }
    }
    denied
}

/// Enforceable policy hook: a pluggable ACL checker consulted on top of
/// the POSIX bits. The default defers entirely to [`check`], matching the
/// always-allow ACL stub this node ships with.
pub trait AclPolicy: Send + Sync {
    fn check(&self, flare: &Flare, uid: u32, gid: u32, ops: Access, groups: &GroupCache) -> Access {
        check(flare, uid, gid, ops, groups)
    }
}

/// The default policy: no ACL beyond the POSIX mode bits.
pub struct AllowAll;

impl AclPolicy for AllowAll {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WireStat;

    fn flare_with_mode(mode: u32, owner: u32, group: u32) -> Flare {
        let mut f = Flare::new("/f");
        f.stat = WireStat { mode, uid: owner, gid: group, ..Default::default() };
        f
    }

    #[test]
    fn root_is_always_allowed() {
        let f = flare_with_mode(0o000, 1, 1);
        let groups = GroupCache::new();
        assert_eq!(check(&f, 0, 0, Access::all(), &groups), Access::empty());
    }

    #[test]
    fn owner_write_bit_governs_owner_access() {
        let f = flare_with_mode(0o600, 42, 42);
        let groups = GroupCache::new();
        assert_eq!(check(&f, 42, 100, Access::WRITE, &groups), Access::empty());
        assert_eq!(check(&f, 99, 100, Access::WRITE, &groups), Access::WRITE);
    }

    #[test]
    fn other_bit_grants_to_everyone_else() {
        let f = flare_with_mode(0o004, 1, 1);
        let groups = GroupCache::new();
        assert_eq!(check(&f, 99, 99, Access::READ, &groups), Access::empty());
    }

    #[test]
    fn denial_only_reports_the_unpermitted_bits() {
        let f = flare_with_mode(0o644, 1, 1);
        let groups = GroupCache::new();
        let denied = check(&f, 99, 99, Access::READ | Access::WRITE, &groups);
        assert_eq!(denied, Access::WRITE);
    }
}
