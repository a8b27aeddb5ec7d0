//! Permission matching and device-tree authorization.
//!
//! Permissions are dot-separated tokens such as `device.control`. A granted
//! pattern may use `*` to match exactly one segment and `**` to match the
//! remaining segments (including none).

use std::collections::{HashSet, VecDeque};

/// Upper bound on how far tree walks follow parent or child links.
pub const MAX_TREE_DEPTH: usize = 64;

/// Permission that grants administrative access to the whole tree.
pub const ADMIN_PERMISSION: &str = "admin.manage";

/// Parent/child structure of the device tree.
pub trait DeviceTree {
    fn parent_of(&self, uid: u64) -> Option<u64>;

    fn children_of(&self, uid: u64) -> Vec<u64>;

    fn all_uids(&self) -> Vec<u64>;
}

/// Returns whether `granted` covers `required`.
pub fn permission_matches(required: &str, granted: &str) -> bool {
    let mut required = required.split('.');
    let mut granted = granted.split('.');
    loop {
        match (granted.next(), required.next()) {
            (Some("**"), _) => return true,
            (Some("*"), Some(_)) => {}
            (Some(g), Some(r)) if g == r => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Permissions held by an authenticated session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub permissions: HashSet<String>,
    pub is_admin: bool,
}

impl AuthContext {
    pub fn from_permissions<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let permissions: HashSet<String> = permissions.into_iter().map(Into::into).collect();
        let is_admin = permissions.contains("**") || permissions.contains(ADMIN_PERMISSION);
        Self {
            permissions,
            is_admin,
        }
    }

    /// Returns whether any held permission covers `required`.
    pub fn allows(&self, required: &str) -> bool {
        self.is_admin
            || self
                .permissions
                .iter()
                .any(|granted| permission_matches(required, granted))
    }
}

/// Returns whether `ancestor` is a strict ancestor of `uid`.
pub fn is_ancestor<T: DeviceTree + ?Sized>(tree: &T, ancestor: u64, uid: u64) -> bool {
    let mut current = uid;
    for _ in 0..MAX_TREE_DEPTH {
        match tree.parent_of(current) {
            Some(parent) if parent == ancestor => return true,
            Some(parent) if parent != current => current = parent,
            _ => return false,
        }
    }
    false
}

/// Lists every descendant of `root`, breadth first.
pub fn list_descendants<T: DeviceTree + ?Sized>(tree: &T, root: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([(root, 0usize)]);

    while let Some((uid, depth)) = queue.pop_front() {
        if depth >= MAX_TREE_DEPTH {
            continue;
        }
        for child in tree.children_of(uid) {
            if seen.insert(child) {
                out.push(child);
                queue.push_back((child, depth + 1));
            }
        }
    }
    out
}

/// Returns whether `requester` may act on `target`.
///
/// Admins may act on anything. Everyone else may act on themselves and on
/// their descendants.
pub fn can_control_device<T: DeviceTree + ?Sized>(
    tree: &T,
    ctx: &AuthContext,
    requester: u64,
    target: u64,
) -> bool {
    ctx.is_admin || requester == target || is_ancestor(tree, requester, target)
}

/// Devices `requester` is allowed to see: the whole tree for admins,
/// otherwise itself plus its descendants.
pub fn visible_devices<T: DeviceTree + ?Sized>(
    tree: &T,
    ctx: &AuthContext,
    requester: u64,
) -> Vec<u64> {
    if ctx.is_admin {
        return tree.all_uids();
    }
    let mut uids = vec![requester];
    uids.extend(list_descendants(tree, requester));
    uids
}
