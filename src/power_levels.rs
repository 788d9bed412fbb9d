// ABOUTME: Bidirectional mapping between remote admin roles and local power levels
// ABOUTME: Enforces the bridge-level ceiling so the bridge never grants what it cannot enforce

use crate::intent::PowerLevels;
use crate::telegram::AdminRights;
use telebridge_core::ids::MatrixUserId;
use telebridge_core::media::ParticipantRole;

/// Level assigned to chat creators.
pub const LEVEL_CREATOR: i64 = 95;
/// At or above this level a user gets the full admin bundle, including the
/// right to promote others. Same cutoff both directions.
pub const LEVEL_FULL_ADMIN: i64 = 75;
/// At or above this level a user gets the moderator bundle. Same cutoff
/// both directions.
pub const LEVEL_MODERATOR: i64 = 50;

/// Remote role -> local power level.
pub fn level_for_role(role: ParticipantRole) -> i64 {
    match role {
        ParticipantRole::Creator => LEVEL_CREATOR,
        ParticipantRole::Admin { can_add_admins: true } => LEVEL_FULL_ADMIN,
        ParticipantRole::Admin { can_add_admins: false } => LEVEL_MODERATOR,
        ParticipantRole::Regular => 0,
    }
}

/// Local power level -> remote admin rights, the inverse of
/// `level_for_role` at the same thresholds.
pub fn rights_for_level(level: i64) -> AdminRights {
    if level >= LEVEL_FULL_ADMIN {
        AdminRights {
            change_info: true,
            post_messages: true,
            edit_messages: true,
            delete_messages: true,
            ban_users: true,
            invite_users: true,
            pin_messages: true,
            add_admins: true,
        }
    } else if level >= LEVEL_MODERATOR {
        AdminRights {
            change_info: true,
            post_messages: true,
            edit_messages: true,
            delete_messages: true,
            ban_users: true,
            invite_users: true,
            pin_messages: true,
            add_admins: false,
        }
    } else {
        AdminRights::none()
    }
}

/// Apply one participant's remote role to the local power-level state.
///
/// Returns true when the state changed. The bridge's own level is a hard
/// ceiling: computed levels are clamped strictly below it, and users already
/// at or above it are left untouched, since the bridge could not enforce a
/// change on them anyway.
pub fn apply_remote_role(
    levels: &mut PowerLevels,
    user: &MatrixUserId,
    role: ParticipantRole,
    bridge_level: i64,
) -> bool {
    let computed = level_for_role(role).min(bridge_level.saturating_sub(1));
    let current = levels.level_of(user);
    if current >= bridge_level {
        return false;
    }
    if computed == current {
        return false;
    }
    if computed == levels.users_default {
        levels.users.remove(user);
    } else {
        levels.users.insert(user.clone(), computed);
    }
    true
}

/// Compute which users' remote admin rights need updating after a local
/// power-level change, skipping the acting user and the bridge itself.
pub fn diff_for_remote<'a>(
    old: &'a PowerLevels,
    new: &'a PowerLevels,
    acting_user: &MatrixUserId,
    bridge_user: &MatrixUserId,
) -> Vec<(&'a MatrixUserId, AdminRights)> {
    let mut changes = Vec::new();
    for (user, &level) in &new.users {
        if user == acting_user || user == bridge_user {
            continue;
        }
        if old.level_of(user) != level {
            changes.push((user, rights_for_level(level)));
        }
    }
    // Users dropped back to the default level lose their rights
    for user in old.users.keys() {
        if user == acting_user || user == bridge_user {
            continue;
        }
        if !new.users.contains_key(user) && old.level_of(user) >= LEVEL_MODERATOR {
            changes.push((user, AdminRights::none()));
        }
    }
    changes
}
