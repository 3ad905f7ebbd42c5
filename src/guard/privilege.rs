//! Privilege drop
//!
//! Switching user is irreversible for the rest of the process lifetime and
//! must happen before the lock is taken and before any job code runs.

use nix::unistd::{getegid, geteuid, getgrouplist, getgroups, initgroups, setgid, setuid, Gid, User};
use std::ffi::CString;

use super::GuardError;

/// Switch the process to `user` (name or numeric uid)
///
/// A no-op if the effective uid already matches. Otherwise the group list
/// is replaced by the user's own groups before gid and uid change. Fails
/// with [`GuardError::PrivilegeDrop`] unless the switch leaves us running
/// as the target uid and gid with exactly the user's groups.
pub fn drop_privileges(user: &str) -> Result<(), GuardError> {
    let entry = lookup(user)?;

    if geteuid() == entry.uid {
        log::debug!("Already running as {} (uid {})", entry.name, entry.uid);
        return Ok(());
    }

    let name = CString::new(entry.name.as_str()).map_err(|_| GuardError::UnknownUser(user.to_string()))?;
    let expected = getgrouplist(&name, entry.gid).unwrap_or_else(|_| vec![entry.gid]);

    // Groups and gid first: once the uid is gone we may no longer change them
    let switched = initgroups(&name, entry.gid)
        .and_then(|()| setgid(entry.gid))
        .and_then(|()| setuid(entry.uid));
    if let Err(e) = switched {
        log::error!("Unable to change user to {}: {}", entry.uid, e);
    }

    if geteuid() != entry.uid || getegid() != entry.gid || !same_groups(&expected) {
        let err = GuardError::PrivilegeDrop {
            user: user.to_string(),
            uid: entry.uid.as_raw(),
        };
        log::error!("{}", err);
        return Err(err);
    }

    log::info!("Running as {} (uid {})", entry.name, entry.uid);
    Ok(())
}

fn same_groups(expected: &[Gid]) -> bool {
    let Ok(mut current) = getgroups() else {
        return false;
    };
    let mut expected = expected.to_vec();
    current.sort_by_key(|g| g.as_raw());
    current.dedup();
    expected.sort_by_key(|g| g.as_raw());
    expected.dedup();
    current == expected
}

fn lookup(user: &str) -> Result<User, GuardError> {
    let found = match user.parse::<u32>() {
        Ok(uid) => User::from_uid(nix::unistd::Uid::from_raw(uid))?,
        Err(_) => User::from_name(user)?,
    };
    found.ok_or_else(|| GuardError::UnknownUser(user.to_string()))
}
