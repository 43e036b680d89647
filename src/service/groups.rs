//! Group management.
//!
//! Membership is always read from the store at dispatch time. A group's creator is
//! always one of its members; when the creator leaves, the earliest-joined member
//! takes over, and a group whose last member leaves is deleted.

use tracing::info;

use crate::constants::{GROUP_ENTRY_DELIMITER, LIST_DELIMITER, LeaveReason, PARAM_DELIMITER};
use crate::db::ChatStore;
use crate::server::ServerResponse;
use crate::service::connection::Session;
use crate::service::state::ServerState;
use crate::{Error, Result};

/// Reject names that would break list encodings on the wire.
pub fn check_name(command: &str, name: &str) -> Result<()> {
    let reserved = [PARAM_DELIMITER, LIST_DELIMITER, GROUP_ENTRY_DELIMITER];
    if name.chars().any(|c| reserved.contains(&c) || c.is_whitespace()) {
        return Err(Error::malformed(
            command,
            format!("'{}' contains a reserved character", name),
        ));
    }
    Ok(())
}

/// Fails unless `group` exists and `username` belongs to it.
pub async fn require_member(state: &ServerState, group: &str, username: &str) -> Result<()> {
    let (group, username) = (group.to_string(), username.to_string());
    state.db(move |store| member_check(store, &group, &username)).await
}

/// Membership check for code already running on the blocking pool.
pub fn member_check(store: &dyn ChatStore, group: &str, username: &str) -> Result<()> {
    if !store.group_exists(group)? {
        return Err(Error::NotFound(format!("group {}", group)));
    }
    if !store.is_member(group, username)? {
        return Err(Error::PermissionDenied(format!(
            "you are not a member of {}",
            group
        )));
    }
    Ok(())
}

pub async fn create_group(state: &ServerState, session: &Session, name: String) -> Result<()> {
    let actor = session.username()?;
    check_name("/creategroup", &name)?;
    let (group, creator) = (name.clone(), actor.to_string());
    state
        .db(move |store| store.create_group(&group, &creator))
        .await?;
    info!(group = %name, creator = %actor, "group created");
    session
        .reply(ServerResponse::CreateGroupSuccess { group: name })
        .await
}

pub async fn add_member(
    state: &ServerState,
    session: &Session,
    group: String,
    user: String,
) -> Result<()> {
    let actor = session.username()?;
    let members = {
        let (group, user, actor) = (group.clone(), user.clone(), actor.to_string());
        state
            .db(move |store| {
                member_check(store, &group, &actor)?;
                if !store.user_exists(&user)? {
                    return Err(Error::NotFound(format!("user {}", user)));
                }
                if !store.add_member(&group, &user)? {
                    return Err(Error::Duplicate(format!(
                        "{} is already a member of {}",
                        user, group
                    )));
                }
                store.group_members(&group)
            })
            .await?
    };
    info!(%group, %user, by = %actor, "member added");

    session
        .reply(ServerResponse::AddToGroupSuccess {
            group: group.clone(),
            user: user.clone(),
        })
        .await?;

    let update = ServerResponse::GroupUserAdded {
        group: group.clone(),
        user: user.clone(),
        added_by: actor.to_string(),
    };
    let others: Vec<String> = members.into_iter().filter(|m| *m != user).collect();
    state.sessions.multicast(&others, &update, Some(actor));
    state.sessions.send_to(
        &user,
        ServerResponse::AddedToGroup {
            group,
            added_by: actor.to_string(),
        },
    );
    Ok(())
}

pub async fn remove_member(
    state: &ServerState,
    session: &Session,
    group: String,
    user: String,
) -> Result<()> {
    let actor = session.username()?;
    let lookup = group.clone();
    let creator = state
        .db(move |store| store.group_creator(&lookup))
        .await?
        .ok_or_else(|| Error::NotFound(format!("group {}", group)))?;
    if creator != actor {
        return Err(Error::PermissionDenied(format!(
            "only the creator of {} may remove members",
            group
        )));
    }
    if user == actor {
        return leave_group(state, session, group).await;
    }
    let members = {
        let (group, user) = (group.clone(), user.clone());
        state
            .db(move |store| {
                if !store.remove_member(&group, &user)? {
                    return Err(Error::NotFound(format!("{} in group {}", user, group)));
                }
                store.group_members(&group)
            })
            .await?
    };
    info!(%group, %user, by = %actor, "member removed");

    session
        .reply(ServerResponse::RemoveFromGroupSuccess {
            group: group.clone(),
            user: user.clone(),
        })
        .await?;
    state.sessions.send_to(
        &user,
        ServerResponse::RemovedFromGroup {
            group: group.clone(),
            removed_by: actor.to_string(),
        },
    );
    state.sessions.multicast(
        &members,
        &ServerResponse::GroupUserLeft {
            group,
            user,
            reason: LeaveReason::Removed,
        },
        Some(actor),
    );
    Ok(())
}

pub async fn leave_group(state: &ServerState, session: &Session, group: String) -> Result<()> {
    let actor = session.username()?;
    let remaining = {
        let (group, actor) = (group.clone(), actor.to_string());
        state
            .db(move |store| {
                member_check(store, &group, &actor)?;
                let creator = store.group_creator(&group)?;
                store.remove_member(&group, &actor)?;

                let remaining = store.group_members(&group)?;
                match remaining.first() {
                    None => store.delete_group(&group)?,
                    Some(successor) if creator.as_deref() == Some(actor.as_str()) => {
                        store.set_group_creator(&group, successor)?;
                        info!(%group, creator = %successor, "group creator handed over");
                    }
                    Some(_) => {}
                }
                Ok(remaining)
            })
            .await?
    };
    session
        .reply(ServerResponse::LeftGroup {
            group: group.clone(),
        })
        .await?;

    if remaining.is_empty() {
        info!(%group, "group deleted after last member left");
        return session.reply(ServerResponse::GroupDeleted { group }).await;
    }
    info!(%group, user = %actor, "member left");
    state.sessions.multicast(
        &remaining,
        &ServerResponse::GroupUserLeft {
            group: group.clone(),
            user: actor.to_string(),
            reason: LeaveReason::Left,
        },
        None,
    );
    Ok(())
}

pub async fn list_groups(state: &ServerState, session: &Session) -> Result<()> {
    let actor = session.username()?;
    let user = actor.to_string();
    let groups = state.db(move |store| store.user_groups(&user)).await?;
    session.reply(ServerResponse::GroupList { groups }).await
}
