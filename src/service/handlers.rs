//! Command dispatch for the control port.

use tracing::{debug, info};

use crate::constants::{Direction, LoginFailure, MessageKind};
use crate::db::{Conversation, LoginCheck, NewUser, StoredMessage};
use crate::server::{ClientCommand, CommandCode, HistoryItem, ServerResponse};
use crate::protocol::split_command;
use crate::service::connection::Session;
use crate::service::groups;
use crate::service::state::ServerState;
use crate::service::transfer::{TransferRequest, TransferTarget};
use crate::{Error, Result};

/// What the read loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Decode and run one control line.
pub async fn handle_line(line: &str, session: &mut Session, state: &ServerState) -> Result<Flow> {
    let (token, args) = split_command(line);
    let code = match CommandCode::parse(token) {
        Ok(code) => code,
        Err(_) if session.username.is_none() => return Err(Error::Unauthenticated),
        Err(e) => return Err(e),
    };

    if session.username.is_none() && !code.allowed_unauthenticated() {
        return Err(Error::Unauthenticated);
    }

    let command = match ClientCommand::read_with_code(code, args) {
        Ok(command) => command,
        Err(Error::Malformed { .. }) if code == CommandCode::Login => {
            session
                .reply(ServerResponse::LoginFail {
                    reason: LoginFailure::Malformed,
                })
                .await?;
            return Ok(Flow::Continue);
        }
        Err(e) => return Err(e),
    };

    handle_client_command(command, session, state).await
}

pub async fn handle_client_command(
    command: ClientCommand,
    session: &mut Session,
    state: &ServerState,
) -> Result<Flow> {
    match command {
        ClientCommand::Login { username, password } => {
            handle_login(username, password, session, state).await?;
        }

        ClientCommand::Register {
            username,
            password,
            full_name,
            email,
        } => {
            let user = NewUser {
                username,
                password,
                full_name,
                email,
            };
            handle_register(user, session, state).await?;
        }

        ClientCommand::PrivateMessage { receiver, content } => {
            let sender = session.username()?;
            let msg = {
                let (from, to, text) = (sender.to_string(), receiver.clone(), content.clone());
                state
                    .db(move |store| {
                        if !store.user_exists(&to)? {
                            return Err(Error::NotFound(format!("user {}", to)));
                        }
                        store.save_message(&from, &to, &text, MessageKind::Private)
                    })
                    .await?
            };

            state.sessions.send_to(
                &receiver,
                ServerResponse::PrivateMessage {
                    peer: sender.to_string(),
                    direction: Direction::Received,
                    timestamp: msg.timestamp,
                    content: content.clone(),
                },
            );
            session
                .reply(ServerResponse::PrivateMessage {
                    peer: receiver,
                    direction: Direction::Sent,
                    timestamp: msg.timestamp,
                    content,
                })
                .await?;
        }

        ClientCommand::GroupMessage { group, content } => {
            let sender = session.username()?;
            let (msg, members) = {
                let (from, to, text) = (sender.to_string(), group.clone(), content.clone());
                state
                    .db(move |store| {
                        groups::member_check(store, &to, &from)?;
                        let msg = store.save_message(&from, &to, &text, MessageKind::Group)?;
                        Ok((msg, store.group_members(&to)?))
                    })
                    .await?
            };
            let response = ServerResponse::GroupMessage {
                group,
                sender: sender.to_string(),
                timestamp: msg.timestamp,
                content,
            };
            state.sessions.multicast(&members, &response, Some(sender));
            session.reply(response).await?;
        }

        ClientCommand::GlobalMessage { content } => {
            let sender = session.username()?;
            let msg = {
                let (from, text) = (sender.to_string(), content.clone());
                state
                    .db(move |store| store.save_message(&from, "", &text, MessageKind::Global))
                    .await?
            };
            let response = ServerResponse::GlobalMessage {
                sender: sender.to_string(),
                timestamp: msg.timestamp,
                content,
            };
            state.sessions.broadcast(&response, Some(sender));
            session.reply(response).await?;
        }

        ClientCommand::OnlineUsers => {
            let users = state.sessions.list_online().into_iter().collect();
            session.reply(ServerResponse::OnlineUsers { users }).await?;
        }

        ClientCommand::History {
            partner,
            kind,
            limit,
        } => {
            let conversation = conversation_for(state, session, &partner, kind).await?;
            let limit = state.config.page_limit(limit, state.config.history_limit);
            let messages = state
                .db(move |store| store.recent_messages(&conversation, limit))
                .await?;
            debug!(%partner, kind = kind.as_str(), count = messages.len(), "history fetched");

            session
                .reply(ServerResponse::HistoryStart {
                    partner: partner.clone(),
                })
                .await?;
            for msg in messages {
                session
                    .reply(ServerResponse::HistoryItem(history_item(msg)))
                    .await?;
            }
            session.reply(ServerResponse::HistoryEnd { partner }).await?;
        }

        ClientCommand::LoadMore {
            partner,
            kind,
            before,
            limit,
        } => {
            let conversation = conversation_for(state, session, &partner, kind).await?;
            let limit = state.config.page_limit(limit, state.config.load_more_limit);
            let messages = state
                .db(move |store| store.messages_before(&conversation, before, limit))
                .await?;

            session
                .reply(ServerResponse::LoadMoreStart {
                    partner: partner.clone(),
                })
                .await?;
            for msg in messages {
                session
                    .reply(ServerResponse::LoadMoreItem(history_item(msg)))
                    .await?;
            }
            session.reply(ServerResponse::LoadMoreEnd { partner }).await?;
        }

        ClientCommand::DeleteHistory { partner } => {
            let user = session.username()?;
            let count = {
                let (user, partner) = (user.to_string(), partner.clone());
                state
                    .db(move |store| store.delete_private_history(&user, &partner))
                    .await?
            };
            info!(%user, %partner, count, "private history deleted");
            session
                .reply(ServerResponse::HistoryDeleted { partner, count })
                .await?;
        }

        ClientCommand::CreateGroup { name } => groups::create_group(state, session, name).await?,
        ClientCommand::AddToGroup { group, user } => {
            groups::add_member(state, session, group, user).await?
        }
        ClientCommand::RemoveFromGroup { group, user } => {
            groups::remove_member(state, session, group, user).await?
        }
        ClientCommand::LeaveGroup { group } => groups::leave_group(state, session, group).await?,
        ClientCommand::GetGroups => groups::list_groups(state, session).await?,

        ClientCommand::FileSend {
            receiver,
            file_size,
            transfer_id,
            file_name,
        } => {
            handle_file_send(
                TransferTarget::User(receiver),
                file_size,
                transfer_id,
                file_name,
                session,
                state,
            )
            .await?;
        }

        ClientCommand::GroupFileSend {
            group,
            file_size,
            transfer_id,
            file_name,
        } => {
            handle_file_send(
                TransferTarget::Group(group),
                file_size,
                transfer_id,
                file_name,
                session,
                state,
            )
            .await?;
        }

        ClientCommand::FileAccept { transfer_id } => {
            handle_file_accept(transfer_id, session, state).await?;
        }

        ClientCommand::FileReject { transfer_id } => {
            let user = session.username()?;
            let request = state.transfers.reject(&transfer_id, user)?;
            info!(%transfer_id, by = %user, "transfer rejected");
            state.sessions.send_to(
                &request.sender,
                ServerResponse::FileRejected {
                    transfer_id: transfer_id.clone(),
                },
            );
            session
                .reply(ServerResponse::FileRejected { transfer_id })
                .await?;
        }

        ClientCommand::FileDownload { transfer_id } => {
            let response = download_ticket(&transfer_id, session, state).await?;
            session.reply(response).await?;
        }

        ClientCommand::Exit => {
            debug!(username = ?session.username, "client requested exit");
            return Ok(Flow::Close);
        }
    }

    Ok(Flow::Continue)
}

async fn handle_login(
    username: String,
    password: String,
    session: &mut Session,
    state: &ServerState,
) -> Result<()> {
    if let Some(current) = &session.username {
        return Err(Error::AlreadyAuthenticated(current.clone()));
    }

    let check = {
        let username = username.clone();
        state
            .db(move |store| store.check_login(&username, &password))
            .await?
    };
    let failure = match check {
        LoginCheck::UnknownAccount => Some(LoginFailure::UnknownAccount),
        LoginCheck::WrongPassword => Some(LoginFailure::InvalidCredentials),
        LoginCheck::Valid => {
            // Presence check and registration are one atomic step.
            if state.sessions.register(&username, session.handle()) {
                None
            } else {
                Some(LoginFailure::AlreadyOnline)
            }
        }
    };

    if let Some(reason) = failure {
        info!(%username, addr = %session.addr, reason = reason.as_str(), "login refused");
        return session.reply(ServerResponse::LoginFail { reason }).await;
    }

    info!(%username, addr = %session.addr, online = state.sessions.online_count(), "user logged in");
    session.username = Some(username.clone());

    session
        .reply(ServerResponse::LoginSuccess {
            username: username.clone(),
        })
        .await?;
    let users = state.sessions.list_online().into_iter().collect();
    session.reply(ServerResponse::OnlineUsers { users }).await?;

    state.sessions.broadcast(
        &ServerResponse::UserJoined {
            username: username.clone(),
        },
        Some(&username),
    );
    Ok(())
}

async fn handle_register(user: NewUser, session: &Session, state: &ServerState) -> Result<()> {
    if let Err(e) = groups::check_name("/register", &user.username) {
        return session
            .reply(ServerResponse::RegisterFail {
                reason: e.to_string(),
            })
            .await;
    }

    let username = user.username.clone();
    match state.db(move |store| store.register_user(&user)).await {
        Ok(()) => {
            info!(%username, "user registered");
            session
                .reply(ServerResponse::RegisterSuccess { username })
                .await
        }
        Err(Error::Duplicate(_)) => {
            session
                .reply(ServerResponse::RegisterFail {
                    reason: format!("Username {} is already taken", username),
                })
                .await
        }
        Err(e) => Err(e),
    }
}

async fn conversation_for(
    state: &ServerState,
    session: &Session,
    partner: &str,
    kind: MessageKind,
) -> Result<Conversation> {
    let user = session.username()?;
    Ok(match kind {
        MessageKind::Private => Conversation::Private {
            user: user.to_string(),
            partner: partner.to_string(),
        },
        MessageKind::Group => {
            groups::require_member(state, partner, user).await?;
            Conversation::Group(partner.to_string())
        }
        MessageKind::Global => Conversation::Global,
    })
}

fn history_item(msg: StoredMessage) -> HistoryItem {
    HistoryItem {
        sender: msg.sender,
        timestamp: msg.timestamp,
        content: msg.content,
    }
}

/// Strip any directory part a client put in a file name.
pub fn sanitize_file_name(name: &str) -> String {
    name.rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim()
        .to_string()
}

async fn handle_file_send(
    target: TransferTarget,
    file_size: u64,
    transfer_id: Option<String>,
    file_name: String,
    session: &Session,
    state: &ServerState,
) -> Result<()> {
    let sender = session.username()?;
    let command = if target.is_group() {
        "/groupfilesend"
    } else {
        "/filesend"
    };

    if file_size == 0 {
        return Err(Error::malformed(command, "file is empty"));
    }
    if file_size > state.config.max_file_size {
        return Err(Error::malformed(
            command,
            format!("file exceeds {} bytes", state.config.max_file_size),
        ));
    }
    let file_name = sanitize_file_name(&file_name);
    if file_name.is_empty() || file_name == "." || file_name == ".." {
        return Err(Error::malformed(command, "invalid file name"));
    }
    let transfer_id = transfer_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    groups::check_name(command, &transfer_id)?;

    // Ids stay unique after the transfer leaves the in-memory table.
    let stored = {
        let id = transfer_id.clone();
        state.db(move |store| store.file(&id)).await?
    };
    if stored.is_some() {
        return Err(Error::Duplicate(format!("transfer {}", transfer_id)));
    }

    match &target {
        TransferTarget::User(receiver) => {
            let lookup = receiver.clone();
            if !state.db(move |store| store.user_exists(&lookup)).await? {
                return Err(Error::NotFound(format!("user {}", receiver)));
            }
            let online = receiver != sender && state.sessions.is_online(receiver);
            let request = TransferRequest::new(
                transfer_id.clone(),
                sender,
                target.clone(),
                file_name.clone(),
                file_size,
            );
            state.transfers.announce(request, !online)?;
            info!(%transfer_id, %sender, %receiver, file_size, online, "file announced");

            session
                .reply(ServerResponse::FileRequest {
                    transfer_id: transfer_id.clone(),
                    peer: receiver.clone(),
                    file_size,
                    file_name: file_name.clone(),
                })
                .await?;
            if online {
                state.sessions.send_to(
                    receiver,
                    ServerResponse::FileRequest {
                        transfer_id,
                        peer: sender.to_string(),
                        file_size,
                        file_name,
                    },
                );
            } else {
                session
                    .reply(ServerResponse::FileAccepted { transfer_id })
                    .await?;
            }
        }
        TransferTarget::Group(group) => {
            groups::require_member(state, group, sender).await?;
            let request = TransferRequest::new(
                transfer_id.clone(),
                sender,
                target.clone(),
                file_name.clone(),
                file_size,
            );
            state.transfers.announce(request, true)?;
            info!(%transfer_id, %sender, %group, file_size, "group file announced");

            let notice = ServerResponse::GroupFileRequest {
                group: group.clone(),
                transfer_id: transfer_id.clone(),
                sender: sender.to_string(),
                file_size,
                file_name,
            };
            let lookup = group.clone();
            let members = state.db(move |store| store.group_members(&lookup)).await?;
            state.sessions.multicast(&members, &notice, Some(sender));
            session.reply(notice).await?;
            session
                .reply(ServerResponse::FileAccepted { transfer_id })
                .await?;
        }
    }
    Ok(())
}

async fn handle_file_accept(transfer_id: String, session: &Session, state: &ServerState) -> Result<()> {
    let user = session.username()?;

    let Some(pending) = state.transfers.get(&transfer_id) else {
        // Already stored: accepting is the same as asking for the download.
        let response = download_ticket(&transfer_id, session, state).await?;
        return session.reply(response).await;
    };

    match &pending.target {
        TransferTarget::User(_) => {
            let request = state.transfers.accept(&transfer_id, user)?;
            info!(%transfer_id, by = %user, "transfer accepted");
            let delivered = state.sessions.send_to(
                &request.sender,
                ServerResponse::FileAccepted {
                    transfer_id: transfer_id.clone(),
                },
            );
            if !delivered {
                state.transfers.fail(&transfer_id);
                return Err(Error::Unavailable(format!(
                    "{} is no longer online",
                    request.sender
                )));
            }
        }
        TransferTarget::Group(group) => {
            groups::require_member(state, group, user).await?;
            state.transfers.register_interest(&transfer_id, user)?;
            debug!(%transfer_id, %user, "waiting for group file upload");
        }
    }
    Ok(())
}

/// Authorise a download and describe the stored artifact.
async fn download_ticket(
    transfer_id: &str,
    session: &Session,
    state: &ServerState,
) -> Result<ServerResponse> {
    let user = session.username()?;
    let id = transfer_id.to_string();
    let Some(record) = state.db(move |store| store.file(&id)).await? else {
        let reason = match state.transfers.get(transfer_id) {
            Some(_) => "is not stored yet",
            None => "has no stored file",
        };
        return Err(Error::Unavailable(format!("transfer {} {}", transfer_id, reason)));
    };

    let allowed = record.sender == user
        || if record.is_group {
            let (group, member) = (record.receiver.clone(), user.to_string());
            state
                .db(move |store| store.is_member(&group, &member))
                .await?
        } else {
            record.receiver == user
        };
    if !allowed {
        return Err(Error::PermissionDenied(format!(
            "transfer {} is not yours",
            transfer_id
        )));
    }
    if !std::path::Path::new(&record.storage_path).is_file() {
        return Err(Error::Unavailable(format!(
            "file for transfer {} is missing",
            transfer_id
        )));
    }

    Ok(ServerResponse::FileDownload {
        transfer_id: record.id,
        file_size: record.file_size,
        file_name: record.file_name,
    })
}
