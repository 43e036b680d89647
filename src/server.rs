//! Control-channel message types.
//!
//! Clients send [`ClientCommand`]s and the server answers with [`ServerResponse`]s.
//! Every message is a single line: a command token, a space, then `|`-separated fields.

use std::str::FromStr;

use crate::constants::{
    Direction, GROUP_ENTRY_DELIMITER, LIST_DELIMITER, LeaveReason, LoginFailure, MessageKind,
};
use crate::constants::ErrorCode;
use crate::protocol::{join_fields, split_command, split_fields};
use crate::{Error, Result};

/// Command tokens sent by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    Login,
    Register,
    PrivateMessage,
    GroupMessage,
    GlobalMessage,
    OnlineUsers,
    History,
    LoadMore,
    DeleteHistory,
    CreateGroup,
    AddToGroup,
    RemoveFromGroup,
    LeaveGroup,
    GetGroups,
    FileSend,
    GroupFileSend,
    FileAccept,
    FileReject,
    FileDownload,
    Exit,
}

impl CommandCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandCode::Login => "/login",
            CommandCode::Register => "/register",
            CommandCode::PrivateMessage => "/private",
            CommandCode::GroupMessage => "/groupmsg",
            CommandCode::GlobalMessage => "/global",
            CommandCode::OnlineUsers => "/online",
            CommandCode::History => "/history",
            CommandCode::LoadMore => "/loadmore",
            CommandCode::DeleteHistory => "/deletehistory",
            CommandCode::CreateGroup => "/creategroup",
            CommandCode::AddToGroup => "/addtogroup",
            CommandCode::RemoveFromGroup => "/removefromgroup",
            CommandCode::LeaveGroup => "/leavegroup",
            CommandCode::GetGroups => "/getgroups",
            CommandCode::FileSend => "/filesend",
            CommandCode::GroupFileSend => "/groupfilesend",
            CommandCode::FileAccept => "/fileaccept",
            CommandCode::FileReject => "/filereject",
            CommandCode::FileDownload => "/filedownload",
            CommandCode::Exit => "/exit",
        }
    }

    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "/login" => Ok(CommandCode::Login),
            "/register" => Ok(CommandCode::Register),
            "/private" => Ok(CommandCode::PrivateMessage),
            "/groupmsg" => Ok(CommandCode::GroupMessage),
            "/global" => Ok(CommandCode::GlobalMessage),
            "/online" => Ok(CommandCode::OnlineUsers),
            "/history" => Ok(CommandCode::History),
            "/loadmore" => Ok(CommandCode::LoadMore),
            "/deletehistory" => Ok(CommandCode::DeleteHistory),
            "/creategroup" => Ok(CommandCode::CreateGroup),
            "/addtogroup" => Ok(CommandCode::AddToGroup),
            "/removefromgroup" => Ok(CommandCode::RemoveFromGroup),
            "/leavegroup" => Ok(CommandCode::LeaveGroup),
            "/getgroups" => Ok(CommandCode::GetGroups),
            "/filesend" => Ok(CommandCode::FileSend),
            "/groupfilesend" => Ok(CommandCode::GroupFileSend),
            "/fileaccept" => Ok(CommandCode::FileAccept),
            "/filereject" => Ok(CommandCode::FileReject),
            "/filedownload" => Ok(CommandCode::FileDownload),
            "/exit" | "/logout" => Ok(CommandCode::Exit),
            _ => Err(Error::UnknownCommand(token.to_string())),
        }
    }

    /// Commands a connection may issue before it has logged in.
    pub fn allowed_unauthenticated(&self) -> bool {
        matches!(
            self,
            CommandCode::Login | CommandCode::Register | CommandCode::Exit
        )
    }
}

/// Commands sent by clients on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Login {
        username: String,
        password: String,
    },
    Register {
        username: String,
        password: String,
        full_name: Option<String>,
        email: Option<String>,
    },
    PrivateMessage {
        receiver: String,
        content: String,
    },
    GroupMessage {
        group: String,
        content: String,
    },
    GlobalMessage {
        content: String,
    },
    OnlineUsers,
    /// Newest messages of a conversation.
    History {
        partner: String,
        kind: MessageKind,
        limit: Option<u32>,
    },
    /// Messages strictly older than `before` (epoch milliseconds).
    LoadMore {
        partner: String,
        kind: MessageKind,
        before: i64,
        limit: Option<u32>,
    },
    DeleteHistory {
        partner: String,
    },
    CreateGroup {
        name: String,
    },
    AddToGroup {
        group: String,
        user: String,
    },
    RemoveFromGroup {
        group: String,
        user: String,
    },
    LeaveGroup {
        group: String,
    },
    GetGroups,
    /// Announce a file for a single user. An empty transfer id asks the server to pick one.
    FileSend {
        receiver: String,
        file_size: u64,
        transfer_id: Option<String>,
        file_name: String,
    },
    GroupFileSend {
        group: String,
        file_size: u64,
        transfer_id: Option<String>,
        file_name: String,
    },
    FileAccept {
        transfer_id: String,
    },
    FileReject {
        transfer_id: String,
    },
    FileDownload {
        transfer_id: String,
    },
    Exit,
}

/// Positional access to the fields of one message, with errors naming the command.
struct Fields<'a> {
    command: &'static str,
    fields: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn new(command: &'static str, args: &'a str, max_fields: Option<usize>, min: usize) -> Result<Self> {
        let fields = split_fields(args, max_fields);
        if fields.len() < min {
            return Err(Error::malformed(
                command,
                format!("expected at least {} fields, got {}", min, fields.len()),
            ));
        }
        Ok(Self { command, fields })
    }

    /// A trimmed, non-empty identifier.
    fn ident(&self, index: usize, name: &str) -> Result<String> {
        let value = self.fields.get(index).map(|s| s.trim()).unwrap_or_default();
        if value.is_empty() {
            return Err(Error::malformed(self.command, format!("missing {}", name)));
        }
        Ok(value.to_string())
    }

    /// Free text kept as sent; must not be blank.
    fn text(&self, index: usize, name: &str) -> Result<String> {
        let value = self.fields.get(index).copied().unwrap_or_default();
        if value.trim().is_empty() {
            return Err(Error::malformed(self.command, format!("missing {}", name)));
        }
        Ok(value.to_string())
    }

    fn optional(&self, index: usize) -> Option<String> {
        self.fields
            .get(index)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn number<T: FromStr>(&self, index: usize, name: &str) -> Result<T> {
        let raw = self.ident(index, name)?;
        raw.parse()
            .map_err(|_| Error::malformed(self.command, format!("invalid {}: {}", name, raw)))
    }

    fn optional_number<T: FromStr>(&self, index: usize, name: &str) -> Result<Option<T>> {
        match self.optional(index) {
            Some(_) => self.number(index, name).map(Some),
            None => Ok(None),
        }
    }

    fn kind(&self, index: usize) -> Result<MessageKind> {
        let raw = self.ident(index, "kind")?;
        MessageKind::parse(&raw)
            .ok_or_else(|| Error::malformed(self.command, format!("invalid kind: {}", raw)))
    }
}

impl ClientCommand {
    pub fn code(&self) -> CommandCode {
        match self {
            ClientCommand::Login { .. } => CommandCode::Login,
            ClientCommand::Register { .. } => CommandCode::Register,
            ClientCommand::PrivateMessage { .. } => CommandCode::PrivateMessage,
            ClientCommand::GroupMessage { .. } => CommandCode::GroupMessage,
            ClientCommand::GlobalMessage { .. } => CommandCode::GlobalMessage,
            ClientCommand::OnlineUsers => CommandCode::OnlineUsers,
            ClientCommand::History { .. } => CommandCode::History,
            ClientCommand::LoadMore { .. } => CommandCode::LoadMore,
            ClientCommand::DeleteHistory { .. } => CommandCode::DeleteHistory,
            ClientCommand::CreateGroup { .. } => CommandCode::CreateGroup,
            ClientCommand::AddToGroup { .. } => CommandCode::AddToGroup,
            ClientCommand::RemoveFromGroup { .. } => CommandCode::RemoveFromGroup,
            ClientCommand::LeaveGroup { .. } => CommandCode::LeaveGroup,
            ClientCommand::GetGroups => CommandCode::GetGroups,
            ClientCommand::FileSend { .. } => CommandCode::FileSend,
            ClientCommand::GroupFileSend { .. } => CommandCode::GroupFileSend,
            ClientCommand::FileAccept { .. } => CommandCode::FileAccept,
            ClientCommand::FileReject { .. } => CommandCode::FileReject,
            ClientCommand::FileDownload { .. } => CommandCode::FileDownload,
            ClientCommand::Exit => CommandCode::Exit,
        }
    }

    /// Decode the argument text of a command whose token has already been matched.
    pub fn read_with_code(code: CommandCode, args: &str) -> Result<Self> {
        let name = code.as_str();
        match code {
            CommandCode::Login => {
                let f = Fields::new(name, args, Some(2), 2)?;
                Ok(ClientCommand::Login {
                    username: f.ident(0, "username")?,
                    password: f.text(1, "password")?,
                })
            }
            CommandCode::Register => {
                let f = Fields::new(name, args, Some(4), 2)?;
                Ok(ClientCommand::Register {
                    username: f.ident(0, "username")?,
                    password: f.text(1, "password")?,
                    full_name: f.optional(2),
                    email: f.optional(3),
                })
            }
            CommandCode::PrivateMessage => {
                let f = Fields::new(name, args, Some(2), 2)?;
                Ok(ClientCommand::PrivateMessage {
                    receiver: f.ident(0, "receiver")?,
                    content: f.text(1, "content")?,
                })
            }
            CommandCode::GroupMessage => {
                let f = Fields::new(name, args, Some(2), 2)?;
                Ok(ClientCommand::GroupMessage {
                    group: f.ident(0, "group")?,
                    content: f.text(1, "content")?,
                })
            }
            CommandCode::GlobalMessage => {
                let f = Fields::new(name, args, Some(1), 1)?;
                Ok(ClientCommand::GlobalMessage {
                    content: f.text(0, "content")?,
                })
            }
            CommandCode::OnlineUsers => Ok(ClientCommand::OnlineUsers),
            CommandCode::History => {
                let f = Fields::new(name, args, Some(3), 2)?;
                Ok(ClientCommand::History {
                    partner: f.ident(0, "partner")?,
                    kind: f.kind(1)?,
                    limit: f.optional_number(2, "limit")?,
                })
            }
            CommandCode::LoadMore => {
                let f = Fields::new(name, args, Some(4), 3)?;
                Ok(ClientCommand::LoadMore {
                    partner: f.ident(0, "partner")?,
                    kind: f.kind(1)?,
                    before: f.number(2, "watermark")?,
                    limit: f.optional_number(3, "limit")?,
                })
            }
            CommandCode::DeleteHistory => {
                let f = Fields::new(name, args, Some(1), 1)?;
                Ok(ClientCommand::DeleteHistory {
                    partner: f.ident(0, "partner")?,
                })
            }
            CommandCode::CreateGroup => {
                let f = Fields::new(name, args, Some(1), 1)?;
                Ok(ClientCommand::CreateGroup {
                    name: f.ident(0, "group name")?,
                })
            }
            CommandCode::AddToGroup => {
                let f = Fields::new(name, args, Some(2), 2)?;
                Ok(ClientCommand::AddToGroup {
                    group: f.ident(0, "group")?,
                    user: f.ident(1, "user")?,
                })
            }
            CommandCode::RemoveFromGroup => {
                let f = Fields::new(name, args, Some(2), 2)?;
                Ok(ClientCommand::RemoveFromGroup {
                    group: f.ident(0, "group")?,
                    user: f.ident(1, "user")?,
                })
            }
            CommandCode::LeaveGroup => {
                let f = Fields::new(name, args, Some(1), 1)?;
                Ok(ClientCommand::LeaveGroup {
                    group: f.ident(0, "group")?,
                })
            }
            CommandCode::GetGroups => Ok(ClientCommand::GetGroups),
            CommandCode::FileSend => {
                let f = Fields::new(name, args, Some(4), 4)?;
                Ok(ClientCommand::FileSend {
                    receiver: f.ident(0, "receiver")?,
                    file_size: f.number(1, "file size")?,
                    transfer_id: f.optional(2),
                    file_name: f.text(3, "file name")?,
                })
            }
            CommandCode::GroupFileSend => {
                let f = Fields::new(name, args, Some(4), 4)?;
                Ok(ClientCommand::GroupFileSend {
                    group: f.ident(0, "group")?,
                    file_size: f.number(1, "file size")?,
                    transfer_id: f.optional(2),
                    file_name: f.text(3, "file name")?,
                })
            }
            CommandCode::FileAccept => {
                let f = Fields::new(name, args, Some(1), 1)?;
                Ok(ClientCommand::FileAccept {
                    transfer_id: f.ident(0, "transfer id")?,
                })
            }
            CommandCode::FileReject => {
                let f = Fields::new(name, args, Some(1), 1)?;
                Ok(ClientCommand::FileReject {
                    transfer_id: f.ident(0, "transfer id")?,
                })
            }
            CommandCode::FileDownload => {
                let f = Fields::new(name, args, Some(1), 1)?;
                Ok(ClientCommand::FileDownload {
                    transfer_id: f.ident(0, "transfer id")?,
                })
            }
            CommandCode::Exit => Ok(ClientCommand::Exit),
        }
    }

    /// Encode the command as a line, without the terminator.
    pub fn to_line(&self) -> String {
        let fields: Vec<String> = match self {
            ClientCommand::Login { username, password } => vec![username.clone(), password.clone()],
            ClientCommand::Register {
                username,
                password,
                full_name,
                email,
            } => {
                let mut fields = vec![username.clone(), password.clone()];
                if full_name.is_some() || email.is_some() {
                    fields.push(full_name.clone().unwrap_or_default());
                }
                if let Some(email) = email {
                    fields.push(email.clone());
                }
                fields
            }
            ClientCommand::PrivateMessage { receiver, content } => {
                vec![receiver.clone(), content.clone()]
            }
            ClientCommand::GroupMessage { group, content } => vec![group.clone(), content.clone()],
            ClientCommand::GlobalMessage { content } => vec![content.clone()],
            ClientCommand::History {
                partner,
                kind,
                limit,
            } => {
                let mut fields = vec![partner.clone(), kind.as_str().to_string()];
                if let Some(limit) = limit {
                    fields.push(limit.to_string());
                }
                fields
            }
            ClientCommand::LoadMore {
                partner,
                kind,
                before,
                limit,
            } => {
                let mut fields = vec![
                    partner.clone(),
                    kind.as_str().to_string(),
                    before.to_string(),
                ];
                if let Some(limit) = limit {
                    fields.push(limit.to_string());
                }
                fields
            }
            ClientCommand::DeleteHistory { partner } => vec![partner.clone()],
            ClientCommand::CreateGroup { name } => vec![name.clone()],
            ClientCommand::AddToGroup { group, user }
            | ClientCommand::RemoveFromGroup { group, user } => vec![group.clone(), user.clone()],
            ClientCommand::LeaveGroup { group } => vec![group.clone()],
            ClientCommand::FileSend {
                receiver: target,
                file_size,
                transfer_id,
                file_name,
            }
            | ClientCommand::GroupFileSend {
                group: target,
                file_size,
                transfer_id,
                file_name,
            } => vec![
                target.clone(),
                file_size.to_string(),
                transfer_id.clone().unwrap_or_default(),
                file_name.clone(),
            ],
            ClientCommand::FileAccept { transfer_id }
            | ClientCommand::FileReject { transfer_id }
            | ClientCommand::FileDownload { transfer_id } => vec![transfer_id.clone()],
            ClientCommand::OnlineUsers | ClientCommand::GetGroups | ClientCommand::Exit => vec![],
        };
        format_line(self.code().as_str(), &fields)
    }
}

/// Decode one control-channel line sent by a client.
pub fn read_client_command(line: &str) -> Result<ClientCommand> {
    let (token, args) = split_command(line);
    let code = CommandCode::parse(token)?;
    ClientCommand::read_with_code(code, args)
}

/// A group as listed by `/grouplist`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub creator: String,
    pub members: Vec<String>,
}

/// One message of a history page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryItem {
    pub sender: String,
    pub timestamp: i64,
    pub content: String,
}

/// Response tokens sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    LoginSuccess,
    LoginFail,
    RegisterSuccess,
    RegisterFail,
    Error,
    OnlineUsers,
    UserJoined,
    UserLeft,
    PrivateMessage,
    GroupMessage,
    GlobalMessage,
    HistoryStart,
    HistoryItem,
    HistoryEnd,
    LoadMoreStart,
    LoadMoreItem,
    LoadMoreEnd,
    HistoryDeleted,
    CreateGroupSuccess,
    AddToGroupSuccess,
    GroupUserAdded,
    AddedToGroup,
    RemoveFromGroupSuccess,
    RemovedFromGroup,
    GroupUserLeft,
    LeftGroup,
    GroupDeleted,
    GroupList,
    FileRequest,
    GroupFileRequest,
    FileAccepted,
    FileRejected,
    FileAvailable,
    GroupFileAvailable,
    FileDownload,
    FileDelivered,
    FileFailed,
}

impl ResponseCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseCode::LoginSuccess => "/loginsuccess",
            ResponseCode::LoginFail => "/loginfail",
            ResponseCode::RegisterSuccess => "/registersuccess",
            ResponseCode::RegisterFail => "/registerfail",
            ResponseCode::Error => "/error",
            ResponseCode::OnlineUsers => "/onlineusers",
            ResponseCode::UserJoined => "/userjoined",
            ResponseCode::UserLeft => "/userleft",
            ResponseCode::PrivateMessage => "/privatemsg",
            ResponseCode::GroupMessage => "/groupmsg",
            ResponseCode::GlobalMessage => "/globalmsg",
            ResponseCode::HistoryStart => "/historystart",
            ResponseCode::HistoryItem => "/historyitem",
            ResponseCode::HistoryEnd => "/historyend",
            ResponseCode::LoadMoreStart => "/loadmorestart",
            ResponseCode::LoadMoreItem => "/loadmoreitem",
            ResponseCode::LoadMoreEnd => "/loadmoreend",
            ResponseCode::HistoryDeleted => "/historydeleted",
            ResponseCode::CreateGroupSuccess => "/creategroupsuccess",
            ResponseCode::AddToGroupSuccess => "/addtogroupsuccess",
            ResponseCode::GroupUserAdded => "/groupuseradded",
            ResponseCode::AddedToGroup => "/addedtogroup",
            ResponseCode::RemoveFromGroupSuccess => "/removefromgroupsuccess",
            ResponseCode::RemovedFromGroup => "/removedfromgroup",
            ResponseCode::GroupUserLeft => "/groupuserleft",
            ResponseCode::LeftGroup => "/leftgroup",
            ResponseCode::GroupDeleted => "/groupdeleted",
            ResponseCode::GroupList => "/grouplist",
            ResponseCode::FileRequest => "/filerequest",
            ResponseCode::GroupFileRequest => "/groupfilerequest",
            ResponseCode::FileAccepted => "/fileaccepted",
            ResponseCode::FileRejected => "/filerejected",
            ResponseCode::FileAvailable => "/fileavailable",
            ResponseCode::GroupFileAvailable => "/groupfileavailable",
            ResponseCode::FileDownload => "/filedownload",
            ResponseCode::FileDelivered => "/filedelivered",
            ResponseCode::FileFailed => "/filefailed",
        }
    }

    pub fn parse(token: &str) -> Result<Self> {
        const ALL: [ResponseCode; 37] = [
            ResponseCode::LoginSuccess,
            ResponseCode::LoginFail,
            ResponseCode::RegisterSuccess,
            ResponseCode::RegisterFail,
            ResponseCode::Error,
            ResponseCode::OnlineUsers,
            ResponseCode::UserJoined,
            ResponseCode::UserLeft,
            ResponseCode::PrivateMessage,
            ResponseCode::GroupMessage,
            ResponseCode::GlobalMessage,
            ResponseCode::HistoryStart,
            ResponseCode::HistoryItem,
            ResponseCode::HistoryEnd,
            ResponseCode::LoadMoreStart,
            ResponseCode::LoadMoreItem,
            ResponseCode::LoadMoreEnd,
            ResponseCode::HistoryDeleted,
            ResponseCode::CreateGroupSuccess,
            ResponseCode::AddToGroupSuccess,
            ResponseCode::GroupUserAdded,
            ResponseCode::AddedToGroup,
            ResponseCode::RemoveFromGroupSuccess,
            ResponseCode::RemovedFromGroup,
            ResponseCode::GroupUserLeft,
            ResponseCode::LeftGroup,
            ResponseCode::GroupDeleted,
            ResponseCode::GroupList,
            ResponseCode::FileRequest,
            ResponseCode::GroupFileRequest,
            ResponseCode::FileAccepted,
            ResponseCode::FileRejected,
            ResponseCode::FileAvailable,
            ResponseCode::GroupFileAvailable,
            ResponseCode::FileDownload,
            ResponseCode::FileDelivered,
            ResponseCode::FileFailed,
        ];
        ALL.into_iter()
            .find(|code| code.as_str() == token)
            .ok_or_else(|| Error::UnknownCommand(token.to_string()))
    }
}

/// Responses and notifications sent by the server on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResponse {
    LoginSuccess {
        username: String,
    },
    LoginFail {
        reason: LoginFailure,
    },
    RegisterSuccess {
        username: String,
    },
    RegisterFail {
        reason: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    OnlineUsers {
        users: Vec<String>,
    },
    UserJoined {
        username: String,
    },
    UserLeft {
        username: String,
    },
    /// A private message; `peer` is the other party from the recipient's point of view.
    PrivateMessage {
        peer: String,
        direction: Direction,
        timestamp: i64,
        content: String,
    },
    GroupMessage {
        group: String,
        sender: String,
        timestamp: i64,
        content: String,
    },
    GlobalMessage {
        sender: String,
        timestamp: i64,
        content: String,
    },
    HistoryStart {
        partner: String,
    },
    HistoryItem(HistoryItem),
    HistoryEnd {
        partner: String,
    },
    LoadMoreStart {
        partner: String,
    },
    LoadMoreItem(HistoryItem),
    LoadMoreEnd {
        partner: String,
    },
    HistoryDeleted {
        partner: String,
        count: u64,
    },
    CreateGroupSuccess {
        group: String,
    },
    AddToGroupSuccess {
        group: String,
        user: String,
    },
    /// Sent to existing members when someone joins.
    GroupUserAdded {
        group: String,
        user: String,
        added_by: String,
    },
    /// Sent to the user who was added.
    AddedToGroup {
        group: String,
        added_by: String,
    },
    RemoveFromGroupSuccess {
        group: String,
        user: String,
    },
    /// Sent to the user who was removed.
    RemovedFromGroup {
        group: String,
        removed_by: String,
    },
    GroupUserLeft {
        group: String,
        user: String,
        reason: LeaveReason,
    },
    LeftGroup {
        group: String,
    },
    GroupDeleted {
        group: String,
    },
    GroupList {
        groups: Vec<GroupEntry>,
    },
    FileRequest {
        transfer_id: String,
        peer: String,
        file_size: u64,
        file_name: String,
    },
    GroupFileRequest {
        group: String,
        transfer_id: String,
        sender: String,
        file_size: u64,
        file_name: String,
    },
    /// The sender may open its SEND leg.
    FileAccepted {
        transfer_id: String,
    },
    FileRejected {
        transfer_id: String,
    },
    FileAvailable {
        transfer_id: String,
        sender: String,
        file_size: u64,
        file_name: String,
    },
    GroupFileAvailable {
        group: String,
        transfer_id: String,
        sender: String,
        file_size: u64,
        file_name: String,
    },
    /// The requester may open a RECEIVE leg.
    FileDownload {
        transfer_id: String,
        file_size: u64,
        file_name: String,
    },
    FileDelivered {
        transfer_id: String,
    },
    FileFailed {
        transfer_id: String,
        reason: String,
    },
}

impl ServerResponse {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerResponse::Error {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ResponseCode {
        match self {
            ServerResponse::LoginSuccess { .. } => ResponseCode::LoginSuccess,
            ServerResponse::LoginFail { .. } => ResponseCode::LoginFail,
            ServerResponse::RegisterSuccess { .. } => ResponseCode::RegisterSuccess,
            ServerResponse::RegisterFail { .. } => ResponseCode::RegisterFail,
            ServerResponse::Error { .. } => ResponseCode::Error,
            ServerResponse::OnlineUsers { .. } => ResponseCode::OnlineUsers,
            ServerResponse::UserJoined { .. } => ResponseCode::UserJoined,
            ServerResponse::UserLeft { .. } => ResponseCode::UserLeft,
            ServerResponse::PrivateMessage { .. } => ResponseCode::PrivateMessage,
            ServerResponse::GroupMessage { .. } => ResponseCode::GroupMessage,
            ServerResponse::GlobalMessage { .. } => ResponseCode::GlobalMessage,
            ServerResponse::HistoryStart { .. } => ResponseCode::HistoryStart,
            ServerResponse::HistoryItem(_) => ResponseCode::HistoryItem,
            ServerResponse::HistoryEnd { .. } => ResponseCode::HistoryEnd,
            ServerResponse::LoadMoreStart { .. } => ResponseCode::LoadMoreStart,
            ServerResponse::LoadMoreItem(_) => ResponseCode::LoadMoreItem,
            ServerResponse::LoadMoreEnd { .. } => ResponseCode::LoadMoreEnd,
            ServerResponse::HistoryDeleted { .. } => ResponseCode::HistoryDeleted,
            ServerResponse::CreateGroupSuccess { .. } => ResponseCode::CreateGroupSuccess,
            ServerResponse::AddToGroupSuccess { .. } => ResponseCode::AddToGroupSuccess,
            ServerResponse::GroupUserAdded { .. } => ResponseCode::GroupUserAdded,
            ServerResponse::AddedToGroup { .. } => ResponseCode::AddedToGroup,
            ServerResponse::RemoveFromGroupSuccess { .. } => ResponseCode::RemoveFromGroupSuccess,
            ServerResponse::RemovedFromGroup { .. } => ResponseCode::RemovedFromGroup,
            ServerResponse::GroupUserLeft { .. } => ResponseCode::GroupUserLeft,
            ServerResponse::LeftGroup { .. } => ResponseCode::LeftGroup,
            ServerResponse::GroupDeleted { .. } => ResponseCode::GroupDeleted,
            ServerResponse::GroupList { .. } => ResponseCode::GroupList,
            ServerResponse::FileRequest { .. } => ResponseCode::FileRequest,
            ServerResponse::GroupFileRequest { .. } => ResponseCode::GroupFileRequest,
            ServerResponse::FileAccepted { .. } => ResponseCode::FileAccepted,
            ServerResponse::FileRejected { .. } => ResponseCode::FileRejected,
            ServerResponse::FileAvailable { .. } => ResponseCode::FileAvailable,
            ServerResponse::GroupFileAvailable { .. } => ResponseCode::GroupFileAvailable,
            ServerResponse::FileDownload { .. } => ResponseCode::FileDownload,
            ServerResponse::FileDelivered { .. } => ResponseCode::FileDelivered,
            ServerResponse::FileFailed { .. } => ResponseCode::FileFailed,
        }
    }

    /// Encode the response as a line, without the terminator.
    pub fn to_line(&self) -> String {
        let fields: Vec<String> = match self {
            ServerResponse::LoginSuccess { username }
            | ServerResponse::RegisterSuccess { username }
            | ServerResponse::UserJoined { username }
            | ServerResponse::UserLeft { username } => vec![username.clone()],
            ServerResponse::LoginFail { reason } => vec![
                reason.as_str().to_string(),
                reason.description().to_string(),
            ],
            ServerResponse::RegisterFail { reason } => vec![reason.clone()],
            ServerResponse::Error { code, message } => {
                vec![code.as_str().to_string(), message.clone()]
            }
            ServerResponse::OnlineUsers { users } => {
                vec![users.join(LIST_DELIMITER.to_string().as_str())]
            }
            ServerResponse::PrivateMessage {
                peer,
                direction,
                timestamp,
                content,
            } => vec![
                peer.clone(),
                direction.as_str().to_string(),
                timestamp.to_string(),
                content.clone(),
            ],
            ServerResponse::GroupMessage {
                group,
                sender,
                timestamp,
                content,
            } => vec![
                group.clone(),
                sender.clone(),
                timestamp.to_string(),
                content.clone(),
            ],
            ServerResponse::GlobalMessage {
                sender,
                timestamp,
                content,
            } => vec![sender.clone(), timestamp.to_string(), content.clone()],
            ServerResponse::HistoryStart { partner }
            | ServerResponse::HistoryEnd { partner }
            | ServerResponse::LoadMoreStart { partner }
            | ServerResponse::LoadMoreEnd { partner } => vec![partner.clone()],
            ServerResponse::HistoryItem(item) | ServerResponse::LoadMoreItem(item) => vec![
                item.sender.clone(),
                item.timestamp.to_string(),
                item.content.clone(),
            ],
            ServerResponse::HistoryDeleted { partner, count } => {
                vec![partner.clone(), count.to_string()]
            }
            ServerResponse::CreateGroupSuccess { group }
            | ServerResponse::LeftGroup { group }
            | ServerResponse::GroupDeleted { group } => vec![group.clone()],
            ServerResponse::AddToGroupSuccess { group, user }
            | ServerResponse::RemoveFromGroupSuccess { group, user } => {
                vec![group.clone(), user.clone()]
            }
            ServerResponse::GroupUserAdded {
                group,
                user,
                added_by,
            } => vec![group.clone(), user.clone(), added_by.clone()],
            ServerResponse::AddedToGroup { group, added_by } => {
                vec![group.clone(), added_by.clone()]
            }
            ServerResponse::RemovedFromGroup { group, removed_by } => {
                vec![group.clone(), removed_by.clone()]
            }
            ServerResponse::GroupUserLeft {
                group,
                user,
                reason,
            } => vec![group.clone(), user.clone(), reason.as_str().to_string()],
            ServerResponse::GroupList { groups } => groups
                .iter()
                .map(|g| {
                    format!(
                        "{}{sep}{}{sep}{}",
                        g.name,
                        g.creator,
                        g.members.join(LIST_DELIMITER.to_string().as_str()),
                        sep = GROUP_ENTRY_DELIMITER
                    )
                })
                .collect(),
            ServerResponse::FileRequest {
                transfer_id,
                peer,
                file_size,
                file_name,
            } => vec![
                transfer_id.clone(),
                peer.clone(),
                file_size.to_string(),
                file_name.clone(),
            ],
            ServerResponse::GroupFileRequest {
                group,
                transfer_id,
                sender,
                file_size,
                file_name,
            }
            | ServerResponse::GroupFileAvailable {
                group,
                transfer_id,
                sender,
                file_size,
                file_name,
            } => vec![
                group.clone(),
                transfer_id.clone(),
                sender.clone(),
                file_size.to_string(),
                file_name.clone(),
            ],
            ServerResponse::FileAccepted { transfer_id }
            | ServerResponse::FileRejected { transfer_id }
            | ServerResponse::FileDelivered { transfer_id } => vec![transfer_id.clone()],
            ServerResponse::FileAvailable {
                transfer_id,
                sender,
                file_size,
                file_name,
            } => vec![
                transfer_id.clone(),
                sender.clone(),
                file_size.to_string(),
                file_name.clone(),
            ],
            ServerResponse::FileDownload {
                transfer_id,
                file_size,
                file_name,
            } => vec![transfer_id.clone(), file_size.to_string(), file_name.clone()],
            ServerResponse::FileFailed {
                transfer_id,
                reason,
            } => vec![transfer_id.clone(), reason.clone()],
        };
        format_line(self.code().as_str(), &fields)
    }

    /// Decode the argument text of a response whose token has already been matched.
    pub fn read_with_code(code: ResponseCode, args: &str) -> Result<Self> {
        let name = code.as_str();
        match code {
            ResponseCode::LoginSuccess => {
                let f = Fields::new(name, args, Some(1), 1)?;
                Ok(ServerResponse::LoginSuccess {
                    username: f.ident(0, "username")?,
                })
            }
            ResponseCode::LoginFail => {
                let f = Fields::new(name, args, Some(2), 1)?;
                let raw = f.ident(0, "reason")?;
                let reason = LoginFailure::parse(&raw)
                    .ok_or_else(|| Error::malformed(name, format!("invalid reason: {}", raw)))?;
                Ok(ServerResponse::LoginFail { reason })
            }
            ResponseCode::RegisterSuccess => {
                let f = Fields::new(name, args, Some(1), 1)?;
                Ok(ServerResponse::RegisterSuccess {
                    username: f.ident(0, "username")?,
                })
            }
            ResponseCode::RegisterFail => Ok(ServerResponse::RegisterFail {
                reason: args.to_string(),
            }),
            ResponseCode::Error => {
                let f = Fields::new(name, args, Some(2), 1)?;
                let raw = f.ident(0, "code")?;
                let code = ErrorCode::parse(&raw)
                    .ok_or_else(|| Error::malformed(name, format!("invalid code: {}", raw)))?;
                Ok(ServerResponse::Error {
                    code,
                    message: f.fields.get(1).copied().unwrap_or_default().to_string(),
                })
            }
            ResponseCode::OnlineUsers => Ok(ServerResponse::OnlineUsers {
                users: args
                    .split(LIST_DELIMITER)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            }),
            ResponseCode::UserJoined => {
                let f = Fields::new(name, args, Some(1), 1)?;
                Ok(ServerResponse::UserJoined {
                    username: f.ident(0, "username")?,
                })
            }
            ResponseCode::UserLeft => {
                let f = Fields::new(name, args, Some(1), 1)?;
                Ok(ServerResponse::UserLeft {
                    username: f.ident(0, "username")?,
                })
            }
            ResponseCode::PrivateMessage => {
                let f = Fields::new(name, args, Some(4), 4)?;
                let raw = f.ident(1, "direction")?;
                let direction = Direction::parse(&raw)
                    .ok_or_else(|| Error::malformed(name, format!("invalid direction: {}", raw)))?;
                Ok(ServerResponse::PrivateMessage {
                    peer: f.ident(0, "peer")?,
                    direction,
                    timestamp: f.number(2, "timestamp")?,
                    content: f.fields[3].to_string(),
                })
            }
            ResponseCode::GroupMessage => {
                let f = Fields::new(name, args, Some(4), 4)?;
                Ok(ServerResponse::GroupMessage {
                    group: f.ident(0, "group")?,
                    sender: f.ident(1, "sender")?,
                    timestamp: f.number(2, "timestamp")?,
                    content: f.fields[3].to_string(),
                })
            }
            ResponseCode::GlobalMessage => {
                let f = Fields::new(name, args, Some(3), 3)?;
                Ok(ServerResponse::GlobalMessage {
                    sender: f.ident(0, "sender")?,
                    timestamp: f.number(1, "timestamp")?,
                    content: f.fields[2].to_string(),
                })
            }
            ResponseCode::HistoryStart
            | ResponseCode::HistoryEnd
            | ResponseCode::LoadMoreStart
            | ResponseCode::LoadMoreEnd => {
                let partner = args.to_string();
                Ok(match code {
                    ResponseCode::HistoryStart => ServerResponse::HistoryStart { partner },
                    ResponseCode::HistoryEnd => ServerResponse::HistoryEnd { partner },
                    ResponseCode::LoadMoreStart => ServerResponse::LoadMoreStart { partner },
                    _ => ServerResponse::LoadMoreEnd { partner },
                })
            }
            ResponseCode::HistoryItem | ResponseCode::LoadMoreItem => {
                let f = Fields::new(name, args, Some(3), 3)?;
                let item = HistoryItem {
                    sender: f.ident(0, "sender")?,
                    timestamp: f.number(1, "timestamp")?,
                    content: f.fields[2].to_string(),
                };
                Ok(if code == ResponseCode::HistoryItem {
                    ServerResponse::HistoryItem(item)
                } else {
                    ServerResponse::LoadMoreItem(item)
                })
            }
            ResponseCode::HistoryDeleted => {
                let f = Fields::new(name, args, Some(2), 2)?;
                Ok(ServerResponse::HistoryDeleted {
                    partner: f.ident(0, "partner")?,
                    count: f.number(1, "count")?,
                })
            }
            ResponseCode::CreateGroupSuccess | ResponseCode::LeftGroup | ResponseCode::GroupDeleted => {
                let f = Fields::new(name, args, Some(1), 1)?;
                let group = f.ident(0, "group")?;
                Ok(match code {
                    ResponseCode::CreateGroupSuccess => ServerResponse::CreateGroupSuccess { group },
                    ResponseCode::LeftGroup => ServerResponse::LeftGroup { group },
                    _ => ServerResponse::GroupDeleted { group },
                })
            }
            ResponseCode::AddToGroupSuccess | ResponseCode::RemoveFromGroupSuccess => {
                let f = Fields::new(name, args, Some(2), 2)?;
                let group = f.ident(0, "group")?;
                let user = f.ident(1, "user")?;
                Ok(if code == ResponseCode::AddToGroupSuccess {
                    ServerResponse::AddToGroupSuccess { group, user }
                } else {
                    ServerResponse::RemoveFromGroupSuccess { group, user }
                })
            }
            ResponseCode::GroupUserAdded => {
                let f = Fields::new(name, args, Some(3), 3)?;
                Ok(ServerResponse::GroupUserAdded {
                    group: f.ident(0, "group")?,
                    user: f.ident(1, "user")?,
                    added_by: f.ident(2, "added by")?,
                })
            }
            ResponseCode::AddedToGroup => {
                let f = Fields::new(name, args, Some(2), 2)?;
                Ok(ServerResponse::AddedToGroup {
                    group: f.ident(0, "group")?,
                    added_by: f.ident(1, "added by")?,
                })
            }
            ResponseCode::RemovedFromGroup => {
                let f = Fields::new(name, args, Some(2), 2)?;
                Ok(ServerResponse::RemovedFromGroup {
                    group: f.ident(0, "group")?,
                    removed_by: f.ident(1, "removed by")?,
                })
            }
            ResponseCode::GroupUserLeft => {
                let f = Fields::new(name, args, Some(3), 3)?;
                let raw = f.ident(2, "reason")?;
                let reason = LeaveReason::parse(&raw)
                    .ok_or_else(|| Error::malformed(name, format!("invalid reason: {}", raw)))?;
                Ok(ServerResponse::GroupUserLeft {
                    group: f.ident(0, "group")?,
                    user: f.ident(1, "user")?,
                    reason,
                })
            }
            ResponseCode::GroupList => {
                let mut groups = Vec::new();
                for entry in split_fields(args, None) {
                    let mut parts = entry.splitn(3, GROUP_ENTRY_DELIMITER);
                    let (Some(group), Some(creator), Some(members)) =
                        (parts.next(), parts.next(), parts.next())
                    else {
                        return Err(Error::malformed(name, format!("invalid entry: {}", entry)));
                    };
                    groups.push(GroupEntry {
                        name: group.to_string(),
                        creator: creator.to_string(),
                        members: members
                            .split(LIST_DELIMITER)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect(),
                    });
                }
                Ok(ServerResponse::GroupList { groups })
            }
            ResponseCode::FileRequest | ResponseCode::FileAvailable => {
                let f = Fields::new(name, args, Some(4), 4)?;
                let transfer_id = f.ident(0, "transfer id")?;
                let peer = f.ident(1, "peer")?;
                let file_size = f.number(2, "file size")?;
                let file_name = f.fields[3].to_string();
                Ok(if code == ResponseCode::FileRequest {
                    ServerResponse::FileRequest {
                        transfer_id,
                        peer,
                        file_size,
                        file_name,
                    }
                } else {
                    ServerResponse::FileAvailable {
                        transfer_id,
                        sender: peer,
                        file_size,
                        file_name,
                    }
                })
            }
            ResponseCode::GroupFileRequest | ResponseCode::GroupFileAvailable => {
                let f = Fields::new(name, args, Some(5), 5)?;
                let group = f.ident(0, "group")?;
                let transfer_id = f.ident(1, "transfer id")?;
                let sender = f.ident(2, "sender")?;
                let file_size = f.number(3, "file size")?;
                let file_name = f.fields[4].to_string();
                Ok(if code == ResponseCode::GroupFileRequest {
                    ServerResponse::GroupFileRequest {
                        group,
                        transfer_id,
                        sender,
                        file_size,
                        file_name,
                    }
                } else {
                    ServerResponse::GroupFileAvailable {
                        group,
                        transfer_id,
                        sender,
                        file_size,
                        file_name,
                    }
                })
            }
            ResponseCode::FileAccepted | ResponseCode::FileRejected | ResponseCode::FileDelivered => {
                let f = Fields::new(name, args, Some(1), 1)?;
                let transfer_id = f.ident(0, "transfer id")?;
                Ok(match code {
                    ResponseCode::FileAccepted => ServerResponse::FileAccepted { transfer_id },
                    ResponseCode::FileRejected => ServerResponse::FileRejected { transfer_id },
                    _ => ServerResponse::FileDelivered { transfer_id },
                })
            }
            ResponseCode::FileDownload => {
                let f = Fields::new(name, args, Some(3), 3)?;
                Ok(ServerResponse::FileDownload {
                    transfer_id: f.ident(0, "transfer id")?,
                    file_size: f.number(1, "file size")?,
                    file_name: f.fields[2].to_string(),
                })
            }
            ResponseCode::FileFailed => {
                let f = Fields::new(name, args, Some(2), 2)?;
                Ok(ServerResponse::FileFailed {
                    transfer_id: f.ident(0, "transfer id")?,
                    reason: f.fields[1].to_string(),
                })
            }
        }
    }
}

/// Decode one control-channel line sent by the server.
pub fn read_server_response(line: &str) -> Result<ServerResponse> {
    let (token, args) = split_command(line);
    let code = ResponseCode::parse(token)?;
    ServerResponse::read_with_code(code, args)
}

fn format_line(token: &str, fields: &[String]) -> String {
    if fields.is_empty() || (fields.len() == 1 && fields[0].is_empty()) {
        return token.to_string();
    }
    format!("{} {}", token, join_fields(fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_command() {
        let cmd = read_client_command("/login alice|pa|ss").unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Login {
                username: "alice".into(),
                password: "pa|ss".into()
            }
        );
    }

    #[test]
    fn test_private_message_keeps_delimiters_in_content() {
        let cmd = read_client_command("/private bob|a|b c").unwrap();
        assert_eq!(
            cmd,
            ClientCommand::PrivateMessage {
                receiver: "bob".into(),
                content: "a|b c".into()
            }
        );
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        assert!(matches!(
            read_client_command("/login alice"),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            read_client_command("/private bob|   "),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            read_client_command("/addtogroup team"),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            read_client_command("/dance now"),
            Err(Error::UnknownCommand(t)) if t == "/dance"
        ));
    }

    #[test]
    fn test_logout_alias() {
        assert_eq!(read_client_command("/logout").unwrap(), ClientCommand::Exit);
        assert_eq!(read_client_command("/exit").unwrap(), ClientCommand::Exit);
    }

    #[test]
    fn test_history_commands() {
        assert_eq!(
            read_client_command("/history bob|private").unwrap(),
            ClientCommand::History {
                partner: "bob".into(),
                kind: MessageKind::Private,
                limit: None
            }
        );
        assert_eq!(
            read_client_command("/loadmore team|group|1700000000000|10").unwrap(),
            ClientCommand::LoadMore {
                partner: "team".into(),
                kind: MessageKind::Group,
                before: 1_700_000_000_000,
                limit: Some(10)
            }
        );
        assert!(read_client_command("/history bob|channel").is_err());
        assert!(read_client_command("/loadmore bob|private|yesterday").is_err());
    }

    #[test]
    fn test_file_send_with_and_without_id() {
        assert_eq!(
            read_client_command("/filesend bob|10000||report|v2.pdf").unwrap(),
            ClientCommand::FileSend {
                receiver: "bob".into(),
                file_size: 10000,
                transfer_id: None,
                file_name: "report|v2.pdf".into()
            }
        );
        let cmd = ClientCommand::GroupFileSend {
            group: "team".into(),
            file_size: 5,
            transfer_id: Some("abc".into()),
            file_name: "a.txt".into(),
        };
        assert_eq!(cmd.to_line(), "/groupfilesend team|5|abc|a.txt");
        assert_eq!(read_client_command(&cmd.to_line()).unwrap(), cmd);
        assert!(read_client_command("/filesend bob|big||a.txt").is_err());
    }

    #[test]
    fn test_private_message_response_tags_direction() {
        let sent = ServerResponse::PrivateMessage {
            peer: "bob".into(),
            direction: Direction::Sent,
            timestamp: 42,
            content: "hi|there".into(),
        };
        assert_eq!(sent.to_line(), "/privatemsg bob|SENT|42|hi|there");
        assert_eq!(read_server_response(&sent.to_line()).unwrap(), sent);
    }

    #[test]
    fn test_group_list_encoding() {
        let list = ServerResponse::GroupList {
            groups: vec![
                GroupEntry {
                    name: "team".into(),
                    creator: "alice".into(),
                    members: vec!["alice".into(), "bob".into()],
                },
                GroupEntry {
                    name: "ops".into(),
                    creator: "carol".into(),
                    members: vec!["carol".into()],
                },
            ],
        };
        assert_eq!(list.to_line(), "/grouplist team:alice:alice,bob|ops:carol:carol");
        assert_eq!(read_server_response(&list.to_line()).unwrap(), list);

        let empty = ServerResponse::GroupList { groups: vec![] };
        assert_eq!(empty.to_line(), "/grouplist");
        assert_eq!(read_server_response("/grouplist").unwrap(), empty);
    }

    #[test]
    fn test_leave_reasons_are_distinguishable_on_the_wire() {
        let left = ServerResponse::GroupUserLeft {
            group: "team".into(),
            user: "bob".into(),
            reason: LeaveReason::Left,
        };
        let removed = ServerResponse::GroupUserLeft {
            group: "team".into(),
            user: "bob".into(),
            reason: LeaveReason::Removed,
        };
        assert_ne!(left.to_line(), removed.to_line());
        assert_eq!(read_server_response(&removed.to_line()).unwrap(), removed);
    }

    #[test]
    fn test_login_fail_carries_reason_code() {
        let fail = ServerResponse::LoginFail {
            reason: LoginFailure::AlreadyOnline,
        };
        assert!(fail.to_line().starts_with("/loginfail ALREADY_ONLINE|"));
        assert_eq!(read_server_response(&fail.to_line()).unwrap(), fail);
    }

    #[test]
    fn test_online_users_empty_and_populated() {
        let empty = ServerResponse::OnlineUsers { users: vec![] };
        assert_eq!(empty.to_line(), "/onlineusers");
        let some = ServerResponse::OnlineUsers {
            users: vec!["alice".into(), "bob".into()],
        };
        assert_eq!(some.to_line(), "/onlineusers alice,bob");
        assert_eq!(read_server_response("/onlineusers alice,bob").unwrap(), some);
    }
}
