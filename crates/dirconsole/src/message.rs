// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

use crate::error::ConnectionId;
use std::fmt;

/// Out-of-band signal carried in the length field of a frame.
///
/// The wire value is the negative length the director sends in place of a
/// byte count. Values outside this set are protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCode {
    /// End of a logical command's output
    Eod,
    /// Peer is closing the conversation
    HardEof,
    StartSelect,
    EndSelect,
    CmdFailed,
    CmdOk,
    CmdBegin,
    /// Director has queued messages for `.messages`
    MsgsPending,
    MainPrompt,
    WarningMsg,
    ErrorMsg,
    InfoMsg,
    RunCmd,
    YesNo,
    StartRtree,
    EndRtree,
    SubPrompt,
    TextInput,
}

impl ControlCode {
    pub const ALL: [ControlCode; 18] = [
        ControlCode::Eod,
        ControlCode::HardEof,
        ControlCode::StartSelect,
        ControlCode::EndSelect,
        ControlCode::CmdFailed,
        ControlCode::CmdOk,
        ControlCode::CmdBegin,
        ControlCode::MsgsPending,
        ControlCode::MainPrompt,
        ControlCode::WarningMsg,
        ControlCode::ErrorMsg,
        ControlCode::InfoMsg,
        ControlCode::RunCmd,
        ControlCode::YesNo,
        ControlCode::StartRtree,
        ControlCode::EndRtree,
        ControlCode::SubPrompt,
        ControlCode::TextInput,
    ];

    pub const fn wire_value(self) -> i32 {
        match self {
            ControlCode::Eod => -1,
            ControlCode::HardEof => -4,
            ControlCode::StartSelect => -11,
            ControlCode::EndSelect => -12,
            ControlCode::CmdFailed => -14,
            ControlCode::CmdOk => -15,
            ControlCode::CmdBegin => -16,
            ControlCode::MsgsPending => -17,
            ControlCode::MainPrompt => -18,
            ControlCode::WarningMsg => -20,
            ControlCode::ErrorMsg => -21,
            ControlCode::InfoMsg => -22,
            ControlCode::RunCmd => -23,
            ControlCode::YesNo => -24,
            ControlCode::StartRtree => -25,
            ControlCode::EndRtree => -26,
            ControlCode::SubPrompt => -27,
            ControlCode::TextInput => -28,
        }
    }

    pub fn from_wire(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.wire_value() == value)
    }

    /// Severity of the message carried by the next Text frame, for the
    /// three message-announcing codes
    pub fn severity(self) -> Option<Severity> {
        match self {
            ControlCode::ErrorMsg => Some(Severity::Error),
            ControlCode::WarningMsg => Some(Severity::Warning),
            ControlCode::InfoMsg => Some(Severity::Info),
            _ => None,
        }
    }

    /// Interactive dialog requested by this code, if any
    pub fn dialog_kind(self) -> Option<DialogKind> {
        match self {
            ControlCode::StartSelect => Some(DialogKind::Select),
            ControlCode::YesNo => Some(DialogKind::YesNo),
            ControlCode::TextInput => Some(DialogKind::TextInput),
            ControlCode::RunCmd => Some(DialogKind::RunCommand),
            ControlCode::StartRtree => Some(DialogKind::RestoreTree),
            _ => None,
        }
    }

    pub fn is_prompt(self) -> bool {
        matches!(self, ControlCode::MainPrompt | ControlCode::SubPrompt)
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlCode::Eod => "EOD",
            ControlCode::HardEof => "HARDEOF",
            ControlCode::StartSelect => "START_SELECT",
            ControlCode::EndSelect => "END_SELECT",
            ControlCode::CmdFailed => "CMD_FAILED",
            ControlCode::CmdOk => "CMD_OK",
            ControlCode::CmdBegin => "CMD_BEGIN",
            ControlCode::MsgsPending => "MSGS_PENDING",
            ControlCode::MainPrompt => "MAIN_PROMPT",
            ControlCode::WarningMsg => "WARNING_MSG",
            ControlCode::ErrorMsg => "ERROR_MSG",
            ControlCode::InfoMsg => "INFO_MSG",
            ControlCode::RunCmd => "RUN_CMD",
            ControlCode::YesNo => "YESNO",
            ControlCode::StartRtree => "START_RTREE",
            ControlCode::EndRtree => "END_RTREE",
            ControlCode::SubPrompt => "SUB_PROMPT",
            ControlCode::TextInput => "TEXT_INPUT",
        };
        f.write_str(name)
    }
}

/// One decoded unit of the wire protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Control(ControlCode),
}

impl Frame {
    pub fn text(content: impl Into<String>) -> Self {
        Frame::Text(content.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Control(_) => None,
        }
    }

    pub fn control(&self) -> Option<ControlCode> {
        match self {
            Frame::Control(code) => Some(*code),
            Frame::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogKind {
    /// Numbered choice from the list that follows
    Select,
    YesNo,
    /// One line of free text
    TextInput,
    /// Fully specified job-run template awaiting confirmation
    RunCommand,
    /// Interactive restore-tree sub-session
    RestoreTree,
}

/// A server-initiated interactive request, handed to the registered handler
/// and then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDialog {
    pub conn: ConnectionId,
    pub kind: DialogKind,
    /// Text the director sent between the dialog code and its prompt
    /// (list items, the question, the run template).
    pub body: Vec<String>,
}

/// Result of `Session::write`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Sent(usize),
    /// A consecutive blank line that was not transmitted
    Discarded,
}

impl WriteOutcome {
    pub fn was_sent(self) -> bool {
        matches!(self, WriteOutcome::Sent(_))
    }
}
