//
// jupyter_messages.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use jupshared::jupyter_message::JupyterMessage;
use serde::Deserialize;

/// The message types the correlator knows how to handle, decoded from the
/// loosely-typed envelope. Unknown types become `Unrecognized` so the
/// correlator's dispatch stays exhaustive instead of silently ignoring them.
pub enum JupyterMsg {
    Status(JupyterStatus),
    Stream(JupyterStream),
    ExecuteInput,
    ExecuteResult(JupyterDisplayData),
    DisplayData(JupyterDisplayData),
    Error(JupyterError),
    ExecuteReply(JupyterExecuteReply),
    InputRequest,
    Unrecognized(String),
}

/// Convert a JupyterMessage (generic envelope) into a JupyterMsg (specific type)
impl From<&JupyterMessage> for JupyterMsg {
    fn from(msg: &JupyterMessage) -> Self {
        let msg_type = msg.header.msg_type.as_str();
        match msg_type {
            "status" => match serde_json::from_value::<JupyterStatus>(msg.content.clone()) {
                Ok(content) => JupyterMsg::Status(content),
                Err(_) => JupyterMsg::Unrecognized(msg_type.to_string()),
            },
            "stream" => match serde_json::from_value::<JupyterStream>(msg.content.clone()) {
                Ok(content) => JupyterMsg::Stream(content),
                Err(_) => JupyterMsg::Unrecognized(msg_type.to_string()),
            },
            "execute_input" => JupyterMsg::ExecuteInput,
            "execute_result" => {
                match serde_json::from_value::<JupyterDisplayData>(msg.content.clone()) {
                    Ok(content) => JupyterMsg::ExecuteResult(content),
                    Err(_) => JupyterMsg::Unrecognized(msg_type.to_string()),
                }
            }
            "display_data" => {
                match serde_json::from_value::<JupyterDisplayData>(msg.content.clone()) {
                    Ok(content) => JupyterMsg::DisplayData(content),
                    Err(_) => JupyterMsg::Unrecognized(msg_type.to_string()),
                }
            }
            "error" => match serde_json::from_value::<JupyterError>(msg.content.clone()) {
                Ok(content) => JupyterMsg::Error(content),
                Err(_) => JupyterMsg::Unrecognized(msg_type.to_string()),
            },
            "execute_reply" => {
                match serde_json::from_value::<JupyterExecuteReply>(msg.content.clone()) {
                    Ok(content) => JupyterMsg::ExecuteReply(content),
                    Err(_) => JupyterMsg::Unrecognized(msg_type.to_string()),
                }
            }
            "input_request" => JupyterMsg::InputRequest,
            _ => JupyterMsg::Unrecognized(msg_type.to_string()),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Busy,
    Idle,
    Starting,
}

/// Content of a `status` broadcast.
#[derive(Deserialize, Debug)]
pub struct JupyterStatus {
    pub execution_state: ExecutionState,
}

/// Content of a `stream` broadcast (kernel stdout/stderr).
#[derive(Deserialize, Debug)]
pub struct JupyterStream {
    pub name: StreamName,
    pub text: String,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Content of an `execute_result` or `display_data` broadcast: a mime-type to
/// value map.
#[derive(Deserialize, Debug)]
pub struct JupyterDisplayData {
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Content of an `error` broadcast.
#[derive(Deserialize, Debug, Clone)]
pub struct JupyterError {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Content of an `execute_reply` on the shell channel.
#[derive(Deserialize, Debug)]
pub struct JupyterExecuteReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub execution_count: Option<i64>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}
