//! The built-in drive document model.
//!
//! A drive is a document of type [`DRIVE_DOCUMENT_TYPE`] acting as a
//! container for other documents. Its global scope holds the shared node
//! tree, its local scope holds this reactor's sync configuration: listeners
//! (inbound push targets), triggers (outbound pull targets) and the sharing
//! type. Everything else the engine knows about documents arrives through
//! the model registry; this is the one model the core ships.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{
    new_document_id, Document, DocumentState, Scope, DRIVE_DOCUMENT_TYPE,
};
use crate::error::ReducerError;
use crate::registry::{Action, DocumentModel, Reduced};

pub const ADD_FILE: &str = "ADD_FILE";
pub const REMOVE_FILE: &str = "REMOVE_FILE";
pub const ADD_LISTENER: &str = "ADD_LISTENER";
pub const REMOVE_LISTENER: &str = "REMOVE_LISTENER";
pub const ADD_TRIGGER: &str = "ADD_TRIGGER";
pub const REMOVE_TRIGGER: &str = "REMOVE_TRIGGER";
pub const SET_SHARING_TYPE: &str = "SET_SHARING_TYPE";
pub const SET_DRIVE_NAME: &str = "SET_DRIVE_NAME";

/// A document referenced by a drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub id: String,
    pub name: String,
    pub document_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_folder: Option<String>,
}

/// Scope/branch/document-type filter for listeners and triggers. A `*`
/// entry (or an empty list) matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListenerFilter {
    #[serde(default)]
    pub document_id: Vec<String>,
    #[serde(default)]
    pub document_type: Vec<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub branch: Vec<String>,
}

impl ListenerFilter {
    /// Matches everything.
    pub fn any() -> Self {
        Self::default()
    }

    fn part_matches(part: &[String], value: &str) -> bool {
        part.is_empty() || part.iter().any(|p| p == "*" || p == value)
    }

    pub fn matches(&self, document_id: &str, document_type: &str, scope: &str, branch: &str) -> bool {
        Self::part_matches(&self.document_id, document_id)
            && Self::part_matches(&self.document_type, document_type)
            && Self::part_matches(&self.scope, scope)
            && Self::part_matches(&self.branch, branch)
    }
}

/// An inbound push target: committed operations matching the filter are
/// forwarded to this remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub filter: ListenerFilter,
    #[serde(default)]
    pub block: bool,
    pub call_info: CallInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    pub transmitter: TransmitterKind,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TransmitterKind {
    /// Remote pulls from us; we only track its delivery cursor.
    PullResponder,
    /// We push to the remote after every local commit.
    Push,
}

/// An outbound pull target: this reactor polls the remote on an interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub filter: ListenerFilter,
    pub data: TriggerData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerData {
    pub url: String,
    /// Poll interval in milliseconds.
    pub interval_ms: u64,
    /// Listener id registered on the remote; refreshed when the remote
    /// forgets us.
    #[serde(default)]
    pub listener_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SharingType {
    #[default]
    Local,
    Public,
}

/// Global (shared) drive state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DriveState {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub nodes: Vec<FileNode>,
}

/// Local (never synchronized) drive state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DriveLocalState {
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub sharing_type: SharingType,
}

/// Typed view over a drive document's state.
pub fn drive_state(document: &Document) -> Result<DriveState, ReducerError> {
    parse_state(document.state.get(Scope::Global))
}

pub fn drive_local_state(document: &Document) -> Result<DriveLocalState, ReducerError> {
    parse_state(document.state.get(Scope::Local))
}

fn parse_state<T: Default + for<'de> Deserialize<'de>>(value: &Value) -> Result<T, ReducerError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|e| ReducerError::Other(e.into()))
}

fn to_value<T: Serialize>(state: &T) -> Result<Value, ReducerError> {
    serde_json::to_value(state).map_err(|e| ReducerError::Other(e.into()))
}

fn input<T: for<'de> Deserialize<'de>>(action: &Action) -> Result<T, ReducerError> {
    serde_json::from_value(action.input.clone()).map_err(|e| ReducerError::InvalidInput {
        action: action.action_type.clone(),
        message: e.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct AddFileInput {
    id: String,
    name: String,
    document_type: String,
    #[serde(default)]
    parent_folder: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdInput {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SetSharingTypeInput {
    #[serde(rename = "type")]
    sharing_type: SharingType,
}

#[derive(Debug, Deserialize)]
struct SetDriveNameInput {
    name: String,
}

/// The drive reducer. Pure; a plain match over the drive actions.
#[derive(Debug, Default, Clone, Copy)]
pub struct DriveModel;

impl DocumentModel for DriveModel {
    fn document_type(&self) -> &str {
        DRIVE_DOCUMENT_TYPE
    }

    fn initial_state(&self) -> DocumentState {
        DocumentState {
            global: serde_json::to_value(DriveState::default()).expect("static state serializes"),
            local: serde_json::to_value(DriveLocalState::default())
                .expect("static state serializes"),
        }
    }

    fn reduce(&self, document: &Document, action: &Action) -> Result<Reduced, ReducerError> {
        match action.scope {
            Scope::Global => {
                let mut state: DriveState = parse_state(document.state.get(Scope::Global))?;
                match action.action_type.as_str() {
                    ADD_FILE => {
                        let file: AddFileInput = input(action)?;
                        if state.nodes.iter().any(|n| n.id == file.id) {
                            return Err(ReducerError::InvalidInput {
                                action: ADD_FILE.into(),
                                message: format!("node {} already exists", file.id),
                            });
                        }
                        state.nodes.push(FileNode {
                            id: file.id,
                            name: file.name,
                            document_type: file.document_type,
                            parent_folder: file.parent_folder,
                        });
                    }
                    REMOVE_FILE => {
                        let IdInput { id } = input(action)?;
                        state.nodes.retain(|n| n.id != id);
                    }
                    SET_DRIVE_NAME => {
                        let SetDriveNameInput { name } = input(action)?;
                        state.name = name;
                    }
                    other => return Err(ReducerError::UnknownAction(other.to_string())),
                }
                Ok(Reduced {
                    state: to_value(&state)?,
                })
            }
            Scope::Local => {
                let mut state: DriveLocalState = parse_state(document.state.get(Scope::Local))?;
                match action.action_type.as_str() {
                    ADD_LISTENER => {
                        let listener: Listener = input(action)?;
                        state.listeners.retain(|l| l.id != listener.id);
                        state.listeners.push(listener);
                    }
                    REMOVE_LISTENER => {
                        let IdInput { id } = input(action)?;
                        state.listeners.retain(|l| l.id != id);
                    }
                    ADD_TRIGGER => {
                        let trigger: Trigger = input(action)?;
                        state.triggers.retain(|t| t.id != trigger.id);
                        state.triggers.push(trigger);
                    }
                    REMOVE_TRIGGER => {
                        let IdInput { id } = input(action)?;
                        state.triggers.retain(|t| t.id != id);
                    }
                    SET_SHARING_TYPE => {
                        let SetSharingTypeInput { sharing_type } = input(action)?;
                        state.sharing_type = sharing_type;
                    }
                    other => return Err(ReducerError::UnknownAction(other.to_string())),
                }
                Ok(Reduced {
                    state: to_value(&state)?,
                })
            }
        }
    }
}

/// Action constructors, mirroring the reducer's inputs.
pub mod actions {
    use super::*;

    pub fn add_file(id: &str, name: &str, document_type: &str) -> Action {
        Action::global(
            ADD_FILE,
            serde_json::json!({
                "id": id,
                "name": name,
                "document_type": document_type,
            }),
        )
    }

    pub fn remove_file(id: &str) -> Action {
        Action::global(REMOVE_FILE, serde_json::json!({ "id": id }))
    }

    pub fn set_drive_name(name: &str) -> Action {
        Action::global(SET_DRIVE_NAME, serde_json::json!({ "name": name }))
    }

    pub fn add_listener(listener: &Listener) -> Action {
        Action::local(
            ADD_LISTENER,
            serde_json::to_value(listener).expect("listener serializes"),
        )
    }

    pub fn remove_listener(id: &str) -> Action {
        Action::local(REMOVE_LISTENER, serde_json::json!({ "id": id }))
    }

    pub fn add_trigger(trigger: &Trigger) -> Action {
        Action::local(
            ADD_TRIGGER,
            serde_json::to_value(trigger).expect("trigger serializes"),
        )
    }

    pub fn remove_trigger(id: &str) -> Action {
        Action::local(REMOVE_TRIGGER, serde_json::json!({ "id": id }))
    }

    pub fn set_sharing_type(sharing_type: SharingType) -> Action {
        Action::local(SET_SHARING_TYPE, serde_json::json!({ "type": sharing_type }))
    }
}

/// A push listener with a fresh id.
pub fn new_push_listener(url: &str, filter: ListenerFilter) -> Listener {
    Listener {
        id: new_document_id(),
        label: String::new(),
        filter,
        block: false,
        call_info: CallInfo {
            transmitter: TransmitterKind::Push,
            url: url.to_string(),
        },
    }
}

/// A pull trigger with a fresh id.
pub fn new_pull_trigger(url: &str, interval_ms: u64, listener_id: &str) -> Trigger {
    Trigger {
        id: new_document_id(),
        filter: ListenerFilter::any(),
        data: TriggerData {
            url: url.to_string(),
            interval_ms,
            listener_id: listener_id.to_string(),
        },
    }
}
