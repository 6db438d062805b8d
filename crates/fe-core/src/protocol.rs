use serde::{Deserialize, Serialize};

/// Message of the fixed failure envelope for unimplemented actions
pub const NOT_SUPPORTED: &str = "Not Supported";

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_SERVER_ERROR: u16 = 500;

// --- Action names ---

pub const ACTION_LIST: &str = "list";
pub const ACTION_RENAME: &str = "rename";
pub const ACTION_MOVE: &str = "move";
pub const ACTION_COPY: &str = "copy";
pub const ACTION_REMOVE: &str = "remove";
pub const ACTION_CREATE_FOLDER: &str = "createFolder";
pub const ACTION_CHANGE_PERMISSIONS: &str = "changePermissions";
pub const ACTION_SAVE_FILE: &str = "savefile";
pub const ACTION_EDIT: &str = "edit";
pub const ACTION_COMPRESS: &str = "compress";
pub const ACTION_EXTRACT: &str = "extract";

/// Body of an API call. Only the fields the action needs are read; the rest
/// default to empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionRequest {
    pub action: String,
    pub path: String,
    /// Source of `rename`
    pub item: String,
    pub items: Vec<String>,
    pub new_path: String,
    pub new_item_path: String,
    pub single_filename: String,
    pub perms_code: String,
    pub recursive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl ResponseEnvelope {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            result: None,
        }
    }

    pub fn with_result(result: serde_json::Value) -> Self {
        Self {
            success: true,
            message: String::new(),
            result: Some(result),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            result: None,
        }
    }
}

/// Envelope plus the HTTP status it should be sent with
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: ResponseEnvelope,
    /// Set only when the explorer itself is unusable
    pub connection_lost: bool,
}

impl Reply {
    pub fn ok(body: ResponseEnvelope) -> Self {
        Self {
            status: STATUS_OK,
            body,
            connection_lost: false,
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ResponseEnvelope::failure(message),
            connection_lost: false,
        }
    }

    /// 500 reply that also tells the caller to drop the session
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self {
            connection_lost: true,
            ..Self::error(STATUS_SERVER_ERROR, message)
        }
    }

    pub fn not_supported() -> Self {
        Self::ok(ResponseEnvelope::failure(NOT_SUPPORTED))
    }

    /// The explorer behind this reply is unusable and its session should go
    pub fn is_connection_failure(&self) -> bool {
        self.connection_lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_missing_fields_default() {
        let req: ActionRequest =
            serde_json::from_str(r#"{"action":"list","path":"/home"}"#).unwrap();
        assert_eq!(req.action, ACTION_LIST);
        assert_eq!(req.path, "/home");
        assert!(req.items.is_empty());
        assert!(!req.recursive);
    }

    #[test]
    fn test_request_camel_case_fields() {
        let req: ActionRequest = serde_json::from_str(
            r#"{"action":"changePermissions","items":["/a","/b"],"permsCode":"755","recursive":true,
                "newPath":"/dst","newItemPath":"/n","singleFilename":"f","item":"/i"}"#,
        )
        .unwrap();
        assert_eq!(req.items, vec!["/a", "/b"]);
        assert_eq!(req.perms_code, "755");
        assert!(req.recursive);
        assert_eq!(req.new_path, "/dst");
        assert_eq!(req.new_item_path, "/n");
        assert_eq!(req.single_filename, "f");
        assert_eq!(req.item, "/i");
    }

    #[test]
    fn test_envelope_omits_empty_result() {
        let json = serde_json::to_value(ResponseEnvelope::failure(NOT_SUPPORTED)).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "message": "Not Supported"}));
    }

    #[test]
    fn test_not_supported_is_not_a_connection_failure() {
        let reply = Reply::not_supported();
        assert_eq!(reply.status, STATUS_OK);
        assert!(!reply.is_connection_failure());
        assert!(!Reply::error(STATUS_SERVER_ERROR, "encode failed").is_connection_failure());
        let lost = Reply::connection_lost("down");
        assert_eq!(lost.status, STATUS_SERVER_ERROR);
        assert!(lost.is_connection_failure());
    }
}
