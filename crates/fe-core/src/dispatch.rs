use tracing::{error, info};

use fe_platform::{ExplorerError, FileExplorer};

use crate::protocol::{
    self, ActionRequest, Reply, ResponseEnvelope, STATUS_BAD_REQUEST, STATUS_SERVER_ERROR,
};

/// Actions that map onto a file explorer call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    List,
    Rename,
    Move,
    Copy,
    Remove,
    CreateFolder,
    ChangePermissions,
}

impl Action {
    /// `None` for unknown names and for the actions that are recognized but
    /// not implemented (`savefile`, `edit`, `compress`, `extract`)
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            protocol::ACTION_LIST => Some(Action::List),
            protocol::ACTION_RENAME => Some(Action::Rename),
            protocol::ACTION_MOVE => Some(Action::Move),
            protocol::ACTION_COPY => Some(Action::Copy),
            protocol::ACTION_REMOVE => Some(Action::Remove),
            protocol::ACTION_CREATE_FOLDER => Some(Action::CreateFolder),
            protocol::ACTION_CHANGE_PERMISSIONS => Some(Action::ChangePermissions),
            _ => None,
        }
    }
}

fn is_known_unimplemented(name: &str) -> bool {
    matches!(
        name,
        protocol::ACTION_SAVE_FILE
            | protocol::ACTION_EDIT
            | protocol::ACTION_COMPRESS
            | protocol::ACTION_EXTRACT
    )
}

/// Run one API request against the session's explorer
pub async fn dispatch(req: &ActionRequest, explorer: &dyn FileExplorer) -> Reply {
    let action = match Action::from_name(&req.action) {
        Some(a) => a,
        None => {
            if is_known_unimplemented(&req.action) {
                info!("action not implemented: {}", req.action);
            } else {
                info!("unsupported action: {:?}", req.action);
            }
            return Reply::not_supported();
        }
    };

    let result = match action {
        Action::List => {
            info!("list: {}", req.path);
            match explorer.list_dir(&req.path).await {
                Ok(entries) => match serde_json::to_value(entries) {
                    Ok(value) => return Reply::ok(ResponseEnvelope::with_result(value)),
                    Err(e) => return Reply::error(STATUS_SERVER_ERROR, e.to_string()),
                },
                Err(e) => Err(e),
            }
        }
        Action::Rename => {
            info!("rename: {} -> {}", req.item, req.new_item_path);
            explorer.rename(&req.item, &req.new_item_path).await
        }
        Action::Move => {
            info!("move: {} item(s) -> {}", req.items.len(), req.new_path);
            explorer.move_items(&req.items, &req.new_path).await
        }
        Action::Copy => {
            info!("copy: {} item(s) -> {}", req.items.len(), req.new_path);
            explorer
                .copy_items(&req.items, &req.new_path, &req.single_filename)
                .await
        }
        Action::Remove => {
            info!("remove: {} item(s)", req.items.len());
            explorer.delete(&req.items).await
        }
        Action::CreateFolder => {
            info!("create folder: {}", req.new_path);
            explorer.mkdir(&req.new_path).await
        }
        Action::ChangePermissions => {
            info!(
                "change permissions: {} item(s) to {} (recursive={})",
                req.items.len(),
                req.perms_code,
                req.recursive
            );
            explorer
                .chmod(&req.items, &req.perms_code, req.recursive)
                .await
        }
    };

    match result {
        Ok(()) => Reply::ok(ResponseEnvelope::success("")),
        Err(e) => error_reply(&req.action, e),
    }
}

/// Connection-level failures map to 500, everything else to 400
pub fn error_reply(action: &str, err: ExplorerError) -> Reply {
    if err.is_connection_failure() {
        error!("{} failed, backend unusable: {}", action, err);
        Reply::connection_lost(err.to_string())
    } else {
        info!("{} failed: {}", action, err);
        Reply::error(STATUS_BAD_REQUEST, err.to_string())
    }
}
