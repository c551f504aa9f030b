use kecs_types::Error;
use kecs_types::settings::AccountSetting;

use super::models::*;
use crate::state::AppState;

fn principal(state: &AppState, requested: Option<String>) -> String {
    requested
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| format!("arn:aws:iam::{}:root", state.account_id))
}

pub async fn put(
    state: &AppState,
    req: PutAccountSettingRequest,
) -> Result<AccountSettingResponse, Error> {
    if req.name.is_empty() {
        return Err(Error::invalid("setting name must not be empty"));
    }
    let setting = AccountSetting {
        name: req.name,
        value: req.value,
        principal_arn: principal(state, req.principal_arn),
    };
    let stored = state.db.account_settings().put(setting).await?;
    Ok(AccountSettingResponse { setting: stored })
}

pub async fn list(
    state: &AppState,
    req: ListAccountSettingsRequest,
) -> Result<ListAccountSettingsResponse, Error> {
    let mut settings = state.db.account_settings().list(req.principal_arn).await?;
    if let Some(name) = req.name {
        settings.retain(|s| s.name == name);
    }
    Ok(ListAccountSettingsResponse { settings })
}

pub async fn delete(
    state: &AppState,
    req: DeleteAccountSettingRequest,
) -> Result<AccountSettingResponse, Error> {
    let principal_arn = principal(state, req.principal_arn);
    let existing = state
        .db
        .account_settings()
        .get(&principal_arn, &req.name)
        .await?;
    state
        .db
        .account_settings()
        .delete(&principal_arn, &req.name)
        .await?;
    Ok(AccountSettingResponse { setting: existing })
}

#[cfg(test)]
mod tests {
    use crate::api::router;
    use crate::api::tests::{call, test_state};

    #[tokio::test]
    async fn put_overwrites_and_list_filters() {
        let (_dir, state) = test_state().await;
        let app = router(state);

        call(
            &app,
            "PutAccountSetting",
            serde_json::json!({"name": "containerInsights", "value": "disabled"}),
        )
        .await;
        let (_, body) = call(
            &app,
            "PutAccountSetting",
            serde_json::json!({"name": "containerInsights", "value": "enabled"}),
        )
        .await;
        assert_eq!(body["setting"]["value"], "enabled");

        let (_, listed) = call(
            &app,
            "ListAccountSettings",
            serde_json::json!({"name": "containerInsights"}),
        )
        .await;
        assert_eq!(listed["settings"].as_array().unwrap().len(), 1);

        let (_, deleted) = call(
            &app,
            "DeleteAccountSetting",
            serde_json::json!({"name": "containerInsights"}),
        )
        .await;
        assert_eq!(deleted["setting"]["name"], "containerInsights");

        let (status, body) = call(
            &app,
            "DeleteAccountSetting",
            serde_json::json!({"name": "containerInsights"}),
        )
        .await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(body["__type"], "ClientException");
    }
}
