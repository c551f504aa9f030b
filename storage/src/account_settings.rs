use deadpool_sqlite::Pool;
use kecs_types::error::entities;
use kecs_types::settings::AccountSetting;
use kecs_types::{Error, Result};
use rusqlite::{OptionalExtension, params};

use crate::{db_err, run};

#[derive(Clone)]
pub struct AccountSettingStore {
    pool: Pool,
}

impl AccountSettingStore {
    pub(crate) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn put(&self, setting: AccountSetting) -> Result<AccountSetting> {
        run(&self.pool, move |conn| {
            conn.prepare_cached(
                "INSERT INTO account_settings (id, principal_arn, name, value) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (principal_arn, name) DO UPDATE SET value = excluded.value",
            )
            .map_err(db_err)?
            .execute(params![
                uuid::Uuid::new_v4().to_string(),
                setting.principal_arn,
                setting.name,
                setting.value,
            ])
            .map_err(db_err)?;
            Ok(setting)
        })
        .await
    }

    pub async fn get(&self, principal_arn: &str, name: &str) -> Result<AccountSetting> {
        let principal = principal_arn.to_string();
        let name = name.to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(
                "SELECT principal_arn, name, value FROM account_settings \
                 WHERE principal_arn = ?1 AND name = ?2",
            )
            .map_err(db_err)?
            .query_row(params![principal, name], |row| {
                Ok(AccountSetting {
                    principal_arn: row.get(0)?,
                    name: row.get(1)?,
                    value: row.get(2)?,
                })
            })
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found(entities::ACCOUNT_SETTING, &name))
        })
        .await
    }

    pub async fn list(&self, principal_arn: Option<String>) -> Result<Vec<AccountSetting>> {
        run(&self.pool, move |conn| {
            let principal = principal_arn.unwrap_or_else(|| "%".to_string());
            let mut stmt = conn
                .prepare_cached(
                    "SELECT principal_arn, name, value FROM account_settings \
                     WHERE principal_arn LIKE ?1 ORDER BY rowid",
                )
                .map_err(db_err)?;
            let mut rows = stmt.query(params![principal]).map_err(db_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                out.push(AccountSetting {
                    principal_arn: row.get(0).map_err(db_err)?,
                    name: row.get(1).map_err(db_err)?,
                    value: row.get(2).map_err(db_err)?,
                });
            }
            Ok(out)
        })
        .await
    }

    pub async fn delete(&self, principal_arn: &str, name: &str) -> Result<()> {
        let principal = principal_arn.to_string();
        let name = name.to_string();
        run(&self.pool, move |conn| {
            let changed = conn
                .prepare_cached(
                    "DELETE FROM account_settings WHERE principal_arn = ?1 AND name = ?2",
                )
                .map_err(db_err)?
                .execute(params![principal, name])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::not_found(entities::ACCOUNT_SETTING, &name));
            }
            Ok(())
        })
        .await
    }
}
