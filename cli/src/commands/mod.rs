mod activity;
mod auth;
mod backup;
mod helpers;
mod log;
mod meal;
mod product;
mod report;
mod summary;
mod sync;
mod target;
mod template;
mod weight;

use anyhow::Result;

use nutrilog_core::db::Database;
use nutrilog_core::models::Product;
use nutrilog_core::service::{ProductLookupProvider, search_and_cache};

use helpers::choose_product;

pub(crate) use activity::{ActivityInput, cmd_activity_set, cmd_activity_show};
pub(crate) use auth::{cmd_auth_login, cmd_auth_logout, cmd_auth_status};
pub(crate) use backup::{cmd_backup_export, cmd_backup_import};
pub(crate) use log::{cmd_barcode, cmd_log, cmd_quick};
pub(crate) use meal::{cmd_copy, cmd_delete, cmd_update};
pub(crate) use product::{
    cmd_portion_add, cmd_portions, cmd_product_add, cmd_product_list, cmd_search,
};
pub(crate) use report::{cmd_report_monthly, cmd_report_weekly};
pub(crate) use summary::{cmd_history, cmd_summary};
pub(crate) use sync::{
    SyncContext, apply_event, cmd_sync_auto, cmd_sync_now, cmd_sync_passphrase, cmd_sync_pull, cmd_sync_push,
    cmd_sync_status, sync_after_change,
};
pub(crate) use target::{TargetInput, cmd_target_clear, cmd_target_set, cmd_target_show};
pub(crate) use template::{cmd_template_apply, cmd_template_list, cmd_template_save};
pub(crate) use weight::{cmd_weight_delete, cmd_weight_history, cmd_weight_log, cmd_weight_show};

/// Resolve a product name, searching the local database and then `OpenFoodFacts`.
/// Prompts when several products match.
pub(super) async fn resolve_product(
    db: &Database,
    provider: &dyn ProductLookupProvider,
    query: &str,
) -> Result<Option<Product>> {
    let all = search_and_cache(db, provider, query).await?;
    choose_product(all)
}
