use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "credentials")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider_id: i64,
    pub name: Option<String>,
    pub settings: Option<Json>,
    pub secret: Json,
    pub enabled: bool,
    /// Selection-time usage increments flushed from `CredentialPool`'s usage batch task.
    pub usage_count: Option<i64>,
    /// Upstream failures attributed to this credential via `decide_unavailable`.
    pub error_count: Option<i64>,
    /// Last `update_health_status` verdict; `None` is treated as healthy.
    pub is_healthy: Option<bool>,
    /// Exclusive lock held while a token refresh is in flight, released on
    /// completion or once this deadline passes.
    pub token_lock_until: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
