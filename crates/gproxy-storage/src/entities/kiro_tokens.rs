use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One row per credential, storing the last refresh token Kiro handed back so
/// concurrent refreshers can detect they're racing on a token someone else
/// already rotated away (`Storage::kiro_check_refresh_token_exists`).
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "kiro_tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "kiro_token_credential")]
    pub credential_id: i64,
    pub refresh_token: String,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "credential_id", to = "id", on_delete = "Cascade")]
    pub credential: HasOne<super::credentials::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
