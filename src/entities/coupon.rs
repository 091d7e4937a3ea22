use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Promo code. `times_used` is maintained with an atomic, guarded
/// `UPDATE … SET times_used = times_used + 1` so concurrent redemptions
/// of the same code cannot race past the global limit; the per-user limit
/// is authoritative in `coupon_usage`, not here.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "coupons")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub code: String,

    pub name: String,

    pub discount_type: DiscountType,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_value: Decimal,

    /// Cap for percentage coupons
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub max_discount: Option<Decimal>,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub min_order_amount: Decimal,

    #[sea_orm(nullable)]
    pub usage_limit: Option<i32>,

    #[sea_orm(nullable)]
    pub usage_limit_per_user: Option<i32>,

    pub times_used: i32,

    pub starts_at: DateTime<Utc>,

    #[sea_orm(nullable)]
    pub expires_at: Option<DateTime<Utc>>,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::coupon_usage::Entity")]
    Usages,
}

impl Related<super::coupon_usage::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Usages.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum DiscountType {
    #[sea_orm(string_value = "percentage")]
    Percentage,
    #[sea_orm(string_value = "fixed")]
    Fixed,
    /// No subtotal discount; waives the shipping fee instead.
    #[sea_orm(string_value = "free_shipping")]
    FreeShipping,
}
