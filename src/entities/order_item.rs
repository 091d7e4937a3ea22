use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable snapshot of one purchased line: product name, SKU, price and
/// vendor commission exactly as they were at the moment of purchase.
/// Never recalculated from live catalog data.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub order_id: Uuid,
    pub vendor_id: Uuid,
    pub product_id: Uuid,

    #[sea_orm(nullable)]
    pub variant_id: Option<Uuid>,

    pub product_name: String,
    pub product_sku: String,

    #[sea_orm(nullable)]
    pub variant_name: Option<String>,

    pub quantity: i32,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub unit_price: Decimal,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_price: Decimal,

    #[sea_orm(column_type = "Decimal(Some((5, 4)))")]
    pub commission_rate: Decimal,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub commission_amount: Decimal,

    /// What the vendor is owed for this line after commission.
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub vendor_amount: Decimal,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
