use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Sellable product. For products without variants this row is the
/// inventory record itself: `stock_quantity` is mutated only by the order
/// transaction (decrement) and the cancel/refund/payment-failure paths
/// (increment), never by cart or browsing operations.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize, Validate)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub vendor_id: Uuid,

    #[validate(length(
        min = 1,
        max = 500,
        message = "Product name must be between 1 and 500 characters"
    ))]
    pub name: String,

    #[validate(length(min = 1, max = 100, message = "SKU must be between 1 and 100 characters"))]
    pub sku: String,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub price: Decimal,

    pub currency: String,

    /// Vendor commission rate snapshot source, e.g. 0.15
    #[sea_orm(column_type = "Decimal(Some((5, 4)))")]
    pub commission_rate: Decimal,

    /// Available units. Guarded by a database CHECK (>= 0) in addition to
    /// the application-level validation.
    pub stock_quantity: i32,

    /// When false the quantity is neither checked nor decremented.
    pub track_inventory: bool,

    /// When true an insufficient quantity does not block the sale.
    pub allow_backorder: bool,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::product_variant::Entity")]
    Variants,
}

impl Related<super::product_variant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Variants.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
