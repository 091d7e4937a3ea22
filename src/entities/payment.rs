use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One payment attempt against an order. `transaction_id` is the
/// correlation key for gateway webhooks and reconciliation queries. An
/// order may accumulate several failed attempts but at most one row ever
/// reaches `completed`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub transaction_id: String,

    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub payment_method_id: Uuid,

    /// Gateway code the attempt was routed to (vnpay, momo, zalopay, cod)
    pub gateway: String,

    pub currency: String,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub amount: Decimal,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub fee: Decimal,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub net_amount: Decimal,

    pub status: PaymentStatus,

    #[sea_orm(nullable)]
    pub gateway_transaction_id: Option<String>,

    /// Raw gateway payload kept for audit/replay.
    #[sea_orm(column_type = "Json", nullable)]
    pub gateway_response: Option<Json>,

    #[sea_orm(nullable)]
    pub failure_reason: Option<String>,

    #[sea_orm(nullable)]
    pub paid_at: Option<DateTime<Utc>>,

    #[sea_orm(nullable)]
    pub expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
    #[sea_orm(
        belongs_to = "super::payment_method::Entity",
        from = "Column::PaymentMethodId",
        to = "super::payment_method::Column::Id"
    )]
    PaymentMethod,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl Related<super::payment_method::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PaymentMethod.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(30))")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "partially_refunded")]
    PartiallyRefunded,
}

impl PaymentStatus {
    /// Webhooks, the reconciler and the expiry sweep may only move a
    /// payment that is still in flight; redelivered notifications against
    /// a settled payment are no-ops.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}
