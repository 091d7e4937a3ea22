use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configured payment route (one per gateway integration) with its fee
/// policy and amount bounds.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_methods")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub code: String,

    pub name: String,

    /// Gateway adapter code this method routes through
    pub gateway: String,

    pub is_active: bool,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub min_amount: Decimal,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub max_amount: Option<Decimal>,

    pub fee_type: FeeType,

    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub fee_amount: Decimal,

    #[sea_orm(column_type = "Decimal(Some((5, 4)))")]
    pub fee_percentage: Decimal,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::payment::Entity")]
    Payments,
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Fee charged for processing `amount` through this method.
    pub fn calculate_fee(&self, amount: Decimal) -> Decimal {
        match self.fee_type {
            FeeType::Fixed => self.fee_amount,
            FeeType::Percentage => amount * self.fee_percentage,
            FeeType::Both => self.fee_amount + amount * self.fee_percentage,
        }
    }

    pub fn accepts_amount(&self, amount: Decimal) -> bool {
        if amount < self.min_amount {
            return false;
        }
        match self.max_amount {
            Some(max) => amount <= max,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum FeeType {
    #[sea_orm(string_value = "fixed")]
    Fixed,
    #[sea_orm(string_value = "percentage")]
    Percentage,
    #[sea_orm(string_value = "both")]
    Both,
}
